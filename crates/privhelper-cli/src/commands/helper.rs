//! `privhelper version` and `privhelper exec`: requests to the running helper.

use anyhow::{Context, Result};
use privhelper_core::HelperConfig;
use privhelper_daemon::{ChannelClient, ClientConfig};
use serde::Serialize;

use super::{Output, exit_codes, runtime};

/// Reply to `version`.
#[derive(Debug, Serialize)]
pub struct VersionOutput {
    /// Helper name from the handshake.
    pub server: String,
    /// Version reported by `GetVersion`.
    pub version: String,
}

/// Reply to `exec`.
#[derive(Debug, Serialize)]
pub struct ExecOutput {
    /// Whether the helper reported success.
    pub success: bool,
    /// Helper-provided detail.
    pub detail: String,
}

async fn connect(config: &HelperConfig) -> Result<ChannelClient> {
    let identity = config
        .service_identity()
        .context("failed to determine helper identity")?;
    ChannelClient::connect(&identity, &ClientConfig::from(config))
        .await
        .with_context(|| format!("failed to connect to {}", identity.label))
}

/// Print the helper's version.
pub fn version(config: &HelperConfig, out: Output) -> u8 {
    let result = runtime().and_then(|rt| {
        rt.block_on(async {
            let client = connect(config).await?;
            let version = client
                .get_version(config.client.request_timeout())
                .await
                .context("GetVersion failed")?;
            Ok::<_, anyhow::Error>(VersionOutput {
                server: client.server_info().to_string(),
                version,
            })
        })
    });

    match result {
        Ok(output) => {
            out.emit(&output, || format!("{} ({})", output.version, output.server));
            exit_codes::SUCCESS
        },
        Err(e) => out.fail(&format!("{e:#}")),
    }
}

/// Run the privileged operation with `payload`.
pub fn exec(config: &HelperConfig, payload: &str, out: Output) -> u8 {
    let result = runtime().and_then(|rt| {
        rt.block_on(async {
            let client = connect(config).await?;
            let (success, detail) = client
                .perform_privileged_operation(
                    payload.as_bytes().to_vec(),
                    config.client.request_timeout(),
                )
                .await
                .context("PerformPrivilegedOperation failed")?;
            Ok::<_, anyhow::Error>(ExecOutput { success, detail })
        })
    });

    match result {
        Ok(output) => {
            out.emit(&output, || {
                let verdict = if output.success { "ok" } else { "failed" };
                format!("{verdict}: {}", output.detail)
            });
            if output.success {
                exit_codes::SUCCESS
            } else {
                exit_codes::FAILURE
            }
        },
        Err(e) => out.fail(&format!("{e:#}")),
    }
}

//! `privhelper install`, `uninstall` and `status`.
//!
//! Install and uninstall acquire a grant for the bless right before touching
//! anything. With `--non-interactive` a rule that needs operator consent makes
//! them fail instead of prompting.

use anyhow::{Context, Result, anyhow};
use privhelper_core::{AuthError, HelperConfig, InstallState, Right};
use serde::Serialize;

use super::{Output, exit_codes, lifecycle, negotiator, runtime};

/// Result of a lifecycle command.
#[derive(Debug, Serialize)]
pub struct StateOutput {
    /// Service label.
    pub label: String,
    /// Expected code identity (hex).
    pub code_identity: String,
    /// State after the command.
    pub state: InstallState,
}

/// Install the configured helper.
pub fn install(config: &HelperConfig, interactive: bool, out: Output) -> u8 {
    match run_install(config, interactive) {
        Ok(state) => report(&state, out),
        Err(e) => out.fail(&format!("{e:#}")),
    }
}

/// Uninstall the configured helper.
pub fn uninstall(config: &HelperConfig, interactive: bool, out: Output) -> u8 {
    match run_uninstall(config, interactive) {
        Ok(state) => report(&state, out),
        Err(e) => out.fail(&format!("{e:#}")),
    }
}

/// Show the state of the configured helper.
pub fn status(config: &HelperConfig, out: Output) -> u8 {
    match run_status(config) {
        Ok(state) => report(&state, out),
        Err(e) => out.fail(&format!("{e:#}")),
    }
}

fn report(state: &StateOutput, out: Output) -> u8 {
    out.emit(state, || {
        format!(
            "{}: {} (code identity {})",
            state.label, state.state, state.code_identity
        )
    });
    exit_codes::SUCCESS
}

fn acquire(config: &HelperConfig, interactive: bool) -> Result<privhelper_core::AuthorizationGrant> {
    negotiator(config)?
        .acquire_grant(&Right::bless(), interactive)
        .map_err(|e| match e {
            AuthError::UserInteractionRequired { .. } => {
                anyhow!("{e}; rerun without --non-interactive to be prompted")
            },
            other => anyhow!(other),
        })
}

fn run_install(config: &HelperConfig, interactive: bool) -> Result<StateOutput> {
    let identity = config
        .service_identity()
        .context("failed to determine helper identity")?;
    let grant = acquire(config, interactive)?;

    let lifecycle = lifecycle(config);
    runtime()?
        .block_on(lifecycle.install(&identity, &grant))
        .context("install failed")?;
    grant.release();

    Ok(StateOutput {
        label: identity.label.to_string(),
        code_identity: identity.code_identity.to_hex(),
        state: lifecycle.state(),
    })
}

fn run_uninstall(config: &HelperConfig, interactive: bool) -> Result<StateOutput> {
    let identity = config
        .service_identity()
        .context("failed to determine helper identity")?;
    let grant = acquire(config, interactive)?;

    let lifecycle = lifecycle(config);
    runtime()?
        .block_on(lifecycle.uninstall(&identity, &grant))
        .context("uninstall failed")?;
    grant.release();

    Ok(StateOutput {
        label: identity.label.to_string(),
        code_identity: identity.code_identity.to_hex(),
        state: lifecycle.state(),
    })
}

fn run_status(config: &HelperConfig) -> Result<StateOutput> {
    let identity = config
        .service_identity()
        .context("failed to determine helper identity")?;
    let lifecycle = lifecycle(config);
    let state = runtime()?
        .block_on(lifecycle.status(&identity))
        .context("failed to inspect helper artifacts")?;

    Ok(StateOutput {
        label: identity.label.to_string(),
        code_identity: identity.code_identity.to_hex(),
        state,
    })
}

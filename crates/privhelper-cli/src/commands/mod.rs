//! Subcommand implementations.
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: The operation failed (denied, helper unreachable, step failed)
//! - 2: Usage error (bad arguments or configuration)

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use privhelper_core::authorization::{PolicyTrustStore, TerminalPrompt};
use privhelper_core::install::{FsServiceRegistrar, ProcessLauncher};
use privhelper_core::{CredentialNegotiator, HelperConfig, HelperLifecycle};
use serde::Serialize;

pub mod check;
pub mod helper;
pub mod lifecycle;

/// Exit codes shared by every subcommand.
pub mod exit_codes {
    /// Success exit code.
    pub const SUCCESS: u8 = 0;
    /// The requested operation failed.
    pub const FAILURE: u8 = 1;
    /// Bad arguments or configuration.
    pub const USAGE: u8 = 2;
}

/// Load `path` and apply command-line overrides.
pub fn load_config(path: &Path, request_timeout_ms: Option<u64>) -> Result<HelperConfig> {
    let mut config = HelperConfig::from_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    if let Some(ms) = request_timeout_ms {
        if ms == 0 {
            bail!("--request-timeout-ms must be greater than zero");
        }
        config.client.request_timeout_ms = ms;
    }
    Ok(config)
}

/// Text or JSON presentation.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
}

impl Output {
    pub const fn new(json: bool) -> Self {
        Self { json }
    }

    /// Print `value` as JSON, or `text` otherwise.
    pub fn emit<T: Serialize>(self, value: &T, text: impl FnOnce() -> String) {
        if self.json {
            match serde_json::to_string_pretty(value) {
                Ok(s) => println!("{s}"),
                Err(e) => eprintln!("Error: failed to serialize output: {e}"),
            }
        } else {
            println!("{}", text());
        }
    }

    /// Report a failure on stderr (or stdout as JSON) and return its code.
    pub fn fail(self, err: &dyn std::fmt::Display) -> u8 {
        #[derive(Serialize)]
        struct ErrorOutput {
            error: String,
        }
        if self.json {
            self.emit(
                &ErrorOutput {
                    error: err.to_string(),
                },
                String::new,
            );
        } else {
            eprintln!("Error: {err}");
        }
        exit_codes::FAILURE
    }
}

/// Single-threaded runtime for one command.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

/// Lifecycle over the configured layout, launching the real helper binary.
pub fn lifecycle(config: &HelperConfig) -> HelperLifecycle {
    let launcher = Arc::new(ProcessLauncher::new(config.layout.clone()));
    let registrar = Arc::new(FsServiceRegistrar::new(
        config.layout.clone(),
        &config.service.source_binary,
        config.accept.clone(),
        launcher,
    ));
    HelperLifecycle::new(registrar).with_lock_file(config.layout.lock_path(&config.service.label))
}

/// Negotiator backed by the configured rule file, prompting on the terminal.
pub fn negotiator(config: &HelperConfig) -> Result<CredentialNegotiator> {
    let store = PolicyTrustStore::from_file(&config.authorization.rules_file, Arc::new(TerminalPrompt))
        .context("failed to load authorization rules")?;
    Ok(CredentialNegotiator::new(Arc::new(store)))
}

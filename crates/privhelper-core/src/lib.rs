//! privhelper-core - lifecycle management for a privileged helper service.
//!
//! This crate owns everything on the unprivileged side of a privileged helper
//! that does not touch the IPC wire:
//!
//! - [`authorization`]: scoped, OS-verified consent ([`AuthorizationGrant`])
//! - [`identity`]: the `(label, code identity)` pair naming a helper
//! - [`install`]: the install and uninstall state machines, the on-disk
//!   service descriptor, and the registrar that places artifacts
//! - [`config`]: TOML configuration shared by the CLI and helper
//! - [`preflight`]: bundle sanity checks run before an install
//! - [`process`]: pid plus start time, so a recycled pid is never trusted
//!
//! # Lifecycle
//!
//! ```text
//!             install (grant)                uninstall (grant)
//! NotInstalled ──► Installing ──► Installed ──► Uninstalling ──► NotInstalled
//!                      │                            │
//!                      └──────► Failed(reason) ◄────┘
//! ```
//!
//! Install and uninstall are mutually exclusive within a process (shared
//! [`install::InstallStateCell`]) and across processes (an exclusive lock file
//! per service label).

pub mod authorization;
pub mod config;
pub mod identity;
pub mod install;
pub mod preflight;
pub mod process;

pub use authorization::{AuthError, AuthorizationGrant, CredentialNegotiator, Right};
pub use config::{ConfigError, HelperConfig};
pub use identity::{CodeIdentity, ServiceIdentity, ServiceLabel};
pub use install::{HelperLifecycle, InstallError, InstallState, UninstallError};

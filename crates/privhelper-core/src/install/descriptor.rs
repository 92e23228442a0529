//! On-disk service descriptor.
//!
//! Written by the registrar at install and read by the helper at startup.
//! The `[accept]` section is the caller policy the helper enforces, so the
//! credentials checked at connection time are exactly the ones recorded when
//! the operator authorized the install.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{CodeIdentity, ServiceIdentity, ServiceLabel};

/// Callers the helper accepts connections from.
///
/// Empty rules accept nobody.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptRules {
    /// Peer uids allowed to connect.
    #[serde(default)]
    pub allowed_uids: Vec<u32>,

    /// Peer gids allowed to connect.
    #[serde(default)]
    pub allowed_gids: Vec<u32>,

    /// Digests of client executables allowed to connect.
    #[serde(default)]
    pub authorized_clients: Vec<CodeIdentity>,
}

impl AcceptRules {
    /// Returns `true` if no rule is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allowed_uids.is_empty()
            && self.allowed_gids.is_empty()
            && self.authorized_clients.is_empty()
    }
}

/// Descriptor errors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// Reading or writing the descriptor failed.
    #[error("descriptor I/O error at {}: {source}", path.display())]
    Io {
        /// Descriptor path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The descriptor is not valid TOML for this schema.
    #[error("invalid descriptor: {0}")]
    Parse(#[from] toml::de::Error),

    /// The descriptor could not be rendered.
    #[error("failed to serialize descriptor: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Registration record for an installed helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDescriptor {
    /// Service label.
    pub label: ServiceLabel,

    /// Installed helper executable.
    pub program: PathBuf,

    /// Digest of `program` at install time.
    pub code_identity: CodeIdentity,

    /// Socket the helper listens on.
    pub socket_path: PathBuf,

    /// When the descriptor was written.
    pub installed_at: DateTime<Utc>,

    /// Caller policy.
    #[serde(default)]
    pub accept: AcceptRules,
}

impl ServiceDescriptor {
    /// Returns the identity recorded in this descriptor.
    #[must_use]
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(self.label.clone(), self.code_identity)
    }

    /// Read a descriptor from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, DescriptorError> {
        let content = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a descriptor from TOML.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Parse`] if the document is invalid.
    pub fn from_toml(content: &str) -> Result<Self, DescriptorError> {
        Ok(toml::from_str(content)?)
    }

    /// Render the descriptor as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Serialize`] if rendering fails.
    pub fn to_toml(&self) -> Result<String, DescriptorError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

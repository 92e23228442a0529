//! Configuration parsing.
//!
//! `privhelper.toml` names the helper being managed, where its artifacts go,
//! which rule file backs authorization, and who may connect to it. Every
//! section except `[service]` has defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::identity::{CodeIdentity, ServiceIdentity, ServiceLabel};
use crate::install::{AcceptRules, ServiceLayout};

/// Default authorization rule file.
pub const DEFAULT_RULES_FILE: &str = "/etc/privhelper/authorization.toml";

/// Default per-request client timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default bound on connecting plus the handshake, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelperConfig {
    /// The helper being managed.
    pub service: ServiceConfig,

    /// Install locations.
    #[serde(default)]
    pub layout: ServiceLayout,

    /// Authorization settings.
    #[serde(default)]
    pub authorization: AuthorizationConfig,

    /// Caller policy recorded in the descriptor.
    #[serde(default)]
    pub accept: AcceptRules,

    /// Client settings.
    #[serde(default)]
    pub client: ClientSettings,
}

impl HelperConfig {
    /// Read and validate a helper config file.
    ///
    /// Relative `source_binary` paths are resolved against the file's
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is unreadable, not TOML, or invalid.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        if config.service.source_binary.is_relative() {
            if let Some(base) = path.parent() {
                config.service.source_binary = base.join(&config.service.source_binary);
            }
        }
        Ok(config)
    }

    /// Parse and validate helper config text.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] if a value has no TOML form.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("request_timeout_ms", self.client.request_timeout_ms),
            ("connect_timeout_ms", self.client.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "client.{name} must be greater than zero"
                )));
            }
        }
        for (name, dir) in [
            ("descriptor_dir", &self.layout.descriptor_dir),
            ("binary_dir", &self.layout.binary_dir),
            ("runtime_dir", &self.layout.runtime_dir),
            ("state_dir", &self.layout.state_dir),
        ] {
            if dir.is_relative() {
                return Err(ConfigError::Validation(format!(
                    "layout.{name} must be an absolute path, got {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Identity of the configured helper.
    ///
    /// Uses the pinned `code_identity` if set, otherwise hashes the source
    /// binary.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the source binary must be hashed and
    /// cannot be read.
    pub fn service_identity(&self) -> Result<ServiceIdentity, ConfigError> {
        let code_identity = match self.service.code_identity {
            Some(pinned) => pinned,
            None => CodeIdentity::of_file(&self.service.source_binary)?,
        };
        Ok(ServiceIdentity::new(self.service.label.clone(), code_identity))
    }
}

/// `[service]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Service label.
    pub label: ServiceLabel,

    /// Expected digest of the helper binary. Derived from `source_binary`
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_identity: Option<CodeIdentity>,

    /// Helper binary shipped in the application bundle.
    pub source_binary: PathBuf,
}

/// `[authorization]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizationConfig {
    /// Rule file for the policy trust store.
    #[serde(default = "default_rules_file")]
    pub rules_file: PathBuf,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            rules_file: default_rules_file(),
        }
    }
}

fn default_rules_file() -> PathBuf {
    PathBuf::from(DEFAULT_RULES_FILE)
}

/// `[client]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSettings {
    /// Deadline applied to each request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Bound on connecting to the helper socket plus the handshake.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ClientSettings {
    /// Request timeout as a [`std::time::Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    /// Connect timeout as a [`std::time::Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

const fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

const fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration or the source binary.
    #[error("cannot read helper config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("helper config is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("cannot render helper config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid helper config: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const MINIMAL: &str = r#"
        [service]
        label = "com.example.privhelper"
        source_binary = "helper"
    "#;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config = HelperConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.service.label.as_str(), "com.example.privhelper");
        assert!(config.service.code_identity.is_none());
        assert_eq!(config.layout, ServiceLayout::default());
        assert_eq!(config.authorization.rules_file, PathBuf::from(DEFAULT_RULES_FILE));
        assert!(config.accept.is_empty());
        assert_eq!(config.client.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert_eq!(config.client.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn test_every_section_parses() {
        let client = CodeIdentity::of_bytes(b"client");
        let helper = CodeIdentity::of_bytes(b"helper");
        let content = format!(
            r#"
            [service]
            label = "com.example.privhelper"
            code_identity = "{helper}"
            source_binary = "/opt/app/helper"

            [layout]
            descriptor_dir = "/tmp/d"
            binary_dir = "/tmp/b"
            runtime_dir = "/tmp/r"
            state_dir = "/tmp/s"

            [authorization]
            rules_file = "/tmp/rules.toml"

            [accept]
            allowed_uids = [501]
            allowed_gids = []
            authorized_clients = ["{client}"]

            [client]
            request_timeout_ms = 250
            connect_timeout_ms = 1500
            "#,
            helper = helper.to_hex(),
            client = client.to_hex(),
        );

        let config = HelperConfig::from_toml(&content).unwrap();
        assert_eq!(config.service.code_identity, Some(helper));
        assert_eq!(config.layout.binary_dir, PathBuf::from("/tmp/b"));
        assert_eq!(config.accept.allowed_uids, vec![501]);
        assert_eq!(config.accept.authorized_clients, vec![client]);
        assert_eq!(
            config.client.request_timeout(),
            std::time::Duration::from_millis(250)
        );
        assert_eq!(
            config.client.connect_timeout(),
            std::time::Duration::from_millis(1500)
        );

        let identity = config.service_identity().unwrap();
        assert_eq!(identity.code_identity, helper);

        let reparsed = HelperConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(reparsed.service.code_identity, Some(helper));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let content = format!("{MINIMAL}\n[client]\nretries = 3\n");
        assert!(matches!(
            HelperConfig::from_toml(&content),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        for key in ["request_timeout_ms", "connect_timeout_ms"] {
            let content = format!("{MINIMAL}\n[client]\n{key} = 0\n");
            match HelperConfig::from_toml(&content) {
                Err(ConfigError::Validation(msg)) => assert!(msg.contains(key), "{msg}"),
                other => panic!("{key} = 0 accepted: {other:?}"),
            }
        }
    }

    #[test]
    fn test_rejects_relative_layout() {
        let content = format!("{MINIMAL}\n[layout]\nbinary_dir = \"libexec\"\n");
        let err = HelperConfig::from_toml(&content).unwrap_err();
        assert!(err.to_string().contains("binary_dir"));
    }

    #[test]
    fn test_from_file_resolves_source_and_hashes_it() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("helper"), b"helper bytes").unwrap();
        let path = tmp.path().join("privhelper.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = HelperConfig::from_file(&path).unwrap();
        assert_eq!(config.service.source_binary, tmp.path().join("helper"));
        assert_eq!(
            config.service_identity().unwrap().code_identity,
            CodeIdentity::of_bytes(b"helper bytes")
        );
    }
}

//! Well-known locations of installed helper artifacts.
//!
//! ```text
//! <descriptor_dir>/<label>.toml   service descriptor (0644)
//! <binary_dir>/<label>            helper executable  (0755)
//! <runtime_dir>/<label>.sock      IPC endpoint
//! <state_dir>/<label>.pid         pid of the running helper
//! <state_dir>/<label>.lock        cross-process lifecycle lock
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::identity::ServiceLabel;

/// Default descriptor directory.
pub const DEFAULT_DESCRIPTOR_DIR: &str = "/etc/privhelper/daemons";

/// Default helper binary directory.
pub const DEFAULT_BINARY_DIR: &str = "/usr/local/libexec/privhelper";

/// Default runtime directory for sockets.
pub const DEFAULT_RUNTIME_DIR: &str = "/var/run/privhelper";

/// Default state directory for pid and lock files.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/privhelper";

/// Directory layout for installed helpers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceLayout {
    /// Where service descriptors live.
    #[serde(default = "default_descriptor_dir")]
    pub descriptor_dir: PathBuf,

    /// Where helper binaries are installed.
    #[serde(default = "default_binary_dir")]
    pub binary_dir: PathBuf,

    /// Where helper sockets are bound.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Where pid and lock files live.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_descriptor_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DESCRIPTOR_DIR)
}

fn default_binary_dir() -> PathBuf {
    PathBuf::from(DEFAULT_BINARY_DIR)
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RUNTIME_DIR)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

impl Default for ServiceLayout {
    fn default() -> Self {
        Self {
            descriptor_dir: default_descriptor_dir(),
            binary_dir: default_binary_dir(),
            runtime_dir: default_runtime_dir(),
            state_dir: default_state_dir(),
        }
    }
}

impl ServiceLayout {
    /// Layout with every directory under `root` (used by tests and staged
    /// installs).
    #[must_use]
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            descriptor_dir: root.join("daemons"),
            binary_dir: root.join("libexec"),
            runtime_dir: root.join("run"),
            state_dir: root.join("state"),
        }
    }

    /// Descriptor path for `label`.
    #[must_use]
    pub fn descriptor_path(&self, label: &ServiceLabel) -> PathBuf {
        self.descriptor_dir.join(format!("{label}.toml"))
    }

    /// Installed binary path for `label`.
    #[must_use]
    pub fn binary_path(&self, label: &ServiceLabel) -> PathBuf {
        self.binary_dir.join(label.as_str())
    }

    /// Socket path for `label`.
    #[must_use]
    pub fn socket_path(&self, label: &ServiceLabel) -> PathBuf {
        self.runtime_dir.join(format!("{label}.sock"))
    }

    /// Pid file path for `label`.
    #[must_use]
    pub fn pid_path(&self, label: &ServiceLabel) -> PathBuf {
        self.state_dir.join(format!("{label}.pid"))
    }

    /// Lifecycle lock path for `label`.
    #[must_use]
    pub fn lock_path(&self, label: &ServiceLabel) -> PathBuf {
        self.state_dir.join(format!("{label}.lock"))
    }
}

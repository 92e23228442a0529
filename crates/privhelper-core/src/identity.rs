//! Service identity: the reverse-DNS label plus the code identity of the
//! helper binary.
//!
//! A [`CodeIdentity`] is the BLAKE3 digest of an executable. It is the only
//! thing the install and accept paths trust about a binary; paths and labels
//! are names, the digest is the identity.
//!
//! # Security Considerations
//!
//! - Digest equality uses constant-time comparison
//! - Labels are validated at construction so they are safe to use as file
//!   name components (no `/`, no `..`, no leading dot)

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Maximum length of a service label in bytes.
pub const MAX_LABEL_LEN: usize = 255;

/// Length of a code identity digest in bytes.
pub const CODE_IDENTITY_LEN: usize = 32;

/// Errors produced while parsing identities.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The label is not a well-formed reverse-DNS name.
    #[error("invalid service label '{label}': {reason}")]
    InvalidLabel {
        /// The rejected label.
        label: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The code identity is not 64 hex characters.
    #[error("invalid code identity: {reason}")]
    InvalidCodeIdentity {
        /// Why it was rejected.
        reason: String,
    },
}

/// Reverse-DNS service label, e.g. `com.example.privhelper`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceLabel(String);

impl ServiceLabel {
    /// Parse and validate a label.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidLabel`] unless the label has at least
    /// two dot-separated segments, each non-empty and made of ASCII
    /// alphanumerics and `-`, and fits in [`MAX_LABEL_LEN`] bytes.
    pub fn new(label: impl Into<String>) -> Result<Self, IdentityError> {
        let label = label.into();
        let reject = |reason| IdentityError::InvalidLabel {
            label: label.clone(),
            reason,
        };

        if label.is_empty() {
            return Err(reject("label is empty"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(reject("label exceeds 255 bytes"));
        }
        let mut segments = 0usize;
        for segment in label.split('.') {
            if segment.is_empty() {
                return Err(reject("empty segment"));
            }
            if !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
            {
                return Err(reject("segments may only contain [A-Za-z0-9-]"));
            }
            segments += 1;
        }
        if segments < 2 {
            return Err(reject("expected a reverse-DNS name with at least two segments"));
        }

        Ok(Self(label))
    }

    /// Returns the label as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ServiceLabel {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceLabel> for String {
    fn from(label: ServiceLabel) -> Self {
        label.0
    }
}

impl std::str::FromStr for ServiceLabel {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// BLAKE3 digest of a helper or client executable.
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CodeIdentity([u8; CODE_IDENTITY_LEN]);

impl CodeIdentity {
    /// Wrap a raw digest.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CODE_IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Digest arbitrary bytes.
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Digest the file at `path`, streaming its contents.
    ///
    /// # Errors
    ///
    /// Returns any I/O error raised while opening or reading the file.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Parse a lowercase or uppercase hex digest.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidCodeIdentity`] if the input is not
    /// exactly 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|e| IdentityError::InvalidCodeIdentity {
            reason: e.to_string(),
        })?;
        let bytes: [u8; CODE_IDENTITY_LEN] =
            bytes
                .try_into()
                .map_err(|v: Vec<u8>| IdentityError::InvalidCodeIdentity {
                    reason: format!("expected {CODE_IDENTITY_LEN} bytes, got {}", v.len()),
                })?;
        Ok(Self(bytes))
    }

    /// Returns the digest as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the raw digest.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CODE_IDENTITY_LEN] {
        &self.0
    }

    /// Short form for log lines (first 8 bytes).
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl PartialEq for CodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for CodeIdentity {}

impl fmt::Debug for CodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeIdentity({})", self.short())
    }
}

impl fmt::Display for CodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for CodeIdentity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<CodeIdentity> for String {
    fn from(identity: CodeIdentity) -> Self {
        identity.to_hex()
    }
}

/// The identity of an installed helper: its label and the digest of its
/// binary. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Reverse-DNS label; also names the descriptor, binary and socket.
    pub label: ServiceLabel,
    /// Digest of the helper binary.
    pub code_identity: CodeIdentity,
}

impl ServiceIdentity {
    /// Create a new identity.
    #[must_use]
    pub const fn new(label: ServiceLabel, code_identity: CodeIdentity) -> Self {
        Self {
            label,
            code_identity,
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.label, self.code_identity.short())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_label_accepts_reverse_dns() {
        let label = ServiceLabel::new("com.example.privhelper").unwrap();
        assert_eq!(label.as_str(), "com.example.privhelper");
        assert!(ServiceLabel::new("io.helper-2").is_ok());
    }

    #[test]
    fn test_label_rejects_path_components() {
        for bad in ["", "helper", "com..example", ".com.example", "com/example", "com.ex ample", "../etc.passwd"] {
            assert!(ServiceLabel::new(bad).is_err(), "accepted {bad:?}");
        }
        let long = format!("com.{}", "a".repeat(MAX_LABEL_LEN));
        assert!(ServiceLabel::new(long).is_err());
    }

    #[test]
    fn test_label_deserialize_validates() {
        let ok: Result<ServiceLabel, _> = from_toml_value("\"com.example.helper\"");
        assert!(ok.is_ok());
        let bad: Result<ServiceLabel, _> = from_toml_value("\"nodots\"");
        assert!(bad.is_err());
    }

    // toml cannot deserialize a bare string, so wrap it in a table.
    fn from_toml_value<T: serde::de::DeserializeOwned>(quoted: &str) -> Result<T, toml::de::Error> {
        #[derive(Deserialize)]
        struct Wrap<T> {
            v: T,
        }
        toml::from_str::<Wrap<T>>(&format!("v = {quoted}")).map(|w| w.v)
    }

    #[test]
    fn test_code_identity_hex_round_trip() {
        let id = CodeIdentity::of_bytes(b"helper binary");
        let parsed = CodeIdentity::from_hex(&id.to_hex()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_hex().len(), 64);
    }

    #[test]
    fn test_code_identity_rejects_wrong_length() {
        let err = CodeIdentity::from_hex("abcd").unwrap_err();
        assert!(matches!(err, IdentityError::InvalidCodeIdentity { .. }));
        assert!(CodeIdentity::from_hex("zz").is_err());
    }

    #[test]
    fn test_code_identity_of_file_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
        file.flush().unwrap();

        let from_file = CodeIdentity::of_file(file.path()).unwrap();
        assert_eq!(from_file, CodeIdentity::of_bytes(b"#!/bin/sh\nexit 0\n"));
        assert_ne!(from_file, CodeIdentity::of_bytes(b"#!/bin/sh\nexit 1\n"));
    }

    #[test]
    fn test_service_identity_display_is_short() {
        let identity = ServiceIdentity::new(
            ServiceLabel::new("com.example.helper").unwrap(),
            CodeIdentity::from_bytes([0xab; 32]),
        );
        assert_eq!(identity.to_string(), "com.example.helper@abababababababab");
    }
}

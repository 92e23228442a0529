//! Bundle preflight checks.
//!
//! Run before an install to catch a misassembled bundle early: a helper binary
//! that is missing or not what the configuration pins, or an accept policy
//! that would refuse every caller.

use std::fmt;
use std::os::unix::fs::PermissionsExt;

use crate::authorization::{AuthorizationRules, Right};
use crate::config::HelperConfig;
use crate::identity::CodeIdentity;

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational.
    Ok,
    /// Install may work but something looks off.
    Warning,
    /// Install will fail or produce an unusable helper.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Severity.
    pub severity: Severity,
    /// Short check name.
    pub check: &'static str,
    /// Detail.
    pub message: String,
}

/// All findings from a preflight run.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    /// Findings in check order.
    pub findings: Vec<Finding>,
}

impl PreflightReport {
    fn push(&mut self, severity: Severity, check: &'static str, message: impl Into<String>) {
        self.findings.push(Finding {
            severity,
            check,
            message: message.into(),
        });
    }

    /// Returns `true` if any finding is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    /// Findings at `severity`.
    pub fn at(&self, severity: Severity) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.severity == severity)
    }
}

/// Check that the bundle described by `config` can be installed.
#[must_use]
pub fn check_bundle(config: &HelperConfig) -> PreflightReport {
    let mut report = PreflightReport::default();
    let source = &config.service.source_binary;

    report.push(
        Severity::Ok,
        "label",
        format!("service label '{}'", config.service.label),
    );

    match std::fs::metadata(source) {
        Ok(metadata) if metadata.is_file() => {
            report.push(
                Severity::Ok,
                "source_binary",
                format!("found {}", source.display()),
            );
            if metadata.permissions().mode() & 0o111 == 0 {
                report.push(
                    Severity::Warning,
                    "source_binary",
                    "helper binary is not executable (install sets 0755)",
                );
            }
            check_digest(config, &mut report);
        },
        Ok(_) => report.push(
            Severity::Error,
            "source_binary",
            format!("{} is not a regular file", source.display()),
        ),
        Err(e) => report.push(
            Severity::Error,
            "source_binary",
            format!("{}: {e}", source.display()),
        ),
    }

    if config.accept.is_empty() {
        report.push(
            Severity::Error,
            "accept",
            "no accept rules configured; the helper would refuse every caller",
        );
    } else if config.accept.authorized_clients.is_empty() {
        report.push(
            Severity::Warning,
            "accept",
            "no authorized client identities; callers are checked by uid/gid only",
        );
    } else {
        report.push(
            Severity::Ok,
            "accept",
            format!(
                "{} authorized client identities",
                config.accept.authorized_clients.len()
            ),
        );
    }

    let rules_file = &config.authorization.rules_file;
    match AuthorizationRules::from_file(rules_file) {
        Ok(rules) if rules.mentions(&Right::bless()) => report.push(
            Severity::Ok,
            "authorization",
            format!("{} has a rule for '{}'", rules_file.display(), Right::bless()),
        ),
        Ok(_) => report.push(
            Severity::Error,
            "authorization",
            format!(
                "{} has no rule for '{}'; every install would be denied",
                rules_file.display(),
                Right::bless()
            ),
        ),
        Err(e) => report.push(Severity::Error, "authorization", e.to_string()),
    }

    report
}

fn check_digest(config: &HelperConfig, report: &mut PreflightReport) {
    let source = &config.service.source_binary;
    let found = match CodeIdentity::of_file(source) {
        Ok(found) => found,
        Err(e) => {
            report.push(
                Severity::Error,
                "code_identity",
                format!("cannot hash {}: {e}", source.display()),
            );
            return;
        },
    };

    match config.service.code_identity {
        Some(expected) if expected == found => report.push(
            Severity::Ok,
            "code_identity",
            format!("digest {} matches", found.short()),
        ),
        Some(expected) => report.push(
            Severity::Error,
            "code_identity",
            format!(
                "digest {} does not match configured {}",
                found.short(),
                expected.short()
            ),
        ),
        None => report.push(
            Severity::Warning,
            "code_identity",
            format!("no pinned code identity; would install digest {found}"),
        ),
    }
}

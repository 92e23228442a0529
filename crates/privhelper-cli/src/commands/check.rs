//! `privhelper check`: bundle preflight.

use privhelper_core::HelperConfig;
use privhelper_core::preflight::{Severity, check_bundle};
use serde::Serialize;

use super::{Output, exit_codes};

#[derive(Debug, Serialize)]
struct FindingOutput {
    severity: String,
    check: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    ok: bool,
    findings: Vec<FindingOutput>,
}

/// Run the preflight checks; fails if any finding is an error.
pub fn run(config: &HelperConfig, out: Output) -> u8 {
    let report = check_bundle(config);
    let output = CheckOutput {
        ok: !report.has_errors(),
        findings: report
            .findings
            .iter()
            .map(|f| FindingOutput {
                severity: f.severity.to_string(),
                check: f.check,
                message: f.message.clone(),
            })
            .collect(),
    };

    out.emit(&output, || {
        let mut lines: Vec<String> = report
            .findings
            .iter()
            .map(|f| format!("[{}] {}: {}", f.severity, f.check, f.message))
            .collect();
        let errors = report.at(Severity::Error).count();
        let warnings = report.at(Severity::Warning).count();
        lines.push(format!("{errors} error(s), {warnings} warning(s)"));
        lines.join("\n")
    });

    if output.ok {
        exit_codes::SUCCESS
    } else {
        exit_codes::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::commands::load_config;
    use crate::commands::tests::write_config;

    #[test]
    fn test_missing_bundle_binary_fails() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&write_config(&tmp), None).unwrap();
        std::fs::remove_file(tmp.path().join("helper")).unwrap();

        assert!(check_bundle(&config).has_errors());
        assert_eq!(run(&config, Output::new(true)), exit_codes::FAILURE);
    }
}

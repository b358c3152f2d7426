//! Structural validation of the hosts configuration.

use crate::hosts::{AuthConfig, HostsConfig};

/// Validation output for a loaded hosts configuration.
#[derive(Debug, Default)]
pub struct ConfigReport {
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl ConfigReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Render warnings and errors into a readable, multi-line string.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if !self.errors.is_empty() {
            out.push_str("Errors:\n");
            for err in &self.errors {
                out.push_str("  - ");
                out.push_str(err);
                out.push('\n');
            }
        }
        if !self.warnings.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("Warnings:\n");
            for warn in &self.warnings {
                out.push_str("  - ");
                out.push_str(warn);
                out.push('\n');
            }
        }
        out
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

/// Validate the hosts configuration. Scheme resolution is left to the
/// host-map builder; this pass checks shape only.
pub fn validate_hosts(cfg: &HostsConfig) -> ConfigReport {
    let mut report = ConfigReport::default();

    for (idx, host) in cfg.hosts.iter().enumerate() {
        let label = if host.name.trim().is_empty() {
            format!("host #{}", idx + 1)
        } else {
            format!("host '{}'", host.name.trim())
        };

        if host.names().is_empty() {
            report.error(format!("{label}: missing host name"));
        }
        if host.listeners().is_empty() {
            report.error(format!("{label}: missing host listener"));
        }
        if host.provider_count() == 0 {
            report.warn(format!("{label}: no providers; host will be skipped"));
        }

        check_auth(&mut report, &label, host.auth.as_ref());

        for p in &host.redirect {
            check_provider(&mut report, &label, "redirect", &p.uri, &p.target);
            check_auth(&mut report, &label, p.auth.as_ref());
        }
        for p in &host.file {
            check_provider(&mut report, &label, "file", &p.uri, &p.target);
            check_auth(&mut report, &label, p.auth.as_ref());
        }
        for p in &host.server {
            check_provider(&mut report, &label, "server", &p.uri, &p.target);
            check_auth(&mut report, &label, p.auth.as_ref());
            check_new_uri(&mut report, &label, p.options.new_uri.as_deref());
        }
        for p in &host.publisher {
            check_provider(&mut report, &label, "publisher", &p.uri, &p.target);
            check_auth(&mut report, &label, p.auth.as_ref());
            check_new_uri(&mut report, &label, p.options.new_uri.as_deref());
            if !p.target.starts_with('/') {
                report.error(format!(
                    "{label}: publisher target '{}' must be path-shaped (start with '/')",
                    p.target
                ));
            }
        }
        for p in &host.subscriber {
            check_provider(&mut report, &label, "subscriber", &p.uri, &p.target);
            check_auth(&mut report, &label, p.auth.as_ref());
            let scheme = p.target.split_once("://").map(|(s, _)| s);
            if !matches!(scheme, Some("http") | Some("https")) {
                report.error(format!(
                    "{label}: subscriber target '{}' must be an http(s) publisher URL",
                    p.target
                ));
            }
        }
    }

    report
}

fn check_provider(report: &mut ConfigReport, host: &str, kind: &str, uri: &str, target: &str) {
    if uri.trim().is_empty() {
        report.error(format!("{host}: {kind} provider missing uri"));
    }
    if target.trim().is_empty() {
        report.error(format!("{host}: {kind} provider missing target"));
    }
}

fn check_new_uri(report: &mut ConfigReport, host: &str, new_uri: Option<&str>) {
    if let Some(new_uri) = new_uri {
        let path = new_uri.split_once('?').map(|(p, _)| p).unwrap_or(new_uri);
        if !path.starts_with('/') {
            report.error(format!("{host}: invalid new-uri '{new_uri}'"));
        }
    }
}

fn check_auth(report: &mut ConfigReport, host: &str, auth: Option<&AuthConfig>) {
    let Some(auth) = auth else { return };
    if !auth.auth_type.eq_ignore_ascii_case("basic") {
        report.error(format!("{host}: unsupported auth type '{}'", auth.auth_type));
    }
    for user in &auth.users {
        if user.name.trim().is_empty() {
            report.error(format!("{host}: auth user with empty name"));
        }
    }
}

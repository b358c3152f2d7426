//! Models for `service.toml`: process-wide knobs and TLS material.

use serde::Deserialize;

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub limits: LimitsConfig,
    /// PEM certificate/key pairs, keyed by the listener connector they
    /// serve.
    #[serde(rename = "tls")]
    pub tls: Vec<TlsConfig>,
}

impl ServiceConfig {
    pub fn tls_for(&self, connector: &str) -> Option<&TlsConfig> {
        self.tls.iter().find(|t| t.listener == connector)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub listener: String,
    pub cert_path: String,
    pub key_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            listener: String::new(),
            cert_path: String::new(),
            key_path: String::new(),
        }
    }
}

// =======================================================
// LIMITS + DEFAULTS
// =======================================================
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,

    // Timeouts (seconds)
    pub keepalive_timeout_secs: u64,
    pub client_read_timeout_secs: u64,
    pub origin_connect_timeout_secs: u64,
    pub origin_read_timeout_secs: u64,
    pub origin_write_timeout_secs: u64,
    /// How long a publisher-routed request waits for a reverse-attached
    /// connection before giving up with 503.
    pub attach_timeout_secs: u64,
    /// Graceful dispatcher shutdown deadline.
    pub stop_timeout_secs: u64,

    // Pool limits
    pub pool_max_idle_per_endpoint: usize,

    // Limits (bytes)
    pub max_request_head_bytes: u64,
    pub max_request_body_bytes: u64,
    pub max_response_head_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            keepalive_timeout_secs: 65,
            client_read_timeout_secs: 15,
            origin_connect_timeout_secs: 5,
            origin_read_timeout_secs: 30,
            origin_write_timeout_secs: 30,
            attach_timeout_secs: 10,
            stop_timeout_secs: 5,
            pool_max_idle_per_endpoint: 32,
            max_request_head_bytes: 64 * 1024,
            max_request_body_bytes: 10 * 1024 * 1024,
            max_response_head_bytes: 64 * 1024,
        }
    }
}

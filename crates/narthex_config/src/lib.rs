mod hosts;
mod service;
mod validation;

use std::path::Path;

pub use hosts::{
    AuthConfig, FileConfig, FileOptions, HostConfig, HostsConfig, PublisherConfig, RedirectConfig,
    ServerConfig, ServerOptions, SubscriberConfig, UserConfig,
};
pub use service::{LimitsConfig, ServiceConfig, TlsConfig};
pub use validation::{validate_hosts, ConfigReport};

pub const SERVICE_CONFIG_FILENAME: &str = "service.toml";
pub const HOSTS_CONFIG_FILENAME: &str = "hosts.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),
    #[error("invalid configuration:\n{0}")]
    Invalid(String),
}

/// Load `service.toml` from the config directory. A missing file yields the
/// built-in defaults.
pub fn load_service(dir: &Path) -> Result<ServiceConfig, ConfigError> {
    let path = dir.join(SERVICE_CONFIG_FILENAME);
    let built = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
        .build()?;
    Ok(built.try_deserialize()?)
}

/// Load and validate `hosts.toml`. Validation errors reject the whole file
/// so a reload can keep the previous routing table.
pub fn load_hosts(dir: &Path) -> Result<HostsConfig, ConfigError> {
    let path = dir.join(HOSTS_CONFIG_FILENAME);
    let built = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
        .build()?;
    let cfg: HostsConfig = built.try_deserialize()?;

    let report = validate_hosts(&cfg);
    if report.has_errors() {
        return Err(ConfigError::Invalid(report.format()));
    }
    Ok(cfg)
}

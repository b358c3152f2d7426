//! Models for `hosts.toml`: virtual hosts and their providers.
//!
//! A host binds one or more hostnames (`name`, semicolon-separated, each
//! optionally `*.suffix`) to one or more listener connectors (`listener`,
//! semicolon-separated). Host-level attributes are inherited by provider
//! entries that do not override them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct HostsConfig {
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub listener: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect: Vec<RedirectConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file: Vec<FileConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server: Vec<ServerConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publisher: Vec<PublisherConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriber: Vec<SubscriberConfig>,
}

impl HostConfig {
    pub fn names(&self) -> Vec<&str> {
        split_list(&self.name)
    }

    pub fn listeners(&self) -> Vec<&str> {
        split_list(&self.listener)
    }

    /// Provider-level auth wins; otherwise the host-level table applies.
    pub fn auth_for<'a>(&'a self, provider: Option<&'a AuthConfig>) -> Option<&'a AuthConfig> {
        provider.or(self.auth.as_ref())
    }

    pub fn provider_count(&self) -> usize {
        self.redirect.len()
            + self.file.len()
            + self.server.len()
            + self.publisher.len()
            + self.subscriber.len()
    }
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_type", rename = "type")]
    pub auth_type: String,
    #[serde(default)]
    pub realm: String,
    #[serde(default, rename = "user", skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserConfig>,
}

fn default_auth_type() -> String {
    "basic".to_string()
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct UserConfig {
    pub name: String,
    /// An empty password defers the check to the external authenticator.
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct RedirectConfig {
    pub uri: String,
    /// Location template; `scheme`, `host`, `path` and `query` components
    /// may each be `...` to inherit from the request.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct FileConfig {
    pub uri: String,
    /// Root directory served by this provider.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub options: FileOptions,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct FileOptions {
    #[serde(default, rename = "def-file", skip_serializing_if = "Option::is_none")]
    pub def_file: Option<String>,
    #[serde(default, rename = "def-ext", skip_serializing_if = "Option::is_none")]
    pub def_ext: Option<String>,
    #[serde(
        default,
        rename = "response-headers",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub response_headers: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub uri: String,
    /// Origin connector string, e.g. `tcp:10.0.0.5:8080`.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub options: ServerOptions,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerOptions {
    #[serde(default, rename = "new-host", skip_serializing_if = "Option::is_none")]
    pub new_host: Option<String>,
    /// Path (and optional query) rewrite template; `...` substitutes the
    /// provider-local sub-path / the request query.
    #[serde(default, rename = "new-uri", skip_serializing_if = "Option::is_none")]
    pub new_uri: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct PublisherConfig {
    pub uri: String,
    /// Rendezvous token shared with the subscriber side; also the key of
    /// the reverse connection pool. Must be path-shaped (`/svc`).
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub options: ServerOptions,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubscriberConfig {
    pub uri: String,
    /// Publisher base URL, e.g. `https://gw.example.com/svc`; the path is
    /// the publisher's rendezvous token.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

#[cfg(test)]
mod tests {
    use super::HostConfig;

    #[test]
    fn name_and_listener_lists_are_trimmed() {
        let host = HostConfig {
            name: " a.com ; b.com ;; ".to_string(),
            listener: "tcp:0.0.0.0:80 ; ".to_string(),
            ..HostConfig::default()
        };
        assert_eq!(host.names(), vec!["a.com", "b.com"]);
        assert_eq!(host.listeners(), vec!["tcp:0.0.0.0:80"]);
    }
}

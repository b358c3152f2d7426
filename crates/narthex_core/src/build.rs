//! Builds the per-listener host maps from a hosts configuration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::error;

use narthex_config::{HostConfig, HostsConfig, LimitsConfig};
use narthex_net::Connector;

use crate::auth::{Authenticator, BasicAuth};
use crate::host::{GatewayHost, GatewayHostMap};
use crate::provider::{
    FileProvider, PublisherProvider, RedirectProvider, ServerProvider, SubscriberAcceptor,
    SubscriberProvider,
};

/// The outcome of one configuration build: a fresh host map per listener
/// connector, ready to be swapped into dispatchers.
pub(crate) struct BuiltMaps {
    pub maps: HashMap<String, Arc<GatewayHostMap>>,
    pub connectors: HashMap<String, Connector>,
}

/// Build host maps for every configured host.
///
/// A host whose listener uses an unregistered scheme is rejected (logged and
/// skipped); structural errors such as a hostname assigned twice on one
/// listener abort the whole build so a reload can keep the old tables.
pub(crate) fn build_host_maps(
    cfg: &HostsConfig,
    limits: &Arc<LimitsConfig>,
    authenticator: &Arc<dyn Authenticator>,
) -> anyhow::Result<BuiltMaps> {
    let mut maps: HashMap<String, GatewayHostMap> = HashMap::new();
    let mut connectors: HashMap<String, Connector> = HashMap::new();

    for host_cfg in &cfg.hosts {
        if host_cfg.provider_count() == 0 {
            continue;
        }

        // Normalize every listener first; a bad scheme rejects this host.
        let mut host_connectors = Vec::new();
        let mut rejected = false;
        for listener in host_cfg.listeners() {
            match Connector::parse(listener) {
                Ok(connector) => host_connectors.push(connector),
                Err(err) => {
                    error!(
                        target: "narthex::config",
                        host = %host_cfg.name,
                        listener = %listener,
                        error = %err,
                        "Rejecting host with bad listener"
                    );
                    rejected = true;
                    break;
                }
            }
        }
        if rejected || host_connectors.is_empty() {
            continue;
        }

        let names = host_cfg.names();
        if names.is_empty() {
            anyhow::bail!("host entry without a name");
        }

        let host = build_host(host_cfg, limits, authenticator)?;

        for connector in host_connectors {
            let key = connector.normalized();
            connectors.entry(key.clone()).or_insert_with(|| connector.clone());
            let map = maps.entry(key.clone()).or_default();
            for name in &names {
                if !map.insert(name, host.clone()) {
                    anyhow::bail!("host '{name}' already assigned to '{key}'");
                }
            }
        }
    }

    let maps = maps
        .into_iter()
        .map(|(key, map)| (key, Arc::new(map)))
        .collect();
    Ok(BuiltMaps { maps, connectors })
}

/// Assemble one virtual host from its provider entries.
fn build_host(
    cfg: &HostConfig,
    limits: &Arc<LimitsConfig>,
    authenticator: &Arc<dyn Authenticator>,
) -> anyhow::Result<Arc<GatewayHost>> {
    let mut host = GatewayHost::new();
    let mut subscribers = Vec::new();

    let auth_for = |provider_auth: Option<&narthex_config::AuthConfig>| {
        cfg.auth_for(provider_auth)
            .and_then(|auth| BasicAuth::from_config(auth, authenticator.clone()))
    };

    for p in &cfg.redirect {
        let provider = RedirectProvider::new(&p.uri, &p.target, auth_for(p.auth.as_ref()));
        host.add_provider(&p.uri, Arc::new(provider))?;
    }

    for p in &cfg.file {
        let provider = FileProvider::new(&p.uri, &p.target, &p.options, auth_for(p.auth.as_ref()));
        host.add_provider(&p.uri, Arc::new(provider))?;
    }

    for p in &cfg.server {
        let provider = ServerProvider::new(
            &p.uri,
            &p.target,
            &p.options,
            auth_for(p.auth.as_ref()),
            limits.clone(),
        )?;
        host.add_provider(&p.uri, Arc::new(provider))?;
    }

    for p in &cfg.publisher {
        let publisher =
            PublisherProvider::new(p, auth_for(p.auth.as_ref()), limits.clone())?;
        let acceptor = SubscriberAcceptor::new(&publisher);
        let acceptor_uri = {
            use crate::provider::Provider as _;
            acceptor.core().uri().to_string()
        };
        host.add_provider(&p.uri, publisher)?;
        host.add_provider(&acceptor_uri, Arc::new(acceptor))?;
    }

    for p in &cfg.subscriber {
        let subscriber = SubscriberProvider::new(p, auth_for(p.auth.as_ref()), limits.clone())?;
        subscribers.push(subscriber.clone());
        host.add_provider(&p.uri, subscriber)?;
    }

    let host = Arc::new(host);

    // Reconnect loops need the finished host for their pinned dispatcher.
    for subscriber in subscribers {
        subscriber.activate(&host, limits.clone());
    }

    Ok(host)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use narthex_config::{
        FileConfig, HostConfig, HostsConfig, LimitsConfig, RedirectConfig, ServerConfig,
    };

    use super::build_host_maps;
    use crate::auth::{Authenticator, DenyAll};

    fn limits() -> Arc<LimitsConfig> {
        Arc::new(LimitsConfig::default())
    }

    fn authenticator() -> Arc<dyn Authenticator> {
        Arc::new(DenyAll)
    }

    fn sample() -> HostsConfig {
        HostsConfig {
            hosts: vec![HostConfig {
                name: "svc.local;*.svc.local".into(),
                listener: "tcp:127.0.0.1:18080".into(),
                file: vec![FileConfig {
                    uri: "/".into(),
                    target: "/var/www".into(),
                    ..FileConfig::default()
                }],
                server: vec![ServerConfig {
                    uri: "/api".into(),
                    target: "tcp:10.0.0.5:8080".into(),
                    ..ServerConfig::default()
                }],
                ..HostConfig::default()
            }],
        }
    }

    #[tokio::test]
    async fn builds_maps_with_wildcards() {
        let built = build_host_maps(&sample(), &limits(), &authenticator()).unwrap();
        assert_eq!(built.maps.len(), 1);
        let map = built.maps.get("tcp:127.0.0.1:18080").unwrap();
        let host = map.lookup("svc.local").unwrap();
        assert_eq!(host.provider_count(), 2);
        assert!(map.lookup("a.svc.local").is_some());
        assert!(map.lookup("other.local").is_none());
    }

    #[tokio::test]
    async fn same_host_on_multiple_listeners_shares_the_host() {
        let mut cfg = sample();
        cfg.hosts[0].listener = "tcp:0.0.0.0:18080;tcp:0.0.0.0:18081".into();
        let built = build_host_maps(&cfg, &limits(), &authenticator()).unwrap();
        assert_eq!(built.maps.len(), 2);
        let a = built.maps.get("tcp:0.0.0.0:18080").unwrap().lookup("svc.local").unwrap();
        let b = built.maps.get("tcp:0.0.0.0:18081").unwrap().lookup("svc.local").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn unknown_scheme_rejects_the_host_only() {
        let mut cfg = sample();
        cfg.hosts.push(HostConfig {
            name: "bad.local".into(),
            listener: "quic:0.0.0.0:443".into(),
            redirect: vec![RedirectConfig {
                uri: "/".into(),
                target: "https://elsewhere/...".into(),
                auth: None,
            }],
            ..HostConfig::default()
        });
        let built = build_host_maps(&cfg, &limits(), &authenticator()).unwrap();
        assert_eq!(built.maps.len(), 1);
        assert!(built.maps.get("tcp:127.0.0.1:18080").is_some());
    }

    #[tokio::test]
    async fn duplicate_hostname_on_listener_aborts_build() {
        let mut cfg = sample();
        let mut dup = cfg.hosts[0].clone();
        dup.name = "svc.local".into();
        cfg.hosts.push(dup);
        assert!(build_host_maps(&cfg, &limits(), &authenticator()).is_err());
    }

    #[tokio::test]
    async fn duplicate_uri_on_host_aborts_build() {
        let mut cfg = sample();
        cfg.hosts[0].server.push(ServerConfig {
            uri: "/api".into(),
            target: "tcp:10.0.0.6:8080".into(),
            ..ServerConfig::default()
        });
        assert!(build_host_maps(&cfg, &limits(), &authenticator()).is_err());
    }
}

//! Connector strings (`scheme:address:port`) and dialing.

use std::sync::{Arc, LazyLock};

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_rustls::rustls::{self, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{BoxedStream, NetError};

/// Registered listener/dial schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Tls,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
        }
    }

    fn lookup(name: &str) -> Option<Scheme> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(Scheme::Tcp),
            "tls" => Some(Scheme::Tls),
            _ => None,
        }
    }
}

/// A normalized listen or dial endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connector {
    scheme: Scheme,
    address: String,
}

impl Connector {
    /// Parse and normalize `scheme:host:port`. Unknown schemes and
    /// malformed addresses are configuration errors.
    pub fn parse(raw: &str) -> Result<Self, NetError> {
        let raw = raw.trim();
        let (scheme_str, address) = raw
            .split_once(':')
            .ok_or_else(|| NetError::MalformedConnector(raw.to_string()))?;
        let scheme = Scheme::lookup(scheme_str)
            .ok_or_else(|| NetError::UnknownScheme(scheme_str.to_string()))?;

        let address = address.trim();
        let port_ok = address
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !port_ok {
            return Err(NetError::MalformedConnector(raw.to_string()));
        }

        Ok(Self {
            scheme,
            address: address.to_string(),
        })
    }

    /// Build a dial endpoint from parts, e.g. for a subscriber's publisher
    /// URL (`https://gw.example.com` → `tls:gw.example.com:443`).
    pub fn from_parts(scheme: Scheme, host: &str, port: u16) -> Self {
        Self {
            scheme,
            address: format!("{host}:{port}"),
        }
    }

    /// The canonical `scheme:address` form used as map key.
    pub fn normalized(&self) -> String {
        format!("{}:{}", self.scheme.as_str(), self.address)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Host part of the address, used for TLS server-name verification.
    pub fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Tls
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        Ok(TcpListener::bind(&self.address).await?)
    }

    /// Dial the endpoint, wrapping in TLS when the scheme asks for it.
    pub async fn dial(&self, connect_timeout: Duration) -> anyhow::Result<BoxedStream> {
        let stream = match timeout(connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(res) => res?,
            Err(_) => anyhow::bail!("connect timeout to {}", self.normalized()),
        };

        match self.scheme {
            Scheme::Tcp => Ok(Box::new(stream)),
            Scheme::Tls => {
                let server_name = ServerName::try_from(self.host())
                    .map_err(|_| anyhow::anyhow!("invalid TLS server name '{}'", self.host()))?;
                let connector = TlsConnector::from(client_tls_config());
                let tls = match timeout(connect_timeout, connector.connect(server_name, stream)).await
                {
                    Ok(res) => res?,
                    Err(_) => anyhow::bail!("TLS handshake timeout to {}", self.normalized()),
                };
                debug!(target: "narthex::net", endpoint = %self.normalized(), "TLS dial complete");
                Ok(Box::new(tls))
            }
        }
    }
}

impl std::fmt::Display for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.normalized())
    }
}

fn client_tls_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        Arc::new(
            rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    });
    CONFIG.clone()
}

#[cfg(test)]
mod tests {
    use super::{Connector, Scheme};
    use crate::NetError;

    #[test]
    fn parses_and_normalizes() {
        let c = Connector::parse("TCP:0.0.0.0:80").unwrap();
        assert_eq!(c.scheme(), Scheme::Tcp);
        assert_eq!(c.normalized(), "tcp:0.0.0.0:80");
        let c = Connector::parse("tls:gw.example.com:443").unwrap();
        assert!(c.is_tls());
        assert_eq!(c.host(), "gw.example.com");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            Connector::parse("udp:0.0.0.0:53"),
            Err(NetError::UnknownScheme(_))
        ));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(
            Connector::parse("tcp"),
            Err(NetError::MalformedConnector(_))
        ));
        assert!(matches!(
            Connector::parse("tcp:0.0.0.0"),
            Err(NetError::MalformedConnector(_))
        ));
        assert!(matches!(
            Connector::parse("tcp::80"),
            Err(NetError::MalformedConnector(_))
        ));
    }

    #[test]
    fn from_parts_builds_dial_endpoint() {
        let c = Connector::from_parts(Scheme::Tls, "gw.example.com", 443);
        assert_eq!(c.normalized(), "tls:gw.example.com:443");
    }
}

//! Basic-Auth enforcement shared by all provider variants.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use narthex_config::AuthConfig;
use narthex_http::{Request, Response};

/// External credential check, consulted when a configured user has an empty
/// password (the account is managed outside the gateway).
pub trait Authenticator: Send + Sync {
    fn authenticate_user(&self, name: &str, password: &str) -> bool;
}

/// Default authenticator: rejects everything. Deployments that want
/// OS-account deferral plug their own implementation into the app.
pub struct DenyAll;

impl Authenticator for DenyAll {
    fn authenticate_user(&self, name: &str, _password: &str) -> bool {
        warn!(
            target: "narthex::auth",
            user = %name,
            "No external authenticator configured; denying deferred credential check"
        );
        false
    }
}

/// A provider's Basic-Auth realm and user table.
pub struct BasicAuth {
    realm: String,
    users: HashMap<String, String>,
    authenticator: Arc<dyn Authenticator>,
}

impl BasicAuth {
    /// Build from config. Returns `None` when the table has no users, in
    /// which case the provider skips the auth pre-step entirely.
    pub fn from_config(cfg: &AuthConfig, authenticator: Arc<dyn Authenticator>) -> Option<Self> {
        if cfg.users.is_empty() {
            return None;
        }
        let users = cfg
            .users
            .iter()
            .map(|u| (u.name.clone(), u.password.clone()))
            .collect();
        Some(Self {
            realm: cfg.realm.clone(),
            users,
            authenticator,
        })
    }

    /// Check the request's credentials. Returns `None` when authorized, or
    /// the `401` challenge response to send otherwise.
    pub fn challenge(&self, request: &Request) -> Option<Response> {
        let authorized = match request.basic_auth() {
            Some((user, password)) => match self.users.get(&user) {
                Some(configured) if configured.is_empty() => {
                    self.authenticator.authenticate_user(&user, &password)
                }
                Some(configured) => password == *configured,
                None => false,
            },
            None => false,
        };

        if authorized {
            None
        } else {
            debug!(target: "narthex::auth", realm = %self.realm, "Rejecting unauthorized request");
            let mut response = Response::new(401);
            response.set_header(
                "WWW-Authenticate",
                &format!("Basic realm=\"{}\"", self.realm),
            );
            response.set_body(b"401 Unauthorized\n".to_vec(), "text/plain; charset=utf-8");
            Some(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use narthex_config::{AuthConfig, UserConfig};
    use narthex_http::read_request;

    use super::{Authenticator, BasicAuth, DenyAll};

    async fn request(auth_header: Option<&str>) -> narthex_http::Request {
        let raw = match auth_header {
            Some(value) => format!("GET / HTTP/1.1\r\nHost: e\r\nAuthorization: {value}\r\n\r\n"),
            None => "GET / HTTP/1.1\r\nHost: e\r\n\r\n".to_string(),
        };
        let (mut client, mut server) = tokio::io::duplex(8192);
        tokio::io::AsyncWriteExt::write_all(&mut client, raw.as_bytes())
            .await
            .unwrap();
        drop(client);
        let mut buf = bytes::BytesMut::new();
        read_request(
            &mut server,
            &mut buf,
            0,
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(1),
        )
        .await
        .unwrap()
        .unwrap()
    }

    fn table() -> BasicAuth {
        let cfg = AuthConfig {
            auth_type: "basic".into(),
            realm: "gate".into(),
            users: vec![
                UserConfig {
                    name: "ops".into(),
                    password: "secret".into(),
                },
                UserConfig {
                    name: "external".into(),
                    password: String::new(),
                },
            ],
        };
        BasicAuth::from_config(&cfg, Arc::new(DenyAll)).unwrap()
    }

    #[tokio::test]
    async fn accepts_matching_password() {
        // ops:secret
        let req = request(Some("Basic b3BzOnNlY3JldA==")).await;
        assert!(table().challenge(&req).is_none());
    }

    #[tokio::test]
    async fn rejects_wrong_password_with_realm() {
        // ops:nope
        let req = request(Some("Basic b3BzOm5vcGU=")).await;
        let resp = table().challenge(&req).unwrap();
        assert_eq!(resp.status(), 401);
        assert_eq!(
            resp.header("www-authenticate"),
            Some("Basic realm=\"gate\"")
        );
    }

    #[tokio::test]
    async fn rejects_missing_credentials_and_unknown_user() {
        let req = request(None).await;
        assert!(table().challenge(&req).is_some());
        // nobody:x
        let req = request(Some("Basic bm9ib2R5Ong=")).await;
        assert!(table().challenge(&req).is_some());
    }

    #[tokio::test]
    async fn empty_configured_password_defers_to_authenticator() {
        struct AllowAll;
        impl Authenticator for AllowAll {
            fn authenticate_user(&self, _: &str, _: &str) -> bool {
                true
            }
        }
        let cfg = narthex_config::AuthConfig {
            auth_type: "basic".into(),
            realm: "gate".into(),
            users: vec![narthex_config::UserConfig {
                name: "external".into(),
                password: String::new(),
            }],
        };
        let table = BasicAuth::from_config(&cfg, Arc::new(AllowAll)).unwrap();
        // external:anything
        let req = request(Some("Basic ZXh0ZXJuYWw6YW55dGhpbmc=")).await;
        assert!(table.challenge(&req).is_none());
        // DenyAll refuses the same request.
        let deny = super::BasicAuth::from_config(&cfg, Arc::new(DenyAll)).unwrap();
        assert!(deny.challenge(&req).is_some());
    }
}

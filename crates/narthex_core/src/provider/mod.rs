//! Provider variants: each transforms a matched request into a response by
//! its own rules.

mod file;
mod publisher;
mod redirect;
mod server;
mod subscriber;

use std::sync::Arc;

use async_trait::async_trait;

use narthex_http::RequestUri;

use crate::auth::BasicAuth;
use crate::context::{GatewayContext, Outcome};

pub use file::FileProvider;
pub use publisher::{PublisherProvider, SubscriberAcceptor, ATTACH_METHOD};
pub use redirect::RedirectProvider;
pub use server::ServerProvider;
pub use subscriber::SubscriberProvider;

/// State shared by every provider variant: the URI prefix it is bound to,
/// its target string, and the optional Basic-Auth table.
pub struct ProviderCore {
    uri: String,
    target: String,
    auth: Option<BasicAuth>,
}

impl ProviderCore {
    pub fn new(uri: &str, target: &str, auth: Option<BasicAuth>) -> Self {
        let uri = uri.trim();
        let uri = if uri.is_empty() {
            "/".to_string()
        } else if uri.starts_with('/') {
            uri.trim_end_matches('/').to_string()
        } else {
            format!("/{}", uri.trim_end_matches('/'))
        };
        let uri = if uri.is_empty() { "/".to_string() } else { uri };
        Self {
            uri,
            target: target.to_string(),
            auth,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn core(&self) -> &ProviderCore;

    async fn dispatch_request(
        &self,
        ctx: &mut GatewayContext,
        uri: RequestUri,
    ) -> anyhow::Result<Outcome>;
}

/// Shared pre-dispatch step: Basic-Auth when configured, then the variant's
/// own behavior.
pub(crate) async fn begin_dispatch(
    provider: Arc<dyn Provider>,
    ctx: &mut GatewayContext,
    uri: RequestUri,
) -> anyhow::Result<Outcome> {
    if let Some(auth) = &provider.core().auth {
        if let Some(mut denied) = auth.challenge(&ctx.request) {
            return ctx.send_response(&mut denied).await;
        }
    }
    provider.dispatch_request(ctx, uri).await
}

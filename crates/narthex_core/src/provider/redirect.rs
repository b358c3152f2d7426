//! Redirect provider: answers with `307` and a templated `Location`.

use async_trait::async_trait;

use narthex_http::uri::substitute;
use narthex_http::{split_url, RequestUri, Response, ELLIPSIS};

use crate::auth::BasicAuth;
use crate::context::{GatewayContext, Outcome};
use crate::provider::{Provider, ProviderCore};

/// Splits the configured target URL into components once; each component
/// holding the ellipsis token inherits from the incoming request at
/// dispatch time.
pub struct RedirectProvider {
    core: ProviderCore,
    new_scheme: Option<String>,
    new_host: Option<String>,
    new_path: String,
    new_query: String,
}

impl RedirectProvider {
    pub fn new(uri: &str, target: &str, auth: Option<BasicAuth>) -> Self {
        let parts = split_url(target);

        let keep = |s: String| {
            if s.is_empty() || s == ELLIPSIS {
                None
            } else {
                Some(s)
            }
        };

        // A target without an explicit query inherits the request's.
        let new_query = if target.contains('?') {
            parts.query
        } else {
            ELLIPSIS.to_string()
        };

        Self {
            core: ProviderCore::new(uri, target, auth),
            new_scheme: keep(parts.scheme),
            new_host: keep(parts.host),
            new_path: parts.path,
            new_query,
        }
    }
}

#[async_trait]
impl Provider for RedirectProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn dispatch_request(
        &self,
        ctx: &mut GatewayContext,
        uri: RequestUri,
    ) -> anyhow::Result<Outcome> {
        let request_path = uri.path();
        if request_path.is_empty() {
            return ctx.send_error(400, None).await;
        }

        let scheme = match &self.new_scheme {
            Some(scheme) => scheme.as_str(),
            None if ctx.is_secure() => "https",
            None => "http",
        };

        let host = match &self.new_host {
            Some(host) => host.clone(),
            None => match ctx.request.host_raw() {
                Some(host) => host.to_string(),
                None => return ctx.send_error(400, None).await,
            },
        };

        let path = if self.new_path.is_empty() {
            String::new()
        } else {
            let inherited = request_path.trim_start_matches('/');
            substitute(&self.new_path, inherited)
                .trim_start_matches('/')
                .to_string()
        };

        let query = if self.new_query.is_empty() {
            String::new()
        } else {
            substitute(&self.new_query, uri.query())
        };

        let location = match (path.is_empty(), query.is_empty()) {
            (true, true) => format!("{scheme}://{host}"),
            (true, false) => format!("{scheme}://{host}?{query}"),
            (false, true) => format!("{scheme}://{host}/{path}"),
            (false, false) => format!("{scheme}://{host}/{path}?{query}"),
        };

        let mut response = Response::new(307);
        response.set_header("Location", &location);
        ctx.send_response(&mut response).await
    }
}

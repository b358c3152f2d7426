//! File provider: serves content below a root directory via the file
//! handler, then merges any configured response headers.

use async_trait::async_trait;

use narthex_config::FileOptions;
use narthex_http::{RequestUri, Response};
use narthex_static::retrieve_file;

use crate::auth::BasicAuth;
use crate::context::{GatewayContext, Outcome};
use crate::provider::{Provider, ProviderCore};

pub struct FileProvider {
    core: ProviderCore,
    root: String,
    default_file: Option<String>,
    default_ext: Option<String>,
    response_headers: Vec<(String, String)>,
}

impl FileProvider {
    pub fn new(uri: &str, target: &str, options: &FileOptions, auth: Option<BasicAuth>) -> Self {
        Self {
            core: ProviderCore::new(uri, target, auth),
            root: target.trim_end_matches(['/', '\\']).to_string(),
            default_file: options.def_file.clone(),
            default_ext: options.def_ext.clone(),
            response_headers: options
                .response_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn dispatch_request(
        &self,
        ctx: &mut GatewayContext,
        uri: RequestUri,
    ) -> anyhow::Result<Outcome> {
        let sub_path = uri.path_info().trim_start_matches('/').to_string();

        let mut response = Response::new(200);
        retrieve_file(
            &ctx.request,
            &mut response,
            &self.root,
            &sub_path,
            self.default_file.as_deref(),
            self.default_ext.as_deref(),
        )
        .await?;

        if (200..300).contains(&response.status()) {
            for (name, value) in &self.response_headers {
                response.set_header(name, value);
            }
        }

        ctx.send_response(&mut response).await
    }
}

//! Server provider: origin forwarding with pooled connections and
//! WebSocket-upgrade escalation into the byte relay.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use narthex_config::{LimitsConfig, ServerOptions};
use narthex_http::uri::substitute;
use narthex_http::{parse_response_head, RequestUri, ResponseHead};
use narthex_net::{BoxedStream, ConnectionPool, PoolHandle, PoolOptions};

use crate::auth::BasicAuth;
use crate::context::{GatewayContext, Outcome};
use crate::provider::{Provider, ProviderCore};
use crate::relay;

pub struct ServerProvider {
    core: ProviderCore,
    forwarder: Forwarder,
}

impl ServerProvider {
    pub fn new(
        uri: &str,
        target: &str,
        options: &ServerOptions,
        auth: Option<BasicAuth>,
        limits: Arc<LimitsConfig>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            core: ProviderCore::new(uri, target, auth),
            forwarder: Forwarder::new(target, true, options, limits)?,
        })
    }
}

#[async_trait]
impl Provider for ServerProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn dispatch_request(
        &self,
        ctx: &mut GatewayContext,
        uri: RequestUri,
    ) -> anyhow::Result<Outcome> {
        self.forwarder.prepare(ctx, &uri);
        match self.forwarder.pool().checkout().await {
            Some(origin) => self.forwarder.forward(ctx, origin).await,
            None => ctx.send_error(503, Some("host unavailable")).await,
        }
    }
}

/// Which endpoint broke during a forward. Client failures discard the
/// context; origin failures surface as `503` where possible.
pub(crate) enum ForwardError {
    Client(anyhow::Error),
    Origin(anyhow::Error),
}

/// The origin-forwarding machinery shared by the server, publisher and
/// subscriber providers: header injection, URI rewriting, and the
/// send-request / receive-response exchange.
pub(crate) struct Forwarder {
    pool: PoolHandle,
    new_host: Option<String>,
    new_path: Option<String>,
    new_query: Option<String>,
    limits: Arc<LimitsConfig>,
}

impl Forwarder {
    pub(crate) fn new(
        target: &str,
        init: bool,
        options: &ServerOptions,
        limits: Arc<LimitsConfig>,
    ) -> anyhow::Result<Self> {
        let (new_path, new_query) = match options.new_uri.as_deref() {
            Some(new_uri) => match new_uri.split_once('?') {
                Some((path, query)) => (Some(path.to_string()), Some(query.to_string())),
                None => (Some(new_uri.to_string()), None),
            },
            None => (None, None),
        };
        if let Some(path) = &new_path {
            if !path.starts_with('/') {
                anyhow::bail!("invalid uri: {}", options.new_uri.as_deref().unwrap_or_default());
            }
        }

        let pool = PoolHandle::acquire(
            target,
            init,
            PoolOptions {
                connect_timeout: Duration::from_secs(limits.origin_connect_timeout_secs),
                max_idle: limits.pool_max_idle_per_endpoint,
            },
        )?;

        Ok(Self {
            pool,
            new_host: None,
            new_path,
            new_query,
            limits,
        }
        .with_new_host(options.new_host.as_deref()))
    }

    fn with_new_host(mut self, new_host: Option<&str>) -> Self {
        self.new_host = new_host.map(str::to_string);
        self
    }

    /// Shared pool reference; in-flight completions hold it so the pool
    /// survives configuration changes that drop the provider.
    pub(crate) fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.pool()
    }

    /// Inject the `Forwarded` header and apply configured host/URI
    /// rewrites onto the current request.
    pub(crate) fn prepare(&self, ctx: &mut GatewayContext, uri: &RequestUri) {
        let fwd_for = ctx
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let fwd_by = ctx
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let fwd_host = ctx.request.host_raw().unwrap_or_default().to_string();
        let fwd_proto = if ctx.is_secure() { "https" } else { "http" };
        ctx.request.add_header(
            "Forwarded",
            &format!("for={fwd_for};by={fwd_by};host={fwd_host};proto={fwd_proto}"),
        );

        if let Some(new_host) = &self.new_host {
            ctx.request.set_host(new_host);
        }

        if self.new_path.is_some() || self.new_query.is_some() {
            // Path substitution consumes the provider-local sub-path, not
            // the full request path.
            let path = match &self.new_path {
                Some(template) => substitute(template, uri.path_info()),
                None => uri.path().to_string(),
            };
            ctx.request.target = match &self.new_query {
                Some(template) => {
                    let query = substitute(template, uri.query());
                    if query.is_empty() {
                        path
                    } else {
                        format!("{path}?{query}")
                    }
                }
                None => path,
            };
        }
    }

    /// Write the request to the origin, then stream the response back to
    /// the client. Escalates to the relay on a websocket `101`.
    pub(crate) async fn forward(
        &self,
        ctx: &mut GatewayContext,
        mut origin: BoxedStream,
    ) -> anyhow::Result<Outcome> {
        // Keeps the pool alive for the whole exchange even if the provider
        // is dropped by a reload mid-flight.
        let pool = self.pool.pool();
        let write_timeout = Duration::from_secs(self.limits.origin_write_timeout_secs);
        let read_timeout = Duration::from_secs(self.limits.origin_read_timeout_secs);

        // 1) Request head.
        let head_bytes = ctx.request.encode_head();
        if let Err(err) = timed_write(&mut origin, &head_bytes, write_timeout).await {
            warn!(target: "narthex::proxy", endpoint = %pool.key(), error = %err, "Origin request write failed");
            return ctx.send_error(503, Some("host unavailable")).await;
        }

        // 2) Request body.
        if ctx.request.has_body() {
            match copy_request_body(ctx, &mut origin, write_timeout).await {
                Ok(()) => {}
                Err(ForwardError::Origin(err)) => {
                    warn!(target: "narthex::proxy", endpoint = %pool.key(), error = %err, "Origin body write failed");
                    return ctx.send_error(503, Some("host unavailable")).await;
                }
                Err(ForwardError::Client(err)) => return Err(err),
            }
        }

        // 3) Response head.
        let mut origin_buf = BytesMut::new();
        let max_head = self.limits.max_response_head_bytes as usize;
        let head = loop {
            match parse_response_head(&origin_buf) {
                Ok(Some(head)) => break head,
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "narthex::proxy", endpoint = %pool.key(), error = %err, "Unparsable origin response");
                    return ctx.send_error(503, Some("host unavailable")).await;
                }
            }
            if max_head > 0 && origin_buf.len() > max_head {
                warn!(target: "narthex::proxy", endpoint = %pool.key(), "Origin response head too large");
                return ctx.send_error(503, Some("host unavailable")).await;
            }
            match read_origin(&mut origin, &mut origin_buf, read_timeout).await {
                Ok(0) => {
                    debug!(target: "narthex::proxy", endpoint = %pool.key(), "Origin closed before response");
                    return ctx.send_error(503, Some("host unavailable")).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "narthex::proxy", endpoint = %pool.key(), error = %err, "Origin response read failed");
                    return ctx.send_error(503, Some("host unavailable")).await;
                }
            }
        };
        let head_bytes = origin_buf.split_to(head.head_len);

        // 4) Upgrade escalation: hand both streams to the relay. No
        // keep-alive iteration may run after this.
        if head.upgrade_websocket {
            let (mut client, client_buf) = ctx.take_stream()?;
            client
                .write_all(&head_bytes)
                .await
                .map_err(|err| anyhow::anyhow!("client write failed during upgrade: {err}"))?;
            info!(
                target: "narthex::proxy",
                endpoint = %pool.key(),
                "101 switching protocols; escalating to relay"
            );
            relay::run(client, &client_buf, origin, &origin_buf).await;
            return Ok(Outcome::Relayed);
        }

        // 5) Forward head and body to the client.
        {
            let (client, _) = ctx.body_source()?;
            client.write_all(&head_bytes).await?;
        }
        let no_body = head.has_no_body(&ctx.request.method);
        let delimited = {
            let (client, _) = ctx.body_source()?;
            match stream_response_body(client, &mut origin, &mut origin_buf, &head, no_body, read_timeout)
                .await
            {
                Ok(delimited) => delimited,
                Err(ForwardError::Origin(err)) => {
                    // Mid-body origin failure: the response is already
                    // partially written, so the client connection cannot be
                    // salvaged either.
                    warn!(target: "narthex::proxy", endpoint = %pool.key(), error = %err, "Origin failed mid-response");
                    return Err(err);
                }
                Err(ForwardError::Client(err)) => return Err(err),
            }
        };

        // 6) Healthy, delimited exchanges give the connection back to the
        // pool; everything else closes it.
        let reusable = delimited && head.allows_reuse();
        if reusable {
            pool.checkin(origin);
        }

        Ok(if reusable && !ctx.request.close_after {
            Outcome::KeepAlive
        } else {
            Outcome::Close
        })
    }
}

async fn timed_write(
    origin: &mut BoxedStream,
    data: &[u8],
    write_timeout: Duration,
) -> anyhow::Result<()> {
    match timeout(write_timeout, origin.write_all(data)).await {
        Ok(res) => {
            res?;
            Ok(())
        }
        Err(_) => anyhow::bail!("origin write timeout"),
    }
}

async fn read_origin(
    origin: &mut BoxedStream,
    buf: &mut BytesMut,
    read_timeout: Duration,
) -> anyhow::Result<usize> {
    let mut tmp = [0u8; 8192];
    let n = match timeout(read_timeout, origin.read(&mut tmp)).await {
        Ok(res) => res?,
        Err(_) => anyhow::bail!("origin read timeout"),
    };
    if n > 0 {
        buf.extend_from_slice(&tmp[..n]);
    }
    Ok(n)
}

/// Stream the request body from the client to the origin, respecting the
/// request's framing.
async fn copy_request_body(
    ctx: &mut GatewayContext,
    origin: &mut BoxedStream,
    write_timeout: Duration,
) -> Result<(), ForwardError> {
    let is_chunked = ctx.request.is_chunked;
    let content_length = ctx.request.content_length;
    let read_timeout = Duration::from_secs(ctx.limits().client_read_timeout_secs);
    let max_body = ctx.limits().max_request_body_bytes as usize;

    {
        let (client, client_buf) = ctx.body_source().map_err(ForwardError::Client)?;
        if is_chunked {
            copy_chunked_request_body(client, client_buf, origin, read_timeout, write_timeout, max_body)
                .await?;
        } else if content_length > 0 {
            if max_body > 0 && content_length > max_body {
                return Err(ForwardError::Client(anyhow::anyhow!(
                    "request body too large"
                )));
            }
            copy_exact(client, client_buf, origin, content_length, read_timeout, write_timeout)
                .await?;
        }
    }
    ctx.mark_body_consumed();
    Ok(())
}

async fn copy_exact(
    client: &mut BoxedStream,
    client_buf: &mut BytesMut,
    origin: &mut BoxedStream,
    mut remaining: usize,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<(), ForwardError> {
    while remaining > 0 {
        if !client_buf.is_empty() {
            let take = remaining.min(client_buf.len());
            let chunk = client_buf.split_to(take);
            timed_write(origin, &chunk, write_timeout)
                .await
                .map_err(ForwardError::Origin)?;
            remaining -= take;
            continue;
        }

        let mut tmp = [0u8; 4096];
        let n = match timeout(read_timeout, client.read(&mut tmp)).await {
            Ok(res) => res.map_err(|e| ForwardError::Client(e.into()))?,
            Err(_) => {
                return Err(ForwardError::Client(anyhow::anyhow!("client read timeout")));
            }
        };
        if n == 0 {
            return Err(ForwardError::Client(anyhow::anyhow!(
                "client closed mid-body"
            )));
        }

        if n > remaining {
            timed_write(origin, &tmp[..remaining], write_timeout)
                .await
                .map_err(ForwardError::Origin)?;
            client_buf.extend_from_slice(&tmp[remaining..n]);
            remaining = 0;
        } else {
            timed_write(origin, &tmp[..n], write_timeout)
                .await
                .map_err(ForwardError::Origin)?;
            remaining -= n;
        }
    }
    Ok(())
}

async fn copy_chunked_request_body(
    client: &mut BoxedStream,
    client_buf: &mut BytesMut,
    origin: &mut BoxedStream,
    read_timeout: Duration,
    write_timeout: Duration,
    max_body: usize,
) -> Result<(), ForwardError> {
    let mut body_bytes = 0usize;

    loop {
        let line = read_client_line(client, client_buf, read_timeout).await?;
        timed_write(origin, &line, write_timeout)
            .await
            .map_err(ForwardError::Origin)?;

        let size_str = std::str::from_utf8(&line[..line.len() - 2])
            .map_err(|_| ForwardError::Client(anyhow::anyhow!("invalid chunk size")))?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ForwardError::Client(anyhow::anyhow!("invalid chunk size")))?;

        if chunk_size == 0 {
            loop {
                let trailer = read_client_line(client, client_buf, read_timeout).await?;
                timed_write(origin, &trailer, write_timeout)
                    .await
                    .map_err(ForwardError::Origin)?;
                if trailer == b"\r\n" {
                    return Ok(());
                }
            }
        }

        body_bytes = body_bytes.saturating_add(chunk_size);
        if max_body > 0 && body_bytes > max_body {
            return Err(ForwardError::Client(anyhow::anyhow!(
                "request body too large"
            )));
        }

        copy_exact(client, client_buf, origin, chunk_size + 2, read_timeout, write_timeout).await?;
    }
}

async fn read_client_line(
    client: &mut BoxedStream,
    client_buf: &mut BytesMut,
    read_timeout: Duration,
) -> Result<Vec<u8>, ForwardError> {
    loop {
        if let Some(pos) = client_buf.windows(2).position(|w| w == b"\r\n") {
            return Ok(client_buf.split_to(pos + 2).to_vec());
        }
        let mut tmp = [0u8; 4096];
        let n = match timeout(read_timeout, client.read(&mut tmp)).await {
            Ok(res) => res.map_err(|e| ForwardError::Client(e.into()))?,
            Err(_) => return Err(ForwardError::Client(anyhow::anyhow!("client read timeout"))),
        };
        if n == 0 {
            return Err(ForwardError::Client(anyhow::anyhow!(
                "client closed mid-body"
            )));
        }
        client_buf.extend_from_slice(&tmp[..n]);
    }
}

/// Stream the origin response body to the client. Returns whether the body
/// was delimited (so the connections can be reused) or EOF-framed.
async fn stream_response_body(
    client: &mut BoxedStream,
    origin: &mut BoxedStream,
    origin_buf: &mut BytesMut,
    head: &ResponseHead,
    no_body: bool,
    read_timeout: Duration,
) -> Result<bool, ForwardError> {
    if no_body {
        return Ok(true);
    }

    if head.is_chunked {
        copy_chunked_response_body(client, origin, origin_buf, read_timeout).await?;
        return Ok(true);
    }

    if let Some(content_length) = head.content_length {
        let mut remaining = content_length;
        while remaining > 0 {
            if origin_buf.is_empty() {
                match read_origin(origin, origin_buf, read_timeout).await {
                    Ok(0) => {
                        return Err(ForwardError::Origin(anyhow::anyhow!(
                            "origin closed before full body"
                        )));
                    }
                    Ok(_) => {}
                    Err(err) => return Err(ForwardError::Origin(err)),
                }
            }
            let take = remaining.min(origin_buf.len());
            let chunk = origin_buf.split_to(take);
            client
                .write_all(&chunk)
                .await
                .map_err(|e| ForwardError::Client(e.into()))?;
            remaining -= take;
        }
        return Ok(true);
    }

    // No framing: stream until EOF. The client connection must close to
    // delimit the body.
    loop {
        if !origin_buf.is_empty() {
            let chunk = origin_buf.split_to(origin_buf.len());
            client
                .write_all(&chunk)
                .await
                .map_err(|e| ForwardError::Client(e.into()))?;
        }
        match read_origin(origin, origin_buf, read_timeout).await {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(err) => return Err(ForwardError::Origin(err)),
        }
    }
}

async fn copy_chunked_response_body(
    client: &mut BoxedStream,
    origin: &mut BoxedStream,
    origin_buf: &mut BytesMut,
    read_timeout: Duration,
) -> Result<(), ForwardError> {
    loop {
        let line = read_origin_line(origin, origin_buf, read_timeout).await?;
        client
            .write_all(&line)
            .await
            .map_err(|e| ForwardError::Client(e.into()))?;

        let size_str = std::str::from_utf8(&line[..line.len() - 2])
            .map_err(|_| ForwardError::Origin(anyhow::anyhow!("invalid chunk size")))?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ForwardError::Origin(anyhow::anyhow!("invalid chunk size")))?;

        if chunk_size == 0 {
            loop {
                let trailer = read_origin_line(origin, origin_buf, read_timeout).await?;
                client
                    .write_all(&trailer)
                    .await
                    .map_err(|e| ForwardError::Client(e.into()))?;
                if trailer == b"\r\n" {
                    return Ok(());
                }
            }
        }

        let mut remaining = chunk_size + 2;
        while remaining > 0 {
            if origin_buf.is_empty() {
                match read_origin(origin, origin_buf, read_timeout).await {
                    Ok(0) => {
                        return Err(ForwardError::Origin(anyhow::anyhow!(
                            "origin closed mid-chunk"
                        )));
                    }
                    Ok(_) => {}
                    Err(err) => return Err(ForwardError::Origin(err)),
                }
            }
            let take = remaining.min(origin_buf.len());
            let chunk = origin_buf.split_to(take);
            client
                .write_all(&chunk)
                .await
                .map_err(|e| ForwardError::Client(e.into()))?;
            remaining -= take;
        }
    }
}

async fn read_origin_line(
    origin: &mut BoxedStream,
    origin_buf: &mut BytesMut,
    read_timeout: Duration,
) -> Result<Vec<u8>, ForwardError> {
    loop {
        if let Some(pos) = origin_buf.windows(2).position(|w| w == b"\r\n") {
            return Ok(origin_buf.split_to(pos + 2).to_vec());
        }
        match read_origin(origin, origin_buf, read_timeout).await {
            Ok(0) => {
                return Err(ForwardError::Origin(anyhow::anyhow!(
                    "origin closed mid-chunk"
                )));
            }
            Ok(_) => {}
            Err(err) => return Err(ForwardError::Origin(err)),
        }
    }
}

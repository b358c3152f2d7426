//! Per-connection gateway context: the keep-alive request loop.
//!
//! One context owns one accepted client stream. It repeatedly reads a
//! request head, resolves the virtual host (by `Host` header, port
//! stripped) and the provider (by decoded URI path), and delegates
//! dispatching. The loop ends when the connection closes, a provider
//! escalates into a relay, or the stream is detached by a reverse-attach
//! provider.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use narthex_config::LimitsConfig;
use narthex_http::{read_request, reason_phrase, Request, RequestUri, Response};
use narthex_net::BoxedStream;

use crate::dispatcher::Dispatcher;
use crate::provider;

/// What a dispatched request did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Response sent; the connection may carry another request.
    KeepAlive,
    /// Response sent; close the connection.
    Close,
    /// The connection was switched into a byte relay and has completed.
    /// No further keep-alive iteration may run.
    Relayed,
    /// The raw stream was handed off (reverse-attach); the context must not
    /// touch it again.
    Detached,
}

pub struct GatewayContext {
    stream: Option<BoxedStream>,
    buf: BytesMut,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    secure: bool,
    dispatcher: Arc<Dispatcher>,
    limits: Arc<LimitsConfig>,
    pub request: Request,
    body_consumed: bool,
}

impl GatewayContext {
    pub(crate) fn new(
        stream: BoxedStream,
        dispatcher: Arc<Dispatcher>,
        limits: Arc<LimitsConfig>,
    ) -> Self {
        let peer = stream.peer_addr();
        let local = stream.local_addr();
        let secure = stream.is_secure();
        Self {
            stream: Some(stream),
            buf: BytesMut::new(),
            peer,
            local,
            secure,
            dispatcher,
            limits,
            request: Request::default(),
            body_consumed: true,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Take ownership of the client stream and any bytes already buffered
    /// beyond the current request head. After this the context is inert.
    pub fn take_stream(&mut self) -> anyhow::Result<(BoxedStream, BytesMut)> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| anyhow::anyhow!("client stream already detached"))?;
        Ok((stream, std::mem::take(&mut self.buf)))
    }

    /// Split borrows for request-body streaming: the client stream plus the
    /// read buffer holding any bytes already received past the head.
    pub fn body_source(&mut self) -> anyhow::Result<(&mut BoxedStream, &mut BytesMut)> {
        match self.stream.as_mut() {
            Some(stream) => Ok((stream, &mut self.buf)),
            None => anyhow::bail!("client stream already detached"),
        }
    }

    /// Providers that consume the request body (origin forwarding) call
    /// this so the keep-alive loop does not try to drain it again.
    pub fn mark_body_consumed(&mut self) {
        self.body_consumed = true;
    }

    /// The keep-alive loop. Runs until the connection retires.
    pub(crate) async fn run(mut self) {
        debug!(
            target: "narthex::context",
            peer = ?self.peer,
            secure = self.secure,
            "Handling new client connection"
        );

        let mut first_request = true;
        loop {
            let idle_timeout = if first_request {
                Duration::from_secs(self.limits.client_read_timeout_secs)
            } else {
                Duration::from_secs(self.limits.keepalive_timeout_secs)
            };
            first_request = false;

            let Some(stream) = self.stream.as_mut() else { break };
            let max_head = self.limits.max_request_head_bytes as usize;
            let read_timeout = Duration::from_secs(self.limits.client_read_timeout_secs);
            let request =
                match read_request(stream.as_mut(), &mut self.buf, max_head, idle_timeout, read_timeout)
                    .await
                {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(err) => {
                        debug!(target: "narthex::context", error = %err, "Client I/O error");
                        break;
                    }
                };

            self.request = request;
            self.body_consumed = !self.request.has_body();

            match self.dispatch().await {
                Ok(Outcome::KeepAlive) => {
                    if self.request.close_after {
                        break;
                    }
                    if !self.body_consumed && self.drain_request_body().await.is_err() {
                        break;
                    }
                }
                Ok(Outcome::Close) => break,
                // Relay and detach have already given the stream away; the
                // context retires with nothing left to close.
                Ok(Outcome::Relayed) | Ok(Outcome::Detached) => break,
                Err(err) => {
                    debug!(target: "narthex::context", error = %err, "Discarding connection");
                    break;
                }
            }
        }

        self.discard();
    }

    /// Host + path resolution, then provider dispatch. Missing host is a
    /// `400`, missing path a `404`.
    async fn dispatch(&mut self) -> anyhow::Result<Outcome> {
        let host_name = match self.request.host() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                debug!(target: "narthex::context", "Request without usable Host header");
                return self.send_error(400, None).await;
            }
        };

        let Some(host) = self.dispatcher.lookup_host(&host_name) else {
            debug!(target: "narthex::context", host = %host_name, "No virtual host for request");
            return self.send_error(400, None).await;
        };

        let mut uri = RequestUri::parse(&self.request.target);
        if uri.path().is_empty() {
            return self.send_error(400, None).await;
        }

        let Some((provider, path_info_pos)) = host.lookup(uri.path()) else {
            debug!(target: "narthex::context", host = %host_name, path = %uri.path(), "No provider for path");
            return self.send_error(404, None).await;
        };
        uri.set_path_info_pos(path_info_pos);

        provider::begin_dispatch(provider, self, uri).await
    }

    /// Send a locally built response, syncing its connection type with the
    /// request so keep-alive survives.
    pub async fn send_response(&mut self, response: &mut Response) -> anyhow::Result<Outcome> {
        response.sync_connection(&self.request);
        let head_only = self.request.method.eq_ignore_ascii_case("HEAD");
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("client stream already detached"))?;
        response.send(stream.as_mut(), head_only).await?;

        Ok(if response.is_keep_alive() && !self.request.close_after {
            Outcome::KeepAlive
        } else {
            Outcome::Close
        })
    }

    /// Trivial error helper; follows the same keep-alive rule as any other
    /// response.
    pub async fn send_error(
        &mut self,
        status: u16,
        reason: Option<&str>,
    ) -> anyhow::Result<Outcome> {
        let mut response = match reason {
            Some(reason) => Response::with_reason(status, reason),
            None => Response::new(status),
        };
        let text = format!("{} {}\n", status, reason.unwrap_or_else(|| reason_phrase(status)));
        response.set_body(text.into_bytes(), "text/plain; charset=utf-8");
        self.send_response(&mut response).await
    }

    fn discard(self) {
        debug!(target: "narthex::context", peer = ?self.peer, "Context discarded");
        // Dropping the context closes whatever streams it still holds.
    }

    /// Discard an unread request body so the next keep-alive request starts
    /// at a message boundary.
    async fn drain_request_body(&mut self) -> anyhow::Result<()> {
        let read_timeout = Duration::from_secs(self.limits.client_read_timeout_secs);
        let max_body = self.limits.max_request_body_bytes as usize;
        let (stream, buf) = match self.stream.as_mut() {
            Some(stream) => (stream, &mut self.buf),
            None => anyhow::bail!("client stream already detached"),
        };

        if self.request.is_chunked {
            drain_chunked(stream, buf, read_timeout, max_body).await?;
        } else {
            drain_exact(stream, buf, self.request.content_length, read_timeout).await?;
        }
        self.body_consumed = true;
        Ok(())
    }
}

async fn read_more(
    stream: &mut BoxedStream,
    buf: &mut BytesMut,
    read_timeout: Duration,
) -> anyhow::Result<usize> {
    let mut tmp = [0u8; 4096];
    let n = match timeout(read_timeout, stream.read(&mut tmp)).await {
        Ok(res) => res?,
        Err(_) => anyhow::bail!("client read timeout"),
    };
    if n > 0 {
        buf.extend_from_slice(&tmp[..n]);
    }
    Ok(n)
}

async fn drain_exact(
    stream: &mut BoxedStream,
    buf: &mut BytesMut,
    mut remaining: usize,
    read_timeout: Duration,
) -> anyhow::Result<()> {
    while remaining > 0 {
        if !buf.is_empty() {
            let take = remaining.min(buf.len());
            buf.advance(take);
            remaining -= take;
            continue;
        }
        if read_more(stream, buf, read_timeout).await? == 0 {
            anyhow::bail!("client closed mid-body");
        }
    }
    Ok(())
}

async fn drain_chunked(
    stream: &mut BoxedStream,
    buf: &mut BytesMut,
    read_timeout: Duration,
    max_body: usize,
) -> anyhow::Result<()> {
    let mut body_bytes = 0usize;
    loop {
        let line = read_line(stream, buf, read_timeout).await?;
        let size_str = std::str::from_utf8(&line[..line.len() - 2])
            .map_err(|_| anyhow::anyhow!("invalid chunk size"))?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .map_err(|_| anyhow::anyhow!("invalid chunk size"))?;

        if chunk_size == 0 {
            loop {
                let trailer = read_line(stream, buf, read_timeout).await?;
                if trailer == b"\r\n" {
                    return Ok(());
                }
            }
        }

        body_bytes = body_bytes.saturating_add(chunk_size);
        if max_body > 0 && body_bytes > max_body {
            warn!(target: "narthex::context", "Request body exceeds limit while draining");
            anyhow::bail!("request body too large");
        }

        drain_exact(stream, buf, chunk_size + 2, read_timeout).await?;
    }
}

async fn read_line(
    stream: &mut BoxedStream,
    buf: &mut BytesMut,
    read_timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            return Ok(buf.split_to(pos + 2).to_vec());
        }
        if read_more(stream, buf, read_timeout).await? == 0 {
            anyhow::bail!("client closed mid-body");
        }
    }
}

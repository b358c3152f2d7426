//! Subscriber provider: the origin-side half of the reverse-attach pair.
//!
//! Keeps one controller WebSocket open to the publisher's acceptor path.
//! Every text frame on that socket is a demand for a new origin
//! connection: the subscriber dials the publisher, issues an
//! `X-SUBSCRIBER-ATTACH` request, and feeds the detached stream into a
//! private dispatcher pinned to this provider's host, so the publisher can
//! drive full requests over it.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use narthex_config::{LimitsConfig, ServerOptions, SubscriberConfig};
use narthex_http::{split_url, RequestUri};
use narthex_net::{Connector, Scheme};

use crate::auth::BasicAuth;
use crate::context::{GatewayContext, Outcome};
use crate::dispatcher::Dispatcher;
use crate::host::GatewayHost;
use crate::provider::publisher::{acceptor_path, ATTACH_METHOD};
use crate::provider::server::Forwarder;
use crate::provider::{Provider, ProviderCore};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

pub struct SubscriberProvider {
    core: ProviderCore,
    /// Ordinary forwarding toward the publisher endpoint for requests that
    /// match this provider's own uri.
    forwarder: Forwarder,
    /// Dial endpoint of the publisher gateway.
    publisher: Connector,
    /// `Host` header (and WebSocket authority) for the publisher.
    publisher_host: String,
    /// `/@subscriber<token>` on the publisher.
    socket_path: String,
    connect_timeout: Duration,
}

impl SubscriberProvider {
    pub fn new(
        cfg: &SubscriberConfig,
        auth: Option<BasicAuth>,
        limits: Arc<LimitsConfig>,
    ) -> anyhow::Result<Arc<Self>> {
        let parts = split_url(&cfg.target);
        let (scheme, default_port) = match parts.scheme.as_str() {
            "http" => (Scheme::Tcp, 80u16),
            "https" => (Scheme::Tls, 443u16),
            other => anyhow::bail!("subscriber target must be an http(s) URL, got '{other}'"),
        };

        let (host, port) = match parts.host.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|_| anyhow::anyhow!("invalid publisher port in '{}'", cfg.target))?,
            ),
            None => (parts.host.clone(), default_port),
        };
        if host.is_empty() {
            anyhow::bail!("subscriber target missing publisher host: '{}'", cfg.target);
        }

        let publisher = Connector::from_parts(scheme, &host, port);
        let token = if parts.path.is_empty() {
            String::new()
        } else {
            format!("/{}", parts.path)
        };

        let connect_timeout = Duration::from_secs(limits.origin_connect_timeout_secs);
        Ok(Arc::new(Self {
            core: ProviderCore::new(&cfg.uri, &cfg.target, auth),
            forwarder: Forwarder::new(
                &publisher.normalized(),
                true,
                &ServerOptions::default(),
                limits,
            )?,
            publisher,
            publisher_host: parts.host,
            socket_path: acceptor_path(&token),
            connect_timeout,
        }))
    }

    /// Start the reconnect loop. Called once the owning host is fully
    /// built; the loop dies with the provider (weak reference) when a
    /// reload drops it.
    pub fn activate(self: &Arc<Self>, host: &Arc<GatewayHost>, limits: Arc<LimitsConfig>) {
        let dispatcher = Dispatcher::pinned(host, limits);
        let weak = Arc::downgrade(self);
        tokio::spawn(connect_loop(weak, dispatcher));
    }

    /// One controller-socket session: dial, handshake, then serve attach
    /// commands until the socket drops.
    async fn run_controller(&self, dispatcher: &Arc<Dispatcher>) -> anyhow::Result<()> {
        let stream = self.publisher.dial(self.connect_timeout).await?;
        let scheme = if self.publisher.is_tls() { "wss" } else { "ws" };
        let url = format!("{}://{}{}", scheme, self.publisher_host, self.socket_path);

        let (mut ws, _response) = tokio_tungstenite::client_async(url.as_str(), stream).await?;
        info!(
            target: "narthex::subscriber",
            publisher = %self.publisher_host,
            "Controller socket connected"
        );

        while let Some(frame) = ws.next().await {
            match frame? {
                // Any text payload is an attach command. Attaches are
                // serialized on this loop, as commands arrive.
                Message::Text(_) => {
                    if let Err(err) = self.send_attach(dispatcher).await {
                        warn!(
                            target: "narthex::subscriber",
                            error = %err,
                            "Attach request failed"
                        );
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        Ok(())
    }

    /// Open a fresh connection to the publisher, issue the attach request,
    /// and hand the stream to the pinned dispatcher. The publisher drives
    /// the next request on it; no response is read here.
    async fn send_attach(&self, dispatcher: &Arc<Dispatcher>) -> anyhow::Result<()> {
        let mut stream = self.publisher.dial(self.connect_timeout).await?;
        let head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: 0\r\n\r\n",
            ATTACH_METHOD, self.socket_path, self.publisher_host
        );
        stream.write_all(head.as_bytes()).await?;
        stream.flush().await?;

        debug!(target: "narthex::subscriber", "Attached reverse connection");
        dispatcher.spawn_stream(stream);
        Ok(())
    }
}

#[async_trait]
impl Provider for SubscriberProvider {
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

/// Retries forever while the provider is alive; one session at a time.
async fn connect_loop(provider: Weak<SubscriberProvider>, dispatcher: Arc<Dispatcher>) {
    loop {
        let Some(subscriber) = provider.upgrade() else { return };
        match subscriber.run_controller(&dispatcher).await {
            Ok(()) => info!(
                target: "narthex::subscriber",
                publisher = %subscriber.publisher_host,
                "Controller socket closed; reconnecting"
            ),
            Err(err) => debug!(
                target: "narthex::subscriber",
                publisher = %subscriber.publisher_host,
                error = %err,
                "Publisher unreachable; will retry"
            ),
        }
        drop(subscriber);
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

//! Publisher provider and its subscriber acceptor.
//!
//! A publisher is a server provider whose pool never dials: origin
//! connections arrive in reverse, opened by a subscriber on demand. The
//! publisher holds one controller WebSocket; when a request finds the pool
//! empty it enqueues itself and sends an attach command text frame. The
//! subscriber answers by opening a fresh connection with the
//! `X-SUBSCRIBER-ATTACH` method, which the acceptor detaches and feeds to
//! the pool, resuming the oldest waiting request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use narthex_config::{LimitsConfig, PublisherConfig};
use narthex_http::{RequestUri, Response};
use narthex_net::BoxedStream;

use crate::auth::BasicAuth;
use crate::context::{GatewayContext, Outcome};
use crate::provider::server::Forwarder;
use crate::provider::{Provider, ProviderCore};

/// Method a subscriber uses to hand the publisher a fresh origin stream.
pub const ATTACH_METHOD: &str = "X-SUBSCRIBER-ATTACH";

/// Well-known path prefix the acceptor is installed at.
pub(crate) fn acceptor_path(target: &str) -> String {
    format!("/@subscriber{target}")
}

struct PublisherState {
    /// Attach-command channel to the controller task; `None` while no
    /// subscriber is connected.
    controller: Option<mpsc::UnboundedSender<()>>,
    /// Requests waiting for a reverse-attached connection, oldest first.
    pending: VecDeque<oneshot::Sender<BoxedStream>>,
}

pub struct PublisherProvider {
    core: ProviderCore,
    forwarder: Forwarder,
    state: Mutex<PublisherState>,
    attach_timeout: Duration,
}

impl PublisherProvider {
    pub fn new(
        cfg: &PublisherConfig,
        auth: Option<BasicAuth>,
        limits: Arc<LimitsConfig>,
    ) -> anyhow::Result<Arc<Self>> {
        let attach_timeout = Duration::from_secs(limits.attach_timeout_secs);
        Ok(Arc::new(Self {
            core: ProviderCore::new(&cfg.uri, &cfg.target, auth),
            // init = false: the pool is fed by reverse attaches, never by
            // dialing.
            forwarder: Forwarder::new(&cfg.target, false, &cfg.options, limits)?,
            state: Mutex::new(PublisherState {
                controller: None,
                pending: VecDeque::new(),
            }),
            attach_timeout,
        }))
    }

    fn has_controller(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .controller
            .is_some()
    }

    /// Queue the caller and ask the controller for a connection. Returns
    /// `None` when no controller is attached (callers see 503).
    fn request_attach(&self) -> Option<oneshot::Receiver<BoxedStream>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let controller = state.controller.as_ref()?;
        let (tx, rx) = oneshot::channel();
        if controller.send(()).is_err() {
            // Controller task already gone; fail fast.
            state.controller = None;
            return None;
        }
        state.pending.push_back(tx);
        Some(rx)
    }

    /// Feed a reverse-attached stream to the oldest waiting request, or
    /// park it in the pool when nobody is waiting.
    pub(crate) fn free_connection(&self, stream: BoxedStream) {
        let mut stream = stream;
        loop {
            let waiter = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.pending.pop_front()
            };
            match waiter {
                None => {
                    self.forwarder.pool().checkin(stream);
                    return;
                }
                Some(tx) => match tx.send(stream) {
                    Ok(()) => return,
                    // Waiter timed out meanwhile; try the next one.
                    Err(returned) => stream = returned,
                },
            }
        }
    }

    /// Install `stream` as the controller socket. Fails when one is already
    /// attached (the caller answers `409`).
    fn attach_controller(self: &Arc<Self>, stream: BoxedStream) -> Result<(), BoxedStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.controller.is_some() {
                return Err(stream);
            }
            state.controller = Some(tx);
        }
        tokio::spawn(controller_task(Arc::downgrade(self), stream, rx));
        Ok(())
    }

    /// Controller gone: clear the slot and fail every pending request fast.
    fn controller_lost(&self) {
        let dropped = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.controller = None;
            state.pending.drain(..).count()
        };
        if dropped > 0 {
            warn!(
                target: "narthex::publisher",
                pending = dropped,
                "Controller lost; failing pending requests"
            );
        }
    }
}

#[async_trait]
impl Provider for PublisherProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn dispatch_request(
        &self,
        ctx: &mut GatewayContext,
        uri: RequestUri,
    ) -> anyhow::Result<Outcome> {
        self.forwarder.prepare(ctx, &uri);

        // An idle reverse connection serves immediately.
        if let Some(origin) = self.forwarder.pool().checkout().await {
            return self.forwarder.forward(ctx, origin).await;
        }

        let Some(rx) = self.request_attach() else {
            debug!(target: "narthex::publisher", "No controller attached");
            return ctx.send_error(503, Some("host unavailable")).await;
        };

        match timeout(self.attach_timeout, rx).await {
            Ok(Ok(origin)) => self.forwarder.forward(ctx, origin).await,
            // Attach timed out, or the controller vanished and the pending
            // queue was drained.
            _ => ctx.send_error(503, Some("host unavailable")).await,
        }
    }
}

/// Owns the controller WebSocket: serializes attach-command frames and
/// watches for the socket closing.
async fn controller_task(
    publisher: Weak<PublisherProvider>,
    stream: BoxedStream,
    mut commands: mpsc::UnboundedReceiver<()>,
) {
    let mut ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    info!(target: "narthex::publisher", "Controller socket attached");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(()) => {
                    if ws.send(Message::Text("attach".to_string())).await.is_err() {
                        break;
                    }
                }
                // Publisher dropped (config reload); close the socket.
                None => break,
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target: "narthex::publisher", error = %err, "Controller socket error");
                    break;
                }
            },
        }
    }

    let _ = ws.close(None).await;
    if let Some(publisher) = publisher.upgrade() {
        publisher.controller_lost();
    }
    info!(target: "narthex::publisher", "Controller socket detached");
}

/// Companion provider installed at `/@subscriber{target}` on the same
/// host. Handles both the controller WebSocket handshake and
/// `X-SUBSCRIBER-ATTACH` connection hand-offs. Holds only a weak reference
/// to its publisher.
pub struct SubscriberAcceptor {
    core: ProviderCore,
    publisher: Weak<PublisherProvider>,
}

impl SubscriberAcceptor {
    pub fn new(publisher: &Arc<PublisherProvider>) -> Self {
        let path = acceptor_path(publisher.core.target());
        Self {
            core: ProviderCore::new(&path, publisher.core.target(), None),
            publisher: Arc::downgrade(publisher),
        }
    }
}

#[async_trait]
impl Provider for SubscriberAcceptor {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn dispatch_request(
        &self,
        ctx: &mut GatewayContext,
        _uri: RequestUri,
    ) -> anyhow::Result<Outcome> {
        let Some(publisher) = self.publisher.upgrade() else {
            return ctx.send_error(503, Some("host unavailable")).await;
        };

        if ctx.request.method == ATTACH_METHOD {
            let (stream, _) = ctx.take_stream()?;
            debug!(target: "narthex::publisher", "Reverse connection attached");
            publisher.free_connection(stream);
            return Ok(Outcome::Detached);
        }

        if ctx.request.is_upgrade("websocket") {
            if publisher.has_controller() {
                return ctx.send_error(409, Some("already connected")).await;
            }
            let Some(key) = ctx.request.header("sec-websocket-key").map(str::to_string) else {
                return ctx.send_error(400, None).await;
            };

            let mut response = Response::new(101);
            response.set_header("Upgrade", "websocket");
            response.set_header("Connection", "Upgrade");
            response.set_header("Sec-WebSocket-Accept", &derive_accept_key(key.as_bytes()));

            {
                let (client, _) = ctx.body_source()?;
                response.send(client.as_mut(), false).await?;
            }

            let (stream, _) = ctx.take_stream()?;
            if publisher.attach_controller(stream).is_err() {
                // Lost the race to another controller; the handshake stream
                // is simply dropped.
                warn!(target: "narthex::publisher", "Controller already attached; dropping socket");
            }
            return Ok(Outcome::Detached);
        }

        ctx.send_error(400, None).await
    }
}

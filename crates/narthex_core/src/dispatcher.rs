//! One listener endpoint: accepts connections, creates gateway contexts,
//! and exposes host lookup against the swappable host map.

use std::sync::{Arc, RwLock, Weak};

use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use narthex_config::LimitsConfig;
use narthex_net::{BoxedStream, Connector};

use crate::context::GatewayContext;
use crate::host::{GatewayHost, GatewayHostMap};

pub struct Dispatcher {
    connector: Option<Connector>,
    label: String,
    tls: Option<TlsAcceptor>,
    host_map: RwLock<Option<Arc<GatewayHostMap>>>,
    /// Private dispatchers (subscriber side) resolve every hostname to one
    /// pinned host instead of consulting a map.
    pinned_host: Option<Weak<GatewayHost>>,
    limits: Arc<LimitsConfig>,
    conn_limit: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Stops the accept loop.
    shutdown: CancellationToken,
    /// Force-closes outstanding contexts after the stop deadline.
    kill: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        connector: Connector,
        tls: Option<TlsAcceptor>,
        host_map: Arc<GatewayHostMap>,
        limits: Arc<LimitsConfig>,
    ) -> Arc<Self> {
        let label = connector.normalized();
        let max_connections = limits.max_connections.max(1);
        Arc::new(Self {
            connector: Some(connector),
            label,
            tls,
            host_map: RwLock::new(Some(host_map)),
            pinned_host: None,
            limits,
            conn_limit: Arc::new(Semaphore::new(max_connections)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            kill: CancellationToken::new(),
        })
    }

    /// A listener-less dispatcher whose lookups always yield `host`. Used
    /// by subscriber providers to drive requests arriving over
    /// reverse-attached streams.
    pub fn pinned(host: &Arc<GatewayHost>, limits: Arc<LimitsConfig>) -> Arc<Self> {
        let max_connections = limits.max_connections.max(1);
        Arc::new(Self {
            connector: None,
            label: "(pinned)".to_string(),
            tls: None,
            host_map: RwLock::new(None),
            pinned_host: Some(Arc::downgrade(host)),
            limits,
            conn_limit: Arc::new(Semaphore::new(max_connections)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            kill: CancellationToken::new(),
        })
    }

    /// The normalized connector string this dispatcher listens on.
    pub fn connector_key(&self) -> &str {
        &self.label
    }

    /// Bind the listener and start accepting. Returns the bound address
    /// (useful when the configured port is 0).
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<std::net::SocketAddr> {
        let connector = self
            .connector
            .clone()
            .ok_or_else(|| anyhow::anyhow!("pinned dispatcher has no listener"))?;
        let listener = connector.bind().await?;
        let addr = listener.local_addr()?;
        info!(
            target: "narthex::dispatcher",
            listener = %self.label,
            tls = self.tls.is_some(),
            "Listener bound"
        );

        let this = self.clone();
        tokio::spawn(async move { this.accept_loop(listener).await });
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: tokio::net::TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (tcp, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(
                        target: "narthex::dispatcher",
                        listener = %self.label,
                        error = %err,
                        "Accept failed"
                    );
                    continue;
                }
            };

            let Ok(permit) = self.conn_limit.clone().acquire_owned().await else {
                break;
            };
            debug!(
                target: "narthex::dispatcher",
                listener = %self.label,
                client = %peer,
                available_permits = self.conn_limit.available_permits(),
                "Connection accepted"
            );

            let this = self.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                let stream: BoxedStream = match &this.tls {
                    Some(acceptor) => match acceptor.accept(tcp).await {
                        Ok(tls) => Box::new(tls),
                        Err(err) => {
                            debug!(
                                target: "narthex::dispatcher",
                                listener = %this.label,
                                client = %peer,
                                error = %err,
                                "TLS handshake failed"
                            );
                            return;
                        }
                    },
                    None => Box::new(tcp),
                };

                this.run_context(stream).await;
            });
        }

        info!(target: "narthex::dispatcher", listener = %self.label, "Accept loop stopped");
    }

    /// Run a context for an externally produced stream (reverse-attach
    /// feeds and tests use this directly).
    pub fn spawn_stream(self: &Arc<Self>, stream: BoxedStream) {
        let this = self.clone();
        self.tracker.spawn(async move {
            this.run_context(stream).await;
        });
    }

    async fn run_context(self: &Arc<Self>, stream: BoxedStream) {
        let context = GatewayContext::new(stream, self.clone(), self.limits.clone());
        tokio::select! {
            _ = self.kill.cancelled() => {
                debug!(target: "narthex::dispatcher", listener = %self.label, "Context force-closed");
            }
            _ = context.run() => {}
        }
    }

    /// Resolve a hostname against the current host map. Concurrent
    /// `set_host_map` callers may observe either map; both are valid.
    pub fn lookup_host(&self, host_name: &str) -> Option<Arc<GatewayHost>> {
        if let Some(pinned) = &self.pinned_host {
            return pinned.upgrade();
        }
        let map = self
            .host_map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()?;
        map.lookup(host_name)
    }

    /// Swap in a freshly built host map. In-flight contexts keep whatever
    /// they already resolved.
    pub fn set_host_map(&self, map: Arc<GatewayHostMap>) {
        *self.host_map.write().unwrap_or_else(|e| e.into_inner()) = Some(map);
    }

    /// Refuse new accepts and join outstanding contexts. Contexts that do
    /// not retire within `deadline` are force-closed.
    pub async fn stop(&self, deadline: Duration) {
        self.shutdown.cancel();
        self.tracker.close();

        if timeout(deadline, self.tracker.wait()).await.is_err() {
            warn!(
                target: "narthex::dispatcher",
                listener = %self.label,
                "Stop deadline exceeded; force-closing contexts"
            );
            self.kill.cancel();
            let _ = timeout(Duration::from_secs(1), self.tracker.wait()).await;
        }

        *self.host_map.write().unwrap_or_else(|e| e.into_inner()) = None;
        info!(target: "narthex::dispatcher", listener = %self.label, "Dispatcher stopped");
    }
}

//! The service application: owns the dispatcher set and the configuration
//! monitor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecursiveMode, Watcher};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{error, info, warn};

use narthex_config::{
    load_hosts, load_service, LimitsConfig, ServiceConfig, HOSTS_CONFIG_FILENAME,
    SERVICE_CONFIG_FILENAME,
};

use crate::auth::{Authenticator, DenyAll};
use crate::build::build_host_maps;
use crate::dispatcher::Dispatcher;
use crate::tls::load_tls_acceptor;

pub struct App {
    config_dir: PathBuf,
    service: ServiceConfig,
    limits: Arc<LimitsConfig>,
    authenticator: Arc<dyn Authenticator>,
    dispatchers: Mutex<HashMap<String, Arc<Dispatcher>>>,
}

impl App {
    /// Load `service.toml` and prepare the app. Host configuration is
    /// loaded by [`App::run`] and again on every file change.
    pub fn new(config_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let config_dir = config_dir.into();
        let service = load_service(&config_dir)?;
        let limits = Arc::new(service.limits.clone());
        Ok(Self {
            config_dir,
            service,
            limits,
            authenticator: Arc::new(DenyAll),
            dispatchers: Mutex::new(HashMap::new()),
        })
    }

    /// Swap in an external credential checker for empty-password users.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Run until ctrl-c: initial host load, config watcher, then graceful
    /// dispatcher shutdown.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.reload_hosts().await?;
        self.clone().spawn_config_watcher()?;

        info!(target: "narthex::app", "Gateway running (ctrl-c to stop)");
        tokio::signal::ctrl_c().await?;
        info!(target: "narthex::app", "Shutting down");

        self.stop_all().await;
        Ok(())
    }

    /// Rebuild the routing tables from `hosts.toml` and apply them:
    /// surviving listeners swap maps in place, removed listeners stop, new
    /// listeners start. A failure leaves the running configuration intact.
    pub async fn reload_hosts(&self) -> anyhow::Result<()> {
        info!(target: "narthex::app", "Loading host configuration");
        let cfg = load_hosts(&self.config_dir)?;
        let mut built = build_host_maps(&cfg, &self.limits, &self.authenticator)?;

        let mut dispatchers = self.dispatchers.lock().await;

        // Swap surviving listeners; collect the ones that disappeared.
        let mut dropped = Vec::new();
        for (key, dispatcher) in dispatchers.iter() {
            match built.maps.remove(key) {
                Some(map) => dispatcher.set_host_map(map),
                None => dropped.push(key.clone()),
            }
        }

        // Start listeners that are new in this configuration.
        for (key, map) in built.maps {
            let Some(connector) = built.connectors.remove(&key) else { continue };

            let tls = if connector.is_tls() {
                match self.service.tls_for(&key) {
                    Some(tls_cfg) => match load_tls_acceptor(tls_cfg) {
                        Ok(acceptor) => Some(acceptor),
                        Err(err) => {
                            error!(
                                target: "narthex::app",
                                listener = %key,
                                error = %err,
                                "Failed to load TLS material; skipping listener"
                            );
                            continue;
                        }
                    },
                    None => {
                        error!(
                            target: "narthex::app",
                            listener = %key,
                            "No TLS entry in service.toml for listener; skipping"
                        );
                        continue;
                    }
                }
            } else {
                None
            };

            let dispatcher = Dispatcher::new(connector, tls, map, self.limits.clone());
            match dispatcher.start().await {
                Ok(_) => {
                    dispatchers.insert(key, dispatcher);
                }
                Err(err) => {
                    error!(
                        target: "narthex::app",
                        listener = %key,
                        error = %err,
                        "Failed to start listener"
                    );
                }
            }
        }

        // Stop listeners no longer present.
        let stop_timeout = Duration::from_secs(self.limits.stop_timeout_secs);
        for key in dropped {
            if let Some(dispatcher) = dispatchers.remove(&key) {
                info!(target: "narthex::app", listener = %key, "Listener removed by reload");
                dispatcher.stop(stop_timeout).await;
            }
        }

        info!(
            target: "narthex::app",
            listeners = dispatchers.len(),
            "Host configuration applied"
        );
        Ok(())
    }

    /// Watch the config directory; a change to either file triggers a
    /// reload. Bad configs are logged and the old routing table retained.
    fn spawn_config_watcher(self: Arc<Self>) -> anyhow::Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Event>(16);

        let mut watcher = notify::recommended_watcher(move |res| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        })?;
        watcher.watch(&self.config_dir, RecursiveMode::NonRecursive)?;

        tokio::spawn(async move {
            // The watcher lives as long as the task.
            let _watcher = watcher;
            while let Some(event) = rx.recv().await {
                if !touches_config(&event) {
                    continue;
                }
                // Editors fire bursts of events; settle, then drain.
                tokio::time::sleep(Duration::from_millis(250)).await;
                while rx.try_recv().is_ok() {}

                if event
                    .paths
                    .iter()
                    .any(|p| file_name_is(p, SERVICE_CONFIG_FILENAME))
                {
                    warn!(
                        target: "narthex::app",
                        "service.toml changed; limits and TLS apply to new listeners only"
                    );
                }

                info!(target: "narthex::app", "Configuration change detected");
                if let Err(err) = self.reload_hosts().await {
                    error!(
                        target: "narthex::app",
                        error = %err,
                        "Reload failed; keeping previous configuration"
                    );
                }
            }
        });

        Ok(())
    }

    async fn stop_all(&self) {
        let stop_timeout = Duration::from_secs(self.limits.stop_timeout_secs);
        let mut dispatchers = self.dispatchers.lock().await;
        for (_, dispatcher) in dispatchers.drain() {
            dispatcher.stop(stop_timeout).await;
        }
    }
}

fn touches_config(event: &notify::Event) -> bool {
    event.paths.iter().any(|p| {
        file_name_is(p, HOSTS_CONFIG_FILENAME) || file_name_is(p, SERVICE_CONFIG_FILENAME)
    })
}

fn file_name_is(path: &Path, name: &str) -> bool {
    path.file_name().map(|f| f == name).unwrap_or(false)
}

//! A virtual host and the per-listener host map.

use std::sync::Arc;

use narthex_router::{FolderIndex, HostMap};

use crate::provider::Provider;

/// One virtual host: a prefix-indexed set of providers. Immutable once
/// built; configuration changes replace the whole structure.
pub struct GatewayHost {
    providers: FolderIndex<Arc<dyn Provider>>,
}

impl GatewayHost {
    pub fn new() -> Self {
        Self {
            providers: FolderIndex::new(),
        }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Bind a provider to a path prefix. Each path may carry one provider.
    pub fn add_provider(&mut self, path: &str, provider: Arc<dyn Provider>) -> anyhow::Result<()> {
        if !self.providers.insert(path, provider) {
            anyhow::bail!("uri '{path}' already has a provider");
        }
        Ok(())
    }

    /// Longest folder-prefix match; also yields the path-info offset the
    /// provider uses to compute its sub-path.
    pub fn lookup(&self, path: &str) -> Option<(Arc<dyn Provider>, usize)> {
        self.providers
            .lookup(path)
            .map(|(provider, pos)| (provider.clone(), pos))
    }
}

impl Default for GatewayHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Hostname → host routing for one listener.
pub type GatewayHostMap = HostMap<Arc<GatewayHost>>;

//! Routing containers for the gateway.
//!
//! Two layers: [`HostMap`] resolves a request hostname (exact names plus
//! `*.suffix` wildcards) to a virtual host, and [`FolderIndex`] resolves a
//! request path to the provider bound to its longest folder prefix.

mod folder;
mod hostmap;

pub use folder::FolderIndex;
pub use hostmap::HostMap;

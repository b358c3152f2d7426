//! Network layer: stream abstraction, connector strings, and the
//! process-wide origin connection-pool registry.

mod connector;
mod pool;
mod stream;

pub use connector::{Connector, Scheme};
pub use pool::{ConnectionPool, PoolHandle, PoolOptions};
pub use stream::{BoxedStream, NetStream};

/// Errors surfaced while resolving connector strings.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("unknown protocol '{0}'")]
    UnknownScheme(String),
    #[error("malformed connector '{0}'")]
    MalformedConnector(String),
}

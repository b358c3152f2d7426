//! Gateway core: per-connection state machine, providers, dispatchers and
//! the service application.

mod app;
mod auth;
mod build;
mod context;
mod dispatcher;
mod host;
pub mod provider;
mod relay;
mod tls;

pub use app::App;
pub use auth::{Authenticator, BasicAuth, DenyAll};
pub use context::{GatewayContext, Outcome};
pub use dispatcher::Dispatcher;
pub use host::{GatewayHost, GatewayHostMap};

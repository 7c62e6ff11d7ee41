//! Session guard for the storefront client.
//!
//! Wrap a [`Transport`] with [`SessionGuard::wrap`]; requests that opt in
//! with [`ApiRequest::refresh_on_unauthorized`] survive an expired session
//! transparently: one refresh runs, and every request rejected meanwhile is
//! replayed once it completes.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod error;
mod guard;
mod refresher;
mod transport;

pub use error::Result;
pub use error::SessionError;
pub use guard::GuardState;
pub use guard::GuardedClient;
pub use guard::Session;
pub use guard::SessionConfig;
pub use guard::SessionGuard;
pub use refresher::DEFAULT_REFRESH_PATH;
pub use refresher::EndpointRefresher;
pub use refresher::SessionRefresher;
pub use transport::ApiRequest;
pub use transport::ApiResponse;
pub use transport::ReqwestTransport;
pub use transport::Transport;
pub use transport::TransportConfig;
pub use transport::TransportError;

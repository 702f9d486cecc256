//! Bridge layer exposing the dispatcher over HTTP and managing the
//! service/tunnel pair.
//!
//! - [`transport`]: axum router for `/` (health, JSON-RPC, preflight)
//! - [`lifecycle`]: [`ServiceManager`] owning server thread, state and tunnel

pub mod lifecycle;
pub mod transport;

pub use lifecycle::ServiceManager;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

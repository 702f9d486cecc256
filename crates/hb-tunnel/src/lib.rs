//! Supervision of the `devtunnel` CLI that exposes the local service on a
//! public URL.

pub mod patterns;
pub mod supervisor;

pub use supervisor::{TunnelObserver, TunnelStartResult, TunnelSupervisor};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("{0} not found")]
    NotInstalled(String),
    #[error("failed to spawn tunnel process: {0}")]
    Spawn(#[source] std::io::Error),
}

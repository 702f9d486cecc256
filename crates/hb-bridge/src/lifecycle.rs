//! Combined start/stop of the HTTP service and the tunnel.
//!
//! The daemon owns exactly one [`ServiceManager`]. The HTTP server runs on a
//! dedicated thread with its own tokio runtime, so the manager itself is
//! plain blocking code and can be driven from any thread.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use axum::Router;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use hb_core::config::Config;
use hb_core::state::{ServiceStatus, StateStore, TunnelStatus};
use hb_harness::dispatcher::{Dispatcher, ServerIdentity};
use hb_harness::mcp::ToolRegistry;
use hb_tunnel::{TunnelObserver, TunnelSupervisor};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::{transport, BridgeError};

/// Forwards supervisor callbacks into the state store.
struct StateTunnelObserver {
    state: Arc<StateStore>,
}

impl TunnelObserver for StateTunnelObserver {
    fn on_status_change(&self, status: TunnelStatus, error: &str) {
        // The public URL is only valid while the host is Running.
        if status != TunnelStatus::Running && !self.state.tunnel_url().is_empty() {
            self.state.set_tunnel_url("", false);
        }
        self.state.set_tunnel_status(status, error);
    }

    fn on_url_ready(&self, url: &str) {
        self.state.set_tunnel_url(url, true);
    }
}

/// The server thread and the means to stop it.
struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    thread: JoinHandle<()>,
    done: Receiver<()>,
}

struct Active {
    server: ServerHandle,
    tunnel: Option<Arc<TunnelSupervisor>>,
}

pub struct ServiceManager {
    config: Config,
    state: Arc<StateStore>,
    dispatcher: Arc<Dispatcher>,
    active: Mutex<Option<Active>>,
}

impl ServiceManager {
    pub fn new(config: Config, registry: ToolRegistry) -> Self {
        let state = Arc::new(StateStore::new(config.server.port));
        let identity = ServerIdentity {
            name: config.server.name.clone(),
            version: config.server.version.clone(),
            protocol_version: config.server.protocol_version.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(identity, registry, state.clone()));
        Self {
            config,
            state,
            dispatcher,
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> Arc<StateStore> {
        self.state.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn tunnel_running(&self) -> bool {
        self.lock()
            .as_ref()
            .and_then(|a| a.tunnel.as_ref())
            .is_some_and(|t| t.is_running())
    }

    /// Address the server is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(|a| a.server.local_addr)
    }

    /// Start serving and, when asked, the tunnel. Returns `false` when
    /// already started or when the listener cannot be set up. A tunnel that
    /// fails to come up leaves the service running.
    pub fn start(&self, with_tunnel: bool) -> bool {
        let tunnel = {
            let mut active = self.lock();
            if active.is_some() {
                warn!("service already started");
                return false;
            }

            self.state.set_service_status(ServiceStatus::Starting, "");
            let server = match self.bind().and_then(|listener| self.spawn_server(listener)) {
                Ok(server) => server,
                Err(e) => {
                    error!(error = %e, "failed to start service");
                    self.state.set_service_status(ServiceStatus::Error, e.to_string());
                    return false;
                }
            };

            let local_addr = server.local_addr;
            self.state.set_port(local_addr.port());
            self.state.set_service_status(ServiceStatus::Running, "");
            info!(%local_addr, "service running");

            let tunnel = with_tunnel.then(|| {
                let observer = Arc::new(StateTunnelObserver {
                    state: self.state.clone(),
                });
                Arc::new(TunnelSupervisor::new(
                    self.config.tunnel.clone(),
                    local_addr.port(),
                    observer,
                ))
            });
            *active = Some(Active {
                server,
                tunnel: tunnel.clone(),
            });
            tunnel
        };

        if let Some(tunnel) = tunnel {
            let result = tunnel.start();
            if result.success {
                info!(url = result.url.as_deref().unwrap_or_default(), "tunnel ready");
            } else {
                warn!(
                    status = %result.status,
                    error = result.error.as_deref().unwrap_or_default(),
                    "tunnel failed to start, service stays up"
                );
            }
        }
        true
    }

    /// Stop the tunnel, then the server. Returns `false` when not started.
    pub fn stop(&self) -> bool {
        let Some(active) = self.lock().take() else {
            return false;
        };

        if let Some(tunnel) = &active.tunnel {
            tunnel.stop();
        }

        let server = active.server;
        let _ = server.shutdown_tx.send(());
        match server.done.recv_timeout(self.config.server.shutdown_timeout()) {
            Err(RecvTimeoutError::Timeout) => warn!("server thread did not stop in time, detaching"),
            _ => {
                if server.thread.join().is_err() {
                    error!("server thread panicked");
                }
            }
        }

        self.state.set_service_status(ServiceStatus::Stopped, "");
        info!("service stopped");
        true
    }

    fn lock(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bind(&self) -> Result<TcpListener, BridgeError> {
        let addr = format!("{}:{}", self.config.server.bind_host, self.config.server.port);
        let listener = TcpListener::bind(&addr).map_err(|source| BridgeError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| BridgeError::Bind { addr, source })?;
        Ok(listener)
    }

    fn spawn_server(&self, listener: TcpListener) -> Result<ServerHandle, BridgeError> {
        let local_addr = listener.local_addr().map_err(BridgeError::Io)?;
        let app = transport::router(self.dispatcher.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done) = bounded::<()>(0);
        let state = self.state.clone();

        let thread = thread::Builder::new()
            .name("hb-transport".into())
            .spawn(move || {
                let _done = done_tx;
                if let Err(e) = serve(listener, app, shutdown_rx) {
                    error!(error = %e, "server exited with error");
                    state.set_service_status(ServiceStatus::Error, e.to_string());
                }
            })
            .map_err(BridgeError::Io)?;

        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            thread,
            done,
        })
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the router on `listener` until `shutdown` fires.
fn serve(listener: TcpListener, app: Router, shutdown: oneshot::Receiver<()>) -> Result<(), BridgeError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("hb-transport-worker")
        .enable_all()
        .build()
        .map_err(BridgeError::Io)?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener).map_err(BridgeError::Io)?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown.await;
            })
            .await
            .map_err(BridgeError::Io)
    })
}

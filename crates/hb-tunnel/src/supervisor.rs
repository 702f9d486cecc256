//! Supervisor for a `devtunnel host` child process.
//!
//! The child's stdout and stderr are each drained by a reader thread into
//! one line channel. A monitor thread consumes that channel, pulls the
//! public URL out of the output and reports status changes to a
//! [`TunnelObserver`]. [`TunnelSupervisor::start`] blocks on a one-shot
//! ready signal from the monitor, bounded by the startup timeout.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use hb_core::config::TunnelConfig;
use hb_core::state::TunnelStatus;
use tracing::{debug, info, warn};

use crate::patterns::{find_connect_url, requires_login};
use crate::TunnelError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receives status and URL changes from the supervisor and its monitor
/// thread. Called without any supervisor lock held.
pub trait TunnelObserver: Send + Sync {
    fn on_status_change(&self, status: TunnelStatus, error: &str);
    fn on_url_ready(&self, url: &str);
}

/// Outcome of [`TunnelSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStartResult {
    pub success: bool,
    pub url: Option<String>,
    pub status: TunnelStatus,
    pub error: Option<String>,
}

impl TunnelStartResult {
    fn failed(status: TunnelStatus, error: impl Into<String>) -> Self {
        Self {
            success: false,
            url: None,
            status,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared status
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Current {
    status: TunnelStatus,
    error: Option<String>,
    url: Option<String>,
}

/// Status visible to both the supervisor and its monitor thread.
struct Shared {
    current: Mutex<Current>,
    observer: Arc<dyn TunnelObserver>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Current> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Any status other than Running invalidates the public URL.
    fn set_status(&self, status: TunnelStatus, error: &str) {
        {
            let mut cur = self.lock();
            cur.status = status;
            cur.error = (!error.is_empty()).then(|| error.to_string());
            if status != TunnelStatus::Running {
                cur.url = None;
            }
        }
        info!(%status, error, "tunnel status changed");
        self.observer.on_status_change(status, error);
    }

    fn set_url(&self, url: &str) {
        self.lock().url = Some(url.to_string());
        self.observer.on_url_ready(url);
    }

    fn clear_url(&self) {
        self.lock().url = None;
    }
}

/// Handles for one spawned host process.
struct Running {
    child: Child,
    stop_requested: Arc<AtomicBool>,
    stop_tx: Sender<()>,
    monitor: JoinHandle<()>,
    monitor_done: Receiver<()>,
}

// ---------------------------------------------------------------------------
// TunnelSupervisor
// ---------------------------------------------------------------------------

pub struct TunnelSupervisor {
    config: TunnelConfig,
    port: u16,
    shared: Arc<Shared>,
    process: Mutex<Option<Running>>,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig, port: u16, observer: Arc<dyn TunnelObserver>) -> Self {
        Self {
            config,
            port,
            shared: Arc::new(Shared {
                current: Mutex::new(Current::default()),
                observer,
            }),
            process: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> TunnelStatus {
        self.shared.lock().status
    }

    pub fn url(&self) -> Option<String> {
        self.shared.lock().url.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.shared.lock().error.clone()
    }

    /// True while a host process exists and has not exited.
    pub fn is_running(&self) -> bool {
        let mut process = self.lock_process();
        match process.as_mut() {
            Some(running) => matches!(running.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Start hosting the local port and wait for the public URL.
    pub fn start(&self) -> TunnelStartResult {
        let exited = {
            let mut process = self.lock_process();
            let alive = match process.as_mut() {
                Some(running) => matches!(running.child.try_wait(), Ok(None)),
                None => false,
            };
            if alive {
                drop(process);
                return self.already_running();
            }
            process.take()
        };
        // Reap a host that died on its own before anything replaces it, so its
        // monitor cannot report over the new process.
        if let Some(old) = exited {
            debug!("reaping exited tunnel process");
            self.shutdown(old);
        }

        let exe = self.config.executable.as_str();
        if which::which(exe).is_err() {
            let msg = format!("{exe} CLI is not installed (install: winget install Microsoft.devtunnel)");
            self.shared.set_status(TunnelStatus::NotInstalled, &msg);
            return TunnelStartResult::failed(TunnelStatus::NotInstalled, msg);
        }

        if !self.probe_login() {
            let msg = format!("{exe} login required (run: {exe} user login)");
            self.shared.set_status(TunnelStatus::NotLoggedIn, &msg);
            return TunnelStartResult::failed(TunnelStatus::NotLoggedIn, msg);
        }

        let (ready_tx, ready_rx) = bounded(1);
        {
            let mut process = self.lock_process();
            if process.is_some() {
                // Another start() won the race.
                drop(process);
                return self.already_running();
            }
            self.shared.set_status(TunnelStatus::Starting, "");
            match self.spawn_host(ready_tx) {
                Ok(running) => *process = Some(running),
                Err(e) => {
                    let status = match e {
                        TunnelError::NotInstalled(_) => TunnelStatus::NotInstalled,
                        _ => TunnelStatus::Error,
                    };
                    let msg = e.to_string();
                    drop(process);
                    self.shared.set_status(status, &msg);
                    return TunnelStartResult::failed(status, msg);
                }
            }
        }

        let timeout = Duration::from_secs(self.config.startup_timeout_secs);
        match ready_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                let msg = format!(
                    "timed out waiting for tunnel URL ({}s)",
                    self.config.startup_timeout_secs
                );
                self.shared.set_status(TunnelStatus::Error, &msg);
                self.terminate();
                TunnelStartResult::failed(TunnelStatus::Error, msg)
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let (status, url, error) = {
                    let cur = self.shared.lock();
                    (cur.status, cur.url.clone(), cur.error.clone())
                };
                if status == TunnelStatus::Running {
                    TunnelStartResult {
                        success: true,
                        url,
                        status,
                        error: None,
                    }
                } else {
                    self.terminate();
                    TunnelStartResult {
                        success: false,
                        url: None,
                        status,
                        error: Some(error.unwrap_or_else(|| format!("tunnel did not start ({status})"))),
                    }
                }
            }
        }
    }

    /// Stop the host process. Returns `false` when nothing was running.
    pub fn stop(&self) -> bool {
        let Some(running) = self.take_process() else {
            debug!("stop requested with no tunnel process");
            return false;
        };
        self.shutdown(running);
        self.shared.set_status(TunnelStatus::Stopped, "");
        true
    }

    /// The process is alive, but its output may since have reported a
    /// failure; report what the monitor last saw.
    fn already_running(&self) -> TunnelStartResult {
        let cur = self.shared.lock();
        TunnelStartResult {
            success: cur.status == TunnelStatus::Running,
            url: cur.url.clone(),
            status: cur.status,
            error: cur.error.clone(),
        }
    }

    fn lock_process(&self) -> MutexGuard<'_, Option<Running>> {
        self.process.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_process(&self) -> Option<Running> {
        self.lock_process().take()
    }

    /// Kill the process after a failed start, keeping the failure status.
    fn terminate(&self) {
        if let Some(running) = self.take_process() {
            self.shutdown(running);
        }
        self.shared.clear_url();
    }

    /// `<exe> user show` must exit successfully within the probe timeout.
    fn probe_login(&self) -> bool {
        let mut child = match Command::new(&self.config.executable)
            .args(["user", "show"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "login probe failed to spawn");
                return false;
            }
        };

        let deadline = Instant::now() + Duration::from_secs(self.config.login_probe_timeout_secs);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return status.success(),
                Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                Ok(None) => {
                    warn!("login probe timed out");
                    let _ = child.kill();
                    let _ = child.wait();
                    return false;
                }
                Err(e) => {
                    warn!(error = %e, "login probe wait failed");
                    let _ = child.kill();
                    return false;
                }
            }
        }
    }

    fn spawn_host(&self, ready_tx: Sender<()>) -> Result<Running, TunnelError> {
        let port = self.port.to_string();
        let mut cmd = Command::new(&self.config.executable);
        cmd.args(["host", "-p", port.as_str()]);
        if self.config.allow_anonymous {
            cmd.arg("--allow-anonymous");
        }
        info!(exe = %self.config.executable, port = self.port, "starting tunnel host");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TunnelError::NotInstalled(self.config.executable.clone()),
                _ => TunnelError::Spawn(e),
            })?;

        let (line_tx, line_rx) = unbounded();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader("tunnel-stdout", stdout, line_tx.clone())?;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader("tunnel-stderr", stderr, line_tx.clone())?;
        }
        drop(line_tx);

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = bounded(1);
        let (done_tx, monitor_done) = bounded::<()>(0);
        let monitor = Monitor {
            shared: self.shared.clone(),
            lines: line_rx,
            stop_rx,
            stop_requested: stop_requested.clone(),
            ready_tx,
        };
        let monitor = thread::Builder::new()
            .name("tunnel-monitor".into())
            .spawn(move || {
                let _done = done_tx;
                monitor.run();
            })
            .map_err(TunnelError::Spawn)?;

        Ok(Running {
            child,
            stop_requested,
            stop_tx,
            monitor,
            monitor_done,
        })
    }

    /// Graceful termination, escalate to kill, then bounded monitor join.
    fn shutdown(&self, mut running: Running) {
        running.stop_requested.store(true, Ordering::SeqCst);
        let _ = running.stop_tx.try_send(());

        request_termination(&mut running.child);
        let deadline = Instant::now() + Duration::from_secs(self.config.stop_timeout_secs);
        let exited = loop {
            match running.child.try_wait() {
                Ok(Some(_)) => break true,
                Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                _ => break false,
            }
        };
        if !exited {
            warn!("tunnel process ignored termination request, killing");
            let _ = running.child.kill();
            let _ = running.child.wait();
        }
        info!("tunnel process stopped");

        let join_timeout = Duration::from_secs(self.config.join_timeout_secs);
        match running.monitor_done.recv_timeout(join_timeout) {
            Err(RecvTimeoutError::Timeout) => warn!("tunnel monitor did not finish, detaching"),
            _ => {
                let _ = running.monitor.join();
            }
        }
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        if let Some(running) = self.take_process() {
            self.shutdown(running);
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    let Ok(pid) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: pid belongs to a child we have not reaped yet.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.kill();
}

fn spawn_reader<R>(name: &str, stream: R, tx: Sender<String>) -> Result<(), TunnelError>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .map(|_| ())
        .map_err(TunnelError::Spawn)
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

struct Monitor {
    shared: Arc<Shared>,
    lines: Receiver<String>,
    stop_rx: Receiver<()>,
    stop_requested: Arc<AtomicBool>,
    ready_tx: Sender<()>,
}

impl Monitor {
    fn run(self) {
        let mut url_found = false;
        loop {
            select! {
                recv(self.stop_rx) -> _ => break,
                recv(self.lines) -> msg => match msg {
                    Ok(line) => self.handle_line(&line, &mut url_found),
                    Err(_) => {
                        if !self.stop_requested.load(Ordering::SeqCst) {
                            self.shared.set_status(TunnelStatus::Error, "tunnel process exited unexpectedly");
                        }
                        break;
                    }
                },
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
        }
        // Release a start() still waiting when stop() interrupts it.
        self.signal_ready();
        debug!("tunnel monitor exiting");
    }

    fn handle_line(&self, raw: &str, url_found: &mut bool) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }
        debug!(target: "devtunnel", "{line}");

        if requires_login(line) {
            self.shared
                .set_status(TunnelStatus::NotLoggedIn, "devtunnel login required");
            self.signal_ready();
            return;
        }

        if *url_found {
            return;
        }
        if let Some(url) = find_connect_url(line) {
            *url_found = true;
            info!(%url, "tunnel url discovered");
            self.shared.set_url(&url);
            self.shared.set_status(TunnelStatus::Running, "");
            self.signal_ready();
        }
    }

    fn signal_ready(&self) {
        let _ = self.ready_tx.try_send(());
    }
}

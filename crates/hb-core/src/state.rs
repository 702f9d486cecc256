use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum number of request log entries kept in memory.
pub const MAX_REQUEST_LOGS: usize = 100;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle of the local JSON-RPC service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle of the external tunnel process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
    NotInstalled,
    NotLoggedIn,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Stopped => write!(f, "stopped"),
            TunnelStatus::Starting => write!(f, "starting"),
            TunnelStatus::Running => write!(f, "running"),
            TunnelStatus::Error => write!(f, "error"),
            TunnelStatus::NotInstalled => write!(f, "not_installed"),
            TunnelStatus::NotLoggedIn => write!(f, "not_logged_in"),
        }
    }
}

// ---------------------------------------------------------------------------
// Request log
// ---------------------------------------------------------------------------

/// Store-assigned identifier of a request log entry.
pub type RequestLogId = u64;

/// One JSON-RPC request as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    /// Assigned by [`StateStore::append_request_log`]; ignored on input.
    pub id: RequestLogId,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_arguments: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw text sent to the local model, if the tool called one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_input: Option<String>,
    /// Raw text returned by the local model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl RequestLogEntry {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            method: method.into(),
            request_id: None,
            tool_name: None,
            tool_arguments: None,
            response: None,
            error: None,
            model_input: None,
            model_output: None,
            duration_ms: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        self.tool_name = Some(name.into());
        self.tool_arguments = Some(arguments);
        self
    }

    /// True once the completion update has been applied.
    pub fn is_complete(&self) -> bool {
        self.response.is_some() || self.error.is_some()
    }
}

/// Completion fields for a log entry. `None` fields leave the entry untouched.
#[derive(Debug, Clone, Default)]
pub struct RequestLogUpdate {
    pub response: Option<Value>,
    pub error: Option<String>,
    pub model_input: Option<String>,
    pub model_output: Option<String>,
    pub duration_ms: Option<f64>,
}

// ---------------------------------------------------------------------------
// Snapshot + observer
// ---------------------------------------------------------------------------

/// Point-in-time copy of the whole state, handed to observers and pollers.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub service_status: ServiceStatus,
    pub service_error: String,
    pub port: u16,
    pub local_url: String,
    pub tunnel_status: TunnelStatus,
    pub tunnel_error: String,
    pub tunnel_url: String,
    /// True when `tunnel_url` came from the tunnel process output rather than
    /// being entered by hand.
    pub tunnel_auto_discovered: bool,
    pub request_logs: Vec<RequestLogEntry>,
}

impl StateSnapshot {
    pub fn is_running(&self) -> bool {
        self.service_status == ServiceStatus::Running
    }
}

/// Receives every state change, one call per mutation, with no store lock
/// held. A mutation made from inside the callback is delivered as a nested
/// call before the outer one returns.
pub trait StateObserver: Send + Sync {
    fn on_state_changed(&self, snapshot: &StateSnapshot);
}

impl<F> StateObserver for F
where
    F: Fn(&StateSnapshot) + Send + Sync,
{
    fn on_state_changed(&self, snapshot: &StateSnapshot) {
        self(snapshot)
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

struct Inner {
    service_status: ServiceStatus,
    service_error: String,
    port: u16,
    local_url: String,
    tunnel_status: TunnelStatus,
    tunnel_error: String,
    tunnel_url: String,
    tunnel_auto_discovered: bool,
    request_logs: VecDeque<RequestLogEntry>,
    next_log_id: RequestLogId,
}

impl Inner {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            service_status: self.service_status,
            service_error: self.service_error.clone(),
            port: self.port,
            local_url: self.local_url.clone(),
            tunnel_status: self.tunnel_status,
            tunnel_error: self.tunnel_error.clone(),
            tunnel_url: self.tunnel_url.clone(),
            tunnel_auto_discovered: self.tunnel_auto_discovered,
            request_logs: self.request_logs.iter().cloned().collect(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe container for service status, tunnel status, URLs and the
/// bounded request history.
///
/// Every mutation runs under one mutex, and the observer is called after that
/// mutex is released. A re-entrant notify guard spans mutation plus
/// notification, so observers see changes in mutation order and an observer
/// may call back into the store from its own thread.
pub struct StateStore {
    inner: Mutex<Inner>,
    observer: Mutex<Option<Arc<dyn StateObserver>>>,
    notify: ReentrantMutex<()>,
}

impl StateStore {
    pub fn new(port: u16) -> Self {
        Self {
            inner: Mutex::new(Inner {
                service_status: ServiceStatus::Stopped,
                service_error: String::new(),
                port,
                local_url: String::new(),
                tunnel_status: TunnelStatus::Stopped,
                tunnel_error: String::new(),
                tunnel_url: String::new(),
                tunnel_auto_discovered: false,
                request_logs: VecDeque::with_capacity(MAX_REQUEST_LOGS),
                next_log_id: 1,
            }),
            observer: Mutex::new(None),
            notify: ReentrantMutex::new(()),
        }
    }

    /// Register the observer. Replaces any previous one.
    pub fn set_observer(&self, observer: Arc<dyn StateObserver>) {
        *lock(&self.observer) = Some(observer);
    }

    pub fn clear_observer(&self) {
        *lock(&self.observer) = None;
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let _order = self.notify.lock();
        let observer = lock(&self.observer).clone();
        let (result, snapshot) = {
            let mut inner = lock(&self.inner);
            let result = f(&mut inner);
            let snapshot = observer.as_ref().map(|_| inner.snapshot());
            (result, snapshot)
        };
        if let (Some(observer), Some(snapshot)) = (observer, snapshot) {
            observer.on_state_changed(&snapshot);
        }
        result
    }

    pub fn set_port(&self, port: u16) {
        self.mutate(|s| {
            s.port = port;
            if s.service_status == ServiceStatus::Running {
                s.local_url = local_url_for(port);
            }
        });
    }

    /// Running derives the local URL from the port; Stopped clears both URLs.
    pub fn set_service_status(&self, status: ServiceStatus, error: impl Into<String>) {
        let error = error.into();
        self.mutate(|s| {
            s.service_status = status;
            s.service_error = error;
            match status {
                ServiceStatus::Running => s.local_url = local_url_for(s.port),
                ServiceStatus::Stopped => {
                    s.local_url.clear();
                    s.tunnel_url.clear();
                }
                _ => {}
            }
        });
    }

    pub fn set_tunnel_url(&self, url: impl Into<String>, auto_discovered: bool) {
        let url = url.into();
        self.mutate(|s| {
            s.tunnel_url = url;
            s.tunnel_auto_discovered = auto_discovered;
        });
    }

    pub fn set_tunnel_status(&self, status: TunnelStatus, error: impl Into<String>) {
        let error = error.into();
        self.mutate(|s| {
            s.tunnel_status = status;
            s.tunnel_error = error;
        });
    }

    /// Append an entry, evicting the oldest beyond [`MAX_REQUEST_LOGS`].
    pub fn append_request_log(&self, mut entry: RequestLogEntry) -> RequestLogId {
        self.mutate(|s| {
            let id = s.next_log_id;
            s.next_log_id += 1;
            entry.id = id;
            s.request_logs.push_back(entry);
            while s.request_logs.len() > MAX_REQUEST_LOGS {
                s.request_logs.pop_front();
            }
            id
        })
    }

    /// Apply completion fields to an existing entry in place. Returns false
    /// when the entry has already been evicted or cleared.
    pub fn update_request_log(&self, id: RequestLogId, update: RequestLogUpdate) -> bool {
        self.mutate(|s| {
            let Some(entry) = s.request_logs.iter_mut().find(|e| e.id == id) else {
                return false;
            };
            if let Some(response) = update.response {
                entry.response = Some(response);
            }
            if let Some(error) = update.error {
                entry.error = Some(error);
            }
            if let Some(input) = update.model_input {
                entry.model_input = Some(input);
            }
            if let Some(output) = update.model_output {
                entry.model_output = Some(output);
            }
            if let Some(duration) = update.duration_ms {
                entry.duration_ms = Some(duration);
            }
            true
        })
    }

    pub fn clear_logs(&self) {
        self.mutate(|s| s.request_logs.clear());
    }

    /// The newest `count` entries, oldest first.
    pub fn recent_logs(&self, count: usize) -> Vec<RequestLogEntry> {
        let inner = lock(&self.inner);
        let skip = inner.request_logs.len().saturating_sub(count);
        inner.request_logs.iter().skip(skip).cloned().collect()
    }

    pub fn log_count(&self) -> usize {
        lock(&self.inner).request_logs.len()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        lock(&self.inner).snapshot()
    }

    pub fn service_status(&self) -> ServiceStatus {
        lock(&self.inner).service_status
    }

    pub fn tunnel_status(&self) -> TunnelStatus {
        lock(&self.inner).tunnel_status
    }

    pub fn tunnel_url(&self) -> String {
        lock(&self.inner).tunnel_url.clone()
    }

    pub fn is_running(&self) -> bool {
        self.service_status() == ServiceStatus::Running
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PORT)
    }
}

fn local_url_for(port: u16) -> String {
    format!("http://localhost:{port}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn running_sets_local_url_and_stopped_clears_urls() {
        let store = StateStore::new(8081);
        store.set_service_status(ServiceStatus::Running, "");
        store.set_tunnel_url("https://abc.devtunnels.ms", true);

        let snap = store.snapshot();
        assert_eq!(snap.local_url, "http://localhost:8081");
        assert_eq!(snap.tunnel_url, "https://abc.devtunnels.ms");
        assert!(snap.tunnel_auto_discovered);

        store.set_service_status(ServiceStatus::Stopped, "");
        let snap = store.snapshot();
        assert!(snap.local_url.is_empty());
        assert!(snap.tunnel_url.is_empty());
    }

    #[test]
    fn error_status_keeps_message() {
        let store = StateStore::new(9000);
        store.set_service_status(ServiceStatus::Error, "address in use");
        let snap = store.snapshot();
        assert_eq!(snap.service_status, ServiceStatus::Error);
        assert_eq!(snap.service_error, "address in use");
        assert!(snap.local_url.is_empty());
    }

    #[test]
    fn set_port_refreshes_local_url_while_running() {
        let store = StateStore::new(0);
        store.set_service_status(ServiceStatus::Running, "");
        store.set_port(43210);
        assert_eq!(store.snapshot().local_url, "http://localhost:43210");
    }

    #[test]
    fn log_capacity_evicts_oldest() {
        let store = StateStore::new(8081);
        for i in 0..150 {
            store.append_request_log(RequestLogEntry::new(format!("m{i}")));
        }
        assert_eq!(store.log_count(), MAX_REQUEST_LOGS);
        let logs = store.recent_logs(1000);
        assert_eq!(logs.len(), MAX_REQUEST_LOGS);
        assert_eq!(logs[0].method, "m50");
        assert_eq!(logs[99].method, "m149");
    }

    #[test]
    fn recent_logs_returns_newest_in_arrival_order() {
        let store = StateStore::new(8081);
        for i in 0..5 {
            store.append_request_log(RequestLogEntry::new(format!("m{i}")));
        }
        let methods: Vec<String> = store.recent_logs(3).into_iter().map(|e| e.method).collect();
        assert_eq!(methods, vec!["m2", "m3", "m4"]);
        assert!(store.recent_logs(0).is_empty());
    }

    #[test]
    fn update_applies_in_place_without_duplicating() {
        let store = StateStore::new(8081);
        let id = store.append_request_log(RequestLogEntry::new("tools/call"));
        let updated = store.update_request_log(
            id,
            RequestLogUpdate {
                response: Some(serde_json::json!({"ok": true})),
                duration_ms: Some(12.5),
                ..Default::default()
            },
        );
        assert!(updated);

        let logs = store.recent_logs(10);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].duration_ms, Some(12.5));
        assert!(logs[0].is_complete());
        assert!(logs[0].error.is_none());
    }

    #[test]
    fn update_of_evicted_entry_is_ignored() {
        let store = StateStore::new(8081);
        let id = store.append_request_log(RequestLogEntry::new("initialize"));
        store.clear_logs();
        assert!(!store.update_request_log(id, RequestLogUpdate::default()));
        assert_eq!(store.log_count(), 0);
    }

    #[test]
    fn observer_sees_every_mutation() {
        let store = StateStore::new(8081);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store.set_observer(Arc::new(move |_: &StateSnapshot| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        store.set_service_status(ServiceStatus::Starting, "");
        store.set_tunnel_status(TunnelStatus::Starting, "");
        store.append_request_log(RequestLogEntry::new("initialize"));
        store.clear_logs();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn last_observer_registration_wins() {
        let store = StateStore::new(8081);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        store.set_observer(Arc::new(move |_: &StateSnapshot| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let s = second.clone();
        store.set_observer(Arc::new(move |_: &StateSnapshot| {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        store.set_tunnel_url("https://x.devtunnels.ms", false);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_snapshot_reflects_completed_mutation() {
        let store = StateStore::new(8081);
        store.set_observer(Arc::new(|snap: &StateSnapshot| {
            assert_eq!(snap.tunnel_status, TunnelStatus::NotInstalled);
            assert_eq!(snap.tunnel_error, "missing");
        }));
        store.set_tunnel_status(TunnelStatus::NotInstalled, "missing");
    }

    #[test]
    fn observer_may_mutate_store_from_callback() {
        let store = Arc::new(StateStore::new(8081));
        store.set_tunnel_url("https://stale.devtunnels.ms", true);

        let weak = Arc::downgrade(&store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.set_observer(Arc::new(move |snap: &StateSnapshot| {
            sink.lock().unwrap().push((snap.tunnel_status, snap.tunnel_url.clone()));
            if snap.tunnel_status == TunnelStatus::Error && !snap.tunnel_url.is_empty() {
                if let Some(store) = weak.upgrade() {
                    store.set_tunnel_url("", false);
                }
            }
        }));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let writer = store.clone();
        std::thread::spawn(move || {
            writer.set_tunnel_status(TunnelStatus::Error, "tunnel process exited unexpectedly");
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(std::time::Duration::from_secs(3))
            .expect("mutation from inside the observer completes");

        assert!(store.snapshot().tunnel_url.is_empty());
        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (TunnelStatus::Error, "https://stale.devtunnels.ms".to_string()),
                (TunnelStatus::Error, String::new()),
            ]
        );

        // Later mutations from other threads still go through.
        store.set_tunnel_status(TunnelStatus::Stopped, "");
        assert_eq!(store.tunnel_status(), TunnelStatus::Stopped);
    }

    #[test]
    fn observer_may_replace_itself_from_callback() {
        let store = Arc::new(StateStore::new(8081));
        let weak = Arc::downgrade(&store);
        let replaced = Arc::new(AtomicUsize::new(0));
        let counter = replaced.clone();
        store.set_observer(Arc::new(move |_: &StateSnapshot| {
            if let Some(store) = weak.upgrade() {
                let counter = counter.clone();
                store.set_observer(Arc::new(move |_: &StateSnapshot| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }));

        store.set_service_status(ServiceStatus::Starting, "");
        store.set_service_status(ServiceStatus::Running, "");
        assert_eq!(replaced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_display_is_snake_case() {
        assert_eq!(TunnelStatus::NotLoggedIn.to_string(), "not_logged_in");
        assert_eq!(ServiceStatus::Running.to_string(), "running");
        let json = serde_json::to_string(&TunnelStatus::NotInstalled).unwrap();
        assert_eq!(json, "\"not_installed\"");
    }
}

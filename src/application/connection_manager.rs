// Connection manager - One update stream per tracked machine with bounded retries
use crate::application::command_service::CommandDispatcher;
use crate::application::console_backend::{BackendError, ConsoleBackend, FrameStream};
use crate::application::session_store::SessionStore;
use crate::application::state_store::StoreHandle;
use crate::domain::event::{EventOrigin, RawEvent};
use crate::domain::machine::MachineId;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub reconnect_interval: Duration,
    pub max_consecutive_failures: u32,
    /// Silence longer than this is treated as a dropped stream.
    pub heartbeat_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            max_consecutive_failures: 3,
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub consecutive_failures: u32,
    /// Retries stopped and the session was dropped.
    pub abandoned: bool,
    pub last_error: Option<String>,
}

struct Connection {
    task: JoinHandle<()>,
    status: watch::Receiver<ConnectionStatus>,
}

pub struct ConnectionManager {
    backend: Arc<dyn ConsoleBackend>,
    store: StoreHandle,
    dispatcher: Arc<CommandDispatcher>,
    sessions: Arc<dyn SessionStore>,
    settings: StreamSettings,
    connections: Mutex<HashMap<MachineId, Connection>>,
}

impl ConnectionManager {
    pub fn new(
        backend: Arc<dyn ConsoleBackend>,
        store: StoreHandle,
        dispatcher: Arc<CommandDispatcher>,
        sessions: Arc<dyn SessionStore>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            backend,
            store,
            dispatcher,
            sessions,
            settings,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Start streaming `machine_id`, stamping events with `epoch`.
    /// Returns false when a live connection already exists.
    pub fn connect(&self, machine_id: MachineId, epoch: u64) -> bool {
        let mut connections = self.connections();
        if connections
            .get(&machine_id)
            .is_some_and(|connection| !connection.task.is_finished())
        {
            return false;
        }

        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        let worker = StreamWorker {
            machine_id,
            epoch,
            backend: self.backend.clone(),
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            sessions: self.sessions.clone(),
            settings: self.settings,
            status: status_tx,
        };
        let task = tokio::spawn(worker.run());
        connections.insert(machine_id, Connection { task, status });
        tracing::info!(machine_id = %machine_id, epoch, "Connecting update stream");
        true
    }

    /// True while a stream task is running or waiting to reconnect.
    pub fn is_live(&self, machine_id: MachineId) -> bool {
        self.connections()
            .get(&machine_id)
            .is_some_and(|connection| !connection.task.is_finished())
    }

    /// Close the stream and cancel any pending reconnect.
    pub fn disconnect(&self, machine_id: MachineId) -> bool {
        match self.connections().remove(&machine_id) {
            Some(connection) => {
                connection.task.abort();
                tracing::info!(machine_id = %machine_id, "Disconnected update stream");
                true
            }
            None => false,
        }
    }

    pub fn status(&self, machine_id: MachineId) -> Option<ConnectionStatus> {
        self.connections()
            .get(&machine_id)
            .map(|connection| connection.status.borrow().clone())
    }

    pub fn watch_status(&self, machine_id: MachineId) -> Option<watch::Receiver<ConnectionStatus>> {
        self.connections()
            .get(&machine_id)
            .map(|connection| connection.status.clone())
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<MachineId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for connection in self.connections().values() {
            connection.task.abort();
        }
    }
}

struct StreamWorker {
    machine_id: MachineId,
    epoch: u64,
    backend: Arc<dyn ConsoleBackend>,
    store: StoreHandle,
    dispatcher: Arc<CommandDispatcher>,
    sessions: Arc<dyn SessionStore>,
    settings: StreamSettings,
    status: watch::Sender<ConnectionStatus>,
}

impl StreamWorker {
    async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            let error = match self.backend.open_stream(self.machine_id).await {
                Ok(stream) => {
                    failures = 0;
                    self.status.send_modify(|status| {
                        status.connected = true;
                        status.consecutive_failures = 0;
                    });
                    tracing::info!(machine_id = %self.machine_id, "Update stream open");

                    let outcome = self
                        .dispatcher
                        .refresh_context(self.machine_id, EventOrigin::Command)
                        .await;
                    if !outcome.success {
                        tracing::warn!(
                            machine_id = %self.machine_id,
                            error = ?outcome.error,
                            "Context fetch after open failed"
                        );
                    }

                    self.pump(stream).await
                }
                Err(e) => e,
            };

            failures += 1;
            self.status.send_modify(|status| {
                status.connected = false;
                status.consecutive_failures = failures;
                status.last_error = Some(error.to_string());
            });

            if error.is_unauthorized() || failures >= self.settings.max_consecutive_failures {
                self.abandon(&error, failures).await;
                return;
            }

            tracing::warn!(
                machine_id = %self.machine_id,
                failures,
                error = %error,
                retry_in_secs = self.settings.reconnect_interval.as_secs(),
                "Update stream failed, reconnecting"
            );
            tokio::time::sleep(self.settings.reconnect_interval).await;
        }
    }

    /// Forward frames until the stream fails, ends or goes silent.
    async fn pump(&self, mut stream: FrameStream) -> BackendError {
        loop {
            match tokio::time::timeout(self.settings.heartbeat_timeout, stream.next()).await {
                Err(_) => {
                    return BackendError::HeartbeatTimeout(self.settings.heartbeat_timeout.as_secs());
                }
                Ok(None) => return BackendError::StreamClosed,
                Ok(Some(Err(e))) => return e,
                Ok(Some(Ok(frame))) => self.forward(&frame).await,
            }
        }
    }

    async fn forward(&self, frame: &str) {
        let payload: Value = match serde_json::from_str(frame.trim()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(machine_id = %self.machine_id, error = %e, "Dropping unparsable frame");
                return;
            }
        };
        if is_heartbeat(&payload) {
            tracing::trace!(machine_id = %self.machine_id, "Heartbeat");
            return;
        }
        if let Err(e) = self
            .store
            .enqueue(self.machine_id, Some(self.epoch), RawEvent::from_stream(payload))
            .await
        {
            tracing::error!(machine_id = %self.machine_id, error = %e, "Dropping frame");
        }
    }

    async fn abandon(&self, error: &BackendError, failures: u32) {
        tracing::error!(
            machine_id = %self.machine_id,
            failures,
            error = %error,
            "Abandoning update stream and clearing session"
        );
        if let Err(e) = self.sessions.clear().await {
            tracing::warn!(machine_id = %self.machine_id, error = %e, "Failed to clear session");
        }
        self.status.send_modify(|status| {
            status.connected = false;
            status.abandoned = true;
        });
    }
}

fn is_heartbeat(payload: &Value) -> bool {
    payload.get("type").and_then(Value::as_str) == Some("heartbeat")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::console_backend::fake::FakeBackend;
    use crate::application::reconciler::ReconcileSettings;
    use crate::application::session_store::PersistedSession;
    use crate::application::session_store::memory::MemorySessionStore;
    use serde_json::json;
    use tokio::sync::broadcast;

    fn id(raw: u64) -> MachineId {
        MachineId::new(raw).unwrap()
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        sessions: Arc<MemorySessionStore>,
        store: StoreHandle,
        manager: ConnectionManager,
    }

    fn harness(settings: StreamSettings) -> Harness {
        let backend = Arc::new(FakeBackend::new());
        let sessions = Arc::new(MemorySessionStore::with(PersistedSession::active("9")));
        let (alerts, _) = broadcast::channel(8);
        let store = StoreHandle::spawn(ReconcileSettings::default(), alerts);
        let dispatcher = Arc::new(CommandDispatcher::new(
            backend.clone(),
            store.clone(),
            sessions.clone(),
        ));
        let manager = ConnectionManager::new(
            backend.clone(),
            store.clone(),
            dispatcher,
            sessions.clone(),
            settings,
        );
        Harness {
            backend,
            sessions,
            store,
            manager,
        }
    }

    async fn wait_for_status(
        manager: &ConnectionManager,
        machine_id: MachineId,
        done: impl Fn(&ConnectionStatus) -> bool,
    ) -> ConnectionStatus {
        let mut receiver = manager.watch_status(machine_id).unwrap();
        loop {
            {
                let status = receiver.borrow_and_update();
                if done(&status) {
                    return status.clone();
                }
            }
            receiver.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_fetches_context_and_forwards_frames() {
        let h = harness(StreamSettings::default());
        h.backend.set_context(json!({"id": 1, "nome": "Press A", "velocidade": 10}));
        h.backend.push_stream(&[
            r#"{"type": "heartbeat"}"#,
            "not json",
            r#"{"type": "velocidade", "velocidade": 25}"#,
        ]);

        let epoch = h.store.track(id(1)).await.unwrap();
        let mut views = h.store.watch(id(1)).await.unwrap().unwrap();
        assert!(h.manager.connect(id(1), epoch));
        assert!(!h.manager.connect(id(1), epoch));

        loop {
            views.changed().await.unwrap();
            let speed = views.borrow().as_ref().map(|view| view.machine.speed);
            if speed == Some(25.0) {
                break;
            }
        }
        let view = h.store.view(id(1)).await.unwrap().unwrap();
        assert_eq!(view.machine.name, "Press A");
        assert_eq!(view.revision, 2);

        let status = h.manager.status(id(1)).unwrap();
        assert!(status.connected);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(h.backend.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandons_after_repeated_failures() {
        let h = harness(StreamSettings::default());
        for _ in 0..3 {
            h.backend
                .push_open_failure(BackendError::Transport("connection refused".to_string()));
        }

        let epoch = h.store.track(id(1)).await.unwrap();
        h.manager.connect(id(1), epoch);

        let status = wait_for_status(&h.manager, id(1), |status| status.abandoned).await;
        assert_eq!(status.consecutive_failures, 3);
        assert!(!status.connected);
        assert!(status.last_error.unwrap().contains("connection refused"));
        assert_eq!(h.backend.opens(), 3);
        assert_eq!(h.sessions.current(), PersistedSession::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_abandons_immediately() {
        let h = harness(StreamSettings::default());
        h.backend.push_open_failure(BackendError::Unauthorized(401));

        let epoch = h.store.track(id(1)).await.unwrap();
        h.manager.connect(id(1), epoch);

        let status = wait_for_status(&h.manager, id(1), |status| status.abandoned).await;
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(h.backend.opens(), 1);
        assert_eq!(h.sessions.clear_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_failures() {
        let h = harness(StreamSettings::default());
        h.backend
            .push_open_failure(BackendError::Transport("reset".to_string()));
        h.backend
            .push_open_failure(BackendError::Transport("reset".to_string()));
        h.backend
            .push_broken_stream(&[], BackendError::Transport("dropped".to_string()));
        h.backend
            .push_open_failure(BackendError::Transport("reset".to_string()));
        h.backend.push_stream(&[]);

        let epoch = h.store.track(id(1)).await.unwrap();
        h.manager.connect(id(1), epoch);

        let status = wait_for_status(&h.manager, id(1), |status| {
            status.connected && h.backend.opens() >= 5
        })
        .await;
        assert!(!status.abandoned);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(h.sessions.clear_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out() {
        let settings = StreamSettings {
            max_consecutive_failures: 1,
            ..StreamSettings::default()
        };
        let h = harness(settings);

        let epoch = h.store.track(id(1)).await.unwrap();
        h.manager.connect(id(1), epoch);

        let status = wait_for_status(&h.manager, id(1), |status| status.abandoned).await;
        assert_eq!(
            status.last_error.as_deref(),
            Some("no frame received for 60 seconds")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_allows_reconnect() {
        let h = harness(StreamSettings::default());
        let epoch = h.store.track(id(1)).await.unwrap();

        assert!(h.manager.connect(id(1), epoch));
        assert!(h.manager.disconnect(id(1)));
        assert!(h.manager.status(id(1)).is_none());
        assert!(!h.manager.disconnect(id(1)));
        assert!(h.manager.connect(id(1), epoch));
    }

    #[test]
    fn test_heartbeat_detection() {
        assert!(is_heartbeat(&json!({"type": "heartbeat"})));
        assert!(!is_heartbeat(&json!({"type": "sinal"})));
        assert!(!is_heartbeat(&json!("heartbeat")));
    }
}

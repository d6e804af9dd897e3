// Console service - Subscriptions, resyncs and commands for the HTTP layer
use crate::application::command_service::CommandDispatcher;
use crate::application::connection_manager::{ConnectionManager, ConnectionStatus, StreamSettings};
use crate::application::console_backend::ConsoleBackend;
use crate::application::reconciler::ReconcileSettings;
use crate::application::session_store::SessionStore;
use crate::application::state_store::{StoreClosed, StoreHandle, ViewReceiver};
use crate::domain::command::{CommandOutcome, ConsoleCommand};
use crate::domain::event::{EventOrigin, ProductionAlert};
use crate::domain::machine::{MachineId, MachineView};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Everything the UI shows for one machine.
#[derive(Debug, Clone, Serialize)]
pub struct MachineState {
    pub machine_id: MachineId,
    /// `None` until the first full context arrives.
    pub view: Option<Arc<MachineView>>,
    pub connection: Option<ConnectionStatus>,
    pub last_command_error: Option<String>,
}

pub struct ConsoleService {
    store: StoreHandle,
    connections: ConnectionManager,
    /// Held across track + connect so a stream always carries the store's current epoch.
    subscriptions: Mutex<()>,
    dispatcher: Arc<CommandDispatcher>,
    alerts: broadcast::Sender<ProductionAlert>,
}

impl ConsoleService {
    pub fn new(
        backend: Arc<dyn ConsoleBackend>,
        sessions: Arc<dyn SessionStore>,
        reconcile: ReconcileSettings,
        stream: StreamSettings,
    ) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        let store = StoreHandle::spawn(reconcile, alerts.clone());
        let dispatcher = Arc::new(CommandDispatcher::new(
            backend.clone(),
            store.clone(),
            sessions.clone(),
        ));
        let connections =
            ConnectionManager::new(backend, store.clone(), dispatcher.clone(), sessions, stream);
        Self {
            store,
            connections,
            subscriptions: Mutex::new(()),
            dispatcher,
            alerts,
        }
    }

    /// Track a machine and open its stream. Returns false when it was already live.
    pub async fn subscribe(&self, machine_id: MachineId) -> Result<bool, StoreClosed> {
        let _guard = self.subscriptions.lock().await;
        if self.connections.is_live(machine_id) {
            return Ok(false);
        }
        let epoch = self.store.track(machine_id).await?;
        Ok(self.connections.connect(machine_id, epoch))
    }

    /// Close the stream and drop the view. Late events for the machine are discarded.
    pub async fn unsubscribe(&self, machine_id: MachineId) -> Result<bool, StoreClosed> {
        let _guard = self.subscriptions.lock().await;
        self.connections.disconnect(machine_id);
        self.store.untrack(machine_id).await
    }

    /// Operator-requested full resync. `None` when the machine is not tracked.
    pub async fn resync(&self, machine_id: MachineId) -> Result<Option<CommandOutcome>, StoreClosed> {
        if !self.store.is_tracked(machine_id).await? {
            return Ok(None);
        }
        Ok(Some(
            self.dispatcher
                .refresh_context(machine_id, EventOrigin::Resync)
                .await,
        ))
    }

    pub async fn execute(
        &self,
        machine_id: MachineId,
        command: &ConsoleCommand,
    ) -> Result<Option<CommandOutcome>, StoreClosed> {
        if !self.store.is_tracked(machine_id).await? {
            return Ok(None);
        }
        Ok(Some(self.dispatcher.execute(machine_id, command).await))
    }

    pub async fn machine_state(&self, machine_id: MachineId) -> Result<Option<MachineState>, StoreClosed> {
        if !self.store.is_tracked(machine_id).await? {
            return Ok(None);
        }
        Ok(Some(MachineState {
            machine_id,
            view: self.store.view(machine_id).await?,
            connection: self.connections.status(machine_id),
            last_command_error: self.dispatcher.last_error(machine_id),
        }))
    }

    pub async fn watch(&self, machine_id: MachineId) -> Result<Option<ViewReceiver>, StoreClosed> {
        self.store.watch(machine_id).await
    }

    pub fn alerts(&self) -> broadcast::Receiver<ProductionAlert> {
        self.alerts.subscribe()
    }
}

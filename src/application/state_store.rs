// State store actor - Single owner of every reconciled machine view
use crate::application::normalizer::{normalize, NormalizeError, Normalized};
use crate::application::reconciler::{reconcile, Reconciliation, ReconcileSettings, RejectReason};
use crate::domain::event::{ProductionAlert, RawEvent};
use crate::domain::machine::{MachineId, MachineView};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

const STORE_QUEUE_CAPACITY: usize = 1024;

pub type ViewReceiver = watch::Receiver<Option<Arc<MachineView>>>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("state store is not running")]
pub struct StoreClosed;

/// Result of feeding one raw event through normalization and reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied { revision: u64 },
    Unchanged,
    Rejected(RejectReason),
    Malformed(NormalizeError),
    Ignored(&'static str),
    Alert,
    /// Machine not tracked, or the event came from an older subscription.
    Discarded,
}

struct TrackedMachine {
    epoch: u64,
    view: Option<Arc<MachineView>>,
    publisher: watch::Sender<Option<Arc<MachineView>>>,
}

/// Reconciled views keyed by machine id. Only mutated through [`MachineStore::apply`].
pub struct MachineStore {
    machines: HashMap<MachineId, TrackedMachine>,
    next_epoch: u64,
    settings: ReconcileSettings,
    alerts: broadcast::Sender<ProductionAlert>,
}

impl MachineStore {
    pub fn new(settings: ReconcileSettings, alerts: broadcast::Sender<ProductionAlert>) -> Self {
        Self {
            machines: HashMap::new(),
            next_epoch: 0,
            settings,
            alerts,
        }
    }

    /// Start tracking a machine and return the epoch its stream must stamp events
    /// with. Tracking again keeps the view and only moves the epoch forward.
    pub fn track(&mut self, machine_id: MachineId) -> u64 {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.machines
            .entry(machine_id)
            .and_modify(|tracked| tracked.epoch = epoch)
            .or_insert_with(|| {
                let (publisher, _) = watch::channel(None);
                TrackedMachine {
                    epoch,
                    view: None,
                    publisher,
                }
            });
        epoch
    }

    /// Forget a machine. Open watchers see their channel close.
    pub fn untrack(&mut self, machine_id: MachineId) -> bool {
        self.machines.remove(&machine_id).is_some()
    }

    pub fn is_tracked(&self, machine_id: MachineId) -> bool {
        self.machines.contains_key(&machine_id)
    }

    pub fn view(&self, machine_id: MachineId) -> Option<Arc<MachineView>> {
        self.machines
            .get(&machine_id)
            .and_then(|tracked| tracked.view.clone())
    }

    pub fn watch(&self, machine_id: MachineId) -> Option<ViewReceiver> {
        self.machines
            .get(&machine_id)
            .map(|tracked| tracked.publisher.subscribe())
    }

    /// Normalize and merge one event. `epoch` is set for stream events and must
    /// match the current subscription.
    pub fn apply(
        &mut self,
        machine_id: MachineId,
        epoch: Option<u64>,
        raw: &RawEvent,
        now: DateTime<Utc>,
    ) -> ApplyOutcome {
        let Some(tracked) = self.machines.get_mut(&machine_id) else {
            tracing::debug!(machine_id = %machine_id, tag = %raw.tag, "Discarding event for untracked machine");
            return ApplyOutcome::Discarded;
        };
        if epoch.is_some_and(|epoch| epoch != tracked.epoch) {
            tracing::debug!(
                machine_id = %machine_id,
                tag = %raw.tag,
                event_epoch = ?epoch,
                current_epoch = tracked.epoch,
                "Discarding event from previous subscription"
            );
            return ApplyOutcome::Discarded;
        }

        let event = match normalize(raw, machine_id) {
            Ok(Normalized::Event(event)) => event,
            Ok(Normalized::Alert(alert)) => {
                tracing::info!(machine_id = %machine_id, kind = ?alert.kind, percent = alert.percent, "Production alert");
                // No receiver just means no UI client is listening.
                let _ = self.alerts.send(alert);
                return ApplyOutcome::Alert;
            }
            Ok(Normalized::Ignored(reason)) => return ApplyOutcome::Ignored(reason),
            Err(e) => {
                tracing::warn!(machine_id = %machine_id, tag = %raw.tag, error = %e, "Dropping malformed event");
                return ApplyOutcome::Malformed(e);
            }
        };

        match reconcile(tracked.view.as_ref(), machine_id, &event, now, &self.settings) {
            Reconciliation::Applied(view) => {
                let revision = view.revision;
                tracing::debug!(
                    machine_id = %machine_id,
                    kind = event.kind.as_str(),
                    origin = ?event.origin,
                    target = %event.target,
                    revision,
                    "Applied event"
                );
                tracked.view = Some(view.clone());
                tracked.publisher.send_replace(Some(view));
                ApplyOutcome::Applied { revision }
            }
            Reconciliation::Unchanged => ApplyOutcome::Unchanged,
            Reconciliation::Rejected(reason) => {
                tracing::warn!(
                    machine_id = %machine_id,
                    kind = event.kind.as_str(),
                    target = %event.target,
                    reason = %reason,
                    "Rejected event"
                );
                ApplyOutcome::Rejected(reason)
            }
        }
    }

    fn handle(&mut self, message: StoreMessage) {
        match message {
            StoreMessage::Track { machine_id, reply } => {
                let _ = reply.send(self.track(machine_id));
            }
            StoreMessage::Untrack { machine_id, reply } => {
                let _ = reply.send(self.untrack(machine_id));
            }
            StoreMessage::Apply {
                machine_id,
                epoch,
                raw,
                reply,
            } => {
                let outcome = self.apply(machine_id, epoch, &raw, Utc::now());
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            StoreMessage::IsTracked { machine_id, reply } => {
                let _ = reply.send(self.is_tracked(machine_id));
            }
            StoreMessage::View { machine_id, reply } => {
                let _ = reply.send(self.view(machine_id));
            }
            StoreMessage::Watch { machine_id, reply } => {
                let _ = reply.send(self.watch(machine_id));
            }
        }
    }
}

pub enum StoreMessage {
    Track {
        machine_id: MachineId,
        reply: oneshot::Sender<u64>,
    },
    Untrack {
        machine_id: MachineId,
        reply: oneshot::Sender<bool>,
    },
    Apply {
        machine_id: MachineId,
        epoch: Option<u64>,
        raw: RawEvent,
        reply: Option<oneshot::Sender<ApplyOutcome>>,
    },
    IsTracked {
        machine_id: MachineId,
        reply: oneshot::Sender<bool>,
    },
    View {
        machine_id: MachineId,
        reply: oneshot::Sender<Option<Arc<MachineView>>>,
    },
    Watch {
        machine_id: MachineId,
        reply: oneshot::Sender<Option<ViewReceiver>>,
    },
}

/// Cloneable sender side of the store actor.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreMessage>,
}

impl StoreHandle {
    /// Spawn the actor task that owns a [`MachineStore`].
    pub fn spawn(settings: ReconcileSettings, alerts: broadcast::Sender<ProductionAlert>) -> Self {
        let (tx, mut rx) = mpsc::channel(STORE_QUEUE_CAPACITY);
        let mut store = MachineStore::new(settings, alerts);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                store.handle(message);
            }
            tracing::debug!("State store stopped");
        });
        Self { tx }
    }

    pub async fn track(&self, machine_id: MachineId) -> Result<u64, StoreClosed> {
        self.request(|reply| StoreMessage::Track { machine_id, reply })
            .await
    }

    pub async fn untrack(&self, machine_id: MachineId) -> Result<bool, StoreClosed> {
        self.request(|reply| StoreMessage::Untrack { machine_id, reply })
            .await
    }

    /// Queue an event without waiting for it to be merged.
    pub async fn enqueue(
        &self,
        machine_id: MachineId,
        epoch: Option<u64>,
        raw: RawEvent,
    ) -> Result<(), StoreClosed> {
        self.tx
            .send(StoreMessage::Apply {
                machine_id,
                epoch,
                raw,
                reply: None,
            })
            .await
            .map_err(|_| StoreClosed)
    }

    /// Queue an event and wait for its outcome.
    pub async fn apply(
        &self,
        machine_id: MachineId,
        epoch: Option<u64>,
        raw: RawEvent,
    ) -> Result<ApplyOutcome, StoreClosed> {
        self.request(|reply| StoreMessage::Apply {
            machine_id,
            epoch,
            raw,
            reply: Some(reply),
        })
        .await
    }

    pub async fn is_tracked(&self, machine_id: MachineId) -> Result<bool, StoreClosed> {
        self.request(|reply| StoreMessage::IsTracked { machine_id, reply })
            .await
    }

    pub async fn view(&self, machine_id: MachineId) -> Result<Option<Arc<MachineView>>, StoreClosed> {
        self.request(|reply| StoreMessage::View { machine_id, reply })
            .await
    }

    pub async fn watch(&self, machine_id: MachineId) -> Result<Option<ViewReceiver>, StoreClosed> {
        self.request(|reply| StoreMessage::Watch { machine_id, reply })
            .await
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> StoreMessage,
    ) -> Result<T, StoreClosed> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(message(reply))
            .await
            .map_err(|_| StoreClosed)?;
        response.await.map_err(|_| StoreClosed)
    }
}

// Command dispatcher - Production commands whose responses feed the state store
use crate::application::console_backend::{BackendError, ConsoleBackend};
use crate::application::session_store::{PersistedSession, SessionStore};
use crate::application::state_store::{ApplyOutcome, StoreHandle};
use crate::domain::command::{ApiResponse, CommandOutcome, ConsoleCommand};
use crate::domain::event::{EventOrigin, RawEvent};
use crate::domain::machine::MachineId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

pub struct CommandDispatcher {
    backend: Arc<dyn ConsoleBackend>,
    store: StoreHandle,
    sessions: Arc<dyn SessionStore>,
    last_errors: Mutex<HashMap<MachineId, String>>,
}

impl CommandDispatcher {
    pub fn new(
        backend: Arc<dyn ConsoleBackend>,
        store: StoreHandle,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            backend,
            store,
            sessions,
            last_errors: Mutex::new(HashMap::new()),
        }
    }

    /// Send a command. A successful response with data is merged like any other
    /// event; a failure only records the error.
    pub async fn execute(&self, machine_id: MachineId, command: &ConsoleCommand) -> CommandOutcome {
        let request = command.to_request(machine_id);
        tracing::info!(
            machine_id = %machine_id,
            command = command.name(),
            path = request.path,
            "Sending command"
        );

        let response = match self.backend.post_command(&request).await {
            Ok(response) => response,
            Err(e) => return self.transport_failure(machine_id, command.name(), e).await,
        };
        if !response.success {
            return self.rejected(machine_id, command.name(), response);
        }

        match command {
            ConsoleCommand::StartSession { .. } => {
                let session = PersistedSession {
                    active_session_id: response.data.as_ref().and_then(session_id),
                    session_active: true,
                };
                if let Err(e) = self.sessions.save(&session).await {
                    tracing::warn!(machine_id = %machine_id, error = %e, "Failed to persist session");
                }
            }
            ConsoleCommand::EndSession => {
                if let Err(e) = self.sessions.clear().await {
                    tracing::warn!(machine_id = %machine_id, error = %e, "Failed to clear session");
                }
            }
            _ => {}
        }

        self.accepted(machine_id, command.name(), response, |data| {
            RawEvent::command_response(data)
        })
        .await
    }

    /// Fetch the full context of a machine and merge it. `origin` is
    /// [`EventOrigin::Resync`] when an operator asked for it.
    pub async fn refresh_context(&self, machine_id: MachineId, origin: EventOrigin) -> CommandOutcome {
        let response = match self.backend.consult_context(machine_id).await {
            Ok(response) => response,
            Err(e) => return self.transport_failure(machine_id, "consult_context", e).await,
        };
        if !response.success {
            return self.rejected(machine_id, "consult_context", response);
        }
        self.accepted(machine_id, "consult_context", response, |data| {
            RawEvent::full_context(data, origin)
        })
        .await
    }

    pub fn last_error(&self, machine_id: MachineId) -> Option<String> {
        self.errors().get(&machine_id).cloned()
    }

    async fn accepted(
        &self,
        machine_id: MachineId,
        name: &'static str,
        response: ApiResponse,
        to_event: impl FnOnce(Value) -> RawEvent,
    ) -> CommandOutcome {
        self.errors().remove(&machine_id);

        if let Some(data) = response.data.clone().filter(|data| !data.is_null()) {
            match self.store.apply(machine_id, None, to_event(data)).await {
                Ok(ApplyOutcome::Applied { revision }) => {
                    tracing::debug!(machine_id = %machine_id, command = name, revision, "Command response merged");
                }
                Ok(outcome) => {
                    tracing::debug!(machine_id = %machine_id, command = name, outcome = ?outcome, "Command response not merged");
                }
                Err(e) => {
                    tracing::error!(machine_id = %machine_id, command = name, error = %e, "Command response lost");
                }
            }
        }
        CommandOutcome::succeeded(response.data)
    }

    fn rejected(&self, machine_id: MachineId, name: &'static str, response: ApiResponse) -> CommandOutcome {
        let error = response
            .error
            .or(response.message)
            .unwrap_or_else(|| format!("{} failed", name));
        tracing::warn!(machine_id = %machine_id, command = name, error = %error, "Command rejected by backend");
        self.record_error(machine_id, &error);
        CommandOutcome::failed(error)
    }

    async fn transport_failure(
        &self,
        machine_id: MachineId,
        name: &'static str,
        error: BackendError,
    ) -> CommandOutcome {
        tracing::warn!(machine_id = %machine_id, command = name, error = %error, "Command failed");
        if error.is_unauthorized() {
            tracing::error!(machine_id = %machine_id, "Backend refused credentials, clearing session");
            if let Err(e) = self.sessions.clear().await {
                tracing::warn!(machine_id = %machine_id, error = %e, "Failed to clear session");
            }
        }
        let message = error.to_string();
        self.record_error(machine_id, &message);
        CommandOutcome::failed(message)
    }

    fn record_error(&self, machine_id: MachineId, error: &str) {
        self.errors().insert(machine_id, error.to_string());
    }

    fn errors(&self) -> std::sync::MutexGuard<'_, HashMap<MachineId, String>> {
        self.last_errors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Session id from a start-session response, wherever the backend put it.
fn session_id(data: &Value) -> Option<String> {
    let raw = data
        .get("id_sessao")
        .or_else(|| data.get("session_id"))
        .or_else(|| data.get("sessao_operador").and_then(|s| s.get("id_sessao")))?;
    match raw {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

// Production commands and their backend envelopes
use super::machine::MachineId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Commands an operator can issue against a machine.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ConsoleCommand {
    StartSession {
        operator_id: i64,
        shift_id: i64,
    },
    EndSession,
    StartProduction {
        map_id: i64,
        cycle_time: f64,
    },
    PauseProduction,
    ResumeProduction,
    FinishProduction,
    AddRejects {
        quantity: u64,
        reason_id: i64,
        /// Station receiving the rejects; defaults to the machine itself.
        #[serde(default)]
        station_id: Option<MachineId>,
    },
    ForceStop {
        reason_id: i64,
    },
    ResumeStop,
    JustifyStop {
        stop_id: i64,
        reason_id: i64,
    },
}

/// A resolved REST call: path relative to the backend base url plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub path: &'static str,
    pub body: Value,
}

impl ConsoleCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ConsoleCommand::StartSession { .. } => "start_session",
            ConsoleCommand::EndSession => "end_session",
            ConsoleCommand::StartProduction { .. } => "start_production",
            ConsoleCommand::PauseProduction => "pause_production",
            ConsoleCommand::ResumeProduction => "resume_production",
            ConsoleCommand::FinishProduction => "finish_production",
            ConsoleCommand::AddRejects { .. } => "add_rejects",
            ConsoleCommand::ForceStop { .. } => "force_stop",
            ConsoleCommand::ResumeStop => "resume_stop",
            ConsoleCommand::JustifyStop { .. } => "justify_stop",
        }
    }

    pub fn to_request(&self, machine_id: MachineId) -> CommandRequest {
        let id = machine_id.get();
        let (path, body) = match self {
            ConsoleCommand::StartSession {
                operator_id,
                shift_id,
            } => (
                "/api/sessao/iniciar",
                json!({"id_maquina": id, "id_operador": operator_id, "id_turno": shift_id}),
            ),
            ConsoleCommand::EndSession => ("/api/sessao/finalizar", json!({"id_maquina": id})),
            ConsoleCommand::StartProduction { map_id, cycle_time } => (
                "/api/producao/iniciar",
                json!({"id_maquina": id, "id_mapa": map_id, "tempo_ciclo": cycle_time}),
            ),
            ConsoleCommand::PauseProduction => ("/api/producao/pausar", json!({"id_maquina": id})),
            ConsoleCommand::ResumeProduction => {
                ("/api/producao/retomar", json!({"id_maquina": id}))
            }
            ConsoleCommand::FinishProduction => {
                ("/api/producao/finalizar", json!({"id_maquina": id}))
            }
            ConsoleCommand::AddRejects {
                quantity,
                reason_id,
                station_id,
            } => {
                let target = station_id.map(MachineId::get).unwrap_or(id);
                (
                    "/api/rejeitos/adicionar",
                    json!({"id_maquina": target, "quantidade": quantity, "id_motivo_rejeito": reason_id}),
                )
            }
            ConsoleCommand::ForceStop { reason_id } => (
                "/api/parada/forcar",
                json!({"id_maquina": id, "id_motivo": reason_id}),
            ),
            ConsoleCommand::ResumeStop => ("/api/parada/retomar", json!({"id_maquina": id})),
            ConsoleCommand::JustifyStop { stop_id, reason_id } => (
                "/api/parada/justificar",
                json!({"id_parada": stop_id, "id_motivo": reason_id}),
            ),
        };
        CommandRequest { path, body }
    }
}

/// Backend response envelope shared by every REST endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// What a caller gets back from a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn succeeded(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_rejects_targets_station() {
        let machine = MachineId::new(130).unwrap();
        let command = ConsoleCommand::AddRejects {
            quantity: 3,
            reason_id: 9,
            station_id: MachineId::new(141),
        };
        let request = command.to_request(machine);
        assert_eq!(request.path, "/api/rejeitos/adicionar");
        assert_eq!(request.body["id_maquina"], 141);
        assert_eq!(request.body["quantidade"], 3);
        assert_eq!(request.body["id_motivo_rejeito"], 9);
    }

    #[test]
    fn test_command_deserializes_from_tag() {
        let command: ConsoleCommand =
            serde_json::from_str(r#"{"command":"force_stop","reason_id":7}"#).unwrap();
        assert_eq!(command, ConsoleCommand::ForceStop { reason_id: 7 });

        let command: ConsoleCommand =
            serde_json::from_str(r#"{"command":"add_rejects","quantity":2,"reason_id":1}"#)
                .unwrap();
        assert_eq!(command.to_request(MachineId::new(5).unwrap()).body["id_maquina"], 5);
    }

    #[test]
    fn test_api_response_tolerates_missing_fields() {
        let response: ApiResponse = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("boom"));
        assert!(response.data.is_none());
    }
}

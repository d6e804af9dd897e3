// Backend trait for the production API and its update stream
use crate::domain::command::{ApiResponse, CommandRequest};
use crate::domain::machine::MachineId;
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Decoded `data` payloads of the machine's update stream, one item per event.
pub type FrameStream = BoxStream<'static, Result<String, BackendError>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unauthorized (HTTP {0})")]
    Unauthorized(u16),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("update stream closed by server")]
    StreamClosed,
    #[error("no frame received for {0} seconds")]
    HeartbeatTimeout(u64),
}

impl BackendError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BackendError::Unauthorized(_))
    }

    /// Map a non-success HTTP status, keeping 401/403 distinguishable.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => BackendError::Unauthorized(status),
            _ => BackendError::Status {
                status,
                message: message.into(),
            },
        }
    }
}

#[async_trait]
pub trait ConsoleBackend: Send + Sync {
    /// Open the update stream of a machine.
    async fn open_stream(&self, machine_id: MachineId) -> Result<FrameStream, BackendError>;

    /// Fetch the full context of a machine and its stations.
    async fn consult_context(&self, machine_id: MachineId) -> Result<ApiResponse, BackendError>;

    /// Send a production command. Non-2xx responses whose body is a valid
    /// envelope are returned as `Ok` with `success == false`.
    async fn post_command(&self, request: &CommandRequest) -> Result<ApiResponse, BackendError>;
}

// Application state for HTTP handlers
use crate::application::console_service::ConsoleService;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub console: Arc<ConsoleService>,
}

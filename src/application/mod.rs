// Application layer - Normalization, reconciliation and the services around them
pub mod command_service;
pub mod connection_manager;
pub mod console_backend;
pub mod console_service;
pub mod normalizer;
pub mod reconciler;
pub mod session_store;
pub mod state_store;

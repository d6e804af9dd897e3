// Presentation layer - HTTP surface for the tablet UI
pub mod app_state;
pub mod handlers;

// Infrastructure layer - External dependencies and adapters
pub mod config;
pub mod http_backend;
pub mod session_file;
pub mod sse_decoder;

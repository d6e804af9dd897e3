// Domain layer - Machine state, events and commands
pub mod command;
pub mod event;
pub mod machine;

pub mod config;
pub mod dependency;
pub mod state_store;
pub mod types;
pub mod workspace;

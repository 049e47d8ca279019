//! Side-effecting collaborators: sandbox threads, child processes, model
//! transport, templates and files.

pub mod command_env;
pub mod config;
pub mod environment;
pub mod model;
pub mod process;
pub mod prompt;
pub mod result_store;
pub mod sandbox;

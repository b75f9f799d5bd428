pub mod client;
pub mod config;
pub mod errors;
pub mod hub;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod prompts;
pub mod server;
pub mod store;
pub mod stream;

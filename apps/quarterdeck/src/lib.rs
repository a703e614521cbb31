pub mod cli;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod log_stream;
pub mod orchestrator;
pub mod telemetry;

pub mod ai;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod server;

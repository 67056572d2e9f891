pub mod app;
pub mod audit;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod executor;
pub mod format;
pub mod gate;
pub mod interpreter;
pub mod session;
pub mod transport;

pub mod cli;
pub mod commands;
pub mod config;
pub mod daemon;

pub use commands::{execute, Services};
pub use config::Config;
pub use daemon::{open_database, serve};

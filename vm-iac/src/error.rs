//! Error types for config generation and tool execution.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IacError>;

#[derive(Error, Debug)]
pub enum IacError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid tool output: {0}")]
    Output(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

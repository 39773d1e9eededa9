//! Domain errors surfaced by the supervisor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LencakError {
    #[error("workspace {0} does not exist")]
    UnknownWorkspace(String),

    #[error("workspace {workspace} has no task {task}")]
    UnknownTask { workspace: String, task: String },

    #[error("invalid killsignal {0}, must be one of [sigint, sigterm, sigkill]")]
    InvalidKillSignal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LencakError>;

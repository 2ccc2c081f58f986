use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("job {0} was not started on this node")]
    JobNotStarted(i32),

    #[error("create user {user} failed with exit code {code}")]
    UserSetup { user: String, code: i32 },

    #[error("failed to start process: {0}")]
    ProcessStart(String),

    #[error("cgroup operation failed: {0}")]
    Cgroup(String),

    #[error("request to {uri} returned status {status}")]
    NonSuccess { uri: String, status: u16 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

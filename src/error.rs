//! Top-level error types for forgebot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingKey(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Container sandbox errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to start container for task {task_id}: {message}")]
    StartFailed { task_id: String, message: String },

    #[error("no container for task {task_id}")]
    MissingContainer { task_id: String },

    #[error("container runtime invocation failed: {0}")]
    Runtime(#[from] std::io::Error),
}

/// LLM transport errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("completion request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("completion API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("completion response contained no choices")]
    EmptyResponse,
}

/// Channel adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("chat-room API error: {0}")]
    Matrix(String),

    #[error("forge CLI failed: {0}")]
    Forge(String),
}

//! Configuration loading from the environment.

use crate::error::{ConfigError, Result};
use std::path::PathBuf;

/// Default on-disk location for the persistent state file.
const DEFAULT_STATE_PATH: &str = "/home/matrix-tui/state.json";

/// Runtime settings, sourced from environment variables at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Chat-room homeserver base URL.
    pub matrix_homeserver: String,
    /// Chat-room bot account (full user id).
    pub matrix_user: String,
    /// Chat-room bot password.
    pub matrix_password: String,

    /// API key for the LLM transport.
    pub llm_api_key: String,
    /// Base URL of the OpenAI-compatible completion endpoint.
    pub llm_api_base: String,
    /// Model identifier sent with every completion request.
    pub llm_model: String,

    /// Forwarded into containers for the analysis CLI.
    pub gemini_api_key: String,
    /// Forwarded into containers for the code-writing CLI.
    pub dashscope_api_key: String,
    /// Forwarded into containers for forge operations.
    pub github_token: String,

    /// Container runtime binary.
    pub podman_path: String,
    /// Image every sandbox container is spawned from.
    pub sandbox_image: String,
    /// Timeout for short shell operations, in seconds.
    pub command_timeout_seconds: u64,
    /// Timeout for coding sub-agent runs, in seconds.
    pub coding_timeout_seconds: u64,
    /// Turn cap for the decider loop.
    pub max_agent_turns: usize,
    /// Host-side base directory for per-container IPC scratch dirs.
    pub ipc_base_dir: PathBuf,
    /// In-container path of the browser screenshot helper.
    pub screenshot_script: String,

    /// Port for the forge webhook listener.
    pub github_webhook_port: u16,
    /// Shared secret for webhook signature verification (empty disables it).
    pub github_webhook_secret: String,
    /// `owner/repo` used by the recovery scan.
    pub github_repo: String,

    /// Path of the persistent state file.
    pub state_path: PathBuf,
}

impl Settings {
    /// Load settings from the environment. Fails on missing credentials.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            matrix_homeserver: env_or("MATRIX_HOMESERVER", "https://matrix.org"),
            matrix_user: env_required("MATRIX_USER")?,
            matrix_password: env_required("MATRIX_PASSWORD")?,
            llm_api_key: env_required("LLM_API_KEY")?,
            llm_api_base: env_or("LLM_API_BASE", "https://openrouter.ai/api/v1"),
            llm_model: env_or("LLM_MODEL", "anthropic/claude-haiku-4.5"),
            gemini_api_key: env_or("GEMINI_API_KEY", ""),
            dashscope_api_key: env_or("DASHSCOPE_API_KEY", ""),
            github_token: env_or("GITHUB_TOKEN", ""),
            podman_path: env_or("PODMAN_PATH", "podman"),
            sandbox_image: env_or("SANDBOX_IMAGE", "forgebot-sandbox:latest"),
            command_timeout_seconds: env_parsed("COMMAND_TIMEOUT_SECONDS", 120)?,
            coding_timeout_seconds: env_parsed("CODING_TIMEOUT_SECONDS", 1800)?,
            max_agent_turns: env_parsed("MAX_AGENT_TURNS", 25)?,
            ipc_base_dir: PathBuf::from(env_or("IPC_BASE_DIR", "/tmp/sandbox-ipc")),
            screenshot_script: env_or("SCREENSHOT_SCRIPT", "/opt/playwright/screenshot.js"),
            github_webhook_port: env_parsed("GITHUB_WEBHOOK_PORT", 8080)?,
            github_webhook_secret: env_or("GITHUB_WEBHOOK_SECRET", ""),
            github_repo: env_or("GITHUB_REPO", ""),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
        })
    }

    /// Whether the code-forge channel should be started.
    pub fn forge_enabled(&self) -> bool {
        !self.github_token.is_empty()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &'static str) -> Result<String> {
    std::env::var(key).map_err(|_| ConfigError::MissingKey(key).into())
}

fn env_parsed<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| {
            ConfigError::Invalid {
                key,
                message: e.to_string(),
            }
            .into()
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Settings {
    /// Settings for tests: no network credentials, stub runtime binary.
    pub fn for_tests(state_path: PathBuf) -> Self {
        Self {
            matrix_homeserver: "https://matrix.org".into(),
            matrix_user: "@bot:matrix.org".into(),
            matrix_password: "secret".into(),
            llm_api_key: "test-key".into(),
            llm_api_base: "https://openrouter.ai/api/v1".into(),
            llm_model: "test-model".into(),
            gemini_api_key: String::new(),
            dashscope_api_key: String::new(),
            github_token: String::new(),
            podman_path: "true".into(),
            sandbox_image: "test:latest".into(),
            command_timeout_seconds: 10,
            coding_timeout_seconds: 30,
            max_agent_turns: 25,
            ipc_base_dir: std::env::temp_dir().join("forgebot-test-ipc"),
            screenshot_script: "/opt/playwright/screenshot.js".into(),
            github_webhook_port: 0,
            github_webhook_secret: String::new(),
            github_repo: String::new(),
            state_path,
        }
    }
}

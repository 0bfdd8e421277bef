//! forgebot: a multi-channel autonomous coding-agent dispatcher.
//!
//! External channels (a chat room, a code forge) deliver natural-language
//! tasks; each task gets an isolated container sandbox and an LLM-driven
//! tool-calling loop, with enough state persisted to survive restarts.

pub mod channels;
pub mod config;
pub mod decider;
pub mod error;
pub mod llm;
pub mod matrix;
pub mod runner;
pub mod sandbox;
pub mod tools;

pub use error::{Error, Result};

/// Callback used to stream intermediate output fragments to a channel.
pub type UpdateFn = std::sync::Arc<
    dyn Fn(String) -> futures::future::BoxFuture<'static, ()> + Send + Sync,
>;

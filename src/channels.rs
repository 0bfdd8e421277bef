//! Channel adapter contract: ingress of tasks, egress of results.

pub mod github;
pub mod matrix;

use crate::error::Result;

/// Capability set every external event channel implements.
///
/// Adapters are held as `Arc<dyn ChannelAdapter>`, one binding per task,
/// so the runner can deliver without knowing the platform. Delivery
/// failures are logged by callers and never retried by the core.
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel-specific system prompt used when a task's history is first
    /// initialised.
    fn system_prompt(&self) -> &str;

    /// Start the adapter (listeners, clients).
    async fn start(&self) -> Result<()>;

    /// Tear the adapter down.
    async fn stop(&self);

    /// Optional streaming fragment; may be a no-op.
    async fn send_update(&self, task_id: &str, text: &str) -> Result<()>;

    /// Final textual answer for a task.
    async fn deliver_result(&self, task_id: &str, text: &str) -> Result<()>;

    /// Failure report for a task.
    async fn deliver_error(&self, task_id: &str, error: &str) -> Result<()>;

    /// Intermediate image payload (screenshots). Default: dropped.
    async fn deliver_image(&self, _task_id: &str, _image: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Whether the external task still exists; `false` triggers cleanup.
    async fn is_valid(&self, task_id: &str) -> bool;

    /// `(task_id, initial_message)` pairs to replay after a restart.
    async fn recover_tasks(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

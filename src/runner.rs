//! TaskRunner: channel-agnostic autonomous task scheduling.
//!
//! One FIFO inbox and one worker task per task id: messages within a task
//! are processed strictly in order while distinct tasks run concurrently.

use crate::UpdateFn;
use crate::channels::ChannelAdapter;
use crate::decider::{Decider, DeciderEvent};
use crate::error::Result;
use crate::sandbox::SandboxManager;

use futures::StreamExt as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Period of the background validity sweep.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime state of one registered task. Inbox, worker, and channel binding
/// live and die together; membership in the map is the processing set.
struct TaskEntry {
    inbox: mpsc::UnboundedSender<String>,
    worker: JoinHandle<()>,
    channel: Arc<dyn ChannelAdapter>,
}

/// Per-task scheduler with recovery hooks.
pub struct TaskRunner {
    decider: Arc<Decider>,
    sandbox: Arc<SandboxManager>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskRunner {
    pub fn new(decider: Arc<Decider>, sandbox: Arc<SandboxManager>) -> Arc<Self> {
        Arc::new(Self {
            decider,
            sandbox,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Whether a task is currently registered (the processing set).
    pub fn is_processing(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .expect("tasks lock")
            .contains_key(task_id)
    }

    /// Register a task so `destroy_orphans` preserves its container,
    /// without enqueuing a message. The worker idles on its inbox until a
    /// channel pushes a replay message or reconcile cleans it up.
    pub fn pre_register(&self, task_id: &str, channel: Arc<dyn ChannelAdapter>) {
        let mut tasks = self.tasks.lock().expect("tasks lock");
        if tasks.contains_key(task_id) {
            return;
        }
        let entry = self.spawn_entry(task_id, channel);
        tasks.insert(task_id.to_string(), entry);
    }

    /// Push a message for a task, creating its inbox, worker, and channel
    /// binding on first use. Safe to call from any task or handler.
    pub fn enqueue(&self, task_id: &str, message: &str, channel: Arc<dyn ChannelAdapter>) {
        let mut tasks = self.tasks.lock().expect("tasks lock");
        let entry = tasks
            .entry(task_id.to_string())
            .or_insert_with(|| self.spawn_entry(task_id, channel));
        if entry.inbox.send(message.to_string()).is_err() {
            warn!(task_id, "inbox closed; message dropped");
        }
    }

    fn spawn_entry(&self, task_id: &str, channel: Arc<dyn ChannelAdapter>) -> TaskEntry {
        let (inbox, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker_loop(
            task_id.to_string(),
            rx,
            Arc::clone(&channel),
            Arc::clone(&self.decider),
            Arc::clone(&self.sandbox),
        ));
        TaskEntry {
            inbox,
            worker,
            channel,
        }
    }

    /// Validate every bound task against its channel; clean up the stale.
    pub async fn reconcile(&self) {
        let bound: Vec<(String, Arc<dyn ChannelAdapter>)> = self
            .tasks
            .lock()
            .expect("tasks lock")
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.channel)))
            .collect();

        for (task_id, channel) in bound {
            if !channel.is_valid(&task_id).await {
                info!(task_id, "reconcile: cleaning up invalid task");
                self.cleanup(&task_id).await;
            }
        }
    }

    /// Run `reconcile` once per minute until cancelled.
    pub async fn reconcile_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(RECONCILE_INTERVAL).await;
            self.reconcile().await;
        }
    }

    /// Destroy containers with no registered task. Run once at startup,
    /// after recovery has pre-registered everything still worth keeping.
    pub async fn destroy_orphans(&self) {
        for task_id in self.sandbox.task_ids() {
            if !self.is_processing(&task_id) {
                info!(task_id, "destroying orphan container");
                if let Err(error) = self.sandbox.destroy(&task_id).await {
                    error!(task_id, %error, "orphan destroy failed");
                }
            }
        }
    }

    /// Cancel the worker, drop all runtime state, destroy the container.
    pub async fn cleanup(&self, task_id: &str) {
        let entry = self.tasks.lock().expect("tasks lock").remove(task_id);
        if let Some(entry) = entry {
            entry.worker.abort();
        }
        if let Err(error) = self.sandbox.destroy(task_id).await {
            error!(task_id, %error, "container destroy failed");
        }
    }
}

/// Process inbox messages sequentially for a single task. Failures are
/// logged and the worker keeps serving subsequent messages.
async fn worker_loop(
    task_id: String,
    mut rx: mpsc::UnboundedReceiver<String>,
    channel: Arc<dyn ChannelAdapter>,
    decider: Arc<Decider>,
    sandbox: Arc<SandboxManager>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(error) = process(&task_id, &message, &channel, &decider, &sandbox).await {
            error!(task_id, %error, "error processing message");
        }
    }
}

/// Run the decider loop for one message and route its output to the channel.
async fn process(
    task_id: &str,
    message: &str,
    channel: &Arc<dyn ChannelAdapter>,
    decider: &Arc<Decider>,
    sandbox: &Arc<SandboxManager>,
) -> Result<()> {
    // Container is born lazily with the first message.
    if let Err(error) = sandbox.create(task_id).await {
        if let Err(delivery) = channel.deliver_error(task_id, &error.to_string()).await {
            error!(task_id, error = %delivery, "error delivery failed");
        }
        return Err(error);
    }

    let update: UpdateFn = {
        let channel = Arc::clone(channel);
        let task_id = task_id.to_string();
        Arc::new(move |chunk: String| {
            let channel = Arc::clone(&channel);
            let task_id = task_id.clone();
            Box::pin(async move {
                if let Err(error) = channel.send_update(&task_id, &chunk).await {
                    warn!(task_id, %error, "update delivery failed");
                }
            })
        })
    };

    let stream = decider.handle_message(task_id, message, Some(update), channel.system_prompt());
    futures::pin_mut!(stream);

    let mut final_text: Option<String> = None;
    while let Some(event) = stream.next().await {
        match event {
            Ok(DeciderEvent::Text(text)) => {
                if !text.is_empty() {
                    final_text = Some(text);
                }
            }
            Ok(DeciderEvent::Image(image)) => {
                if let Err(error) = channel.deliver_image(task_id, &image).await {
                    warn!(task_id, %error, "image delivery failed");
                }
            }
            Err(error) => {
                if let Err(delivery) = channel.deliver_error(task_id, &error.to_string()).await {
                    error!(task_id, error = %delivery, "error delivery failed");
                }
                return Err(error);
            }
        }
    }

    if let Some(text) = final_text {
        if let Err(error) = channel.deliver_result(task_id, &text).await {
            error!(task_id, %error, "result delivery failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::llm::{AssistantResponse, ChatMessage, CompletionBackend};

    /// Channel fake that records everything delivered to it.
    struct RecordingChannel {
        results: Mutex<Vec<(String, String)>>,
        errors: Mutex<Vec<(String, String)>>,
        valid: std::sync::atomic::AtomicBool,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                valid: std::sync::atomic::AtomicBool::new(true),
            })
        }

        fn results(&self) -> Vec<(String, String)> {
            self.results.lock().unwrap().clone()
        }

        fn errors(&self) -> Vec<(String, String)> {
            self.errors.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ChannelAdapter for RecordingChannel {
        fn system_prompt(&self) -> &str {
            "Test prompt"
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn send_update(&self, _task_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn deliver_result(&self, task_id: &str, text: &str) -> Result<()> {
            self.results
                .lock()
                .unwrap()
                .push((task_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn deliver_error(&self, task_id: &str, error: &str) -> Result<()> {
            self.errors
                .lock()
                .unwrap()
                .push((task_id.to_string(), error.to_string()));
            Ok(())
        }

        async fn is_valid(&self, _task_id: &str) -> bool {
            self.valid.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    /// Backend that echoes each user message as the final answer.
    struct EchoBackend;

    #[async_trait::async_trait]
    impl CompletionBackend for EchoBackend {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: &[serde_json::Value],
        ) -> Result<AssistantResponse> {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(AssistantResponse {
                content: Some(format!("echo: {last_user}")),
                tool_calls: None,
            })
        }
    }

    fn build_runner() -> (Arc<TaskRunner>, Arc<SandboxManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::for_tests(dir.path().join("state.json"));
        settings.ipc_base_dir = dir.path().join("ipc");
        let sandbox = Arc::new(SandboxManager::new(settings.clone()));
        let decider = Decider::new(&settings, Arc::new(EchoBackend), Arc::clone(&sandbox));
        (TaskRunner::new(decider, Arc::clone(&sandbox)), sandbox, dir)
    }

    async fn settle() {
        // Let worker tasks drain their inboxes.
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn enqueue_registers_task_and_delivers_result() {
        let (runner, sandbox, _dir) = build_runner();
        let channel = RecordingChannel::new();

        runner.enqueue("task-1", "hello", channel.clone());
        assert!(runner.is_processing("task-1"));

        settle().await;
        assert_eq!(
            channel.results(),
            vec![("task-1".to_string(), "echo: hello".to_string())]
        );
        assert_eq!(sandbox.task_ids(), vec!["task-1".to_string()]);

        runner.cleanup("task-1").await;
        assert!(!runner.is_processing("task-1"));
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_for_worker_creation() {
        let (runner, _sandbox, _dir) = build_runner();
        let channel = RecordingChannel::new();

        runner.enqueue("task-2", "one", channel.clone());
        runner.enqueue("task-2", "two", channel.clone());
        assert_eq!(runner.tasks.lock().unwrap().len(), 1);

        settle().await;
        // FIFO within the task: both messages processed, in order.
        assert_eq!(
            channel.results(),
            vec![
                ("task-2".to_string(), "echo: one".to_string()),
                ("task-2".to_string(), "echo: two".to_string()),
            ]
        );
        runner.cleanup("task-2").await;
    }

    #[tokio::test]
    async fn pre_register_leaves_worker_idle() {
        let (runner, sandbox, _dir) = build_runner();
        let channel = RecordingChannel::new();

        runner.pre_register("task-3", channel.clone());
        assert!(runner.is_processing("task-3"));

        settle().await;
        // No message, so no container and no deliveries.
        assert!(channel.results().is_empty());
        assert!(sandbox.task_ids().is_empty());
        runner.cleanup("task-3").await;
    }

    #[tokio::test]
    async fn pre_register_is_idempotent() {
        let (runner, _sandbox, _dir) = build_runner();
        let channel = RecordingChannel::new();

        runner.pre_register("task-4", channel.clone());
        runner.pre_register("task-4", channel.clone());
        assert_eq!(runner.tasks.lock().unwrap().len(), 1);
        runner.cleanup("task-4").await;
    }

    #[tokio::test]
    async fn destroy_orphans_removes_exactly_the_unregistered() {
        let (runner, sandbox, _dir) = build_runner();
        let channel = RecordingChannel::new();

        sandbox.create("kept").await.unwrap();
        sandbox.create("orphan").await.unwrap();
        runner.pre_register("kept", channel.clone());

        runner.destroy_orphans().await;

        assert_eq!(sandbox.task_ids(), vec!["kept".to_string()]);
        assert!(runner.is_processing("kept"));
        runner.cleanup("kept").await;
    }

    #[tokio::test]
    async fn reconcile_cleans_invalid_tasks() {
        let (runner, sandbox, _dir) = build_runner();
        let channel = RecordingChannel::new();

        runner.enqueue("task-5", "hello", channel.clone());
        settle().await;
        assert_eq!(sandbox.task_ids(), vec!["task-5".to_string()]);

        channel
            .valid
            .store(false, std::sync::atomic::Ordering::SeqCst);
        runner.reconcile().await;

        assert!(!runner.is_processing("task-5"));
        assert!(sandbox.task_ids().is_empty());
    }

    #[tokio::test]
    async fn decider_failure_reaches_deliver_error() {
        struct FailingBackend;

        #[async_trait::async_trait]
        impl CompletionBackend for FailingBackend {
            async fn complete(
                &self,
                _messages: &[ChatMessage],
                _tools: &[serde_json::Value],
            ) -> Result<AssistantResponse> {
                Err(crate::error::LlmError::EmptyResponse.into())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::for_tests(dir.path().join("state.json"));
        settings.ipc_base_dir = dir.path().join("ipc");
        let sandbox = Arc::new(SandboxManager::new(settings.clone()));
        let decider = Decider::new(&settings, Arc::new(FailingBackend), Arc::clone(&sandbox));
        let runner = TaskRunner::new(decider, sandbox);
        let channel = RecordingChannel::new();

        runner.enqueue("task-6", "hello", channel.clone());
        settle().await;

        let errors = channel.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "task-6");
        assert!(channel.results().is_empty());
        runner.cleanup("task-6").await;
    }
}

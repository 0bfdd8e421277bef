//! LLM decider: the per-task routing loop that decides which tool to call next.

use crate::UpdateFn;
use crate::config::Settings;
use crate::error::Result;
use crate::llm::{AssistantResponse, ChatMessage, CompletionBackend, ToolCall};
use crate::sandbox::SandboxManager;
use crate::tools::{TOOL_SCHEMAS, execute_tool};

use futures::Stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// System prompt for interactive chat-room tasks.
pub const CHAT_SYSTEM_PROMPT: &str = "\
You are a coding assistant running inside a sandboxed container. You have three coding agents:

- plan(task) — analysis CLI (1M token context). Use for planning, analysis, and explaining codebases.
- implement(task) — code-writing CLI. Use for writing code, fixing bugs, and refactoring.
- review(task) — analysis CLI. Use after implementation to review changes.

You also have:
- run_command — run shell commands in the sandbox
- read_file / write_file — read and write files in the sandbox
- run_tests — run lint (ruff) and tests (pytest)
- take_screenshot — take a browser screenshot of a URL in the sandbox
- self_update — update the bot itself on the host

The container has Node.js 20, Python 3, git, and both coding CLIs installed.
Work in /workspace. When you start a web server, use take_screenshot to show the result.

Typical workflow:
1. plan() — understand the codebase and design the approach
2. implement() — write the code, passing the plan as context
3. run_tests() — verify lint and tests pass
4. review() — check for bugs, security issues, missed edge cases
5. If review finds issues, implement() again with the feedback

Always pass enough context between agents. Each agent invocation is independent —
include the plan in the implement() task, and describe what changed in the review() task.
Use run_command for simple shell operations. Use plan/implement/review for anything requiring code intelligence.

After cloning a repo, always run: plan(task=\"run /init to generate GEMINI.md for this repo\")
This lets the analysis CLI write its own project context file.

IMPORTANT — two distinct environments:
- sandbox container (/workspace): run_command, read_file, write_file, plan, implement, review, take_screenshot all operate HERE
- host: use self_update ONLY for updating the bot itself (git pull + rebuild sandbox image + service restart)
Never use run_command to try to update the bot or restart the service — that runs inside the container, not the host.

When modifying the bot's own code, clone its repository into /workspace, work on it with
plan/implement/review, push a branch, open a PR with run_command, and tell the user the PR URL.
To test a branch before merging: self_update(branch=\"<branch>\").

Explain what you're doing as you work.";

/// System prompt for autonomous forge-issue tasks.
pub const FORGE_SYSTEM_PROMPT: &str = "\
You are an autonomous coding agent working on a forge issue.
Your goal is to understand the issue, implement the fix or feature, and create a pull request.

Workflow:
1. plan() — understand the codebase and design the approach
2. implement() — write the code
3. run_tests() — verify lint and tests pass
4. review() — check for bugs and edge cases
5. If review finds issues, implement() again

After completing and verifying code changes:
Do NOT manually run `git` or `gh` commands. Instead, call the `create_pull_request(title, body)` tool.
The tool will automatically handle branching, committing, pushing, and opening the PR.
Provide a clear PR title and a body that references the issue (e.g., \"Closes #123\").

Report the PR URL (returned by the tool) as your final message.
If you cannot complete the task, explain what's blocking you.";

/// Terminal message when the turn cap is exhausted.
const MAX_TURNS_MESSAGE: &str =
    "Reached maximum turns. Here's where I got to — let me know if you'd like me to continue.";

/// One yielded item of the decider's output sequence. The consumer treats
/// the last `Text` as the final answer and forwards each `Image` to the
/// channel immediately.
#[derive(Debug, Clone, PartialEq)]
pub enum DeciderEvent {
    Text(String),
    Image(Vec<u8>),
}

/// Per-task message-driven tool-calling loop.
pub struct Decider {
    backend: Arc<dyn CompletionBackend>,
    sandbox: Arc<SandboxManager>,
    max_turns: usize,
    histories: Arc<Mutex<HashMap<String, Vec<ChatMessage>>>>,
}

impl Decider {
    /// Build the decider and install its history snapshot into the sandbox
    /// so state saves can serialise conversations.
    pub fn new(
        settings: &Settings,
        backend: Arc<dyn CompletionBackend>,
        sandbox: Arc<SandboxManager>,
    ) -> Arc<Self> {
        let histories = Arc::new(Mutex::new(HashMap::new()));
        let snapshot = Arc::clone(&histories);
        sandbox.attach_history_source(Arc::new(move || {
            snapshot.lock().expect("histories lock").clone()
        }));
        Arc::new(Self {
            backend,
            sandbox,
            max_turns: settings.max_agent_turns,
            histories,
        })
    }

    /// Merge persisted histories recovered at startup.
    pub fn load_histories(&self, histories: HashMap<String, Vec<ChatMessage>>) {
        self.histories
            .lock()
            .expect("histories lock")
            .extend(histories);
    }

    fn push_history(&self, task_id: &str, entry: ChatMessage) {
        self.histories
            .lock()
            .expect("histories lock")
            .entry(task_id.to_string())
            .or_default()
            .push(entry);
    }

    fn history_snapshot(&self, task_id: &str) -> Vec<ChatMessage> {
        self.histories
            .lock()
            .expect("histories lock")
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Process one user message. The returned stream yields intermediate
    /// images as tools produce them and ends with the final text (or the
    /// turn-cap message). An `Err` item terminates the stream.
    pub fn handle_message(
        self: &Arc<Self>,
        task_id: &str,
        user_text: &str,
        update: Option<UpdateFn>,
        system_prompt: &str,
    ) -> impl Stream<Item = Result<DeciderEvent>> + Send + 'static {
        let decider = Arc::clone(self);
        let task_id = task_id.to_string();
        let user_text = user_text.to_string();
        let system_prompt = system_prompt.to_string();

        async_stream::try_stream! {
            {
                let mut histories = decider.histories.lock().expect("histories lock");
                histories
                    .entry(task_id.clone())
                    .or_insert_with(|| vec![ChatMessage::system(&system_prompt)])
                    .push(ChatMessage::user(&user_text));
            }
            info!(task_id, preview = %preview(&user_text), "user message");

            for turn in 0..decider.max_turns {
                info!(task_id, turn = turn + 1, max_turns = decider.max_turns, "calling LLM");
                let started = std::time::Instant::now();
                let messages = decider.history_snapshot(&task_id);
                let response = decider.backend.complete(&messages, &TOOL_SCHEMAS).await?;
                debug!(task_id, elapsed_ms = started.elapsed().as_millis() as u64, "LLM responded");

                let assistant = normalize_assistant(&response);
                let content = assistant.content.clone();
                let tool_calls = assistant.tool_calls.clone().unwrap_or_default();
                decider.push_history(&task_id, assistant);

                // A turn without tool calls is the final answer.
                if tool_calls.is_empty() {
                    info!(task_id, turn = turn + 1, preview = %preview(&content), "final response");
                    if !content.is_empty() {
                        if let Err(error) = decider.sandbox.save_state().await {
                            error!(task_id, %error, "state save failed");
                        }
                        yield DeciderEvent::Text(content);
                    }
                    return;
                }

                for call in &tool_calls {
                    info!(
                        task_id,
                        tool = %call.function.name,
                        args = %preview(&call.function.arguments),
                        "tool call"
                    );
                    let started = std::time::Instant::now();
                    let (text, image) = execute_tool(
                        &decider.sandbox,
                        &task_id,
                        &call.function.name,
                        &call.function.arguments,
                        update.as_ref(),
                    )
                    .await?;
                    debug!(
                        task_id,
                        tool = %call.function.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        chars = text.len(),
                        "tool completed"
                    );
                    decider.push_history(&task_id, ChatMessage::tool(&call.id, text));
                    if let Some(image) = image {
                        yield DeciderEvent::Image(image);
                    }
                }
            }

            warn!(task_id, max_turns = decider.max_turns, "hit max turns");
            if let Err(error) = decider.sandbox.save_state().await {
                error!(task_id, %error, "state save failed");
            }
            yield DeciderEvent::Text(MAX_TURNS_MESSAGE.to_string());
        }
    }
}

/// Materialise a provider response into the canonical history shape: text
/// content plus tool calls that always carry `type: "function"`. Some
/// providers reject the looser shapes client libraries emit by default, so
/// only normalised entries ever enter a history.
fn normalize_assistant(response: &AssistantResponse) -> ChatMessage {
    let tool_calls: Vec<ToolCall> = response
        .tool_calls
        .iter()
        .flatten()
        .map(|raw| ToolCall {
            id: raw.id.clone(),
            kind: "function".to_string(),
            function: raw.function.clone(),
        })
        .collect();
    ChatMessage {
        role: "assistant".to_string(),
        content: response.content.clone().unwrap_or_default(),
        tool_call_id: None,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
    }
}

fn preview(text: &str) -> &str {
    let mut end = text.len().min(200);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FunctionCall, RawToolCall};
    use futures::StreamExt as _;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that replays a fixed script of responses.
    struct ScriptedBackend {
        responses: Mutex<VecDeque<AssistantResponse>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<AssistantResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[serde_json::Value],
        ) -> Result<AssistantResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().expect("responses lock").pop_front();
            Ok(next.unwrap_or_default())
        }
    }

    fn text_response(content: &str) -> AssistantResponse {
        AssistantResponse {
            content: Some(content.to_string()),
            tool_calls: None,
        }
    }

    fn tool_response(id: &str, name: &str) -> AssistantResponse {
        AssistantResponse {
            content: None,
            tool_calls: Some(vec![RawToolCall {
                id: id.to_string(),
                kind: None,
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: "{}".to_string(),
                },
            }]),
        }
    }

    fn build(
        backend: Arc<ScriptedBackend>,
        max_turns: usize,
    ) -> (Arc<Decider>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::for_tests(dir.path().join("state.json"));
        settings.max_agent_turns = max_turns;
        let sandbox = Arc::new(SandboxManager::new(settings.clone()));
        (Decider::new(&settings, backend, sandbox), dir)
    }

    async fn collect(
        decider: &Arc<Decider>,
        task_id: &str,
        text: &str,
    ) -> Vec<DeciderEvent> {
        let stream = decider.handle_message(task_id, text, None, "You are helpful.");
        futures::pin_mut!(stream);
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn single_turn_yields_final_text_and_builds_history() {
        let backend = ScriptedBackend::new(vec![text_response("hi")]);
        let (decider, _dir) = build(Arc::clone(&backend), 25);

        let events = collect(&decider, "!r:x", "say hi").await;
        assert_eq!(events, vec![DeciderEvent::Text("hi".to_string())]);
        assert_eq!(backend.call_count(), 1);

        let history = decider.history_snapshot("!r:x");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, "system");
        assert_eq!(history[0].content, "You are helpful.");
        assert_eq!(history[1].role, "user");
        assert_eq!(history[1].content, "say hi");
        assert_eq!(history[2].role, "assistant");
        assert_eq!(history[2].content, "hi");
    }

    #[tokio::test]
    async fn tool_round_trip_appends_tool_entry_keyed_by_call_id() {
        let backend = ScriptedBackend::new(vec![
            tool_response("call_1", "no_such_tool"),
            text_response("done"),
        ]);
        let (decider, _dir) = build(backend, 25);

        let events = collect(&decider, "t", "go").await;
        assert_eq!(events, vec![DeciderEvent::Text("done".to_string())]);

        let history = decider.history_snapshot("t");
        let tool_entry = history.iter().find(|m| m.role == "tool").unwrap();
        assert_eq!(tool_entry.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_entry.content, "Unknown tool: no_such_tool");
    }

    #[tokio::test]
    async fn turn_cap_bounds_llm_calls_and_yields_terminal_message() {
        // Every turn asks for an unknown tool, so the loop never converges.
        let backend = ScriptedBackend::new(
            (0..10)
                .map(|i| tool_response(&format!("call_{i}"), "no_such_tool"))
                .collect(),
        );
        let (decider, _dir) = build(Arc::clone(&backend), 3);

        let events = collect(&decider, "t", "go").await;
        assert_eq!(backend.call_count(), 3);
        assert_eq!(
            events.last(),
            Some(&DeciderEvent::Text(MAX_TURNS_MESSAGE.to_string()))
        );
    }

    #[tokio::test]
    async fn empty_final_content_yields_nothing() {
        let backend = ScriptedBackend::new(vec![AssistantResponse::default()]);
        let (decider, _dir) = build(backend, 25);
        let events = collect(&decider, "t", "go").await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn system_prompt_is_set_once_and_never_replaced() {
        let backend = ScriptedBackend::new(vec![
            text_response("first"),
            text_response("second"),
        ]);
        let (decider, _dir) = build(backend, 25);

        collect(&decider, "t", "one").await;
        let stream = decider.handle_message("t", "two", None, "different prompt");
        futures::pin_mut!(stream);
        while stream.next().await.is_some() {}

        let history = decider.history_snapshot("t");
        assert_eq!(history[0].content, "You are helpful.");
        assert_eq!(history.iter().filter(|m| m.role == "system").count(), 1);
    }

    #[test]
    fn normalisation_forces_function_type() {
        let response = tool_response("c1", "read_file");
        let normalized = normalize_assistant(&response);
        let calls = normalized.tool_calls.unwrap();
        assert_eq!(calls[0].kind, "function");
        assert_eq!(calls[0].id, "c1");
        assert_eq!(normalized.content, "");
    }
}

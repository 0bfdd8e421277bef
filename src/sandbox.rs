//! Container sandbox manager: one container per task.

pub mod bootstrap;
pub mod stream;

use crate::UpdateFn;
use crate::config::Settings;
use crate::error::{Result, SandboxError};
use crate::llm::ChatMessage;
use crate::sandbox::bootstrap::BOOTSTRAP_FILES;
use crate::sandbox::stream::{ChunkBuffer, strip_ansi};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Default number of buffered characters per streamed chunk.
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 2000;

/// Timeout for the in-container screenshot helper, in seconds.
const SCREENSHOT_TIMEOUT_SECONDS: u64 = 30;

/// Timeout for container stop/remove, in seconds.
const TEARDOWN_TIMEOUT_SECONDS: u64 = 15;

/// Provider of the persisted conversation map. Installed by the decider at
/// construction so state saves can serialise histories without the sandbox
/// owning them.
pub type HistorySource =
    std::sync::Arc<dyn Fn() -> HashMap<String, Vec<ChatMessage>> + Send + Sync>;

/// Coding sub-agent CLIs available inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingCli {
    /// Analysis CLI with native hook support.
    Gemini,
    /// Code-writing CLI; runs through the wrapper script so a completion
    /// event is still written.
    Qwen,
}

impl CodingCli {
    fn argv(self, auto_accept: bool, task: &str) -> Vec<String> {
        let program = match self {
            CodingCli::Gemini => "gemini",
            CodingCli::Qwen => "/workspace/.qwen-wrapper.sh",
        };
        let mut argv = vec![program.to_string()];
        if auto_accept {
            argv.push("-y".to_string());
        }
        argv.push("-p".to_string());
        // The task is a single argv element; it never touches a shell.
        argv.push(task.to_string());
        argv
    }
}

/// Derive the container handle for a task id. Deterministic, so restarts
/// and repeated creates reattach to the same container.
pub fn container_name(task_id: &str) -> String {
    let slugged: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("sandbox-{}", slugged.trim_matches('-'))
}

/// Persisted state: container mapping plus conversation histories.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    containers: HashMap<String, String>,
    #[serde(default)]
    history: HashMap<String, Vec<ChatMessage>>,
}

/// Manages one container per task id and the persistent state file.
pub struct SandboxManager {
    settings: Settings,
    containers: Mutex<HashMap<String, String>>,
    history_source: OnceLock<HistorySource>,
}

impl SandboxManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            containers: Mutex::new(HashMap::new()),
            history_source: OnceLock::new(),
        }
    }

    /// Install the history snapshot source. Called once by the decider.
    pub fn attach_history_source(&self, source: HistorySource) {
        let _ = self.history_source.set(source);
    }

    /// Task ids that currently have a container mapping.
    pub fn task_ids(&self) -> Vec<String> {
        self.containers
            .lock()
            .expect("containers lock")
            .keys()
            .cloned()
            .collect()
    }

    fn handle_for(&self, task_id: &str) -> Result<String> {
        self.containers
            .lock()
            .expect("containers lock")
            .get(task_id)
            .cloned()
            .ok_or_else(|| {
                SandboxError::MissingContainer {
                    task_id: task_id.to_string(),
                }
                .into()
            })
    }

    /// Run the container runtime CLI with a timeout. On expiry the child is
    /// killed and a synthetic failure result is returned.
    async fn run_cli<I, S>(
        &self,
        args: I,
        timeout_seconds: u64,
        stdin_data: Option<&[u8]>,
    ) -> Result<(i32, String, String)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.settings.podman_path);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if stdin_data.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(SandboxError::Runtime)?;
        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                // A write failure means the child already exited; its exit
                // status carries the actual outcome.
                let _ = stdin.write_all(data).await;
            }
        }

        match tokio::time::timeout(
            Duration::from_secs(timeout_seconds),
            child.wait_with_output(),
        )
        .await
        {
            Ok(output) => {
                let output = output.map_err(SandboxError::Runtime)?;
                Ok((
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stdout).into_owned(),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                ))
            }
            // Dropping the in-flight future kills the child (kill_on_drop).
            Err(_) => Ok((
                1,
                String::new(),
                format!("Command timed out after {timeout_seconds}s"),
            )),
        }
    }

    /// Create the container for a task. Idempotent: an existing mapping is
    /// returned as-is.
    pub async fn create(&self, task_id: &str) -> Result<String> {
        if let Some(handle) = self
            .containers
            .lock()
            .expect("containers lock")
            .get(task_id)
        {
            return Ok(handle.clone());
        }

        let handle = container_name(task_id);
        let ipc_dir = self.settings.ipc_base_dir.join(&handle);
        tokio::fs::create_dir_all(&ipc_dir).await?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            handle.clone(),
            "--shm-size=256m".into(),
            "-v".into(),
            format!("{}:/workspace/.ipc:Z", ipc_dir.display()),
        ];
        for (key, value) in [
            ("GEMINI_API_KEY", &self.settings.gemini_api_key),
            ("DASHSCOPE_API_KEY", &self.settings.dashscope_api_key),
            ("GITHUB_TOKEN", &self.settings.github_token),
        ] {
            if !value.is_empty() {
                args.push("-e".into());
                args.push(format!("{key}={value}"));
            }
        }
        args.push(self.settings.sandbox_image.clone());
        args.push("sleep".into());
        args.push("infinity".into());

        let (rc, _out, err) = self
            .run_cli(&args, self.settings.command_timeout_seconds, None)
            .await?;
        if rc != 0 {
            return Err(SandboxError::StartFailed {
                task_id: task_id.to_string(),
                message: err.trim().to_string(),
            }
            .into());
        }

        self.containers
            .lock()
            .expect("containers lock")
            .insert(task_id.to_string(), handle.clone());

        self.write_bootstrap(task_id).await?;
        self.save_state().await?;
        info!(task_id, container = %handle, "created container");
        Ok(handle)
    }

    /// Write the bootstrap file suite and mark its scripts executable.
    async fn write_bootstrap(&self, task_id: &str) -> Result<()> {
        for file in BOOTSTRAP_FILES {
            self.write_file(task_id, file.path, file.content).await?;
        }
        let scripts: Vec<&str> = BOOTSTRAP_FILES
            .iter()
            .filter(|f| f.executable)
            .map(|f| f.path)
            .collect();
        self.exec(task_id, &format!("chmod +x {}", scripts.join(" ")))
            .await?;
        Ok(())
    }

    /// Run a shell command inside the container.
    pub async fn exec(&self, task_id: &str, command: &str) -> Result<(i32, String, String)> {
        let handle = self.handle_for(task_id)?;
        self.run_cli(
            ["exec", handle.as_str(), "sh", "-c", command],
            self.settings.command_timeout_seconds,
            None,
        )
        .await
    }

    /// Write a file inside the container via piped stdin. Failures are
    /// reported in the returned text so they flow back to the model.
    pub async fn write_file(&self, task_id: &str, path: &str, content: &str) -> Result<String> {
        let handle = self.handle_for(task_id)?;

        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            let parent = parent.display().to_string();
            self.run_cli(
                ["exec", handle.as_str(), "mkdir", "-p", parent.as_str()],
                self.settings.command_timeout_seconds,
                None,
            )
            .await?;
        }

        let pipe = format!("cat > {path}");
        let (rc, _out, err) = self
            .run_cli(
                ["exec", "-i", handle.as_str(), "sh", "-c", pipe.as_str()],
                self.settings.command_timeout_seconds,
                Some(content.as_bytes()),
            )
            .await?;
        if rc != 0 {
            return Ok(format!("Error writing file: {err}"));
        }
        Ok(format!("Wrote {} bytes to {}", content.len(), path))
    }

    /// Read a file from the container.
    pub async fn read_file(&self, task_id: &str, path: &str) -> Result<String> {
        let (rc, out, err) = self.exec(task_id, &format!("cat {path}")).await?;
        if rc != 0 {
            return Ok(format!("Error reading file: {err}"));
        }
        Ok(out)
    }

    /// Run the in-container screenshot helper and copy the PNG out.
    pub async fn screenshot(&self, task_id: &str, url: &str) -> Result<Option<Vec<u8>>> {
        let handle = self.handle_for(task_id)?;
        const CONTAINER_PATH: &str = "/tmp/screenshot.png";

        let (rc, _out, err) = self
            .run_cli(
                [
                    "exec",
                    handle.as_str(),
                    "node",
                    self.settings.screenshot_script.as_str(),
                    url,
                    CONTAINER_PATH,
                ],
                SCREENSHOT_TIMEOUT_SECONDS,
                None,
            )
            .await?;
        if rc != 0 {
            error!(task_id, error = %err.trim(), "screenshot helper failed");
            return Ok(None);
        }

        let scratch = tempfile::Builder::new().suffix(".png").tempfile()?;
        let host_path = scratch.path().display().to_string();
        let source = format!("{handle}:{CONTAINER_PATH}");
        let (rc, _out, err) = self
            .run_cli(
                ["cp", source.as_str(), host_path.as_str()],
                self.settings.command_timeout_seconds,
                None,
            )
            .await?;
        if rc != 0 {
            error!(task_id, error = %err.trim(), "screenshot copy-out failed");
            return Ok(None);
        }

        Ok(Some(tokio::fs::read(scratch.path()).await?))
    }

    /// Host port published for a container port, if any.
    pub async fn host_port(&self, task_id: &str, container_port: u16) -> Result<Option<u16>> {
        let Ok(handle) = self.handle_for(task_id) else {
            return Ok(None);
        };
        let port = container_port.to_string();
        let (rc, out, _err) = self
            .run_cli(
                ["port", handle.as_str(), port.as_str()],
                self.settings.command_timeout_seconds,
                None,
            )
            .await?;
        if rc != 0 {
            return Ok(None);
        }
        // Output like "0.0.0.0:12345".
        Ok(out.trim().rsplit(':').next().and_then(|p| p.parse().ok()))
    }

    /// One-shot coding sub-agent run.
    pub async fn code(
        &self,
        task_id: &str,
        task: &str,
        cli: CodingCli,
        auto_accept: bool,
    ) -> Result<(i32, String, String)> {
        let handle = self.handle_for(task_id)?;
        let mut args: Vec<String> = vec![
            "exec".into(),
            "--workdir".into(),
            "/workspace".into(),
            handle,
        ];
        args.extend(cli.argv(auto_accept, task));
        self.run_cli(&args, self.settings.coding_timeout_seconds, None)
            .await
    }

    /// Streaming coding sub-agent run: stdout is consumed line by line,
    /// stripped of ANSI escapes, and released through `on_chunk` in
    /// `chunk_size` pieces, with the remainder flushed at end of stream.
    pub async fn code_stream(
        &self,
        task_id: &str,
        task: &str,
        on_chunk: &UpdateFn,
        cli: CodingCli,
        chunk_size: usize,
        auto_accept: bool,
    ) -> Result<(i32, String, String)> {
        let handle = self.handle_for(task_id)?;

        let mut cmd = Command::new(&self.settings.podman_path);
        cmd.arg("exec")
            .arg("--workdir")
            .arg("/workspace")
            .arg(&handle)
            .args(cli.argv(auto_accept, task))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(SandboxError::Runtime)?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stderr) = stderr {
                let _ = BufReader::new(stderr).read_to_string(&mut collected).await;
            }
            collected
        });
        let stdout = child.stdout.take();

        let mut buffer = ChunkBuffer::new(chunk_size);
        let mut collected = String::new();
        let timeout_seconds = self.settings.coding_timeout_seconds;

        let streamed = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let clean = strip_ansi(&line);
                            collected.push_str(&clean);
                            collected.push('\n');
                            if let Some(chunk) = buffer.push(&format!("{clean}\n")) {
                                on_chunk(chunk).await;
                            }
                        }
                        _ => break,
                    }
                }
            }
            child.wait().await
        };

        match tokio::time::timeout(Duration::from_secs(timeout_seconds), streamed).await {
            Ok(status) => {
                let status = status.map_err(SandboxError::Runtime)?;
                if let Some(chunk) = buffer.flush() {
                    on_chunk(chunk).await;
                }
                let stderr_text = stderr_task.await.unwrap_or_default();
                Ok((status.code().unwrap_or(-1), collected, stderr_text))
            }
            Err(_) => {
                let _ = child.kill().await;
                stderr_task.abort();
                if let Some(chunk) = buffer.flush() {
                    on_chunk(chunk).await;
                }
                Ok((
                    1,
                    collected,
                    format!("Coding agent timed out after {timeout_seconds}s"),
                ))
            }
        }
    }

    /// Stop and remove the container for a task, and drop its IPC scratch
    /// directory. Idempotent: unmapped tasks are a no-op.
    pub async fn destroy(&self, task_id: &str) -> Result<()> {
        let handle = self
            .containers
            .lock()
            .expect("containers lock")
            .remove(task_id);
        let Some(handle) = handle else {
            return Ok(());
        };

        let _ = self
            .run_cli(["stop", handle.as_str()], TEARDOWN_TIMEOUT_SECONDS, None)
            .await;
        let _ = self
            .run_cli(["rm", "-f", handle.as_str()], TEARDOWN_TIMEOUT_SECONDS, None)
            .await;

        let ipc_dir = self.settings.ipc_base_dir.join(&handle);
        if let Err(error) = tokio::fs::remove_dir_all(&ipc_dir).await {
            debug!(task_id, %error, "IPC scratch dir removal skipped");
        }

        self.save_state().await?;
        info!(task_id, container = %handle, "destroyed container");
        Ok(())
    }

    /// Destroy every known container.
    pub async fn destroy_all(&self) -> Result<()> {
        for task_id in self.task_ids() {
            self.destroy(&task_id).await?;
        }
        Ok(())
    }

    /// Serialise containers and histories to the state file atomically
    /// (write to `.tmp`, then rename).
    pub async fn save_state(&self) -> Result<()> {
        let state = StateFile {
            containers: self.containers.lock().expect("containers lock").clone(),
            history: self
                .history_source
                .get()
                .map(|source| source())
                .unwrap_or_default(),
        };

        let path = &self.settings.state_path;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&state)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load the state file, keep only containers the runtime still reports
    /// as running, and return the surviving histories for the decider.
    pub async fn load_state(&self) -> Result<HashMap<String, Vec<ChatMessage>>> {
        let raw = match tokio::fs::read(&self.settings.state_path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(error) => return Err(error.into()),
        };
        let state: StateFile = serde_json::from_slice(&raw)?;

        let mut kept = HashMap::new();
        let mut histories = state.history;
        for (task_id, handle) in state.containers {
            let (rc, out, _err) = self
                .run_cli(
                    ["inspect", "--format", "{{.State.Status}}", handle.as_str()],
                    self.settings.command_timeout_seconds,
                    None,
                )
                .await?;
            if rc == 0 && out.trim() == "running" {
                kept.insert(task_id, handle);
            } else {
                warn!(task_id, container = %handle, "dropping stale container entry");
                histories.remove(&task_id);
            }
        }

        info!(containers = kept.len(), "loaded state");
        *self.containers.lock().expect("containers lock") = kept;
        Ok(histories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt as _;

    fn stub_runtime(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("podman-stub");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn manager_with(podman: &str, state_dir: &std::path::Path) -> SandboxManager {
        let mut settings = Settings::for_tests(state_dir.join("state.json"));
        settings.podman_path = podman.to_string();
        settings.ipc_base_dir = state_dir.join("ipc");
        SandboxManager::new(settings)
    }

    #[test]
    fn container_name_is_deterministic_and_slugged() {
        assert_eq!(container_name("!room:matrix.org"), "sandbox-room-matrix.org");
        assert_eq!(container_name("gh-42"), "sandbox-gh-42");
        assert_eq!(container_name("a b/c"), "sandbox-a-b-c");
        assert_eq!(container_name("!r:x"), container_name("!r:x"));
    }

    #[test]
    fn coding_cli_auto_accept_flag_precedes_prompt() {
        let argv = CodingCli::Gemini.argv(true, "do something");
        let y = argv.iter().position(|a| a == "-y").unwrap();
        let p = argv.iter().position(|a| a == "-p").unwrap();
        assert!(y < p);
        assert_eq!(argv.last().unwrap(), "do something");

        let argv = CodingCli::Gemini.argv(false, "do something");
        assert!(!argv.contains(&"-y".to_string()));
    }

    #[test]
    fn qwen_runs_through_the_wrapper() {
        let argv = CodingCli::Qwen.argv(false, "task");
        assert_eq!(argv[0], "/workspace/.qwen-wrapper.sh");
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with("true", dir.path());

        let first = manager.create("task-1").await.unwrap();
        let second = manager.create("task-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.task_ids(), vec!["task-1".to_string()]);
    }

    #[tokio::test]
    async fn exec_without_container_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with("true", dir.path());
        assert!(manager.exec("nope", "echo hi").await.is_err());
    }

    #[tokio::test]
    async fn command_timeout_returns_synthetic_failure() {
        let dir = tempfile::tempdir().unwrap();
        let podman = stub_runtime(dir.path(), "sleep 5");
        let mut settings = Settings::for_tests(dir.path().join("state.json"));
        settings.podman_path = podman;
        settings.command_timeout_seconds = 1;
        let manager = SandboxManager::new(settings);

        let (rc, out, err) = manager
            .run_cli(["exec", "x", "sh", "-c", "anything"], 1, None)
            .await
            .unwrap();
        assert_eq!(rc, 1);
        assert!(out.is_empty());
        assert_eq!(err, "Command timed out after 1s");
    }

    #[tokio::test]
    async fn state_round_trips_when_containers_still_run() {
        let dir = tempfile::tempdir().unwrap();
        let podman = stub_runtime(dir.path(), "echo running");
        let manager = manager_with(&podman, dir.path());

        manager
            .containers
            .lock()
            .unwrap()
            .insert("!r:x".to_string(), "sandbox-r-x".to_string());
        let history = HashMap::from([(
            "!r:x".to_string(),
            vec![ChatMessage::system("You are helpful."), ChatMessage::user("say hi")],
        )]);
        let snapshot = history.clone();
        manager.attach_history_source(std::sync::Arc::new(move || snapshot.clone()));
        manager.save_state().await.unwrap();

        let reloaded = manager_with(&podman, dir.path());
        let histories = reloaded.load_state().await.unwrap();
        assert_eq!(histories, history);
        assert_eq!(
            *reloaded.containers.lock().unwrap(),
            HashMap::from([("!r:x".to_string(), "sandbox-r-x".to_string())])
        );
    }

    #[tokio::test]
    async fn load_state_drops_stopped_containers_and_their_history() {
        let dir = tempfile::tempdir().unwrap();
        let podman = stub_runtime(dir.path(), "echo exited");
        let manager = manager_with(&podman, dir.path());

        manager
            .containers
            .lock()
            .unwrap()
            .insert("gh-7".to_string(), "sandbox-gh-7".to_string());
        let history = HashMap::from([(
            "gh-7".to_string(),
            vec![ChatMessage::system("prompt")],
        )]);
        manager.attach_history_source(std::sync::Arc::new(move || history.clone()));
        manager.save_state().await.unwrap();

        let reloaded = manager_with(&podman, dir.path());
        let histories = reloaded.load_state().await.unwrap();
        assert!(histories.is_empty());
        assert!(reloaded.task_ids().is_empty());
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with("true", dir.path());
        manager.create("task-1").await.unwrap();
        manager.destroy("task-1").await.unwrap();
        manager.destroy("task-1").await.unwrap();
        assert!(manager.task_ids().is_empty());
    }
}

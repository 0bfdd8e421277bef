//! Chat-room channel: the Matrix bot event loop and per-room adapter.

use crate::channels::ChannelAdapter;
use crate::config::Settings;
use crate::decider::CHAT_SYSTEM_PROMPT;
use crate::error::Result;
use crate::matrix::{MatrixClient, RoomEvent, SyncResponse};
use crate::runner::TaskRunner;
use crate::sandbox;

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Greeting posted when the bot accepts a live invite.
const INVITE_GREETING: &str = "[invite] Ready! Send me a task to get started.";

/// Poll interval of the per-room IPC watcher.
const IPC_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Matrix bot: owns the client, the sync loop, and per-room IPC watchers.
/// Each room is one task; the room id is the task id.
pub struct Bot {
    client: Arc<MatrixClient>,
    runner: Arc<TaskRunner>,
    ipc_base_dir: PathBuf,
    joined: Arc<Mutex<HashSet<String>>>,
    next_batch: Mutex<Option<String>>,
    ipc_watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Bot {
    /// Log in to the homeserver and build the bot.
    pub async fn login(settings: &Settings, runner: Arc<TaskRunner>) -> Result<Arc<Self>> {
        let client = MatrixClient::login(
            &settings.matrix_homeserver,
            &settings.matrix_user,
            &settings.matrix_password,
        )
        .await?;
        info!(user_id = %client.user_id, "logged in to chat room");
        Ok(Arc::new(Self {
            client: Arc::new(client),
            runner,
            ipc_base_dir: settings.ipc_base_dir.clone(),
            joined: Arc::new(Mutex::new(HashSet::new())),
            next_batch: Mutex::new(None),
            ipc_watchers: Mutex::new(HashMap::new()),
        }))
    }

    /// Adapter bound to one room. Cheap; built per delivery target.
    pub fn channel(&self, room_id: &str) -> Arc<MatrixChannel> {
        Arc::new(MatrixChannel {
            client: Arc::clone(&self.client),
            joined: Arc::clone(&self.joined),
            room_id: room_id.to_string(),
        })
    }

    /// First sync: record the batch token, register current rooms, and join
    /// invites that piled up while the bot was down, without a greeting
    /// (those invites are stale). Returns the rooms the bot is in.
    pub async fn initial_sync(&self) -> Result<Vec<String>> {
        let response = self.client.sync(None, 10_000).await?;
        *self.next_batch.lock().expect("next_batch lock") = Some(response.next_batch.clone());

        let mut joined: Vec<String> = response.rooms.join.keys().cloned().collect();
        for room_id in response.rooms.invite.keys() {
            info!(room_id, "catch-up join (no greeting)");
            if let Err(error) = self.client.join(room_id).await {
                error!(room_id, %error, "catch-up join failed");
                continue;
            }
            joined.push(room_id.clone());
        }

        *self.joined.lock().expect("joined lock") = joined.iter().cloned().collect();
        info!(rooms = joined.len(), "initial sync complete, now listening");
        Ok(joined)
    }

    /// Long-poll sync loop. Runs until the surrounding select drops it.
    pub async fn sync_forever(&self) {
        loop {
            let since = self.next_batch.lock().expect("next_batch lock").clone();
            match self.client.sync(since.as_deref(), 30_000).await {
                Ok(response) => self.apply_sync(response).await,
                Err(error) => {
                    error!(%error, "sync failed; retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn apply_sync(&self, response: SyncResponse) {
        *self.next_batch.lock().expect("next_batch lock") = Some(response.next_batch);

        for room_id in response.rooms.invite.keys() {
            info!(room_id, "invite received");
            if let Err(error) = self.client.join(room_id).await {
                error!(room_id, %error, "join failed");
                continue;
            }
            self.joined.lock().expect("joined lock").insert(room_id.clone());
            if let Err(error) = self.client.send_text(room_id, INVITE_GREETING).await {
                warn!(room_id, %error, "greeting failed");
            }
        }

        for room_id in response.rooms.leave.keys() {
            info!(room_id, "left room, destroying sandbox");
            self.joined.lock().expect("joined lock").remove(room_id);
            self.stop_ipc_watcher(room_id);
            self.runner.cleanup(room_id).await;
        }

        for (room_id, room) in &response.rooms.join {
            self.joined.lock().expect("joined lock").insert(room_id.clone());
            for event in &room.timeline.events {
                if let Some(text) = event.message_text() {
                    if event.sender == self.client.user_id {
                        continue;
                    }
                    info!(room_id, sender = %event.sender, "room message");
                    self.spawn_ipc_watcher(room_id);
                    self.runner
                        .enqueue(room_id, text, self.channel(room_id) as Arc<dyn ChannelAdapter>);
                } else if event.membership().is_some() {
                    self.handle_member_event(room_id, event).await;
                }
            }
        }
    }

    /// Cleanup when the bot is removed or the last user leaves.
    async fn handle_member_event(&self, room_id: &str, event: &RoomEvent) {
        let membership = event.membership().unwrap_or_default();
        if !matches!(membership, "leave" | "ban") {
            return;
        }

        if event.state_key.as_deref() == Some(self.client.user_id.as_str()) {
            info!(room_id, "bot removed from room, destroying sandbox");
            self.joined.lock().expect("joined lock").remove(room_id);
            self.stop_ipc_watcher(room_id);
            self.runner.cleanup(room_id).await;
            return;
        }

        match self.client.joined_members(room_id).await {
            Ok(members) => {
                let non_bot = members
                    .iter()
                    .any(|member| member != &self.client.user_id);
                if !non_bot {
                    info!(room_id, "all users left, destroying sandbox and leaving");
                    self.stop_ipc_watcher(room_id);
                    self.runner.cleanup(room_id).await;
                    if let Err(error) = self.client.leave(room_id).await {
                        warn!(room_id, %error, "room leave failed");
                    }
                    self.joined.lock().expect("joined lock").remove(room_id);
                }
            }
            Err(error) => warn!(room_id, %error, "member listing failed"),
        }
    }

    /// Start polling the room's IPC scratch dir for hook events. Idempotent.
    fn spawn_ipc_watcher(&self, room_id: &str) {
        let mut watchers = self.ipc_watchers.lock().expect("watchers lock");
        if watchers.contains_key(room_id) {
            return;
        }
        let ipc_dir = self.ipc_base_dir.join(sandbox::container_name(room_id));
        let client = Arc::clone(&self.client);
        let room = room_id.to_string();
        watchers.insert(
            room_id.to_string(),
            tokio::spawn(watch_ipc(client, room, ipc_dir)),
        );
    }

    fn stop_ipc_watcher(&self, room_id: &str) {
        if let Some(handle) = self
            .ipc_watchers
            .lock()
            .expect("watchers lock")
            .remove(room_id)
        {
            handle.abort();
        }
    }

    /// Abort background watchers on shutdown. Containers survive.
    pub fn shutdown(&self) {
        for (_, handle) in self.ipc_watchers.lock().expect("watchers lock").drain() {
            handle.abort();
        }
    }
}

/// Poll the container's IPC files written by the in-container hooks and
/// relay them into the room.
async fn watch_ipc(client: Arc<MatrixClient>, room_id: String, ipc_dir: PathBuf) {
    type Formatter = fn(&Value) -> String;
    const FILES: [(&str, Formatter); 3] = [
        ("notification.json", format_notification),
        ("event-progress.json", format_progress),
        ("event-result.json", format_result),
    ];

    loop {
        tokio::time::sleep(IPC_POLL_INTERVAL).await;
        for (filename, formatter) in FILES {
            let path = ipc_dir.join(filename);
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let body = match serde_json::from_slice::<Value>(&raw) {
                Ok(data) => formatter(&data),
                Err(_) => format!("⚠️ IPC event ({filename}, could not parse)"),
            };
            let _ = tokio::fs::remove_file(&path).await;
            if let Err(error) = client.send_text(&room_id, &body).await {
                warn!(room_id, %error, "IPC relay failed");
            }
        }
    }
}

fn format_notification(data: &Value) -> String {
    let kind = data["notification_type"].as_str().unwrap_or("unknown");
    let message = data["message"].as_str().unwrap_or_default();
    let mut body = format!("⚠️ Agent [{kind}]: {message}");
    if let Some(details) = data.get("details").filter(|d| !d.is_null()) {
        body.push_str(&format!(
            "\nDetails: {}",
            serde_json::to_string_pretty(details).unwrap_or_default()
        ));
    }
    body
}

fn format_progress(data: &Value) -> String {
    let tool = data["tool_name"]
        .as_str()
        .or_else(|| data["name"].as_str())
        .unwrap_or("unknown");
    format!("🔧 Tool completed: {tool}")
}

fn format_result(data: &Value) -> String {
    let cli = data["cli"].as_str().unwrap_or("gemini");
    let exit_code = data["exit_code"]
        .as_i64()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "?".to_string());
    format!("✅ Agent finished ({cli}, exit {exit_code})")
}

/// Per-room channel adapter.
pub struct MatrixChannel {
    client: Arc<MatrixClient>,
    joined: Arc<Mutex<HashSet<String>>>,
    room_id: String,
}

#[async_trait::async_trait]
impl ChannelAdapter for MatrixChannel {
    fn system_prompt(&self) -> &str {
        CHAT_SYSTEM_PROMPT
    }

    async fn start(&self) -> Result<()> {
        // Client lifecycle is owned by the bot.
        Ok(())
    }

    async fn stop(&self) {}

    /// Intermediate output, fenced so terminal escapes read as code.
    async fn send_update(&self, _task_id: &str, text: &str) -> Result<()> {
        self.client
            .send_text(&self.room_id, &format!("```\n{text}\n```"))
            .await
    }

    async fn deliver_result(&self, _task_id: &str, text: &str) -> Result<()> {
        self.client.send_text(&self.room_id, text).await
    }

    async fn deliver_error(&self, _task_id: &str, error: &str) -> Result<()> {
        self.client
            .send_text(&self.room_id, &format!("Error: {error}"))
            .await
    }

    async fn deliver_image(&self, _task_id: &str, image: &[u8]) -> Result<()> {
        self.client
            .send_image(&self.room_id, "screenshot.png", image)
            .await
    }

    /// A chat task is valid while the bot is still in the room.
    async fn is_valid(&self, task_id: &str) -> bool {
        self.joined.lock().expect("joined lock").contains(task_id)
    }
}

//! Code-forge channel: webhook ingress, issue-comment egress via the forge CLI.

use crate::channels::ChannelAdapter;
use crate::config::Settings;
use crate::decider::FORGE_SYSTEM_PROMPT;
use crate::error::{ChannelError, Result};
use crate::runner::TaskRunner;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use hmac::{Hmac, Mac as _};
use serde_json::Value;
use sha2::Sha256;
use std::process::Stdio;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Issues carrying this label are dispatched to the agent.
const AGENT_LABEL: &str = "agent-task";

/// Code-forge adapter: one webhook listener, task ids of the form
/// `gh-<issue_number>`.
pub struct GitHubChannel {
    runner: Arc<TaskRunner>,
    webhook_port: u16,
    webhook_secret: String,
    repo: String,
    gh_path: String,
    server: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

#[derive(Clone)]
struct WebhookState {
    channel: Arc<GitHubChannel>,
}

impl GitHubChannel {
    pub fn new(runner: Arc<TaskRunner>, settings: &Settings) -> Arc<Self> {
        Self::with_cli(runner, settings, "gh")
    }

    fn with_cli(runner: Arc<TaskRunner>, settings: &Settings, gh_path: &str) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            runner,
            webhook_port: settings.github_webhook_port,
            webhook_secret: settings.github_webhook_secret.clone(),
            repo: settings.github_repo.clone(),
            gh_path: gh_path.to_string(),
            server: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/webhook/github", post(handle_webhook))
            .with_state(WebhookState {
                channel: Arc::clone(self),
            })
    }

    async fn run_gh(&self, args: &[&str]) -> Result<(i32, String, String)> {
        let output = tokio::process::Command::new(&self.gh_path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ChannelError::Forge(e.to_string()))?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    async fn post_comment(&self, issue_number: &str, body: &str) {
        match self
            .run_gh(&["issue", "comment", issue_number, "--body", body])
            .await
        {
            Ok((0, _, _)) => {}
            Ok((rc, _, err)) => {
                error!(issue_number, rc, error = %err.trim(), "issue comment failed");
            }
            Err(error) => error!(issue_number, %error, "issue comment failed"),
        }
    }

    /// Existing comment bodies for an issue, one line per entry (the CLI's
    /// `--jq` output is line-oriented).
    async fn list_comment_bodies(&self, repo: &str, issue_number: u64) -> Vec<String> {
        let endpoint = format!("repos/{repo}/issues/{issue_number}/comments");
        match self.run_gh(&["api", &endpoint, "--jq", ".[].body"]).await {
            Ok((0, out, _)) => out
                .trim()
                .split('\n')
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
            Ok((rc, _, err)) => {
                warn!(issue_number, rc, error = %err.trim(), "comment backfill failed");
                Vec::new()
            }
            Err(error) => {
                warn!(issue_number, %error, "comment backfill failed");
                Vec::new()
            }
        }
    }

    fn issue_number(task_id: &str) -> &str {
        task_id.split_once('-').map(|(_, n)| n).unwrap_or(task_id)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for GitHubChannel {
    fn system_prompt(&self) -> &str {
        FORGE_SYSTEM_PROMPT
    }

    async fn start(&self) -> Result<()> {
        let channel = self
            .weak_self
            .upgrade()
            .ok_or_else(|| ChannelError::Forge("channel dropped before start".into()))?;
        let app = channel.router();
        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", self.webhook_port)).await?;
        info!(port = self.webhook_port, "forge webhook listening");
        let handle = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app).await {
                error!(%error, "webhook server exited");
            }
        });
        *self.server.lock().expect("server lock") = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = self.server.lock().expect("server lock").take() {
            handle.abort();
        }
    }

    async fn send_update(&self, _task_id: &str, _text: &str) -> Result<()> {
        // Intermediate output would spam the issue thread.
        Ok(())
    }

    async fn deliver_result(&self, task_id: &str, text: &str) -> Result<()> {
        let issue_number = Self::issue_number(task_id);
        let body = format!("✅ Completed — {text}");
        let (rc, _, err) = self
            .run_gh(&["issue", "comment", issue_number, "--body", &body])
            .await?;
        if rc != 0 {
            return Err(ChannelError::Forge(format!(
                "issue comment failed for #{issue_number}: {}",
                err.trim()
            ))
            .into());
        }

        let (rc, _, err) = self.run_gh(&["issue", "close", issue_number]).await?;
        if rc != 0 {
            return Err(ChannelError::Forge(format!(
                "issue close failed for #{issue_number}: {}",
                err.trim()
            ))
            .into());
        }
        Ok(())
    }

    async fn deliver_error(&self, task_id: &str, error: &str) -> Result<()> {
        let issue_number = Self::issue_number(task_id);
        let body = format!("❌ Failed: {error}");
        let (rc, _, err) = self
            .run_gh(&["issue", "comment", issue_number, "--body", &body])
            .await?;
        if rc != 0 {
            return Err(ChannelError::Forge(format!(
                "issue comment failed for #{issue_number}: {}",
                err.trim()
            ))
            .into());
        }
        Ok(())
    }

    /// Valid while the issue is open and still labelled for the agent.
    async fn is_valid(&self, task_id: &str) -> bool {
        let issue_number = Self::issue_number(task_id);
        let Ok((rc, out, _err)) = self
            .run_gh(&["issue", "view", issue_number, "--json", "state,labels"])
            .await
        else {
            return false;
        };
        if rc != 0 {
            return false;
        }
        let Ok(data) = serde_json::from_str::<Value>(&out) else {
            return false;
        };
        if data["state"].as_str() != Some("OPEN") {
            return false;
        }
        data["labels"]
            .as_array()
            .is_some_and(|labels| {
                labels
                    .iter()
                    .any(|label| label["name"].as_str() == Some(AGENT_LABEL))
            })
    }

    /// Scan for open labelled issues to resume after a restart.
    async fn recover_tasks(&self) -> Vec<(String, String)> {
        if self.repo.is_empty() {
            warn!("GITHUB_REPO not set, skipping crash recovery for forge tasks");
            return Vec::new();
        }

        let listed = self
            .run_gh(&[
                "issue",
                "list",
                "--repo",
                &self.repo,
                "--label",
                AGENT_LABEL,
                "--state",
                "open",
                "--json",
                "number,title,body",
            ])
            .await;
        let issues: Vec<Value> = match listed {
            Ok((0, out, _)) => serde_json::from_str(&out).unwrap_or_default(),
            Ok((rc, _, err)) => {
                error!(rc, error = %err.trim(), "issue list failed");
                return Vec::new();
            }
            Err(error) => {
                error!(%error, "issue list failed");
                return Vec::new();
            }
        };

        let mut recovered = Vec::new();
        for issue in issues {
            let Some(number) = issue["number"].as_u64() else {
                continue;
            };
            let title = issue["title"].as_str().unwrap_or_default();
            let body = issue["body"].as_str().unwrap_or_default();
            recovered.push((format!("gh-{number}"), format!("# {title}\n\n{body}")));

            let (rc, _, err) = match self
                .run_gh(&[
                    "issue",
                    "comment",
                    &number.to_string(),
                    "--repo",
                    &self.repo,
                    "--body",
                    "🤖 Bot restarted — resuming work on this issue.",
                ])
                .await
            {
                Ok(result) => result,
                Err(error) => {
                    error!(number, %error, "restart notice failed");
                    continue;
                }
            };
            if rc != 0 {
                error!(number, rc, error = %err.trim(), "restart notice failed");
            }
        }

        info!(count = recovered.len(), "forge recovery scan complete");
        recovered
    }
}

enum SignatureCheck {
    Valid,
    Missing,
    Invalid,
}

/// Constant-time HMAC-SHA-256 check of the webhook signature header.
fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> SignatureCheck {
    let Some(header) = header else {
        return SignatureCheck::Missing;
    };
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return SignatureCheck::Invalid;
    };
    let Ok(digest) = hex::decode(hex_digest) else {
        return SignatureCheck::Invalid;
    };
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    if mac.verify_slice(&digest).is_ok() {
        SignatureCheck::Valid
    } else {
        SignatureCheck::Invalid
    }
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let channel = &state.channel;

    if !channel.webhook_secret.is_empty() {
        let header = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        match verify_signature(&channel.webhook_secret, &body, header) {
            SignatureCheck::Missing => {
                return (StatusCode::UNAUTHORIZED, "Missing signature");
            }
            SignatureCheck::Invalid => {
                return (StatusCode::UNAUTHORIZED, "Invalid signature");
            }
            SignatureCheck::Valid => {}
        }
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "invalid payload");
    };
    let event = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let action = payload["action"].as_str().unwrap_or_default();

    if event == "issues" && action == "labeled" {
        if payload["label"]["name"].as_str() != Some(AGENT_LABEL) {
            return (StatusCode::OK, "ignored label");
        }
        let issue = &payload["issue"];
        let Some(number) = issue["number"].as_u64() else {
            return (StatusCode::BAD_REQUEST, "invalid payload");
        };
        let task_id = format!("gh-{number}");

        // Idempotent entry: a re-label of a task already in flight is an ack.
        if channel.runner.is_processing(&task_id) {
            return (StatusCode::OK, "already processing");
        }

        channel
            .post_comment(&number.to_string(), "🤖 Working on this issue...")
            .await;

        let repo = payload["repository"]["full_name"].as_str().unwrap_or_default();
        let title = issue["title"].as_str().unwrap_or_default();
        let issue_body = issue["body"].as_str().unwrap_or_default();
        let message = format!("Repository: {repo}\n\n# {title}\n\n{issue_body}");
        channel
            .runner
            .enqueue(&task_id, &message, Arc::clone(channel) as Arc<dyn ChannelAdapter>);
        info!(task_id, "enqueued labelled issue");

        // Backfill earlier discussion so the agent has full context.
        if !repo.is_empty() {
            for comment in channel.list_comment_bodies(repo, number).await {
                channel.runner.enqueue(
                    &task_id,
                    &comment,
                    Arc::clone(channel) as Arc<dyn ChannelAdapter>,
                );
            }
        }
    } else if event == "issue_comment" && action == "created" {
        let issue = &payload["issue"];
        let labelled = issue["labels"]
            .as_array()
            .is_some_and(|labels| {
                labels
                    .iter()
                    .any(|label| label["name"].as_str() == Some(AGENT_LABEL))
            });
        if !labelled {
            return (StatusCode::OK, "not an agent-task issue");
        }

        // The bot's own output must not re-trigger it.
        let sender = payload["comment"]["user"]["login"].as_str().unwrap_or_default();
        let comment_body = payload["comment"]["body"].as_str().unwrap_or_default();
        if sender.ends_with("[bot]")
            || comment_body.starts_with('✅')
            || comment_body.starts_with('❌')
            || comment_body.starts_with('🤖')
        {
            return (StatusCode::OK, "ignoring bot comment");
        }

        let Some(number) = issue["number"].as_u64() else {
            return (StatusCode::BAD_REQUEST, "invalid payload");
        };
        let task_id = format!("gh-{number}");
        channel
            .runner
            .enqueue(&task_id, comment_body, Arc::clone(channel) as Arc<dyn ChannelAdapter>);
        info!(task_id, "enqueued issue comment");
    }

    (StatusCode::ACCEPTED, "Accepted")
}

//! Host-side self-update: pull, rebuild the sandbox image, restart.
//!
//! This is the one tool that operates on the host rather than inside a
//! container. The service restart is delayed so the tool result can still
//! reach the channel before the process goes down.

use crate::UpdateFn;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info};

/// Checkout of the bot's own repository on the host.
const REPO_DIR: &str = "/home/matrix-tui";

/// Timeout for each deploy step, in seconds.
const DEPLOY_TIMEOUT_SECONDS: u64 = 300;

/// Delay before the service restart fires.
const RESTART_DELAY: Duration = Duration::from_secs(2);

async fn run_host(args: &[&str]) -> (i32, String) {
    let mut cmd = Command::new(args[0]);
    cmd.args(&args[1..])
        .current_dir(REPO_DIR)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(error) => return (1, format!("failed to spawn {}: {error}", args[0])),
    };

    match tokio::time::timeout(
        Duration::from_secs(DEPLOY_TIMEOUT_SECONDS),
        child.wait_with_output(),
    )
    .await
    {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(stderr.trim());
            }
            (output.status.code().unwrap_or(-1), text)
        }
        Ok(Err(error)) => (1, error.to_string()),
        Err(_) => (
            1,
            format!("deploy step timed out after {DEPLOY_TIMEOUT_SECONDS}s"),
        ),
    }
}

/// Pull the bot's repository (optionally switching branch first), rebuild
/// the sandbox image, and schedule a service restart.
pub async fn self_update(branch: Option<&str>, update: Option<&UpdateFn>) -> String {
    if let Some(branch) = branch {
        info!(branch, "self-update: fetching and checking out branch");
        let (rc, out) = run_host(&["git", "fetch", "origin"]).await;
        if rc != 0 {
            return format!("git fetch failed (exit {rc}):\n{out}");
        }
        let (rc, out) = run_host(&["git", "checkout", branch]).await;
        if rc != 0 {
            return format!("git checkout {branch} failed (exit {rc}):\n{out}");
        }
    }

    info!("self-update: git pull");
    let (rc, pull_out) = run_host(&["git", "pull"]).await;
    if rc != 0 {
        return format!("git pull failed (exit {rc}):\n{pull_out}");
    }
    if let Some(update) = update {
        update(format!("git pull:\n{pull_out}")).await;
    }

    info!("self-update: rebuilding sandbox image");
    let (rc, build_out) = run_host(&[
        "podman",
        "build",
        "-t",
        "forgebot-sandbox:latest",
        "-f",
        "Containerfile",
        ".",
    ])
    .await;
    if rc != 0 {
        return format!("git pull OK, but image build failed (exit {rc}):\n{build_out}");
    }

    // Restart after a short delay so this result can be delivered first.
    info!("self-update: restarting service");
    tokio::spawn(async {
        tokio::time::sleep(RESTART_DELAY).await;
        match Command::new("systemctl").args(["restart", "forgebot"]).status().await {
            Ok(_) => {}
            Err(err) => error!(%err, "service restart failed"),
        }
    });

    format!("git pull:\n{pull_out}\n\nImage build: OK\n\nRestarting service in 2s...")
}

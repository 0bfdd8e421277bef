//! Branch, commit, push, and open a pull request from inside the sandbox.

use crate::error::Result;
use crate::sandbox::SandboxManager;
use regex::Regex;
use std::sync::LazyLock;
use tracing::info;

static BRANCH_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("hardcoded slug regex"));

/// Derive a branch name from a PR title: lowercased, non-alphanumerics
/// collapsed to `-`, clipped to 50 chars, `agent/` prefix.
pub fn branch_name(title: &str) -> String {
    let lowered = title.to_lowercase();
    let slug = BRANCH_SLUG.replace_all(&lowered, "-");
    let trimmed = slug.trim_matches('-');
    // The slug is pure ASCII at this point, so byte indexing is safe.
    let clipped = &trimmed[..trimmed.len().min(50)];
    format!("agent/{clipped}")
}

/// Single-quote a string for shell safety.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Locate the repo, create a branch, commit everything, push, and open a
/// PR through the forge CLI. Returns the PR URL, or a failure description
/// the model can act on.
pub async fn create_pull_request(
    sandbox: &SandboxManager,
    task_id: &str,
    title: &str,
    body: &str,
) -> Result<String> {
    // The repo is either /workspace itself or a direct subdirectory.
    let (rc, out, _err) = sandbox
        .exec(task_id, "find /workspace -maxdepth 2 -name .git -type d")
        .await?;
    if rc != 0 || out.trim().is_empty() {
        return Ok("Error: No git repository found in /workspace or its subdirectories.".into());
    }
    let repo_dir = out
        .trim()
        .lines()
        .next()
        .unwrap_or_default()
        .trim_end_matches("/.git")
        .to_string();
    info!(task_id, repo = %repo_dir, "found git repo");

    let branch = branch_name(title);
    let commands = [
        format!("git checkout -b {branch}"),
        "git add -A".to_string(),
        format!("git commit -m {}", shell_quote(title)),
        format!("git push -u origin {branch}"),
        format!(
            "gh pr create --title {} --body {}",
            shell_quote(title),
            shell_quote(body)
        ),
    ];

    let mut last_stdout = String::new();
    for command in &commands {
        let (rc, out, err) = sandbox
            .exec(task_id, &format!("cd {repo_dir} && {command}"))
            .await?;
        if rc != 0 {
            let detail = if err.trim().is_empty() { out } else { err };
            return Ok(format!("Failed at `{command}` in {repo_dir}:\n{detail}"));
        }
        last_stdout = out;
    }

    // The last command's stdout carries the PR URL.
    Ok(last_stdout.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_slugs_and_prefixes() {
        assert_eq!(branch_name("Fix login bug"), "agent/fix-login-bug");
        assert_eq!(branch_name("  Add: OAuth2 support!  "), "agent/add-oauth2-support");
    }

    #[test]
    fn branch_name_clips_to_fifty_chars() {
        let title = "a".repeat(80);
        let branch = branch_name(&title);
        assert_eq!(branch.len(), "agent/".len() + 50);
    }

    #[test]
    fn shell_quote_escapes_embedded_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }
}

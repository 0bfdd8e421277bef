//! Tool schemas and dispatch for the decider.

pub mod pull_request;
pub mod self_update;

use crate::UpdateFn;
use crate::error::Result;
use crate::sandbox::{CodingCli, DEFAULT_STREAM_CHUNK_SIZE, SandboxManager};
use serde_json::{Value, json};
use std::sync::LazyLock;
use tracing::info;

/// Cap on tool output fed back into the conversation.
const MAX_TOOL_OUTPUT: usize = 10_000;

/// OpenAI function schemas for every recognised tool.
pub static TOOL_SCHEMAS: LazyLock<Vec<Value>> = LazyLock::new(|| {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "run_command",
                "description": "Run a shell command in the sandbox container. Returns stdout/stderr.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "command": {"type": "string", "description": "The shell command to execute"}
                    },
                    "required": ["command"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "write_file",
                "description": "Write content to a file in the sandbox container.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Absolute path in the container"},
                        "content": {"type": "string", "description": "File content to write"}
                    },
                    "required": ["path", "content"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "read_file",
                "description": "Read a file from the sandbox container.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Absolute path in the container"}
                    },
                    "required": ["path"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "plan",
                "description": "Ask the analysis CLI to plan, analyze, or explain (1M token context). \
                    Use for: writing implementation plans, analyzing codebases, first-principles thinking, \
                    checking if a solution is the simplest approach. It can read entire repos at once.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "task": {"type": "string", "description": "What to plan or analyze. Be specific about goals and constraints."}
                    },
                    "required": ["task"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "implement",
                "description": "Ask the code-writing CLI to write or modify code. \
                    Use for: implementing features, fixing bugs, refactoring, writing tests. \
                    Pass the plan or requirements in the task description.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "task": {"type": "string", "description": "What to implement. Include the plan, specific files, and acceptance criteria."}
                    },
                    "required": ["task"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "review",
                "description": "Ask the analysis CLI to review code changes (1M token context). \
                    Use after implementation to check for bugs, security issues, \
                    missed edge cases, and adherence to project conventions.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "task": {"type": "string", "description": "What to review. Reference specific files or describe what changed."}
                    },
                    "required": ["task"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "run_tests",
                "description": "Run lint (ruff) and tests (pytest) in the sandbox container. \
                    Call this after writing or modifying code to verify the build is clean. \
                    Returns pass/fail status and any errors.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Directory to run tests in. Defaults to /workspace."}
                    }
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "self_update",
                "description": "Update the bot itself on the host: git pull + rebuild sandbox image + restart service. \
                    Use this when the user asks to update the bot, pull latest changes, or restart the service. \
                    This operates on the HOST, not inside the sandbox container.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "branch": {"type": "string", "description": "Git branch to checkout before pulling. Defaults to current branch (usually main)."}
                    }
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "take_screenshot",
                "description": "Take a browser screenshot of a URL accessible from inside the container. \
                    Use this after starting a web server to see the result.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "url": {"type": "string", "description": "URL to screenshot (e.g. http://localhost:3000)"}
                    },
                    "required": ["url"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "create_pull_request",
                "description": "Create a git branch, commit all changes, push, and open a pull request. Returns the PR URL.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "title": {"type": "string", "description": "PR title"},
                        "body": {"type": "string", "description": "PR body (reference the issue, e.g. 'Closes #42')"}
                    },
                    "required": ["title", "body"]
                }
            }
        }),
    ]
});

fn truncate_output(mut output: String) -> String {
    if output.len() > MAX_TOOL_OUTPUT {
        let mut end = MAX_TOOL_OUTPUT;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        output.truncate(end);
        output.push_str("\n... (truncated)");
    }
    output
}

/// Assemble command output the way the model expects it: stdout first,
/// stderr and exit code annotated only when present.
fn format_command_output(rc: i32, stdout: String, stderr: &str) -> String {
    let mut output = stdout;
    if !stderr.is_empty() {
        output.push_str(&format!("\nSTDERR:\n{stderr}"));
    }
    if rc != 0 {
        output.push_str(&format!("\n[exit code: {rc}]"));
    }
    truncate_output(output)
}

/// Resolve a tool call to its effect on the sandbox. Returns the textual
/// result plus an optional image payload. Unrecognised names come back as
/// text so the model can correct itself.
pub async fn execute_tool(
    sandbox: &SandboxManager,
    task_id: &str,
    name: &str,
    arguments: &str,
    update: Option<&UpdateFn>,
) -> Result<(String, Option<Vec<u8>>)> {
    let args: Value = if arguments.trim().is_empty() {
        json!({})
    } else {
        match serde_json::from_str(arguments) {
            Ok(parsed) => parsed,
            Err(error) => return Ok((format!("Error: invalid tool arguments: {error}"), None)),
        }
    };

    match name {
        "run_command" => {
            let command = args["command"].as_str().unwrap_or_default();
            let (rc, stdout, stderr) = sandbox.exec(task_id, command).await?;
            Ok((format_command_output(rc, stdout, &stderr), None))
        }

        "write_file" => {
            let path = args["path"].as_str().unwrap_or_default();
            let content = args["content"].as_str().unwrap_or_default();
            Ok((sandbox.write_file(task_id, path, content).await?, None))
        }

        "read_file" => {
            let path = args["path"].as_str().unwrap_or_default();
            let contents = sandbox.read_file(task_id, path).await?;
            Ok((truncate_output(contents), None))
        }

        "plan" | "implement" | "review" => {
            let task = args["task"].as_str().unwrap_or_default();
            let cli = if name == "implement" {
                CodingCli::Qwen
            } else {
                CodingCli::Gemini
            };
            info!(task_id, tool = name, ?cli, "routing to coding sub-agent");
            let (rc, stdout, stderr) = match update {
                Some(on_chunk) => {
                    sandbox
                        .code_stream(task_id, task, on_chunk, cli, DEFAULT_STREAM_CHUNK_SIZE, true)
                        .await?
                }
                None => sandbox.code(task_id, task, cli, true).await?,
            };
            Ok((format_command_output(rc, stdout, &stderr), None))
        }

        "run_tests" => {
            let path = args["path"].as_str().unwrap_or("/workspace");
            let (lint_rc, lint_out, lint_err) =
                sandbox.exec(task_id, &format!("cd {path} && ruff check .")).await?;
            let (test_rc, test_out, test_err) = sandbox
                .exec(task_id, &format!("cd {path} && pytest -v 2>&1 || true"))
                .await?;
            let lint_result = first_non_empty(&[&lint_out, &lint_err], "No issues.");
            let test_result = first_non_empty(&[&test_out, &test_err], "No output.");
            let status = if lint_rc == 0 && test_rc == 0 { "PASS" } else { "FAIL" };
            Ok((
                truncate_output(format!(
                    "[{status}]\n\n=== Lint (ruff) ===\n{lint_result}\n\n=== Tests (pytest) ===\n{test_result}"
                )),
                None,
            ))
        }

        "self_update" => {
            let branch = args["branch"].as_str();
            Ok((self_update::self_update(branch, update).await, None))
        }

        "take_screenshot" => {
            let url = args["url"].as_str().unwrap_or_default();
            match sandbox.screenshot(task_id, url).await? {
                Some(image) => Ok(("Screenshot taken successfully.".into(), Some(image))),
                None => Ok(("Screenshot failed.".into(), None)),
            }
        }

        "create_pull_request" => {
            let title = args["title"].as_str().unwrap_or_default();
            let body = args["body"].as_str().unwrap_or_default();
            let result = pull_request::create_pull_request(sandbox, task_id, title, body).await?;
            Ok((result, None))
        }

        _ => Ok((format!("Unknown tool: {name}"), None)),
    }
}

fn first_non_empty<'a>(candidates: &[&'a str], fallback: &'a str) -> &'a str {
    candidates
        .iter()
        .copied()
        .find(|c| !c.trim().is_empty())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn test_sandbox(dir: &std::path::Path) -> SandboxManager {
        SandboxManager::new(Settings::for_tests(dir.join("state.json")))
    }

    #[tokio::test]
    async fn unknown_tool_is_text_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = test_sandbox(dir.path());
        let (text, image) = execute_tool(&sandbox, "t", "bogus", "{}", None).await.unwrap();
        assert_eq!(text, "Unknown tool: bogus");
        assert!(image.is_none());
    }

    #[tokio::test]
    async fn invalid_arguments_are_reported_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = test_sandbox(dir.path());
        let (text, _) = execute_tool(&sandbox, "t", "run_command", "{not json", None)
            .await
            .unwrap();
        assert!(text.starts_with("Error: invalid tool arguments"));
    }

    #[test]
    fn command_output_annotates_stderr_and_exit_code() {
        let formatted = format_command_output(2, "out\n".into(), "boom");
        assert!(formatted.contains("out\n"));
        assert!(formatted.contains("STDERR:\nboom"));
        assert!(formatted.contains("[exit code: 2]"));

        let clean = format_command_output(0, "fine".into(), "");
        assert_eq!(clean, "fine");
    }

    #[test]
    fn long_output_is_truncated_with_marker() {
        let formatted = truncate_output("x".repeat(20_000));
        assert!(formatted.len() < 20_000);
        assert!(formatted.ends_with("\n... (truncated)"));
    }

    #[test]
    fn every_tool_has_a_schema() {
        let names: Vec<&str> = TOOL_SCHEMAS
            .iter()
            .map(|s| s["function"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            [
                "run_command",
                "write_file",
                "read_file",
                "plan",
                "implement",
                "review",
                "run_tests",
                "self_update",
                "take_screenshot",
                "create_pull_request",
            ]
        );
    }
}

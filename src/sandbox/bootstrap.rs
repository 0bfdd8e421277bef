//! Bootstrap files written into every freshly created container.
//!
//! The hook scripts bridge the in-container coding CLIs back to the host:
//! each writes its stdin payload into `/workspace/.ipc/`, which is
//! bind-mounted from the host and polled by the chat channel's IPC watcher.

/// One file of the bootstrap suite.
pub struct BootstrapFile {
    pub path: &'static str,
    pub content: &'static str,
    pub executable: bool,
}

/// The fixed suite, written in order on container creation.
pub const BOOTSTRAP_FILES: &[BootstrapFile] = &[
    BootstrapFile {
        path: "/workspace/status.md",
        content: "# Worklog\n\nAppend-only log of agent activity in this workspace.\n",
        executable: false,
    },
    BootstrapFile {
        path: "/workspace/GEMINI.md",
        content: r#"# Workspace conventions

@status.md

- All work happens under /workspace.
- Append a line to status.md after every completed step.
- Never delete status.md entries; the log is append-only.
"#,
        executable: false,
    },
    BootstrapFile {
        path: "/workspace/.gemini/settings.json",
        content: r#"{
  "hooks": {
    "AfterAgent": [{"command": "/workspace/.gemini/hooks/after-agent.sh"}],
    "AfterTool": [{"command": "/workspace/.gemini/hooks/after-tool.sh"}],
    "Notification": [{"command": "/workspace/.gemini/hooks/notification.sh"}]
  }
}
"#,
        executable: false,
    },
    BootstrapFile {
        path: "/workspace/.gemini/hooks/after-agent.sh",
        content: r#"#!/bin/sh
payload=$(cat)
printf '%s' "$payload" > /workspace/.ipc/event-result.json
echo "$(date -u +%Y-%m-%dT%H:%M:%SZ) agent turn finished" >> /workspace/status.md
echo '{"continue": true}'
"#,
        executable: true,
    },
    BootstrapFile {
        path: "/workspace/.gemini/hooks/after-tool.sh",
        content: r#"#!/bin/sh
cat > /workspace/.ipc/event-progress.json
echo '{}'
"#,
        executable: true,
    },
    BootstrapFile {
        path: "/workspace/.gemini/hooks/notification.sh",
        content: r#"#!/bin/sh
cat > /workspace/.ipc/notification.json
echo '{}'
"#,
        executable: true,
    },
    // The code-writing CLI has no hook support, so a wrapper writes the
    // completion event itself.
    BootstrapFile {
        path: "/workspace/.qwen-wrapper.sh",
        content: r#"#!/bin/sh
qwen "$@"
rc=$?
printf '{"cli": "qwen", "exit_code": %d}' "$rc" > /workspace/.ipc/event-result.json
exit $rc
"#,
        executable: true,
    },
    BootstrapFile {
        path: "/root/.qwen/settings.json",
        content: r#"{
  "modelProvider": "dashscope",
  "model": "qwen3-coder-plus",
  "apiKeyEnv": "DASHSCOPE_API_KEY",
  "baseUrl": "https://dashscope.aliyuncs.com/compatible-mode/v1"
}
"#,
        executable: false,
    },
];

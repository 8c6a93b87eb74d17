use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::process::{self, ProcessOutput};
use super::{
    AUTH_CHECK_PROMPT, AUTH_CHECK_TIMEOUT, DEFAULT_RUN_TIMEOUT, Invocation, ToolAdapter,
    auth_file_exists, home_path, log_output, resolve_work_dir,
};
use crate::config;

pub const NAME: &str = "gemini";

const AUTH_FILES: [&str; 2] = [".gemini/oauth_creds.json", ".gemini/google_accounts.json"];
const MOUNT_ROOTS: [&str; 4] = ["/out", "/app", "/gemini", "/codex"];

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub bin: String,
    pub model: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        Self::from_env_with(config::process_env)
    }

    pub fn from_env_with<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            bin: config::string_or(&get, "GEMINI_CMD", "gemini"),
            model: config::string(&get, "GEMINI_MODEL"),
            work_dir: resolve_work_dir(None, &get),
            timeout: config::secs_or(&get, "CRAWL_TOOL_TIMEOUT_SECS", DEFAULT_RUN_TIMEOUT),
        }
    }
}

/// Drives the gemini CLI in non-interactive JSON mode with browser tools
/// auto-approved.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    config: GeminiConfig,
}

impl GeminiAdapter {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }

    fn command(&self, invocation: &Invocation<'_>, include_dirs: &[PathBuf]) -> Command {
        let mut cmd = Command::new(&self.config.bin);
        cmd.args(["-o", "json"]);
        if let Some(model) = invocation.model.or(self.config.model.as_deref()) {
            cmd.args(["--model", model]);
        }
        cmd.args(["--approval-mode", "yolo"]);
        for dir in include_dirs {
            cmd.arg("--include-directories");
            cmd.arg(dir);
        }
        cmd.args(["--allowed-mcp-server-names", "chrome-devtools"]);
        cmd.args(["--prompt", invocation.prompt]);
        if let Some(dir) = &self.config.work_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn exec(
        &self,
        invocation: &Invocation<'_>,
        timeout: Duration,
    ) -> anyhow::Result<String> {
        let include_dirs = include_directories(self.config.work_dir.as_deref());
        let cmd = self.command(invocation, &include_dirs);

        tracing::info!(
            bin = %self.config.bin,
            url = invocation.url,
            model = ?invocation.model.or(self.config.model.as_deref()),
            include_dirs = include_dirs.len(),
            "gemini exec"
        );

        let output = process::run(cmd, None, timeout, invocation.cancel)
            .await
            .and_then(ProcessOutput::ensure_success)
            .with_context(|| format!("gemini: {}", self.config.bin))?;
        tracing::info!(
            url = invocation.url,
            elapsed_ms = output.elapsed.as_millis() as u64,
            "gemini finished"
        );

        Ok(unwrap_response(&output.stdout).unwrap_or(output.stdout))
    }

    /// Sends a trivial prompt and expects a clean exit.
    async fn run_auth_check(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let check = Invocation {
            url: "",
            prompt: AUTH_CHECK_PROMPT,
            model: None,
            skip_git_repo_check: false,
            cancel,
        };
        match self.exec(&check, AUTH_CHECK_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(err) if process::is_timeout(&err) => anyhow::bail!("gemini auth check: timeout"),
            Err(err) => Err(err.context("seems like gemini is not authenticated")),
        }
    }
}

#[async_trait]
impl ToolAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, invocation: &Invocation<'_>) -> anyhow::Result<String> {
        let text = self.exec(invocation, self.config.timeout).await?;
        log_output(NAME, invocation.url, &text);
        Ok(text)
    }

    async fn check_auth(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut found = false;
        for relative in AUTH_FILES {
            if auth_file_exists(&home_path(relative)?).await? {
                found = true;
                break;
            }
        }
        if !found {
            anyhow::bail!("gemini auth files not found under ~/.gemini");
        }

        self.run_auth_check(cancel).await
    }

    fn supports_output_limits(&self) -> bool {
        true
    }
}

/// Existing directories the agent may read and write artifacts under.
fn include_directories(work_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = MOUNT_ROOTS.iter().map(PathBuf::from).collect::<Vec<_>>();
    if let Some(dir) = work_dir {
        candidates.push(dir.to_path_buf());
        for sub in ["out", "gemini", "codex"] {
            candidates.push(dir.join(sub));
        }
    }

    let mut dirs: Vec<PathBuf> = Vec::new();
    for dir in candidates {
        if dir.is_dir() && !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

/// `gemini -o json` wraps the answer as `{"response": ...}`. Returns the inner
/// answer, or `None` when `raw` is not such a wrapper.
pub fn unwrap_response(raw: &str) -> Option<String> {
    let Ok(Value::Object(wrapper)) = serde_json::from_str::<Value>(raw.trim()) else {
        return None;
    };
    match wrapper.get("response")? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_owned()),
        Value::Object(obj) => serde_json::to_string(obj).ok(),
        _ => None,
    }
}

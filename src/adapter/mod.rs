//! External agent CLIs behind one capability contract.
//!
//! The orchestrator only ever picks an adapter by name from an
//! [`AdapterRegistry`]; flags, output unwrapping and auth probing stay inside
//! each adapter.

pub mod codex;
pub mod gemini;
pub mod process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config;

pub const AUTH_CHECK_TIMEOUT: Duration = Duration::from_secs(20);
pub const AUTH_CHECK_PROMPT: &str = "Return exactly: OK";
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(900);

const OUTPUT_LOG_MAX_CHARS: usize = 8000;

/// One agent run: what to crawl, what to say, and per-request overrides.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub url: &'a str,
    pub prompt: &'a str,
    pub model: Option<&'a str>,
    pub skip_git_repo_check: bool,
    pub cancel: &'a CancellationToken,
}

impl<'a> Invocation<'a> {
    /// Same invocation with a different prompt.
    pub fn with_prompt<'b>(&self, prompt: &'b str) -> Invocation<'b>
    where
        'a: 'b,
    {
        Invocation {
            url: self.url,
            prompt,
            model: self.model,
            skip_git_repo_check: self.skip_git_repo_check,
            cancel: self.cancel,
        }
    }
}

#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the agent once and returns its answer text.
    async fn run(&self, invocation: &Invocation<'_>) -> anyhow::Result<String>;

    /// Best-effort credential check. Failure is advisory. The check stops
    /// when `cancel` fires.
    async fn check_auth(&self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Whether re-prompting with explicit output-size limits is worth a try
    /// when this tool's output comes back truncated.
    fn supports_output_limits(&self) -> bool {
        false
    }
}

/// Name-keyed adapter table, built once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    pub fn new(adapters: Vec<Arc<dyn ToolAdapter>>) -> anyhow::Result<Self> {
        let mut table = HashMap::with_capacity(adapters.len());
        for adapter in adapters {
            let name = adapter.name().to_owned();
            if table.insert(name.clone(), adapter).is_some() {
                anyhow::bail!("duplicate adapter name: {name}");
            }
        }
        Ok(Self { adapters: table })
    }

    /// The codex and gemini adapters, configured from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(vec![
            Arc::new(codex::CodexAdapter::new(codex::CodexConfig::from_env())),
            Arc::new(gemini::GeminiAdapter::new(gemini::GeminiConfig::from_env())),
        ])
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names = self.adapters.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }
}

/// Working directory for agent subprocesses: explicit, then `RUNNER_WORKDIR`,
/// else inherited.
pub fn resolve_work_dir<F>(explicit: Option<PathBuf>, get: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    explicit
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(|| config::string(get, "RUNNER_WORKDIR").map(PathBuf::from))
}

pub fn home_path(relative: &str) -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .context("resolve home directory: HOME is not set")?;
    Ok(PathBuf::from(home).join(relative))
}

/// `Ok(false)` when the file does not exist; an error when it cannot be
/// inspected or is a directory.
pub async fn auth_file_exists(path: &Path) -> anyhow::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => anyhow::bail!("{} is a directory", path.display()),
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

/// Logs agent output at debug level, capped in size.
pub(crate) fn log_output(tool: &str, url: &str, output: &str) {
    if output.is_empty() {
        tracing::debug!(tool, url, empty = true, "llm output");
        return;
    }
    let (preview, truncated) = process::preview(output, OUTPUT_LOG_MAX_CHARS);
    tracing::debug!(tool, url, truncated, output = %preview, "llm output");
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::process::{self, ProcessOutput};
use super::{
    AUTH_CHECK_PROMPT, AUTH_CHECK_TIMEOUT, DEFAULT_RUN_TIMEOUT, Invocation, ToolAdapter,
    auth_file_exists, home_path, log_output, resolve_work_dir,
};
use crate::config;

pub const NAME: &str = "codex";

#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub bin: String,
    pub model: Option<String>,
    pub skip_git_repo_check: bool,
    pub work_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl CodexConfig {
    pub fn from_env() -> Self {
        Self::from_env_with(config::process_env)
    }

    pub fn from_env_with<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            bin: config::string_or(&get, "CODEX_CMD", "codex"),
            model: config::string(&get, "CODEX_MODEL"),
            skip_git_repo_check: config::bool_or(&get, "CODEX_SKIP_GIT_REPO_CHECK", false),
            work_dir: resolve_work_dir(None, &get),
            timeout: config::secs_or(&get, "CRAWL_TOOL_TIMEOUT_SECS", DEFAULT_RUN_TIMEOUT),
        }
    }
}

/// Drives `codex exec` with the prompt on stdin. The answer is the agent's
/// last message, written to a temp file; stdout is used when that is empty.
#[derive(Debug, Clone)]
pub struct CodexAdapter {
    config: CodexConfig,
}

impl CodexAdapter {
    pub fn new(config: CodexConfig) -> Self {
        Self { config }
    }

    fn command(&self, invocation: &Invocation<'_>, output_path: &Path) -> Command {
        let mut cmd = Command::new(&self.config.bin);
        cmd.arg("exec");
        if invocation.skip_git_repo_check || self.config.skip_git_repo_check {
            cmd.arg("--skip-git-repo-check");
        }
        if let Some(model) = invocation.model.or(self.config.model.as_deref()) {
            cmd.args(["--model", model]);
        }
        cmd.args(["--color", "never", "--output-last-message"]);
        cmd.arg(output_path);
        cmd.arg("-");
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
        let output_file =
            tempfile::NamedTempFile::new().context("create codex output temp file")?;
        let cmd = self.command(invocation, output_file.path());

        tracing::info!(
            bin = %self.config.bin,
            url = invocation.url,
            model = ?invocation.model.or(self.config.model.as_deref()),
            "codex exec"
        );

        let output = process::run(cmd, Some(invocation.prompt), timeout, invocation.cancel)
            .await
            .and_then(ProcessOutput::ensure_success)
            .with_context(|| format!("codex: {}", self.config.bin))?;
        tracing::info!(
            url = invocation.url,
            elapsed_ms = output.elapsed.as_millis() as u64,
            "codex finished"
        );

        let last_message = tokio::fs::read_to_string(output_file.path())
            .await
            .context("read codex last message")?;
        if last_message.trim().is_empty() {
            Ok(output.stdout)
        } else {
            Ok(last_message)
        }
    }

    /// Sends a trivial prompt and expects a clean exit.
    async fn run_auth_check(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let check = Invocation {
            url: "",
            prompt: AUTH_CHECK_PROMPT,
            model: None,
            skip_git_repo_check: true,
            cancel,
        };
        match self.exec(&check, AUTH_CHECK_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(err) if process::is_timeout(&err) => anyhow::bail!("codex auth check: timeout"),
            Err(err) => Err(err.context("seems like codex is not authenticated")),
        }
    }
}

#[async_trait]
impl ToolAdapter for CodexAdapter {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, invocation: &Invocation<'_>) -> anyhow::Result<String> {
        let text = self.exec(invocation, self.config.timeout).await?;
        log_output(NAME, invocation.url, &text);
        Ok(text)
    }

    async fn check_auth(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let auth_file = home_path(".codex/auth.json")?;
        if !auth_file_exists(&auth_file).await? {
            anyhow::bail!("codex auth file not found: {}", auth_file.display());
        }

        self.run_auth_check(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use super::*;

    fn adapter(bin: &str) -> CodexAdapter {
        CodexAdapter::new(CodexConfig {
            bin: bin.to_owned(),
            model: Some("gpt-default".to_owned()),
            skip_git_repo_check: false,
            work_dir: None,
            timeout: Duration::from_secs(10),
        })
    }

    fn args(cmd: &Command) -> Vec<&OsStr> {
        cmd.as_std().get_args().collect()
    }

    #[test]
    fn config_reads_env_with_defaults() {
        let config = CodexConfig::from_env_with(|key: &str| match key {
            "CODEX_CMD" => Some("/opt/codex".to_owned()),
            "CODEX_SKIP_GIT_REPO_CHECK" => Some("true".to_owned()),
            "CRAWL_TOOL_TIMEOUT_SECS" => Some("60".to_owned()),
            _ => None,
        });
        assert_eq!(config.bin, "/opt/codex");
        assert_eq!(config.model, None);
        assert!(config.skip_git_repo_check);
        assert_eq!(config.timeout, Duration::from_secs(60));

        let config = CodexConfig::from_env_with(|_: &str| None);
        assert_eq!(config.bin, "codex");
        assert_eq!(config.timeout, DEFAULT_RUN_TIMEOUT);
    }

    #[test]
    fn request_overrides_reach_the_command_line() {
        let cancel = CancellationToken::new();
        let invocation = Invocation {
            url: "https://shopee.tw/p",
            prompt: "crawl",
            model: Some("gpt-override"),
            skip_git_repo_check: true,
            cancel: &cancel,
        };
        let cmd = adapter("codex").command(&invocation, Path::new("/tmp/last.txt"));
        assert_eq!(
            args(&cmd),
            [
                "exec",
                "--skip-git-repo-check",
                "--model",
                "gpt-override",
                "--color",
                "never",
                "--output-last-message",
                "/tmp/last.txt",
                "-",
            ]
        );

        let invocation = Invocation {
            model: None,
            skip_git_repo_check: false,
            ..invocation
        };
        let cmd = adapter("codex").command(&invocation, Path::new("/tmp/last.txt"));
        let args = args(&cmd);
        assert!(!args.contains(&OsStr::new("--skip-git-repo-check")));
        assert!(args.contains(&OsStr::new("gpt-default")));
    }

    #[tokio::test]
    async fn returns_last_message_file_contents() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("codex.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             out=''\n\
             while [ $# -gt 0 ]; do\n\
               if [ \"$1\" = --output-last-message ]; then out=\"$2\"; fi\n\
               shift\n\
             done\n\
             cat >/dev/null\n\
             echo 'progress noise'\n\
             printf '{\"status\":\"ok\"}' > \"$out\"\n",
        )
        .unwrap();
        make_executable(&script);

        let cancel = CancellationToken::new();
        let invocation = Invocation {
            url: "https://shopee.tw/p",
            prompt: "crawl",
            model: None,
            skip_git_repo_check: false,
            cancel: &cancel,
        };
        let text = adapter(script.to_str().unwrap())
            .run(&invocation)
            .await
            .unwrap();
        assert_eq!(text, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn falls_back_to_stdout_and_reports_failures() {
        let temp = tempfile::TempDir::new().unwrap();
        let ok = temp.path().join("ok.sh");
        std::fs::write(&ok, "#!/bin/sh\ncat >/dev/null\necho '{\"status\":\"ok\"}'\n").unwrap();
        make_executable(&ok);
        let failing = temp.path().join("fail.sh");
        std::fs::write(&failing, "#!/bin/sh\necho 'rate limited' >&2\nexit 2\n").unwrap();
        make_executable(&failing);

        let cancel = CancellationToken::new();
        let invocation = Invocation {
            url: "https://shopee.tw/p",
            prompt: "crawl",
            model: None,
            skip_git_repo_check: false,
            cancel: &cancel,
        };

        let text = adapter(ok.to_str().unwrap()).run(&invocation).await.unwrap();
        assert_eq!(text.trim(), r#"{"status":"ok"}"#);

        let err = adapter(failing.to_str().unwrap())
            .run(&invocation)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("rate limited"), "{err:#}");
    }

    #[tokio::test]
    async fn lingering_helper_does_not_hide_the_last_message() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("codex.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             out=''\n\
             while [ $# -gt 0 ]; do\n\
               if [ \"$1\" = --output-last-message ]; then out=\"$2\"; fi\n\
               shift\n\
             done\n\
             cat >/dev/null\n\
             printf '{\"status\":\"ok\"}' > \"$out\"\n\
             ( sleep 30 ) &\n\
             exit 0\n",
        )
        .unwrap();
        make_executable(&script);

        let cancel = CancellationToken::new();
        let invocation = Invocation {
            url: "https://shopee.tw/p",
            prompt: "crawl",
            model: None,
            skip_git_repo_check: false,
            cancel: &cancel,
        };
        let text = adapter(script.to_str().unwrap())
            .run(&invocation)
            .await
            .unwrap();
        assert_eq!(text, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_auth_check() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("codex.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 60\n").unwrap();
        make_executable(&script);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = adapter(script.to_str().unwrap())
            .run_auth_check(&cancel)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            err.root_cause().downcast_ref::<process::Interrupted>(),
            Some(&process::Interrupted::Cancelled)
        );
        assert!(format!("{err:#}").contains("not authenticated"), "{err:#}");
    }

    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt as _;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
}

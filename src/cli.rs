use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Crawl one product page and print the canonical result.
    Crawl(CrawlArgs),
    /// Check agent CLI credentials.
    AuthCheck(AuthCheckArgs),
    /// Check that the browser DevTools endpoint answers.
    ChromeCheck(ChromeCheckArgs),
}

#[derive(Debug, Args)]
pub struct CrawlArgs {
    /// Product page URL (Shopee, Taobao or Tmall).
    #[arg(long)]
    pub url: String,

    /// Directory for result files and run artifacts.
    #[arg(long, default_value = "out")]
    pub out: PathBuf,

    /// Agent CLI to drive (codex or gemini). Defaults to `CRAWL_TOOL`, then codex.
    #[arg(long)]
    pub tool: Option<String>,

    /// Prompt mode (legacy or skill). Defaults to `CRAWL_PROMPT_MODE`.
    #[arg(long)]
    pub prompt_mode: Option<String>,

    /// Prompt template with a `{{URL}}` placeholder (legacy mode only).
    #[arg(long)]
    pub prompt_file: Option<PathBuf>,

    /// Agent skill to invoke (implies skill mode).
    #[arg(long)]
    pub skill: Option<String>,

    /// Run id scoping the artifact directory `<out>/artifacts/<run-id>`.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Model override passed to the agent CLI.
    #[arg(long)]
    pub model: Option<String>,

    /// Let codex run outside a git repository.
    #[arg(long)]
    pub skip_git_repo_check: bool,
}

#[derive(Debug, Args)]
pub struct AuthCheckArgs {
    /// Only check this tool (default: all registered tools).
    #[arg(long)]
    pub tool: Option<String>,
}

#[derive(Debug, Args)]
pub struct ChromeCheckArgs {
    /// DevTools host. Defaults to `CHROME_DEBUG_HOST`, then 127.0.0.1
    /// (host.docker.internal inside containers).
    #[arg(long)]
    pub host: Option<String>,

    /// DevTools port. Defaults to `CHROME_DEBUG_PORT`, then 9222.
    #[arg(long)]
    pub port: Option<String>,

    /// Full version endpoint URL; overrides host and port.
    #[arg(long)]
    pub url: Option<String>,

    /// Request timeout.
    #[arg(long, default_value_t = crate::devtools::DEFAULT_TIMEOUT.as_secs())]
    pub timeout_secs: u64,
}

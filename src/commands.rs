use std::time::Duration;

use anyhow::Context as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::AdapterRegistry;
use crate::cli::{AuthCheckArgs, ChromeCheckArgs, CrawlArgs};
use crate::devtools::{self, DevtoolsConfig};
use crate::orchestrator::CrawlService;
use crate::request::CrawlRequest;

pub async fn crawl(args: CrawlArgs) -> anyhow::Result<()> {
    let service = CrawlService::from_env().context("build crawl service")?;
    let request = CrawlRequest {
        url: args.url,
        out_dir: args.out,
        tool: args.tool,
        prompt_mode: args.prompt_mode,
        prompt_file: args.prompt_file,
        skill_name: args.skill,
        run_id: args.run_id,
        model: args.model,
        skip_git_repo_check: args.skip_git_repo_check,
    };

    let (cancel, interrupt) = cancel_on_interrupt();
    let outcome = service.run_once(&request, &cancel).await;
    interrupt.abort();

    println!(
        "{}",
        serde_json::to_string_pretty(&outcome.result).context("serialize result")?
    );
    if let Some(path) = &outcome.artifact_path {
        tracing::info!(path = %path.display(), "result file");
    }
    match outcome.error {
        Some(err) => Err(anyhow::Error::new(err)),
        None => Ok(()),
    }
}

pub async fn auth_check(args: AuthCheckArgs) -> anyhow::Result<()> {
    let registry = AdapterRegistry::from_env().context("build adapters")?;
    let names = match args.tool.as_deref().map(str::trim) {
        Some(tool) => vec![tool.to_ascii_lowercase()],
        None => registry.names().into_iter().map(str::to_owned).collect(),
    };

    let (cancel, interrupt) = cancel_on_interrupt();
    let mut failed = Vec::new();
    for name in names {
        let adapter = registry
            .get(&name)
            .with_context(|| format!("unknown tool {name:?}"))?;
        match adapter.check_auth(&cancel).await {
            Ok(()) => println!("{name}: ok"),
            Err(err) => {
                println!("{name}: {err:#}");
                failed.push(name);
            }
        }
    }
    interrupt.abort();

    if !failed.is_empty() {
        anyhow::bail!("auth check failed for {}", failed.join(", "));
    }
    Ok(())
}

pub async fn chrome_check(args: ChromeCheckArgs) -> anyhow::Result<()> {
    let url = match args.url {
        Some(url) => url,
        None => {
            let env = DevtoolsConfig::from_env();
            let config = DevtoolsConfig {
                host: args.host.or(env.host),
                port: args.port.or(env.port),
            };
            devtools::resolve_version_url(&config).await
        }
    };

    let version = devtools::check_reachable(&url, Duration::from_secs(args.timeout_secs))
        .await
        .with_context(|| format!("chrome devtools not reachable at {url}"))?;
    println!("{} ({url})", version.browser);
    Ok(())
}

/// A token cancelled on Ctrl-C, and the watcher task to abort when done.
fn cancel_on_interrupt() -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping agent");
                cancel.cancel();
            }
        })
    };
    (cancel, watcher)
}

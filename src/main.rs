use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    product_miner::logging::init().context("init logging")?;

    let cli = product_miner::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        product_miner::cli::Command::Crawl(args) => {
            product_miner::commands::crawl(args).await.context("crawl")?;
        }
        product_miner::cli::Command::AuthCheck(args) => {
            product_miner::commands::auth_check(args)
                .await
                .context("auth-check")?;
        }
        product_miner::cli::Command::ChromeCheck(args) => {
            product_miner::commands::chrome_check(args)
                .await
                .context("chrome-check")?;
        }
    }

    Ok(())
}

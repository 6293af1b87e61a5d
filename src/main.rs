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
    pagesift::logging::init().context("init logging")?;

    let cli = pagesift::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        pagesift::cli::Command::Session { command } => {
            pagesift::commands::session(command).await.context("session")?;
        }
        pagesift::cli::Command::Fetch(args) => {
            pagesift::commands::fetch(args).await.context("fetch")?;
        }
        pagesift::cli::Command::Extract(args) => {
            pagesift::commands::extract(args).await.context("extract")?;
        }
        pagesift::cli::Command::Paginate(args) => {
            pagesift::commands::paginate(args).await.context("paginate")?;
        }
        pagesift::cli::Command::Run(args) => {
            pagesift::commands::run(args).await.context("run")?;
        }
        pagesift::cli::Command::ScrapePages(args) => {
            pagesift::commands::scrape_pages(args)
                .await
                .context("scrape pages")?;
        }
    }

    Ok(())
}

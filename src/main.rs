use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use homedir::my_home;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;
mod config;
mod corpus;
mod lock;
mod semantic;
#[cfg(test)]
mod tests;

use config::Config;
use semantic::{IndexEvent, SemanticSearchService};

fn data_dir(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = arg {
        return Ok(dir);
    }
    if let Ok(dir) = std::env::var("PATHSEEK_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = my_home()
        .map_err(|e| anyhow::anyhow!("could not determine home directory: {:?}", e))?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/pathseek"))
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let base_path = data_dir(args.data_dir)?;
    let mut config = Config::load_with(&base_path)
        .with_context(|| format!("failed to load config from {}", base_path.display()))?;

    if let cli::Command::Search {
        limit: Some(limit), ..
    } = &args.command
    {
        config.semantic_search.top_k = *limit;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args.command, config))
}

async fn run(command: cli::Command, config: Config) -> anyhow::Result<()> {
    let service = SemanticSearchService::open(config.semantic_search.clone(), config.base_path())?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupted, stopping");
                cancel.cancel();
            }
        }
    });

    let result = execute(&service, command, &cancel).await;
    service.close()?;
    result
}

async fn execute(
    service: &SemanticSearchService,
    command: cli::Command,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        cli::Command::Index { root, missing } => {
            let root = canonical(&root)?;
            let files = corpus::list_files(&root);
            log::info!("found {} files under {}", files.len(), root.display());

            let bar = progress_bar(files.len() as u64);
            let mut events = service.index_events();
            let watcher = tokio::spawn({
                let bar = bar.clone();
                async move {
                    loop {
                        match events.recv().await {
                            Ok(IndexEvent::Progress(p)) => bar.set_position(p.current as u64),
                            Ok(IndexEvent::BatchFailed { batch, error }) => {
                                bar.println(format!("batch {} failed: {}", batch + 1, error))
                            }
                            Ok(IndexEvent::Finished(_)) | Err(RecvError::Closed) => break,
                            Err(RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            });

            let report = if missing {
                service.index_missing_with_cancel(&files, cancel).await
            } else {
                service.index_files_with_cancel(&files, cancel).await
            };
            watcher.abort();
            bar.finish_and_clear();

            println!("{}", serde_json::to_string_pretty(&report?)?);
            Ok(())
        }

        cli::Command::Search { query, scope, .. } => {
            let results = service
                .search_with_cancel(&query, scope.as_deref(), cancel)
                .await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }

        cli::Command::Status {} => {
            let snapshot = service.snapshot();
            let status = serde_json::json!({
                "status": snapshot.status,
                "message": snapshot.message,
                "model": service.config().model,
                "indexed": service.indexed_count(),
                "store": service.store().path(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }

        cli::Command::Prune { root } => {
            let root = canonical(&root)?;
            let files = corpus::list_files(&root);
            let scope = format!("{}{}", root.display(), std::path::MAIN_SEPARATOR);
            let removed = service.prune(&scope, &files)?;
            println!("{} stale embeddings removed", removed);
            Ok(())
        }
    }
}

fn canonical(root: &Path) -> anyhow::Result<PathBuf> {
    root.canonicalize()
        .with_context(|| format!("cannot read {}", root.display()))
}

fn progress_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar.set_message("indexing");
    bar
}

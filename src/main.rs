use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use retab_ls::config::Settings;
use retab_ls::handle::DirHandle;
use retab_ls::state::StateStore;

#[derive(Parser, Debug)]
#[command(name = "retab-ls", version, about = "Language server for retab configuration files")]
struct Cli {
    /// Log filter directives, e.g. `info` or `retab_ls::job=debug`
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the language server protocol over stdio (default)
    Serve,
    /// Index a directory once and print what was loaded
    Index {
        dir: PathBuf,
        /// Directory names to skip, in addition to the configured ones
        #[arg(long = "ignore")]
        ignore: Vec<String>,
    },
}

/// Logs go to stderr; stdout carries the protocol.
fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            init_logging(cli.log_filter.as_deref().unwrap_or("info"));
            retab_ls::server::serve().await;
            Ok(())
        }
        Command::Index { dir, ignore } => index(dir, ignore, cli.log_filter).await,
    }
}

async fn index(dir: PathBuf, ignore: Vec<String>, log_filter: Option<String>) -> anyhow::Result<()> {
    let dir = std::fs::canonicalize(&dir).with_context(|| format!("can't open {}", dir.display()))?;
    let mut settings = Settings::new(Some(dir.as_path()), None)?;
    settings.ignore_directory_names.extend(ignore);
    init_logging(log_filter.as_deref().unwrap_or(&settings.log_filter));

    let root = DirHandle::from_path(&dir)?;
    let state = StateStore::new(&settings)?;
    let summaries = state
        .walker
        .spawn_walk(vec![root.clone()], settings.ignore_directory_names.clone())
        .await?;

    let pending = state.jobs.pending_jobs();
    let result = state
        .jobs
        .wait_for_jobs(&CancellationToken::new(), &pending)
        .await;

    for module_dir in state.indexer.modules().list() {
        let Some(module) = state.indexer.module(&module_dir) else {
            continue;
        };
        let relative = pathdiff::diff_paths(module_dir.path(), root.path()).unwrap_or_default();
        println!(
            "{:<40} {}",
            format!("./{}", relative.display()),
            module.filenames().join(" ")
        );
    }
    for summary in &summaries {
        println!(
            "{} directories, {} files, {} skipped, {} errors",
            summary.directories, summary.files, summary.skipped, summary.errors
        );
    }

    state.shutdown();
    match result {
        Ok(()) => Ok(()),
        Err(err) => Err(anyhow!("indexing failed: {err}")),
    }
}

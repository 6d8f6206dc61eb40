use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod config;
mod conversations;
mod lock;
mod semantic;
mod storage;

use cli::Command;
use config::Config;
use lock::FileLock;
use semantic::{EmbeddingStrategy, MemoryService};

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

/// Data directory: `CHATMEM_BASE_PATH` or `~/.local/share/chatmem`
fn get_base_path() -> anyhow::Result<PathBuf> {
    if let Ok(base_path) = std::env::var("CHATMEM_BASE_PATH") {
        return Ok(PathBuf::from(base_path));
    }

    let home = my_home()
        .context("Could not determine home directory")?
        .context("Home directory path is empty")?;
    Ok(home.join(".local/share/chatmem"))
}

fn init_thread_pool(config: &Config) -> anyhow::Result<()> {
    if let Some(threads) = config.embedding.threads() {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("failed to configure embedding thread pool")?;
    }
    Ok(())
}

fn acquire_lock(base_path: &Path) -> anyhow::Result<FileLock> {
    FileLock::try_acquire(base_path)
        .with_context(|| format!("failed to lock {}", base_path.display()))
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();

    let base_path = get_base_path()?;
    let base_str = base_path
        .to_str()
        .context("data directory path is not valid utf8")?;
    let config = Config::load_with(base_str).context("failed to load config.yaml")?;
    init_thread_pool(&config)?;

    tracing::debug!("data directory: {}", base_path.display());

    match args.command {
        Command::Train {
            input,
            strategy,
            rebuild,
        } => {
            let strategy = match strategy {
                Some(s) => Some(s.parse::<EmbeddingStrategy>()?),
                None => None,
            };

            let conversations = conversations::load_conversations(&input)?;
            if conversations.is_empty() {
                bail!("{} contains no conversations", input.display());
            }

            let _lock = acquire_lock(&base_path)?;
            let mut service = MemoryService::new(config, base_path)?.with_progress(true);
            let report = service.train(&conversations, strategy, rebuild)?;
            service.save()?;

            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Query {
            text,
            k,
            scores,
            conversations,
        } => {
            let mut service = MemoryService::new(config, base_path)?;
            service.load_or_create()?;

            if service.store().is_empty() {
                log::warn!("Memory is empty, run `chatmem train` first");
            }

            let results = service.query(&text, k, scores.then_some(true), conversations)?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        Command::Stats {} => {
            let mut service = MemoryService::new(config, base_path)?;
            service.load_or_create()?;
            println!("{}", serde_json::to_string_pretty(&service.stats())?);
        }

        Command::Clear {} => {
            let _lock = acquire_lock(&base_path)?;
            let mut service = MemoryService::new(config, base_path)?;
            service.clear()?;
            println!("Memory cleared");
        }

        Command::CacheClear {} => {
            let _lock = acquire_lock(&base_path)?;
            let service = MemoryService::new(config, base_path)?;
            let removed = service.clear_cache()?;
            println!("{} cached embeddings removed", removed);
        }
    }

    Ok(())
}

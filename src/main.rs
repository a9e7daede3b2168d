//! smart-fork CLI
//!
//! Thin smoke-test harness over the core: index a file, run a search,
//! show status, run the bulk initial setup, or manage the archive. The
//! JSON-RPC/REST/selection-UI surfaces this core is meant to sit behind
//! are out of scope here (§1); this binary exists so the core can be
//! exercised directly from a terminal.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use smart_fork_core::config::Config;
use smart_fork_core::context::CoreContext;
use smart_fork_core::search::SearchQuery;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "smart-fork")]
#[command(about = "Index and search past conversational sessions for forking")]
#[command(version)]
struct Cli {
    /// Custom sessions directory (default: ~/.claude)
    #[arg(long, global = true)]
    sessions_dir: Option<PathBuf>,

    /// Custom storage directory (default: ~/.smart-fork)
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a single session file
    Index {
        path: PathBuf,
        /// Bypass the checkpoint-skip rule
        #[arg(long)]
        force: bool,
    },

    /// Search indexed sessions for the most relevant matches
    Search {
        query: String,
        #[arg(short = 'n', long)]
        top_n: Option<usize>,
        /// Natural-language time range, e.g. "last_week", "3d"
        #[arg(long)]
        time_range: Option<String>,
        #[arg(long)]
        include_archive: bool,
    },

    /// Show registry, vector store, and cache statistics
    Status,

    /// Run (or resume) a bulk one-shot index of the whole sessions directory
    Setup {
        /// Skip files already recorded as processed in setup_state.json
        #[arg(long)]
        resume: bool,
    },

    /// Archive sessions older than the configured threshold
    Archive {
        #[arg(long)]
        dry_run: bool,
    },

    /// Restore one archived session back to the active collection
    Restore { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    smart_fork_core::logging::init();
    let cli = Cli::parse();

    let mut config = Config::default();
    if let Some(dir) = cli.sessions_dir {
        config.sessions_dir = Some(dir);
    }
    if let Some(dir) = cli.storage_dir {
        config.storage_dir = Some(dir);
    }

    let ctx = CoreContext::new(config)?;

    match cli.command {
        Commands::Index { path, force } => {
            let chunks = ctx.indexer.index_file(&path, force).await?;
            println!("{} indexed {} chunks from {}", "✓".green(), chunks.to_string().cyan(), path.display());
        }

        Commands::Search { query, top_n, time_range, include_archive } => {
            let params = SearchQuery { top_n, time_range, include_archive, ..Default::default() };
            let mut embeddings = ctx.embeddings.lock().await;
            let results = ctx
                .search
                .search(&query, params, &mut embeddings, &ctx.store, &ctx.registry)
                .await?;

            if results.is_empty() {
                println!("{} no matching sessions", "→".yellow());
            }
            for (rank, result) in results.iter().enumerate() {
                println!(
                    "{} {} {} (score {:.3})",
                    format!("{}.", rank + 1).bold(),
                    result.session_id.cyan(),
                    result.metadata.as_ref().and_then(|m| m.project.clone()).unwrap_or_default().dimmed(),
                    result.score.final_score
                );
                println!("   {}", result.preview.dimmed());
            }
        }

        Commands::Status => {
            let registry_stats = ctx.registry.get_stats();
            let cache_stats = ctx.cache.stats();
            let indexer_stats = ctx.indexer.get_stats().await;

            println!("{}", "Session registry".bold());
            println!(
                "  {} sessions, {} chunks, {} messages, {} projects",
                registry_stats.total_sessions.to_string().cyan(),
                registry_stats.total_chunks.to_string().cyan(),
                registry_stats.total_messages.to_string().cyan(),
                registry_stats.total_projects.to_string().cyan()
            );

            println!("{}", "Vector store".bold());
            println!(
                "  active: {} chunks, archive: {} chunks",
                ctx.store.count(smart_fork_core::vector_store::Collection::Active)?.to_string().cyan(),
                ctx.store.count(smart_fork_core::vector_store::Collection::Archive)?.to_string().cyan()
            );

            println!("{}", "Embedding cache".bold());
            println!(
                "  {:.1}% hit rate over {} requests",
                cache_stats.hit_rate(),
                cache_stats.total_requests().to_string().cyan()
            );

            println!("{}", "Background indexer".bold());
            println!(
                "  running: {}, pending: {}, watcher: {}",
                indexer_stats.is_running,
                indexer_stats.pending_count.to_string().cyan(),
                indexer_stats.watcher_active
            );
        }

        Commands::Setup { resume } => {
            let setup = ctx.initial_setup();
            let bar = ProgressBar::new_spinner();
            bar.set_style(ProgressStyle::default_spinner().template("{spinner} {msg}").unwrap());

            let callback: smart_fork_core::setup::ProgressCallback = Box::new(move |progress| {
                bar.set_message(format!(
                    "{}/{} files, {} chunks",
                    progress.processed_files, progress.total_files, progress.total_chunks
                ));
                bar.tick();
            });

            let summary = setup.run_setup(resume, Some(&callback)).await?;
            if summary.interrupted {
                println!("{} setup interrupted, state saved for resume", "→".yellow());
            } else {
                println!(
                    "{} indexed {} files ({} chunks, {} errors) in {:.1}s",
                    "✓".green(),
                    summary.files_processed.to_string().cyan(),
                    summary.total_chunks.to_string().cyan(),
                    summary.errors.to_string().cyan(),
                    summary.elapsed_secs
                );
            }
        }

        Commands::Archive { dry_run } => {
            let archive = ctx.archive();
            let result = archive.archive_old_sessions(dry_run)?;
            if dry_run {
                println!("{} would archive {} sessions", "→".yellow(), result.sessions_archived.len());
            } else {
                println!(
                    "{} archived {} sessions ({} chunks)",
                    "✓".green(),
                    result.sessions_archived.len().to_string().cyan(),
                    result.chunks_moved.to_string().cyan()
                );
            }
        }

        Commands::Restore { session_id } => {
            let archive = ctx.archive();
            let result = archive.restore_session(&session_id)?;
            if result.success {
                println!("{} restored {} chunks for {}", "✓".green(), result.chunks_restored, session_id.cyan());
            } else {
                println!("{} {}", "✗".red(), result.error.unwrap_or_default());
            }
        }
    }

    ctx.shutdown().await?;
    Ok(())
}

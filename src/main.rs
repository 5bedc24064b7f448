use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::PathBuf;

use symledger::config::load_config;
use symledger::delta::GovernorBudget;
use symledger::engine::Engine;
use symledger::ids::RepoId;
use symledger::indexer::{RefreshMode, RepoOptions};
use symledger::server::run_stdio_server;
use symledger::slice::{SliceBudget, SliceRequest};
use symledger::storage::Storage;

#[derive(Debug, Parser)]
#[command(name = "symledger")]
#[command(version)]
#[command(about = "Symbol Delta Ledger: versioned code-knowledge store serving LLM agents budgeted graph slices")]
struct Cli {
    /// State directory root; the ledger database lives at <dir>/sdl.db.
    /// Defaults to `.symledger` under the current directory.
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the MCP stdio server
    Serve,

    /// Register a repository root
    Register {
        repo_id: String,
        root_path: PathBuf,
        /// Extra ignore globs applied on top of .gitignore
        #[arg(long, num_args = 0..)]
        ignore: Vec<String>,
        /// Restrict indexing to these language ids (rust, typescript, python)
        #[arg(long, num_args = 0..)]
        languages: Vec<String>,
    },

    /// Re-index a repository and cut a new version
    Refresh {
        repo_id: String,
        /// full rescans and prunes; incremental follows content hashes
        #[arg(long, default_value = "incremental")]
        mode: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Search symbols by name
    Search {
        repo_id: String,
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Build a budgeted slice for a task description
    Slice {
        repo_id: String,
        task: String,
        #[arg(long, default_value_t = 24)]
        max_cards: usize,
        #[arg(long, default_value_t = 12_000)]
        max_tokens: usize,
    },

    /// Changed symbols and blast radius between two versions
    Delta {
        repo_id: String,
        from_version: String,
        to_version: String,
        #[arg(long, default_value_t = 40)]
        max_cards: usize,
    },

    /// Index health for one repo
    Status { repo_id: String },

    /// Print the skeleton of one file
    Skeleton { repo_id: String, file: String },
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb.set_message(msg.to_string());
    pb
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("Failed to get current dir")?;
    let cfg = load_config(&cwd);

    let state_dir = cli.state_dir.unwrap_or_else(|| cwd.join(&cfg.output_dir));
    let storage = Storage::open(&state_dir.join("sdl.db"), cfg.cache.prepared_statements)
        .map_err(|e| anyhow::anyhow!("failed to open ledger: {e}"))?;
    let engine = Engine::new(cfg, storage);

    match cli.cmd {
        Command::Serve => run_stdio_server(engine),

        Command::Register { repo_id, root_path, ignore, languages } => {
            let repo = RepoId::new(&repo_id).map_err(|e| anyhow::anyhow!("{e}"))?;
            let abs = if root_path.is_absolute() { root_path } else { cwd.join(root_path) };
            let options = RepoOptions {
                ignore,
                languages: if languages.is_empty() { None } else { Some(languages) },
                max_file_bytes: None,
                edge_weights: None,
            };
            engine
                .register_repo(&repo, &abs.to_string_lossy(), options)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", json!({ "ok": true, "repoId": repo.as_str() }));
            Ok(())
        }

        Command::Refresh { repo_id, mode, reason } => {
            let repo = RepoId::new(&repo_id).map_err(|e| anyhow::anyhow!("{e}"))?;
            let mode = match mode.as_str() {
                "full" => RefreshMode::Full,
                "incremental" => RefreshMode::Incremental,
                other => anyhow::bail!("unknown mode `{other}` (expected full|incremental)"),
            };
            let pb = spinner("indexing...");
            let report = engine
                .index_refresh(&repo, mode, reason.as_deref())
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            pb.finish_with_message(format!(
                "{}: {} changed, {} removed, {} symbols",
                report.version_id, report.changed_files, report.removed_files, report.symbols_indexed
            ));
            for f in &report.failures {
                eprintln!("  skipped {}: {}", f.rel_path, f.message);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Command::Search { repo_id, query, limit } => {
            let repo = RepoId::new(&repo_id).map_err(|e| anyhow::anyhow!("{e}"))?;
            let hits = engine
                .symbol_search(&repo, &query, limit)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            for h in hits {
                println!("{}\t{}\t{}", h.row.symbol_id, h.row.kind, h.rel_path);
            }
            Ok(())
        }

        Command::Slice { repo_id, task, max_cards, max_tokens } => {
            let repo = RepoId::new(&repo_id).map_err(|e| anyhow::anyhow!("{e}"))?;
            let req = SliceRequest { task_text: task, ..Default::default() };
            let budget = SliceBudget { max_cards, max_estimated_tokens: max_tokens };
            let (slice, lease) = engine
                .slice_build(&repo, &req, Some(budget))
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "sliceHandle": lease.handle.clone(),
                    "lease": lease,
                    "slice": &*slice,
                }))?
            );
            Ok(())
        }

        Command::Delta { repo_id, from_version, to_version, max_cards } => {
            let repo = RepoId::new(&repo_id).map_err(|e| anyhow::anyhow!("{e}"))?;
            let pack = engine
                .delta_get(
                    &repo,
                    &from_version,
                    &to_version,
                    Some(GovernorBudget { max_cards, max_tokens: 16_000 }),
                )
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_json::to_string_pretty(&pack)?);
            Ok(())
        }

        Command::Status { repo_id } => {
            let repo = RepoId::new(&repo_id).map_err(|e| anyhow::anyhow!("{e}"))?;
            let status = engine.repo_status(&repo).map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }

        Command::Skeleton { repo_id, file } => {
            let repo = RepoId::new(&repo_id).map_err(|e| anyhow::anyhow!("{e}"))?;
            let resp = engine
                .get_skeleton(&repo, None, Some(file.as_str()), false, None, None)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            match resp.get("skeleton").and_then(|s| s.as_str()) {
                Some(text) => print!("{text}"),
                None => eprintln!("(no skeleton for {file})"),
            }
            Ok(())
        }
    }
}

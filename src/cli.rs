//! CLI interface for the production board.
//!
//! Each subcommand is non-interactive: arguments in, plain text or JSON
//! out. Diagnostics go to stderr.
//!
//! Commands split into three groups:
//!
//! - `kanban tasks ...`: the board itself.
//! - `kanban recommend|learned|stats|masters|logs`: what the board knows.
//! - `kanban status|migrate|package|db|kv|backup|cleanup`: where the data
//!   lives and how it moves.

mod data;
mod format;
mod tasks;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{self, Config};
use crate::context::AppContext;
use crate::engine::DateRange;

use data::{DbCommand, KvCommand, LearnedCommand, PackageCommand};
use tasks::TasksCommand;

/// Production kanban: schedule work orders across the workshop.
#[derive(Debug, Parser)]
#[command(name = "kanban", after_long_help = WORKFLOW_HELP)]
pub struct Cli {
    /// Board home directory (default: `$KANBAN_HOME`, then `~/.kanban`).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Log debug detail to stderr.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Launch query string, checked for a `portable=` package at startup.
    #[arg(long, global = true)]
    query: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

const WORKFLOW_HELP: &str = r#"Workflow: moving a board to another machine
  1. kanban package export --out board.json
  2. (on the other machine) kanban package import board.json
  3. kanban status

Daily use:
  kanban tasks add --product Valve-Body --code V1 --hours 120 --batch B-7 --client "Plant A" --commit 2025-01-13
  kanban tasks list --status pending --page-size 20
  kanban tasks status <id> completed
  kanban recommend Valve-Body --code V1"#;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Storage mode, database health and migration state.
    Status,

    /// Move key-value data into the database.
    ///
    /// Runs only when the key-value store holds more tasks than the
    /// database, unless `--force` is given.
    Migrate {
        #[arg(long)]
        force: bool,
    },

    /// Work orders: list, add, change, delete.
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },

    /// Suggest a master for a product.
    Recommend {
        product: String,

        #[arg(long)]
        code: Option<String>,
    },

    /// Learned product → master associations.
    Learned {
        #[command(subcommand)]
        command: LearnedCommand,
    },

    /// Production statistics, optionally over a commit-time range.
    Stats {
        /// First commit date included (e.g. 2025-01-01).
        #[arg(long, requires = "to")]
        from: Option<String>,

        /// Last commit date included.
        #[arg(long, requires = "from")]
        to: Option<String>,

        /// Print JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },

    /// The master roster with running totals.
    Masters,

    /// Recent system log entries, newest first.
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Portable packages: every entity in one JSON file.
    Package {
        #[command(subcommand)]
        command: PackageCommand,
    },

    /// Whole-database export and import.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },

    /// Legacy key-value export and import.
    Kv {
        #[command(subcommand)]
        command: KvCommand,
    },

    /// Write a dated backup if one is due.
    Backup,

    /// Remove backup and import markers. Never touches board data.
    Cleanup,
}

/// Run the CLI, returning an error message on failure.
pub fn run(cli: Cli) -> Result<(), String> {
    let home = config::resolve_home(cli.home.as_deref())?;
    let config = Config::load(&home)?;
    let mut ctx = AppContext::open(&home, config, cli.query.as_deref())
        .map_err(|e| format!("failed to open board at {}: {e}", home.display()))?;
    if ctx.is_degraded() {
        eprintln!("warning: database unavailable, using the key-value store");
    }

    match cli.command {
        Command::Status => data::cmd_status(&ctx),
        Command::Migrate { force } => data::cmd_migrate(&mut ctx, force),
        Command::Tasks { command } => tasks::run(&mut ctx, command),
        Command::Recommend { product, code } => cmd_recommend(&ctx, &product, code.as_deref()),
        Command::Learned { command } => data::run_learned(&ctx, command),
        Command::Stats { from, to, json } => {
            let range = from.zip(to).map(|(start, end)| DateRange { start, end });
            cmd_stats(&ctx, range.as_ref(), json)
        }
        Command::Masters => cmd_masters(&ctx),
        Command::Logs { limit } => cmd_logs(&ctx, limit),
        Command::Package { command } => data::run_package(&mut ctx, command),
        Command::Db { command } => data::run_db(&mut ctx, command),
        Command::Kv { command } => data::run_kv(&ctx, command),
        Command::Backup => data::cmd_backup(&ctx),
        Command::Cleanup => data::cmd_cleanup(&ctx),
    }
}

fn cmd_recommend(ctx: &AppContext, product: &str, code: Option<&str>) -> Result<(), String> {
    match ctx.recommender().recommend(product, code) {
        Some(master) => println!("learned: {master}"),
        None => println!("learned: no confident match"),
    }

    if let Some(engine) = ctx.engine() {
        let rec = engine
            .recommend_worker(product, code)
            .map_err(|e| format!("failed to recommend: {e}"))?;
        println!("{}", format::format_recommendation(&rec));
    }
    Ok(())
}

fn cmd_stats(ctx: &AppContext, range: Option<&DateRange>, json: bool) -> Result<(), String> {
    let engine = ctx.engine().ok_or("statistics need the database")?;
    let stats = engine
        .get_statistics(range)
        .map_err(|e| format!("failed to compute statistics: {e}"))?;

    if json {
        let out = serde_json::to_string_pretty(&stats).map_err(|e| e.to_string())?;
        println!("{out}");
    } else {
        print!("{}", format::format_statistics(&stats));
    }
    Ok(())
}

fn cmd_masters(ctx: &AppContext) -> Result<(), String> {
    let engine = ctx.engine().ok_or("the roster lives in the database")?;
    let masters = engine
        .masters()
        .map_err(|e| format!("failed to list masters: {e}"))?;

    for m in &masters {
        let active = if m.active { "" } else { "  (inactive)" };
        println!(
            "{:<16} skill {}  {}/{} completed{active}",
            m.name, m.skill_level, m.completed_tasks, m.total_tasks
        );
    }
    Ok(())
}

fn cmd_logs(ctx: &AppContext, limit: u32) -> Result<(), String> {
    let engine = ctx.engine().ok_or("the system log lives in the database")?;
    let logs = engine
        .recent_logs(limit)
        .map_err(|e| format!("failed to read logs: {e}"))?;

    if logs.is_empty() {
        println!("No log entries");
        return Ok(());
    }
    for entry in &logs {
        println!("{}  [{}]  {}", entry.created_at, entry.level, entry.message);
    }
    Ok(())
}

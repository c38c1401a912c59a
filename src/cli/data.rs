//! Data movement commands: status, migration, packages, database files,
//! legacy store exports, learned assignments and backups.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Subcommand;
use jiff::Timestamp;

use crate::context::AppContext;
use crate::engine::Engine;
use crate::migration::package_file_name;
use crate::policy::FILE_EXTENSION;
use crate::recommender::DEFAULT_PRUNE_THRESHOLD;

use super::format;

#[derive(Debug, Subcommand)]
pub enum LearnedCommand {
    /// What the board has learned, grouped by master.
    List,

    /// Forget associations below a confidence.
    Prune {
        #[arg(long, default_value_t = DEFAULT_PRUNE_THRESHOLD)]
        below: f64,
    },

    /// Write the learned associations as JSON.
    Export {
        /// Output file (default: stdout).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Replace the learned associations with a JSON file.
    Import { file: PathBuf },
}

#[derive(Debug, Subcommand)]
pub enum PackageCommand {
    /// Bundle every entity into a portable package.
    Export {
        /// Output file or directory (default: a dated file here).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Import a portable package. The current state is snapshotted first.
    Import { file: PathBuf },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    /// Export the database. A `.db` target gets the raw file; anything
    /// else gets a JSON export document.
    Export {
        #[arg(long)]
        out: PathBuf,
    },

    /// Replace the database from a `.db` file or a JSON export document.
    Import { file: PathBuf },
}

#[derive(Debug, Subcommand)]
pub enum KvCommand {
    /// Print the key-value entities as one JSON document.
    Export,

    /// Write the entities from a key-value export document.
    Import { file: PathBuf },
}

fn read_file(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))
}

fn write_or_print(out: Option<&Path>, contents: &str) -> Result<(), String> {
    match out {
        Some(path) => {
            fs::write(path, contents).map_err(|e| format!("failed to write {}: {e}", path.display()))?;
            println!("{}", path.display());
        }
        None => println!("{contents}"),
    }
    Ok(())
}

fn is_db_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == FILE_EXTENSION)
}

// ── Status and migration ──

pub(super) fn cmd_status(ctx: &AppContext) -> Result<(), String> {
    let stats = ctx
        .policy()
        .stats()
        .map_err(|e| format!("failed to read storage stats: {e}"))?;
    let check = ctx.migrator().check(ctx.engine());

    print!(
        "{}",
        format::format_status(&stats, ctx.engine().map(Engine::health).as_ref(), &check)
    );
    print!("{}", format::format_startup(ctx.startup_report()));
    Ok(())
}

pub(super) fn cmd_migrate(ctx: &mut AppContext, force: bool) -> Result<(), String> {
    let migrator = ctx.migrator();
    let engine = ctx
        .require_engine()
        .map_err(|e| format!("cannot migrate: {e}"))?;

    let report = if force {
        Some(migrator.migrate(engine))
    } else {
        migrator.auto_migrate(engine)
    };

    match report {
        Some(report) => {
            print!("{}", format::format_migration(&report));
            if report.is_clean() {
                Ok(())
            } else {
                Err("migration finished with errors".to_string())
            }
        }
        None => {
            println!("Nothing to migrate");
            Ok(())
        }
    }
}

// ── Learned assignments ──

pub(super) fn run_learned(ctx: &AppContext, command: LearnedCommand) -> Result<(), String> {
    let recommender = ctx.recommender();
    match command {
        LearnedCommand::List => {
            let stats = recommender.master_stats();
            if stats.is_empty() {
                println!("Nothing learned yet");
                return Ok(());
            }
            for stat in &stats {
                println!(
                    "{:<16} {} products, confidence {:.2}: {}",
                    stat.master_name,
                    stat.product_count,
                    stat.confidence,
                    stat.products.join(", ")
                );
            }
            Ok(())
        }
        LearnedCommand::Prune { below } => {
            let removed = recommender
                .prune_below(below)
                .map_err(|e| format!("failed to prune: {e}"))?;
            println!("Removed {removed} associations");
            Ok(())
        }
        LearnedCommand::Export { out } => {
            let json = recommender
                .export_json()
                .map_err(|e| format!("failed to export: {e}"))?;
            write_or_print(out.as_deref(), &json)
        }
        LearnedCommand::Import { file } => {
            let count = recommender
                .import_json(&read_file(&file)?)
                .map_err(|e| format!("failed to import {}: {e}", file.display()))?;
            println!("Imported {count} associations");
            Ok(())
        }
    }
}

// ── Packages ──

pub(super) fn run_package(ctx: &mut AppContext, command: PackageCommand) -> Result<(), String> {
    let migrator = ctx.migrator();
    match command {
        PackageCommand::Export { out } => {
            let now = Timestamp::now();
            let (json, file_name) = migrator
                .create_portable_package(ctx.engine(), now)
                .map_err(|e| format!("failed to create package: {e}"))?;
            let path = match out {
                Some(dir) if dir.is_dir() => dir.join(file_name),
                Some(path) => path,
                None => PathBuf::from(package_file_name(now)),
            };
            write_or_print(Some(&path), &json)
        }
        PackageCommand::Import { file } => {
            let json = read_file(&file)?;
            let report = migrator
                .import_portable_package(ctx.engine_mut(), &json)
                .map_err(|e| format!("failed to import package: {e}"))?;
            print!("{}", format::format_migration(&report));
            Ok(())
        }
    }
}

// ── Database files ──

pub(super) fn run_db(ctx: &mut AppContext, command: DbCommand) -> Result<(), String> {
    let policy = ctx.policy();
    let keep = ctx.config.max_backups;
    let engine = ctx
        .require_engine()
        .map_err(|e| format!("database commands need the database: {e}"))?;

    match command {
        DbCommand::Export { out } if is_db_file(&out) || out.is_dir() => {
            let path = policy
                .export_to_file(engine, &out, Timestamp::now())
                .map_err(|e| format!("failed to export database: {e}"))?;
            println!("{}", path.display());
            Ok(())
        }
        DbCommand::Export { out } => {
            let json = engine
                .export_database()
                .map_err(|e| format!("failed to export database: {e}"))?;
            write_or_print(Some(&out), &json)
        }
        DbCommand::Import { file } if is_db_file(&file) => {
            policy
                .import_from_file(engine, &file)
                .map_err(|e| format!("failed to import {}: {e}", file.display()))?;
            println!("Imported {}", file.display());
            Ok(())
        }
        DbCommand::Import { file } => {
            engine
                .import_database(&read_file(&file)?, keep)
                .map_err(|e| format!("failed to import {}: {e}", file.display()))?;
            println!("Imported {}", file.display());
            Ok(())
        }
    }
}

// ── Legacy store ──

pub(super) fn run_kv(ctx: &AppContext, command: KvCommand) -> Result<(), String> {
    match command {
        KvCommand::Export => {
            let json = ctx
                .store()
                .export_all()
                .map_err(|e| format!("failed to export: {e}"))?;
            println!("{json}");
            Ok(())
        }
        KvCommand::Import { file } => {
            ctx.store()
                .import_all(&read_file(&file)?)
                .map_err(|e| format!("failed to import {}: {e}", file.display()))?;
            println!("Imported {}", file.display());
            Ok(())
        }
    }
}

// ── Backups ──

pub(super) fn cmd_backup(ctx: &AppContext) -> Result<(), String> {
    let engine = ctx.engine().ok_or("backups need the database")?;
    match ctx
        .policy()
        .auto_backup(engine, Timestamp::now())
        .map_err(|e| format!("backup failed: {e}"))?
    {
        Some(path) => println!("{}", path.display()),
        None => println!("No backup due"),
    }
    Ok(())
}

pub(super) fn cmd_cleanup(ctx: &AppContext) -> Result<(), String> {
    ctx.policy()
        .cleanup()
        .map_err(|e| format!("cleanup failed: {e}"))?;
    println!("Markers cleared");
    Ok(())
}

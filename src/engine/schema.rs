//! Table layout and first-run seed data.

use rusqlite::{Connection, params};

use crate::model::{RosterEntry, Settings, SettingType};

use super::Result;

/// Bumped whenever the table layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 2;

/// Name reported in database export files.
pub const DB_NAME: &str = "production_kanban.db";

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    product_name TEXT NOT NULL,
    product_code TEXT,
    work_hours REAL NOT NULL,
    coefficient REAL,
    master_name TEXT NOT NULL,
    batch_number TEXT NOT NULL,
    client_name TEXT NOT NULL,
    commit_time TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 1,
    process_order_id TEXT,
    factory_code TEXT,
    order_date TEXT,
    delivery_time TEXT,
    quantity INTEGER,
    assigned_person TEXT,
    assigned_team TEXT,
    created_at INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS masters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    skill_level INTEGER NOT NULL DEFAULT 1,
    active INTEGER NOT NULL DEFAULT 1,
    total_tasks INTEGER NOT NULL DEFAULT 0,
    completed_tasks INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS master_assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_name TEXT NOT NULL,
    product_code TEXT,
    master_name TEXT NOT NULL,
    assignment_count INTEGER NOT NULL DEFAULT 1,
    completed_count INTEGER NOT NULL DEFAULT 0,
    success_rate REAL NOT NULL DEFAULT 100.0,
    avg_completion_time REAL NOT NULL DEFAULT 0,
    last_assigned_at TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS task_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    action TEXT NOT NULL,
    old_values TEXT,
    new_values TEXT,
    changed_by TEXT NOT NULL DEFAULT 'system',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'string',
    description TEXT,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS import_settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    column_mapping TEXT NOT NULL,
    file_type TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    coefficient REAL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    last_used_at TEXT
);

CREATE TABLE IF NOT EXISTS system_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_master_name ON tasks(master_name);
CREATE INDEX IF NOT EXISTS idx_tasks_commit_time ON tasks(commit_time);
CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority);
CREATE INDEX IF NOT EXISTS idx_tasks_product ON tasks(product_name, product_code);
CREATE INDEX IF NOT EXISTS idx_task_history_task_id ON task_history(task_id);
CREATE INDEX IF NOT EXISTS idx_master_assignments_product ON master_assignments(product_name, product_code);
CREATE INDEX IF NOT EXISTS idx_master_assignments_master ON master_assignments(master_name);
CREATE INDEX IF NOT EXISTS idx_system_logs_created_at ON system_logs(created_at);
";

/// Creates any missing tables and indexes. Safe to run on an existing schema.
///
/// Returns `true` when the roster was seeded, i.e. this looked like a first run.
pub(super) fn create(conn: &Connection, roster: &[RosterEntry]) -> Result<bool> {
    conn.execute_batch(SCHEMA_SQL)?;

    let masters: i64 = conn.query_row("SELECT COUNT(*) FROM masters", [], |row| row.get(0))?;
    let first_run = masters == 0;
    if first_run {
        let mut stmt =
            conn.prepare("INSERT OR IGNORE INTO masters (name, skill_level) VALUES (?1, ?2)")?;
        for entry in roster {
            stmt.execute(params![entry.name, entry.skill_level])?;
        }
    }

    seed_settings(conn)?;
    Ok(first_run)
}

/// Inserts each default setting that has no row yet.
fn seed_settings(conn: &Connection) -> Result<()> {
    let d = Settings::default();
    let defaults: [(&str, serde_json::Value, &str); 6] = [
        (
            "default_coefficient",
            d.default_coefficient.into(),
            "Default work-hour coefficient",
        ),
        (
            "work_hours_per_day",
            d.work_hours_per_day.into(),
            "Working minutes per day",
        ),
        ("auto_assign", d.auto_assign.into(), "Enable automatic assignment"),
        ("theme", d.theme.clone().into(), "Interface theme"),
        ("page_size", d.page_size.into(), "Page size"),
        (
            "backup_interval",
            d.backup_interval.into(),
            "Automatic backup interval (hours)",
        ),
    ];

    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO settings (key, value, type, description) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (key, value, description) in defaults {
        stmt.execute(params![
            key,
            super::settings::encode_value(&value),
            SettingType::of(&value).as_str(),
            description
        ])?;
    }
    Ok(())
}

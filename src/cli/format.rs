//! Output formatting for CLI display.

use std::fmt::Write;

use crate::engine::{Health, Recommendation, Statistics};
use crate::migration::{MigrationCheck, MigrationReport, StartupReport};
use crate::model::Task;
use crate::policy::StorageStats;
use crate::recommender::AssignmentStats;

/// One task per line: id prefix, status, priority, product, master.
pub(super) fn format_task_line(task: &Task) -> String {
    let short_id: String = task.id.chars().take(8).collect();
    let urgent = if task.is_urgent() { "!" } else { " " };
    let product = match &task.product_code {
        Some(code) => format!("{} ({code})", task.product_name),
        None => task.product_name.clone(),
    };
    format!(
        "{short_id}  {urgent}{:>2}  {:<11}  {:<28}  {:<12}  {:>7.0} min  {}",
        task.priority,
        task.status.as_str(),
        product,
        task.master_name,
        task.effective_duration(),
        task.commit_time
    )
}

pub(super) fn format_recommendation(rec: &Recommendation) -> String {
    let mut out = format!(
        "history: {} ({:.0}% confidence, {})",
        rec.master_name, rec.confidence, rec.reason
    );
    for alt in &rec.alternatives {
        let _ = write!(out, "\n  or {} (score {:.1}, {})", alt.master_name, alt.score, alt.reason);
    }
    out
}

pub(super) fn format_statistics(stats: &Statistics) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} tasks: {} completed, {} in progress, {} pending",
        stats.total_tasks, stats.completed_tasks, stats.in_progress_tasks, stats.pending_tasks
    );
    let _ = writeln!(out, "average completion: {:.0} min", stats.avg_completion_time);

    if !stats.master_productivity.is_empty() {
        out.push_str("\nmasters:\n");
        for m in &stats.master_productivity {
            let _ = writeln!(
                out,
                "  {:<16} {}/{} completed  {:.0}%  avg {:.0} min",
                m.master_name, m.completed_tasks, m.total_tasks, m.efficiency, m.avg_work_hours
            );
        }
    }

    if !stats.daily_progress.is_empty() {
        out.push_str("\ndaily:\n");
        for day in &stats.daily_progress {
            let _ = writeln!(
                out,
                "  {}  {}/{}  {:.0}%",
                day.date, day.completed, day.total, day.percentage
            );
        }
    }
    out
}

pub(super) fn format_assignment_stats(stats: &AssignmentStats) -> String {
    format!(
        "{} auto-assigned ({} by code, {} by name), {} left for manual assignment\n",
        stats.auto_assigned, stats.by_product_code, stats.by_product_name, stats.manual
    )
}

pub(super) fn format_status(
    stats: &StorageStats,
    health: Option<&Health>,
    check: &MigrationCheck,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "storage:   {} ({:.2} MB)", stats.mode, stats.size_mb);
    let _ = writeln!(
        out,
        "backup:    {}{}",
        stats.last_backup.as_deref().unwrap_or("never"),
        if stats.has_backup { " (blob copy kept)" } else { "" }
    );
    let _ = writeln!(out, "import:    {}", stats.last_import.as_deref().unwrap_or("never"));

    match health {
        Some(h) => {
            let saved = h
                .last_save
                .map_or_else(|| "never".to_string(), |t| t.to_string());
            let _ = writeln!(
                out,
                "database:  v{}, {} tables, {} bytes, saved {saved}",
                h.version, h.table_count, h.image_bytes
            );
        }
        None => out.push_str("database:  unavailable\n"),
    }

    let _ = writeln!(
        out,
        "tasks:     {} in store, {} in database{}",
        check.kv_count,
        check.engine_count,
        if check.needs_migration { " (migration needed)" } else { "" }
    );
    out
}

pub(super) fn format_startup(report: &StartupReport) -> String {
    let phases: Vec<String> = report.phases.iter().map(ToString::to_string).collect();
    let mut out = format!("startup:   {}\n", phases.join(" → "));
    if let Some((source, package)) = &report.package {
        let _ = writeln!(out, "           package from {source}: {} records", package.total());
    }
    if let Some(migration) = &report.migration {
        let _ = writeln!(out, "           migrated {} records", migration.total());
    }
    for error in &report.errors {
        let _ = writeln!(out, "           error: {error}");
    }
    out
}

pub(super) fn format_migration(report: &MigrationReport) -> String {
    let mut out = format!(
        "{} tasks, {} settings, {} assignments, {} presets\n",
        report.tasks_migrated,
        report.settings_migrated,
        report.assignments_migrated,
        report.presets_migrated
    );
    if let Some(key) = &report.backup_key {
        let _ = writeln!(out, "snapshot: {key}");
    }
    for err in &report.row_errors {
        let _ = writeln!(out, "  skipped {}: {}", err.task_id, err.reason);
    }
    for err in &report.errors {
        let _ = writeln!(out, "  error: {err}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::sample_task;

    #[test]
    fn task_line_marks_urgent_tasks() {
        let mut task = sample_task("0123456789abcdef");
        assert!(format_task_line(&task).starts_with("01234567   "));

        task.priority = 9;
        let line = format_task_line(&task);
        assert!(line.starts_with("01234567  ! 9"));
        assert!(line.contains("Valve-Body (V1)"));
    }

    #[test]
    fn migration_lists_skipped_rows() {
        let report = MigrationReport {
            tasks_migrated: 2,
            row_errors: vec![crate::engine::RowWriteError {
                task_id: "bad".into(),
                reason: "work hours must be positive, got 0".into(),
            }],
            ..MigrationReport::default()
        };
        let out = format_migration(&report);
        assert!(out.starts_with("2 tasks, 0 settings"));
        assert!(out.contains("skipped bad: work hours"));
    }
}

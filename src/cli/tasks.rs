//! Task commands: list, add, import, status, delete, history.

use std::path::{Path, PathBuf};

use clap::{Subcommand, ValueEnum};
use uuid::Uuid;

use crate::context::AppContext;
use crate::engine::{DateRange, TaskFilter};
use crate::model::{Task, TaskStatus, UNASSIGNED};

use super::format;

#[derive(Debug, Subcommand)]
pub enum TasksCommand {
    /// List tasks in board order: priority, then newest commit first.
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Only this master's tasks (`unassigned` for nobody's).
        #[arg(long)]
        master: Option<String>,

        /// Case-insensitive match on product, batch or client.
        #[arg(long)]
        search: Option<String>,

        #[arg(long, requires = "to")]
        from: Option<String>,

        #[arg(long, requires = "from")]
        to: Option<String>,

        #[arg(long)]
        min_priority: Option<i64>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 50)]
        page_size: u32,

        /// Print the page as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Add a task. Prints the task ID.
    Add {
        #[arg(long)]
        product: String,

        #[arg(long)]
        code: Option<String>,

        /// Estimate in minutes.
        #[arg(long)]
        hours: f64,

        #[arg(long)]
        batch: String,

        #[arg(long)]
        client: String,

        /// Commit date (e.g. 2025-01-13).
        #[arg(long)]
        commit: String,

        /// Master name. Left unassigned unless the board can recommend one.
        #[arg(long)]
        master: Option<String>,

        #[arg(long, default_value_t = 5)]
        priority: i64,

        #[arg(long)]
        coefficient: Option<f64>,

        #[arg(long)]
        quantity: Option<i64>,
    },

    /// Import a JSON array of tasks, filling in masters the board has learned.
    Import { file: PathBuf },

    /// Move a task to another status.
    Status {
        id: String,

        #[arg(value_enum)]
        status: StatusArg,
    },

    /// Delete a task.
    Delete { id: String },

    /// Show a task's change history.
    History { id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    InProgress,
    Completed,
}

impl StatusArg {
    fn to_domain(self) -> TaskStatus {
        match self {
            Self::Pending => TaskStatus::Pending,
            Self::InProgress => TaskStatus::InProgress,
            Self::Completed => TaskStatus::Completed,
        }
    }
}

pub(super) fn run(ctx: &mut AppContext, command: TasksCommand) -> Result<(), String> {
    match command {
        TasksCommand::List {
            status,
            master,
            search,
            from,
            to,
            min_priority,
            page,
            page_size,
            json,
        } => {
            let filter = TaskFilter {
                status: status.map(StatusArg::to_domain),
                master_name: master,
                search,
                date_range: from.zip(to).map(|(start, end)| DateRange { start, end }),
                min_priority,
            };
            cmd_list(ctx, &filter, page, page_size, json)
        }
        TasksCommand::Add {
            product,
            code,
            hours,
            batch,
            client,
            commit,
            master,
            priority,
            coefficient,
            quantity,
        } => {
            let task = Task {
                id: Uuid::new_v4().to_string(),
                product_name: product,
                product_code: code,
                work_hours: hours,
                master_name: master.unwrap_or_else(|| UNASSIGNED.to_string()),
                batch_number: batch,
                client_name: client,
                commit_time: commit,
                status: TaskStatus::Pending,
                priority,
                coefficient,
                process_order_id: None,
                factory_code: None,
                order_date: None,
                delivery_time: None,
                quantity,
                assigned_person: None,
                assigned_team: None,
            };
            cmd_add(ctx, task)
        }
        TasksCommand::Import { file } => cmd_import(ctx, &file),
        TasksCommand::Status { id, status } => cmd_status(ctx, &id, status.to_domain()),
        TasksCommand::Delete { id } => cmd_delete(ctx, &id),
        TasksCommand::History { id } => cmd_history(ctx, &id),
    }
}

fn cmd_list(
    ctx: &AppContext,
    filter: &TaskFilter,
    page: u32,
    page_size: u32,
    json: bool,
) -> Result<(), String> {
    let page = ctx
        .page(page, page_size, filter)
        .map_err(|e| format!("failed to list tasks: {e}"))?;

    if json {
        let out = serde_json::to_string_pretty(&page).map_err(|e| e.to_string())?;
        println!("{out}");
        return Ok(());
    }

    if page.items.is_empty() {
        println!("No tasks");
        return Ok(());
    }
    for task in &page.items {
        println!("{}", format::format_task_line(task));
    }
    println!(
        "\npage {} of {} tasks{}",
        page.page,
        page.total,
        if page.has_more { " (more)" } else { "" }
    );
    Ok(())
}

fn cmd_add(ctx: &mut AppContext, mut task: Task) -> Result<(), String> {
    if task.is_unassigned()
        && let Some(master) = ctx
            .recommender()
            .recommend(&task.product_name, task.product_code.as_deref())
    {
        eprintln!("assigned to {master} from learned history");
        task.master_name = master;
    }

    ctx.save_task(&task)
        .map_err(|e| format!("failed to add task: {e}"))?;
    println!("{}", task.id);
    Ok(())
}

fn cmd_import(ctx: &mut AppContext, file: &Path) -> Result<(), String> {
    let raw = std::fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let tasks: Vec<Task> = serde_json::from_str(&raw)
        .map_err(|e| format!("{} is not a JSON task list: {e}", file.display()))?;

    let (outcome, stats) = ctx
        .import_tasks(tasks)
        .map_err(|e| format!("failed to import tasks: {e}"))?;

    println!("{} tasks written", outcome.written);
    print!("{}", format::format_assignment_stats(&stats));
    for err in &outcome.errors {
        eprintln!("  skipped {}: {}", err.task_id, err.reason);
    }
    Ok(())
}

fn cmd_status(ctx: &mut AppContext, id: &str, status: TaskStatus) -> Result<(), String> {
    let task = ctx
        .set_status(id, status)
        .map_err(|e| format!("failed to update task: {e}"))?;
    println!("{}", format::format_task_line(&task));
    Ok(())
}

fn cmd_delete(ctx: &mut AppContext, id: &str) -> Result<(), String> {
    let deleted = ctx
        .delete_task(id)
        .map_err(|e| format!("failed to delete task: {e}"))?;
    if !deleted {
        return Err(format!("task not found: {id}"));
    }
    println!("Deleted {id}");
    Ok(())
}

fn cmd_history(ctx: &AppContext, id: &str) -> Result<(), String> {
    let history = ctx
        .task_history(id)
        .map_err(|e| format!("failed to read history: {e}"))?;

    if history.is_empty() {
        println!("No history for {id}");
        return Ok(());
    }
    for entry in &history {
        println!("{}  {:<8} by {}", entry.created_at, entry.action, entry.changed_by);
    }
    Ok(())
}

//! The application handle: configuration, storage and the engine, built
//! once at startup and passed to whatever needs them.
//!
//! Task reads and writes go to the engine when it is up. When it is not,
//! they go to the task list in the key-value store, with the same filter
//! and ordering rules applied in memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{self, Config};
use crate::engine::{BatchOutcome, Engine, EngineError, HistoryEntry, Page, RowWriteError, TaskFilter};
use crate::kv::{DirStore, KvError, KvStore};
use crate::migration::{MigrationError, Migrator, StartupReport};
use crate::model::{Task, TaskStatus};
use crate::policy::{PolicyError, StoragePolicy};
use crate::recommender::{AssignmentStats, Recommender};

/// Errors surfaced through the application handle.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("invalid task {id}: {reason}")]
    InvalidTask { id: String, reason: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("the database is unavailable; running on the key-value store")]
    EngineUnavailable,
}

pub type Result<T> = core::result::Result<T, ContextError>;

pub struct AppContext {
    pub config: Config,
    home: PathBuf,
    store: Arc<dyn KvStore>,
    engine: Option<Engine>,
    startup: StartupReport,
}

impl AppContext {
    /// Opens the store under `home` and runs the startup sequence.
    pub fn open(home: &Path, config: Config, url_query: Option<&str>) -> Result<Self> {
        let store: Arc<dyn KvStore> =
            Arc::new(DirStore::open(config::store_dir(home), config.quota_bytes())?);
        Ok(Self::with_store(home, config, store, url_query))
    }

    /// Runs the startup sequence over an already opened store.
    pub fn with_store(
        home: &Path,
        config: Config,
        store: Arc<dyn KvStore>,
        url_query: Option<&str>,
    ) -> Self {
        let (engine, startup) = Migrator::new(&config, store.clone()).startup(url_query);
        Self {
            config,
            home: home.to_path_buf(),
            store,
            engine,
            startup,
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn engine(&self) -> Option<&Engine> {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> Option<&mut Engine> {
        self.engine.as_mut()
    }

    /// The engine, or [`ContextError::EngineUnavailable`].
    pub fn require_engine(&mut self) -> Result<&mut Engine> {
        self.engine.as_mut().ok_or(ContextError::EngineUnavailable)
    }

    pub fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    pub fn is_degraded(&self) -> bool {
        self.engine.is_none()
    }

    pub fn migrator(&self) -> Migrator {
        Migrator::new(&self.config, self.store.clone())
    }

    pub fn policy(&self) -> StoragePolicy {
        StoragePolicy::new(&self.config, &self.home, self.store.clone())
    }

    pub fn recommender(&self) -> Recommender {
        Recommender::new(self.store.clone())
    }

    // ── Tasks ──

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        match &self.engine {
            Some(engine) => Ok(engine.get_task(id)?),
            None => Ok(self.store.load_tasks().into_iter().find(|t| t.id == id)),
        }
    }

    /// Saves a task and teaches the recommender from it.
    pub fn save_task(&mut self, task: &Task) -> Result<()> {
        let previous = self.get_task(&task.id)?;
        match &mut self.engine {
            Some(engine) => engine.upsert_task(task)?,
            None => {
                task.validate().map_err(|reason| ContextError::InvalidTask {
                    id: task.id.clone(),
                    reason,
                })?;
                let mut tasks = self.store.load_tasks();
                match tasks.iter_mut().find(|t| t.id == task.id) {
                    Some(existing) => *existing = task.clone(),
                    None => tasks.push(task.clone()),
                }
                self.store.save_tasks(&tasks)?;
                debug!(id = %task.id, "task saved to key-value store");
            }
        }

        let previous_master = previous.as_ref().map(|p| p.master_name.as_str());
        if let Err(e) = self.recommender().learn_from_task_update(task, previous_master) {
            warn!(error = %e, "could not record assignment");
        }
        Ok(())
    }

    /// Saves an imported batch.
    ///
    /// Tasks without a master first take the recommender's suggestion, or
    /// the unassigned marker. Returns the write outcome and how masters
    /// were chosen.
    pub fn import_tasks(&mut self, mut tasks: Vec<Task>) -> Result<(BatchOutcome, AssignmentStats)> {
        let recommender = self.recommender();
        let filled = recommender.apply_to_import_batch(&mut tasks);
        let stats = recommender.compute_stats(&tasks);
        debug!(tasks = tasks.len(), filled, "import batch prepared");

        let outcome = match &mut self.engine {
            Some(engine) => engine.upsert_tasks_batch(&tasks)?,
            None => {
                let mut outcome = BatchOutcome::default();
                let mut stored = self.store.load_tasks();
                for task in tasks {
                    if let Err(reason) = task.validate() {
                        outcome.errors.push(RowWriteError {
                            task_id: task.id,
                            reason,
                        });
                        continue;
                    }
                    match stored.iter_mut().find(|t| t.id == task.id) {
                        Some(existing) => *existing = task,
                        None => stored.push(task),
                    }
                    outcome.written += 1;
                }
                self.store.save_tasks(&stored)?;
                outcome
            }
        };
        Ok((outcome, stats))
    }

    /// Moves a task to `status` and returns it as saved.
    pub fn set_status(&mut self, id: &str, status: TaskStatus) -> Result<Task> {
        let mut task = self
            .get_task(id)?
            .ok_or_else(|| ContextError::TaskNotFound(id.to_string()))?;
        task.status = status;
        self.save_task(&task)?;
        Ok(task)
    }

    /// Removes a task. Returns whether it existed.
    pub fn delete_task(&mut self, id: &str) -> Result<bool> {
        match &mut self.engine {
            Some(engine) => Ok(engine.delete_task(id)?),
            None => {
                let mut tasks = self.store.load_tasks();
                let before = tasks.len();
                tasks.retain(|t| t.id != id);
                if tasks.len() == before {
                    return Ok(false);
                }
                self.store.save_tasks(&tasks)?;
                Ok(true)
            }
        }
    }

    /// One page of tasks in board order.
    pub fn page(&self, page: u32, page_size: u32, filter: &TaskFilter) -> Result<Page> {
        match &self.engine {
            Some(engine) => Ok(engine.get_page(page, page_size, filter)?),
            None => {
                let tasks = self
                    .kv_tasks_in_order()
                    .into_iter()
                    .filter(|t| filter.matches(t))
                    .collect();
                Ok(Page::slice(tasks, page, page_size))
            }
        }
    }

    /// Every task in board order.
    pub fn all_tasks(&self) -> Result<Vec<Task>> {
        match &self.engine {
            Some(engine) => Ok(engine.all_tasks()?),
            None => Ok(self.kv_tasks_in_order()),
        }
    }

    pub fn task_history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        let engine = self.engine.as_ref().ok_or(ContextError::EngineUnavailable)?;
        Ok(engine.task_history(id)?)
    }

    /// The key-value task list in board order: priority, then commit time,
    /// both descending, newest entry first among equals.
    fn kv_tasks_in_order(&self) -> Vec<Task> {
        let mut tasks = self.store.load_tasks();
        // Later entries are newer; reverse so the stable sort keeps them first.
        tasks.reverse();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.commit_time.cmp(&a.commit_time))
        });
        tasks
    }
}

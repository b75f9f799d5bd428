//! Work-item counts, the only signal the orchestrator reads to pick a phase.
//!
//! The store itself belongs to the agent: it creates and updates items while
//! it works. This module only counts them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

/// A project the orchestrator drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub dir: PathBuf,
}

impl Project {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkCounts {
    pub total: u64,
    pub passing: u64,
}

impl WorkCounts {
    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.passing)
    }
}

#[async_trait]
pub trait WorkItemStore: Send + Sync {
    async fn count_total(&self, project: &Project) -> Result<u64>;

    async fn count_passing(&self, project: &Project) -> Result<u64>;

    /// Items in `category` that are not passing yet.
    async fn count_pending_in_category(&self, project: &Project, category: &str) -> Result<u64>;

    async fn counts(&self, project: &Project) -> Result<WorkCounts> {
        Ok(WorkCounts {
            total: self.count_total(project).await?,
            passing: self.count_passing(project).await?,
        })
    }
}

/// Read-only view over the agent's `features` table.
///
/// Expected schema: `features(passes INTEGER, category TEXT, ...)`. A missing
/// database or table means the agent has not created any items yet.
#[derive(Debug, Clone)]
pub struct SqliteFeatureStore {
    database: String,
}

impl SqliteFeatureStore {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }

    fn db_path(&self, project: &Project) -> PathBuf {
        project.dir.join(&self.database)
    }

    /// Run a counting query on a blocking thread. `None` from `open` means zero.
    async fn query(&self, project: &Project, sql: &'static str, category: Option<String>) -> Result<u64> {
        let path = self.db_path(project);
        tokio::task::spawn_blocking(move || {
            let Some(conn) = open_read_only(&path)? else {
                return Ok(0);
            };
            let count: i64 = match category {
                Some(ref c) => conn.query_row(sql, params![c], |row| row.get(0)),
                None => conn.query_row(sql, [], |row| row.get(0)),
            }
            .with_context(|| format!("Count query failed on {}", path.display()))?;
            Ok(count.max(0) as u64)
        })
        .await
        .context("Store task panicked")?
    }
}

fn open_read_only(path: &Path) -> Result<Option<Connection>> {
    if !path.exists() {
        return Ok(None);
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open {}", path.display()))?;
    let has_table: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'features'",
            [],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to inspect schema")?;
    Ok(has_table.map(|_| conn))
}

#[async_trait]
impl WorkItemStore for SqliteFeatureStore {
    async fn count_total(&self, project: &Project) -> Result<u64> {
        self.query(project, "SELECT COUNT(*) FROM features", None).await
    }

    async fn count_passing(&self, project: &Project) -> Result<u64> {
        self.query(project, "SELECT COUNT(*) FROM features WHERE passes = 1", None)
            .await
    }

    async fn count_pending_in_category(&self, project: &Project, category: &str) -> Result<u64> {
        self.query(
            project,
            "SELECT COUNT(*) FROM features WHERE passes = 0 AND category = ?1",
            Some(category.to_string()),
        )
        .await
    }

    async fn counts(&self, project: &Project) -> Result<WorkCounts> {
        let path = self.db_path(project);
        tokio::task::spawn_blocking(move || {
            let Some(conn) = open_read_only(&path)? else {
                return Ok(WorkCounts::default());
            };
            let (total, passing): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(CASE WHEN passes = 1 THEN 1 ELSE 0 END), 0) FROM features",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .context("Count query failed")?;
            Ok(WorkCounts {
                total: total.max(0) as u64,
                passing: passing.max(0) as u64,
            })
        })
        .await
        .context("Store task panicked")?
    }
}

/// One item in a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub category: String,
    pub passes: bool,
}

/// In-process store for tests and dry runs. Keyed by project name.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    items: Arc<Mutex<HashMap<String, Vec<WorkItem>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_items(&self, project: &str, count: usize, category: &str, passes: bool) {
        if let Ok(mut items) = self.items.lock() {
            items
                .entry(project.to_string())
                .or_default()
                .extend((0..count).map(|_| WorkItem {
                    category: category.to_string(),
                    passes,
                }));
        }
    }

    pub fn mark_all_passing(&self, project: &str) {
        if let Ok(mut items) = self.items.lock()
            && let Some(list) = items.get_mut(project)
        {
            list.iter_mut().for_each(|item| item.passes = true);
        }
    }

    pub fn snapshot(&self, project: &str) -> Vec<WorkItem> {
        self.items
            .lock()
            .ok()
            .and_then(|items| items.get(project).cloned())
            .unwrap_or_default()
    }

    fn with_items<R>(&self, project: &Project, f: impl FnOnce(&[WorkItem]) -> R) -> Result<R> {
        let items = self
            .items
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
        Ok(f(items.get(&project.name).map(Vec::as_slice).unwrap_or(&[])))
    }
}

#[async_trait]
impl WorkItemStore for MemoryStore {
    async fn count_total(&self, project: &Project) -> Result<u64> {
        self.with_items(project, |items| items.len() as u64)
    }

    async fn count_passing(&self, project: &Project) -> Result<u64> {
        self.with_items(project, |items| items.iter().filter(|i| i.passes).count() as u64)
    }

    async fn count_pending_in_category(&self, project: &Project, category: &str) -> Result<u64> {
        self.with_items(project, |items| {
            items
                .iter()
                .filter(|i| !i.passes && i.category == category)
                .count() as u64
        })
    }
}

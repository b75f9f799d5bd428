//! Cross-process run-lock at `<project>/.autoforge/agent.lock`.
//!
//! The file is created with `create_new` and then held with an exclusive
//! advisory lock for the worker's lifetime. A file that exists but that no
//! process holds locked is orphaned: it is reported, never silently reused.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::STATE_DIR;
use crate::errors::OrchestratorError;
use crate::store::Project;

pub const LOCK_FILE: &str = "agent.lock";

/// How long an unlocked, empty lock file counts as still being written.
const EMPTY_LOCK_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub project: String,
    pub started_at: DateTime<Utc>,
}

/// Held run-lock. Dropping it releases the lock and deletes the file.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

/// What is on disk for a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Absent,
    /// A live process holds the lock.
    Held(Option<LockInfo>),
    /// The file exists but nobody holds it.
    Orphaned(Option<LockInfo>),
}

/// An orphaned lock found by [`reconcile_locks`].
#[derive(Debug, Clone, Serialize)]
pub struct OrphanedLock {
    pub project: String,
    pub path: PathBuf,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub cleared: bool,
}

pub fn lock_path(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR).join(LOCK_FILE)
}

impl RunLock {
    pub fn acquire(project: &Project) -> Result<Self, OrchestratorError> {
        let path = lock_path(&project.dir);
        let io_err = |source| OrchestratorError::LockIo {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(match inspect(&project.dir) {
                    LockState::Orphaned(info) => OrchestratorError::StaleLock {
                        project: project.name.clone(),
                        path: path.clone(),
                        pid: info.map(|i| i.pid),
                    },
                    // Absent means the holder released it between our two calls;
                    // report it as running rather than racing for it.
                    LockState::Held(_) | LockState::Absent => OrchestratorError::AlreadyRunning {
                        project: project.name.clone(),
                    },
                });
            }
            Err(e) => return Err(io_err(e)),
        };

        if let Err(e) = file.try_lock_exclusive() {
            let _ = std::fs::remove_file(&path);
            return Err(io_err(e));
        }

        let info = LockInfo {
            pid: std::process::id(),
            project: project.name.clone(),
            started_at: Utc::now(),
        };
        let written = serde_json::to_vec(&info)
            .map_err(std::io::Error::from)
            .and_then(|payload| file.write_all(&payload))
            .and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = std::fs::remove_file(&path);
            return Err(io_err(e));
        }

        tracing::debug!(project = %project.name, path = %path.display(), "Run-lock acquired");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            tracing::error!(path = %self.path.display(), "Failed to remove run-lock: {}", e);
        }
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(path = %self.path.display(), "Run-lock released");
    }
}

fn read_info(file: &mut File) -> Option<LockInfo> {
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    serde_json::from_str(&content).ok()
}

/// Classify the lock file of `project_dir` without modifying it.
pub fn inspect(project_dir: &Path) -> LockState {
    let path = lock_path(project_dir);
    let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return LockState::Absent,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Cannot open run-lock: {}", e);
            return LockState::Held(None);
        }
    };
    let info = read_info(&mut file);
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            if info.is_none() && is_being_written(&file) {
                LockState::Held(None)
            } else {
                LockState::Orphaned(info)
            }
        }
        Err(_) => LockState::Held(info),
    }
}

/// A fresh empty file belongs to an `acquire` between `create_new` and
/// taking the lock. Once the grace has passed it is a crashed acquire.
fn is_being_written(file: &File) -> bool {
    let Ok(meta) = file.metadata() else {
        return false;
    };
    meta.len() == 0
        && meta
            .modified()
            .map(|m| m.elapsed().map_or(true, |age| age < EMPTY_LOCK_GRACE))
            .unwrap_or(true)
}

/// Report orphaned run-locks among `projects`, deleting them when `clear` is set.
pub fn reconcile_locks(projects: &[Project], clear: bool) -> Vec<OrphanedLock> {
    let mut orphaned = Vec::new();
    for project in projects {
        let LockState::Orphaned(info) = inspect(&project.dir) else {
            continue;
        };
        let path = lock_path(&project.dir);
        let cleared = clear
            && match std::fs::remove_file(&path) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(path = %path.display(), "Failed to clear orphaned lock: {}", e);
                    false
                }
            };
        tracing::warn!(
            project = %project.name,
            path = %path.display(),
            cleared,
            "Orphaned run-lock"
        );
        orphaned.push(OrphanedLock {
            project: project.name.clone(),
            path,
            pid: info.as_ref().map(|i| i.pid),
            started_at: info.map(|i| i.started_at),
            cleared,
        });
    }
    orphaned
}

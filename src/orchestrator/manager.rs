use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lock::{self, OrphanedLock, RunLock};
use super::phase::{AgentPhase, AgentStatus};
use super::runner;
use super::session::LoopExit;
use crate::client::{ClientFactory, CodeGenClient, SessionSettings};
use crate::config::{Limits, STATE_DIR};
use crate::errors::OrchestratorError;
use crate::hub::{BroadcastHub, HubEvent, Subscription};
use crate::process::ProcessSupervisor;
use crate::prompts::PromptSource;
use crate::store::{Project, WorkItemStore};

/// How often `follow` re-checks the status between events.
const FOLLOW_POLL: Duration = Duration::from_millis(250);

/// Collaborators the manager drives.
pub struct ManagerDeps {
    pub hub: BroadcastHub,
    pub store: Arc<dyn WorkItemStore>,
    pub prompts: Arc<dyn PromptSource>,
    pub clients: Arc<dyn ClientFactory>,
    pub supervisor: ProcessSupervisor,
    pub limits: Limits,
    pub validation_category: String,
}

/// Parameters a worker was started with.
#[derive(Debug, Clone)]
pub(crate) struct RunOptions {
    pub yolo: bool,
    pub model: Option<String>,
}

/// State shared between the manager and one worker task.
pub(crate) struct WorkerShared {
    pub cancel: CancellationToken,
    pub paused: watch::Sender<bool>,
    pub active_client: Mutex<Option<Arc<dyn CodeGenClient>>>,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            paused: watch::channel(false).0,
            active_client: Mutex::new(None),
        }
    }

    pub fn set_active_client(&self, client: Option<Arc<dyn CodeGenClient>>) {
        if let Ok(mut slot) = self.active_client.lock() {
            *slot = client;
        }
    }

    pub fn active_client(&self) -> Option<Arc<dyn CodeGenClient>> {
        self.active_client.lock().ok().and_then(|slot| slot.clone())
    }
}

#[derive(Clone)]
struct Worker {
    generation: u64,
    project: Project,
    shared: Arc<WorkerShared>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Worker {
    fn is_finished(&self) -> bool {
        self.join
            .lock()
            .ok()
            .and_then(|j| j.as_ref().map(|h| h.is_finished()))
            .unwrap_or(false)
    }

    fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join.lock().ok().and_then(|mut j| j.take())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StatusEntry {
    pub status: AgentStatus,
    pub phase: Option<AgentPhase>,
    pub last_session: Option<u64>,
    pub last_reason: Option<String>,
}

/// Snapshot returned by [`AgentManager::status_report`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project: String,
    pub status: AgentStatus,
    pub phase: Option<AgentPhase>,
    pub last_session: Option<u64>,
    pub last_reason: Option<String>,
    pub observers: usize,
}

pub(crate) struct ManagerInner {
    pub hub: BroadcastHub,
    pub store: Arc<dyn WorkItemStore>,
    pub prompts: Arc<dyn PromptSource>,
    pub clients: Arc<dyn ClientFactory>,
    pub supervisor: ProcessSupervisor,
    pub limits: Limits,
    pub validation_category: String,
    workers: DashMap<String, Worker>,
    statuses: DashMap<String, StatusEntry>,
    next_generation: AtomicU64,
}

impl ManagerInner {
    pub fn update_status(&self, project: &str, f: impl FnOnce(&mut StatusEntry)) {
        f(&mut self.statuses.entry(project.to_string()).or_default());
    }

    fn current_status(&self, project: &str) -> AgentStatus {
        self.statuses
            .get(project)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Set the status and tell observers. Repeats of the same status with the
    /// same message are not re-broadcast.
    pub fn set_status(&self, project: &str, status: AgentStatus, message: &str) {
        // Publish while holding the entry so no reader sees the new status
        // before observers do.
        let mut entry = self.statuses.entry(project.to_string()).or_default();
        let changed = entry.status != status || entry.last_reason.as_deref() != Some(message);
        entry.status = status;
        entry.last_reason = Some(message.to_string());
        if changed {
            self.hub.publish(project, &HubEvent::status(status, message));
        }
    }

    /// Drop the worker entry if it still belongs to `generation`.
    pub fn remove_worker(&self, project: &str, generation: u64) {
        self.workers
            .remove_if(project, |_, w| w.generation == generation);
    }

    /// Remove transient files the agent leaves under `.autoforge/tmp`.
    pub fn clear_transient(&self, project: &Project) {
        let tmp = project.dir.join(STATE_DIR).join("tmp");
        match std::fs::remove_dir_all(&tmp) {
            Ok(()) => tracing::debug!(project = %project.name, "Cleared transient artifacts"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(project = %project.name, "Failed to clear {}: {}", tmp.display(), e),
        }
    }

    /// Stop any subprocess still registered for this project's sessions.
    pub async fn stop_project_processes(&self, project: &str) {
        let prefix = format!("{}-session-", project);
        for name in self.supervisor.names() {
            if name.starts_with(&prefix)
                && let Err(e) = self.supervisor.stop(&name).await
            {
                tracing::error!(project, name = %name, "Failed to stop session process: {:#}", e);
            }
        }
    }
}

/// Owns one worker task per running project.
///
/// Cheap to clone; clones share the same workers and status map.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<ManagerInner>,
}

impl AgentManager {
    pub fn new(deps: ManagerDeps) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                hub: deps.hub,
                store: deps.store,
                prompts: deps.prompts,
                clients: deps.clients,
                supervisor: deps.supervisor,
                limits: deps.limits,
                validation_category: deps.validation_category,
                workers: DashMap::new(),
                statuses: DashMap::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    /// Start the agent loop for `project` and return once the worker is spawned.
    pub fn start(
        &self,
        project: &Project,
        yolo: bool,
        model: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let name = project.name.clone();

        // A finished task still in the map died without cleaning up.
        if let Some(existing) = self.inner.workers.get(&name).map(|w| w.clone()) {
            if !existing.is_finished() {
                return Err(OrchestratorError::AlreadyRunning { project: name });
            }
            self.inner.remove_worker(&name, existing.generation);
        }

        let lock = RunLock::acquire(project)?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let worker = Worker {
            generation,
            project: project.clone(),
            shared: Arc::new(WorkerShared::new()),
            join: Arc::new(Mutex::new(None)),
        };

        match self.inner.workers.entry(name.clone()) {
            Entry::Occupied(_) => {
                // Lost a race with a concurrent start in this process.
                return Err(OrchestratorError::AlreadyRunning { project: name });
            }
            Entry::Vacant(slot) => {
                slot.insert(worker.clone());
            }
        }

        self.inner.update_status(&name, |entry| {
            entry.phase = None;
            entry.last_session = None;
        });
        self.inner
            .set_status(&name, AgentStatus::Running, "Agent started");

        let handle = tokio::spawn(runner::run_worker(
            self.inner.clone(),
            project.clone(),
            generation,
            worker.shared.clone(),
            RunOptions { yolo, model },
            lock,
        ));
        if let Ok(mut join) = worker.join.lock() {
            *join = Some(handle);
        }

        tracing::info!(project = %name, yolo, "Agent started");
        Ok(())
    }

    /// Stop the agent for `project`. Safe to call when nothing is running.
    pub async fn stop(&self, project: &str) -> Result<(), OrchestratorError> {
        let worker = self.inner.workers.get(project).map(|w| w.clone());
        let was_active = worker.is_some() || self.inner.current_status(project).is_active();
        if let Some(worker) = worker {
            worker.shared.cancel.cancel();
            if let Some(client) = worker.shared.active_client() {
                client.close().await;
            }

            if let Some(mut join) = worker.take_join() {
                match tokio::time::timeout(self.inner.limits.stop_grace, &mut join).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(project, "Worker task failed: {}", e),
                    Err(_) => {
                        tracing::warn!(project, "Worker did not exit within grace period; aborting");
                        join.abort();
                        // Aborting drops the worker future and with it the run-lock.
                        let _ = join.await;
                        self.inner.clear_transient(&worker.project);
                    }
                }
            }
            self.inner.remove_worker(project, worker.generation);
        }

        self.inner.stop_project_processes(project).await;
        // Keep the terminal reason of a worker that already ended on its own.
        if was_active {
            self.inner
                .set_status(project, AgentStatus::Stopped, &LoopExit::Stopped.message());
            tracing::info!(project, "Agent stopped");
        }
        Ok(())
    }

    /// Current status. A worker that died while marked running is reported
    /// (and recorded) as crashed.
    pub fn status(&self, project: &str) -> AgentStatus {
        let status = self.inner.current_status(project);
        if !status.is_active() {
            return status;
        }
        let alive = self
            .inner
            .workers
            .get(project)
            .map(|w| !w.is_finished())
            .unwrap_or(false);
        if alive {
            return status;
        }
        tracing::warn!(project, "Worker is gone but status was {}; marking crashed", status);
        self.inner.set_status(
            project,
            AgentStatus::Crashed,
            "Agent worker exited unexpectedly",
        );
        AgentStatus::Crashed
    }

    pub fn status_report(&self, project: &str) -> StatusReport {
        let status = self.status(project);
        let entry = self
            .inner
            .statuses
            .get(project)
            .map(|e| e.clone())
            .unwrap_or_default();
        StatusReport {
            project: project.to_string(),
            status,
            phase: entry.phase,
            last_session: entry.last_session,
            last_reason: entry.last_reason,
            observers: self.inner.hub.observer_count(project),
        }
    }

    /// Hand each event from `subscription` to `on_event` until `project` is
    /// no longer active, then return its final status.
    ///
    /// The hub drops events for a lagging observer, the terminal `Status`
    /// included, so the status is polled as well. Events still buffered when
    /// the agent ends are delivered before returning.
    pub async fn follow(
        &self,
        project: &str,
        subscription: &mut Subscription,
        mut on_event: impl FnMut(&HubEvent),
    ) -> AgentStatus {
        let mut poll = tokio::time::interval(FOLLOW_POLL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                payload = subscription.rx.recv() => {
                    let Some(payload) = payload else {
                        return self.status(project);
                    };
                    let Ok(event) = serde_json::from_str::<HubEvent>(&payload) else {
                        continue;
                    };
                    on_event(&event);
                    if let HubEvent::Status { status, .. } = event
                        && !status.is_active()
                    {
                        return status;
                    }
                }
                _ = poll.tick() => {
                    let status = self.status(project);
                    if status.is_active() {
                        continue;
                    }
                    while let Ok(payload) = subscription.rx.try_recv() {
                        if let Ok(event) = serde_json::from_str::<HubEvent>(&payload) {
                            on_event(&event);
                        }
                    }
                    return status;
                }
            }
        }
    }

    /// Projects with a known status, sorted by name.
    pub fn projects(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.statuses.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Hold the worker at the next iteration boundary. A session already in
    /// flight runs to completion.
    pub fn pause(&self, project: &str) -> Result<(), OrchestratorError> {
        self.toggle_pause(project, true)
    }

    pub fn resume(&self, project: &str) -> Result<(), OrchestratorError> {
        self.toggle_pause(project, false)
    }

    fn toggle_pause(&self, project: &str, paused: bool) -> Result<(), OrchestratorError> {
        let worker = self
            .inner
            .workers
            .get(project)
            .map(|w| w.clone())
            .filter(|w| !w.is_finished())
            .ok_or_else(|| OrchestratorError::NotRunning {
                project: project.to_string(),
            })?;
        worker.shared.paused.send_replace(paused);
        let (status, message) = if paused {
            (AgentStatus::Paused, "Agent paused; it will wait after the current session")
        } else {
            (AgentStatus::Running, "Agent resumed")
        };
        self.inner.set_status(project, status, message);
        tracing::info!(project, %status, "Pause state changed");
        Ok(())
    }

    /// Stop every worker in parallel, then anything the supervisor still tracks.
    pub async fn shutdown(&self) {
        let projects: Vec<String> = self
            .inner
            .workers
            .iter()
            .map(|e| e.key().clone())
            .collect();
        tracing::info!(count = projects.len(), "Shutting down agents");
        let stops = projects.iter().map(|p| async move {
            if let Err(e) = self.stop(p).await {
                tracing::error!(project = %p, "Shutdown stop failed: {}", e);
            }
        });
        futures::future::join_all(stops).await;
        self.inner.supervisor.stop_all().await;
    }

    /// Report orphaned run-locks, deleting them when `clear` is set.
    pub fn reconcile_locks(&self, projects: &[Project], clear: bool) -> Vec<OrphanedLock> {
        // Never touch locks held by our own live workers.
        let candidates: Vec<Project> = projects
            .iter()
            .filter(|p| !self.inner.workers.contains_key(&p.name))
            .cloned()
            .collect();
        lock::reconcile_locks(&candidates, clear)
    }

    /// Build a client for `project` and probe it once.
    pub async fn check_backend(
        &self,
        project: &Project,
        yolo: bool,
        model: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let settings = SessionSettings {
            project: project.name.clone(),
            working_dir: project.dir.clone(),
            sequence: 0,
            yolo,
            model,
        };
        runner::probe_backend(&self.inner, &settings).await
    }
}

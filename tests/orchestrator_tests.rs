//! End-to-end scenarios for the agent manager, driven by a scripted backend
//! and an in-memory work-item store.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use autoforge::client::{Backend, ChunkHandler, ClientFactory, CodeGenClient, SessionSettings};
use autoforge::config::Limits;
use autoforge::errors::{ClientError, OrchestratorError};
use autoforge::hub::{BroadcastHub, HubEvent};
use autoforge::orchestrator::{AgentManager, AgentPhase, AgentStatus, ManagerDeps, lock};
use autoforge::process::ProcessSupervisor;
use autoforge::prompts::{PromptKind, PromptSource};
use autoforge::store::{MemoryStore, Project};

type Effect = Arc<dyn Fn(&MemoryStore, &str) + Send + Sync>;

/// What the scripted backend does for one `send_prompt` call.
#[derive(Clone)]
enum Step {
    Run(Effect),
    RateLimited,
    Fail(&'static str),
    Hang,
    Panic,
}

fn run(effect: impl Fn(&MemoryStore, &str) + Send + Sync + 'static) -> Step {
    Step::Run(Arc::new(effect))
}

fn noop() -> Step {
    run(|_, _| {})
}

struct Script {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    ready: bool,
    /// (session sequence, prompt) per call.
    calls: Mutex<Vec<(u64, String)>>,
}

impl Script {
    fn new(steps: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            fallback,
            ready: true,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(u64, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, p)| p).collect()
    }

    fn sequences(&self) -> Vec<u64> {
        self.calls().into_iter().map(|(s, _)| s).collect()
    }
}

struct ScriptedClient {
    script: Arc<Script>,
    store: MemoryStore,
    project: String,
    sequence: u64,
}

#[async_trait]
impl CodeGenClient for ScriptedClient {
    fn backend(&self) -> Backend {
        Backend::Cli
    }

    async fn send_prompt(
        &self,
        prompt: &str,
        _working_dir: &Path,
        on_chunk: &mut ChunkHandler<'_>,
    ) -> Result<String, ClientError> {
        self.script
            .calls
            .lock()
            .unwrap()
            .push((self.sequence, prompt.to_string()));
        let step = self
            .script
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.script.fallback.clone());

        match step {
            Step::Run(effect) => {
                let _ = on_chunk(&format!("working on {}", prompt));
                effect(&self.store, &self.project);
                Ok(format!("{} done", prompt))
            }
            Step::RateLimited => Err(ClientError::RateLimited {
                detail: "429 Too Many Requests".into(),
            }),
            Step::Fail(msg) => Err(ClientError::Protocol(msg.into())),
            Step::Hang => std::future::pending().await,
            Step::Panic => panic!("scripted backend panic"),
        }
    }

    async fn is_ready(&self) -> bool {
        self.script.ready
    }

    async fn close(&self) {}
}

struct ScriptedFactory {
    script: Arc<Script>,
    store: MemoryStore,
}

impl ClientFactory for ScriptedFactory {
    fn create(&self, settings: &SessionSettings) -> Result<Arc<dyn CodeGenClient>, ClientError> {
        Ok(Arc::new(ScriptedClient {
            script: self.script.clone(),
            store: self.store.clone(),
            project: settings.project.clone(),
            sequence: settings.sequence,
        }))
    }
}

/// Prompts are just the kind name so tests can assert on the phase order.
struct KindPrompts;

impl PromptSource for KindPrompts {
    fn prompt(&self, kind: PromptKind, _project_dir: &Path) -> anyhow::Result<String> {
        Ok(kind.to_string())
    }
}

fn fast_limits() -> Limits {
    Limits {
        max_rate_limit_retries: 3,
        max_build_validation_cycles: 10,
        max_initializer_sessions: None,
        inter_session_delay: Duration::from_millis(5),
        rate_limit_backoff: Duration::from_millis(5),
        stop_grace: Duration::from_secs(2),
        readiness_timeout: Duration::from_secs(1),
    }
}

struct Harness {
    manager: AgentManager,
    hub: BroadcastHub,
    store: MemoryStore,
    script: Arc<Script>,
    project: Project,
    _dir: TempDir,
}

impl Harness {
    fn new(script: Arc<Script>, limits: Limits) -> Self {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let hub = BroadcastHub::new();
        let manager = AgentManager::new(ManagerDeps {
            hub: hub.clone(),
            store: Arc::new(store.clone()),
            prompts: Arc::new(KindPrompts),
            clients: Arc::new(ScriptedFactory {
                script: script.clone(),
                store: store.clone(),
            }),
            supervisor: ProcessSupervisor::new(Duration::from_secs(1)),
            limits,
            validation_category: "build".into(),
        });
        let project = Project::new("demo", dir.path());
        Self {
            manager,
            hub,
            store,
            script,
            project,
            _dir: dir,
        }
    }

    fn name(&self) -> &str {
        &self.project.name
    }

    fn lock_exists(&self) -> bool {
        lock::lock_path(&self.project.dir).exists()
    }

    async fn wait_for_exit(&self) -> AgentStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = self.manager.status(self.name());
            if !status.is_active() {
                return status;
            }
            assert!(Instant::now() < deadline, "agent still {status} after 10s");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_calls(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.script.calls().len() < n {
            assert!(Instant::now() < deadline, "backend never reached {n} calls");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn reason(&self) -> String {
        self.manager
            .status_report(self.name())
            .last_reason
            .unwrap_or_default()
    }
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<Arc<str>>) -> Vec<HubEvent> {
    let mut events = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        events.push(serde_json::from_str(&payload).unwrap());
    }
    events
}

// =============================================================================
// Phase progression
// =============================================================================

#[tokio::test]
async fn test_full_progression_to_complete() {
    let script = Script::new(
        vec![
            run(|s, p| s.add_items(p, 5, "functional", false)),
            run(|s, p| s.mark_all_passing(p)),
            noop(),
        ],
        Step::Fail("no more steps expected"),
    );
    let h = Harness::new(script, fast_limits());
    let mut sub = h.hub.subscribe(h.name(), 1024);

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Stopped);

    assert_eq!(
        h.script.prompts(),
        vec!["initializer", "coding", "build_validation"]
    );
    assert_eq!(h.script.sequences(), vec![1, 2, 3]);
    assert!(h.reason().contains("All features pass"));
    assert!(!h.lock_exists());

    let report = h.manager.status_report(h.name());
    assert_eq!(report.phase, Some(AgentPhase::Complete));
    assert_eq!(report.last_session, Some(3));

    let events = drain(&mut sub.rx);
    assert!(events.iter().any(|e| matches!(
        e,
        HubEvent::FeatureUpdate {
            total: 5,
            passing: 0,
            previous_total: 0,
            previous_passing: 0
        }
    )));
    assert!(events.iter().any(
        |e| matches!(e, HubEvent::Log { line, .. } if line.contains("working on coding"))
    ));
    let completed = events
        .iter()
        .filter(|e| matches!(e, HubEvent::SessionCompleted { .. }))
        .count();
    assert_eq!(completed, 3);
    match events.last().unwrap() {
        HubEvent::Status { status, message } => {
            assert_eq!(*status, AgentStatus::Stopped);
            assert!(message.contains("All features pass"));
        }
        other => panic!("last event should be the final status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_validation_failures_return_to_coding() {
    let script = Script::new(
        vec![
            run(|s, p| s.add_items(p, 2, "build", false)),
            run(|s, p| s.mark_all_passing(p)),
            noop(),
        ],
        Step::Fail("no more steps expected"),
    );
    let h = Harness::new(script, fast_limits());
    h.store.add_items(h.name(), 5, "functional", true);

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Stopped);

    assert_eq!(
        h.script.prompts(),
        vec!["build_validation", "coding", "build_validation"]
    );
    assert!(h.store.snapshot(h.name()).iter().all(|i| i.passes));
}

#[tokio::test]
async fn test_yolo_uses_yolo_coding_prompt() {
    let script = Script::new(
        vec![run(|s, p| s.mark_all_passing(p)), noop()],
        Step::Fail("no more steps expected"),
    );
    let h = Harness::new(script, fast_limits());
    h.store.add_items(h.name(), 1, "functional", false);

    h.manager.start(&h.project, true, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Stopped);
    assert_eq!(h.script.prompts(), vec!["coding_yolo", "build_validation"]);
}

#[tokio::test]
async fn test_validation_cycle_limit_stops_as_complete() {
    // Validation always finds a new failure; coding always fixes it.
    let flip_flop = run(|s, p| {
        if s.snapshot(p).iter().any(|i| !i.passes) {
            s.mark_all_passing(p);
        } else {
            s.add_items(p, 1, "build", false);
        }
    });
    let script = Script::new(vec![], flip_flop);
    let limits = Limits {
        max_build_validation_cycles: 2,
        ..fast_limits()
    };
    let h = Harness::new(script, limits);
    h.store.add_items(h.name(), 1, "functional", true);
    let mut sub = h.hub.subscribe(h.name(), 1024);

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Stopped);

    assert_eq!(
        h.script.prompts(),
        vec!["build_validation", "coding", "build_validation", "coding"]
    );
    assert!(h.reason().contains("did not converge after 2 cycles"));
    let events = drain(&mut sub.rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, HubEvent::Warning { message } if message.contains("2 cycles"))));
}

#[tokio::test]
async fn test_initializer_bound() {
    let script = Script::new(vec![], noop());
    let limits = Limits {
        max_initializer_sessions: Some(2),
        ..fast_limits()
    };
    let h = Harness::new(script, limits);

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Crashed);
    assert_eq!(h.script.prompts(), vec!["initializer", "initializer"]);
    assert!(h.reason().contains("created no work items"));
    assert!(!h.lock_exists());
}

// =============================================================================
// Rate limits and failures
// =============================================================================

#[tokio::test]
async fn test_rate_limit_exhaustion_crashes_after_bound() {
    let script = Script::new(vec![], Step::RateLimited);
    let h = Harness::new(script, fast_limits());
    let mut sub = h.hub.subscribe(h.name(), 1024);

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Crashed);

    // Three attempts of the same session, no fourth.
    assert_eq!(h.script.sequences(), vec![1, 1, 1]);
    assert!(h.reason().contains("Rate limited 3 times"));
    assert!(!h.lock_exists());

    let events = drain(&mut sub.rx);
    let warnings = events
        .iter()
        .filter(|e| matches!(e, HubEvent::Warning { .. }))
        .count();
    assert_eq!(warnings, 2);
    assert!(matches!(
        events.last(),
        Some(HubEvent::Status {
            status: AgentStatus::Crashed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_rate_limit_counter_resets_after_success() {
    let script = Script::new(
        vec![
            Step::RateLimited,
            Step::RateLimited,
            run(|s, p| s.add_items(p, 1, "functional", false)),
            Step::RateLimited,
            Step::RateLimited,
            run(|s, p| s.mark_all_passing(p)),
        ],
        noop(),
    );
    let h = Harness::new(script, fast_limits());

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Stopped);
    assert_eq!(h.script.sequences(), vec![1, 1, 1, 2, 2, 2, 3]);
    assert!(h.reason().contains("All features pass"));
}

#[tokio::test]
async fn test_backend_failure_crashes() {
    let script = Script::new(vec![], Step::Fail("invalid model"));
    let h = Harness::new(script, fast_limits());

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Crashed);
    assert!(h.reason().contains("invalid model"));
    assert_eq!(h.script.calls().len(), 1);
    assert!(!h.lock_exists());
}

#[tokio::test]
async fn test_panic_is_a_crash_with_cleanup() {
    let script = Script::new(vec![], Step::Panic);
    let h = Harness::new(script, fast_limits());
    std::fs::create_dir_all(h.project.dir.join(".autoforge/tmp")).unwrap();

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Crashed);
    assert!(h.reason().contains("scripted backend panic"));
    assert!(!h.lock_exists());
    assert!(!h.project.dir.join(".autoforge/tmp").exists());

    // The project can be started again afterwards.
    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Crashed);
}

#[tokio::test]
async fn test_unready_backend_never_runs_a_session() {
    let script = Arc::new(Script {
        steps: Mutex::new(VecDeque::new()),
        fallback: noop(),
        ready: false,
        calls: Mutex::new(Vec::new()),
    });
    let h = Harness::new(script, fast_limits());

    let err = h
        .manager
        .check_backend(&h.project, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::BackendUnavailable { .. }));

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Crashed);
    assert!(h.reason().contains("not available"));
    assert!(h.script.calls().is_empty());
}

// =============================================================================
// Lifecycle control
// =============================================================================

#[tokio::test]
async fn test_stop_during_sleep_is_prompt() {
    let script = Script::new(vec![], run(|s, p| s.add_items(p, 1, "functional", false)));
    let limits = Limits {
        inter_session_delay: Duration::from_secs(60),
        ..fast_limits()
    };
    let h = Harness::new(script, limits);

    h.manager.start(&h.project, false, None).unwrap();
    h.wait_for_calls(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    h.manager.stop(h.name()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.manager.status(h.name()), AgentStatus::Stopped);
    assert_eq!(h.script.calls().len(), 1);
    assert!(!h.lock_exists());
}

#[tokio::test]
async fn test_stop_during_rate_limit_backoff_is_prompt() {
    let script = Script::new(vec![], Step::RateLimited);
    let limits = Limits {
        rate_limit_backoff: Duration::from_secs(60),
        ..fast_limits()
    };
    let h = Harness::new(script, limits);

    h.manager.start(&h.project, false, None).unwrap();
    h.wait_for_calls(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    h.manager.stop(h.name()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.manager.status(h.name()), AgentStatus::Stopped);
    assert_eq!(h.script.calls().len(), 1);
    assert!(!h.lock_exists());
}

#[tokio::test]
async fn test_stop_cancels_in_flight_session() {
    let script = Script::new(vec![], Step::Hang);
    let h = Harness::new(script, fast_limits());
    let mut sub = h.hub.subscribe(h.name(), 1024);

    h.manager.start(&h.project, false, None).unwrap();
    h.wait_for_calls(1).await;

    let started = Instant::now();
    h.manager.stop(h.name()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.manager.status(h.name()), AgentStatus::Stopped);
    assert!(!h.lock_exists());

    // Stop is idempotent and does not repeat the final status.
    h.manager.stop(h.name()).await.unwrap();
    let stopped = drain(&mut sub.rx)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                HubEvent::Status {
                    status: AgentStatus::Stopped,
                    ..
                }
            )
        })
        .count();
    assert_eq!(stopped, 1);
}

#[tokio::test]
async fn test_stop_unknown_project_is_noop() {
    let h = Harness::new(Script::new(vec![], noop()), fast_limits());
    h.manager.stop("never-started").await.unwrap();
    assert_eq!(h.manager.status("never-started"), AgentStatus::Stopped);
}

#[tokio::test]
async fn test_second_start_is_already_running() {
    let script = Script::new(vec![], Step::Hang);
    let h = Harness::new(script, fast_limits());

    h.manager.start(&h.project, false, None).unwrap();
    let err = h.manager.start(&h.project, false, None).unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));

    // Another manager (as another process would) is refused by the run-lock.
    let other = Harness::new(Script::new(vec![], noop()), fast_limits());
    let err = other.manager.start(&h.project, false, None).unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));

    h.manager.stop(h.name()).await.unwrap();
    assert!(!h.lock_exists());
}

#[tokio::test]
async fn test_orphaned_lock_blocks_until_cleared() {
    let script = Script::new(vec![], Step::Hang);
    let h = Harness::new(script, fast_limits());
    let path = lock::lock_path(&h.project.dir);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        r#"{"pid":999999,"project":"demo","started_at":"2026-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    let err = h.manager.start(&h.project, false, None).unwrap_err();
    assert!(matches!(err, OrchestratorError::StaleLock { pid: Some(999999), .. }));
    assert!(path.exists());

    let report = h
        .manager
        .reconcile_locks(std::slice::from_ref(&h.project), true);
    assert_eq!(report.len(), 1);
    assert!(report[0].cleared);

    h.manager.start(&h.project, false, None).unwrap();
    h.manager.stop(h.name()).await.unwrap();
}

#[tokio::test]
async fn test_pause_defers_next_session() {
    let script = Script::new(vec![], run(|s, p| s.add_items(p, 1, "functional", false)));
    let limits = Limits {
        inter_session_delay: Duration::from_millis(20),
        ..fast_limits()
    };
    let h = Harness::new(script, limits);

    assert!(matches!(
        h.manager.pause(h.name()),
        Err(OrchestratorError::NotRunning { .. })
    ));

    h.manager.start(&h.project, false, None).unwrap();
    h.wait_for_calls(1).await;
    h.manager.pause(h.name()).unwrap();
    assert_eq!(h.manager.status(h.name()), AgentStatus::Paused);

    // At most the session already past the pause check may still run.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let paused_calls = h.script.calls().len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.script.calls().len(), paused_calls);
    assert!(h.lock_exists());

    h.manager.resume(h.name()).unwrap();
    assert_eq!(h.manager.status(h.name()), AgentStatus::Running);
    h.wait_for_calls(paused_calls + 1).await;

    h.manager.stop(h.name()).await.unwrap();
    assert_eq!(h.manager.status(h.name()), AgentStatus::Stopped);
}

#[tokio::test]
async fn test_stop_while_paused() {
    let script = Script::new(vec![], run(|s, p| s.add_items(p, 1, "functional", false)));
    let h = Harness::new(script, fast_limits());

    h.manager.start(&h.project, false, None).unwrap();
    h.wait_for_calls(1).await;
    h.manager.pause(h.name()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    h.manager.stop(h.name()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.manager.status(h.name()), AgentStatus::Stopped);
    assert!(!h.lock_exists());
}

#[tokio::test]
async fn test_shutdown_stops_every_project() {
    let script = Script::new(vec![], Step::Hang);
    let h = Harness::new(script.clone(), fast_limits());
    let other_dir = TempDir::new().unwrap();
    let other = Project::new("other", other_dir.path());

    h.manager.start(&h.project, false, None).unwrap();
    h.manager.start(&other, false, None).unwrap();
    h.wait_for_calls(2).await;

    h.manager.shutdown().await;
    assert_eq!(h.manager.status("demo"), AgentStatus::Stopped);
    assert_eq!(h.manager.status("other"), AgentStatus::Stopped);
    assert!(!h.lock_exists());
    assert!(!lock::lock_path(other_dir.path()).exists());
    assert_eq!(h.manager.projects(), vec!["demo", "other"]);
}

#[tokio::test]
async fn test_session_logs_written() {
    let script = Script::new(
        vec![run(|s, p| s.add_items(p, 1, "functional", true)), noop()],
        Step::Fail("no more steps expected"),
    );
    let h = Harness::new(script, fast_limits());

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Stopped);

    let logs: Vec<String> = std::fs::read_dir(h.project.dir.join(".autoforge/logs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().any(|n| n.contains("-0001-initializing-1")));
    assert!(logs.iter().any(|n| n.contains("-0002-build_validating-1")));
}

// =============================================================================
// Following events
// =============================================================================

#[tokio::test]
async fn test_follow_ends_when_final_status_was_skipped() {
    let script = Script::new(vec![], Step::Fail("invalid model"));
    let h = Harness::new(script, fast_limits());
    // Room for the initial Running status only; everything after is skipped.
    let mut sub = h.hub.subscribe(h.name(), 1);

    h.manager.start(&h.project, false, None).unwrap();
    assert_eq!(h.wait_for_exit().await, AgentStatus::Crashed);

    let mut seen = Vec::new();
    let status = tokio::time::timeout(
        Duration::from_secs(2),
        h.manager.follow(h.name(), &mut sub, |e| seen.push(e.clone())),
    )
    .await
    .expect("follow did not return after the agent ended");

    assert_eq!(status, AgentStatus::Crashed);
    assert!(matches!(
        seen.as_slice(),
        [HubEvent::Status {
            status: AgentStatus::Running,
            ..
        }]
    ));
}

#[tokio::test]
async fn test_follow_returns_on_terminal_event() {
    let script = Script::new(
        vec![
            run(|s, p| s.add_items(p, 1, "functional", true)),
            noop(),
        ],
        Step::Fail("no more steps expected"),
    );
    let h = Harness::new(script, fast_limits());
    let mut sub = h.hub.subscribe(h.name(), 1024);

    h.manager.start(&h.project, false, None).unwrap();
    let mut seen = Vec::new();
    let status = tokio::time::timeout(
        Duration::from_secs(10),
        h.manager.follow(h.name(), &mut sub, |e| seen.push(e.clone())),
    )
    .await
    .unwrap();

    assert_eq!(status, AgentStatus::Stopped);
    assert!(seen.iter().any(|e| matches!(e, HubEvent::SessionCompleted { .. })));
    assert!(matches!(
        seen.last(),
        Some(HubEvent::Status {
            status: AgentStatus::Stopped,
            ..
        })
    ));
}

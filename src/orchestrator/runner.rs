//! The per-project worker loop.
//!
//! One iteration runs at most one session: read counts, pick a phase, run
//! that phase's prompt through a fresh client, then sleep. Every suspension
//! point races the worker's cancellation token.

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::lock::RunLock;
use super::manager::{ManagerInner, RunOptions, WorkerShared};
use super::phase::{AgentPhase, compute_phase};
use super::session::{LoopExit, Session};
use crate::client::SessionSettings;
use crate::config::STATE_DIR;
use crate::errors::{ClientError, OrchestratorError};
use crate::hub::HubEvent;
use crate::store::{Project, WorkCounts};

struct WorkerContext {
    inner: Arc<ManagerInner>,
    project: Project,
    shared: Arc<WorkerShared>,
    opts: RunOptions,
}

#[derive(Debug, Default)]
struct LoopState {
    sequence: u64,
    rate_limit_retries: u32,
    validation_cycles: u32,
    initializer_sessions: u32,
    validation_clean: bool,
    previous: WorkCounts,
}

pub(crate) async fn run_worker(
    inner: Arc<ManagerInner>,
    project: Project,
    generation: u64,
    shared: Arc<WorkerShared>,
    opts: RunOptions,
    lock: RunLock,
) {
    let ctx = WorkerContext {
        inner,
        project,
        shared,
        opts,
    };

    let exit = match AssertUnwindSafe(run_loop(&ctx)).catch_unwind().await {
        Ok(exit) => exit,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(project = %ctx.project.name, "Worker panicked: {}", reason);
            LoopExit::Crashed(format!("worker panicked: {}", reason))
        }
    };

    finish(&ctx, generation, exit, lock).await;
}

async fn finish(ctx: &WorkerContext, generation: u64, exit: LoopExit, lock: RunLock) {
    if let Some(client) = ctx.shared.active_client() {
        client.close().await;
        ctx.shared.set_active_client(None);
    }
    drop(lock);
    ctx.inner.clear_transient(&ctx.project);

    let name = &ctx.project.name;
    match &exit {
        LoopExit::Crashed(_) | LoopExit::RateLimitExhausted { .. } => {
            tracing::error!(project = %name, "{}", exit.message())
        }
        _ => tracing::info!(project = %name, "{}", exit.message()),
    }
    ctx.inner.set_status(name, exit.status(), &exit.message());
    ctx.inner.remove_worker(name, generation);
}

async fn run_loop(ctx: &WorkerContext) -> LoopExit {
    let probe = ctx.settings(0);
    tokio::select! {
        _ = ctx.shared.cancel.cancelled() => return LoopExit::Stopped,
        result = probe_backend(&ctx.inner, &probe) => {
            if let Err(e) = result {
                return LoopExit::Crashed(e.to_string());
            }
        }
    }

    let mut state = LoopState::default();
    loop {
        if let Err(exit) = iterate(ctx, &mut state).await {
            return exit;
        }
    }
}

/// One pass of the loop. `Err` carries the reason the loop ends.
async fn iterate(ctx: &WorkerContext, state: &mut LoopState) -> Result<(), LoopExit> {
    let name = &ctx.project.name;
    let limits = &ctx.inner.limits;

    if ctx.shared.cancel.is_cancelled() || !wait_while_paused(ctx).await {
        return Err(LoopExit::Stopped);
    }

    let counts = ctx
        .inner
        .store
        .counts(&ctx.project)
        .await
        .map_err(|e| LoopExit::Crashed(format!("failed to read work items: {:#}", e)))?;
    let phase = compute_phase(counts, state.validation_clean);
    tracing::debug!(project = %name, total = counts.total, passing = counts.passing, %phase, "Iteration");

    ctx.inner.hub.publish(
        name,
        &HubEvent::progress(phase, counts.passing, counts.total),
    );
    if counts != state.previous {
        ctx.inner.hub.publish(
            name,
            &HubEvent::FeatureUpdate {
                total: counts.total,
                passing: counts.passing,
                previous_total: state.previous.total,
                previous_passing: state.previous.passing,
            },
        );
        state.previous = counts;
    }
    ctx.inner.update_status(name, |entry| entry.phase = Some(phase));

    match phase {
        AgentPhase::Complete => return Err(LoopExit::Completed),
        AgentPhase::BuildValidating => {
            state.validation_cycles += 1;
            if state.validation_cycles > limits.max_build_validation_cycles {
                let exit = LoopExit::ValidationCycleLimit {
                    cycles: limits.max_build_validation_cycles,
                };
                ctx.inner.hub.publish(
                    name,
                    &HubEvent::Warning {
                        message: exit.message(),
                    },
                );
                return Err(exit);
            }

            let category = ctx.inner.validation_category.as_str();
            let before = pending_in_category(ctx, category).await?;
            run_session(ctx, state, phase).await?;
            let after = pending_in_category(ctx, category).await?;
            state.validation_clean = after <= before;
            tracing::info!(
                project = %name,
                cycle = state.validation_cycles,
                before,
                after,
                clean = state.validation_clean,
                "Build validation finished"
            );
        }
        AgentPhase::Initializing => {
            state.validation_clean = false;
            state.initializer_sessions += 1;
            if let Some(max) = limits.max_initializer_sessions
                && state.initializer_sessions > max
            {
                return Err(LoopExit::Crashed(format!(
                    "{} initializer sessions created no work items",
                    max
                )));
            }
            run_session(ctx, state, phase).await?;
        }
        AgentPhase::Coding => {
            state.validation_clean = false;
            state.initializer_sessions = 0;
            run_session(ctx, state, phase).await?;
        }
    }

    if !sleep_or_cancel(&ctx.shared.cancel, limits.inter_session_delay).await {
        return Err(LoopExit::Stopped);
    }
    Ok(())
}

async fn pending_in_category(ctx: &WorkerContext, category: &str) -> Result<u64, LoopExit> {
    ctx.inner
        .store
        .count_pending_in_category(&ctx.project, category)
        .await
        .map_err(|e| LoopExit::Crashed(format!("failed to count '{}' items: {:#}", category, e)))
}

/// Run the phase's prompt until it succeeds, retrying the same sequence
/// number while the backend is rate limited.
async fn run_session(
    ctx: &WorkerContext,
    state: &mut LoopState,
    phase: AgentPhase,
) -> Result<(), LoopExit> {
    let name = &ctx.project.name;
    let limits = &ctx.inner.limits;

    state.sequence += 1;
    let sequence = state.sequence;
    let kind = phase
        .prompt_kind(ctx.opts.yolo)
        .ok_or_else(|| LoopExit::Crashed(format!("no prompt for phase {}", phase)))?;
    let prompt = ctx
        .inner
        .prompts
        .prompt(kind, &ctx.project.dir)
        .map_err(|e| LoopExit::Crashed(format!("failed to load {} prompt: {:#}", kind, e)))?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        if ctx.shared.cancel.is_cancelled() {
            return Err(LoopExit::Stopped);
        }

        let mut session = Session::new(
            name,
            &ctx.project.dir,
            sequence,
            phase,
            ctx.opts.yolo,
            ctx.opts.model.clone(),
        );
        session.attempt = attempt;
        ctx.inner
            .update_status(name, |entry| entry.last_session = Some(sequence));
        ctx.inner
            .hub
            .publish(name, &HubEvent::SessionStarted { sequence, phase });
        tracing::info!(project = %name, session = sequence, %phase, attempt, "Session started");

        let result = send_once(ctx, sequence, &prompt).await;

        let outcome = match &result {
            Ok(_) => "completed".to_string(),
            Err(e) => e.to_string(),
        };
        session.finish(outcome, result.as_ref().ok().cloned());
        let log_dir = ctx.project.dir.join(STATE_DIR).join("logs");
        if let Err(e) = session.write_log(&log_dir) {
            tracing::warn!(project = %name, "Failed to write session log: {:#}", e);
        }

        match result {
            Ok(_) => {
                state.rate_limit_retries = 0;
                ctx.inner
                    .hub
                    .publish(name, &HubEvent::SessionCompleted { sequence, phase });
                tracing::info!(
                    project = %name,
                    session = sequence,
                    secs = session.duration_secs().unwrap_or_default(),
                    "Session completed"
                );
                return Ok(());
            }
            Err(_) if ctx.shared.cancel.is_cancelled() => return Err(LoopExit::Stopped),
            Err(ClientError::Cancelled) => return Err(LoopExit::Stopped),
            Err(ClientError::RateLimited { detail }) => {
                state.rate_limit_retries += 1;
                if state.rate_limit_retries >= limits.max_rate_limit_retries {
                    return Err(LoopExit::RateLimitExhausted {
                        attempts: state.rate_limit_retries,
                        detail,
                    });
                }
                let message = format!(
                    "Rate limited ({}/{}); retrying session {} in {}s",
                    state.rate_limit_retries,
                    limits.max_rate_limit_retries,
                    sequence,
                    limits.rate_limit_backoff.as_secs_f64()
                );
                tracing::warn!(project = %name, detail = %detail, "{}", message);
                ctx.inner.hub.publish(name, &HubEvent::Warning { message });
                if !sleep_or_cancel(&ctx.shared.cancel, limits.rate_limit_backoff).await {
                    return Err(LoopExit::Stopped);
                }
            }
            Err(e) => {
                let reason = format!("session {} failed: {}", sequence, e);
                ctx.inner.hub.publish(
                    name,
                    &HubEvent::Warning {
                        message: reason.clone(),
                    },
                );
                return Err(LoopExit::Crashed(reason));
            }
        }
    }
}

/// Build a client, stream one prompt through it and close it.
async fn send_once(ctx: &WorkerContext, sequence: u64, prompt: &str) -> Result<String, ClientError> {
    let client = ctx.inner.clients.create(&ctx.settings(sequence))?;
    ctx.shared.set_active_client(Some(client.clone()));

    let hub = ctx.inner.hub.clone();
    let project = ctx.project.name.clone();
    let cancel = ctx.shared.cancel.clone();
    let mut on_chunk = move |chunk: &str| {
        if cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        hub.publish(&project, &HubEvent::log(chunk));
        ControlFlow::Continue(())
    };

    let result = tokio::select! {
        _ = ctx.shared.cancel.cancelled() => Err(ClientError::Cancelled),
        result = client.send_prompt(prompt, &ctx.project.dir, &mut on_chunk) => result,
    };

    client.close().await;
    ctx.shared.set_active_client(None);
    result
}

/// Block while paused. Returns false if the worker was cancelled meanwhile.
async fn wait_while_paused(ctx: &WorkerContext) -> bool {
    let mut paused = ctx.shared.paused.subscribe();
    let mut announced = false;
    loop {
        if ctx.shared.cancel.is_cancelled() {
            return false;
        }
        if !*paused.borrow_and_update() {
            return true;
        }
        if !announced {
            tracing::info!(project = %ctx.project.name, "Paused; waiting for resume");
            announced = true;
        }
        tokio::select! {
            _ = ctx.shared.cancel.cancelled() => return false,
            changed = paused.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Sleep unless cancelled first. Returns false when cancelled.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => !cancel.is_cancelled(),
    }
}

/// Build a client for `settings`, probe it within the readiness timeout and
/// close it again.
pub(crate) async fn probe_backend(
    inner: &ManagerInner,
    settings: &SessionSettings,
) -> Result<(), OrchestratorError> {
    let client = inner
        .clients
        .create(settings)
        .map_err(|e| OrchestratorError::BackendUnavailable {
            backend: "configured".to_string(),
            detail: e.to_string(),
        })?;
    let backend = client.backend();
    let timeout = inner.limits.readiness_timeout;
    let ready = tokio::time::timeout(timeout, client.is_ready())
        .await
        .unwrap_or(false);
    client.close().await;

    if ready {
        tracing::debug!(project = %settings.project, %backend, "Backend ready");
        Ok(())
    } else {
        Err(OrchestratorError::BackendUnavailable {
            backend: backend.to_string(),
            detail: format!("no readiness within {:?}", timeout),
        })
    }
}

impl WorkerContext {
    fn settings(&self, sequence: u64) -> SessionSettings {
        SessionSettings {
            project: self.project.name.clone(),
            working_dir: self.project.dir.clone(),
            sequence,
            yolo: self.opts.yolo,
            model: self.opts.model.clone(),
        }
    }
}

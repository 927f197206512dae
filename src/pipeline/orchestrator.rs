//! Drives runs through the fixed stage sequence.
//!
//! Each run has at most one drive loop at a time (per-run lock). The loop
//! never holds a lock on run state across `execute`: it persists the start
//! of an attempt, executes against that snapshot, then applies the result
//! as a compare-and-swap transition. `approve` and `cancel` go through the
//! same transition path, so concurrent callers cannot lose an update.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

use super::events::{EVENT_CHANNEL_CAPACITY, RunEvent, broadcast_event};
use super::executor::{ExecutorRegistry, StageContext, StageOutcome};
use super::models::{
    ActiveAttempt, ApprovalDecision, FailureKind, PipelineRun, RunId, RunStatus, StageName,
    StageResult,
};
use super::retry::{calculate_backoff, should_retry, stage_backoff};
use super::stages::StageSettings;
use super::store::{DbHandle, RunDb, RunStore};
use crate::ai::generator_from_config;
use crate::config::{BizimatchToml, OrchestratorSection, PipelineConfig, PipelineOverrides};
use crate::errors::{OrchestratorError, StageError, StoreError};

/// What the drive loop does once an attempt's result is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Verdict {
    Advance,
    Pause,
    Retry(Duration),
    Fail,
}

/// Turn an executor outcome into the history entry and the next step.
fn judge(
    config: &PipelineConfig,
    active: &ActiveAttempt,
    outcome: Result<StageOutcome, StageError>,
) -> (StageResult, Verdict) {
    match outcome {
        Ok(StageOutcome::Completed(output)) => {
            (StageResult::succeeded(active, output), Verdict::Advance)
        }
        Ok(StageOutcome::Skipped(reason)) => (StageResult::skipped(active, &reason), Verdict::Advance),
        Ok(StageOutcome::AwaitingApproval(output)) => {
            (StageResult::awaiting_approval(active, output), Verdict::Pause)
        }
        Err(err @ StageError::Precondition(_)) => (
            StageResult::failed(active, FailureKind::Precondition, &err.to_string()),
            Verdict::Fail,
        ),
        Err(err) => {
            let result = StageResult::failed(active, FailureKind::Execution, &err.to_string());
            if should_retry(&err, active.attempt, config.max_retries) {
                (result, Verdict::Retry(stage_backoff(config, active.attempt)))
            } else {
                (result, Verdict::Fail)
            }
        }
    }
}

/// The review-gate entry a decision applies to, as an attempt handle.
fn gate_attempt(run: &PipelineRun) -> Option<ActiveAttempt> {
    run.history.last().map(|gate| ActiveAttempt {
        stage: gate.stage,
        attempt: gate.attempt,
        started_at: gate.started_at,
    })
}

struct Inner {
    store: Arc<dyn RunStore>,
    registry: ExecutorRegistry,
    defaults: PipelineConfig,
    settings: OrchestratorSection,
    semaphore: Semaphore,
    drive_locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
    cancel_tokens: Mutex<HashMap<RunId, CancellationToken>>,
    /// Last known state of runs whose transitions could not be persisted.
    unpersisted: Mutex<HashMap<RunId, PipelineRun>>,
    events: broadcast::Sender<RunEvent>,
}

/// Sequences stage executors for every run. Cheap to clone.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: ExecutorRegistry,
        defaults: PipelineConfig,
        settings: OrchestratorSection,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let permits = settings.max_concurrent_runs.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                defaults,
                settings,
                semaphore: Semaphore::new(permits),
                drive_locks: Mutex::new(HashMap::new()),
                cancel_tokens: Mutex::new(HashMap::new()),
                unpersisted: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Wire the SQLite store, the AI client and the standard stages from config.
    pub fn from_config(toml: &BizimatchToml) -> anyhow::Result<Self> {
        let db = RunDb::new(&toml.server.db_path)?;
        let generator = generator_from_config(&toml.ai).context("Failed to build AI client")?;
        let registry = ExecutorRegistry::standard(generator, StageSettings::from_toml(toml));
        Ok(Self::new(
            Arc::new(DbHandle::new(db)),
            registry,
            toml.pipeline.clone(),
            toml.orchestrator.clone(),
        ))
    }

    /// Policy applied to runs created without overrides.
    pub fn defaults(&self) -> &PipelineConfig {
        &self.inner.defaults
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    // ── Entry points ─────────────────────────────────────────────────

    /// Create a run and start driving it in the background.
    pub async fn run(
        &self,
        prompt: &str,
        overrides: Option<&PipelineOverrides>,
    ) -> Result<RunId, OrchestratorError> {
        if prompt.trim().is_empty() {
            return Err(OrchestratorError::EmptyPrompt);
        }
        let config = match overrides {
            Some(overrides) => overrides.apply(&self.inner.defaults),
            None => self.inner.defaults.clone(),
        };
        let run = PipelineRun::new(prompt, config);
        let run_id = run.run_id.clone();

        self.retrying(|| self.inner.store.insert(&run))
            .await
            .map_err(|source| OrchestratorError::Persistence {
                run_id: run_id.clone(),
                source,
            })?;

        tracing::info!(run_id = %run_id, "pipeline run created");
        broadcast_event(
            &self.inner.events,
            RunEvent::RunCreated {
                run_id: run_id.clone(),
                prompt: run.original_prompt.clone(),
            },
        );
        self.spawn_drive(run);
        Ok(run_id)
    }

    /// Latest known state of a run.
    pub async fn get(&self, run_id: &str) -> Result<PipelineRun, OrchestratorError> {
        if let Some(run) = self.inner.unpersisted.lock().await.get(run_id) {
            return Ok(run.clone());
        }
        self.retrying(|| self.inner.store.load(run_id))
            .await
            .map_err(|source| OrchestratorError::Persistence {
                run_id: run_id.to_string(),
                source,
            })?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// All runs, newest first.
    pub async fn list(&self) -> Result<Vec<PipelineRun>, OrchestratorError> {
        let mut runs = self
            .retrying(|| self.inner.store.list())
            .await
            .map_err(|e| anyhow::Error::new(e).context("Failed to list runs"))?;
        let unpersisted = self.inner.unpersisted.lock().await;
        for run in runs.iter_mut() {
            if let Some(known) = unpersisted.get(&run.run_id) {
                *run = known.clone();
            }
        }
        Ok(runs)
    }

    /// Number of runs in each overall status.
    pub async fn status_counts(&self) -> Result<BTreeMap<&'static str, usize>, OrchestratorError> {
        let mut counts = BTreeMap::new();
        for run in self.list().await? {
            *counts.entry(run.overall_status.as_str()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Resolve a run parked at the review gate.
    ///
    /// Approval moves on to the next stage. Rejection re-enters the
    /// configured rollback stage while rollbacks remain, otherwise fails
    /// the run.
    pub async fn approve(
        &self,
        run_id: &str,
        decision: ApprovalDecision,
        comment: Option<&str>,
    ) -> Result<PipelineRun, OrchestratorError> {
        let run = self
            .transition(run_id, |run| {
                let gate = match gate_attempt(run) {
                    Some(gate) if run.is_awaiting_approval() => gate,
                    _ => {
                        return Err(OrchestratorError::NotAwaitingApproval {
                            run_id: run.run_id.clone(),
                            status: run.overall_status,
                        });
                    }
                };
                match decision {
                    ApprovalDecision::Approve => {
                        run.record(StageResult::succeeded(
                            &gate,
                            json!({ "decision": "approve", "comment": comment }),
                        ));
                        match gate.stage.next() {
                            Some(next) => {
                                run.enter_stage(next);
                                run.overall_status = RunStatus::Running;
                            }
                            None => run.overall_status = RunStatus::Succeeded,
                        }
                    }
                    ApprovalDecision::Reject => {
                        let message = match comment {
                            Some(comment) => format!("Review rejected: {}", comment),
                            None => "Review rejected".to_string(),
                        };
                        run.record(StageResult::failed(
                            &gate,
                            FailureKind::ApprovalRejected,
                            &message,
                        ));
                        match run.config.rollback_stage {
                            Some(target) if run.rollbacks < run.config.max_rollbacks => {
                                run.rollbacks += 1;
                                run.enter_stage(target);
                                run.overall_status = RunStatus::Running;
                            }
                            _ => run.overall_status = RunStatus::Failed,
                        }
                    }
                }
                Ok(true)
            })
            .await?;

        tracing::info!(
            run_id = %run.run_id,
            decision = ?decision,
            status = %run.overall_status,
            stage = %run.current_stage,
            "review decision applied"
        );
        if run.overall_status == RunStatus::Running {
            broadcast_event(
                &self.inner.events,
                RunEvent::RunResumed {
                    run_id: run.run_id.clone(),
                    stage: run.current_stage,
                },
            );
            self.spawn_drive(run.clone());
        } else {
            self.finish(&run).await;
        }
        Ok(run)
    }

    /// Mark a run cancelled and signal its in-flight stage to stop.
    pub async fn cancel(&self, run_id: &str) -> Result<PipelineRun, OrchestratorError> {
        let run = self
            .transition(run_id, |run| {
                if run.overall_status.is_terminal() {
                    return Err(OrchestratorError::AlreadyTerminal {
                        run_id: run.run_id.clone(),
                        status: run.overall_status,
                    });
                }
                if let Some(active) = run.active.take() {
                    run.record(StageResult::failed(
                        &active,
                        FailureKind::Cancelled,
                        "Run cancelled while stage was in flight",
                    ));
                }
                run.overall_status = RunStatus::Cancelled;
                Ok(true)
            })
            .await?;

        tracing::info!(run_id = %run.run_id, stage = %run.current_stage, "pipeline run cancelled");
        self.finish(&run).await;
        Ok(run)
    }

    /// Restart drive loops for runs left `Running` by a previous process and
    /// re-arm approval timeouts for paused runs. Returns the resumed run ids.
    pub async fn resume_incomplete(&self) -> Result<Vec<RunId>, OrchestratorError> {
        let running = self
            .retrying(|| self.inner.store.list_by_status(RunStatus::Running))
            .await
            .map_err(|e| anyhow::Error::new(e).context("Failed to list incomplete runs"))?;
        for run in &running {
            tracing::info!(
                run_id = %run.run_id,
                stage = %run.current_stage,
                interrupted = run.active.is_some(),
                "resuming pipeline run"
            );
            self.spawn_drive(run.clone());
        }

        let paused = self
            .retrying(|| self.inner.store.list_by_status(RunStatus::Paused))
            .await
            .map_err(|e| anyhow::Error::new(e).context("Failed to list paused runs"))?;
        for run in paused.iter().filter(|r| r.is_awaiting_approval()) {
            self.schedule_approval_expiry(run);
        }

        Ok(running.into_iter().map(|r| r.run_id).collect())
    }

    // ── Drive loop ───────────────────────────────────────────────────

    fn spawn_drive(&self, known: PipelineRun) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let run_id = known.run_id.clone();
            if let Err(e) = orchestrator.drive(known).await {
                tracing::error!(run_id = %run_id, error = %e, "drive loop stopped");
            }
        });
    }

    /// Execute stages of a run until it pauses, finishes, or is cancelled.
    pub async fn advance(&self, run_id: &str) -> Result<PipelineRun, OrchestratorError> {
        let known = self.get(run_id).await?;
        self.drive(known).await
    }

    /// Drive a run starting from `known`, the last state seen of it.
    ///
    /// If the store stays unreachable mid-drive and no transition recorded
    /// the failure yet, the run fails from the last state seen.
    async fn drive(&self, mut known: PipelineRun) -> Result<PipelineRun, OrchestratorError> {
        let run_id = known.run_id.clone();
        match self.drive_loop(&run_id, &mut known).await {
            Err(OrchestratorError::Persistence { run_id, source }) => {
                let recorded = self.inner.unpersisted.lock().await.contains_key(&run_id);
                if recorded {
                    Err(OrchestratorError::Persistence { run_id, source })
                } else {
                    Err(self.give_up(known, source).await)
                }
            }
            other => other,
        }
    }

    async fn drive_loop(
        &self,
        run_id: &str,
        known: &mut PipelineRun,
    ) -> Result<PipelineRun, OrchestratorError> {
        let lock = self.drive_lock(run_id).await;
        let _driving = lock.lock().await;
        let _permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .map_err(|e| anyhow::Error::new(e).context("Orchestrator is shutting down"))?;
        let token = self.cancel_token(run_id).await;

        loop {
            let run = self.get(run_id).await?;
            *known = run.clone();
            if run.overall_status.is_terminal() {
                // Cancelled before this loop registered its token and lock.
                self.release(run_id).await;
                return Ok(run);
            }
            if run.overall_status != RunStatus::Running || token.is_cancelled() {
                return Ok(run);
            }
            let stage = run.current_stage;

            // Persist the attempt before executing it so a restart knows
            // which stage was interrupted.
            let run = self
                .transition(run_id, |run| {
                    if run.overall_status != RunStatus::Running || run.current_stage != stage {
                        return Ok(false);
                    }
                    let attempt = match &run.active {
                        Some(active) if active.stage == stage => active.attempt,
                        _ => run.attempt + 1,
                    };
                    run.attempt = attempt;
                    run.active = Some(ActiveAttempt {
                        stage,
                        attempt,
                        started_at: Utc::now(),
                    });
                    Ok(true)
                })
                .await?;
            *known = run.clone();
            let Some(active) = run
                .active
                .clone()
                .filter(|_| run.overall_status == RunStatus::Running)
            else {
                continue;
            };

            tracing::info!(run_id, stage = %stage, attempt = active.attempt, "stage started");
            broadcast_event(
                &self.inner.events,
                RunEvent::StageStarted {
                    run_id: run_id.to_string(),
                    stage,
                    attempt: active.attempt,
                },
            );

            let outcome = if run.config.is_skipped(stage) {
                Ok(StageOutcome::Skipped("Skipped by configuration".to_string()))
            } else {
                match self.inner.registry.get(stage) {
                    Some(executor) => {
                        let ctx = StageContext::new(active.attempt, token.clone());
                        executor.execute(&run, &ctx).await
                    }
                    None => Err(StageError::Precondition(format!(
                        "no executor registered for stage '{}'",
                        stage
                    ))),
                }
            };
            let (result, verdict) = judge(&run.config, &active, outcome);

            let mut applied = false;
            let run = self
                .transition(run_id, |run| {
                    if run.overall_status != RunStatus::Running
                        || run.active.as_ref() != Some(&active)
                    {
                        applied = false;
                        return Ok(false);
                    }
                    run.record(result.clone());
                    match verdict {
                        Verdict::Advance => match stage.next() {
                            Some(next) => run.enter_stage(next),
                            None => run.overall_status = RunStatus::Succeeded,
                        },
                        Verdict::Pause => run.overall_status = RunStatus::Paused,
                        Verdict::Retry(_) => {}
                        Verdict::Fail => run.overall_status = RunStatus::Failed,
                    }
                    applied = true;
                    Ok(true)
                })
                .await?;
            *known = run.clone();

            if !applied {
                tracing::info!(run_id, stage = %stage, status = %run.overall_status, "run changed while stage was in flight, result discarded");
                return Ok(run);
            }
            self.announce_result(run_id, &result, verdict);

            match run.overall_status {
                RunStatus::Running => {
                    if let Verdict::Retry(delay) = verdict {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => {}
                        }
                    }
                }
                RunStatus::Paused => {
                    tracing::info!(run_id, stage = %stage, "run paused for approval");
                    broadcast_event(
                        &self.inner.events,
                        RunEvent::RunPaused {
                            run_id: run_id.to_string(),
                            stage,
                        },
                    );
                    self.schedule_approval_expiry(&run);
                    return Ok(run);
                }
                _ => {
                    self.finish(&run).await;
                    return Ok(run);
                }
            }
        }
    }

    fn announce_result(&self, run_id: &str, result: &StageResult, verdict: Verdict) {
        let event = match &result.error {
            Some(error) => {
                let will_retry = matches!(verdict, Verdict::Retry(_));
                if let Verdict::Retry(delay) = verdict {
                    tracing::warn!(
                        run_id,
                        stage = %result.stage,
                        attempt = result.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "stage attempt failed, retrying"
                    );
                } else {
                    tracing::warn!(run_id, stage = %result.stage, attempt = result.attempt, error = %error, "stage failed");
                }
                RunEvent::StageFailed {
                    run_id: run_id.to_string(),
                    stage: result.stage,
                    attempt: result.attempt,
                    error: error.clone(),
                    will_retry,
                }
            }
            None => {
                tracing::info!(run_id, stage = %result.stage, status = %result.status, "stage finished");
                RunEvent::StageFinished {
                    run_id: run_id.to_string(),
                    stage: result.stage,
                    attempt: result.attempt,
                    status: result.status,
                }
            }
        };
        broadcast_event(&self.inner.events, event);
    }

    /// Broadcast a terminal state and release the run's token and drive lock.
    async fn finish(&self, run: &PipelineRun) {
        self.release(&run.run_id).await;
        let error = match run.overall_status {
            RunStatus::Failed => run.history.last().and_then(|r| r.error.clone()),
            _ => None,
        };
        tracing::info!(run_id = %run.run_id, status = %run.overall_status, "pipeline run finished");
        broadcast_event(
            &self.inner.events,
            RunEvent::RunFinished {
                run_id: run.run_id.clone(),
                status: run.overall_status,
                error,
            },
        );
    }

    // ── Approval timeout ─────────────────────────────────────────────

    fn schedule_approval_expiry(&self, run: &PipelineRun) {
        let Some(timeout_secs) = run.config.approval_timeout_secs else {
            return;
        };
        let Some(gate) = run.history.last() else {
            return;
        };
        let waited = (Utc::now() - gate.finished_at).to_std().unwrap_or_default();
        let delay = Duration::from_secs(timeout_secs).saturating_sub(waited);
        let gate_len = run.history.len();
        let run_id = run.run_id.clone();
        let orchestrator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = orchestrator.expire_approval(&run_id, gate_len).await {
                tracing::error!(run_id = %run_id, error = %e, "failed to expire approval");
            }
        });
    }

    /// Fail a run still waiting on the same review gate entry.
    async fn expire_approval(&self, run_id: &str, gate_len: usize) -> Result<(), OrchestratorError> {
        let mut expired = false;
        let run = self
            .transition(run_id, |run| {
                expired = false;
                let gate = match gate_attempt(run) {
                    Some(gate) if run.is_awaiting_approval() && run.history.len() == gate_len => gate,
                    _ => return Ok(false),
                };
                run.record(StageResult::failed(
                    &gate,
                    FailureKind::ApprovalExpired,
                    "Approval timed out",
                ));
                run.overall_status = RunStatus::Failed;
                expired = true;
                Ok(true)
            })
            .await?;
        if expired {
            tracing::warn!(run_id, "approval timed out, run failed");
            self.finish(&run).await;
        }
        Ok(())
    }

    // ── State plumbing ───────────────────────────────────────────────

    async fn release(&self, run_id: &str) {
        if let Some(token) = self.inner.cancel_tokens.lock().await.remove(run_id) {
            token.cancel();
        }
        self.inner.drive_locks.lock().await.remove(run_id);
    }

    async fn drive_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .drive_locks
            .lock()
            .await
            .entry(run_id.to_string())
            .or_default()
            .clone()
    }

    async fn cancel_token(&self, run_id: &str) -> CancellationToken {
        self.inner
            .cancel_tokens
            .lock()
            .await
            .entry(run_id.to_string())
            .or_default()
            .clone()
    }

    /// Atomic read-modify-write of a run.
    ///
    /// `apply` returns whether it changed the run; on a version conflict the
    /// run is reloaded and `apply` runs again against the fresh state.
    async fn transition<F>(&self, run_id: &str, mut apply: F) -> Result<PipelineRun, OrchestratorError>
    where
        F: FnMut(&mut PipelineRun) -> Result<bool, OrchestratorError>,
    {
        loop {
            let mut run = self.get(run_id).await?;
            if !apply(&mut run)? {
                return Ok(run);
            }
            match self.retrying(|| self.inner.store.save(&run)).await {
                Ok(saved) => return Ok(saved),
                Err(StoreError::VersionConflict { expected, found, .. }) => {
                    tracing::debug!(run_id, expected, found, "concurrent update, re-applying transition");
                }
                Err(source) => return Err(self.give_up(run, source).await),
            }
        }
    }

    /// Run a store operation, retrying while the store reports itself unavailable.
    async fn retrying<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let base = Duration::from_millis(self.inner.settings.persistence_backoff_ms);
        let mut failures = 0;
        loop {
            match op().await {
                Err(StoreError::Unavailable(e)) if failures < self.inner.settings.persistence_retries => {
                    failures += 1;
                    let delay = calculate_backoff(failures, base, base.saturating_mul(16));
                    tracing::warn!(
                        retry = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Persisting a transition is impossible: remember the run as failed so
    /// `get` still reports it, and surface the error.
    async fn give_up(&self, mut run: PipelineRun, source: StoreError) -> OrchestratorError {
        let message = format!("Failed to persist run state: {}", source);
        tracing::error!(run_id = %run.run_id, error = %source, "giving up on persisting run");

        let attempt = run.active.take().unwrap_or_else(|| ActiveAttempt {
            stage: run.current_stage,
            attempt: run.attempt.max(1),
            started_at: Utc::now(),
        });
        run.record(StageResult::failed(&attempt, FailureKind::Persistence, &message));
        run.overall_status = RunStatus::Failed;

        let run_id = run.run_id.clone();
        self.finish(&run).await;
        self.inner.unpersisted.lock().await.insert(run_id.clone(), run);
        OrchestratorError::Persistence { run_id, source }
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PipelineConfig;

/// Identifier assigned to a run at creation.
pub type RunId = String;

/// One of the six fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    PrdGeneration,
    TaskDecomposition,
    CodeGeneration,
    Testing,
    Review,
    Deployment,
}

impl StageName {
    pub const ALL: [StageName; 6] = [
        Self::PrdGeneration,
        Self::TaskDecomposition,
        Self::CodeGeneration,
        Self::Testing,
        Self::Review,
        Self::Deployment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrdGeneration => "prd_generation",
            Self::TaskDecomposition => "task_decomposition",
            Self::CodeGeneration => "code_generation",
            Self::Testing => "testing",
            Self::Review => "review",
            Self::Deployment => "deployment",
        }
    }

    /// Position in the fixed order (0-based).
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// The stage that follows this one, or `None` for the last stage.
    pub fn next(&self) -> Option<StageName> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn first() -> StageName {
        Self::PrdGeneration
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prd_generation" => Ok(Self::PrdGeneration),
            "task_decomposition" => Ok(Self::TaskDecomposition),
            "code_generation" => Ok(Self::CodeGeneration),
            "testing" => Ok(Self::Testing),
            "review" => Ok(Self::Review),
            "deployment" => Ok(Self::Deployment),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    AwaitingApproval,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::AwaitingApproval => "awaiting_approval",
        }
    }

    /// Whether a stage with this status counts as done for overall success.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            _ => Err(format!("Invalid stage status: {}", s)),
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Category of the error recorded on a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Missing or invalid prior-stage output. Never retried.
    Precondition,
    /// Transient failure, retried with backoff.
    Execution,
    /// The review gate was rejected.
    ApprovalRejected,
    /// Nobody answered the review gate within the configured timeout.
    ApprovalExpired,
    /// The run was cancelled while the attempt was in flight.
    Cancelled,
    /// The run's state could not be written to the store.
    Persistence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// Outcome of one stage attempt. Appended to history once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub status: StageStatus,
    /// 1-based attempt number within the current entry into the stage.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn succeeded(attempt: &ActiveAttempt, output: Value) -> Self {
        Self::finish(attempt, StageStatus::Succeeded, Some(output), None, None)
    }

    pub fn skipped(attempt: &ActiveAttempt, reason: &str) -> Self {
        Self::finish(
            attempt,
            StageStatus::Skipped,
            Some(serde_json::json!({ "reason": reason })),
            None,
            None,
        )
    }

    pub fn awaiting_approval(attempt: &ActiveAttempt, output: Value) -> Self {
        Self::finish(attempt, StageStatus::AwaitingApproval, Some(output), None, None)
    }

    pub fn failed(attempt: &ActiveAttempt, kind: FailureKind, error: &str) -> Self {
        Self::finish(attempt, StageStatus::Failed, None, Some(error.to_string()), Some(kind))
    }

    fn finish(
        attempt: &ActiveAttempt,
        status: StageStatus,
        output: Option<Value>,
        error: Option<String>,
        failure: Option<FailureKind>,
    ) -> Self {
        Self {
            stage: attempt.stage,
            status,
            attempt: attempt.attempt,
            output,
            error,
            failure,
            started_at: attempt.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// The single in-flight attempt of a run, persisted before the executor is
/// invoked so a restart can tell which stage was interrupted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAttempt {
    pub stage: StageName,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub original_prompt: String,
    pub current_stage: StageName,
    pub overall_status: RunStatus,
    pub history: Vec<StageResult>,
    pub config: PipelineConfig,
    /// Attempts made on `current_stage` since the run last entered it.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveAttempt>,
    /// Number of rollbacks taken after rejected reviews.
    pub rollbacks: u32,
    /// Bumped on every persisted transition.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(prompt: &str, config: PipelineConfig) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            original_prompt: prompt.to_string(),
            current_stage: StageName::first(),
            overall_status: RunStatus::Running,
            history: Vec::new(),
            config,
            attempt: 0,
            active: None,
            rollbacks: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Most recent result recorded for `stage`, if any.
    pub fn latest_result(&self, stage: StageName) -> Option<&StageResult> {
        self.history.iter().rev().find(|r| r.stage == stage)
    }

    /// Output of the most recent successful attempt of `stage`.
    pub fn latest_output(&self, stage: StageName) -> Option<&Value> {
        self.history
            .iter()
            .rev()
            .find(|r| r.stage == stage && r.status == StageStatus::Succeeded)
            .and_then(|r| r.output.as_ref())
    }

    /// Per-stage status view: the latest result for each stage, `Running`
    /// for the in-flight attempt, `Pending` for stages not reached yet.
    pub fn stage_statuses(&self) -> BTreeMap<StageName, StageStatus> {
        StageName::ALL
            .iter()
            .map(|&stage| {
                let status = match &self.active {
                    Some(active) if active.stage == stage => StageStatus::Running,
                    _ => self
                        .latest_result(stage)
                        .map(|r| r.status)
                        .unwrap_or(StageStatus::Pending),
                };
                (stage, status)
            })
            .collect()
    }

    /// True when every stage's latest result is succeeded or skipped.
    pub fn all_stages_complete(&self) -> bool {
        StageName::ALL.iter().all(|&stage| {
            self.latest_result(stage)
                .is_some_and(|r| r.status.is_complete())
        })
    }

    /// Whether the run is parked at the review gate waiting for a decision.
    pub fn is_awaiting_approval(&self) -> bool {
        self.overall_status == RunStatus::Paused
            && self.current_stage == StageName::Review
            && self
                .history
                .last()
                .is_some_and(|r| r.stage == StageName::Review && r.status == StageStatus::AwaitingApproval)
    }

    /// Move to `stage`, resetting the attempt counter.
    pub fn enter_stage(&mut self, stage: StageName) {
        self.current_stage = stage;
        self.attempt = 0;
    }

    /// Record a finished attempt and clear the in-flight marker.
    pub fn record(&mut self, result: StageResult) {
        self.active = None;
        self.history.push(result);
    }
}

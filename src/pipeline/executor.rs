use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::models::{PipelineRun, StageName};
use crate::errors::StageError;

/// What a successful `execute` call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The stage finished; the payload becomes the StageResult output.
    Completed(Value),
    /// Nothing to do for this run (e.g. no test command configured).
    Skipped(String),
    /// The stage needs an external decision before the run can continue.
    AwaitingApproval(Value),
}

/// Per-attempt context handed to an executor alongside the run snapshot.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub attempt: u32,
    /// Fired when the run is cancelled. Executors should stop promptly.
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(attempt: u32, cancel: CancellationToken) -> Self {
        Self { attempt, cancel }
    }
}

/// Performs one named stage.
///
/// `execute` reads the run's history and config but never mutates the run;
/// the orchestrator applies the returned outcome. It may be invoked again
/// with the same history after a crash, so side effects must tolerate
/// repetition.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> StageName;

    async fn execute(
        &self,
        run: &PipelineRun,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError>;
}

/// Lookup from stage name to its executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StageName, Arc<dyn StageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` under the stage it reports, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn StageExecutor>) -> &mut Self {
        self.executors.insert(executor.stage(), executor);
        self
    }

    pub fn with(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, stage: StageName) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }

    /// Stages with no registered executor.
    pub fn missing(&self) -> Vec<StageName> {
        StageName::ALL
            .into_iter()
            .filter(|stage| !self.executors.contains_key(stage))
            .collect()
    }
}

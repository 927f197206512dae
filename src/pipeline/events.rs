use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{RunId, RunStatus, StageName, StageStatus};

/// Capacity of the run event channel. Slow subscribers skip ahead.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Run event types ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RunEvent {
    RunCreated {
        run_id: RunId,
        prompt: String,
    },
    StageStarted {
        run_id: RunId,
        stage: StageName,
        attempt: u32,
    },
    StageFinished {
        run_id: RunId,
        stage: StageName,
        attempt: u32,
        status: StageStatus,
    },
    StageFailed {
        run_id: RunId,
        stage: StageName,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    RunPaused {
        run_id: RunId,
        stage: StageName,
    },
    /// An approval or rollback sent the run back into its drive loop.
    RunResumed {
        run_id: RunId,
        stage: StageName,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageFinished { run_id, .. }
            | Self::StageFailed { run_id, .. }
            | Self::RunPaused { run_id, .. }
            | Self::RunResumed { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Broadcast an event to all subscribers. Returns silently when nobody listens.
pub fn broadcast_event(tx: &broadcast::Sender<RunEvent>, event: RunEvent) {
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failed_serialization() {
        let event = RunEvent::StageFailed {
            run_id: "r1".to_string(),
            stage: StageName::PrdGeneration,
            attempt: 2,
            error: "rate limited".to_string(),
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"StageFailed\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"stage\":\"prd_generation\""));
        assert!(json.contains("\"will_retry\":true"));
    }

    #[test]
    fn test_run_finished_omits_missing_error() {
        let event = RunEvent::RunFinished {
            run_id: "r1".to_string(),
            status: RunStatus::Succeeded,
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"succeeded\""));
        assert!(!json.contains("error"));
        assert_eq!(event.run_id(), "r1");
    }

    #[test]
    fn test_broadcast_without_receivers_is_silent() {
        let (tx, _) = broadcast::channel(4);
        broadcast_event(
            &tx,
            RunEvent::RunPaused {
                run_id: "r1".to_string(),
                stage: StageName::Review,
            },
        );

        let mut rx = tx.subscribe();
        broadcast_event(
            &tx,
            RunEvent::RunResumed {
                run_id: "r1".to_string(),
                stage: StageName::Deployment,
            },
        );
        assert_eq!(rx.try_recv().unwrap().run_id(), "r1");
    }
}

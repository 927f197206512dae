//! Pipeline engine: runs a prompt through the six fixed stages.
//!
//! ## Overview
//!
//! A run starts from a natural-language prompt and moves strictly in order
//! through PRD generation, task decomposition, code generation, testing, a
//! human review gate, and deployment. Every transition is persisted before
//! the next step so a restarted process can pick up where it left off.
//!
//! ## Module Map
//!
//! ```text
//!   run / approve / cancel
//!          │
//!          v
//!  orchestrator.rs  (PipelineOrchestrator, drive loop, retry/backoff)
//!     │        │                     │
//!     │        │ StageExecutor       │ RunEvent
//!     │        v                     v
//!     │   executor.rs ── stages.rs   events.rs  (broadcast channel)
//!     │   (trait, registry)  │
//!     │                      └─ ai::TextGenerator, tokio::process, tokio::fs
//!     v
//!  store.rs  (RunStore trait, SQLite RunDb behind DbHandle)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                            |
//! |------------|-----------------------------------------------------------|
//! | `models`   | `PipelineRun`, `StageResult`, stage and status enums      |
//! | `retry`    | Retry decision and exponential backoff                    |
//! | `events`   | `RunEvent` enum + `broadcast_event()` helper              |

pub mod events;
pub mod executor;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod stages;
pub mod store;

pub use executor::{ExecutorRegistry, StageContext, StageExecutor, StageOutcome};
pub use models::{ApprovalDecision, PipelineRun, RunId, RunStatus, StageName, StageStatus};
pub use orchestrator::PipelineOrchestrator;
pub use stages::StageSettings;
pub use store::{DbHandle, RunDb, RunStore};

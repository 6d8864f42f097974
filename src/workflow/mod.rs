//! Phased workflow definitions and the scheduling engine.
//!
//! This module provides the phase/task model, the persisted run state with
//! its phase state machine, the engine that applies review-gate verdicts,
//! and the default development pipeline.

mod engine;
mod sdlc;
mod state;
mod types;

pub use engine::{tests_pass, PhaseDecision, ReviewRequest, WorkflowEngine};
pub use sdlc::default_sdlc;
pub use state::{PhaseHistoryEntry, PhaseRun, WorkflowRun};
pub use types::{Phase, PhaseStatus, ReviewGate, WorkflowId};

//! Core domain models for the coordination engine.
//!
//! This module contains the fundamental data structures shared by every
//! other layer: versioned artifacts and their store, tasks and the
//! dependency DAG, and the review-gate verdict shape.

pub mod artifact;
pub mod dag;
pub mod review;
pub mod task;

pub use artifact::{Artifact, ArtifactId, ArtifactStatus, ArtifactStore, ArtifactType};
pub use dag::TaskDAG;
pub use review::{ReviewIssue, ReviewOutcome, Severity};
pub use task::{Lease, Task, TaskId, TaskStatus};

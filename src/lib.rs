//! Multi-agent coordination engine.
//!
//! Agents own skills and exchange messages over a [`message::MessageBus`].
//! A [`workflow::WorkflowEngine`] sequences phases of tasks with review
//! gates and bounded retries, and the [`orchestration::Orchestrator`]
//! drives it while watching agent liveness.

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod message;
pub mod orchestration;
pub mod permissions;
pub mod skill;
pub mod state;
pub mod util;
pub mod workflow;

pub use error::{Error, Result};

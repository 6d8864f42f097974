//! Persistence of run state.
//!
//! The only persisted state is the artifact version history and the
//! workflow run's phase counters, written together as one JSON snapshot.

mod snapshot;

pub use snapshot::{Snapshot, SNAPSHOT_VERSION};

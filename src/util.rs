//! Shared utility functions.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run a blocking closure on the blocking pool and flatten the join error.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Round to one decimal place, the precision used in reports.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

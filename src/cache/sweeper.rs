//! Background eviction of expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::traits::Sweep;

/// Spawn a task that sweeps `target` every `interval` for as long as the
/// runtime lives. Abort the returned handle to stop it.
pub fn spawn_sweeper<T>(target: Arc<T>, interval: Duration) -> JoinHandle<()>
where
  T: Sweep + ?Sized + 'static,
{
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
      ticker.tick().await;
      let evicted = target.sweep();
      if evicted > 0 {
        debug!(cache = target.name(), evicted, "swept expired cache entries");
      }
    }
  })
}

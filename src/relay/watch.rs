//! Watcher task for idle-saved sessions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::upstream::pool::{RelayStatus, SavedWatch, SessionPool};
use crate::wire;

/// Relay notifications for one saved session until it leaves the saved set,
/// its keepalive expires or its connection fails.
pub async fn watch_idle(pool: Arc<Mutex<SessionPool>>, watch: SavedWatch) {
    let SavedWatch {
        id,
        readiness,
        mut stop,
        wake,
        deadline,
        mut interest,
    } = watch;
    let keepalive = tokio::time::sleep_until(deadline);
    tokio::pin!(keepalive);

    loop {
        // A session taken by a request must not be touched again, so `stop`
        // is checked before readiness.
        tokio::select! {
            biased;
            _ = &mut stop => return,
            _ = &mut keepalive => {
                pool.lock().expire(id);
                return;
            }
            _ = wake.notified() => {}
            ready = wire::ready(readiness.as_ref(), interest) => {
                if let Err(e) = ready {
                    tracing::debug!(error = %e, "Idle session socket failed");
                    pool.lock().discard_saved(id, "io_error");
                    return;
                }
            }
        }
        match pool.lock().relay(id) {
            RelayStatus::Continue(next) => interest = next,
            RelayStatus::Closed | RelayStatus::Gone => return,
        }
    }
}

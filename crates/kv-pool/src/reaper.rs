//! Idle connection reaper.
//!
//! A background task that wakes every `idle_check_interval`, evicts free
//! connections that have not performed I/O for `max_idle_time`, and
//! disconnects them outside the pool lock. Checked-out connections are never
//! inspected.

use std::sync::Weak;
use std::time::Duration;

use kv_connection::{Connection, ConnectionFactory};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::lifecycle::is_idle_expired;
use crate::pool::{PoolInner, count, disconnect_quietly};

/// Spawn the reaper for `pool`.
///
/// The task holds only a weak reference and stops once the pool state is
/// gone; the owning [`Pool`](crate::Pool) aborts it on close and on drop.
pub(crate) fn spawn<F: ConnectionFactory>(
    runtime: &Handle,
    pool: Weak<PoolInner<F>>,
    max_idle_time: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            pool.reap_idle(max_idle_time).await;
        }

        tracing::trace!("idle reaper stopped");
    })
}

impl<F: ConnectionFactory> PoolInner<F> {
    /// Evict free connections idle for at least `max_idle_time`.
    ///
    /// Returns the number of connections evicted.
    pub(crate) async fn reap_idle(&self, max_idle_time: Duration) -> usize {
        let now = Instant::now();

        let expired = {
            let mut state = self.state.lock();
            if !state
                .free
                .iter()
                .any(|conn| is_idle_expired(conn.last_active_at(), now, max_idle_time))
            {
                return 0;
            }
            let (expired, kept): (Vec<_>, Vec<_>) = state
                .free
                .drain(..)
                .partition(|conn| is_idle_expired(conn.last_active_at(), now, max_idle_time));
            state.free = kept;
            state.created = state.created.saturating_sub(count(expired.len()));
            expired
        };

        for conn in &expired {
            disconnect_quietly(conn.as_ref()).await;
        }

        tracing::debug!(
            evicted = expired.len(),
            ?max_idle_time,
            "evicted idle connections"
        );
        expired.len()
    }
}

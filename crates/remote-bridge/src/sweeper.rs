use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::guard::InFlightGuard;
use crate::pending::PendingRequestTable;
use crate::registry::ConnectionRegistry;

/// Periodically times out expired pending requests and forgets in-flight
/// bookkeeping of tenants that are gone.
pub fn spawn_sweeper(
    pending: Arc<PendingRequestTable>,
    guard: Arc<InFlightGuard>,
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            pending.sweep();
            let pruned = guard.prune_idle(|tenant| registry.get(tenant).is_some());
            if pruned > 0 {
                debug!(target: "remote-bridge", pruned, "released idle tenant slots");
            }
        }
        debug!(target: "remote-bridge", "sweeper stopped");
    })
}

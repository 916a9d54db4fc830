use std::sync::Arc;

use dashmap::DashMap;
use soulbridge_core_types::TenantId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::errors::{BridgeError, BridgeResult};

/// Per-tenant bound on concurrently in-flight commands.
///
/// Semaphores are keyed by tenant, not by connection, so the bound holds
/// across reconnects. A permit is owned by the pending entry it was taken for,
/// so a caller that stops waiting does not free the slot early.
pub struct InFlightGuard {
    limit: u32,
    semaphores: DashMap<TenantId, Arc<Semaphore>>,
}

impl InFlightGuard {
    /// `limit == 0` disables the bound.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            semaphores: DashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Takes one slot for `tenant` without waiting. `None` means unbounded.
    pub fn acquire(&self, tenant: &TenantId) -> BridgeResult<Option<OwnedSemaphorePermit>> {
        if self.limit == 0 {
            return Ok(None);
        }
        // acquire under the shard lock so prune_idle never drops a semaphore
        // between lookup and acquisition
        let entry = self
            .semaphores
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limit as usize)));
        let acquired = Arc::clone(entry.value()).try_acquire_owned();
        drop(entry);

        match acquired {
            Ok(permit) => Ok(Some(permit)),
            Err(TryAcquireError::NoPermits) => Err(BridgeError::TooManyInFlight(self.limit)),
            Err(TryAcquireError::Closed) => {
                Err(BridgeError::Internal("in-flight semaphore closed".into()))
            }
        }
    }

    /// Drops semaphores of tenants with no command in flight for which `keep`
    /// returns false.
    pub fn prune_idle<F>(&self, keep: F) -> usize
    where
        F: Fn(&TenantId) -> bool,
    {
        let full = self.limit as usize;
        let before = self.semaphores.len();
        self.semaphores
            .retain(|tenant, semaphore| semaphore.available_permits() < full || keep(tenant));
        before.saturating_sub(self.semaphores.len())
    }

    pub fn tracked_tenants(&self) -> usize {
        self.semaphores.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    #[test]
    fn limit_is_enforced_per_tenant() {
        let guard = InFlightGuard::new(2);
        let t1 = tenant("t1");

        let first = guard.acquire(&t1).unwrap();
        let _second = guard.acquire(&t1).unwrap();
        assert_eq!(guard.acquire(&t1).unwrap_err(), BridgeError::TooManyInFlight(2));
        assert!(guard.acquire(&tenant("t2")).unwrap().is_some());

        drop(first);
        assert!(guard.acquire(&t1).unwrap().is_some());
    }

    #[test]
    fn zero_limit_is_unbounded() {
        let guard = InFlightGuard::new(0);
        for _ in 0..1_000 {
            assert!(guard.acquire(&tenant("t1")).unwrap().is_none());
        }
        assert_eq!(guard.tracked_tenants(), 0);
    }

    #[test]
    fn prune_keeps_busy_and_connected_tenants() {
        let guard = InFlightGuard::new(1);
        let busy = guard.acquire(&tenant("busy")).unwrap();
        drop(guard.acquire(&tenant("idle")).unwrap());
        drop(guard.acquire(&tenant("connected")).unwrap());

        let removed = guard.prune_idle(|t| t.as_str() == "connected");
        assert_eq!(removed, 1);
        assert_eq!(guard.tracked_tenants(), 2);
        drop(busy);
    }
}

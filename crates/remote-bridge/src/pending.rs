//! Table of commands awaiting a reply.
//!
//! Every terminal transition (reply, failure, timeout, connection loss) is a
//! removal from the underlying map. Removal is atomic, so when a reply and a
//! timeout race exactly one of them takes the entry and the other observes a
//! no-op.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use soulbridge_core_types::{Generation, RequestId, TenantId};
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tracing::debug;

use crate::errors::{BridgeError, BridgeResult};
use crate::metrics;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Resolved,
    Failed,
    TimedOut,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Resolved => "resolved",
            RequestStatus::Failed => "failed",
            RequestStatus::TimedOut => "timed_out",
        }
    }

    pub fn of(result: &BridgeResult<Value>) -> Self {
        match result {
            Ok(_) => RequestStatus::Resolved,
            Err(BridgeError::Timeout(_)) => RequestStatus::TimedOut,
            Err(_) => RequestStatus::Failed,
        }
    }
}

/// Receiving half handed to the caller that issued the command.
pub type Waiter = oneshot::Receiver<BridgeResult<Value>>;

struct PendingEntry {
    tenant: TenantId,
    generation: Generation,
    command: String,
    created_at: Instant,
    timeout: Duration,
    deadline: Instant,
    responder: oneshot::Sender<BridgeResult<Value>>,
    /// In-flight slot of the tenant, held until the entry leaves the table.
    permit: Option<OwnedSemaphorePermit>,
}

impl PendingEntry {
    fn complete(self, request_id: &RequestId, result: BridgeResult<Value>) {
        let status = RequestStatus::of(&result);
        metrics::record_command(status.as_str(), self.created_at.elapsed().as_secs_f64());
        // the slot is free before the caller can observe the outcome
        drop(self.permit);
        if self.responder.send(result).is_err() {
            debug!(
                target: "remote-bridge",
                request_id = %request_id,
                tenant = %self.tenant,
                "caller stopped waiting before completion"
            );
        }
    }
}

#[derive(Clone, Debug)]
pub struct PendingSnapshot {
    pub request_id: RequestId,
    pub tenant: TenantId,
    pub generation: Generation,
    pub command: String,
    pub age: Duration,
    pub status: RequestStatus,
}

#[derive(Default)]
pub struct PendingRequestTable {
    entries: DashMap<RequestId, PendingEntry>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        tenant: &TenantId,
        generation: Generation,
        command: &str,
        timeout: Duration,
    ) -> (RequestId, Waiter) {
        self.create_guarded(tenant, generation, command, timeout, None)
    }

    /// Like [`create`](Self::create), but the entry owns `permit` and releases
    /// it only at its terminal transition, whether or not the caller is still
    /// waiting.
    pub fn create_guarded(
        &self,
        tenant: &TenantId,
        generation: Generation,
        command: &str,
        timeout: Duration,
        permit: Option<OwnedSemaphorePermit>,
    ) -> (RequestId, Waiter) {
        let (responder, waiter) = oneshot::channel();
        let now = Instant::now();
        let entry = PendingEntry {
            tenant: tenant.clone(),
            generation,
            command: command.to_string(),
            created_at: now,
            timeout,
            deadline: now + timeout,
            responder,
            permit,
        };

        // ids are reserved under the shard lock, so an id is never handed out twice
        let request_id = loop {
            let candidate = RequestId::new();
            match self.entries.entry(candidate.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                    break candidate;
                }
            }
        };
        metrics::set_pending_requests(self.entries.len());
        (request_id, waiter)
    }

    /// Delivers a successful result. Returns false when the request already
    /// left the pending state or never existed.
    pub fn resolve(&self, request_id: &RequestId, data: Value) -> bool {
        self.finish(request_id, |_| true, Ok(data))
    }

    pub fn fail(&self, request_id: &RequestId, error: BridgeError) -> bool {
        self.finish(request_id, |_| true, Err(error))
    }

    /// Completes a request only if it belongs to the given tenant connection.
    /// Replies arriving on one tenant's channel can never settle another
    /// tenant's request, nor one issued on a different generation.
    pub fn complete_for(
        &self,
        tenant: &TenantId,
        generation: Generation,
        request_id: &RequestId,
        result: BridgeResult<Value>,
    ) -> bool {
        self.finish(
            request_id,
            |entry| &entry.tenant == tenant && entry.generation == generation,
            result,
        )
    }

    /// Moves a request to `timed_out` regardless of its deadline.
    pub fn expire(&self, request_id: &RequestId) -> bool {
        let Some((id, entry)) = self.entries.remove(request_id) else {
            return false;
        };
        let timeout_ms = entry.timeout.as_millis() as u64;
        metrics::set_pending_requests(self.entries.len());
        entry.complete(&id, Err(BridgeError::Timeout(timeout_ms)));
        true
    }

    /// Fails every request past its deadline with `TIMEOUT`.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = 0;
        for request_id in expired {
            if let Some((id, entry)) = self
                .entries
                .remove_if(&request_id, |_, entry| entry.deadline <= now)
            {
                let timeout_ms = entry.timeout.as_millis() as u64;
                entry.complete(&id, Err(BridgeError::Timeout(timeout_ms)));
                swept += 1;
            }
        }
        if swept > 0 {
            metrics::set_pending_requests(self.entries.len());
            debug!(target: "remote-bridge", swept, "expired pending requests");
        }
        swept
    }

    /// Fails every request issued on one tenant connection generation.
    pub fn fail_generation(
        &self,
        tenant: &TenantId,
        generation: Generation,
        error: BridgeError,
    ) -> usize {
        let doomed: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|entry| {
                let entry = entry.value();
                &entry.tenant == tenant && entry.generation == generation
            })
            .map(|entry| entry.key().clone())
            .collect();

        doomed
            .into_iter()
            .filter(|request_id| {
                self.finish(
                    request_id,
                    |entry| &entry.tenant == tenant && entry.generation == generation,
                    Err(error.clone()),
                )
            })
            .count()
    }

    pub fn in_flight(&self, tenant: &TenantId) -> usize {
        self.entries
            .iter()
            .filter(|entry| &entry.value().tenant == tenant)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self, request_id: &RequestId) -> Option<PendingSnapshot> {
        self.entries.get(request_id).map(|entry| PendingSnapshot {
            request_id: entry.key().clone(),
            tenant: entry.tenant.clone(),
            generation: entry.generation,
            command: entry.command.clone(),
            age: entry.created_at.elapsed(),
            status: RequestStatus::Pending,
        })
    }

    fn finish<F>(&self, request_id: &RequestId, owns: F, result: BridgeResult<Value>) -> bool
    where
        F: Fn(&PendingEntry) -> bool,
    {
        let Some((id, entry)) = self.entries.remove_if(request_id, |_, entry| owns(entry)) else {
            return false;
        };
        metrics::set_pending_requests(self.entries.len());
        entry.complete(&id, result);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn resolve_delivers_once() {
        let table = PendingRequestTable::new();
        let (id, waiter) =
            table.create(&tenant("t1"), Generation(1), "ping", Duration::from_secs(5));

        assert!(table.resolve(&id, json!({"pong": true})));
        assert!(!table.resolve(&id, json!({"pong": false})));
        assert!(!table.fail(&id, BridgeError::ConnectionLost));
        assert_eq!(waiter.await.unwrap(), Ok(json!({"pong": true})));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn sweep_times_out_only_expired() {
        let table = PendingRequestTable::new();
        let t = tenant("t1");
        let (short, short_waiter) =
            table.create(&t, Generation(1), "slow", Duration::from_millis(10));
        let (long, _long_waiter) =
            table.create(&t, Generation(1), "slow", Duration::from_secs(60));

        let swept = table.sweep_at(Instant::now() + Duration::from_millis(20));
        assert_eq!(swept, 1);
        assert_eq!(short_waiter.await.unwrap(), Err(BridgeError::Timeout(10)));
        assert!(table.snapshot(&short).is_none());
        assert_eq!(table.snapshot(&long).unwrap().status, RequestStatus::Pending);
        assert!(!table.resolve(&short, json!(null)));
    }

    #[tokio::test]
    async fn scoped_completion_rejects_foreign_tenant_and_generation() {
        let table = PendingRequestTable::new();
        let (id, waiter) =
            table.create(&tenant("alice"), Generation(3), "read", Duration::from_secs(5));

        assert!(!table.complete_for(&tenant("mallory"), Generation(3), &id, Ok(json!(1))));
        assert!(!table.complete_for(&tenant("alice"), Generation(4), &id, Ok(json!(2))));
        assert!(table.complete_for(&tenant("alice"), Generation(3), &id, Ok(json!(3))));
        assert_eq!(waiter.await.unwrap(), Ok(json!(3)));
    }

    #[tokio::test]
    async fn fail_generation_leaves_other_generations() {
        let table = PendingRequestTable::new();
        let t = tenant("t1");
        let (_a, wa) = table.create(&t, Generation(1), "a", Duration::from_secs(5));
        let (_b, wb) = table.create(&t, Generation(1), "b", Duration::from_secs(5));
        let (c, _wc) = table.create(&t, Generation(2), "c", Duration::from_secs(5));
        let (_d, _wd) = table.create(&tenant("t2"), Generation(1), "d", Duration::from_secs(5));

        let failed = table.fail_generation(&t, Generation(1), BridgeError::ConnectionSuperseded);
        assert_eq!(failed, 2);
        assert_eq!(wa.await.unwrap(), Err(BridgeError::ConnectionSuperseded));
        assert_eq!(wb.await.unwrap(), Err(BridgeError::ConnectionSuperseded));
        assert!(table.snapshot(&c).is_some());
        assert_eq!(table.in_flight(&t), 1);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn racing_resolve_and_expire_have_one_winner() {
        for _ in 0..200 {
            let table = Arc::new(PendingRequestTable::new());
            let (id, waiter) =
                table.create(&tenant("t1"), Generation(1), "race", Duration::from_secs(5));

            let resolver = {
                let table = Arc::clone(&table);
                let id = id.clone();
                tokio::spawn(async move { table.resolve(&id, json!("reply")) })
            };
            let expirer = {
                let table = Arc::clone(&table);
                let id = id.clone();
                tokio::spawn(async move { table.expire(&id) })
            };

            let resolved = resolver.await.unwrap();
            let expired = expirer.await.unwrap();
            assert!(resolved ^ expired, "exactly one terminal transition must win");

            let outcome = waiter.await.unwrap();
            if resolved {
                assert_eq!(outcome, Ok(json!("reply")));
            } else {
                assert_eq!(outcome, Err(BridgeError::Timeout(5_000)));
            }
        }
    }

    #[test]
    fn dropped_waiter_does_not_panic() {
        let table = PendingRequestTable::new();
        let (id, waiter) = table.create(&tenant("t1"), Generation(1), "x", Duration::from_secs(1));
        drop(waiter);
        assert!(table.fail(&id, BridgeError::ConnectionLost));
    }

    #[tokio::test]
    async fn permit_outlives_an_abandoned_waiter() {
        let table = PendingRequestTable::new();
        let slots = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&slots).try_acquire_owned().unwrap();
        let (id, waiter) = table.create_guarded(
            &tenant("t1"),
            Generation(1),
            "long",
            Duration::from_secs(60),
            Some(permit),
        );

        drop(waiter);
        assert_eq!(slots.available_permits(), 0);

        assert!(table.expire(&id));
        assert_eq!(slots.available_permits(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_hand_out_distinct_ids() {
        let table = Arc::new(PendingRequestTable::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            tasks.push(tokio::spawn(async move {
                (0..250)
                    .map(|_| {
                        let (id, _waiter) = table.create(
                            &tenant("t1"),
                            Generation(1),
                            "bulk",
                            Duration::from_secs(5),
                        );
                        id
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let mut ids = HashSet::new();
        for task in tasks {
            ids.extend(task.await.unwrap());
        }
        assert_eq!(ids.len(), 2_000);
        assert_eq!(table.len(), 2_000);
    }
}

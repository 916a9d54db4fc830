use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use soulbridge_core_types::{Generation, TenantId};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::{BridgeError, TransportError};
use crate::events::{emit, BridgeEvent, BridgeEventBus};
use crate::metrics;
use crate::pending::PendingRequestTable;
use crate::transport::{CloseCause, FrameSink};

const STATE_LIVE: u8 = 0;
const STATE_SUPERSEDED: u8 = 1;
const STATE_LOST: u8 = 2;

/// Terminal state of a connection generation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    Superseded,
    Lost,
}

impl From<CloseReason> for BridgeError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Superseded => BridgeError::ConnectionSuperseded,
            CloseReason::Lost => BridgeError::ConnectionLost,
        }
    }
}

/// Routing view of one tenant connection generation.
pub struct ConnectionHandle {
    tenant: TenantId,
    generation: Generation,
    opened_at: Instant,
    opened_at_utc: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    state: AtomicU8,
    forced: Mutex<Option<CloseCause>>,
    closed: CancellationToken,
    sink: Arc<dyn FrameSink>,
}

impl ConnectionHandle {
    fn new(tenant: TenantId, generation: Generation, sink: Arc<dyn FrameSink>) -> Self {
        let now = Instant::now();
        Self {
            tenant,
            generation,
            opened_at: now,
            opened_at_utc: Utc::now(),
            last_activity: Mutex::new(now),
            state: AtomicU8::new(STATE_LIVE),
            forced: Mutex::new(None),
            closed: CancellationToken::new(),
            sink,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn opened_at_utc(&self) -> DateTime<Utc> {
        self.opened_at_utc
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_LIVE
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.state.load(Ordering::SeqCst) {
            STATE_SUPERSEDED => Some(CloseReason::Superseded),
            STATE_LOST => Some(CloseReason::Lost),
            _ => None,
        }
    }

    /// Moves the handle out of the live state. Only the first caller wins.
    pub(crate) fn mark_closed(&self, reason: CloseReason) -> bool {
        let next = match reason {
            CloseReason::Superseded => STATE_SUPERSEDED,
            CloseReason::Lost => STATE_LOST,
        };
        self.state
            .compare_exchange(STATE_LIVE, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Asks the connection's read loop to stop with the given cause.
    pub fn force_close(&self, cause: CloseCause) {
        {
            let mut forced = self.forced.lock();
            if forced.is_none() {
                *forced = Some(cause);
            }
        }
        self.closed.cancel();
    }

    pub fn forced_cause(&self) -> Option<CloseCause> {
        self.forced.lock().clone()
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        self.sink.send_text(text).await
    }

    /// Queues a housekeeping frame without waiting on the transport.
    pub fn post(&self, text: String) -> Result<(), TransportError> {
        self.sink.post_text(text)
    }

    pub async fn ping(&self) -> Result<(), TransportError> {
        self.sink.send_ping().await
    }

    pub(crate) fn sink(&self) -> &Arc<dyn FrameSink> {
        &self.sink
    }
}

/// Tenant id to live connection map. At most one live generation per tenant.
pub struct ConnectionRegistry {
    connections: DashMap<TenantId, Arc<ConnectionHandle>>,
    pending: Arc<PendingRequestTable>,
    events: BridgeEventBus,
}

impl ConnectionRegistry {
    pub fn new(pending: Arc<PendingRequestTable>, events: BridgeEventBus) -> Self {
        Self {
            connections: DashMap::new(),
            pending,
            events,
        }
    }

    /// Installs a new connection generation for `tenant`.
    ///
    /// A previous live connection is superseded: its pending requests fail with
    /// `CONNECTION_SUPERSEDED` and it is told to close.
    pub fn register(&self, tenant: &TenantId, sink: Arc<dyn FrameSink>) -> Arc<ConnectionHandle> {
        // the generation is drawn under the shard lock so insertion order and
        // generation order agree for concurrent registrations of one tenant
        let (handle, previous) = match self.connections.entry(tenant.clone()) {
            Entry::Occupied(mut entry) => {
                let handle = Arc::new(ConnectionHandle::new(
                    tenant.clone(),
                    Generation::next(),
                    sink,
                ));
                let previous = entry.insert(Arc::clone(&handle));
                (handle, Some(previous))
            }
            Entry::Vacant(entry) => {
                let handle = Arc::new(ConnectionHandle::new(
                    tenant.clone(),
                    Generation::next(),
                    sink,
                ));
                entry.insert(Arc::clone(&handle));
                (handle, None)
            }
        };

        if let Some(previous) = previous {
            self.supersede(&previous, handle.generation());
        }
        metrics::set_live_connections(self.connections.len());
        handle
    }

    fn supersede(&self, previous: &ConnectionHandle, successor: Generation) {
        if previous.mark_closed(CloseReason::Superseded) {
            let failed = self.pending.fail_generation(
                previous.tenant(),
                previous.generation(),
                BridgeError::ConnectionSuperseded,
            );
            metrics::record_supersession();
            info!(
                target: "remote-bridge",
                tenant = %previous.tenant(),
                generation = previous.generation().0,
                successor = successor.0,
                failed,
                "connection superseded"
            );
            emit(
                &self.events,
                BridgeEvent::ConnectionSuperseded {
                    tenant: previous.tenant().clone(),
                    generation: previous.generation(),
                    failed_requests: failed,
                },
            );
        }
        previous.force_close(CloseCause::Superseded);
    }

    /// Removes the tenant's connection only if it is still `generation`.
    /// A late unregister from a superseded connection is a no-op.
    pub fn unregister(&self, tenant: &TenantId, generation: Generation) -> bool {
        let removed = self
            .connections
            .remove_if(tenant, |_, handle| handle.generation() == generation)
            .is_some();
        if removed {
            metrics::set_live_connections(self.connections.len());
        }
        removed
    }

    pub fn get(&self, tenant: &TenantId) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(tenant)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_live(&self, tenant: &TenantId) -> bool {
        self.connections
            .get(tenant)
            .map(|entry| entry.value().is_live())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Forces every live connection closed, used on shutdown.
    pub fn close_all(&self, cause: CloseCause) {
        for entry in self.connections.iter() {
            entry.value().force_close(cause.clone());
        }
    }
}

//! Connection lifecycle: `Disconnected -> Connecting -> Live -> Disconnected`.
//!
//! The bridge never dials out. It only reacts to connect and disconnect
//! events reported by the transport layer.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use soulbridge_core_types::TenantId;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::errors::BridgeError;
use crate::events::{emit, BridgeEvent, BridgeEventBus};
use crate::pending::PendingRequestTable;
use crate::registry::{CloseReason, ConnectionHandle, ConnectionRegistry};
use crate::transport::{CloseCause, FrameSink};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    Disconnected,
    Connecting,
    Live,
}

pub struct ConnectionLifecycle {
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingRequestTable>,
    events: BridgeEventBus,
    connecting: Arc<DashMap<TenantId, usize>>,
    heartbeat_interval: Option<Duration>,
    idle_timeout: Duration,
}

/// Marks a tenant as `Connecting` until dropped.
pub struct ConnectingGuard {
    tenant: TenantId,
    connecting: Arc<DashMap<TenantId, usize>>,
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        self.connecting.remove_if_mut(&self.tenant, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

impl ConnectionLifecycle {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pending: Arc<PendingRequestTable>,
        events: BridgeEventBus,
        heartbeat_interval: Option<Duration>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pending,
            events,
            connecting: Arc::new(DashMap::new()),
            heartbeat_interval,
            idle_timeout,
        }
    }

    /// Records a handshake in progress for `tenant`.
    pub fn begin_connect(&self, tenant: &TenantId) -> ConnectingGuard {
        *self.connecting.entry(tenant.clone()).or_insert(0) += 1;
        ConnectingGuard {
            tenant: tenant.clone(),
            connecting: Arc::clone(&self.connecting),
        }
    }

    /// `* -> Live`. Supersedes any previous connection of the tenant.
    pub fn connect(&self, tenant: &TenantId, sink: Arc<dyn FrameSink>) -> Arc<ConnectionHandle> {
        let handle = self.registry.register(tenant, sink);
        info!(
            target: "remote-bridge",
            tenant = %tenant,
            generation = handle.generation().0,
            "tenant connection live"
        );
        emit(
            &self.events,
            BridgeEvent::ConnectionOpened {
                tenant: tenant.clone(),
                generation: handle.generation(),
            },
        );
        handle
    }

    /// `Live -> Disconnected`. Fails the generation's pending requests with
    /// `CONNECTION_LOST` unless the connection was already superseded, then
    /// unregisters it. Returns how many requests were failed.
    pub fn disconnect(&self, handle: &ConnectionHandle, cause: &CloseCause) -> usize {
        let failed = if handle.mark_closed(CloseReason::Lost) {
            self.pending.fail_generation(
                handle.tenant(),
                handle.generation(),
                BridgeError::ConnectionLost,
            )
        } else {
            0
        };
        // wake anything still selecting on this generation
        handle.force_close(cause.clone());
        let removed = self.registry.unregister(handle.tenant(), handle.generation());

        info!(
            target: "remote-bridge",
            tenant = %handle.tenant(),
            generation = handle.generation().0,
            cause = %cause,
            failed,
            removed,
            "tenant connection closed"
        );
        emit(
            &self.events,
            BridgeEvent::ConnectionClosed {
                tenant: handle.tenant().clone(),
                generation: handle.generation(),
                reason: cause.reason().to_string(),
                failed_requests: failed,
            },
        );
        failed
    }

    pub fn state(&self, tenant: &TenantId) -> TenantState {
        if self.registry.is_live(tenant) {
            TenantState::Live
        } else if self.connecting.contains_key(tenant) {
            TenantState::Connecting
        } else {
            TenantState::Disconnected
        }
    }

    /// Pings the connection periodically and force-closes it once it has been
    /// silent for longer than the idle timeout.
    pub fn spawn_heartbeat(&self, handle: Arc<ConnectionHandle>) -> Option<JoinHandle<()>> {
        let period = self.heartbeat_interval?;
        let idle_timeout = self.idle_timeout;

        Some(tokio::spawn(async move {
            let closed = handle.closed_token();
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if handle.idle_for() > idle_timeout {
                    warn!(
                        target: "remote-bridge",
                        tenant = %handle.tenant(),
                        generation = handle.generation().0,
                        idle_ms = handle.idle_for().as_millis() as u64,
                        "connection idle; closing"
                    );
                    handle.force_close(CloseCause::IdleTimeout);
                    break;
                }

                // a stalled ping must not keep the idle check from running
                match timeout(period, handle.ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(target: "remote-bridge", ?err, "heartbeat ping failed");
                        handle.force_close(CloseCause::Transport(err.to_string()));
                        break;
                    }
                    Err(_) => {
                        debug!(
                            target: "remote-bridge",
                            tenant = %handle.tenant(),
                            "heartbeat ping stalled"
                        );
                    }
                }
            }
        }))
    }
}

//! Observer events published by the bridge.

use serde::Serialize;
use soulbridge_core_types::{Generation, RequestId, TenantId};
use tokio::sync::broadcast;

use crate::pending::RequestStatus;

pub type BridgeEventBus = broadcast::Sender<BridgeEvent>;

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    ConnectionOpened {
        tenant: TenantId,
        generation: Generation,
    },
    ConnectionSuperseded {
        tenant: TenantId,
        generation: Generation,
        failed_requests: usize,
    },
    ConnectionClosed {
        tenant: TenantId,
        generation: Generation,
        reason: String,
        failed_requests: usize,
    },
    CommandCompleted {
        tenant: TenantId,
        request_id: Option<RequestId>,
        command: String,
        status: RequestStatus,
    },
}

pub fn event_bus(capacity: usize) -> BridgeEventBus {
    let (tx, _) = broadcast::channel(capacity.max(1));
    tx
}

/// Publishes without caring whether anyone listens.
pub(crate) fn emit(bus: &BridgeEventBus, event: BridgeEvent) {
    let _ = bus.send(event);
}

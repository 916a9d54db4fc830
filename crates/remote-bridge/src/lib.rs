//! Multi-tenant bridge that forwards commands to browser-side executors over
//! long-lived WebSocket connections and correlates their replies.

pub mod bootstrap;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod guard;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod pending;
pub mod registry;
pub mod router;
pub mod sweeper;
pub mod trace;
pub mod transport;
mod ws;

pub use bootstrap::RemoteBridge;
pub use config::BridgeConfig;
pub use dispatcher::{CommandDispatcher, CommandReply, RemoteExecutor};
pub use errors::{BridgeError, BridgeResult, TransportError};
pub use events::BridgeEvent;
pub use lifecycle::TenantState;
pub use pending::{PendingRequestTable, RequestStatus};
pub use registry::{CloseReason, ConnectionHandle, ConnectionRegistry};
pub use soulbridge_core_types::{Generation, RequestId, TenantId};
pub use model::InboundFrame;
pub use transport::{CloseCause, FrameSink, MemorySink, OutboundFrame};

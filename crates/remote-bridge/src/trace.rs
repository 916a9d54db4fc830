use soulbridge_core_types::TenantId;
use tracing::{field, span, Level, Span};

#[derive(Clone, Default)]
pub struct BridgeTracer;

impl BridgeTracer {
    /// Span covering one `execute` call; `request_id` is recorded once allocated.
    pub fn execute_span(&self, tenant: &TenantId, command: &str) -> Span {
        span!(
            Level::INFO,
            "bridge.execute",
            tenant = %tenant,
            command = command,
            request_id = field::Empty,
        )
    }

    pub fn connection_span(&self, tenant: &TenantId, generation: u64) -> Span {
        span!(
            Level::INFO,
            "bridge.connection",
            tenant = %tenant,
            generation = generation,
        )
    }
}

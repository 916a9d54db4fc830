use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use futures::Stream;
use serde_json::Value;
use soulbridge_core_types::TenantId;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::config::BridgeConfig;
use crate::dispatcher::{CommandDispatcher, RemoteExecutor};
use crate::errors::BridgeResult;
use crate::events::{event_bus, BridgeEvent, BridgeEventBus};
use crate::guard::InFlightGuard;
use crate::handlers;
use crate::lifecycle::ConnectionLifecycle;
use crate::model::{welcome_frame, InboundFrame, TenantStatusResponse};
use crate::pending::PendingRequestTable;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::router::ReplyRouter;
use crate::sweeper::spawn_sweeper;
use crate::trace::BridgeTracer;
use crate::transport::{CloseCause, FrameSink, CLOSE_GRACE};
use crate::ws;

/// One bridge instance: registry, pending table and dispatcher wired together.
///
/// Created once at process start and cloned into every component that needs
/// it. Independent instances share no state.
#[derive(Clone)]
pub struct RemoteBridge {
    config: Arc<BridgeConfig>,
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingRequestTable>,
    guard: Arc<InFlightGuard>,
    lifecycle: Arc<ConnectionLifecycle>,
    dispatcher: CommandDispatcher,
    events: BridgeEventBus,
    tracer: BridgeTracer,
    shutdown: CancellationToken,
}

impl RemoteBridge {
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;
        let events = event_bus(config.event_buffer);
        let pending = Arc::new(PendingRequestTable::new());
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&pending),
            events.clone(),
        ));
        let guard = Arc::new(InFlightGuard::new(config.max_in_flight_per_tenant));
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            events.clone(),
            config.heartbeat_interval(),
            config.idle_timeout(),
        ));
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            Arc::clone(&guard),
            events.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            pending,
            guard,
            lifecycle,
            dispatcher,
            events,
            tracer: BridgeTracer,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_tracer(mut self, tracer: BridgeTracer) -> Self {
        self.dispatcher = self.dispatcher.with_tracer(tracer.clone());
        self.tracer = tracer;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn executor(&self) -> Arc<dyn RemoteExecutor> {
        Arc::new(self.dispatcher.clone())
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn pending(&self) -> &Arc<PendingRequestTable> {
        &self.pending
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionLifecycle> {
        &self.lifecycle
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        spawn_sweeper(
            Arc::clone(&self.pending),
            Arc::clone(&self.guard),
            Arc::clone(&self.registry),
            self.config.sweep_interval(),
            self.shutdown.clone(),
        )
    }

    /// Stops the sweeper and every connection read loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.close_all(CloseCause::Shutdown);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Caller-facing shortcut for [`RemoteExecutor::execute`].
    pub async fn execute(
        &self,
        tenant: &TenantId,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> BridgeResult<Value> {
        self.dispatcher
            .execute(tenant, command, params, timeout)
            .await
    }

    /// Makes `sink` the live connection of `tenant`.
    pub fn attach(&self, tenant: &TenantId, sink: Arc<dyn FrameSink>) -> Arc<ConnectionHandle> {
        self.lifecycle.connect(tenant, sink)
    }

    /// Drives an attached connection until it closes, then runs the
    /// disconnect transition and closes the sink.
    pub async fn run_connection<S, E>(
        &self,
        handle: Arc<ConnectionHandle>,
        inbound: S,
    ) -> CloseCause
    where
        S: Stream<Item = Result<InboundFrame, E>> + Unpin,
        E: std::fmt::Display,
    {
        let span = self
            .tracer
            .connection_span(handle.tenant(), handle.generation().0);
        async move {
            let heartbeat = self.lifecycle.spawn_heartbeat(Arc::clone(&handle));
            if let Err(err) = handle.post(welcome_frame(handle.tenant(), handle.generation())) {
                debug!(target: "remote-bridge", ?err, "welcome frame not delivered");
            }

            let router = ReplyRouter::new(
                Arc::clone(&handle),
                Arc::clone(&self.pending),
                self.config.max_frame_bytes,
            );
            let cause = router.run(inbound, self.shutdown.clone()).await;

            if let Some(task) = heartbeat {
                task.abort();
            }
            self.lifecycle.disconnect(&handle, &cause);
            if tokio::time::timeout(CLOSE_GRACE, handle.sink().close(&cause))
                .await
                .is_err()
            {
                debug!(target: "remote-bridge", %cause, "sink close did not finish in time");
            }
            cause
        }
        .instrument(span)
        .await
    }

    pub async fn serve_connection<S, E>(
        &self,
        tenant: &TenantId,
        sink: Arc<dyn FrameSink>,
        inbound: S,
    ) -> CloseCause
    where
        S: Stream<Item = Result<InboundFrame, E>> + Unpin,
        E: std::fmt::Display,
    {
        let handle = self.attach(tenant, sink);
        self.run_connection(handle, inbound).await
    }

    pub fn tenant_status(&self, tenant: &TenantId) -> TenantStatusResponse {
        let connection = self.registry.get(tenant);
        TenantStatusResponse {
            tenant_id: tenant.clone(),
            state: self.lifecycle.state(tenant),
            generation: connection.as_ref().map(|handle| handle.generation()),
            opened_at: connection
                .as_ref()
                .map(|handle| handle.opened_at_utc().to_rfc3339()),
            idle_ms: connection
                .as_ref()
                .map(|handle| handle.idle_for().as_millis() as u64),
            in_flight: self.pending.in_flight(tenant),
        }
    }

    pub fn build(self) -> Router {
        Router::new()
            .route("/status", get(handlers::status))
            .route("/bridge/:tenant_id", get(ws::websocket_handler))
            .route("/v1/tenants/:tenant_id", get(handlers::tenant_status))
            .route(
                "/v1/tenants/:tenant_id/commands",
                post(handlers::run_command),
            )
            .with_state(handlers::BridgeCtx { bridge: self })
    }
}

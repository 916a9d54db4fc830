use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use soulbridge_core_types::{RequestId, TenantId};
use tokio::sync::oneshot::error::RecvError;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn, Instrument};

use crate::errors::{BridgeError, BridgeResult};
use crate::events::{emit, BridgeEvent, BridgeEventBus};
use crate::guard::InFlightGuard;
use crate::model::CommandEnvelope;
use crate::pending::{PendingRequestTable, RequestStatus};
use crate::registry::ConnectionRegistry;
use crate::trace::BridgeTracer;

/// Successful outcome of a dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub request_id: RequestId,
    pub data: Value,
}

/// Entry point for the planning and action-handler layers. They never touch
/// the registry or the pending table directly.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn dispatch(
        &self,
        tenant: &TenantId,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> BridgeResult<CommandReply>;

    async fn execute(
        &self,
        tenant: &TenantId,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> BridgeResult<Value> {
        self.dispatch(tenant, command, params, timeout)
            .await
            .map(|reply| reply.data)
    }
}

#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingRequestTable>,
    guard: Arc<InFlightGuard>,
    events: BridgeEventBus,
    tracer: BridgeTracer,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pending: Arc<PendingRequestTable>,
        guard: Arc<InFlightGuard>,
        events: BridgeEventBus,
    ) -> Self {
        Self {
            registry,
            pending,
            guard,
            events,
            tracer: BridgeTracer,
        }
    }

    pub fn with_tracer(mut self, tracer: BridgeTracer) -> Self {
        self.tracer = tracer;
        self
    }

    async fn run(
        &self,
        tenant: &TenantId,
        command: &str,
        params: Value,
        timeout: Duration,
        request_slot: &mut Option<RequestId>,
    ) -> BridgeResult<Value> {
        if command.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("command name is empty".into()));
        }
        if timeout.is_zero() {
            return Err(BridgeError::InvalidArgument("timeout must be positive".into()));
        }
        let params = normalize_params(params)?;

        let connection = self
            .registry
            .get(tenant)
            .filter(|connection| connection.is_live())
            .ok_or_else(|| BridgeError::NoConnection(tenant.to_string()))?;
        let permit = self.guard.acquire(tenant)?;

        // one deadline covers both the write and the wait for the reply
        let deadline = Instant::now() + timeout;
        let (request_id, mut waiter) = self.pending.create_guarded(
            tenant,
            connection.generation(),
            command,
            timeout,
            permit,
        );
        tracing::Span::current().record("request_id", request_id.as_str());
        *request_slot = Some(request_id.clone());

        // the connection may have been superseded or lost between lookup and
        // registration; the generation sweep could have missed this entry
        if let Some(reason) = connection.close_reason() {
            self.pending.fail(&request_id, reason.into());
        } else {
            let envelope = CommandEnvelope {
                request_id: request_id.clone(),
                command: command.to_string(),
                params,
            };
            match serde_json::to_string(&envelope) {
                Ok(frame) => {
                    let send = timeout_at(deadline, connection.send(frame));
                    tokio::select! {
                        biased;
                        // settled while the write was still queued, e.g. by a disconnect
                        outcome = &mut waiter => return settled(outcome),
                        sent = send => match sent {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                warn!(
                                    target: "remote-bridge",
                                    request_id = %request_id,
                                    ?err,
                                    "command send failed"
                                );
                                self.pending.fail(&request_id, err.into());
                            }
                            Err(_) => {
                                warn!(
                                    target: "remote-bridge",
                                    request_id = %request_id,
                                    "command send still blocked at deadline"
                                );
                            }
                        },
                    }
                }
                Err(err) => {
                    self.pending
                        .fail(&request_id, BridgeError::SendFailed(err.to_string()));
                }
            }
        }

        match timeout_at(deadline, &mut waiter).await {
            Ok(outcome) => settled(outcome),
            Err(_) => {
                if self.pending.expire(&request_id) {
                    debug!(target: "remote-bridge", request_id = %request_id, "command timed out");
                }
                // whichever transition won has already sent its outcome
                match waiter.await {
                    Ok(result) => result,
                    Err(_) => Err(BridgeError::Timeout(timeout.as_millis() as u64)),
                }
            }
        }
    }
}

fn settled(outcome: Result<BridgeResult<Value>, RecvError>) -> BridgeResult<Value> {
    outcome.unwrap_or_else(|_| {
        Err(BridgeError::Internal(
            "pending request dropped without outcome".into(),
        ))
    })
}

#[async_trait]
impl RemoteExecutor for CommandDispatcher {
    async fn dispatch(
        &self,
        tenant: &TenantId,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> BridgeResult<CommandReply> {
        let span = self.tracer.execute_span(tenant, command);
        let mut request_id = None;
        let result = self
            .run(tenant, command, params, timeout, &mut request_id)
            .instrument(span)
            .await;

        let status = RequestStatus::of(&result);
        if let Err(err) = &result {
            debug!(
                target: "remote-bridge",
                tenant = %tenant,
                command,
                code = err.code(),
                "command failed"
            );
        }
        emit(
            &self.events,
            BridgeEvent::CommandCompleted {
                tenant: tenant.clone(),
                request_id: request_id.clone(),
                command: command.to_string(),
                status,
            },
        );

        let data = result?;
        let request_id = request_id
            .ok_or_else(|| BridgeError::Internal("result without request id".into()))?;
        Ok(CommandReply { request_id, data })
    }
}

fn normalize_params(params: Value) -> BridgeResult<Value> {
    match params {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(map) => Ok(Value::Object(map)),
        other => Err(BridgeError::InvalidArgument(format!(
            "params must be a json object, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

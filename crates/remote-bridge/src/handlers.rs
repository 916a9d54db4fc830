use axum::extract::{Path, State};
use axum::Json;
use serde_json::Value;
use soulbridge_core_types::TenantId;

use crate::bootstrap::RemoteBridge;
use crate::dispatcher::RemoteExecutor;
use crate::errors::{BridgeError, BridgeResult};
use crate::model::{RunCommandRequest, RunCommandResponse, StatusResponse, TenantStatusResponse};

#[derive(Clone)]
pub struct BridgeCtx {
    pub bridge: RemoteBridge,
}

fn parse_tenant(raw: String) -> BridgeResult<TenantId> {
    TenantId::parse(raw).map_err(|err| BridgeError::InvalidTenant(err.to_string()))
}

pub async fn status(State(ctx): State<BridgeCtx>) -> Json<StatusResponse> {
    Json(StatusResponse {
        ready: !ctx.bridge.is_shutting_down(),
        connections: ctx.bridge.registry().len(),
        pending: ctx.bridge.pending().len(),
    })
}

pub async fn tenant_status(
    State(ctx): State<BridgeCtx>,
    Path(tenant_id): Path<String>,
) -> BridgeResult<Json<TenantStatusResponse>> {
    let tenant = parse_tenant(tenant_id)?;
    Ok(Json(ctx.bridge.tenant_status(&tenant)))
}

pub async fn run_command(
    State(ctx): State<BridgeCtx>,
    Path(tenant_id): Path<String>,
    Json(req): Json<RunCommandRequest>,
) -> BridgeResult<Json<RunCommandResponse>> {
    let tenant = parse_tenant(tenant_id)?;
    let timeout = ctx.bridge.config().resolve_timeout(req.timeout_ms);
    let params = req.params.unwrap_or(Value::Null);

    let reply = ctx
        .bridge
        .dispatcher()
        .dispatch(&tenant, &req.command, params, timeout)
        .await?;

    Ok(Json(RunCommandResponse {
        request_id: reply.request_id,
        data: reply.data,
    }))
}

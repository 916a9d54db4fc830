use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use soulbridge_core_types::{Generation, RequestId, TenantId};

/// Command sent to the browser-side executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    pub request_id: RequestId,
    pub command: String,
    pub params: Value,
}

/// Correlated reply from the browser-side executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyEnvelope {
    pub request_id: RequestId,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Transport-neutral view of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedFrame {
    Reply(ReplyEnvelope),
    /// Out-of-band frame such as `{"type":"hello"}`.
    Housekeeping(String),
    /// A command wrapper arriving on the reply channel.
    UnexpectedCommand(Option<String>),
    Malformed(String),
}

pub fn classify(text: &str) -> ClassifiedFrame {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return ClassifiedFrame::Malformed(format!("invalid json: {err}")),
    };
    let Some(object) = value.as_object() else {
        return ClassifiedFrame::Malformed("frame is not a json object".into());
    };

    if object.contains_key("request_id") {
        if object.contains_key("command") && !object.contains_key("success") {
            let request_id = object
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_owned);
            return ClassifiedFrame::UnexpectedCommand(request_id);
        }
        return match serde_json::from_value::<ReplyEnvelope>(value) {
            Ok(reply) => ClassifiedFrame::Reply(reply),
            Err(err) => ClassifiedFrame::Malformed(format!("invalid reply: {err}")),
        };
    }

    match object.get("type").and_then(Value::as_str) {
        Some(kind) => ClassifiedFrame::Housekeeping(kind.to_string()),
        None => ClassifiedFrame::Malformed("frame carries neither request_id nor type".into()),
    }
}

pub fn welcome_frame(tenant: &TenantId, generation: Generation) -> String {
    json!({
        "type": "welcome",
        "tenant_id": tenant.as_str(),
        "generation": generation.0,
    })
    .to_string()
}

pub fn heartbeat_ack_frame() -> String {
    json!({ "type": "heartbeat_ack" }).to_string()
}

/// Body accepted by `POST /v1/tenants/:tenant_id/commands`.
#[derive(Debug, Deserialize)]
pub struct RunCommandRequest {
    pub command: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RunCommandResponse {
    pub request_id: RequestId,
    pub data: Value,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub ready: bool,
    pub connections: usize,
    pub pending: usize,
}

#[derive(Debug, Serialize)]
pub struct TenantStatusResponse {
    pub tenant_id: TenantId,
    pub state: crate::lifecycle::TenantState,
    pub generation: Option<Generation>,
    pub opened_at: Option<String>,
    pub idle_ms: Option<u64>,
    pub in_flight: usize,
}

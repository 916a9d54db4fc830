use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use thiserror::Error;

/// Terminal outcomes surfaced to callers of the bridge.
///
/// None of these are retried by the bridge itself; retry policy belongs to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("no live connection for tenant {0}")]
    NoConnection(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("no reply within {0}ms")]
    Timeout(u64),
    #[error("connection lost while request was pending")]
    ConnectionLost,
    #[error("connection superseded by a newer connection")]
    ConnectionSuperseded,
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("too many in-flight commands for tenant (limit {0})")]
    TooManyInFlight(u32),
    #[error("invalid tenant id: {0}")]
    InvalidTenant(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("write failed: {0}")]
    Write(String),
    #[error("outbound queue full")]
    Backpressure,
    #[error("encode failed: {0}")]
    Encode(String),
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        BridgeError::SendFailed(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl BridgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::NoConnection(_) => StatusCode::NOT_FOUND,
            BridgeError::SendFailed(_)
            | BridgeError::ConnectionLost
            | BridgeError::ConnectionSuperseded
            | BridgeError::ProtocolError(_) => StatusCode::BAD_GATEWAY,
            BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::RemoteError(_) => StatusCode::FAILED_DEPENDENCY,
            BridgeError::TooManyInFlight(_) => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::InvalidTenant(_) | BridgeError::InvalidArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::NoConnection(_) => "NO_CONNECTION",
            BridgeError::SendFailed(_) => "SEND_FAILED",
            BridgeError::Timeout(_) => "TIMEOUT",
            BridgeError::ConnectionLost => "CONNECTION_LOST",
            BridgeError::ConnectionSuperseded => "CONNECTION_SUPERSEDED",
            BridgeError::RemoteError(_) => "REMOTE_ERROR",
            BridgeError::ProtocolError(_) => "PROTOCOL_ERROR",
            BridgeError::TooManyInFlight(_) => "TOO_MANY_IN_FLIGHT",
            BridgeError::InvalidTenant(_) => "INVALID_TENANT",
            BridgeError::InvalidArgument(_) => "INVALID_ARGUMENT",
            BridgeError::Internal(_) => "INTERNAL",
        }
    }

    /// Caller-facing message. Remote errors carry the browser-side string unchanged.
    pub fn message(&self) -> String {
        match self {
            BridgeError::RemoteError(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.message(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_message_is_passed_through() {
        let err = BridgeError::RemoteError("element #buy not found".into());
        assert_eq!(err.code(), "REMOTE_ERROR");
        assert_eq!(err.message(), "element #buy not found");
        assert_eq!(err.status_code(), StatusCode::FAILED_DEPENDENCY);
    }

    #[test]
    fn transport_errors_become_send_failed() {
        let err: BridgeError = TransportError::Closed.into();
        assert_eq!(err.code(), "SEND_FAILED");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let err = BridgeError::Timeout(1_000);
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.message(), "no reply within 1000ms");
    }
}

//! Per-connection inbound read loop.
//!
//! Malformed or unexpected frames are logged and dropped; they never end the
//! connection.

use std::fmt::Display;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::Value;
use soulbridge_core_types::RequestId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::BridgeError;
use crate::metrics;
use crate::model::{classify, heartbeat_ack_frame, ClassifiedFrame, InboundFrame};
use crate::pending::PendingRequestTable;
use crate::registry::ConnectionHandle;
use crate::transport::CloseCause;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Resolved(RequestId),
    Failed(RequestId),
    /// Reply for a request that is no longer pending, or not owned by this connection.
    Stale(RequestId),
    Housekeeping(String),
    Dropped(String),
}

pub struct ReplyRouter {
    handle: Arc<ConnectionHandle>,
    pending: Arc<PendingRequestTable>,
    max_frame_bytes: usize,
}

impl ReplyRouter {
    pub fn new(
        handle: Arc<ConnectionHandle>,
        pending: Arc<PendingRequestTable>,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            handle,
            pending,
            max_frame_bytes,
        }
    }

    pub fn route_text(&self, text: &str) -> RouteOutcome {
        if text.len() > self.max_frame_bytes {
            return self.drop_frame(format!(
                "frame of {} bytes exceeds limit of {}",
                text.len(),
                self.max_frame_bytes
            ));
        }

        match classify(text) {
            ClassifiedFrame::Reply(reply) => {
                let request_id = reply.request_id;
                let result = if reply.success {
                    Ok(reply.data.unwrap_or(Value::Null))
                } else {
                    Err(BridgeError::RemoteError(reply.error.unwrap_or_default()))
                };
                let success = result.is_ok();
                let matched = self.pending.complete_for(
                    self.handle.tenant(),
                    self.handle.generation(),
                    &request_id,
                    result,
                );
                if !matched {
                    debug!(
                        target: "remote-bridge",
                        tenant = %self.handle.tenant(),
                        request_id = %request_id,
                        "discarding late or unknown reply"
                    );
                    RouteOutcome::Stale(request_id)
                } else if success {
                    RouteOutcome::Resolved(request_id)
                } else {
                    RouteOutcome::Failed(request_id)
                }
            }
            ClassifiedFrame::Housekeeping(kind) => RouteOutcome::Housekeeping(kind),
            ClassifiedFrame::UnexpectedCommand(request_id) => self.drop_frame(format!(
                "command wrapper received on reply channel (request_id {})",
                request_id.as_deref().unwrap_or("<none>")
            )),
            ClassifiedFrame::Malformed(detail) => self.drop_frame(detail),
        }
    }

    fn drop_frame(&self, detail: String) -> RouteOutcome {
        metrics::record_protocol_error();
        let err = BridgeError::ProtocolError(detail);
        warn!(
            target: "remote-bridge",
            tenant = %self.handle.tenant(),
            generation = self.handle.generation().0,
            code = err.code(),
            "{err}"
        );
        RouteOutcome::Dropped(err.to_string())
    }

    /// Reads frames until the peer closes, the transport fails, the handle is
    /// force-closed, or `shutdown` fires.
    pub async fn run<S, E>(&self, mut inbound: S, shutdown: CancellationToken) -> CloseCause
    where
        S: Stream<Item = Result<InboundFrame, E>> + Unpin,
        E: Display,
    {
        let closed = self.handle.closed_token();
        loop {
            let frame = tokio::select! {
                biased;
                _ = closed.cancelled() => {
                    return self.handle.forced_cause().unwrap_or(CloseCause::Shutdown);
                }
                _ = shutdown.cancelled() => return CloseCause::Shutdown,
                frame = inbound.next() => frame,
            };

            let frame = match frame {
                None => return CloseCause::ClientClosed(None),
                Some(Err(err)) => return CloseCause::Transport(err.to_string()),
                Some(Ok(frame)) => frame,
            };
            self.handle.touch();

            let outcome = match frame {
                InboundFrame::Text(text) => self.route_text(&text),
                InboundFrame::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => self.route_text(&text),
                    Err(_) => self.drop_frame("binary frame is not utf-8".into()),
                },
                InboundFrame::Ping | InboundFrame::Pong => continue,
                InboundFrame::Close(reason) => return CloseCause::ClientClosed(reason),
            };

            if let RouteOutcome::Housekeeping(kind) = outcome {
                if kind == "heartbeat" {
                    if let Err(err) = self.handle.post(heartbeat_ack_frame()) {
                        debug!(target: "remote-bridge", ?err, "heartbeat ack not delivered");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_bus;
    use crate::registry::ConnectionRegistry;
    use crate::transport::MemorySink;
    use serde_json::json;
    use soulbridge_core_types::TenantId;
    use std::time::Duration;

    fn setup() -> (ReplyRouter, Arc<ConnectionHandle>, Arc<PendingRequestTable>) {
        let pending = Arc::new(PendingRequestTable::new());
        let registry = ConnectionRegistry::new(Arc::clone(&pending), event_bus(8));
        let (sink, _rx) = MemorySink::pair();
        let handle = registry.register(&TenantId::parse("t1").unwrap(), sink);
        let router = ReplyRouter::new(Arc::clone(&handle), Arc::clone(&pending), 1024);
        (router, handle, pending)
    }

    #[tokio::test]
    async fn routes_success_and_remote_error() {
        let (router, handle, pending) = setup();
        let (ok_id, ok_waiter) =
            pending.create(handle.tenant(), handle.generation(), "ping", Duration::from_secs(5));
        let (err_id, err_waiter) =
            pending.create(handle.tenant(), handle.generation(), "click", Duration::from_secs(5));

        let ok_frame = json!({"request_id": ok_id, "success": true, "data": {"pong": true}});
        assert_eq!(
            router.route_text(&ok_frame.to_string()),
            RouteOutcome::Resolved(ok_id.clone())
        );
        let err_frame = json!({
            "request_id": err_id,
            "success": false,
            "data": null,
            "error": "no such element",
        });
        assert_eq!(
            router.route_text(&err_frame.to_string()),
            RouteOutcome::Failed(err_id.clone())
        );

        assert_eq!(ok_waiter.await.unwrap(), Ok(json!({"pong": true})));
        assert_eq!(
            err_waiter.await.unwrap(),
            Err(BridgeError::RemoteError("no such element".into()))
        );

        // duplicate reply is a no-op
        assert_eq!(
            router.route_text(&ok_frame.to_string()),
            RouteOutcome::Stale(ok_id)
        );
    }

    #[tokio::test]
    async fn drops_garbage_without_stopping() {
        let (router, _handle, _pending) = setup();
        assert!(matches!(router.route_text("{{{"), RouteOutcome::Dropped(_)));
        assert!(matches!(
            router.route_text(&"x".repeat(2048)),
            RouteOutcome::Dropped(_)
        ));
        assert!(matches!(
            router.route_text(r#"{"request_id":"r","command":"click","params":{}}"#),
            RouteOutcome::Dropped(_)
        ));
        assert_eq!(
            router.route_text(r#"{"type":"hello"}"#),
            RouteOutcome::Housekeeping("hello".into())
        );
    }

    #[tokio::test]
    async fn run_survives_bad_frames_and_reports_close() {
        let (router, handle, pending) = setup();
        let (id, waiter) =
            pending.create(handle.tenant(), handle.generation(), "ping", Duration::from_secs(5));
        let frames: Vec<Result<InboundFrame, std::io::Error>> = vec![
            Ok(InboundFrame::Text("garbage".into())),
            Ok(InboundFrame::Binary(vec![0xff, 0xfe])),
            Ok(InboundFrame::Ping),
            Ok(InboundFrame::Text(
                json!({"request_id": id, "success": true, "data": 7}).to_string(),
            )),
            Ok(InboundFrame::Close(Some("bye".into()))),
        ];

        let cause = router
            .run(futures::stream::iter(frames), CancellationToken::new())
            .await;
        assert_eq!(cause, CloseCause::ClientClosed(Some("bye".into())));
        assert_eq!(waiter.await.unwrap(), Ok(json!(7)));
    }

    #[tokio::test]
    async fn forced_close_stops_the_loop() {
        let (router, handle, _pending) = setup();
        handle.force_close(CloseCause::IdleTimeout);
        let cause = router
            .run(
                futures::stream::pending::<Result<InboundFrame, std::io::Error>>(),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(cause, CloseCause::IdleTimeout);
    }
}

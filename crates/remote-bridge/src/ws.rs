use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use soulbridge_core_types::TenantId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::bootstrap::RemoteBridge;
use crate::errors::{BridgeError, BridgeResult, TransportError};
use crate::handlers::BridgeCtx;
use crate::lifecycle::ConnectingGuard;
use crate::model::InboundFrame;
use crate::transport::{CloseCause, FrameSink, CLOSE_GRACE};

type Ack = oneshot::Sender<Result<(), TransportError>>;

enum WsCommand {
    /// Unacknowledged text frames carry no ack.
    Text(String, Option<Ack>),
    Ping(Ack),
    Close(u16, String),
}

/// Outbound half of a WebSocket, fed through a bounded queue drained by a
/// dedicated writer task.
struct WsSink {
    tx: mpsc::Sender<WsCommand>,
}

impl WsSink {
    async fn submit(
        &self,
        build: impl FnOnce(Ack) -> WsCommand,
    ) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(build(ack_tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        ack_rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.submit(|ack| WsCommand::Text(text, Some(ack))).await
    }

    fn post_text(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .try_send(WsCommand::Text(text, None))
            .map_err(|err| match err {
                TrySendError::Full(_) => TransportError::Backpressure,
                TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    async fn send_ping(&self) -> Result<(), TransportError> {
        self.submit(WsCommand::Ping).await
    }

    async fn close(&self, cause: &CloseCause) {
        let _ = self
            .tx
            .send(WsCommand::Close(close_code(cause), cause.reason().to_string()))
            .await;
    }
}

fn close_code(cause: &CloseCause) -> u16 {
    match cause {
        CloseCause::ClientClosed(_) => 1000,
        CloseCause::Shutdown => 1001,
        CloseCause::Transport(_) => 1011,
        CloseCause::Superseded => 4001,
        CloseCause::IdleTimeout => 4002,
    }
}

fn to_inbound(message: Message) -> InboundFrame {
    match message {
        Message::Text(text) => InboundFrame::Text(text),
        Message::Binary(bytes) => InboundFrame::Binary(bytes),
        Message::Ping(_) => InboundFrame::Ping,
        Message::Pong(_) => InboundFrame::Pong,
        Message::Close(frame) => InboundFrame::Close(frame.map(|frame| frame.reason.to_string())),
    }
}

pub(crate) async fn websocket_handler(
    State(ctx): State<BridgeCtx>,
    Path(tenant_id): Path<String>,
    ws: WebSocketUpgrade,
) -> BridgeResult<impl IntoResponse> {
    let tenant =
        TenantId::parse(tenant_id).map_err(|err| BridgeError::InvalidTenant(err.to_string()))?;
    if ctx.bridge.is_shutting_down() {
        return Err(BridgeError::Internal("bridge shutting down".into()));
    }
    let connecting = ctx.bridge.lifecycle().begin_connect(&tenant);
    let bridge = ctx.bridge;

    Ok(ws.on_upgrade(move |socket| async move {
        handle_socket(bridge, tenant, socket, connecting).await;
    }))
}

async fn handle_socket(
    bridge: RemoteBridge,
    tenant: TenantId,
    socket: WebSocket,
    connecting: ConnectingGuard,
) {
    let (ws_tx, ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(bridge.config().outbound_buffer);
    let mut writer = tokio::spawn(write_loop(ws_tx, rx));

    let handle = bridge.attach(&tenant, Arc::new(WsSink { tx }));
    drop(connecting);

    let inbound = ws_rx.map(|message| message.map(to_inbound));
    let cause = bridge.run_connection(handle, inbound).await;
    debug!(target: "remote-bridge", tenant = %tenant, %cause, "websocket finished");

    // a peer that stopped reading can leave the writer parked on a full socket
    match tokio::time::timeout(CLOSE_GRACE, &mut writer).await {
        Ok(Err(err)) => debug!(target: "remote-bridge", ?err, "websocket writer task failed"),
        Ok(Ok(())) => {}
        Err(_) => {
            debug!(target: "remote-bridge", tenant = %tenant, "websocket writer stalled; aborting");
            writer.abort();
        }
    }
}

async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<WsCommand>) {
    while let Some(command) = rx.recv().await {
        let (message, ack) = match command {
            WsCommand::Text(text, ack) => (Message::Text(text), ack),
            WsCommand::Ping(ack) => (Message::Ping(Vec::new()), Some(ack)),
            WsCommand::Close(code, reason) => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                if let Err(err) = ws_tx.send(Message::Close(Some(frame))).await {
                    debug!(target: "remote-bridge", ?err, "close frame not delivered");
                }
                break;
            }
        };

        let result = ws_tx
            .send(message)
            .await
            .map_err(|err| TransportError::Write(err.to_string()));
        let failed = result.is_err();
        if let Some(ack) = ack {
            let _ = ack.send(result);
        } else if let Err(err) = result {
            debug!(target: "remote-bridge", ?err, "unacknowledged frame not delivered");
        }
        if failed {
            break;
        }
    }
}

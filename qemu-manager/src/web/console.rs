use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::console::{self, ConsoleSink, ConsoleSource, TransportFrame};
use crate::error::{VmError, VmResult};

use super::{vm_error_response, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/vnc/{vm_id}", get(vnc_upgrade))
}

#[derive(Deserialize)]
struct ConsoleQuery {
    port: Option<u16>,
}

/// Receiving half of an axum WebSocket.
struct WsSource(SplitStream<WebSocket>);

#[async_trait]
impl ConsoleSource for WsSource {
    async fn recv(&mut self) -> Option<anyhow::Result<TransportFrame>> {
        loop {
            let msg = match self.0.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };
            let frame = match msg {
                Message::Binary(data) => TransportFrame::Binary(data.to_vec()),
                Message::Text(text) => TransportFrame::Text(text.as_str().to_owned()),
                Message::Close(_) => TransportFrame::Close,
                // Answered by axum.
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}

/// Sending half of an axum WebSocket.
struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl ConsoleSink for WsSink {
    async fn send_binary(&mut self, data: Vec<u8>) -> anyhow::Result<()> {
        self.0.send(Message::Binary(data.into())).await?;
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.0.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.0.send(Message::Close(None)).await.ok();
    }
}

/// Check that a console session may be opened and pick its port.
///
/// The VM must exist and be running. The port defaults to the VM's VNC port;
/// any other port is refused so a session cannot reach arbitrary local services.
async fn resolve_session(state: &AppState, raw_id: &str, port: Option<u16>) -> VmResult<(Uuid, u16)> {
    let vm_id = Uuid::parse_str(raw_id).map_err(|_| VmError::vm_not_found(raw_id))?;
    let view = state.vm_manager.get(vm_id).await?;
    if !view.vm.is_running() {
        return Err(VmError::InvalidState(format!(
            "VM '{}' is not running",
            view.vm.name
        )));
    }
    match port {
        Some(p) if p != view.vm.vnc_port => Err(VmError::InvalidArgument(format!(
            "port {} is not the console port of VM '{}'",
            p, view.vm.name
        ))),
        _ => Ok((vm_id, view.vm.vnc_port)),
    }
}

async fn vnc_upgrade(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<String>,
    Query(query): Query<ConsoleQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let (vm_id, port) = match resolve_session(&state, &vm_id, query.port).await {
        Ok(session) => session,
        Err(e) => return vm_error_response(e),
    };
    let timeout = state.config.console.connect_timeout();

    ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        let (mut sink, mut source) = (WsSink(sender), WsSource(receiver));
        if let Err(e) = console::relay(&mut source, &mut sink, vm_id, port, timeout).await {
            debug!(vm_id = %vm_id, error = %e, "console session not established");
        }
    })
}

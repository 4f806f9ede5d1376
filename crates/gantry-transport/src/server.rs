//! Websocket endpoint.
//!
//! One axum route upgrades each connection, splits the socket into a
//! writer task fed by an outbound queue and a reader loop feeding the
//! connection codec. Everything protocol-specific is delegated to the
//! [`EngineHandler`] installed by the runtime.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use gantry_core::{Result, UserInfo};
use gantry_rpc::Packet;

use crate::protocol::{ConnectionCodec, ControlEnvelope, ControlReply, ControlRequest, Inbound};
use crate::session::{ClientSession, RawMessage};

/// Protocol callbacks the runtime installs on the websocket endpoint.
#[async_trait]
pub trait EngineHandler: Send + Sync {
    /// Turns the upgrade request's credentials into a user. Errors reject
    /// the upgrade; a missing bearer yields an anonymous user.
    async fn authenticate(
        &self,
        authorization: Option<String>,
        query: HashMap<String, String>,
    ) -> Result<UserInfo>;

    /// Handles `register_client`, creating the session bound to this
    /// socket's outbound queue.
    async fn register_client(
        &self,
        sid: &str,
        user: &UserInfo,
        outbound: mpsc::Sender<RawMessage>,
        request: ControlRequest,
    ) -> Result<(Arc<ClientSession>, serde_json::Value)>;

    /// Handles every other control operation of a registered session.
    async fn handle_control(
        &self,
        session: &Arc<ClientSession>,
        envelope: ControlEnvelope,
    ) -> ControlReply;

    /// Handles a packet on a named channel. `session` is absent for
    /// worker connections, which authenticate by channel secret alone.
    async fn handle_channel(
        &self,
        sid: &str,
        session: Option<&Arc<ClientSession>>,
        channel: &str,
        packet: Packet,
        outbound: &mpsc::Sender<RawMessage>,
    ) -> Result<()>;

    /// The socket closed.
    async fn on_disconnect(&self, sid: &str, session: Option<&Arc<ClientSession>>);
}

struct ServerState {
    handler: Arc<dyn EngineHandler>,
}

/// Builds the websocket route (`/ws`) around an engine handler.
pub fn websocket_router(handler: Arc<dyn EngineHandler>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(Arc::new(ServerState { handler }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let user = match state.handler.authenticate(authorization, query).await {
        Ok(user) => user,
        Err(e) => {
            warn!(error = %e, "Rejecting websocket upgrade");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, user: UserInfo) {
    let sid = uuid::Uuid::new_v4().to_string();
    info!(sid = %sid, user = %user.id, "Websocket connection established");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<RawMessage>(256);

    // writer task: drain the outbound queue into the socket
    let sid_send = sid.clone();
    let send_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx
                .send(Message::Text(message.text.into()))
                .await
                .is_err()
            {
                warn!(sid = %sid_send, "Failed to send message, connection closed");
                break;
            }
            for binary in message.binaries {
                if ws_tx.send(Message::Binary(binary.into())).await.is_err() {
                    warn!(sid = %sid_send, "Failed to send binary message");
                    break;
                }
            }
        }
    });

    let mut codec = ConnectionCodec::new();
    let mut session: Option<Arc<ClientSession>> = None;

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => {
                trace!(sid = %sid, len = text.len(), "Received text message");
                match codec.push_text(text.as_str()) {
                    Ok(inbound) => {
                        dispatch(&state, &sid, &user, &out_tx, &mut session, inbound).await;
                    }
                    Err(e) => {
                        warn!(sid = %sid, error = %e, "Dropping malformed message");
                    }
                }
            }
            Ok(Message::Binary(data)) => {
                trace!(sid = %sid, len = data.len(), "Received binary message");
                match codec.push_binary(&data) {
                    Ok(inbound) => {
                        dispatch(&state, &sid, &user, &out_tx, &mut session, inbound).await;
                    }
                    Err(e) => {
                        warn!(sid = %sid, error = %e, "Dropping malformed binary message");
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(sid = %sid, "Websocket connection closed by client");
                break;
            }
            Err(e) => {
                warn!(sid = %sid, error = %e, "Websocket error");
                break;
            }
        }
    }

    send_task.abort();
    state.handler.on_disconnect(&sid, session.as_ref()).await;
    info!(sid = %sid, "Websocket connection closed");
}

async fn dispatch(
    state: &Arc<ServerState>,
    sid: &str,
    user: &UserInfo,
    out_tx: &mpsc::Sender<RawMessage>,
    session: &mut Option<Arc<ClientSession>>,
    inbound: Inbound,
) {
    match inbound {
        Inbound::Incomplete => {}
        Inbound::Control(envelope) => {
            let request_id = envelope.request_id;
            let is_register = matches!(envelope.request, ControlRequest::RegisterClient { .. });
            let reply = if is_register {
                match state
                    .handler
                    .register_client(sid, user, out_tx.clone(), envelope.request)
                    .await
                {
                    Ok((new_session, payload)) => {
                        *session = Some(new_session);
                        ControlReply::ok(request_id, payload)
                    }
                    Err(e) => ControlReply::error(request_id, &e),
                }
            } else if let Some(current) = session.as_ref() {
                state.handler.handle_control(current, envelope).await
            } else {
                debug!(sid = %sid, "Control operation before registration");
                ControlReply::error(
                    request_id,
                    &gantry_core::Error::Unauthorized("client is not registered".into()),
                )
            };
            if let Ok(text) = crate::protocol::encode_control_reply(&reply) {
                let _ = out_tx
                    .send(RawMessage {
                        text,
                        binaries: Vec::new(),
                    })
                    .await;
            }
        }
        Inbound::Channel { channel, packet } => {
            if let Err(e) = state
                .handler
                .handle_channel(sid, session.as_ref(), &channel, packet, out_tx)
                .await
            {
                debug!(sid = %sid, channel = %channel, error = %e, "Channel dispatch failed");
            }
        }
    }
}

pub mod protocol;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use collabornest_common::protocol::ws::{
    WsMessage, CLOSE_CODE_GOING_AWAY, CLOSE_CODE_IDLE_TIMEOUT, CLOSE_CODE_POLICY,
    COLLABORATION_PATH,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::handshake::{extract_credential, HandshakeParams};
use crate::auth::IdentityClaim;
use crate::config::HeartbeatConfig;
use crate::connection::{AdmitError, ConnectionManager, DisconnectReason, Outbound};
use crate::error::{ErrorCode, GatewayError};
use crate::presence::{Participant, PresenceError};
use protocol::{decode_message, error_frame, send_close, send_ws_message};

#[derive(Clone)]
pub struct WsState {
    pub manager: Arc<ConnectionManager>,
    pub heartbeat: HeartbeatConfig,
}

pub fn router(state: WsState) -> Router {
    Router::new().route(COLLABORATION_PATH, get(ws_upgrade)).with_state(state)
}

/// Authenticate the handshake before agreeing to upgrade. Rejections are
/// plain HTTP responses and never touch the pool.
pub async fn ws_upgrade(
    State(state): State<WsState>,
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.manager.is_shutting_down() {
        return GatewayError::from_code(ErrorCode::ServerShuttingDown).into_response();
    }

    let credential = match extract_credential(&headers, &params) {
        Ok(credential) => credential,
        Err(error) => {
            state.manager.metrics().record_auth_rejection(ErrorCode::from(&error).as_str());
            warn!("rejected websocket handshake without credentials");
            return GatewayError::from(error).into_response();
        }
    };
    let identity = match state.manager.authenticate(credential) {
        Ok(identity) => identity,
        Err(error) => return GatewayError::from(error).into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(state, identity, socket))
}

async fn handle_socket(state: WsState, identity: IdentityClaim, mut socket: WebSocket) {
    let manager = state.manager;
    let heartbeat = state.heartbeat;

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Outbound>();
    let connection_id = match manager.admit(identity.clone(), outbound_sender).await {
        Ok(connection_id) => connection_id,
        Err(error) => {
            let code = ErrorCode::from(&error);
            let close = match error {
                AdmitError::Capacity(_) => CLOSE_CODE_POLICY,
                AdmitError::ShuttingDown => CLOSE_CODE_GOING_AWAY,
                AdmitError::Registry(_) => close_code::ERROR,
            };
            let _ = send_ws_message(&mut socket, &error_frame(code)).await;
            send_close(&mut socket, close, code.default_message()).await;
            return;
        }
    };

    let connected = WsMessage::Connected {
        connection_id,
        user_id: identity.subject_id.clone(),
        heartbeat_interval_ms: u64::try_from(heartbeat.interval.as_millis()).unwrap_or(u64::MAX),
    };
    if send_ws_message(&mut socket, &connected).await.is_err() {
        manager.disconnect(connection_id, DisconnectReason::NetworkError).await;
        return;
    }

    let mut ping_interval = tokio::time::interval(heartbeat.interval);
    ping_interval.reset(); // skip immediate first tick
    let mut pending_ping: Option<Instant> = None;
    let mut missed_pings = 0u32;

    let reason = loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if let Some(sent_at) = pending_ping {
                    if sent_at.elapsed() >= heartbeat.timeout {
                        missed_pings += 1;
                        pending_ping = None;
                        if missed_pings >= heartbeat.max_missed {
                            warn!(
                                connection_id = %connection_id,
                                user_id = %identity.subject_id,
                                missed_pings,
                                "heartbeat timeout, disconnecting"
                            );
                            manager.metrics().increment_heartbeat_timeouts();
                            send_close(&mut socket, CLOSE_CODE_IDLE_TIMEOUT, "heartbeat timeout").await;
                            break DisconnectReason::IdleTimeout;
                        }
                    }
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break DisconnectReason::NetworkError;
                }
                pending_ping.get_or_insert_with(Instant::now);
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(Outbound::Event(message)) => {
                        if send_ws_message(&mut socket, &message).await.is_err() {
                            break DisconnectReason::NetworkError;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        send_close(&mut socket, code, &reason).await;
                        break DisconnectReason::ServerShutdown;
                    }
                    // The registry dropped us; someone else already ran the close path.
                    None => break DisconnectReason::ServerShutdown,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break DisconnectReason::ClientClosed;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        manager.touch(connection_id).await;
                        let reply = handle_client_frame(&manager, connection_id, &raw_message).await;
                        if send_ws_message(&mut socket, &reply).await.is_err() {
                            break DisconnectReason::NetworkError;
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        manager.touch(connection_id).await;
                        if send_ws_message(&mut socket, &error_frame(ErrorCode::InvalidMessage)).await.is_err() {
                            break DisconnectReason::NetworkError;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        manager.touch(connection_id).await;
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break DisconnectReason::NetworkError;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        pending_ping = None;
                        missed_pings = 0;
                        manager.touch(connection_id).await;
                    }
                    Ok(Message::Close(_)) => break DisconnectReason::ClientClosed,
                    Err(error) => {
                        debug!(connection_id = %connection_id, error = %error, "websocket receive failed");
                        break DisconnectReason::NetworkError;
                    }
                }
            }
        }
    };

    manager.disconnect(connection_id, reason).await;
}

async fn handle_client_frame(
    manager: &ConnectionManager,
    connection_id: Uuid,
    raw_message: &str,
) -> WsMessage {
    let metrics = manager.metrics();
    let inbound = match decode_message(raw_message) {
        Ok(message) => message,
        Err(error) => {
            debug!(connection_id = %connection_id, error = %error, "undecodable websocket frame");
            metrics.record_ws_event("invalid", true);
            return error_frame(ErrorCode::InvalidMessage);
        }
    };
    let event = inbound.event_name();

    let Some(identity) = manager.active_identity(connection_id).await else {
        metrics.record_ws_event(event, true);
        return error_frame(ErrorCode::ConnectionNotActive);
    };
    let participant = Participant {
        subject_id: identity.subject_id,
        username: identity.username,
        connection_id,
    };

    let (reply, failed) = match inbound {
        WsMessage::ResourceJoin { resource_id, .. } | WsMessage::ResourceLeave { resource_id }
            if resource_id.trim().is_empty() =>
        {
            (error_frame(ErrorCode::InvalidMessage), true)
        }
        WsMessage::ResourceJoin { resource_id, resource_type, mode } => {
            match manager.sessions().join(&participant, &resource_id, &resource_type, mode).await {
                Ok(users) => (
                    WsMessage::ResourceJoined {
                        success: true,
                        resource_id,
                        users: Some(users),
                        message: None,
                    },
                    false,
                ),
                Err(PresenceError::ConnectionNotActive) => {
                    (error_frame(ErrorCode::ConnectionNotActive), true)
                }
                Err(error) => (
                    WsMessage::ResourceJoined {
                        success: false,
                        resource_id,
                        users: None,
                        message: Some(error.to_string()),
                    },
                    true,
                ),
            }
        }
        WsMessage::ResourceLeave { resource_id } => {
            match manager.sessions().leave(&participant, &resource_id).await {
                Ok(()) => {
                    (WsMessage::ResourceLeft { success: true, resource_id, message: None }, false)
                }
                Err(PresenceError::ConnectionNotActive) => {
                    (error_frame(ErrorCode::ConnectionNotActive), true)
                }
                Err(error) => (
                    WsMessage::ResourceLeft {
                        success: false,
                        resource_id,
                        message: Some(error.to_string()),
                    },
                    true,
                ),
            }
        }
        _ => (error_frame(ErrorCode::UnsupportedMessage), true),
    };

    metrics.record_ws_event(event, failed);
    reply
}

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use collabornest_common::protocol::ws::WsMessage;

use crate::error::ErrorCode;

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub fn error_frame(code: ErrorCode) -> WsMessage {
    WsMessage::Error {
        code: code.as_str().to_string(),
        message: code.default_message().to_string(),
        retryable: code.retryable(),
    }
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

pub async fn send_close(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() })))
        .await;
}

// WebSocket message types for the collabornest presence protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{LeaveReason, MemberInfo, MemberMode};

/// Path the gateway serves the collaboration namespace on.
pub const COLLABORATION_PATH: &str = "/ws/collaboration";

/// Close code sent when a connection is refused by policy (capacity).
pub const CLOSE_CODE_POLICY: u16 = 1008;

/// Close code sent when the gateway is going away (shutdown).
pub const CLOSE_CODE_GOING_AWAY: u16 = 1001;

/// Close code sent after missed heartbeats.
pub const CLOSE_CODE_IDLE_TIMEOUT: u16 = 4008;

pub const DEFAULT_RESOURCE_TYPE: &str = "page";

fn default_resource_type() -> String {
    DEFAULT_RESOURCE_TYPE.to_string()
}

/// All frames exchanged on the collaboration socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WsMessage {
    /// Server -> Client: the connection was admitted.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { connection_id: Uuid, user_id: String, heartbeat_interval_ms: u64 },

    /// Client -> Server: request membership of a resource.
    #[serde(rename = "resource:join", rename_all = "camelCase")]
    ResourceJoin {
        resource_id: String,
        #[serde(default = "default_resource_type")]
        resource_type: String,
        #[serde(default)]
        mode: MemberMode,
    },

    /// Server -> Client: reply to `resource:join`.
    #[serde(rename = "resource:joined", rename_all = "camelCase")]
    ResourceJoined {
        success: bool,
        resource_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        users: Option<Vec<MemberInfo>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Client -> Server: leave a resource.
    #[serde(rename = "resource:leave", rename_all = "camelCase")]
    ResourceLeave { resource_id: String },

    /// Server -> Client: reply to `resource:leave`.
    #[serde(rename = "resource:left", rename_all = "camelCase")]
    ResourceLeft {
        success: bool,
        resource_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Server -> Room: another member joined.
    #[serde(rename = "user:joined", rename_all = "camelCase")]
    UserJoined {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        mode: MemberMode,
        resource_id: String,
    },

    /// Server -> Room: another member left.
    #[serde(rename = "user:left", rename_all = "camelCase")]
    UserLeft { user_id: String, resource_id: String, reason: LeaveReason },

    /// Server -> Client: the gateway is shutting down.
    #[serde(rename = "server:shutdown", rename_all = "camelCase")]
    ServerShutdown { message: String, timeout_ms: u64 },

    /// Server -> Client: error.
    #[serde(rename = "error")]
    Error { code: String, message: String, retryable: bool },
}

impl WsMessage {
    /// Wire name of the frame, used for logging and metric labels.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::ResourceJoin { .. } => "resource:join",
            Self::ResourceJoined { .. } => "resource:joined",
            Self::ResourceLeave { .. } => "resource:leave",
            Self::ResourceLeft { .. } => "resource:left",
            Self::UserJoined { .. } => "user:joined",
            Self::UserLeft { .. } => "user:left",
            Self::ServerShutdown { .. } => "server:shutdown",
            Self::Error { .. } => "error",
        }
    }
}

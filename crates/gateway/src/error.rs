use axum::{
    http::{header::HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::auth::AuthError;
use crate::connection::AdmitError;
use crate::pool::CapacityError;
use crate::presence::PresenceError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthMissingToken,
    AuthMalformedToken,
    AuthSignatureInvalid,
    AuthTokenExpired,
    AuthIssuerMismatch,
    AuthAudienceMismatch,
    MaxConnectionsExceeded,
    AlreadyJoined,
    NotInResource,
    ConnectionNotActive,
    InvalidMessage,
    UnsupportedMessage,
    ServerShuttingDown,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthMissingToken => "AUTH_MISSING_TOKEN",
            Self::AuthMalformedToken => "AUTH_MALFORMED_TOKEN",
            Self::AuthSignatureInvalid => "AUTH_SIGNATURE_INVALID",
            Self::AuthTokenExpired => "AUTH_TOKEN_EXPIRED",
            Self::AuthIssuerMismatch => "AUTH_ISSUER_MISMATCH",
            Self::AuthAudienceMismatch => "AUTH_AUDIENCE_MISMATCH",
            Self::MaxConnectionsExceeded => "MAX_CONNECTIONS_EXCEEDED",
            Self::AlreadyJoined => "ALREADY_JOINED",
            Self::NotInResource => "NOT_IN_RESOURCE",
            Self::ConnectionNotActive => "CONNECTION_NOT_ACTIVE",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::UnsupportedMessage => "UNSUPPORTED_MESSAGE",
            Self::ServerShuttingDown => "SERVER_SHUTTING_DOWN",
            Self::NotFound => "NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::AuthMissingToken
            | Self::AuthMalformedToken
            | Self::AuthSignatureInvalid
            | Self::AuthTokenExpired
            | Self::AuthIssuerMismatch
            | Self::AuthAudienceMismatch => StatusCode::UNAUTHORIZED,
            Self::MaxConnectionsExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::AlreadyJoined => StatusCode::CONFLICT,
            Self::NotInResource | Self::NotFound => StatusCode::NOT_FOUND,
            Self::ConnectionNotActive => StatusCode::GONE,
            Self::InvalidMessage | Self::UnsupportedMessage => StatusCode::BAD_REQUEST,
            Self::ServerShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only transient server conditions are worth a client retry; the gateway
    /// itself never retries anything.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::ServerShuttingDown | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::AuthMissingToken => "missing JWT in handshake",
            Self::AuthMalformedToken => "invalid JWT: malformed token",
            Self::AuthSignatureInvalid => "invalid JWT: signature verification failed",
            Self::AuthTokenExpired => "JWT expired",
            Self::AuthIssuerMismatch => "invalid JWT: issuer mismatch",
            Self::AuthAudienceMismatch => "invalid JWT: audience mismatch",
            Self::MaxConnectionsExceeded => "maximum connections per user reached",
            Self::AlreadyJoined => "User already joined this resource",
            Self::NotInResource => "User is not in this resource",
            Self::ConnectionNotActive => "connection is not active",
            Self::InvalidMessage => "invalid websocket frame payload",
            Self::UnsupportedMessage => "message type is not accepted from clients",
            Self::ServerShuttingDown => "server is shutting down",
            Self::NotFound => "requested resource not found",
            Self::InternalError => "internal server error",
        }
    }
}

impl From<&AuthError> for ErrorCode {
    fn from(error: &AuthError) -> Self {
        match error {
            AuthError::MissingToken => Self::AuthMissingToken,
            AuthError::MalformedToken => Self::AuthMalformedToken,
            AuthError::SignatureInvalid => Self::AuthSignatureInvalid,
            AuthError::Expired => Self::AuthTokenExpired,
            AuthError::IssuerMismatch => Self::AuthIssuerMismatch,
            AuthError::AudienceMismatch => Self::AuthAudienceMismatch,
        }
    }
}

impl From<&CapacityError> for ErrorCode {
    fn from(error: &CapacityError) -> Self {
        match error {
            CapacityError::MaxConnectionsExceeded { .. } => Self::MaxConnectionsExceeded,
        }
    }
}

impl From<&AdmitError> for ErrorCode {
    fn from(error: &AdmitError) -> Self {
        match error {
            AdmitError::Capacity(error) => Self::from(error),
            AdmitError::ShuttingDown => Self::ServerShuttingDown,
            AdmitError::Registry(_) => Self::InternalError,
        }
    }
}

impl From<&PresenceError> for ErrorCode {
    fn from(error: &PresenceError) -> Self {
        match error {
            PresenceError::AlreadyJoined => Self::AlreadyJoined,
            PresenceError::NotInResource => Self::NotInResource,
            PresenceError::ConnectionNotActive => Self::ConnectionNotActive,
        }
    }
}

/// HTTP-facing error body, rendered as
/// `{"error": {"code", "message", "retryable", "details"}}`.
#[derive(Debug, Clone)]
pub struct GatewayError {
    code: ErrorCode,
    message: String,
    details: Value,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}) }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }
}

impl From<AuthError> for GatewayError {
    fn from(error: AuthError) -> Self {
        Self::new(ErrorCode::from(&error), error.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "details": self.details,
                }
            })),
        )
            .into_response()
    }
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

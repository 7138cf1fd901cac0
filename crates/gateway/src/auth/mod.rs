pub mod handshake;
pub mod jwt;

pub use jwt::{IdentityClaim, JwtTokenVerifier};

use thiserror::Error;

/// Why a handshake credential was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing JWT in handshake")]
    MissingToken,
    #[error("invalid JWT: malformed token")]
    MalformedToken,
    #[error("invalid JWT: signature verification failed")]
    SignatureInvalid,
    #[error("JWT expired")]
    Expired,
    #[error("invalid JWT: issuer mismatch")]
    IssuerMismatch,
    #[error("invalid JWT: audience mismatch")]
    AudienceMismatch,
}

/// Opaque credential check performed before a connection is admitted.
///
/// Implementations must be pure: no side effects and no state carried
/// between calls.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<IdentityClaim, AuthError>;
}

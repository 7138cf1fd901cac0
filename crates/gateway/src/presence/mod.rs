pub mod registry;
pub mod session;

pub use registry::{Participant, PresenceRegistry};
pub use session::ResourceSessionHandler;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("User already joined this resource")]
    AlreadyJoined,
    #[error("User is not in this resource")]
    NotInResource,
    #[error("connection is not active")]
    ConnectionNotActive,
}

//! Errors surfaced by the messaging core
//!
//! Transport and protocol failures are handled inside the connector and never
//! appear here. What remains is what a caller can act on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    /// No identity configured. The only error that needs the user's attention.
    #[error("Not logged in. Run `social-chat login <email>` first.")]
    NotLoggedIn,

    #[error("Cannot send an empty message")]
    EmptyMessage,

    #[error("Failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MessagingError>;

#![forbid(unsafe_code)]

// Error taxonomy for room, voice, and attachment operations.
// Every variant is recoverable and local to the triggering request: it is
// reported to the sender and never tears down the connection or other rooms.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Invalid data: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Incorrect password")]
    Unauthorized,

    #[error("Only the room creator may do that")]
    Forbidden,

    #[error("Room already exists")]
    Conflict,

    #[error("Not in a room")]
    NotInRoom,

    #[error("File too large (max {max} bytes)")]
    TooLarge { max: u64 },

    #[error("File type not allowed: {0}")]
    TypeRejected(String),

    #[error("File payload is corrupt or empty")]
    Corrupt,

    #[error("Peer cannot consume this producer")]
    Incompatible,

    #[error("Voice unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Failed to store file: {0}")]
    StorageFailed(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

#![forbid(unsafe_code)]

// ephemchat library - ephemeral password-protected chat rooms with live voice

pub mod attachments;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod room;
pub mod sanitize;
pub mod sfu;
pub mod signaling;

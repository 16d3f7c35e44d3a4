// =============================================================================
// Session Module — the subscription multiplexer for long-lived client sessions
// =============================================================================

pub mod filters;
pub mod hub;

pub use hub::{SessionHub, SessionId};

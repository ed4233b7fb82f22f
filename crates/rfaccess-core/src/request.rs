//! Program requests

use std::time::SystemTime;

use crate::payload::CardPayload;

/// A request to program one card
///
/// Produced by the handoff resolver or fetched from the record store.
/// Immutable; a successful programming session consumes it exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramRequest {
    id: String,
    payload: CardPayload,
    issued_at: SystemTime,
}

impl ProgramRequest {
    /// Create a request
    pub fn new(id: impl Into<String>, payload: CardPayload, issued_at: SystemTime) -> Self {
        Self {
            id: id.into(),
            payload,
            issued_at,
        }
    }

    /// Opaque request id (what the record store marks as consumed)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// What to write onto the card
    pub fn payload(&self) -> &CardPayload {
        &self.payload
    }

    /// When the request was issued
    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }
}

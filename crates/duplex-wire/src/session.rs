//! The single live dialogue session on a connection.

use std::time::{Duration, Instant};
use uuid::Uuid;

/// Session bookkeeping shared by the transport writer and the receiver.
///
/// Exactly one `Session` exists per connection. A hot reset rotates `id` in place rather
/// than creating a second record, so every reader always sees the current id.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub created_at: Instant,
    pub active_until: Instant,
    /// False between `FinishSession` and the next `StartSession`.
    pub is_active: bool,
    /// A request was sent and the server has not yet closed its response.
    pub pending_response: bool,
    ttl: Duration,
}

impl Session {
    pub fn new(ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            active_until: now + ttl,
            is_active: false,
            pending_response: false,
            ttl,
        }
    }

    /// Replace the id with a fresh UUID. The session stays inactive until started.
    pub fn rotate(&mut self) -> Uuid {
        self.id = Uuid::new_v4();
        self.created_at = Instant::now();
        self.is_active = false;
        self.pending_response = false;
        self.touch();
        self.id
    }

    /// Extend the activity deadline by the configured ttl.
    pub fn touch(&mut self) {
        self.active_until = Instant::now() + self.ttl;
    }

    pub fn id_string(&self) -> String {
        self.id.to_string()
    }
}

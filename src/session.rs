use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Relaying,
    Closing,
    Closed,
}

/// Bookkeeping for one client paired with one upstream connection.
pub struct SmtpSession {
    pub id: u64,
    pub client_addr: SocketAddr,
    pub started: Instant,
    state: SessionState,
}

impl SmtpSession {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            client_addr,
            started: Instant::now(),
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves forward only; a session never goes back to an earlier state.
    pub fn advance(&mut self, next: SessionState) {
        let allowed = matches!(
            (self.state, next),
            (SessionState::Connecting, SessionState::Relaying)
                | (SessionState::Connecting, SessionState::Closing)
                | (SessionState::Relaying, SessionState::Closing)
                | (SessionState::Closing, SessionState::Closed)
        );
        if allowed {
            self.state = next;
        }
    }
}

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Handshake step at which the upstream server answered unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Greeting,
    Helo,
    StartTls,
}

impl std::fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Greeting => write!(f, "greeting"),
            Self::Helo => write!(f, "HELO"),
            Self::StartTls => write!(f, "STARTTLS"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("SMTP server did not accept the {stage} step: {reply:?}")]
    Handshake { stage: HandshakeStage, reply: String },

    #[error("TLS handshake failed: {0}")]
    Tls(io::Error),

    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("unable to connect to SMTP server {host}:{port} after {elapsed:?}")]
    Timeout {
        host: String,
        port: u16,
        elapsed: Duration,
        #[source]
        source: Box<ProxyError>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// How a failure is treated by the component that observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Handshake,
    Timeout,
    /// Anything else. Logged at error severity, contained to one session.
    Unexpected,
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(e) | Self::Tls(e) => io_kind(e),
            Self::Handshake { .. } => ErrorKind::Handshake,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidServerName(_) | Self::Config(_) | Self::Bind { .. } => {
                ErrorKind::Unexpected
            }
        }
    }

    pub fn handshake(stage: HandshakeStage, reply: impl Into<String>) -> Self {
        Self::Handshake {
            stage,
            reply: reply.into(),
        }
    }
}

pub fn io_kind(e: &io::Error) -> ErrorKind {
    if is_transient(e) {
        ErrorKind::Transient
    } else {
        ErrorKind::Unexpected
    }
}

pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

pub type Result<T> = std::result::Result<T, ProxyError>;

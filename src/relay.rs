use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::is_transient;
use crate::utils::{Level, Logger};

/// Upper bound for sending close_notify / FIN once a session is over.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    fn label(&self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "Client sent",
            Direction::UpstreamToClient => "SMTP server sent",
        }
    }
}

/// Why a relay session ended. Only the first cause is kept.
#[derive(Debug)]
pub enum Termination {
    ClientClosed,
    UpstreamClosed,
    Shutdown,
    Transport { direction: Direction, error: io::Error },
    Fault { direction: Direction, message: String },
}

impl Termination {
    pub fn level(&self) -> Level {
        match self {
            Termination::ClientClosed | Termination::UpstreamClosed | Termination::Shutdown => {
                Level::Info
            }
            Termination::Transport { error, .. } if is_transient(error) => Level::Info,
            Termination::Transport { .. } | Termination::Fault { .. } => Level::Error,
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::ClientClosed => write!(f, "client closed the connection"),
            Termination::UpstreamClosed => write!(f, "SMTP server closed the connection"),
            Termination::Shutdown => write!(f, "proxy shutting down"),
            Termination::Transport { direction, error } => {
                write!(f, "{:?} transport error ({:?}): {}", direction, error.kind(), error)
            }
            Termination::Fault { direction, message } => {
                write!(f, "{:?} pump failed: {}", direction, message)
            }
        }
    }
}

#[derive(Debug)]
pub struct RelayReport {
    pub termination: Termination,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

enum PumpEnd {
    PeerClosed,
    Stopped,
    Failed(io::Error),
}

struct Pumped<R, W> {
    reader: ReadHalf<R>,
    writer: WriteHalf<W>,
    end: PumpEnd,
    bytes: u64,
}

/// Copies bytes between a client and its upstream until either side is done.
#[derive(Clone)]
pub struct RelayEngine {
    buffer_size: usize,
    logger: Arc<Logger>,
}

impl RelayEngine {
    pub fn new(buffer_size: usize, logger: Arc<Logger>) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            logger,
        }
    }

    /// Runs one pump per direction and closes both channels once before returning.
    pub async fn relay<C, U>(
        &self,
        client: C,
        upstream: U,
        shutdown: &CancellationToken,
        peer: SocketAddr,
    ) -> RelayReport
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        U: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // Fired by whichever pump stops first, or by the shutdown token.
        let ended = shutdown.child_token();

        let (client_read, client_write) = split(client);
        let (upstream_read, upstream_write) = split(upstream);

        let upward = tokio::spawn(pump(
            client_read,
            upstream_write,
            Direction::ClientToUpstream,
            ended.clone(),
            self.buffer_size,
            self.logger.clone(),
            peer,
        ));
        let downward = tokio::spawn(pump(
            upstream_read,
            client_write,
            Direction::UpstreamToClient,
            ended.clone(),
            self.buffer_size,
            self.logger.clone(),
            peer,
        ));

        let (upward, downward) = tokio::join!(upward, downward);

        match (upward, downward) {
            (Ok(up), Ok(down)) => {
                let client = up.reader.unsplit(down.writer);
                let upstream = down.reader.unsplit(up.writer);
                close(client).await;
                close(upstream).await;

                RelayReport {
                    termination: first_cause(up.end, down.end),
                    client_to_upstream: up.bytes,
                    upstream_to_client: down.bytes,
                }
            }
            (up, down) => {
                // A pump panicked. Its halves were dropped while unwinding; dropping
                // the survivor's halves here releases both sockets.
                let direction = if up.is_err() {
                    Direction::ClientToUpstream
                } else {
                    Direction::UpstreamToClient
                };
                let message = up
                    .as_ref()
                    .err()
                    .or(down.as_ref().err())
                    .map_or_else(String::new, |e| e.to_string());
                RelayReport {
                    termination: Termination::Fault { direction, message },
                    client_to_upstream: up.as_ref().map_or(0, |p| p.bytes),
                    upstream_to_client: down.as_ref().map_or(0, |p| p.bytes),
                }
            }
        }
    }
}

async fn pump<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    direction: Direction,
    ended: CancellationToken,
    buffer_size: usize,
    logger: Arc<Logger>,
    peer: SocketAddr,
) -> Pumped<R, W>
where
    R: AsyncRead + AsyncWrite,
    W: AsyncRead + AsyncWrite,
{
    // Ends the session on every exit, unwinding included.
    let _ended_guard = ended.clone().drop_guard();

    let mut buf = vec![0u8; buffer_size];
    let mut bytes = 0u64;

    let end = loop {
        let read = tokio::select! {
            biased;
            _ = ended.cancelled() => break PumpEnd::Stopped,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break PumpEnd::PeerClosed,
            Ok(n) => n,
            Err(e) => break PumpEnd::Failed(e),
        };

        let written = tokio::select! {
            biased;
            _ = ended.cancelled() => break PumpEnd::Stopped,
            written = write_through(&mut writer, &buf[..n]) => written,
        };
        if let Err(e) = written {
            break PumpEnd::Failed(e);
        }

        bytes += n as u64;
        logger.log_payload(&peer, direction.label(), &buf[..n]).await;
    };

    Pumped {
        reader,
        writer,
        end,
        bytes,
    }
}

async fn write_through<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

async fn close<S: AsyncWrite + Unpin>(mut stream: S) {
    let _ = time::timeout(CLOSE_GRACE, stream.shutdown()).await;
}

fn first_cause(up: PumpEnd, down: PumpEnd) -> Termination {
    match (up, down) {
        (PumpEnd::PeerClosed, _) => Termination::ClientClosed,
        (PumpEnd::Failed(error), _) => Termination::Transport {
            direction: Direction::ClientToUpstream,
            error,
        },
        (_, PumpEnd::PeerClosed) => Termination::UpstreamClosed,
        (_, PumpEnd::Failed(error)) => Termination::Transport {
            direction: Direction::UpstreamToClient,
            error,
        },
        (PumpEnd::Stopped, PumpEnd::Stopped) => Termination::Shutdown,
    }
}

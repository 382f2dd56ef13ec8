use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, ProxyError};
use crate::relay::{RelayEngine, RelayReport};
use crate::session::{SessionState, SmtpSession};
use crate::upstream::UpstreamConnector;
use crate::utils::{Level, Logger};

const EOL: &[u8] = b"\r\n";

/// How a client session ended, as seen by the listener.
#[derive(Debug)]
pub enum Outcome {
    Relayed(RelayReport),
    /// The upstream could not be reached; the client got no reply.
    UpstreamUnavailable(ProxyError),
    Cancelled,
    ClientGone(ProxyError),
}

/// Drives one accepted client socket from connect to close.
#[derive(Clone)]
pub struct ConnectionHandler {
    connector: UpstreamConnector,
    relay: RelayEngine,
    shutdown: CancellationToken,
    logger: Arc<Logger>,
}

impl ConnectionHandler {
    pub fn new(
        connector: UpstreamConnector,
        relay: RelayEngine,
        shutdown: CancellationToken,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            connector,
            relay,
            shutdown,
            logger,
        }
    }

    /// Both sockets are owned here and released before this returns, on every path.
    pub async fn handle(&self, mut client: TcpStream, client_addr: SocketAddr) -> Outcome {
        let mut session = SmtpSession::new(client_addr);
        self.logger
            .log_peer(
                Level::Info,
                &client_addr,
                &format!("Session {} opened", session.id),
            )
            .await;

        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            connected = self.connector.connect() => Some(connected),
        };

        let outcome = match connected {
            None => {
                session.advance(SessionState::Closing);
                let _ = client.shutdown().await;
                Outcome::Cancelled
            }
            Some(Err(e)) => {
                session.advance(SessionState::Closing);
                self.logger
                    .log_peer(
                        Level::Error,
                        &client_addr,
                        &format!("Dropping session {}: {}", session.id, e),
                    )
                    .await;
                let _ = client.shutdown().await;
                Outcome::UpstreamUnavailable(e)
            }
            Some(Ok(upstream)) => {
                let mut greeting = upstream.greeting.clone().into_bytes();
                greeting.extend_from_slice(EOL);

                match write_greeting(&mut client, &greeting).await {
                    Err(e) => {
                        session.advance(SessionState::Closing);
                        let _ = client.shutdown().await;
                        Outcome::ClientGone(e)
                    }
                    Ok(()) => {
                        session.advance(SessionState::Relaying);
                        let report = self
                            .relay
                            .relay(client, upstream.stream, &self.shutdown, client_addr)
                            .await;
                        session.advance(SessionState::Closing);
                        Outcome::Relayed(report)
                    }
                }
            }
        };

        session.advance(SessionState::Closed);
        self.log_outcome(&session, &outcome).await;
        outcome
    }

    async fn log_outcome(&self, session: &SmtpSession, outcome: &Outcome) {
        let (level, message) = match outcome {
            Outcome::Relayed(report) => (
                report.termination.level(),
                format!(
                    "Session {} closed after {:?}: {} ({} bytes up, {} bytes down)",
                    session.id,
                    session.started.elapsed(),
                    report.termination,
                    report.client_to_upstream,
                    report.upstream_to_client
                ),
            ),
            Outcome::UpstreamUnavailable(e) => (
                Level::Info,
                format!(
                    "Session {} closed without reaching the SMTP server ({:?})",
                    session.id,
                    e.kind()
                ),
            ),
            Outcome::Cancelled => (
                Level::Info,
                format!("Session {} closed: proxy shutting down", session.id),
            ),
            Outcome::ClientGone(e) => (
                if e.kind() == ErrorKind::Transient {
                    Level::Info
                } else {
                    Level::Error
                },
                format!("Session {} closed before the greeting was sent: {}", session.id, e),
            ),
        };
        self.logger
            .log_peer(level, &session.client_addr, &message)
            .await;
    }
}

async fn write_greeting(client: &mut TcpStream, greeting: &[u8]) -> Result<(), ProxyError> {
    client.write_all(greeting).await?;
    client.flush().await?;
    Ok(())
}

#[cfg(test)]
impl Outcome {
    pub fn termination(&self) -> Option<&crate::relay::Termination> {
        match self {
            Outcome::Relayed(report) => Some(&report.termination),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Termination;
    use crate::testutil::{closed_port, read_exact_timeout, read_to_eof, FakeUpstream, Script, TestCert};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accepts one client through a real socket pair and hands it to a handler task.
    async fn serve_one(
        handler: ConnectionHandler,
    ) -> (TcpStream, JoinHandle<Outcome>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, addr) = listener.accept().await.unwrap();
        let task = tokio::spawn(async move { handler.handle(accepted, addr).await });
        (client, task)
    }

    fn handler_for(
        config: crate::config::ProxyConfig,
        cert: &TestCert,
        shutdown: CancellationToken,
        logger: Arc<Logger>,
    ) -> ConnectionHandler {
        let config = Arc::new(config);
        let connector =
            UpstreamConnector::new(config.clone(), cert.client_config(), logger.clone()).unwrap();
        let relay = RelayEngine::new(config.buffer_size, logger.clone());
        ConnectionHandler::new(connector, relay, shutdown, logger)
    }

    #[tokio::test]
    async fn client_sees_greeting_then_relays() {
        let cert = TestCert::localhost();
        let mut upstream = FakeUpstream::spawn(&cert, Script::default()).await;
        let logger = Arc::new(Logger::capture(true));
        let handler = handler_for(upstream.config(), &cert, CancellationToken::new(), logger.clone());

        let (mut client, task) = serve_one(handler).await;

        let greeting = b"220 smtp.example.com Ready\r\n";
        assert_eq!(read_exact_timeout(&mut client, greeting.len()).await, greeting);

        let mut server = upstream.next_session().await;
        client.write_all(b"MAIL FROM:<a@b.com>\r\n").await.unwrap();
        assert_eq!(read_exact_timeout(&mut server, 21).await, b"MAIL FROM:<a@b.com>\r\n");

        server.write_all(b"250 OK\r\n").await.unwrap();
        server.flush().await.unwrap();
        assert_eq!(read_exact_timeout(&mut client, 8).await, b"250 OK\r\n");

        drop(client);
        let outcome = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(outcome.termination(), Some(Termination::ClientClosed)));

        // The upstream side sees the session end with nothing more sent.
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), server.read_to_end(&mut rest)).await;
        assert!(rest.is_empty());

        let lines = logger.captured().await;
        assert!(lines.iter().any(|l| l.contains("21 bytes up, 8 bytes down")));
    }

    #[tokio::test]
    async fn unreachable_upstream_closes_client_silently() {
        let cert = TestCert::localhost();
        let addr = closed_port().await;
        let mut config = crate::config::ProxyConfig::new("localhost");
        config.upstream_port = addr.port();
        config.retry_interval = Duration::from_millis(50);
        config.connect_deadline = Duration::from_millis(250);
        let handler = handler_for(config, &cert, CancellationToken::new(), Arc::new(Logger::capture(true)));

        let (mut client, task) = serve_one(handler).await;
        assert!(read_to_eof(&mut client).await.is_empty());

        let outcome = task.await.unwrap();
        match outcome {
            Outcome::UpstreamUnavailable(e) => assert_eq!(e.kind(), ErrorKind::Timeout),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_during_connect_drops_client() {
        let cert = TestCert::localhost();
        let addr = closed_port().await;
        let mut config = crate::config::ProxyConfig::new("localhost");
        config.upstream_port = addr.port();
        config.retry_interval = Duration::from_millis(50);
        let shutdown = CancellationToken::new();
        let handler = handler_for(config, &cert, shutdown.clone(), Arc::new(Logger::capture(true)));

        let (mut client, task) = serve_one(handler).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Cancelled));
        assert!(read_to_eof(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_ends_an_idle_relay() {
        let cert = TestCert::localhost();
        let mut upstream = FakeUpstream::spawn(&cert, Script::default()).await;
        let shutdown = CancellationToken::new();
        let handler = handler_for(upstream.config(), &cert, shutdown.clone(), Arc::new(Logger::capture(true)));

        let (mut client, task) = serve_one(handler).await;
        let _ = read_exact_timeout(&mut client, 28).await;
        let _server = upstream.next_session().await;

        shutdown.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(outcome.termination(), Some(Termination::Shutdown)));
        assert!(read_to_eof(&mut client).await.is_empty());
    }
}

use std::io;
use std::sync::Arc;

use rustls::{ClientConfig, ServerName};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::ProxyConfig;
use crate::error::{HandshakeStage, ProxyError, Result};
use crate::utils::{Level, Logger};

const EOL: &str = "\r\n";

/// RFC 5321 reply line limit, CRLF included.
const MAX_REPLY_LINE: u64 = 1000;

/// Upstream session after a successful STARTTLS upgrade.
pub struct UpstreamConnection {
    /// First reply line of the server, without its CRLF.
    pub greeting: String,
    pub stream: TlsStream<TcpStream>,
}

/// Dials the real SMTP server and upgrades the session with STARTTLS.
#[derive(Clone)]
pub struct UpstreamConnector {
    config: Arc<ProxyConfig>,
    server_name: ServerName,
    tls: TlsConnector,
    logger: Arc<Logger>,
}

impl UpstreamConnector {
    pub fn new(config: Arc<ProxyConfig>, tls: Arc<ClientConfig>, logger: Arc<Logger>) -> Result<Self> {
        let server_name = ServerName::try_from(config.upstream_host.as_str())
            .map_err(|_| ProxyError::InvalidServerName(config.upstream_host.clone()))?;
        Ok(Self {
            config,
            server_name,
            tls: TlsConnector::from(tls),
            logger,
        })
    }

    /// Retries dial and handshake failures alike until the connect deadline runs out.
    pub async fn connect(&self) -> Result<UpstreamConnection> {
        let started = Instant::now();
        let deadline = started + self.config.connect_deadline;
        let upstream = self.config.upstream_addr();
        let mut last_error = None;

        while Instant::now() < deadline {
            self.logger
                .log(Level::Info, &format!("Connecting to SMTP server {}", upstream))
                .await;

            let failure = match time::timeout_at(deadline, self.attempt()).await {
                Ok(Ok(connection)) => {
                    self.logger
                        .log(
                            Level::Info,
                            &format!(
                                "Secure session with {} established: {}",
                                upstream, connection.greeting
                            ),
                        )
                        .await;
                    return Ok(connection);
                }
                Ok(Err(e)) => e,
                Err(_) => ProxyError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect attempt did not finish before the deadline",
                )),
            };

            self.logger
                .log(
                    Level::Warning,
                    &format!("Failed to connect to SMTP server {}: {}", upstream, failure),
                )
                .await;
            last_error = Some(failure);

            time::sleep_until((Instant::now() + self.config.retry_interval).min(deadline)).await;
        }

        self.logger
            .log(
                Level::Critical,
                &format!(
                    "Unable to connect to SMTP server {} within {:?}",
                    upstream, self.config.connect_deadline
                ),
            )
            .await;

        let source = last_error.unwrap_or_else(|| {
            ProxyError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "no connect attempt was made",
            ))
        });
        Err(ProxyError::Timeout {
            host: self.config.upstream_host.clone(),
            port: self.config.upstream_port,
            elapsed: started.elapsed(),
            source: Box::new(source),
        })
    }

    async fn attempt(&self) -> Result<UpstreamConnection> {
        let stream = TcpStream::connect(self.config.upstream_addr()).await?;
        if let Err(e) = stream.set_nodelay(true) {
            self.logger
                .log(Level::Debug, &format!("TCP_NODELAY not set on upstream socket: {}", e))
                .await;
        }

        let mut reader = BufReader::new(stream);
        let greeting = negotiate_starttls(&mut reader, &self.config.helo_name).await?;
        if !reader.buffer().is_empty() {
            return Err(ProxyError::handshake(
                HandshakeStage::StartTls,
                "unexpected data before TLS handshake",
            ));
        }

        let stream = self
            .tls
            .connect(self.server_name.clone(), reader.into_inner())
            .await
            .map_err(ProxyError::Tls)?;

        Ok(UpstreamConnection { greeting, stream })
    }
}

/// Plaintext pre-TLS dialogue: greeting, HELO, STARTTLS. Returns the greeting line.
pub async fn negotiate_starttls<S>(stream: &mut BufReader<S>, helo_name: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = read_reply(stream, HandshakeStage::Greeting, "220 ").await?;

    send_command(stream, &format!("HELO {}", helo_name)).await?;
    read_reply(stream, HandshakeStage::Helo, "250 ").await?;

    send_command(stream, "STARTTLS").await?;
    read_reply(stream, HandshakeStage::StartTls, "220 ").await?;

    Ok(greeting)
}

async fn send_command<S>(stream: &mut BufReader<S>, command: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = format!("{}{}", command, EOL);
    let writer = stream.get_mut();
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_reply<S>(stream: &mut BufReader<S>, stage: HandshakeStage, prefix: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut raw = Vec::new();
    let read = (&mut *stream)
        .take(MAX_REPLY_LINE)
        .read_until(b'\n', &mut raw)
        .await?;
    if read == 0 {
        return Err(ProxyError::handshake(stage, "connection closed"));
    }
    if raw.last() != Some(&b'\n') {
        return Err(ProxyError::handshake(stage, "reply line too long or truncated"));
    }

    let line = String::from_utf8_lossy(&raw)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    if !line.starts_with(prefix) {
        return Err(ProxyError::handshake(stage, line));
    }
    Ok(line)
}

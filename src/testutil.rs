//! Scripted SMTP upstream used by the connector, handler and listener tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::ProxyConfig;

pub struct TestCert {
    pub cert: Certificate,
    pub key: PrivateKey,
}

impl TestCert {
    pub fn localhost() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        Self {
            cert: Certificate(cert.serialize_der().unwrap()),
            key: PrivateKey(cert.serialize_private_key_der()),
        }
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], self.key.clone())
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(&self.cert).unwrap();
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Arc::new(config)
    }
}

/// Replies the fake upstream gives to the greeting, HELO and STARTTLS steps.
#[derive(Clone)]
pub struct Script {
    pub greeting: &'static str,
    pub helo: &'static str,
    pub starttls: &'static str,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: "220 smtp.example.com Ready\r\n",
            helo: "250 Hello\r\n",
            starttls: "220 Go ahead\r\n",
        }
    }
}

/// A fake STARTTLS upstream. Every TLS session that completes is handed to the test.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub sessions: mpsc::UnboundedReceiver<TlsStream<TcpStream>>,
    pub helo_lines: mpsc::UnboundedReceiver<String>,
}

impl FakeUpstream {
    pub async fn spawn(cert: &TestCert, script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = cert.acceptor();
        let (session_tx, sessions) = mpsc::unbounded_channel();
        let (helo_tx, helo_lines) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let script = script.clone();
                let session_tx = session_tx.clone();
                let helo_tx = helo_tx.clone();
                tokio::spawn(async move {
                    if let Some(tls) = serve(stream, acceptor, script, helo_tx).await {
                        let _ = session_tx.send(tls);
                    }
                });
            }
        });

        Self {
            addr,
            sessions,
            helo_lines,
        }
    }

    pub fn config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::new("localhost");
        config.listen_address = "127.0.0.1".to_string();
        config.listen_port = 0;
        config.upstream_port = self.addr.port();
        config.helo_name = "proxy.test".to_string();
        config.retry_interval = Duration::from_millis(50);
        config.connect_deadline = Duration::from_secs(5);
        config.drain_timeout = Duration::from_secs(2);
        config
    }

    pub async fn next_session(&mut self) -> TlsStream<TcpStream> {
        tokio::time::timeout(Duration::from_secs(5), self.sessions.recv())
            .await
            .expect("no upstream session")
            .expect("upstream closed")
    }
}

async fn serve(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    script: Script,
    helo_tx: mpsc::UnboundedSender<String>,
) -> Option<TlsStream<TcpStream>> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    reader.get_mut().write_all(script.greeting.as_bytes()).await.ok()?;
    if !script.greeting.starts_with("220 ") {
        return None;
    }

    reader.read_line(&mut line).await.ok()?;
    let _ = helo_tx.send(line.clone());
    reader.get_mut().write_all(script.helo.as_bytes()).await.ok()?;
    if !script.helo.starts_with("250 ") {
        return None;
    }

    line.clear();
    reader.read_line(&mut line).await.ok()?;
    if line != "STARTTLS\r\n" {
        return None;
    }
    reader.get_mut().write_all(script.starttls.as_bytes()).await.ok()?;
    if !script.starttls.starts_with("220 ") {
        return None;
    }

    acceptor.accept(reader.into_inner()).await.ok()
}

/// Address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub async fn read_exact_timeout<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

/// Reads until EOF and returns everything received.
pub async fn read_to_eof<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut buf))
        .await
        .expect("peer did not close");
    buf
}

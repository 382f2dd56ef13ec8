use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::ClientConfig;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ProxyConfig;
use crate::error::{is_transient, ProxyError, Result};
use crate::handler::ConnectionHandler;
use crate::relay::RelayEngine;
use crate::upstream::UpstreamConnector;
use crate::utils::{Level, Logger};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    accept_loop: JoinHandle<()>,
}

/// Accepts plaintext SMTP clients and relays each one to the upstream server.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    tls: Arc<ClientConfig>,
    logger: Arc<Logger>,
    running: Mutex<Option<Running>>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, tls: Arc<ClientConfig>, logger: Arc<Logger>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            tls,
            logger,
            running: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|r| r.local_addr)
    }

    /// Binds and starts the accept loop. Calling it while running returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let connector =
            UpstreamConnector::new(self.config.clone(), self.tls.clone(), self.logger.clone())?;

        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        {
            let mut running = self.lock_running();
            if let Some(existing) = running.as_ref() {
                // Lost a race with a concurrent start; our listener is dropped unused.
                return Ok(existing.local_addr);
            }

            let shutdown = CancellationToken::new();
            let sessions = TaskTracker::new();
            let handler = ConnectionHandler::new(
                connector,
                RelayEngine::new(self.config.buffer_size, self.logger.clone()),
                shutdown.clone(),
                self.logger.clone(),
            );

            let accept_loop = tokio::spawn(accept_loop(
                listener,
                handler,
                shutdown.clone(),
                sessions.clone(),
                self.logger.clone(),
            ));

            *running = Some(Running {
                local_addr,
                shutdown,
                sessions,
                accept_loop,
            });
        }

        self.logger
            .log(
                Level::Info,
                &format!(
                    "Listener started. Connections on {} will be forwarded to {}",
                    local_addr,
                    self.config.upstream_addr()
                ),
            )
            .await;

        Ok(local_addr)
    }

    /// Fires the shutdown signal, closes the listening socket and drains sessions.
    /// No session is dispatched once this returns. Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        let Some(running) = running else {
            return;
        };

        running.shutdown.cancel();
        if let Err(e) = running.accept_loop.await {
            self.logger
                .log(Level::Error, &format!("Accept loop ended abnormally: {}", e))
                .await;
        }

        running.sessions.close();
        if time::timeout(self.config.drain_timeout, running.sessions.wait())
            .await
            .is_err()
        {
            self.logger
                .log(
                    Level::Warning,
                    &format!(
                        "{} session(s) still open after {:?}",
                        running.sessions.len(),
                        self.config.drain_timeout
                    ),
                )
                .await;
        }

        self.logger
            .log(
                Level::Info,
                &format!("Listener on {} stopped", running.local_addr),
            )
            .await;
    }

    pub fn active_sessions(&self) -> usize {
        self.lock_running().as_ref().map_or(0, |r| r.sessions.len())
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        // The guarded value is always consistent, so a poisoned lock is still usable.
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().take() {
            running.shutdown.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: ConnectionHandler,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    logger: Arc<Logger>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, client_addr)) => {
                if shutdown.is_cancelled() {
                    break;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    logger
                        .log_peer(
                            Level::Debug,
                            &client_addr,
                            &format!("TCP_NODELAY not set on client socket: {}", e),
                        )
                        .await;
                }
                logger
                    .log_peer(Level::Info, &client_addr, "Connection accepted")
                    .await;

                let handler = handler.clone();
                sessions.spawn(async move {
                    handler.handle(stream, client_addr).await;
                });
            }
            Err(e) if is_transient(&e) => {
                // The peer gave up before we got to it.
                logger
                    .log(Level::Info, &format!("Ignoring aborted connection: {}", e))
                    .await;
            }
            Err(e) => {
                logger
                    .log(Level::Warning, &format!("Accept error: {}", e))
                    .await;
                time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    // Dropping the listener here closes the listening socket.
    drop(listener);
}

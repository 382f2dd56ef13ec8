mod config;
mod daemon;
mod error;
mod handler;
mod proxy;
mod relay;
mod session;
mod upstream;
mod utils;

#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;

use crate::config::ProxyConfig;
use crate::utils::{Level, Logger};

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-tls-proxy",
    about = "Relays plaintext SMTP clients to an SMTP server that requires STARTTLS"
)]
pub struct Opt {
    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// Pid file written in daemon mode
    #[structopt(long = "pid-file", default_value = "/tmp/smtp-tls-proxy.pid", parse(from_os_str))]
    pub pid_file: PathBuf,

    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "25")]
    pub port: u16,

    /// Listening address
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// SMTP server the traffic is forwarded to (e.g. smtp.live.com)
    #[structopt(long = "upstream-host")]
    pub upstream_host: String,

    /// SMTP server port
    #[structopt(long = "upstream-port", default_value = "587")]
    pub upstream_port: u16,

    /// Name sent with HELO (default: local host name)
    #[structopt(long = "helo")]
    pub helo: Option<String>,

    /// Pause between upstream connection attempts, in milliseconds
    #[structopt(long = "retry-interval-ms", default_value = "2500")]
    pub retry_interval_ms: u64,

    /// Give up on the upstream connection after this many seconds
    #[structopt(long = "connect-timeout-secs", default_value = "120")]
    pub connect_timeout_secs: u64,

    /// Relay buffer size in bytes
    #[structopt(long = "buffer-size", default_value = "512")]
    pub buffer_size: usize,

    /// Time given to open sessions to finish on shutdown, in seconds
    #[structopt(long = "drain-timeout-secs", default_value = "5")]
    pub drain_timeout_secs: u64,

    /// Extra PEM certificates trusted for the upstream TLS session
    #[structopt(long = "ca-file", parse(from_os_str))]
    pub ca_file: Option<PathBuf>,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - log relayed SMTP traffic
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}

impl Opt {
    fn proxy_config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::new(self.upstream_host.clone());
        config.listen_address = self.address.clone();
        config.listen_port = self.port;
        config.upstream_port = self.upstream_port;
        if let Some(helo) = &self.helo {
            config.helo_name = helo.clone();
        }
        config.retry_interval = Duration::from_millis(self.retry_interval_ms);
        config.connect_deadline = Duration::from_secs(self.connect_timeout_secs);
        config.buffer_size = self.buffer_size;
        config.drain_timeout = Duration::from_secs(self.drain_timeout_secs);
        config.ca_file = self.ca_file.clone();
        config.verbose = self.verbose;
        config
    }
}

fn main() {
    let opt = Opt::from_args();

    println!("==========================================");
    println!("SMTP TLS Proxy v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");

    if let Some(log_path) = &opt.log_file {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    eprintln!("[ERROR] Failed to create log directory {:?}: {}", parent, e);
                    std::process::exit(1);
                }
            }
        }
    }

    // Fork before any runtime thread exists.
    if opt.daemon {
        if let Err(e) = daemon::daemonize(&opt.pid_file) {
            eprintln!("[ERROR] {}", e);
            std::process::exit(1);
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("[ERROR] Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(opt)) {
        eprintln!("[ERROR] {:#}", e);
        std::process::exit(1);
    }
}

async fn run(opt: Opt) -> Result<()> {
    let config = opt.proxy_config();
    let logger = Arc::new(
        Logger::new(opt.log_file.clone(), config.verbose).context("Failed to open log file")?,
    );

    let server = match start(config, logger.clone()).await {
        Ok(server) => server,
        Err(e) => {
            logger
                .log(Level::Critical, &format!("Startup failed: {:#}", e))
                .await;
            return Err(e);
        }
    };

    logger
        .log(Level::Info, &format!("PID: {}", std::process::id()))
        .await;
    if logger.verbose() {
        logger
            .log(Level::Info, "Verbose mode: relayed traffic is logged")
            .await;
    }
    if !opt.daemon {
        println!("[INFO] Press Ctrl+C to stop");
    }

    wait_for_shutdown().await;
    logger
        .log(
            Level::Info,
            &format!(
                "Shutdown requested with {} session(s) open",
                server.active_sessions()
            ),
        )
        .await;
    server.stop().await;

    Ok(())
}

async fn start(config: ProxyConfig, logger: Arc<Logger>) -> Result<proxy::ProxyServer> {
    let tls = crate::config::build_tls_config(config.ca_file.as_deref())
        .context("Failed to build TLS settings")?;
    let server = proxy::ProxyServer::new(config, tls, logger).context("Invalid configuration")?;
    server.start().await.context("Failed to start listener")?;
    Ok(server)
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

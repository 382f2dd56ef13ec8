use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use rustls_pemfile::certs;

use crate::error::{ProxyError, Result};
use crate::utils;

pub const DEFAULT_LISTEN_PORT: u16 = 25;
pub const DEFAULT_UPSTREAM_PORT: u16 = 587;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(2500);
pub const DEFAULT_CONNECT_DEADLINE: Duration = Duration::from_secs(120);
pub const DEFAULT_BUFFER_SIZE: usize = 512;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub helo_name: String,
    pub retry_interval: Duration,
    pub connect_deadline: Duration,
    pub buffer_size: usize,
    pub drain_timeout: Duration,
    pub ca_file: Option<PathBuf>,
    pub verbose: bool,
}

impl ProxyConfig {
    pub fn new(upstream_host: impl Into<String>) -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            upstream_host: upstream_host.into(),
            upstream_port: DEFAULT_UPSTREAM_PORT,
            helo_name: utils::local_host_name(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            connect_deadline: DEFAULT_CONNECT_DEADLINE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            ca_file: None,
            verbose: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream_host.trim().is_empty() {
            return Err(ProxyError::Config("upstream host is empty".to_string()));
        }
        if ServerName::try_from(self.upstream_host.as_str()).is_err() {
            return Err(ProxyError::Config(format!(
                "upstream host is not a valid TLS server name: {:?}",
                self.upstream_host
            )));
        }
        if self.upstream_port == 0 {
            return Err(ProxyError::Config("upstream port must not be 0".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(ProxyError::Config("buffer size must not be 0".to_string()));
        }
        if self.connect_deadline.is_zero() {
            return Err(ProxyError::Config(
                "connect deadline must not be 0".to_string(),
            ));
        }
        if self.helo_name.trim().is_empty() || self.helo_name.contains(['\r', '\n']) {
            return Err(ProxyError::Config(format!(
                "invalid HELO name: {:?}",
                self.helo_name
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }

    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }
}

/// Client TLS settings for the upstream session: Mozilla roots plus an optional PEM bundle.
pub fn build_tls_config(ca_file: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    if let Some(path) = ca_file {
        let file = std::fs::File::open(path)
            .map_err(|e| ProxyError::Config(format!("failed to open {:?}: {}", path, e)))?;
        let mut reader = BufReader::new(file);
        let ders = certs(&mut reader)
            .map_err(|e| ProxyError::Config(format!("failed to parse {:?}: {}", path, e)))?;
        let (added, _ignored) = roots.add_parsable_certificates(&ders[..]);
        if added == 0 {
            return Err(ProxyError::Config(format!(
                "no usable certificate found in {:?}",
                path
            )));
        }
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let config = ProxyConfig::new("smtp.example.com");
        assert_eq!(config.retry_interval, Duration::from_millis(2500));
        assert_eq!(config.connect_deadline, Duration::from_secs(120));
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.upstream_addr(), "smtp.example.com:587");
        assert_eq!(config.listen_addr(), "0.0.0.0:25");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unusable_values() {
        let mut config = ProxyConfig::new("  ");
        assert!(config.validate().is_err());

        config.upstream_host = "bad host name".to_string();
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));

        config.upstream_host = "127.0.0.1".to_string();
        assert!(config.validate().is_ok());

        config.upstream_host = "smtp.example.com".to_string();
        config.buffer_size = 0;
        assert!(config.validate().is_err());

        config.buffer_size = 512;
        config.connect_deadline = Duration::ZERO;
        assert!(config.validate().is_err());

        config.connect_deadline = Duration::from_secs(1);
        config.helo_name = "host\r\nRCPT TO:<x>".to_string();
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn default_trust_store_builds() {
        assert!(build_tls_config(None).is_ok());
    }

    #[test]
    fn missing_ca_file_is_a_config_error() {
        let result = build_tls_config(Some(Path::new("/nonexistent/ca.pem")));
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn ca_file_certificates_are_loaded() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let path = std::env::temp_dir().join(format!("smtp-tls-proxy-ca-{}.pem", std::process::id()));
        std::fs::write(&path, cert.serialize_pem().unwrap()).unwrap();

        let result = build_tls_config(Some(&path));
        let _ = std::fs::remove_file(&path);
        assert!(result.is_ok());
    }
}

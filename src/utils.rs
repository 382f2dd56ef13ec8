use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keeps printable ASCII and whitespace only
pub fn filter_printable_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ' || *c == '\t')
        .collect()
}

/// Escapes CR, LF and other non-printable bytes so a payload fits on one log line
pub fn safe_log_bytes(input: &[u8]) -> String {
    let mut result = String::with_capacity(input.len());
    for &b in input {
        match b {
            b'\r' => result.push_str("\\r"),
            b'\n' => result.push_str("\\n"),
            b'\t' => result.push_str("\\t"),
            b'\\' => result.push_str("\\\\"),
            0x20..=0x7e => result.push(b as char),
            _ => result.push_str(&format!("\\x{:02x}", b)),
        }
    }
    result
}

/// Host name announced in HELO when none is configured
#[cfg(unix)]
pub fn local_host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes for the duration of the call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "localhost".to_string()
}

#[cfg(not(unix))]
pub fn local_host_name() -> String {
    std::env::var("COMPUTERNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }
}

enum Sink {
    Console {
        writer: Option<Arc<Mutex<BufWriter<File>>>>,
    },
    #[cfg_attr(not(test), allow(dead_code))]
    Capture(Arc<Mutex<Vec<String>>>),
}

/// Leveled log sink shared by every component as `Arc<Logger>`.
pub struct Logger {
    sink: Sink,
    verbose: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, verbose: bool) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            let file = OpenOptions::new().create(true).append(true).open(path)?;

            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        } else {
            None
        };

        Ok(Self {
            sink: Sink::Console { writer },
            verbose,
        })
    }

    /// Records lines in memory instead of printing them
    #[cfg(test)]
    pub fn capture(verbose: bool) -> Self {
        Self {
            sink: Sink::Capture(Arc::new(Mutex::new(Vec::new()))),
            verbose,
        }
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub async fn log(&self, level: Level, message: &str) {
        self.write(level, None, message).await;
    }

    pub async fn log_peer(&self, level: Level, peer: &SocketAddr, message: &str) {
        self.write(level, Some(peer), message).await;
    }

    /// Dumps relayed bytes when verbose mode is on
    pub async fn log_payload(&self, peer: &SocketAddr, title: &str, payload: &[u8]) {
        if !self.verbose {
            return;
        }
        let message = format!("{} ({} bytes): {}", title, payload.len(), safe_log_bytes(payload));
        self.write(Level::Debug, Some(peer), &message).await;
    }

    async fn write(&self, level: Level, peer: Option<&SocketAddr>, message: &str) {
        if level == Level::Debug && !self.verbose {
            return;
        }

        let peer = peer.map_or_else(|| "-".to_string(), |p| p.to_string());
        let line = format!(
            "{} {} {} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level.as_str(),
            peer,
            message
        );

        match &self.sink {
            Sink::Console { writer } => {
                println!("{}", filter_printable_chars(&line));

                if let Some(writer) = writer {
                    let mut writer = writer.lock().await;
                    let _ = writeln!(writer, "{}", safe_log_bytes(line.as_bytes()));
                    let _ = writer.flush();
                }
            }
            Sink::Capture(lines) => {
                lines.lock().await.push(line);
            }
        }
    }

    #[cfg(test)]
    pub async fn captured(&self) -> Vec<String> {
        match &self.sink {
            Sink::Capture(lines) => lines.lock().await.clone(),
            Sink::Console { .. } => Vec::new(),
        }
    }

    #[cfg(test)]
    pub async fn count(&self, level: Level) -> usize {
        let tag = format!(" {} ", level.as_str());
        self.captured()
            .await
            .iter()
            .filter(|line| line.contains(&tag))
            .count()
    }
}

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::error::{Result, TftpError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Consecutive timeouts tolerated before a transfer is abandoned
    pub retries: u8,
    /// Retransmission timeout unless the client negotiates one
    pub timeout_secs: u8,
    pub workers: usize,
    pub sessions_per_worker: usize,
    pub load_balance: LoadBalanceStrategy,
    /// Honour `timeout=adaptive` requests (RFC 6298 estimation)
    pub adaptive_timeout: bool,
    /// Period of the server statistics record, 0 disables it
    pub stats_interval_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/owl-tftpd"),
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 69),
            retries: 5,
            timeout_secs: 2,
            workers: num_cpus::get(),
            sessions_per_worker: 256,
            load_balance: LoadBalanceStrategy::LeastBusy,
            adaptive_timeout: false,
            stats_interval_secs: 0,
            logging: LoggingConfig::default(),
        }
    }
}

/// How new sessions are spread over workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Fewest sessions checked out, preferring a fully idle worker
    LeastBusy,
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    /// One JSON object per line, for log aggregators
    Json,
}

pub fn load_config(path: &Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Tftp(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Tftp(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Check a configuration before serving with it. With `validate_bind` the
/// listen address is also test-bound.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Tftp(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Tftp("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Tftp(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::Tftp(format!("root_dir is not readable: {}", e)));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::Tftp(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::Tftp(format!(
            "bind_addr is not available: {}",
            e
        )));
    }

    if config.timeout_secs == 0 {
        return Err(TftpError::Tftp(
            "timeout_secs must be in range 1-255".to_string(),
        ));
    }

    if config.workers == 0 {
        return Err(TftpError::Tftp("workers must be at least 1".to_string()));
    }

    if !(1..=usize::from(u16::MAX)).contains(&config.sessions_per_worker) {
        return Err(TftpError::Tftp(
            "sessions_per_worker must be in range 1-65535".to_string(),
        ));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Tftp("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Tftp(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => return Err(TftpError::Tftp(format!("logging.file parent error: {}", e))),
        }
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| TftpError::Tftp(format!("logging.file not writable: {}", e)))?;
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::io::Result<PathBuf> {
        let mut dir = std::env::temp_dir();
        dir.push(format!("owl_tftpd_test_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn expect_error(config: &TftpConfig, needle: &str) -> std::result::Result<(), Box<dyn std::error::Error>> {
        match validate_config(config, false) {
            Ok(()) => Err(format!("expected error containing '{needle}'").into()),
            Err(err) => {
                assert!(format!("{err}").contains(needle), "unexpected error: {err}");
                Ok(())
            }
        }
    }

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root_dir = temp_dir("parse")?;
        let log_dir = temp_dir("parse_log")?;
        let toml = format!(
            r#"
root_dir = "{}"
bind_addr = "127.0.0.1:6969"
load_balance = "round_robin"

[logging]
format = "json"
file = "{}/tftp.log"
"#,
            root_dir.display(),
            log_dir.display()
        );
        let config: TftpConfig = toml::from_str(&toml)?;
        assert_eq!(config.retries, 5);
        assert_eq!(config.timeout_secs, 2);
        assert_eq!(config.sessions_per_worker, 256);
        assert_eq!(config.load_balance, LoadBalanceStrategy::RoundRobin);
        assert_eq!(config.logging.format, LogFormat::Json);
        validate_config(&config, false)?;
        Ok(())
    }

    #[test]
    fn written_config_loads_back() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = temp_dir("roundtrip")?;
        let path = dir.join("owl-tftpd.toml");
        let mut config = TftpConfig::default();
        config.root_dir = dir.clone();
        config.adaptive_timeout = true;
        config.stats_interval_secs = 30;
        write_config(&path, &config)?;

        let loaded = load_config(&path)?;
        assert_eq!(loaded.root_dir, dir);
        assert!(loaded.adaptive_timeout);
        assert_eq!(loaded.stats_interval_secs, 30);
        assert_eq!(loaded.workers, config.workers);
        Ok(())
    }

    #[test]
    fn rejects_invalid_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = temp_dir("invalid")?;
        let path = dir.join("broken.toml");
        std::fs::write(&path, "retries = \"many\"")?;
        match load_config(&path) {
            Ok(_) => return Err("expected error for invalid config".into()),
            Err(err) => assert!(format!("{err}").contains("Invalid config file")),
        }
        Ok(())
    }

    #[test]
    fn rejects_non_absolute_root_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = TftpConfig {
            root_dir: PathBuf::from("relative/path"),
            ..Default::default()
        };
        expect_error(&config, "root_dir must be an absolute path")
    }

    #[test]
    fn rejects_missing_root_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = TftpConfig {
            root_dir: PathBuf::from("/nonexistent/owl-tftpd"),
            ..Default::default()
        };
        expect_error(&config, "root_dir does not exist")
    }

    #[test]
    fn rejects_zero_bind_port() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind")?;
        config.bind_addr = "127.0.0.1:0".parse()?;
        expect_error(&config, "bind_addr port must be non-zero")
    }

    #[test]
    fn rejects_zero_timeout() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("timeout")?;
        config.timeout_secs = 0;
        expect_error(&config, "timeout_secs must be in range")
    }

    #[test]
    fn rejects_zero_workers() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("workers")?;
        config.workers = 0;
        expect_error(&config, "workers must be at least 1")
    }

    #[test]
    fn rejects_sessions_out_of_range() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("sessions")?;
        config.sessions_per_worker = 0;
        expect_error(&config, "sessions_per_worker must be in range")?;
        config.sessions_per_worker = 65536;
        expect_error(&config, "sessions_per_worker must be in range")
    }

    #[test]
    fn rejects_logging_file_with_missing_parent()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("logfile")?;
        config.logging.file = Some(PathBuf::from("/nonexistent/owl-tftpd/log.txt"));
        expect_error(&config, "logging.file parent error")
    }

    #[test]
    fn validates_bind_addr_availability_on_free_port()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();
        drop(socket);

        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind-available")?;
        config.bind_addr = format!("127.0.0.1:{port}").parse()?;
        validate_config(&config, true)?;
        Ok(())
    }

    #[test]
    fn rejects_bind_addr_when_in_use() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();

        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind-in-use")?;
        config.bind_addr = format!("127.0.0.1:{port}").parse()?;
        match validate_config(&config, true) {
            Ok(()) => return Err("expected error for bind_addr in use".into()),
            Err(err) => {
                assert!(format!("{err}").contains("bind_addr is not available"));
            }
        }
        Ok(())
    }
}

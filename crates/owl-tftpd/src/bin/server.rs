use clap::Parser;
use owl_tftpd::config::{load_config, validate_config, write_config};
use owl_tftpd::{
    LoadBalanceStrategy, LogFormat, Result, TftpConfig, TftpError, TftpServer, TracingStatsSink,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "owl-tftpd", about = "Read-only TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/owl-tftpd/tftpd.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the TFTP server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Retransmissions before a transfer is abandoned
    #[arg(long)]
    retries: Option<u8>,

    /// Default retransmission timeout in seconds
    #[arg(long)]
    timeout: Option<u8>,

    /// Number of worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Concurrent sessions per worker
    #[arg(long)]
    sessions_per_worker: Option<usize>,

    #[arg(long, value_enum)]
    load_balance: Option<LoadBalanceStrategy>,

    /// Accept `timeout=adaptive` from clients
    #[arg(long, value_parser = clap::value_parser!(bool))]
    adaptive_timeout: Option<bool>,

    /// Seconds between server statistics records (0 disables)
    #[arg(long)]
    stats_interval: Option<u64>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn apply(&self, config: &mut TftpConfig) {
        if let Some(ref root_dir) = self.root_dir {
            config.root_dir = root_dir.clone();
        }
        if let Some(bind_addr) = self.bind {
            config.bind_addr = bind_addr;
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(sessions) = self.sessions_per_worker {
            config.sessions_per_worker = sessions;
        }
        if let Some(strategy) = self.load_balance {
            config.load_balance = strategy;
        }
        if let Some(adaptive) = self.adaptive_timeout {
            config.adaptive_timeout = adaptive;
        }
        if let Some(interval) = self.stats_interval {
            config.stats_interval_secs = interval;
        }
        if let Some(ref level) = self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
    }
}

fn init_logging(config: &TftpConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.logging.level.clone()))
        .with_thread_names(true);

    let Some(ref log_file) = config.logging.file else {
        match config.logging.format {
            LogFormat::Json => builder.json().init(),
            LogFormat::Text => builder.init(),
        }
        return Ok(None);
    };

    let dir = match log_file.parent() {
        Some(path) => path,
        None => std::path::Path::new("."),
    };
    let file_name = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TftpError::Tftp("logging.file must include a file name".to_string()))?;
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let builder = builder.with_writer(non_blocking).with_ansi(false);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };
    cli.apply(&mut config);

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.root_dir).await?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;

    let _log_guard = init_logging(&config)?;

    let server = TftpServer::bind(&config, Arc::new(TracingStatsSink)).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, draining transfers"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        signal.cancel();
    });

    server.run(shutdown).await
}

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::TftpConfig;
use crate::error::{Result, TftpError};
use crate::packet::{REQUEST_MAX_SIZE, decode_request};
use crate::stats::{ServerStats, StatsSink};
use crate::worker_pool::{ServerInfo, WorkerPool};

/// Listener on the well-known port, handing each request to the worker pool.
pub struct TftpServer {
    socket: UdpSocket,
    pool: WorkerPool,
    info: Arc<ServerInfo>,
    stats_interval: Option<Duration>,
}

impl TftpServer {
    /// Bind the listen socket and start the workers.
    pub async fn bind(config: &TftpConfig, sink: Arc<dyn StatsSink>) -> Result<Self> {
        let socket = bind_listener(config.bind_addr)?;
        let info = Arc::new(ServerInfo {
            root_dir: config.root_dir.clone(),
            local_ip: config.bind_addr.ip(),
            retries: config.retries,
            timeout_secs: config.timeout_secs,
            adaptive_timeout: config.adaptive_timeout,
            stats: Arc::new(ServerStats::new()),
            sink,
        });
        let pool = WorkerPool::new(
            config.workers,
            config.sessions_per_worker,
            config.load_balance,
            info.clone(),
        )?;

        Ok(Self {
            socket,
            pool,
            info,
            stats_interval: (config.stats_interval_secs > 0)
                .then(|| Duration::from_secs(config.stats_interval_secs)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled, then drain in-flight transfers.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            socket,
            pool,
            info,
            stats_interval,
        } = self;
        info!("TFTP server listening on {}", socket.local_addr()?);

        let result = serve(&socket, &pool, &info, stats_interval, &shutdown).await;

        tokio::task::spawn_blocking(move || pool.shutdown())
            .await
            .map_err(|e| TftpError::Other(e.into()))?;
        info!("TFTP server stopped");
        result
    }
}

async fn serve(
    socket: &UdpSocket,
    pool: &WorkerPool,
    info: &ServerInfo,
    stats_interval: Option<Duration>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut ticker = stats_interval.map(|period| tokio::time::interval_at(Instant::now() + period, period));
    // one byte over the limit so oversized requests fail to decode
    let mut buf = vec![0u8; REQUEST_MAX_SIZE + 1];

    loop {
        let (size, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tick(&mut ticker) => {
                info.sink.on_server_stats(&info.stats.snapshot());
                continue;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    error!("Error receiving TFTP packet: {}", e);
                    continue;
                }
            },
        };

        // wait for a slot; further requests queue in the socket meanwhile
        let ticket = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            ticket = pool.new_session() => ticket?,
        };

        let datagram = &buf[..size];
        match decode_request(datagram) {
            Ok(_) => {
                if let Err(e) = pool.start_session(ticket, datagram.to_vec(), peer) {
                    error!("Failed to start session for {}: {}", peer, e);
                }
            }
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", peer, e);
                if let Err(e) = pool.terminate_session(ticket) {
                    error!("Failed to release session slot: {}", e);
                }
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// An unspecified IPv6 address also accepts IPv4 peers.
fn bind_listener(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

//! Per-session and server-wide transfer statistics.
//!
//! Records are handed to a [`StatsSink`] when a session closes and, on a
//! configurable interval, for the whole server. The default sink writes
//! them as structured JSON through `tracing`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use tracing::{Level, event};

use crate::packet::{DEFAULT_BLOCK_SIZE, DEFAULT_WINDOW_SIZE};

/// Terminal error of a transfer, sent by us or reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionError {
    pub code: u16,
    pub message: String,
    pub from_peer: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub peer_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub file_path: String,
    pub mode: &'static str,
    pub options_in: String,
    pub options_acked: String,
    pub start_time: DateTime<Utc>,
    pub packets_sent: u64,
    pub packets_acked: u64,
    pub bytes_sent: u64,
    pub retransmits: u64,
    pub blksize: u16,
    pub window_size: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionError>,
}

impl SessionStats {
    pub fn new(peer_addr: SocketAddr, server_addr: SocketAddr, file_path: &str) -> Self {
        Self {
            peer_addr,
            server_addr,
            file_path: file_path.to_string(),
            mode: "invalid",
            options_in: String::new(),
            options_acked: "[]".to_string(),
            start_time: Utc::now(),
            packets_sent: 0,
            packets_acked: 0,
            bytes_sent: 0,
            retransmits: 0,
            blksize: DEFAULT_BLOCK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerCounters {
    pub sessions_count: u64,
}

/// Server-wide counters, shared by every worker.
#[derive(Debug)]
pub struct ServerStats {
    start_time: DateTime<Utc>,
    counters: Mutex<ServerCounters>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatsSnapshot {
    pub start_time: DateTime<Utc>,
    pub uptime_secs: i64,
    #[serde(flatten)]
    pub counters: ServerCounters,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            counters: Mutex::new(ServerCounters::default()),
        }
    }

    pub fn record_session_start(&self) {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions_count += 1;
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        let counters = *self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        ServerStatsSnapshot {
            start_time: self.start_time,
            uptime_secs: (Utc::now() - self.start_time).num_seconds(),
            counters,
        }
    }
}

/// Receiver of statistics records.
pub trait StatsSink: Send + Sync {
    fn on_session_closed(&self, stats: &SessionStats);

    fn on_server_stats(&self, _stats: &ServerStatsSnapshot) {}
}

/// Logs every record as a JSON string field on a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatsSink;

fn to_json<T: Serialize + std::fmt::Debug>(record: &T) -> String {
    serde_json::to_string(record)
        .unwrap_or_else(|_| format!("{{\"error\": \"Failed to serialize stats: {:?}\"}}", record))
}

impl StatsSink for TracingStatsSink {
    fn on_session_closed(&self, stats: &SessionStats) {
        let json = to_json(stats);
        match stats.error {
            Some(ref error) if !error.from_peer => event!(Level::WARN, session_stats = %json),
            _ => event!(Level::INFO, session_stats = %json),
        }
    }

    fn on_server_stats(&self, stats: &ServerStatsSnapshot) {
        event!(Level::INFO, server_stats = %to_json(stats));
    }
}

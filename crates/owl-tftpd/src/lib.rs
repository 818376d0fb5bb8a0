//! Read-only TFTP server engine.
//!
//! Each transfer is a [`handler::TftpHandler`] state machine driven by
//! completions from a per-worker [`dispatcher::Dispatcher`]. Sessions are
//! pinned to one worker thread of a [`worker_pool::WorkerPool`] and fed by
//! the [`TftpServer`] listener.
//!
//! Supported RFCs: 1350 (octet and netascii reads), 2347 (option
//! extension), 2348 (blksize), 2349 (timeout, tsize) and 7440 (windowsize).
//! Write requests are refused.

pub mod adaptive_timeout;
pub mod buffer_pool;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod netascii;
pub mod options;
pub mod packet;
pub mod server;
pub mod session;
pub mod stats;
pub mod worker_pool;

pub use config::{LoadBalanceStrategy, LogFormat, TftpConfig};
pub use error::{Result, TftpError};
pub use server::TftpServer;
pub use stats::{ServerStatsSnapshot, SessionError, SessionStats, StatsSink, TracingStatsSink};

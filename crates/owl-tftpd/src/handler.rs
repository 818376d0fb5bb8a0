//! Per-transfer state machine for read requests.
//!
//! The handler never touches a socket. Every transition returns an
//! [`Action`] that the session turns into dispatcher submissions, and every
//! completion of those submissions comes back through one of the `on_*`
//! methods.
//!
//! Blocks are tracked with 64-bit sequence numbers starting at 1; the wire
//! block number is the low 16 bits. An incoming ACK is mapped back to a
//! sequence number by its modular distance from the start of the window, so
//! transfers longer than 65535 blocks wrap without special cases.

use bytes::{Bytes, BytesMut};
use nix::errno::Errno;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::adaptive_timeout::AdaptiveTimeout;
use crate::dispatcher::{DispatcherEvent, Payload};
use crate::error::{Result, TftpError};
use crate::netascii;
use crate::options::{
    OptionKind, OptionSet, encode_oack, find_raw_option, format_option_strings, format_options,
    parse_options,
};
use crate::packet::{
    DATA_HEADER_SIZE, DEFAULT_BLOCK_SIZE, DEFAULT_WINDOW_SIZE, ErrorCode, Mode, Packet, Request,
    RequestKind, encode_data, error_packet,
};
use crate::stats::{SessionError, SessionStats};
use crate::worker_pool::ServerInfo;

// Upper bound for windowsize * blksize
const MAX_WINDOW_BYTES: u64 = 16 * 1024 * 1024;

/// What the session must do next on behalf of the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    SendOack,
    SendData,
    SendError,
    FetchNextBlock,
    WaitNewData,
    CancelTimeout,
    Unexpected,
}

/// A positional read the session submits for [`Action::FetchNextBlock`].
#[derive(Debug)]
pub struct ReadRequest {
    pub file: Arc<File>,
    pub offset: u64,
    pub bufs: Vec<Vec<u8>>,
}

pub struct TftpHandler {
    peer: SocketAddr,
    kind: RequestKind,
    filename: String,
    mode: Mode,
    raw_options: Vec<u8>,
    root_dir: PathBuf,
    allow_adaptive: bool,

    file: Option<Arc<File>>,
    file_size: u64,
    read_offset: u64,
    read_bufs: Vec<Vec<u8>>,
    eof: bool,
    staged: BytesMut,

    block_size: usize,
    window_size: u64,
    window: Vec<Bytes>,
    window_begin: u64,
    next_to_send: u64,
    next_to_make: u64,
    highest_sent: u64,
    last_block: Option<u64>,

    oack: Option<Bytes>,
    oack_acked: bool,
    error_reply: Option<Bytes>,
    waiting_last_ack: bool,
    should_stop: bool,

    retries: u8,
    retransmits: u8,
    timeout: Duration,
    adaptive: Option<AdaptiveTimeout>,
    deadline: Option<Instant>,

    stats: SessionStats,
}

impl TftpHandler {
    pub fn new(
        request: &Request<'_>,
        peer: SocketAddr,
        server_addr: SocketAddr,
        info: &ServerInfo,
    ) -> Self {
        let mut stats = SessionStats::new(peer, server_addr, request.filename);
        stats.mode = request.mode.as_str();
        stats.options_in = format_option_strings(request.options);

        Self {
            peer,
            kind: request.kind,
            filename: request.filename.to_string(),
            mode: request.mode,
            raw_options: request.options.to_vec(),
            root_dir: info.root_dir.clone(),
            allow_adaptive: info.adaptive_timeout,
            file: None,
            file_size: 0,
            read_offset: 0,
            read_bufs: Vec::new(),
            eof: false,
            staged: BytesMut::new(),
            block_size: usize::from(DEFAULT_BLOCK_SIZE),
            window_size: u64::from(DEFAULT_WINDOW_SIZE),
            window: Vec::new(),
            window_begin: 1,
            next_to_send: 1,
            next_to_make: 1,
            highest_sent: 1,
            last_block: None,
            oack: None,
            oack_acked: true,
            error_reply: None,
            waiting_last_ack: false,
            should_stop: false,
            retries: info.retries,
            retransmits: 0,
            timeout: Duration::from_secs(u64::from(info.timeout_secs)),
            adaptive: None,
            deadline: None,
            stats,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop
    }

    /// Wait before the next retransmission: what is left until the armed
    /// deadline, or a full retransmission timeout when none is armed yet.
    ///
    /// Datagrams that do not move the transfer forward leave the deadline
    /// untouched, so a chatty stranger cannot postpone retransmission.
    pub fn timeout(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => self.retransmit_timeout(),
        }
    }

    fn retransmit_timeout(&self) -> Duration {
        match &self.adaptive {
            Some(adaptive) => adaptive.rto(),
            None => self.timeout,
        }
    }

    fn arm_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.retransmit_timeout());
    }

    /// Open the requested file and negotiate options.
    pub fn start(&mut self) -> Action {
        info!(
            "New incoming connection from peer '{}' asking for path '{}'",
            self.peer, self.filename
        );
        if self.raw_options.is_empty() {
            debug!("No options requested from peer {}", self.peer);
        } else {
            info!(
                "Options requested from peer {}: [{}]",
                self.peer, self.stats.options_in
            );
        }

        if self.kind == RequestKind::Write {
            return self.fail(ErrorCode::IllegalOperation, "Write requests are not supported.");
        }

        let path = match resolve_path(&self.root_dir, &self.filename) {
            Ok(path) => path,
            Err(e) => {
                debug!("Refusing path '{}': {}", self.filename, e);
                return self.fail(
                    ErrorCode::AccessViolation,
                    ErrorCode::AccessViolation.message(),
                );
            }
        };

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                let (code, message) = open_error(&e);
                return self.fail(code, &message);
            }
        };
        let metadata = match file.metadata() {
            Ok(metadata) => metadata,
            Err(e) => return self.fail(ErrorCode::NotDefined, &e.to_string()),
        };
        if metadata.is_dir() {
            return self.fail(ErrorCode::NotDefined, "Is a directory.");
        }
        self.file_size = if metadata.is_file() {
            metadata.len()
        } else if metadata.file_type().is_block_device() {
            match block_device_size(&file) {
                Ok(size) => size,
                Err(e) => {
                    debug!("Cannot size block device '{}': {}", self.filename, e);
                    return self.fail(ErrorCode::NotDefined, &e.to_string());
                }
            }
        } else {
            return self.fail(ErrorCode::NotDefined, "Not a regular file.");
        };
        let file = Arc::new(file);
        self.file = Some(file.clone());

        let acked = match self.negotiate(&file) {
            Ok(acked) => acked,
            Err(action) => return action,
        };

        self.window = vec![Bytes::new(); self.window_size as usize];
        self.stats.blksize = self.block_size as u16;
        self.stats.window_size = self.window_size as u16;

        if acked.is_empty() {
            return self.advance();
        }

        let formatted = format_options(&acked);
        info!("Options acknowledged for peer {}: {}", self.peer, formatted);
        self.stats.options_acked = formatted;
        self.oack = Some(encode_oack(&acked));
        self.oack_acked = false;
        Action::SendOack
    }

    fn negotiate(&mut self, file: &File) -> std::result::Result<OptionSet, Action> {
        let requested = parse_options(&self.raw_options);
        let mut acked = OptionSet::default();

        if let Some(blksize) = requested.blksize() {
            self.block_size = usize::from(blksize);
            acked.set(OptionKind::Blksize, blksize.to_string());
        }

        if let Some(seconds) = requested.timeout() {
            self.timeout = Duration::from_secs(u64::from(seconds));
            acked.set(OptionKind::Timeout, seconds.to_string());
        } else if self.allow_adaptive
            && find_raw_option(&self.raw_options, OptionKind::Timeout.name())
                .is_some_and(|value| value.eq_ignore_ascii_case(b"adaptive"))
        {
            self.adaptive = Some(AdaptiveTimeout::new());
            acked.set(OptionKind::Timeout, "adaptive");
        }

        if requested.tsize().is_some() {
            let size = match self.mode {
                Mode::Octet => Ok(self.file_size),
                Mode::Netascii => netascii::encoded_len(file),
            };
            match size {
                Ok(size) => acked.set(OptionKind::Tsize, size.to_string()),
                Err(e) => {
                    debug!("Cannot size '{}' for tsize: {}", self.filename, e);
                    return Err(self.fail(
                        ErrorCode::InvalidOptions,
                        "File does not support being queried for file size.",
                    ));
                }
            }
        }

        if let Some(windowsize) = requested.windowsize() {
            let limit = (MAX_WINDOW_BYTES / self.block_size as u64).clamp(1, u64::from(u16::MAX));
            let windowsize = u64::from(windowsize).min(limit);
            self.window_size = windowsize;
            acked.set(OptionKind::Windowsize, windowsize.to_string());
        }

        Ok(acked)
    }

    pub fn oack_packet(&mut self) -> Option<Bytes> {
        if self.retransmits == 0
            && let Some(adaptive) = self.adaptive.as_mut()
        {
            adaptive.start_timer(0);
        }
        self.oack.clone()
    }

    /// DATA packet for the next block to send.
    pub fn data_packet(&mut self) -> Bytes {
        // Karn: only fresh blocks are timed
        if self.next_to_send >= self.highest_sent
            && let Some(adaptive) = self.adaptive.as_mut()
            && !adaptive.is_timer_active()
        {
            adaptive.start_timer(self.next_to_send);
        }
        self.window[self.slot(self.next_to_send)].clone()
    }

    pub fn error_packet(&self) -> Option<Bytes> {
        self.error_reply.clone()
    }

    /// Read to submit for [`Action::FetchNextBlock`], one buffer per free
    /// window slot.
    pub fn prepare_fetch(&mut self) -> Option<ReadRequest> {
        let file = self.file.clone()?;
        let count = (self.window_end() - self.next_to_make).max(1) as usize;
        let mut bufs = std::mem::take(&mut self.read_bufs);
        bufs.resize_with(count, Vec::new);
        for buf in &mut bufs {
            buf.resize(self.block_size, 0);
        }
        Some(ReadRequest {
            file,
            offset: self.read_offset,
            bufs,
        })
    }

    pub fn on_error_sent(&mut self, event: &DispatcherEvent) -> Action {
        if let Some(errno) = event.errno() {
            debug!("Failed to send error to peer {}: {}", self.peer, errno);
        }
        self.should_stop = true;
        Action::None
    }

    pub fn on_oack_sent(&mut self, event: &DispatcherEvent) -> Action {
        match event.outcome {
            Ok(_) => {
                self.arm_deadline();
                Action::WaitNewData
            }
            Err(errno) => self.fail(ErrorCode::NotDefined, errno.desc()),
        }
    }

    pub fn on_data_sent(&mut self, event: &DispatcherEvent) -> Action {
        if let Err(errno) = event.outcome {
            return self.fail(ErrorCode::NotDefined, errno.desc());
        }
        self.next_to_send += 1;
        self.highest_sent = self.highest_sent.max(self.next_to_send);
        self.stats.packets_sent += 1;
        self.arm_deadline();
        self.advance()
    }

    pub fn on_next_block_ready(&mut self, event: DispatcherEvent) -> Action {
        let read = match event.outcome {
            Ok(read) => read,
            Err(errno) => return self.fail(ErrorCode::NotDefined, errno.desc()),
        };
        let Payload::Buffers(bufs) = event.payload else {
            return Action::Unexpected;
        };

        let mut remaining = read;
        for buf in &bufs {
            let n = remaining.min(buf.len());
            if n == 0 {
                break;
            }
            match self.mode {
                Mode::Octet => self.staged.extend_from_slice(&buf[..n]),
                Mode::Netascii => netascii::encode_into(&buf[..n], &mut self.staged),
            }
            remaining -= n;
        }
        self.read_bufs = bufs;

        self.read_offset += read as u64;
        if read == 0 || self.read_offset >= self.file_size {
            self.eof = true;
        }
        self.advance()
    }

    pub fn on_new_data(&mut self, event: &DispatcherEvent) -> Action {
        let len = match event.outcome {
            Ok(len) => len,
            Err(Errno::ECANCELED) => return Action::None,
            Err(errno) => return self.fail(ErrorCode::NotDefined, errno.desc()),
        };
        let Payload::Datagram { buf, .. } = &event.payload else {
            return Action::Unexpected;
        };
        let datagram = &buf[..len.min(buf.len())];
        if datagram.len() < DATA_HEADER_SIZE {
            trace!("Ignoring runt datagram from peer {}", self.peer);
            return Action::WaitNewData;
        }

        match Packet::parse(datagram) {
            Some(Packet::Ack { block }) => self.on_ack(block),
            Some(Packet::Error { code, message }) => self.on_peer_error(code, message),
            _ => self.fail(ErrorCode::IllegalOperation, "Unexpected packet opcode."),
        }
    }

    pub fn on_timeout(&mut self, event: &DispatcherEvent) -> Action {
        match event.outcome {
            Err(Errno::ETIME) => self.retransmit(),
            Err(Errno::ECANCELED) | Err(Errno::ENOENT) => Action::None,
            _ => Action::Unexpected,
        }
    }

    pub fn on_timeout_removed(&mut self, event: &DispatcherEvent) -> Action {
        trace!(
            "Timeout removal for peer {} completed: {:?}",
            self.peer, event.outcome
        );
        Action::None
    }

    /// Final statistics, consumed when the session closes.
    pub fn finish(self) -> SessionStats {
        info!("Session closed for peer {}", self.peer);
        self.stats
    }

    fn on_ack(&mut self, block: u16) -> Action {
        if !self.oack_acked {
            if block != 0 {
                trace!("Ignoring ack {} before option acknowledgement", block);
                return Action::WaitNewData;
            }
            self.oack_acked = true;
            self.retransmits = 0;
            if let Some(adaptive) = self.adaptive.as_mut() {
                adaptive.stop_timer();
            }
            self.arm_deadline();
            return self.advance();
        }

        let outstanding = self.next_to_send - self.window_begin;
        let distance = u64::from(block.wrapping_sub(self.window_begin as u16));
        if distance >= outstanding {
            trace!(
                "Ignoring stale ack {} from peer {} (window starts at {})",
                block, self.peer, self.window_begin as u16
            );
            return Action::WaitNewData;
        }

        let acked = self.window_begin + distance;
        for seq in self.window_begin..=acked {
            let packet = &self.window[self.slot(seq)];
            self.stats.bytes_sent += (packet.len() - DATA_HEADER_SIZE) as u64;
        }
        self.stats.packets_acked += distance + 1;

        if let Some(adaptive) = self.adaptive.as_mut()
            && adaptive.is_timer_active()
            && acked >= adaptive.starting_block()
        {
            adaptive.stop_timer();
        }

        self.window_begin = acked + 1;
        self.retransmits = 0;
        self.arm_deadline();

        if self.last_block == Some(acked) {
            debug!("Last block acknowledged by peer {}", self.peer);
            self.should_stop = true;
            return Action::CancelTimeout;
        }
        self.advance()
    }

    fn on_peer_error(&mut self, code: u16, message: Option<&str>) -> Action {
        let message =
            message.unwrap_or("Error message received was invalid (not null terminated).");
        let meaning = ErrorCode::from_u16(code).map_or("unknown error code", ErrorCode::message);
        warn!(
            "Peer {} aborted the transfer with error {} ({}): {}",
            self.peer, code, meaning, message
        );
        self.stats.error = Some(SessionError {
            code,
            message: message.to_string(),
            from_peer: true,
        });
        self.should_stop = true;
        Action::None
    }

    fn retransmit(&mut self) -> Action {
        if let Some(adaptive) = self.adaptive.as_mut() {
            adaptive.cancel_timer();
            adaptive.backoff();
        }

        if self.retransmits >= self.retries {
            let mut message = format!("timeout after {} retransmits.", self.retransmits);
            if self.waiting_last_ack {
                message.push_str(" Missed last ack.");
            }
            return self.fail(ErrorCode::NotDefined, &message);
        }

        self.retransmits += 1;
        self.stats.retransmits += 1;
        debug!(
            "Timeout waiting for peer {}, retransmit {} of {}",
            self.peer, self.retransmits, self.retries
        );

        self.arm_deadline();
        if !self.oack_acked {
            return Action::SendOack;
        }
        self.next_to_send = self.window_begin;
        self.waiting_last_ack = false;
        if self.next_to_send < self.next_to_make {
            Action::SendData
        } else {
            Action::WaitNewData
        }
    }

    /// Cut staged bytes into blocks, then decide whether to send, read or
    /// wait.
    fn advance(&mut self) -> Action {
        self.make_blocks();
        if self.next_to_send < self.next_to_make {
            return Action::SendData;
        }
        if self.last_block.is_some_and(|last| self.next_to_send > last) {
            self.waiting_last_ack = true;
            return Action::WaitNewData;
        }
        if self.next_to_make == self.window_end() {
            return Action::WaitNewData;
        }
        Action::FetchNextBlock
    }

    fn make_blocks(&mut self) {
        while self.last_block.is_none() && self.next_to_make < self.window_end() {
            let payload = if self.staged.len() >= self.block_size {
                self.staged.split_to(self.block_size)
            } else if self.eof {
                // A short (possibly empty) block ends the transfer
                self.last_block = Some(self.next_to_make);
                self.staged.split()
            } else {
                break;
            };
            let slot = self.slot(self.next_to_make);
            self.window[slot] = encode_data(self.next_to_make as u16, &payload);
            self.next_to_make += 1;
        }
    }

    fn window_end(&self) -> u64 {
        self.window_begin + self.window_size
    }

    fn slot(&self, seq: u64) -> usize {
        ((seq - 1) % self.window_size) as usize
    }

    fn fail(&mut self, code: ErrorCode, message: &str) -> Action {
        warn!(
            "Transfer of '{}' to peer {} failed with error {}: {}",
            self.filename, self.peer, code as u16, message
        );
        self.error_reply = Some(error_packet(code, message));
        self.stats.error = Some(SessionError {
            code: code as u16,
            message: message.to_string(),
            from_peer: false,
        });
        Action::SendError
    }
}

/// Resolve `filename` below `root_dir`, refusing traversal and symlinks.
fn resolve_path(root_dir: &Path, filename: &str) -> Result<PathBuf> {
    let filename = filename.replace('\\', "/");
    if filename.split('/').any(|component| component == "..") {
        return Err(TftpError::Tftp("Path traversal".to_string()));
    }

    let file_path = root_dir.join(filename.trim_start_matches('/'));

    match std::fs::symlink_metadata(&file_path) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            return Err(TftpError::Tftp("Symlinks are not allowed".to_string()));
        }
        Ok(_) => {}
        // Reported by the open that follows
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let canonical_root = root_dir.canonicalize()?;
    let inside = match file_path.canonicalize() {
        Ok(canonical) => canonical.starts_with(&canonical_root),
        Err(_) => file_path
            .parent()
            .and_then(|parent| parent.canonicalize().ok())
            .is_none_or(|parent| parent.starts_with(&canonical_root)),
    };
    if !inside {
        return Err(TftpError::Tftp("Path escapes the root directory".to_string()));
    }
    Ok(file_path)
}

#[cfg(target_os = "linux")]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Size in bytes of the block device behind `file`.
#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> io::Result<u64> {
    use std::os::fd::AsRawFd;

    let mut size = 0u64;
    // SAFETY: `file` keeps the descriptor open and `size` outlives the call
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }?;
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_file: &File) -> io::Result<u64> {
    Err(io::ErrorKind::Unsupported.into())
}

fn open_error(error: &io::Error) -> (ErrorCode, String) {
    match error.kind() {
        io::ErrorKind::PermissionDenied => {
            (ErrorCode::AccessViolation, "Permission denied.".to_string())
        }
        io::ErrorKind::NotFound => (
            ErrorCode::FileNotFound,
            "No such file or directory.".to_string(),
        ),
        _ => (ErrorCode::NotDefined, error.to_string()),
    }
}

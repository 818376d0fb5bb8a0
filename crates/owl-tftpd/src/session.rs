//! Glue between the dispatcher and one [`TftpHandler`].
//!
//! A session owns a slot on its worker for the whole transfer. It turns
//! completions into handler transitions and handler actions into
//! submissions, counting what is still in flight so the slot is never
//! reused while an operation of the previous transfer can still complete.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::buffer_pool::BufferPool;
use crate::dispatcher::{Dispatcher, DispatcherEvent, EventId, Payload};
use crate::error::{Result, TftpError};
use crate::handler::{Action, TftpHandler};
use crate::packet::{ErrorCode, canned_error, decode_request};
use crate::worker_pool::ServerInfo;

// Event kinds, the low 16 bits of an EventId
pub const START: u16 = 0;
pub const TERMINATE: u16 = 1;
pub const OACK_SENT: u16 = 2;
pub const DATA_SENT: u16 = 3;
pub const ERROR_SENT: u16 = 4;
pub const NEXT_BLOCK_READY: u16 = 5;
pub const NEW_DATA: u16 = 6;
pub const TIMEOUT: u16 = 7;
pub const TIMEOUT_REMOVED: u16 = 8;
/// UNKNOWN_TID reply to a datagram from someone other than the peer.
pub const STRAY_ERROR_SENT: u16 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Closed,
}

pub struct Session {
    id: u16,
    dispatcher: Arc<Dispatcher>,
    info: Arc<ServerInfo>,
    buffers: BufferPool,
    slots: Arc<[AtomicBool]>,
    pending_jobs: usize,
    socket: Option<Arc<UdpSocket>>,
    handler: Option<TftpHandler>,
}

impl Session {
    pub fn new(
        id: u16,
        dispatcher: Arc<Dispatcher>,
        info: Arc<ServerInfo>,
        buffers: BufferPool,
        slots: Arc<[AtomicBool]>,
    ) -> Self {
        Self {
            id,
            dispatcher,
            info,
            buffers,
            slots,
            pending_jobs: 0,
            socket: None,
            handler: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.slots[usize::from(self.id)].load(Ordering::Acquire)
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending_jobs
    }

    /// Handle one completion addressed to this session.
    ///
    /// An error means the worker can no longer drive its sessions.
    pub fn on_event(&mut self, event: DispatcherEvent) -> Result<SessionState> {
        let kind = event.id.kind();
        trace!(
            "Session {} event kind {} outcome {:?}",
            self.id, kind, event.outcome
        );
        match kind {
            START => return self.start(event),
            TERMINATE => {
                debug!("Session {} terminated before starting", self.id);
                return Ok(self.close());
            }
            _ => self.pending_jobs = self.pending_jobs.saturating_sub(1),
        }

        let id = self.id;
        let action = match kind {
            NEW_DATA => self.on_new_data(event)?,
            STRAY_ERROR_SENT => Action::None,
            _ => {
                let handler = self.handler_mut()?;
                match kind {
                    OACK_SENT => handler.on_oack_sent(&event),
                    DATA_SENT => handler.on_data_sent(&event),
                    ERROR_SENT => handler.on_error_sent(&event),
                    NEXT_BLOCK_READY => handler.on_next_block_ready(event),
                    TIMEOUT => handler.on_timeout(&event),
                    TIMEOUT_REMOVED => handler.on_timeout_removed(&event),
                    other => {
                        return Err(TftpError::Tftp(format!(
                            "Unknown event kind {} for session {}",
                            other, id
                        )));
                    }
                }
            }
        };

        self.perform(action)?;
        Ok(self.close_if_done())
    }

    fn start(&mut self, event: DispatcherEvent) -> Result<SessionState> {
        let Payload::Request { data, peer } = event.payload else {
            return Err(TftpError::Tftp(format!(
                "Session {} started without a request",
                self.id
            )));
        };
        let request = match decode_request(&data) {
            Ok(request) => request,
            Err(e) => {
                debug!("Dropping request from {}: {}", peer, e);
                return Ok(self.close());
            }
        };

        let peer = normalize_peer(peer);
        let local = SocketAddr::new(local_ip_for(self.info.local_ip, peer), 0);
        let socket = match self.dispatcher.bind_udp(local) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Failed to bind session socket on {}: {}", local, e);
                return Ok(self.close());
            }
        };
        let server_addr = socket.local_addr().unwrap_or(local);

        self.info.stats.record_session_start();
        let mut handler = TftpHandler::new(&request, peer, server_addr, &self.info);
        let action = handler.start();
        self.socket = Some(socket);
        self.handler = Some(handler);

        self.perform(action)?;
        Ok(self.close_if_done())
    }

    fn on_new_data(&mut self, event: DispatcherEvent) -> Result<Action> {
        let expected = self.handler_mut()?.peer();
        let stray = match &event.payload {
            Payload::Datagram {
                peer: Some(from), ..
            } if event.is_success() => Some(normalize_peer(*from)).filter(|from| *from != expected),
            _ => None,
        };

        let action = match stray {
            Some(from) => {
                warn!(
                    "Session {}: packet from unexpected peer {} (expected {})",
                    self.id, from, expected
                );
                self.reply_unknown_tid(from)?;
                // The receive consumed the linked timer
                Action::WaitNewData
            }
            None => self.handler_mut()?.on_new_data(&event),
        };

        if let Payload::Datagram { buf, .. } = event.payload {
            self.buffers.release(buf);
        }
        Ok(action)
    }

    fn reply_unknown_tid(&mut self, to: SocketAddr) -> Result<()> {
        let (Some(socket), Some(packet)) = (self.socket.clone(), canned_error(ErrorCode::UnknownTid))
        else {
            return Ok(());
        };
        self.dispatcher.submit_sendto(
            EventId::new(self.id, STRAY_ERROR_SENT),
            socket,
            packet,
            to,
        )?;
        self.pending_jobs += 1;
        Ok(())
    }

    fn perform(&mut self, action: Action) -> Result<()> {
        if action == Action::None {
            return Ok(());
        }
        let id = self.id;
        let socket = self
            .socket
            .clone()
            .ok_or_else(|| TftpError::Tftp(format!("Session {} has no socket", id)))?;
        let Some(handler) = self.handler.as_mut() else {
            return Err(TftpError::Tftp(format!("Session {} has no handler", id)));
        };
        let peer = handler.peer();

        match action {
            Action::None => {}
            Action::SendOack => {
                let packet = handler
                    .oack_packet()
                    .ok_or_else(|| TftpError::Tftp(format!("Session {} has no OACK", id)))?;
                self.dispatcher
                    .submit_sendto(EventId::new(id, OACK_SENT), socket, packet, peer)?;
                self.pending_jobs += 1;
            }
            Action::SendData => {
                let packet = handler.data_packet();
                self.dispatcher
                    .submit_sendto(EventId::new(id, DATA_SENT), socket, packet, peer)?;
                self.pending_jobs += 1;
            }
            Action::SendError => {
                let packet = handler.error_packet().ok_or_else(|| {
                    TftpError::Tftp(format!("Session {} has no error to send", id))
                })?;
                self.dispatcher
                    .submit_sendto(EventId::new(id, ERROR_SENT), socket, packet, peer)?;
                self.pending_jobs += 1;
            }
            Action::FetchNextBlock => {
                let read = handler
                    .prepare_fetch()
                    .ok_or_else(|| TftpError::Tftp(format!("Session {} has no file", id)))?;
                self.dispatcher.submit_readv(
                    EventId::new(id, NEXT_BLOCK_READY),
                    read.file,
                    read.offset,
                    read.bufs,
                )?;
                self.pending_jobs += 1;
            }
            Action::WaitNewData => {
                self.dispatcher.submit_recvmsg_with_timeout(
                    EventId::new(id, NEW_DATA),
                    EventId::new(id, TIMEOUT),
                    socket,
                    self.buffers.acquire(),
                    handler.timeout(),
                )?;
                self.pending_jobs += 2;
            }
            Action::CancelTimeout => {
                self.dispatcher.submit_timeout_cancel(
                    EventId::new(id, TIMEOUT_REMOVED),
                    EventId::new(id, TIMEOUT),
                )?;
                self.pending_jobs += 1;
            }
            Action::Unexpected => {
                return Err(TftpError::Tftp(format!(
                    "Unexpected state in session {} with peer {}",
                    id, peer
                )));
            }
        }
        Ok(())
    }

    fn close_if_done(&mut self) -> SessionState {
        if self.pending_jobs != 0 {
            return SessionState::Idle;
        }
        match &self.handler {
            Some(handler) if !handler.should_stop() => {
                warn!("Session {} has nothing in flight, closing it", self.id);
                self.close()
            }
            _ => self.close(),
        }
    }

    fn close(&mut self) -> SessionState {
        if let Some(handler) = self.handler.take() {
            let stats = handler.finish();
            self.info.sink.on_session_closed(&stats);
        }
        self.socket = None;
        self.pending_jobs = 0;
        self.slots[usize::from(self.id)].store(false, Ordering::Release);
        SessionState::Closed
    }

    fn handler_mut(&mut self) -> Result<&mut TftpHandler> {
        let id = self.id;
        self.handler
            .as_mut()
            .ok_or_else(|| TftpError::Tftp(format!("Event for idle session {}", id)))
    }
}

/// IPv4-mapped IPv6 peers are answered over IPv4.
pub fn normalize_peer(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => peer,
        },
        SocketAddr::V4(_) => peer,
    }
}

fn local_ip_for(listen_ip: IpAddr, peer: SocketAddr) -> IpAddr {
    match (listen_ip, peer) {
        (IpAddr::V6(v6), SocketAddr::V4(_)) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), IpAddr::V4),
        (ip, _) => ip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{encode_ack, encode_request_with_options, Mode, RequestKind};
    use crate::stats::{ServerStats, SessionStats, StatsSink};
    use std::net::Ipv6Addr;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        closed: Mutex<Vec<SessionStats>>,
    }

    impl StatsSink for RecordingSink {
        fn on_session_closed(&self, stats: &SessionStats) {
            self.closed.lock().unwrap().push(stats.clone());
        }
    }

    struct Fixture {
        _root: TempDir,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<RecordingSink>,
        session: Session,
        client: std::net::UdpSocket,
    }

    fn fixture(contents: &[u8]) -> Fixture {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("file"), contents).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let info = Arc::new(ServerInfo {
            root_dir: root.path().to_path_buf(),
            local_ip: "127.0.0.1".parse().unwrap(),
            retries: 1,
            timeout_secs: 1,
            adaptive_timeout: false,
            stats: Arc::new(ServerStats::new()),
            sink: sink.clone(),
        });
        let dispatcher = Arc::new(Dispatcher::new(4).unwrap());
        let slots: Arc<[AtomicBool]> = vec![AtomicBool::new(true)].into();
        let session = Session::new(0, dispatcher.clone(), info, BufferPool::new(1024), slots);
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Fixture {
            _root: root,
            dispatcher,
            sink,
            session,
            client,
        }
    }

    fn step(fixture: &mut Fixture) -> SessionState {
        loop {
            if let Some(event) = fixture.dispatcher.wait_event().unwrap() {
                return fixture.session.on_event(event).unwrap();
            }
        }
    }

    fn start(fixture: &mut Fixture, options: &[u8]) {
        let request =
            encode_request_with_options(RequestKind::Read, "file", Mode::Octet, options).unwrap();
        let peer = fixture.client.local_addr().unwrap();
        fixture
            .dispatcher
            .submit_with_payload(
                EventId::new(0, START),
                Payload::Request {
                    data: request.to_vec(),
                    peer,
                },
            )
            .unwrap();
    }

    fn recv(client: &std::net::UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 2048];
        let (len, from) = client.recv_from(&mut buf).unwrap();
        (buf[..len].to_vec(), from)
    }

    #[test]
    fn serves_a_small_file() {
        let mut fixture = fixture(b"hello world");
        start(&mut fixture, b"");

        // start, read, send
        for _ in 0..3 {
            assert_eq!(step(&mut fixture), SessionState::Idle);
        }
        let (packet, server) = recv(&fixture.client);
        assert_eq!(packet, b"\0\x03\0\x01hello world");
        assert_eq!(fixture.session.pending_jobs(), 2);

        fixture.client.send_to(&encode_ack(1), server).unwrap();
        let mut state = SessionState::Idle;
        while state == SessionState::Idle {
            state = step(&mut fixture);
        }
        assert!(!fixture.session.is_active());
        assert_eq!(fixture.dispatcher.pending_requests(), 0);

        let closed = fixture.sink.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].bytes_sent, 11);
        assert!(closed[0].error.is_none());
    }

    #[test]
    fn malformed_request_closes_immediately() {
        let mut fixture = fixture(b"");
        fixture
            .dispatcher
            .submit_with_payload(
                EventId::new(0, START),
                Payload::Request {
                    data: vec![0, 4, 0, 1],
                    peer: fixture.client.local_addr().unwrap(),
                },
            )
            .unwrap();
        assert_eq!(step(&mut fixture), SessionState::Closed);
        assert!(fixture.sink.closed.lock().unwrap().is_empty());
    }

    #[test]
    fn terminate_releases_the_slot() {
        let mut fixture = fixture(b"");
        fixture
            .dispatcher
            .submit(EventId::new(0, TERMINATE))
            .unwrap();
        assert_eq!(step(&mut fixture), SessionState::Closed);
        assert!(!fixture.session.is_active());
    }

    #[test]
    fn answers_strangers_with_unknown_tid() {
        let mut fixture = fixture(b"hello");
        start(&mut fixture, b"");
        for _ in 0..3 {
            step(&mut fixture);
        }
        let (_, server) = recv(&fixture.client);

        let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        stranger
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stranger.send_to(&encode_ack(1), server).unwrap();
        // the stray datagram completes the receive
        assert_eq!(step(&mut fixture), SessionState::Idle);
        let (reply, _) = recv(&stranger);
        assert_eq!(reply, canned_error(ErrorCode::UnknownTid).unwrap().to_vec());

        // the real peer can still finish
        fixture.client.send_to(&encode_ack(1), server).unwrap();
        let mut state = SessionState::Idle;
        while state == SessionState::Idle {
            state = step(&mut fixture);
        }
        let closed = fixture.sink.closed.lock().unwrap();
        assert!(closed[0].error.is_none());
    }

    #[test]
    fn normalizes_mapped_peers() {
        let mapped = SocketAddr::new(
            IpAddr::V6(Ipv4Addr::new(192, 0, 2, 7).to_ipv6_mapped()),
            1069,
        );
        assert_eq!(normalize_peer(mapped), "192.0.2.7:1069".parse().unwrap());
        let native: SocketAddr = "[2001:db8::1]:1069".parse().unwrap();
        assert_eq!(normalize_peer(native), native);

        let v4_peer: SocketAddr = "192.0.2.7:1069".parse().unwrap();
        assert_eq!(
            local_ip_for(IpAddr::V6(Ipv6Addr::UNSPECIFIED), v4_peer),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
        assert_eq!(
            local_ip_for("127.0.0.1".parse().unwrap(), v4_peer),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
    }
}

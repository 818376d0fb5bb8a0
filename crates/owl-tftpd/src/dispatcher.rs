//! Completion based event dispatcher.
//!
//! Every operation is submitted with an [`EventId`] and produces exactly one
//! [`DispatcherEvent`] later, which [`Dispatcher::wait_event`] hands back one
//! at a time. The backend is a current-thread tokio runtime owned by the
//! dispatcher: submissions become tasks on that runtime and the tasks post
//! their outcome to a completion queue. The runtime only makes progress while
//! the owning worker is parked in `wait_event`.
//!
//! Outcomes use the errno values a completion queue reports: a fired timer
//! is `ETIME`, a canceled operation `ECANCELED` and a cancel whose target is
//! already gone `ENOENT`.

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::uio::preadv;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::fs::File;
use std::io::IoSliceMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::DispatcherError;

type SubmitResult = std::result::Result<(), DispatcherError>;

/// 64-bit completion tag: session id in the high 16 bits, event kind in
/// the low 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

impl EventId {
    pub const fn new(session: u16, kind: u16) -> Self {
        Self(((session as u64) << 48) | kind as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn session(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub const fn kind(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

/// Byte count on success, the errno of the failed or canceled operation
/// otherwise.
pub type Outcome = std::result::Result<usize, Errno>;

/// Owned data travelling with a completion.
#[derive(Debug)]
pub enum Payload {
    None,
    /// Request datagram handed to a session with its START event.
    Request { data: Vec<u8>, peer: SocketAddr },
    /// Buffers of a vectored read, filled in order.
    Buffers(Vec<Vec<u8>>),
    /// Receive buffer; `peer` is set when a datagram arrived.
    Datagram {
        buf: Vec<u8>,
        peer: Option<SocketAddr>,
    },
}

#[derive(Debug)]
pub struct DispatcherEvent {
    pub id: EventId,
    pub outcome: Outcome,
    pub payload: Payload,
}

impl DispatcherEvent {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn errno(&self) -> Option<Errno> {
        self.outcome.err()
    }
}

enum Completion {
    Wakeup,
    Event(DispatcherEvent),
}

#[derive(Debug)]
enum Control {
    Cancel,
    Update(Duration),
}

/// State reachable from the spawned operation tasks.
struct Shared {
    completions: mpsc::UnboundedSender<Completion>,
    in_flight: Mutex<HashMap<EventId, mpsc::UnboundedSender<Control>>>,
}

impl Shared {
    fn register(&self, id: EventId) -> mpsc::UnboundedReceiver<Control> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        rx
    }

    /// Take ownership of the outcome of `id`. Whoever removes the entry
    /// decides how the operation completes; `false` means a cancel won.
    fn claim(&self, id: EventId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    fn cancel(&self, target: EventId) -> bool {
        let control = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&target);
        match control {
            Some(tx) => {
                let _ = tx.send(Control::Cancel);
                true
            }
            None => false,
        }
    }

    fn update(&self, target: EventId, duration: Duration) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target)
            .is_some_and(|tx| tx.send(Control::Update(duration)).is_ok())
    }

    fn complete(&self, id: EventId, outcome: Outcome, payload: Payload) {
        trace!("Completion for event {:#x}: {:?}", id.raw(), outcome);
        // The receiver lives as long as the dispatcher that spawned us
        let _ = self.completions.send(Completion::Event(DispatcherEvent {
            id,
            outcome,
            payload,
        }));
    }
}

fn errno_of(error: &std::io::Error) -> Errno {
    error.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}

pub struct Dispatcher {
    runtime: Runtime,
    shared: Arc<Shared>,
    completions: Mutex<mpsc::UnboundedReceiver<Completion>>,
    pending: AtomicUsize,
    capacity: usize,
}

impl Dispatcher {
    /// `capacity` bounds the number of operations in flight at once.
    pub fn new(capacity: usize) -> std::result::Result<Self, DispatcherError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            runtime,
            shared: Arc::new(Shared {
                completions: tx,
                in_flight: Mutex::new(HashMap::new()),
            }),
            completions: Mutex::new(rx),
            pending: AtomicUsize::new(0),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Operations submitted whose completion has not been returned yet.
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn reserve(&self, count: usize) -> SubmitResult {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending + count <= self.capacity).then_some(pending + count)
            })
            .map(|_| ())
            .map_err(DispatcherError::QueueFull)
    }

    /// Bind a non-blocking UDP socket registered with this dispatcher.
    pub fn bind_udp(&self, addr: SocketAddr) -> std::io::Result<Arc<UdpSocket>> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let _guard = self.runtime.enter();
        Ok(Arc::new(UdpSocket::from_std(socket.into())?))
    }

    /// No-op completing immediately with `Ok(0)`.
    pub fn submit(&self, id: EventId) -> SubmitResult {
        self.submit_with_payload(id, Payload::None)
    }

    /// No-op carrying `payload` to whoever handles `id`.
    pub fn submit_with_payload(&self, id: EventId, payload: Payload) -> SubmitResult {
        self.reserve(1)?;
        self.shared.complete(id, Ok(0), payload);
        Ok(())
    }

    /// Unblock `wait_event` without delivering an event.
    pub fn wakeup(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.shared.completions.send(Completion::Wakeup);
    }

    /// Timer completing with `ETIME` after `duration`, or `ECANCELED`.
    pub fn submit_timeout(&self, id: EventId, duration: Duration) -> SubmitResult {
        self.reserve(1)?;
        let control = self.shared.register(id);
        self.runtime
            .spawn(run_timeout(self.shared.clone(), id, duration, control));
        Ok(())
    }

    /// Rearm the pending timer `target` to fire `duration` from now.
    pub fn submit_timeout_update(
        &self,
        id: EventId,
        target: EventId,
        duration: Duration,
    ) -> SubmitResult {
        self.reserve(1)?;
        let outcome = if self.shared.update(target, duration) {
            Ok(0)
        } else {
            Err(Errno::ENOENT)
        };
        self.shared.complete(id, outcome, Payload::None);
        Ok(())
    }

    pub fn submit_timeout_cancel(&self, id: EventId, target: EventId) -> SubmitResult {
        self.submit_cancel(id, target)
    }

    /// Cancel the pending operation `target`.
    ///
    /// The target completes with `ECANCELED` and `id` with `Ok(0)`. When the
    /// target already completed or is not cancelable `id` completes with
    /// `ENOENT`.
    pub fn submit_cancel(&self, id: EventId, target: EventId) -> SubmitResult {
        self.reserve(1)?;
        let outcome = if self.shared.cancel(target) {
            Ok(0)
        } else {
            Err(Errno::ENOENT)
        };
        self.shared.complete(id, outcome, Payload::None);
        Ok(())
    }

    /// Positional vectored read into `bufs`, returned with the completion.
    pub fn submit_readv(
        &self,
        id: EventId,
        file: Arc<File>,
        offset: u64,
        bufs: Vec<Vec<u8>>,
    ) -> SubmitResult {
        self.reserve(1)?;
        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            let read = tokio::task::spawn_blocking(move || {
                let mut bufs = bufs;
                let result = {
                    let mut slices: Vec<IoSliceMut<'_>> = bufs
                        .iter_mut()
                        .map(|buf| IoSliceMut::new(buf.as_mut_slice()))
                        .collect();
                    preadv(&*file, &mut slices, offset as nix::libc::off_t)
                };
                (result, bufs)
            })
            .await;
            match read {
                Ok((result, bufs)) => shared.complete(id, result, Payload::Buffers(bufs)),
                Err(_) => shared.complete(id, Err(Errno::EIO), Payload::None),
            }
        });
        Ok(())
    }

    /// Receive one datagram into `buf`.
    pub fn submit_recvmsg(&self, id: EventId, socket: Arc<UdpSocket>, buf: Vec<u8>) -> SubmitResult {
        self.reserve(1)?;
        let control = self.shared.register(id);
        self.runtime
            .spawn(run_recv(self.shared.clone(), id, socket, buf, control));
        Ok(())
    }

    /// Receive linked with a timer: two completions, one for `id` and one
    /// for `timeout_id`. Whichever side loses completes with `ECANCELED`.
    pub fn submit_recvmsg_with_timeout(
        &self,
        id: EventId,
        timeout_id: EventId,
        socket: Arc<UdpSocket>,
        buf: Vec<u8>,
        duration: Duration,
    ) -> SubmitResult {
        self.reserve(2)?;
        let linked = LinkedRecv {
            recv_id: id,
            recv_control: self.shared.register(id),
            timeout_id,
            timeout_control: self.shared.register(timeout_id),
            duration,
        };
        self.runtime
            .spawn(run_linked_recv(self.shared.clone(), socket, buf, linked));
        Ok(())
    }

    pub fn submit_sendto(
        &self,
        id: EventId,
        socket: Arc<UdpSocket>,
        packet: Bytes,
        peer: SocketAddr,
    ) -> SubmitResult {
        self.reserve(1)?;
        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            let outcome = socket
                .send_to(&packet, peer)
                .await
                .map_err(|e| errno_of(&e));
            shared.complete(id, outcome, Payload::None);
        });
        Ok(())
    }

    /// Block until a completion is ready. `Ok(None)` is a wakeup.
    pub fn wait_event(&self) -> std::result::Result<Option<DispatcherEvent>, DispatcherError> {
        let mut completions = self
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let completion = self
            .runtime
            .block_on(completions.recv())
            .ok_or(DispatcherError::Closed)?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        match completion {
            Completion::Wakeup => Ok(None),
            Completion::Event(event) => Ok(Some(event)),
        }
    }
}

async fn run_timeout(
    shared: Arc<Shared>,
    id: EventId,
    mut duration: Duration,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        let fired = tokio::select! {
            _ = tokio::time::sleep(duration) => None,
            message = control.recv() => Some(message),
        };
        let outcome = match fired {
            Some(Some(Control::Update(rearmed))) => {
                duration = rearmed;
                continue;
            }
            None if shared.claim(id) => Err(Errno::ETIME),
            _ => {
                shared.claim(id);
                Err(Errno::ECANCELED)
            }
        };
        shared.complete(id, outcome, Payload::None);
        return;
    }
}

async fn run_recv(
    shared: Arc<Shared>,
    id: EventId,
    socket: Arc<UdpSocket>,
    mut buf: Vec<u8>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let received = tokio::select! {
        result = socket.recv_from(&mut buf) => Some(result),
        _ = control.recv() => None,
    };
    let claimed = shared.claim(id);
    match received {
        Some(Ok((len, peer))) if claimed => {
            shared.complete(id, Ok(len), Payload::Datagram { buf, peer: Some(peer) })
        }
        Some(Err(e)) if claimed => {
            shared.complete(id, Err(errno_of(&e)), Payload::Datagram { buf, peer: None })
        }
        _ => shared.complete(
            id,
            Err(Errno::ECANCELED),
            Payload::Datagram { buf, peer: None },
        ),
    }
}

struct LinkedRecv {
    recv_id: EventId,
    recv_control: mpsc::UnboundedReceiver<Control>,
    timeout_id: EventId,
    timeout_control: mpsc::UnboundedReceiver<Control>,
    duration: Duration,
}

enum LinkedOutcome {
    Received(std::io::Result<(usize, SocketAddr)>),
    Expired,
    TimeoutControl(Option<Control>),
    RecvCanceled,
}

async fn run_linked_recv(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    mut buf: Vec<u8>,
    mut linked: LinkedRecv,
) {
    let (recv_outcome, peer, timeout_outcome) = loop {
        let fired = tokio::select! {
            result = socket.recv_from(&mut buf) => LinkedOutcome::Received(result),
            _ = tokio::time::sleep(linked.duration) => LinkedOutcome::Expired,
            message = linked.timeout_control.recv() => LinkedOutcome::TimeoutControl(message),
            _ = linked.recv_control.recv() => LinkedOutcome::RecvCanceled,
        };
        match fired {
            LinkedOutcome::TimeoutControl(Some(Control::Update(rearmed))) => {
                linked.duration = rearmed;
            }
            LinkedOutcome::Received(result) => {
                let claimed = shared.claim(linked.recv_id);
                shared.claim(linked.timeout_id);
                break match result {
                    Ok((len, peer)) if claimed => (Ok(len), Some(peer), Err(Errno::ECANCELED)),
                    Err(e) if claimed => (Err(errno_of(&e)), None, Err(Errno::ECANCELED)),
                    _ => (Err(Errno::ECANCELED), None, Err(Errno::ECANCELED)),
                };
            }
            LinkedOutcome::Expired => {
                let timeout = if shared.claim(linked.timeout_id) {
                    Err(Errno::ETIME)
                } else {
                    Err(Errno::ECANCELED)
                };
                shared.claim(linked.recv_id);
                break (Err(Errno::ECANCELED), None, timeout);
            }
            LinkedOutcome::TimeoutControl(_) | LinkedOutcome::RecvCanceled => {
                shared.claim(linked.recv_id);
                shared.claim(linked.timeout_id);
                break (Err(Errno::ECANCELED), None, Err(Errno::ECANCELED));
            }
        }
    };

    shared.complete(linked.recv_id, recv_outcome, Payload::Datagram { buf, peer });
    shared.complete(linked.timeout_id, timeout_outcome, Payload::None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const WAIT: EventId = EventId::new(1, 6);
    const TIMER: EventId = EventId::new(1, 7);
    const CANCEL: EventId = EventId::new(1, 8);

    fn next(dispatcher: &Dispatcher) -> DispatcherEvent {
        loop {
            if let Some(event) = dispatcher.wait_event().unwrap() {
                return event;
            }
        }
    }

    #[test]
    fn event_id_packs_session_and_kind() {
        let id = EventId::new(0xBEEF, 5);
        assert_eq!(id.raw(), 0xBEEF_0000_0000_0005);
        assert_eq!(id.session(), 0xBEEF);
        assert_eq!(id.kind(), 5);
        assert_eq!(EventId::from_raw(id.raw()), id);
    }

    #[test]
    fn nop_completes_and_drains_pending() {
        let dispatcher = Dispatcher::new(4).unwrap();
        dispatcher
            .submit_with_payload(
                EventId::new(3, 0),
                Payload::Request {
                    data: vec![0, 1],
                    peer: "127.0.0.1:69".parse().unwrap(),
                },
            )
            .unwrap();
        assert_eq!(dispatcher.pending_requests(), 1);
        let event = next(&dispatcher);
        assert_eq!(event.id, EventId::new(3, 0));
        assert_eq!(event.outcome, Ok(0));
        assert!(matches!(event.payload, Payload::Request { .. }));
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[test]
    fn wakeup_is_not_an_event() {
        let dispatcher = Dispatcher::new(1).unwrap();
        dispatcher.wakeup();
        assert!(dispatcher.wait_event().unwrap().is_none());
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[test]
    fn full_queue_is_reported() {
        let dispatcher = Dispatcher::new(2).unwrap();
        dispatcher.submit(EventId::new(0, 1)).unwrap();
        dispatcher.submit(EventId::new(0, 2)).unwrap();
        assert!(matches!(
            dispatcher.submit(EventId::new(0, 3)),
            Err(DispatcherError::QueueFull(2))
        ));
        // wakeups bypass the capacity check
        dispatcher.wakeup();
        assert_eq!(dispatcher.pending_requests(), 3);
    }

    #[test]
    fn timer_fires_with_etime() {
        let dispatcher = Dispatcher::new(4).unwrap();
        dispatcher
            .submit_timeout(TIMER, Duration::from_millis(10))
            .unwrap();
        let event = next(&dispatcher);
        assert_eq!(event.id, TIMER);
        assert_eq!(event.errno(), Some(Errno::ETIME));
    }

    #[test]
    fn canceled_timer_reports_ecanceled() {
        let dispatcher = Dispatcher::new(4).unwrap();
        dispatcher
            .submit_timeout(TIMER, Duration::from_secs(30))
            .unwrap();
        dispatcher.submit_timeout_cancel(CANCEL, TIMER).unwrap();

        let mut seen = HashMap::new();
        for _ in 0..2 {
            let event = next(&dispatcher);
            seen.insert(event.id, event.outcome);
        }
        assert_eq!(seen[&CANCEL], Ok(0));
        assert_eq!(seen[&TIMER], Err(Errno::ECANCELED));
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[test]
    fn cancel_of_finished_operation_is_enoent() {
        let dispatcher = Dispatcher::new(4).unwrap();
        dispatcher
            .submit_timeout(TIMER, Duration::from_millis(1))
            .unwrap();
        assert_eq!(next(&dispatcher).errno(), Some(Errno::ETIME));
        dispatcher.submit_timeout_cancel(CANCEL, TIMER).unwrap();
        let event = next(&dispatcher);
        assert_eq!(event.id, CANCEL);
        assert_eq!(event.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn timer_update_rearms() {
        let dispatcher = Dispatcher::new(4).unwrap();
        dispatcher
            .submit_timeout(TIMER, Duration::from_secs(30))
            .unwrap();
        dispatcher
            .submit_timeout_update(CANCEL, TIMER, Duration::from_millis(5))
            .unwrap();
        assert_eq!(next(&dispatcher).outcome, Ok(0));
        let fired = next(&dispatcher);
        assert_eq!(fired.id, TIMER);
        assert_eq!(fired.errno(), Some(Errno::ETIME));
    }

    #[test]
    fn linked_recv_wins_over_timer() {
        let dispatcher = Dispatcher::new(4).unwrap();
        let socket = dispatcher.bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = socket.local_addr().unwrap();
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        dispatcher
            .submit_recvmsg_with_timeout(WAIT, TIMER, socket, vec![0; 16], Duration::from_secs(30))
            .unwrap();
        client.send_to(&[0, 4, 0, 1], target).unwrap();

        let received = next(&dispatcher);
        assert_eq!(received.id, WAIT);
        assert_eq!(received.outcome, Ok(4));
        match received.payload {
            Payload::Datagram { buf, peer } => {
                assert_eq!(&buf[..4], &[0, 4, 0, 1]);
                assert_eq!(peer, Some(client.local_addr().unwrap()));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        let timer = next(&dispatcher);
        assert_eq!(timer.id, TIMER);
        assert_eq!(timer.errno(), Some(Errno::ECANCELED));
    }

    #[test]
    fn linked_timer_expiry_cancels_recv() {
        let dispatcher = Dispatcher::new(4).unwrap();
        let socket = dispatcher.bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        dispatcher
            .submit_recvmsg_with_timeout(WAIT, TIMER, socket, vec![0; 16], Duration::from_millis(10))
            .unwrap();

        let recv = next(&dispatcher);
        assert_eq!(recv.id, WAIT);
        assert_eq!(recv.errno(), Some(Errno::ECANCELED));
        let timer = next(&dispatcher);
        assert_eq!(timer.errno(), Some(Errno::ETIME));
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[test]
    fn recvmsg_delivers_datagram_and_sender() {
        let dispatcher = Dispatcher::new(4).unwrap();
        let socket = dispatcher.bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = socket.local_addr().unwrap();
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        dispatcher.submit_recvmsg(WAIT, socket, vec![0; 16]).unwrap();
        client.send_to(&[0, 5, 0, 5, 0], target).unwrap();

        let received = next(&dispatcher);
        assert_eq!(received.id, WAIT);
        assert_eq!(received.outcome, Ok(5));
        match received.payload {
            Payload::Datagram { buf, peer } => {
                assert_eq!(&buf[..5], &[0, 5, 0, 5, 0]);
                assert_eq!(peer, Some(client.local_addr().unwrap()));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[test]
    fn canceled_recvmsg_reports_ecanceled() {
        let dispatcher = Dispatcher::new(4).unwrap();
        let socket = dispatcher.bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        dispatcher.submit_recvmsg(WAIT, socket, vec![0; 16]).unwrap();
        dispatcher.submit_cancel(CANCEL, WAIT).unwrap();

        let mut seen = HashMap::new();
        for _ in 0..2 {
            let event = next(&dispatcher);
            if event.id == WAIT {
                assert!(matches!(event.payload, Payload::Datagram { peer: None, .. }));
            }
            seen.insert(event.id, event.outcome);
        }
        assert_eq!(seen[&CANCEL], Ok(0));
        assert_eq!(seen[&WAIT], Err(Errno::ECANCELED));
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[test]
    fn cancel_after_recvmsg_completed_is_enoent() {
        let dispatcher = Dispatcher::new(4).unwrap();
        let socket = dispatcher.bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = socket.local_addr().unwrap();
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        dispatcher.submit_recvmsg(WAIT, socket, vec![0; 16]).unwrap();
        client.send_to(&[0, 4, 0, 1], target).unwrap();
        assert_eq!(next(&dispatcher).outcome, Ok(4));

        dispatcher.submit_cancel(CANCEL, WAIT).unwrap();
        let event = next(&dispatcher);
        assert_eq!(event.id, CANCEL);
        assert_eq!(event.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn sendto_delivers_datagram() {
        let dispatcher = Dispatcher::new(4).unwrap();
        let socket = dispatcher.bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        dispatcher
            .submit_sendto(
                EventId::new(2, 3),
                socket,
                Bytes::from_static(b"\0\x03\0\x01hi"),
                client.local_addr().unwrap(),
            )
            .unwrap();
        assert_eq!(next(&dispatcher).outcome, Ok(6));

        let mut buf = [0u8; 16];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"\0\x03\0\x01hi");
    }

    #[test]
    fn readv_fills_buffers_in_order() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"abcdefghij").unwrap();
        let dispatcher = Dispatcher::new(4).unwrap();

        dispatcher
            .submit_readv(
                EventId::new(0, 5),
                Arc::new(file),
                2,
                vec![vec![0; 3], vec![0; 10]],
            )
            .unwrap();
        let event = next(&dispatcher);
        assert_eq!(event.outcome, Ok(8));
        match event.payload {
            Payload::Buffers(bufs) => {
                assert_eq!(bufs[0], b"cde");
                assert_eq!(&bufs[1][..5], b"fghij");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}

// Worker thread pool
//
// Each worker is one OS thread owning one dispatcher and a fixed array of
// session slots. A session stays on the worker that accepted it for its
// whole life, so session state is never shared between threads.
//
// The only cross-thread handoff is the per-worker semaphore counting free
// slots: the listener acquires a permit and claims a slot, the worker gives
// the permit back once the session has closed.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::buffer_pool::BufferPool;
use crate::config::LoadBalanceStrategy;
use crate::dispatcher::{Dispatcher, EventId, Payload};
use crate::error::{Result, TftpError};
use crate::session::{START, Session, SessionState, TERMINATE};
use crate::stats::{ServerStats, StatsSink};

// Worst case per session: linked receive + timer, plus a stray UNKNOWN_TID
// reply or a timer cancel
const OPS_PER_SESSION: usize = 4;

/// Server-wide settings and collaborators shared by every session.
pub struct ServerInfo {
    pub root_dir: PathBuf,
    /// Address session sockets bind to, port chosen by the OS
    pub local_ip: IpAddr,
    pub retries: u8,
    pub timeout_secs: u8,
    pub adaptive_timeout: bool,
    pub stats: Arc<ServerStats>,
    pub sink: Arc<dyn StatsSink>,
}

/// Worker thread statistics
#[derive(Debug)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub sessions_started: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub events_processed: AtomicU64,
}

impl WorkerStats {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            sessions_started: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
        }
    }
}

/// A claimed session slot, valid until the session closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket {
    pub worker: usize,
    pub session: u16,
}

struct Worker {
    dispatcher: Arc<Dispatcher>,
    semaphore: Arc<Semaphore>,
    slots: Arc<[AtomicBool]>,
    stats: Arc<WorkerStats>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn busy(&self, max_sessions: usize) -> usize {
        max_sessions.saturating_sub(self.semaphore.available_permits())
    }

    fn release(&self, session: u16) {
        self.slots[usize::from(session)].store(false, Ordering::Release);
        self.semaphore.add_permits(1);
    }
}

/// Worker thread pool handle
pub struct WorkerPool {
    workers: Vec<Worker>,
    max_sessions: usize,
    strategy: LoadBalanceStrategy,
    round_robin: AtomicUsize,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Start `workers` threads with `max_sessions` slots each.
    pub fn new(
        workers: usize,
        max_sessions: usize,
        strategy: LoadBalanceStrategy,
        info: Arc<ServerInfo>,
    ) -> Result<Self> {
        if workers == 0 || !(1..=usize::from(u16::MAX)).contains(&max_sessions) {
            return Err(TftpError::Tftp(format!(
                "Invalid worker pool size: {} workers x {} sessions",
                workers, max_sessions
            )));
        }

        info!(
            "Creating worker pool with {} workers, {} sessions per worker",
            workers, max_sessions
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            workers: Vec::with_capacity(workers),
            max_sessions,
            strategy,
            round_robin: AtomicUsize::new(0),
            shutdown: shutdown.clone(),
        };

        for worker_id in 0..workers {
            let dispatcher = Arc::new(Dispatcher::new(max_sessions * OPS_PER_SESSION)?);
            let semaphore = Arc::new(Semaphore::new(max_sessions));
            let slots: Arc<[AtomicBool]> =
                (0..max_sessions).map(|_| AtomicBool::new(false)).collect();
            let stats = Arc::new(WorkerStats::new(worker_id));

            let thread = {
                let context = WorkerContext {
                    dispatcher: dispatcher.clone(),
                    semaphore: semaphore.clone(),
                    slots: slots.clone(),
                    stats: stats.clone(),
                    info: info.clone(),
                    shutdown: shutdown.clone(),
                };
                std::thread::Builder::new()
                    .name(format!("tftp-worker-{}", worker_id))
                    .spawn(move || worker_thread(context))?
            };

            pool.workers.push(Worker {
                dispatcher,
                semaphore,
                slots,
                stats,
                thread: Some(thread),
            });
        }

        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Claim a free session slot, waiting until the chosen worker has one.
    pub async fn new_session(&self) -> Result<SessionTicket> {
        let loads: Vec<usize> = self
            .workers
            .iter()
            .map(|w| w.busy(self.max_sessions))
            .collect();
        let worker_id = select_worker(self.strategy, &loads, &self.round_robin);
        let worker = &self.workers[worker_id];

        let permit = worker
            .semaphore
            .acquire()
            .await
            .map_err(|_| TftpError::Tftp("Worker pool is shut down".to_string()))?;
        permit.forget();

        let claimed = worker.slots.iter().position(|slot| {
            slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });
        match claimed {
            Some(session) => Ok(SessionTicket {
                worker: worker_id,
                session: session as u16,
            }),
            None => {
                worker.semaphore.add_permits(1);
                Err(TftpError::Tftp(format!(
                    "Worker {} has a permit but no free session slot",
                    worker_id
                )))
            }
        }
    }

    /// Hand a request datagram to a claimed session.
    pub fn start_session(
        &self,
        ticket: SessionTicket,
        data: Vec<u8>,
        peer: SocketAddr,
    ) -> Result<()> {
        let worker = &self.workers[ticket.worker];
        let submitted = worker.dispatcher.submit_with_payload(
            EventId::new(ticket.session, START),
            Payload::Request { data, peer },
        );
        if let Err(e) = submitted {
            worker.release(ticket.session);
            return Err(e.into());
        }
        worker.stats.sessions_started.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Give a claimed session back without starting a transfer.
    pub fn terminate_session(&self, ticket: SessionTicket) -> Result<()> {
        let worker = &self.workers[ticket.worker];
        if let Err(e) = worker
            .dispatcher
            .submit(EventId::new(ticket.session, TERMINATE))
        {
            worker.release(ticket.session);
            return Err(e.into());
        }
        Ok(())
    }

    /// Print statistics
    pub fn print_stats(&self) {
        info!("=== Worker Pool Statistics ===");

        for worker in &self.workers {
            let stats = &worker.stats;
            info!(
                "Worker {}: started={}, closed={}, events={}, busy={}/{}",
                stats.worker_id,
                stats.sessions_started.load(Ordering::Relaxed),
                stats.sessions_closed.load(Ordering::Relaxed),
                stats.events_processed.load(Ordering::Relaxed),
                worker.busy(self.max_sessions),
                self.max_sessions,
            );
        }
    }

    /// Stop every worker once its in-flight sessions have drained.
    ///
    /// Blocks until the worker threads exit; must not run on an async
    /// executor thread.
    pub fn shutdown(mut self) {
        info!("Stopping worker pool");
        self.shutdown.store(true, Ordering::Release);
        for worker in &self.workers {
            worker.semaphore.close();
            worker.dispatcher.wakeup();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take()
                && thread.join().is_err()
            {
                error!("Worker {} panicked", worker.stats.worker_id);
            }
        }
        self.print_stats();
    }
}

/// Select worker based on load balancing strategy
///
/// `loads` holds the number of sessions checked out on each worker.
pub fn select_worker(
    strategy: LoadBalanceStrategy,
    loads: &[usize],
    round_robin_counter: &AtomicUsize,
) -> usize {
    match strategy {
        LoadBalanceStrategy::RoundRobin => {
            round_robin_counter.fetch_add(1, Ordering::Relaxed) % loads.len()
        }
        LoadBalanceStrategy::LeastBusy => loads
            .iter()
            .position(|&load| load == 0)
            .or_else(|| {
                loads
                    .iter()
                    .enumerate()
                    .min_by_key(|&(_, load)| *load)
                    .map(|(idx, _)| idx)
            })
            .unwrap_or(0),
    }
}

struct WorkerContext {
    dispatcher: Arc<Dispatcher>,
    semaphore: Arc<Semaphore>,
    slots: Arc<[AtomicBool]>,
    stats: Arc<WorkerStats>,
    info: Arc<ServerInfo>,
    shutdown: Arc<AtomicBool>,
}

/// Worker thread: route completions to sessions until shutdown is requested
/// and nothing is left in flight.
fn worker_thread(context: WorkerContext) {
    let WorkerContext {
        dispatcher,
        semaphore,
        slots,
        stats,
        info,
        shutdown,
    } = context;
    let worker_id = stats.worker_id;
    let buffers = BufferPool::for_datagrams();
    let mut sessions: Vec<Session> = (0..slots.len())
        .map(|id| {
            Session::new(
                id as u16,
                dispatcher.clone(),
                info.clone(),
                buffers.clone(),
                slots.clone(),
            )
        })
        .collect();

    debug!("Worker {} starting with {} session slots", worker_id, sessions.len());

    while !shutdown.load(Ordering::Acquire) || dispatcher.pending_requests() != 0 {
        let event = match dispatcher.wait_event() {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                error!("Worker {}: dispatcher failed: {}", worker_id, e);
                std::process::exit(1);
            }
        };
        stats.events_processed.fetch_add(1, Ordering::Relaxed);

        let session_id = event.id.session();
        let Some(session) = sessions.get_mut(usize::from(session_id)) else {
            error!("Worker {}: event for unknown session {}", worker_id, session_id);
            std::process::exit(1);
        };
        match session.on_event(event) {
            Ok(SessionState::Closed) => {
                stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
                semaphore.add_permits(1);
            }
            Ok(SessionState::Idle) => {}
            Err(e) => {
                error!("Worker {}: session {} failed: {}", worker_id, session_id, e);
                std::process::exit(1);
            }
        }
    }

    info!("Worker {} shutting down", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TracingStatsSink;
    use std::time::Duration;
    use tempfile::TempDir;

    fn info(root: &TempDir) -> Arc<ServerInfo> {
        Arc::new(ServerInfo {
            root_dir: root.path().to_path_buf(),
            local_ip: "127.0.0.1".parse().unwrap(),
            retries: 1,
            timeout_secs: 1,
            adaptive_timeout: false,
            stats: Arc::new(ServerStats::new()),
            sink: Arc::new(TracingStatsSink),
        })
    }

    #[test]
    fn test_select_worker_round_robin() {
        let counter = AtomicUsize::new(0);
        let loads = [3, 0, 1, 2];

        for i in 0..8 {
            let worker_id = select_worker(LoadBalanceStrategy::RoundRobin, &loads, &counter);
            assert_eq!(worker_id, i % loads.len());
        }
    }

    #[test]
    fn test_select_worker_least_busy() {
        let counter = AtomicUsize::new(0);

        // an idle worker wins even when it is not first
        assert_eq!(
            select_worker(LoadBalanceStrategy::LeastBusy, &[2, 1, 0, 0], &counter),
            2
        );
        assert_eq!(
            select_worker(LoadBalanceStrategy::LeastBusy, &[4, 2, 3], &counter),
            1
        );
        assert_eq!(
            select_worker(LoadBalanceStrategy::LeastBusy, &[5, 5], &counter),
            0
        );
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sessions_wait_for_free_slots() {
        let root = TempDir::new().unwrap();
        let pool = WorkerPool::new(1, 2, LoadBalanceStrategy::LeastBusy, info(&root)).unwrap();

        let first = pool.new_session().await.unwrap();
        let second = pool.new_session().await.unwrap();
        assert_eq!((first.worker, first.session), (0, 0));
        assert_eq!(second.session, 1);

        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.new_session()).await;
        assert!(blocked.is_err());

        pool.terminate_session(first).unwrap();
        let third = tokio::time::timeout(Duration::from_secs(5), pool.new_session())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.session, 0);

        pool.terminate_session(second).unwrap();
        pool.terminate_session(third).unwrap();
        tokio::task::spawn_blocking(move || pool.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn least_busy_spreads_sessions() {
        let root = TempDir::new().unwrap();
        let pool = WorkerPool::new(3, 4, LoadBalanceStrategy::LeastBusy, info(&root)).unwrap();

        let mut workers = Vec::new();
        for _ in 0..3 {
            workers.push(pool.new_session().await.unwrap().worker);
        }
        workers.sort_unstable();
        assert_eq!(workers, vec![0, 1, 2]);
        assert_eq!(pool.worker_count(), 3);

        tokio::task::spawn_blocking(move || pool.shutdown())
            .await
            .unwrap();
    }
}

//! Kernel inspection queue binding and the packet-processing thread.
//!
//! The netlink socket is read non-blocking. An empty read sleeps for
//! [`IDLE_BACKOFF`] before checking the stop flag again, so the first packet
//! after an idle spell can wait up to that long and an idle thread wakes
//! about 500 times a second. In exchange a stop request is seen within one
//! back-off without closing the socket under the thread.

use crossbeam_channel::{bounded, RecvTimeoutError};
use nfq::Queue;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::GateError;
use crate::inspect::PacketInspector;

/// Back-off when the queue has nothing pending.
const IDLE_BACKOFF: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl From<Verdict> for nfq::Verdict {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Accept => nfq::Verdict::Accept,
            Verdict::Drop => nfq::Verdict::Drop,
        }
    }
}

/// Outcome of one receive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    Handled(Verdict),
    Idle,
}

/// A bound inspection queue. Every received packet gets exactly one verdict.
pub trait QueueBackend {
    /// Receive at most one packet, hand its bytes to `handler` and issue
    /// the returned verdict before returning.
    fn recv_one(&mut self, handler: &mut dyn FnMut(&[u8]) -> Verdict) -> io::Result<Recv>;

    fn unbind(&mut self) -> io::Result<()>;
}

/// Binds queues. The binder moves to the packet thread, the queue never
/// leaves it.
pub trait QueueBinder: Send + 'static {
    type Queue: QueueBackend;

    fn bind(&self, queue_num: u16) -> io::Result<Self::Queue>;
}

/// NFQUEUE via netlink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NfqBinder;

pub struct NfqQueue {
    queue: Queue,
    queue_num: u16,
}

impl QueueBinder for NfqBinder {
    type Queue = NfqQueue;

    fn bind(&self, queue_num: u16) -> io::Result<NfqQueue> {
        let mut queue = Queue::open()?;
        queue.bind(queue_num)?;
        queue.set_nonblocking(true);
        Ok(NfqQueue { queue, queue_num })
    }
}

impl QueueBackend for NfqQueue {
    fn recv_one(&mut self, handler: &mut dyn FnMut(&[u8]) -> Verdict) -> io::Result<Recv> {
        let mut msg = match self.queue.recv() {
            Ok(msg) => msg,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Recv::Idle),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Recv::Idle),
            Err(e) => return Err(e),
        };
        let verdict = handler(msg.get_payload());
        msg.set_verdict(verdict.into());
        self.queue.verdict(msg)?;
        Ok(Recv::Handled(verdict))
    }

    fn unbind(&mut self) -> io::Result<()> {
        self.queue.unbind(self.queue_num)
    }
}

/// Verdict counters for one listener run.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub accepted: AtomicU64,
    pub dropped: AtomicU64,
}

impl ListenerStats {
    fn record(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Accept => &self.accepted,
            Verdict::Drop => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to the packet-processing thread.
pub struct PacketQueueListener {
    queue_num: u16,
    stop: Arc<AtomicBool>,
    done: crossbeam_channel::Receiver<()>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<ListenerStats>,
}

impl PacketQueueListener {
    /// Spawn the packet thread and wait until it has bound `queue_num`.
    ///
    /// `on_failure` runs on the packet thread if receiving fails after a
    /// successful bind.
    pub fn start<B, F>(
        binder: B,
        queue_num: u16,
        inspector: PacketInspector,
        on_failure: F,
    ) -> Result<Self, GateError>
    where
        B: QueueBinder,
        F: FnOnce() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ListenerStats::default());
        let (ready_tx, ready_rx) = bounded::<io::Result<()>>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let thread_stop = stop.clone();
        let thread_stats = stats.clone();
        let handle = thread::Builder::new()
            .name(format!("nfqueue-{}", queue_num))
            .spawn(move || {
                let mut queue = match binder.bind(queue_num) {
                    Ok(queue) => {
                        let _ = ready_tx.send(Ok(()));
                        queue
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                info!(queue_num, "packet inspection started");
                let failed = run_loop(&mut queue, &inspector, &thread_stop, &thread_stats);

                if let Err(e) = queue.unbind() {
                    warn!(queue_num, error = %e, "failed to unbind queue");
                }
                if failed {
                    on_failure();
                }
                let _ = done_tx.send(());
            })
            .map_err(|source| GateError::QueueBind { queue_num, source })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue_num,
                stop,
                done: done_rx,
                handle: Some(handle),
                stats,
            }),
            Ok(Err(source)) => {
                let _ = handle.join();
                Err(GateError::QueueBind { queue_num, source })
            }
            Err(_) => {
                let _ = handle.join();
                Err(GateError::QueueBind {
                    queue_num,
                    source: io::Error::other("packet thread exited before binding"),
                })
            }
        }
    }

    pub fn queue_num(&self) -> u16 {
        self.queue_num
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Whether the packet thread has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Signal the thread and wait up to `timeout` for it to unbind and exit.
    /// A thread that does not finish in time is left detached.
    pub fn stop(self, timeout: Duration) {
        self.shutdown(Some(timeout));
    }

    /// Signal the thread and wait for it to exit, including any failure
    /// callback still running on it.
    pub fn join(self) {
        self.shutdown(None);
    }

    fn shutdown(mut self, timeout: Option<Duration>) {
        self.stop.store(true, Ordering::Release);

        let finished = match timeout {
            Some(timeout) => match self.done.recv_timeout(timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        queue_num = self.queue_num,
                        ?timeout,
                        "packet thread did not stop in time, detaching"
                    );
                    false
                }
            },
            None => true,
        };

        if finished {
            if let Some(handle) = self.handle.take() {
                if handle.join().is_err() {
                    error!(queue_num = self.queue_num, "packet thread panicked");
                }
            }
        }

        info!(
            queue_num = self.queue_num,
            accepted = self.stats.accepted.load(Ordering::Relaxed),
            dropped = self.stats.dropped.load(Ordering::Relaxed),
            "packet inspection stopped"
        );
    }
}

/// Returns `true` if the loop ended because receiving failed.
fn run_loop<Q: QueueBackend>(
    queue: &mut Q,
    inspector: &PacketInspector,
    stop: &AtomicBool,
    stats: &ListenerStats,
) -> bool {
    let mut handler = |payload: &[u8]| inspector.inspect(payload);

    while !stop.load(Ordering::Acquire) {
        match queue.recv_one(&mut handler) {
            Ok(Recv::Handled(verdict)) => stats.record(verdict),
            Ok(Recv::Idle) => thread::sleep(IDLE_BACKOFF),
            Err(e) => {
                error!(error = %e, "inspection queue receive failed");
                return true;
            }
        }
    }
    debug!("packet loop stopping");
    false
}

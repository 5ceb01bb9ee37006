//! The per-connection timeout scheduler.
//!
//! A single daemon thread drains a min-heap of monotonic deadlines. Each
//! entry carries a cancellation flag that may be flipped by whoever holds
//! the owning connection's lock; the daemon re-checks the flag after
//! acquiring that lock, because a cancellation may have slipped in while
//! it was waiting. The lock order is fixed: the daemon releases its own
//! lock before taking the connection's, and callbacks run with only the
//! connection lock held so they are free to schedule follow-up timeouts.
//!
//! `stop` never joins the daemon. After it returns the daemon touches only
//! scheduler-local memory, so an owner being torn down cannot be observed
//! by a late-firing callback.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Instant;

use crate::conn::{ConnShared, ConnState};
use crate::stack::IpStack;

/// A timeout callback. Runs under the connection lock. It may return a
/// follow-up action to run after every lock is released (used for work
/// that needs locks above the connection in the hierarchy, like removing
/// the connection from its host).
pub(crate) type FireCallback<S> =
    Box<dyn FnOnce(&ConnShared<S>, &mut ConnState) -> Option<PostFire> + Send>;

pub(crate) type PostFire = Box<dyn FnOnce() + Send>;

/// Cancellation handle for a scheduled timeout. Cancelling is only safe
/// under the owning connection's lock, and the canceller must also drop
/// its record of the handle; the scheduler lazily discards the entry.
pub(crate) struct TimeoutHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimeoutHandle {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct Entry<S: IpStack> {
    deadline: Instant,
    /// Tie-break so equal deadlines fire in insertion order.
    id: u64,
    cancelled: Arc<AtomicBool>,
    callback: FireCallback<S>,
}

impl<S: IpStack> PartialEq for Entry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl<S: IpStack> Eq for Entry<S> {}

impl<S: IpStack> PartialOrd for Entry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<S: IpStack> Ord for Entry<S> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the std max-heap pops the earliest deadline.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.id.cmp(&self.id))
    }
}

struct Queue<S: IpStack> {
    heap: BinaryHeap<Entry<S>>,
    stopped: bool,
    next_id: u64,
}

struct Shared<S: IpStack> {
    owner: Weak<ConnShared<S>>,
    queue: Mutex<Queue<S>>,
    work: Condvar,
}

pub(crate) struct TimeoutScheduler<S: IpStack> {
    shared: Arc<Shared<S>>,
}

impl<S: IpStack> TimeoutScheduler<S> {
    /// Spawns the daemon. `owner` is the connection whose lock callbacks
    /// run under; the scheduler holds it weakly so a dropped connection
    /// ends the daemon instead of leaking it.
    pub(crate) fn start(owner: Weak<ConnShared<S>>) -> TimeoutScheduler<S> {
        let shared = Arc::new(Shared {
            owner,
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                stopped: false,
                next_id: 0,
            }),
            work: Condvar::new(),
        });
        let daemon = shared.clone();
        std::thread::spawn(move || daemon.run());
        TimeoutScheduler { shared }
    }

    /// Enqueues `callback` to fire at `deadline`. Must be called with the
    /// owning connection's lock held.
    pub(crate) fn add_timeout(&self, deadline: Instant, callback: FireCallback<S>) -> TimeoutHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut queue = self.shared.queue.lock().unwrap();
        let id = queue.next_id;
        queue.next_id += 1;
        let was_empty = queue.heap.is_empty();
        queue.heap.push(Entry {
            deadline,
            id,
            cancelled: cancelled.clone(),
            callback,
        });
        // The daemon may also be sleeping toward a later deadline; wake it
        // whenever the front of the heap could have changed.
        if was_empty || queue.heap.peek().map(|e| e.id) == Some(id) {
            self.shared.work.notify_all();
        }
        drop(queue);
        TimeoutHandle { cancelled }
    }

    /// Raises the stopped flag and wakes the daemon. May return before the
    /// daemon does; that is fine, see the module docs.
    pub(crate) fn stop(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.stopped = true;
        queue.heap.clear();
        drop(queue);
        self.shared.work.notify_all();
    }
}

impl<S: IpStack> Shared<S> {
    fn run(self: Arc<Self>) {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if queue.stopped {
                return;
            }

            let Some(deadline) = queue.heap.peek().map(|e| e.deadline) else {
                queue = self.work.wait(queue).unwrap();
                continue;
            };

            let now = Instant::now();
            if now < deadline {
                // Wait on the condvar rather than a bare sleep so that a
                // stop or a newly added earlier deadline interrupts us.
                let (guard, _) = self.work.wait_timeout(queue, deadline - now).unwrap();
                queue = guard;
                continue;
            }

            let Some(entry) = queue.heap.pop() else {
                continue;
            };
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }

            // Lock order: connection before scheduler. Release ours, take
            // the owner's, then re-check under it.
            drop(queue);
            let Some(owner) = self.owner.upgrade() else {
                // The connection is gone; nothing can un-stop us.
                return;
            };
            let mut state = owner.state.lock().unwrap();
            let stopped = self.queue.lock().unwrap().stopped;
            let post = if !stopped && !entry.cancelled.load(Ordering::Acquire) {
                (entry.callback)(&owner, &mut state)
            } else {
                None
            };
            drop(state);
            drop(owner);
            if let Some(post) = post {
                post();
            }

            queue = self.queue.lock().unwrap();
        }
    }
}

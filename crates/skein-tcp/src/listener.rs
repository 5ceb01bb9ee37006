//! The listener: a bounded accept queue of connections created by the
//! host on inbound SYNs.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::conn::Connection;
use crate::error::{Result, TcpError};
use crate::host::HostCore;
use crate::stack::IpStack;

/// Upper bound on connections waiting to be accepted. SYNs beyond it are
/// dropped without creating state.
pub const ACCEPT_QUEUE_LIMIT: usize = 1024;

struct AcceptQueue<S: IpStack> {
    pending: VecDeque<Connection<S>>,
    closed: bool,
}

pub(crate) struct ListenerShared<S: IpStack> {
    queue: Mutex<AcceptQueue<S>>,
    ready: Condvar,
}

impl<S: IpStack> ListenerShared<S> {
    pub(crate) fn new() -> Arc<ListenerShared<S>> {
        Arc::new(ListenerShared {
            queue: Mutex::new(AcceptQueue {
                pending: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        })
    }

    /// Enqueues a newly created connection. Called by the host under its
    /// exclusive lock only. Rejects when full or closed.
    pub(crate) fn offer(&self, conn: Connection<S>) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.closed || queue.pending.len() >= ACCEPT_QUEUE_LIMIT {
            return false;
        }
        queue.pending.push_back(conn);
        drop(queue);
        self.ready.notify_one();
        true
    }
}

/// A listening socket. Closing it resets every connection still waiting
/// in the queue.
pub struct Listener<S: IpStack> {
    shared: Arc<ListenerShared<S>>,
    host: Weak<HostCore<S>>,
    key: (S::Addr, u16),
}

impl<S: IpStack> Listener<S> {
    pub(crate) fn new(
        shared: Arc<ListenerShared<S>>,
        host: Weak<HostCore<S>>,
        key: (S::Addr, u16),
    ) -> Listener<S> {
        Listener { shared, host, key }
    }

    pub fn local_addr(&self) -> (S::Addr, u16) {
        self.key
    }

    /// Blocks until a connection is available or the listener closes.
    pub fn accept(&self) -> Result<Connection<S>> {
        let mut queue = self.shared.queue.lock().unwrap();
        loop {
            if queue.closed {
                return Err(TcpError::ListenerClosed);
            }
            if let Some(conn) = queue.pending.pop_front() {
                return Ok(conn);
            }
            queue = self.shared.ready.wait(queue).unwrap();
        }
    }

    /// Closes the listener: removes it from the host, resets every queued
    /// connection and wakes all blocked accepts. Fails on a second close.
    ///
    /// The host's exclusive lock is taken before the listener's own lock;
    /// segment dispatch acquires them in the same order, which is what
    /// makes this safe.
    pub fn close(&self) -> Result<()> {
        let Some(host) = self.host.upgrade() else {
            return self.close_detached();
        };
        let mut host_state = host.state.write().unwrap();
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.closed {
            return Err(TcpError::ListenerClosed);
        }
        if host_state
            .listeners
            .get(&self.key)
            .is_some_and(|l| Arc::ptr_eq(l, &self.shared))
        {
            host_state.listeners.remove(&self.key);
        }
        for conn in queue.pending.drain(..) {
            let conn_key = conn.shared.key();
            if host_state
                .conns
                .get(&conn_key)
                .is_some_and(|c| Arc::ptr_eq(c, &conn.shared))
            {
                host_state.conns.remove(&conn_key);
            }
            conn.shared.abort();
        }
        queue.closed = true;
        drop(queue);
        drop(host_state);
        self.shared.ready.notify_all();
        Ok(())
    }

    /// Close when the host is already gone: only local state to clear.
    fn close_detached(&self) -> Result<()> {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.closed {
            return Err(TcpError::ListenerClosed);
        }
        queue.closed = true;
        for conn in queue.pending.drain(..) {
            conn.shared.abort();
        }
        drop(queue);
        self.shared.ready.notify_all();
        Ok(())
    }
}

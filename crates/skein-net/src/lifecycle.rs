//! The up/down lifecycle primitive shared by devices and other daemon
//! owners.
//!
//! A [`Lifecycle`] manages a one-shot up/down transition and the daemon
//! threads that live between the two. The transition lock is dedicated:
//! it is never the lock protecting the owner's state, so a slow `pre` or
//! `post` hook cannot block read-only observers of that state. `pre` and
//! `post` acquire whatever state locks they need themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::Result;

/// Cooperative stop flag handed to every daemon. Daemons must check it
/// between blocking iterations and return promptly once raised.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn raise(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// A daemon body. It receives the stop signal and runs until the signal is
/// raised.
pub type Daemon = Box<dyn FnOnce(StopSignal) + Send + 'static>;

#[derive(Debug)]
struct Running {
    stop: StopSignal,
    daemons: Vec<JoinHandle<()>>,
}

/// Manages a one-shot up/down transition and a supervised set of daemons.
///
/// `bring_up` runs a `pre` hook, arms a fresh stop signal and spawns the
/// daemons; `bring_down` raises the signal, joins every daemon and then
/// runs a `post` hook. Both are idempotent no-ops when already in the
/// target state.
#[derive(Debug, Default)]
pub struct Lifecycle {
    transition: Mutex<Option<Running>>,
    up: AtomicBool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle::default()
    }

    /// True between a successful `bring_up` and the next `bring_down`.
    /// Lock-free, so it never blocks behind a slow transition hook.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Brings the owner up. If `pre` fails the daemons are not spawned and
    /// the owner stays down. No-op when already up.
    pub fn bring_up<F>(&self, pre: F, daemons: Vec<Daemon>) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut transition = self.transition.lock().unwrap();
        if transition.is_some() {
            return Ok(());
        }

        pre()?;

        let stop = StopSignal::default();
        let handles = daemons
            .into_iter()
            .map(|daemon| {
                let signal = stop.clone();
                std::thread::spawn(move || daemon(signal))
            })
            .collect();
        *transition = Some(Running {
            stop,
            daemons: handles,
        });
        self.up.store(true, Ordering::Release);
        Ok(())
    }

    /// Brings the owner down: raises the stop signal, joins every daemon,
    /// then runs `post`. After it returns no daemon spawned by the matching
    /// `bring_up` is still running. No-op when already down.
    pub fn bring_down<F>(&self, post: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut transition = self.transition.lock().unwrap();
        let Some(running) = transition.take() else {
            return Ok(());
        };
        self.up.store(false, Ordering::Release);

        running.stop.raise();
        for handle in running.daemons {
            // A panicking daemon already hit a bug; surface it.
            if handle.join().is_err() {
                tracing::error!("daemon thread panicked during shutdown");
            }
        }
        post()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn daemons_drain_on_bring_down() {
        let lifecycle = Lifecycle::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let t = ticks.clone();
        lifecycle
            .bring_up(
                || Ok(()),
                vec![Box::new(move |stop| {
                    while !stop.is_stopped() {
                        t.fetch_add(1, Ordering::Relaxed);
                        std::thread::sleep(Duration::from_millis(1));
                    }
                })],
            )
            .unwrap();
        assert!(lifecycle.is_up());

        std::thread::sleep(Duration::from_millis(10));
        lifecycle.bring_down(|| Ok(())).unwrap();
        assert!(!lifecycle.is_up());

        // The daemon has returned; the counter no longer moves.
        let frozen = ticks.load(Ordering::Relaxed);
        assert!(frozen > 0);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::Relaxed), frozen);
    }

    #[test]
    fn bring_up_twice_is_noop() {
        let lifecycle = Lifecycle::new();
        let spawns = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let s = spawns.clone();
            lifecycle
                .bring_up(
                    || Ok(()),
                    vec![Box::new(move |stop| {
                        s.fetch_add(1, Ordering::Relaxed);
                        while !stop.is_stopped() {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    })],
                )
                .unwrap();
        }

        lifecycle.bring_down(|| Ok(())).unwrap();
        assert_eq!(spawns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failed_pre_leaves_owner_down() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle.bring_up(
            || Err(crate::NetError::InvalidState("pre hook refused")),
            vec![],
        );
        assert!(err.is_err());
        assert!(!lifecycle.is_up());
    }
}

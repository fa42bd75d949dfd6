//! Single-flight coordination.
//!
//! One caller becomes the leader and owns the expensive operation; everyone
//! arriving while it runs is queued as a waiter. The waiter queue is an
//! explicit FIFO of one-shot senders so that "every waiter settles" can be
//! checked directly instead of relying on runtime bookkeeping.
//!
//! Each flight carries a generation number. Cancelling bumps the generation,
//! so a leader that finishes after its flight was cancelled finds a stale
//! generation and its result is discarded.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Waiter<T> = oneshot::Sender<Result<T>>;

enum FlightState<T> {
    Idle,
    InFlight {
        generation: u64,
        waiters: VecDeque<Waiter<T>>,
    },
    /// Terminal until reopened. Joins are rejected with `SessionCancelled`.
    Closed,
}

struct Inner<T> {
    state: FlightState<T>,
    next_generation: u64,
}

/// Observable state of a [`SingleFlight`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlightStatus {
    Idle,
    InFlight { waiters: usize },
    Closed,
}

pub(crate) struct SingleFlight<T> {
    inner: Mutex<Inner<T>>,
    /// Delivered to waiters when a leader vanishes without completing.
    abandoned: Error,
}

/// Result of joining a flight.
pub(crate) enum Join<T> {
    /// Fast path satisfied without any flight.
    Ready(T),
    /// Caller started a new flight and must drive it to completion.
    Leader(Completion<T>, Outcome<T>),
    /// Caller queued behind the flight already running.
    Follower(Outcome<T>),
}

/// Receiving half of a waiter.
pub(crate) struct Outcome<T> {
    rx: oneshot::Receiver<Result<T>>,
    abandoned: Error,
}

impl<T> Outcome<T> {
    pub(crate) async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(self.abandoned),
        }
    }
}

/// Leader's obligation to settle its flight.
///
/// Dropping it without calling [`Completion::finish`] rejects every waiter,
/// so a panicking or aborted leader cannot strand anyone.
pub(crate) struct Completion<T> {
    flight: Arc<SingleFlight<T>>,
    generation: u64,
    done: bool,
}

impl<T: Clone> SingleFlight<T> {
    pub(crate) fn new(abandoned: Error) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: FlightState::Idle,
                next_generation: 0,
            }),
            abandoned,
        })
    }

    pub(crate) fn status(&self) -> FlightStatus {
        match &self.inner.lock().state {
            FlightState::Idle => FlightStatus::Idle,
            FlightState::InFlight { waiters, .. } => FlightStatus::InFlight {
                waiters: waiters.len(),
            },
            FlightState::Closed => FlightStatus::Closed,
        }
    }

    /// Join the running flight, or start one.
    ///
    /// `fast_path` runs under the state lock, only when no flight is running,
    /// and short-circuits the flight when it yields a value.
    pub(crate) fn join_with<F>(self: &Arc<Self>, fast_path: F) -> Result<Join<T>>
    where
        F: FnOnce() -> Option<T>,
    {
        let (tx, rx) = oneshot::channel();
        let outcome = Outcome {
            rx,
            abandoned: self.abandoned.clone(),
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match &mut inner.state {
            FlightState::Closed => Err(Error::SessionCancelled),
            FlightState::InFlight { waiters, .. } => {
                waiters.push_back(tx);
                Ok(Join::Follower(outcome))
            }
            FlightState::Idle => {
                if let Some(value) = fast_path() {
                    return Ok(Join::Ready(value));
                }

                let generation = inner.next_generation;
                inner.next_generation += 1;
                inner.state = FlightState::InFlight {
                    generation,
                    waiters: VecDeque::from([tx]),
                };

                let completion = Completion {
                    flight: Arc::clone(self),
                    generation,
                    done: false,
                };
                Ok(Join::Leader(completion, outcome))
            }
        }
    }

    /// Reject every waiter with `SessionCancelled` and invalidate the running
    /// flight. With `close`, further joins are refused until [`reopen`]; a
    /// closed flight stays closed either way.
    ///
    /// Returns the number of waiters rejected.
    ///
    /// [`reopen`]: SingleFlight::reopen
    pub(crate) fn cancel(&self, close: bool) -> usize {
        let waiters = {
            let mut inner = self.inner.lock();
            let next = if close || matches!(inner.state, FlightState::Closed) {
                FlightState::Closed
            } else {
                FlightState::Idle
            };
            match std::mem::replace(&mut inner.state, next) {
                FlightState::InFlight { waiters, .. } => waiters,
                FlightState::Idle | FlightState::Closed => VecDeque::new(),
            }
        };

        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(Error::SessionCancelled));
        }
        count
    }

    /// Leave the closed state. No effect otherwise.
    pub(crate) fn reopen(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, FlightState::Closed) {
            inner.state = FlightState::Idle;
        }
    }

    /// Settle `generation` if it is still the running flight.
    ///
    /// `commit` runs under the state lock before any waiter is released, so
    /// whatever it writes is visible to every waiter and cannot interleave
    /// with a cancel.
    fn settle<R>(&self, generation: u64, result: R, commit: impl FnOnce(R) -> Result<T>) -> bool {
        let mut inner = self.inner.lock();
        let current = matches!(
            inner.state,
            FlightState::InFlight { generation: g, .. } if g == generation
        );
        if !current {
            return false;
        }

        let outcome = commit(result);
        let FlightState::InFlight { waiters, .. } =
            std::mem::replace(&mut inner.state, FlightState::Idle)
        else {
            return false;
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        true
    }
}

impl<T: Clone> Completion<T> {
    /// Settle the flight. Returns `false` when it was cancelled in the
    /// meantime and `result` was discarded without running `commit`.
    pub(crate) fn finish<R>(mut self, result: R, commit: impl FnOnce(R) -> Result<T>) -> bool {
        self.done = true;
        self.flight.settle(self.generation, result, commit)
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let waiters = {
            let mut inner = self.flight.inner.lock();
            let current = matches!(
                inner.state,
                FlightState::InFlight { generation, .. } if generation == self.generation
            );
            if !current {
                return;
            }
            match std::mem::replace(&mut inner.state, FlightState::Idle) {
                FlightState::InFlight { waiters, .. } => waiters,
                FlightState::Idle | FlightState::Closed => VecDeque::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(self.flight.abandoned.clone()));
        }
    }
}

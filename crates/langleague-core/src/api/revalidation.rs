//! Single-flight bookkeeping for session revalidation.
//!
//! The first caller to observe a 401 becomes the leader and performs the one
//! revalidation call; everyone arriving while it runs gets a waiter and is
//! settled with the leader's outcome. The flag and the queue share one lock
//! that is never held across an `.await`.

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::ApiError;

/// Outcome broadcast to waiters: a replacement token (if the revalidation
/// produced one) or the revalidation error.
pub type Outcome = Result<Option<String>, ApiError>;

/// A caller parked behind the in-flight revalidation.
#[derive(Debug)]
pub struct PendingRequest {
    tx: oneshot::Sender<Outcome>,
}

#[derive(Debug, Default)]
struct State {
    in_flight: bool,
    queue: Vec<PendingRequest>,
}

#[derive(Debug, Default)]
pub struct Revalidation {
    state: Mutex<State>,
}

/// What a 401'd caller should do next.
#[derive(Debug)]
pub enum Ticket<'a> {
    Leader(LeaderGuard<'a>),
    Waiter(oneshot::Receiver<Outcome>),
}

impl Revalidation {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Become the leader if idle, otherwise enqueue behind the current one.
    pub fn join(&self) -> Ticket<'_> {
        let mut state = self.lock();
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.queue.push(PendingRequest { tx });
            debug!(queued = state.queue.len(), "Revalidation in flight, queueing request");
            Ticket::Waiter(rx)
        } else {
            state.in_flight = true;
            Ticket::Leader(LeaderGuard {
                owner: self,
                settled: false,
            })
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Clear the flag and take the queue in one critical section.
    fn drain(&self) -> Vec<PendingRequest> {
        let mut state = self.lock();
        state.in_flight = false;
        mem::take(&mut state.queue)
    }
}

/// Held by the leader for the duration of the revalidation call.
///
/// Dropping it unsettled clears the flag and drops every waiter's sender,
/// so waiters observe `RevalidationAborted` instead of hanging.
#[derive(Debug)]
pub struct LeaderGuard<'a> {
    owner: &'a Revalidation,
    settled: bool,
}

impl LeaderGuard<'_> {
    /// Revalidation succeeded; returns how many waiters were released.
    pub fn resolve(mut self, token: Option<String>) -> usize {
        self.settle(Ok(token))
    }

    /// Revalidation failed; returns how many waiters were rejected.
    pub fn reject(mut self, error: &ApiError) -> usize {
        self.settle(Err(error.clone()))
    }

    fn settle(&mut self, outcome: Outcome) -> usize {
        self.settled = true;
        let queue = self.owner.drain();
        let count = queue.len();
        for pending in queue {
            // A waiter whose caller went away has dropped its receiver.
            let _ = pending.tx.send(outcome.clone());
        }
        count
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let abandoned = self.owner.drain();
            warn!(queued = abandoned.len(), "Revalidation abandoned before settling");
        }
    }
}

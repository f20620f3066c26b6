//! Bounded admission gate.
//!
//! Every per-process rate limit (SSH connects, task assignment, result
//! download, node deletion, webhook fan-out) is a `Gate`: at most `limit`
//! operations in flight, at most `pending` more queued behind them. A
//! request that cannot even queue is rejected immediately — the caller
//! logs and drops it, and the next reconciler tick retries.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Admission gate with a bounded wait queue.
pub struct Gate {
    name: &'static str,
    limit: usize,
    /// Permits for operations actually running.
    slots: Arc<Semaphore>,
    /// Admission tickets: `limit + pending` in total. Holding a ticket
    /// means the request is either running or queued.
    tickets: Arc<Semaphore>,
}

/// Proof of admission. The slot is released when this is dropped.
pub struct GatePass {
    _ticket: OwnedSemaphorePermit,
    _slot: OwnedSemaphorePermit,
}

impl Gate {
    /// Create a gate allowing `limit` concurrent operations and `pending`
    /// queued waiters.
    pub fn new(name: &'static str, limit: usize, pending: usize) -> Self {
        Self {
            name,
            limit,
            slots: Arc::new(Semaphore::new(limit)),
            tickets: Arc::new(Semaphore::new(limit + pending)),
        }
    }

    /// Wait for a slot, or return `None` right away if the queue is full.
    pub async fn admit(&self) -> Option<GatePass> {
        let ticket = match self.tickets.clone().try_acquire_owned() {
            Ok(t) => t,
            Err(_) => {
                warn!(gate = self.name, "queue full, dropping request");
                return None;
            }
        };
        let slot = self.slots.clone().acquire_owned().await.ok()?;
        Some(GatePass {
            _ticket: ticket,
            _slot: slot,
        })
    }

    /// Take a slot only if one is free right now (no queuing).
    pub fn try_admit(&self) -> Option<GatePass> {
        let ticket = self.tickets.clone().try_acquire_owned().ok()?;
        let slot = self.slots.clone().try_acquire_owned().ok()?;
        Some(GatePass {
            _ticket: ticket,
            _slot: slot,
        })
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.limit - self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_limit_without_waiting() {
        let gate = Gate::new("test", 2, 1);
        let a = gate.admit().await;
        let b = gate.admit().await;
        assert!(a.is_some());
        assert!(b.is_some());
        assert_eq!(gate.in_flight(), 2);
    }

    #[tokio::test]
    async fn rejects_beyond_limit_plus_pending() {
        let gate = Gate::new("test", 1, 1);
        let _running = gate.admit().await.unwrap();
        // One more may queue; use try_admit to observe the slot is taken.
        assert!(gate.try_admit().is_none());
        // The queued ticket is still grantable...
        let ticket = gate.tickets.clone().try_acquire_owned();
        assert!(ticket.is_ok());
        // ...and with it held, a further request has nowhere to go.
        assert!(gate.try_admit().is_none());
    }

    #[tokio::test]
    async fn released_pass_frees_the_slot() {
        let gate = Gate::new("test", 1, 0);
        let pass = gate.admit().await.unwrap();
        assert_eq!(gate.in_flight(), 1);
        drop(pass);
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.admit().await.is_some());
    }

    #[tokio::test]
    async fn queued_waiter_runs_after_release() {
        let gate = Arc::new(Gate::new("test", 1, 1));
        let pass = gate.admit().await.unwrap();
        let g = gate.clone();
        let waiter = tokio::spawn(async move { g.admit().await.is_some() });
        tokio::task::yield_now().await;
        drop(pass);
        assert!(waiter.await.unwrap());
    }
}

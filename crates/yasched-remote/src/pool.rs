//! MachinePool — pooled, rate-limited access to remote machines.
//!
//! One cached `RemoteMachine` per ip, re-opened when the session dies.
//! Connect attempts pass the global connect gate
//! (`conn_machine_limit` / `conn_machine_pending`). Each node also
//! carries an operation mutex (deploy + upload + spawn never interleave
//! with a concurrent harvest on the same node) and idle metadata the
//! cloud coordinator reads for scale-down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use russh_keys::key::KeyPair;
use tokio::sync::Mutex;
use tracing::debug;

use yasched_core::Gate;

use crate::error::{RemoteError, RemoteResult};
use crate::machine::{ConnectOptions, RemoteMachine};

#[derive(Default)]
struct Slot {
    machine: Option<Arc<RemoteMachine>>,
    /// Serializes all operations against this node.
    lock: Arc<Mutex<()>>,
    /// When the node last left the busy state (or was first seen).
    free_since: Option<Instant>,
}

/// Pool of per-node SSH sessions.
pub struct MachinePool {
    keypair: Arc<KeyPair>,
    connect_gate: Gate,
    connect_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl MachinePool {
    pub fn new(keypair: Arc<KeyPair>, conn_limit: usize, conn_pending: usize) -> Self {
        Self {
            keypair,
            connect_gate: Gate::new("conn_machine", conn_limit, conn_pending),
            connect_timeout: Duration::from_secs(30),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get the cached machine for `ip`, connecting if absent or dead.
    /// A full connect queue rejects with `ConnectionLimit` (transient).
    pub async fn machine(
        &self,
        ip: &str,
        username: &str,
        jump: Option<(String, String)>,
    ) -> RemoteResult<Arc<RemoteMachine>> {
        {
            let slots = self.slots.lock().await;
            if let Some(machine) = slots.get(ip).and_then(|s| s.machine.clone()) {
                if !machine.is_closed().await {
                    return Ok(machine);
                }
            }
        }

        let _pass = self
            .connect_gate
            .admit()
            .await
            .ok_or(RemoteError::ConnectionLimit)?;

        let machine = Arc::new(
            RemoteMachine::connect(ConnectOptions {
                host: ip.to_string(),
                username: username.to_string(),
                keypair: self.keypair.clone(),
                connect_timeout: self.connect_timeout,
                jump,
            })
            .await?,
        );

        let mut slots = self.slots.lock().await;
        let slot = slots.entry(ip.to_string()).or_insert_with(|| Slot {
            free_since: Some(Instant::now()),
            ..Slot::default()
        });
        slot.machine = Some(machine.clone());
        Ok(machine)
    }

    /// The per-node operation mutex. Creates tracking state on first
    /// use, so idle time counts from registration.
    pub async fn node_lock(&self, ip: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(ip.to_string())
            .or_insert_with(|| Slot {
                free_since: Some(Instant::now()),
                ..Slot::default()
            })
            .lock
            .clone()
    }

    /// Record that a task now occupies this node.
    pub async fn mark_busy(&self, ip: &str) {
        if let Some(slot) = self.slots.lock().await.get_mut(ip) {
            slot.free_since = None;
        }
    }

    /// Record that this node went idle (task harvested or node created).
    pub async fn mark_free(&self, ip: &str) {
        if let Some(slot) = self.slots.lock().await.get_mut(ip) {
            if slot.free_since.is_none() {
                slot.free_since = Some(Instant::now());
            }
        }
    }

    /// How long the node has been continuously idle; `None` while busy
    /// or unknown.
    pub async fn idle_for(&self, ip: &str) -> Option<Duration> {
        self.slots
            .lock()
            .await
            .get(ip)
            .and_then(|s| s.free_since)
            .map(|t| t.elapsed())
    }

    /// Platform tags of a node whose session already probed them.
    pub async fn known_platforms(&self, ip: &str) -> Option<Vec<String>> {
        let slots = self.slots.lock().await;
        let machine = slots.get(ip)?.machine.clone()?;
        machine.platform_if_probed().map(|p| p.tags.clone())
    }

    /// Make the node known to the pool without connecting.
    pub async fn track(&self, ip: &str) {
        self.node_lock(ip).await;
    }

    /// Drop the cached session and metadata for a deleted node.
    pub async fn evict(&self, ip: &str) {
        if self.slots.lock().await.remove(ip).is_some() {
            debug!(%ip, "machine evicted from pool");
        }
    }

    /// Drop sessions for nodes no longer registered.
    pub async fn retain(&self, known_ips: &[String]) {
        self.slots
            .lock()
            .await
            .retain(|ip, _| known_ips.iter().any(|k| k == ip));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MachinePool {
        let keypair = KeyPair::generate_ed25519().unwrap();
        MachinePool::new(Arc::new(keypair), 5, 10)
    }

    #[tokio::test]
    async fn idle_clock_starts_at_tracking() {
        let pool = pool();
        pool.track("10.0.0.1").await;
        assert!(pool.idle_for("10.0.0.1").await.is_some());
        assert!(pool.idle_for("10.0.0.2").await.is_none());
    }

    #[tokio::test]
    async fn busy_suspends_the_idle_clock() {
        let pool = pool();
        pool.track("10.0.0.1").await;
        pool.mark_busy("10.0.0.1").await;
        assert!(pool.idle_for("10.0.0.1").await.is_none());

        pool.mark_free("10.0.0.1").await;
        let idle = pool.idle_for("10.0.0.1").await.unwrap();
        assert!(idle < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn mark_free_does_not_reset_an_already_idle_clock() {
        let pool = pool();
        pool.track("10.0.0.1").await;
        let before = pool.idle_for("10.0.0.1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.mark_free("10.0.0.1").await;
        let after = pool.idle_for("10.0.0.1").await.unwrap();
        assert!(after >= before);
    }

    #[tokio::test]
    async fn evict_and_retain_drop_state() {
        let pool = pool();
        pool.track("10.0.0.1").await;
        pool.track("10.0.0.2").await;

        pool.evict("10.0.0.1").await;
        assert!(pool.idle_for("10.0.0.1").await.is_none());

        pool.retain(&[]).await;
        assert!(pool.idle_for("10.0.0.2").await.is_none());
    }

    #[tokio::test]
    async fn node_lock_serializes_holders() {
        let pool = pool();
        let lock = pool.node_lock("10.0.0.1").await;
        let guard = lock.lock().await;
        let again = pool.node_lock("10.0.0.1").await;
        assert!(again.try_lock().is_err());
        drop(guard);
        assert!(again.try_lock().is_ok());
    }
}

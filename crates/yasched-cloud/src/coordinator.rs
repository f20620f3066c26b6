//! CloudCoordinator — owns the cloud node fleet.
//!
//! Two concerns driven from one tick loop:
//!
//! - **Scale-up**: count TO_DO tasks no currently free node can serve,
//!   then ask providers for nodes in priority order (utilization ratio
//!   breaks ties), bounded by `max_nodes` and the allocate gate.
//! - **Scale-down**: delete cloud nodes that stayed idle past their
//!   provider's `idle_tolerance`, and reconcile nodes the provider no
//!   longer reports (deleted out-of-band) by recovering their tasks.
//!
//! The scheduler can also request an immediate deallocation over a
//! channel (node setup failure, permanent auth failure).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use yasched_core::{Config, EngineRepository, Gate};
use yasched_db::TaskStore;
use yasched_remote::{deploy, KeyStore, MachinePool};

use crate::adapter::{CloudInit, CreateContext};
use crate::error::CloudError;
use crate::provider::CloudProvider;

const TICK: Duration = Duration::from_secs(10);

pub struct CloudCoordinator {
    cfg: Arc<Config>,
    db: TaskStore,
    pool: Arc<MachinePool>,
    keys: KeyStore,
    providers: Vec<Arc<CloudProvider>>,
    allocate_gate: Arc<Gate>,
    deallocate_gate: Arc<Gate>,
    evict_rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl CloudCoordinator {
    /// Build the coordinator and the sender the scheduler uses to
    /// request immediate deallocations.
    pub fn new(
        cfg: Arc<Config>,
        db: TaskStore,
        pool: Arc<MachinePool>,
        keys: KeyStore,
        allocate_gate: Arc<Gate>,
    ) -> (Self, mpsc::UnboundedSender<String>) {
        let mut providers = Vec::new();
        for cloud in &cfg.clouds {
            if cloud.max_nodes < 1 {
                warn!(provider = %cloud.name, "max_nodes < 1, provider disabled");
                continue;
            }
            providers.push(CloudProvider::new(cloud.clone()));
        }
        info!(
            providers = %providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>().join(", "),
            "cloud coordinator ready"
        );

        let deallocate_gate = Arc::new(Gate::new(
            "deallocate",
            cfg.local.deallocate_limit,
            cfg.local.deallocate_pending,
        ));
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        (
            Self {
                cfg,
                db,
                pool,
                keys,
                providers,
                allocate_gate,
                deallocate_gate,
                evict_rx: Some(evict_rx),
            },
            evict_tx,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Drive both control loops until the shutdown signal fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut evict_rx) = self.evict_rx.take() else {
            warn!("coordinator started twice, refusing to run");
            return;
        };
        if let Err(e) = self.db.clear_provisioning_nodes().await {
            warn!(error = %e, "cannot clear stale provisioning placeholders");
        }

        let mut tick = tokio::time::interval(TICK);
        let mut evict_open = true;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.scale_up().await {
                        warn!(error = %e, "scale-up pass failed");
                    }
                    if let Err(e) = self.scale_down().await {
                        warn!(error = %e, "scale-down pass failed");
                    }
                }
                msg = evict_rx.recv(), if evict_open => match msg {
                    Some(ip) => self.deallocate(&ip).await,
                    None => evict_open = false,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("cloud coordinator stopped");
    }

    // ── Scale-up ───────────────────────────────────────────────────

    async fn scale_up(&self) -> Result<(), yasched_db::DbError> {
        if self.providers.is_empty() {
            return Ok(());
        }
        let todo = self.db.tasks_by_status(yasched_db::TaskStatus::ToDo).await?;
        if todo.is_empty() {
            return Ok(());
        }

        let busy = self.db.busy_ips().await?;
        let mut free_platforms = Vec::new();
        for node in self.db.enabled_nodes().await? {
            if busy.contains(&node.ip) {
                continue;
            }
            // A not-yet-probed node may still match; count it as a
            // wildcard so we do not over-allocate.
            free_platforms.push(self.pool.known_platforms(&node.ip).await);
        }

        let mut need = 0usize;
        for task in &todo {
            let Some(engine) = self.cfg.engines.get(&task.metadata.engine) else {
                continue;
            };
            let served = free_platforms.iter().any(|p| match p {
                Some(tags) => engine.supports_any(tags),
                None => true,
            });
            if !served {
                need += 1;
            }
        }
        if need == 0 {
            return Ok(());
        }
        debug!(need, "pending tasks without a matching free node");

        let want_platforms: HashSet<String> = todo
            .iter()
            .filter_map(|t| self.cfg.engines.get(&t.metadata.engine))
            .flat_map(|e| e.platforms.iter().cloned())
            .collect();
        let want_platforms: Vec<String> = want_platforms.into_iter().collect();

        let mut counts = self.db.count_cloud_nodes().await?;
        while need > 0 {
            let mut states = Vec::with_capacity(self.providers.len());
            for p in &self.providers {
                states.push(ProviderState {
                    priority: p.config.priority,
                    active: counts.get(p.name()).copied().unwrap_or(0),
                    max_nodes: p.config.max_nodes,
                    shunned: p.is_shunned().await,
                    supports: p.supports_any_platform(&want_platforms),
                });
            }
            let Some(idx) = select_provider(&states) else {
                debug!("no provider can take another node");
                break;
            };
            let Some(pass) = self.allocate_gate.try_admit() else {
                break;
            };

            let provider = self.providers[idx].clone();
            *counts.entry(provider.name().to_string()).or_insert(0) += 1;
            need -= 1;

            let db = self.db.clone();
            let pool = self.pool.clone();
            let keys = self.keys.clone();
            let cfg = self.cfg.clone();
            tokio::spawn(async move {
                let _pass = pass;
                allocate_one(provider, db, pool, keys, cfg).await;
            });
        }
        Ok(())
    }

    // ── Scale-down ─────────────────────────────────────────────────

    async fn scale_down(&self) -> Result<(), yasched_db::DbError> {
        let nodes = self.db.all_nodes().await?;
        let busy = self.db.busy_ips().await?;

        // One listing per provider; a failing provider is skipped (and
        // shunned by the wrapper), never treated as "all nodes gone".
        let mut live: HashMap<String, HashSet<String>> = HashMap::new();
        for p in &self.providers {
            if p.is_shunned().await {
                continue;
            }
            match p.list_nodes().await {
                Ok(ips) => {
                    live.insert(p.name().to_string(), ips.into_iter().collect());
                }
                Err(e) => warn!(provider = p.name(), error = %e, "node listing failed"),
            }
        }

        for node in &nodes {
            let Some(cloud) = &node.cloud else { continue };
            if !node.ip.contains('.') {
                continue; // provisioning placeholder
            }

            // Node vanished out-of-band: recover its tasks, drop the row.
            if let Some(ips) = live.get(cloud) {
                if !ips.contains(&node.ip) {
                    warn!(ip = %node.ip, provider = %cloud, "node vanished out-of-band");
                    self.db.recover_orphans(&[node.ip.clone()]).await?;
                    self.db.remove_node(&node.ip).await?;
                    self.pool.evict(&node.ip).await;
                    continue;
                }
            }

            let tolerance = self
                .providers
                .iter()
                .find(|p| p.name() == cloud)
                .map(|p| Duration::from_secs(p.config.idle_tolerance));
            let Some(tolerance) = tolerance else { continue };

            let idle = self.pool.idle_for(&node.ip).await;
            if eligible_for_deletion(node.enabled, busy.contains(&node.ip), idle, tolerance) {
                let Some(pass) = self.deallocate_gate.try_admit() else {
                    break;
                };
                info!(ip = %node.ip, provider = %cloud, idle = ?idle, "idle node scheduled for deletion");
                let ip = node.ip.clone();
                let this = self.clone_for_task();
                tokio::spawn(async move {
                    let _pass = pass;
                    this.deallocate(&ip).await;
                });
            }
        }

        // Sessions for rows that left the registry serve nobody.
        let known: Vec<String> = nodes.iter().map(|n| n.ip.clone()).collect();
        self.pool.retain(&known).await;
        Ok(())
    }

    fn clone_for_task(&self) -> DeallocateHandle {
        DeallocateHandle {
            db: self.db.clone(),
            pool: self.pool.clone(),
            providers: self.providers.clone(),
        }
    }

    /// Disable → recover orphans → delete at the provider → drop the row.
    async fn deallocate(&self, ip: &str) {
        self.clone_for_task().deallocate(ip).await
    }
}

/// The parts of the coordinator a spawned deallocation task needs.
struct DeallocateHandle {
    db: TaskStore,
    pool: Arc<MachinePool>,
    providers: Vec<Arc<CloudProvider>>,
}

impl DeallocateHandle {
    async fn deallocate(&self, ip: &str) {
        let node = match self.db.get_node(ip).await {
            Ok(Some(node)) => node,
            Ok(None) => return,
            Err(e) => {
                error!(%ip, error = %e, "deallocation lookup failed");
                return;
            }
        };
        let Some(cloud) = node.cloud else {
            warn!(%ip, "refusing to deallocate a static node");
            return;
        };
        let Some(provider) = self.providers.iter().find(|p| p.name() == cloud) else {
            warn!(%ip, %cloud, "cannot deallocate: provider not configured");
            return;
        };

        // Disabling first prevents new assignments; recovery is
        // idempotent even when nothing runs there.
        if let Err(e) = self.db.disable_node(ip).await {
            error!(%ip, error = %e, "cannot disable node");
            return;
        }
        if let Err(e) = self.db.recover_orphans(&[ip.to_string()]).await {
            error!(%ip, error = %e, "orphan recovery failed");
            return;
        }

        match provider.delete_node(ip).await {
            Ok(()) | Err(CloudError::UnknownNode { .. }) => {}
            Err(e) => {
                // Row stays disabled; the vanish reconciliation or a
                // later pass finishes the job.
                error!(%ip, error = %e, "provider delete failed");
                return;
            }
        }
        if let Err(e) = self.db.remove_node(ip).await {
            error!(%ip, error = %e, "cannot remove node row");
            return;
        }
        self.pool.evict(ip).await;
        info!(%ip, provider = %cloud, "node deallocated");
    }
}

/// Create one node on `provider` and provision it end to end.
async fn allocate_one(
    provider: Arc<CloudProvider>,
    db: TaskStore,
    pool: Arc<MachinePool>,
    keys: KeyStore,
    cfg: Arc<Config>,
) {
    let username = provider.config.username.clone();

    let placeholder = match db.add_provisioning_node(provider.name(), &username).await {
        Ok(ip) => ip,
        Err(e) => {
            error!(provider = provider.name(), error = %e, "cannot reserve capacity slot");
            return;
        }
    };

    let ctx = CreateContext {
        key_name: keys.name.clone(),
        public_key: keys.public_openssh(),
        user_data: user_data(&cfg.engines, &provider).render(),
    };
    let created = provider.create_node(&ctx).await;
    if let Err(e) = db.remove_node(&placeholder).await {
        error!(error = %e, "cannot drop provisioning placeholder");
    }
    let ip = match created {
        Ok(ip) => ip,
        Err(e) => {
            error!(provider = provider.name(), error = %e, "node creation failed");
            return;
        }
    };

    if let Err(e) = db
        .add_node(&ip, &username, Some(provider.name()), false)
        .await
    {
        error!(%ip, error = %e, "cannot register created node");
        let _ = provider.delete_node(&ip).await;
        return;
    }

    match provision(&pool, &provider, &cfg, &ip, &username).await {
        Ok(ncpus) => {
            let enabled = async {
                db.set_node_ncpus(&ip, ncpus as i16).await?;
                db.enable_node(&ip).await
            }
            .await;
            match enabled {
                Ok(()) => {
                    pool.mark_free(&ip).await;
                    info!(%ip, provider = provider.name(), ncpus, "node provisioned and enabled");
                }
                Err(e) => error!(%ip, error = %e, "cannot enable provisioned node"),
            }
        }
        Err(e) => {
            error!(%ip, provider = provider.name(), error = %e, "node setup failed, deallocating");
            if let Err(e) = provider.delete_node(&ip).await {
                error!(%ip, error = %e, "teardown after failed setup also failed");
            }
            let _ = db.remove_node(&ip).await;
            pool.evict(&ip).await;
        }
    }
}

/// Wait for cloud-init, deploy matching engines, probe the core count.
async fn provision(
    pool: &MachinePool,
    provider: &CloudProvider,
    cfg: &Config,
    ip: &str,
    username: &str,
) -> Result<u32, yasched_remote::RemoteError> {
    let jump = provider
        .config
        .jump_host
        .clone()
        .map(|h| (h, provider.config.jump_user.clone().unwrap_or_else(|| username.to_string())));
    let machine = pool.machine(ip, username, jump).await?;

    let result = machine.exec("cloud-init status --wait").await?;
    if !result.success() {
        debug!(%ip, code = result.code, "cloud-init wait returned nonzero");
    }

    deploy::deploy_engines(
        &machine,
        &cfg.engines,
        &cfg.local.engines_dir,
        &cfg.remote.engines_dir,
    )
    .await?;
    machine.probe_cpus().await
}

/// User data for a new node: upgrade packages and preinstall the union
/// of packages for engines this provider's platform can host.
fn user_data(engines: &EngineRepository, provider: &CloudProvider) -> CloudInit {
    let mut packages: Vec<String> = engines
        .values()
        .filter(|e| e.platforms.iter().any(|p| provider.supports_platform(p)))
        .flat_map(|e| e.platform_packages.iter().cloned())
        .collect();
    packages.sort();
    packages.dedup();
    CloudInit {
        package_upgrade: true,
        packages,
    }
}

// ── Decision logic ─────────────────────────────────────────────────

/// A provider's standing at selection time.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub priority: i32,
    pub active: i64,
    pub max_nodes: i64,
    pub shunned: bool,
    pub supports: bool,
}

/// Pick the provider for the next node: descending priority, then
/// ascending utilization ratio. Full, shunned, disabled, and
/// platform-mismatched providers are out.
pub fn select_provider(states: &[ProviderState]) -> Option<usize> {
    let mut best: Option<(usize, i32, f64)> = None;
    for (i, s) in states.iter().enumerate() {
        if s.shunned || !s.supports || s.max_nodes < 1 || s.active >= s.max_nodes {
            continue;
        }
        let utilization = s.active as f64 / s.max_nodes as f64;
        let better = match best {
            None => true,
            Some((_, priority, util)) => {
                s.priority > priority || (s.priority == priority && utilization < util)
            }
        };
        if better {
            best = Some((i, s.priority, utilization));
        }
    }
    best.map(|(i, _, _)| i)
}

/// Whether an (already cloud-owned) node may be deleted now.
pub fn eligible_for_deletion(
    enabled: bool,
    busy: bool,
    idle: Option<Duration>,
    tolerance: Duration,
) -> bool {
    enabled && !busy && idle.is_some_and(|d| d >= tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(priority: i32, active: i64, max_nodes: i64) -> ProviderState {
        ProviderState {
            priority,
            active,
            max_nodes,
            shunned: false,
            supports: true,
        }
    }

    #[test]
    fn higher_priority_wins() {
        let states = vec![state(5, 0, 5), state(10, 0, 1)];
        assert_eq!(select_provider(&states), Some(1));
    }

    #[test]
    fn utilization_breaks_priority_ties() {
        let states = vec![state(5, 3, 5), state(5, 1, 5)];
        assert_eq!(select_provider(&states), Some(1));
    }

    #[test]
    fn full_shunned_and_unsupporting_providers_are_skipped() {
        let mut full = state(10, 1, 1);
        full.active = 1;
        let mut shunned = state(10, 0, 5);
        shunned.shunned = true;
        let mut mismatched = state(10, 0, 5);
        mismatched.supports = false;
        let fallback = state(1, 0, 5);

        let states = vec![full, shunned, mismatched, fallback];
        assert_eq!(select_provider(&states), Some(3));
    }

    #[test]
    fn no_capacity_anywhere_selects_nothing() {
        let states = vec![state(10, 1, 1), state(5, 5, 5)];
        assert_eq!(select_provider(&states), None);
        assert_eq!(select_provider(&[]), None);
    }

    #[test]
    fn three_allocations_respect_priority_and_max_nodes() {
        // Providers A (priority 10, max 1) and B (priority 5, max 5);
        // three pending tasks end up as 1 node on A, 2 on B.
        let mut a = state(10, 0, 1);
        let mut b = state(5, 0, 5);
        let mut placed = vec![0i64; 2];
        for _ in 0..3 {
            let states = vec![a.clone(), b.clone()];
            let idx = select_provider(&states).unwrap();
            placed[idx] += 1;
            match idx {
                0 => a.active += 1,
                _ => b.active += 1,
            }
        }
        assert_eq!(placed, vec![1, 2]);
    }

    #[test]
    fn deletion_waits_out_idle_tolerance() {
        let tolerance = Duration::from_secs(120);
        assert!(!eligible_for_deletion(
            true,
            false,
            Some(Duration::from_secs(119)),
            tolerance
        ));
        assert!(eligible_for_deletion(
            true,
            false,
            Some(Duration::from_secs(120)),
            tolerance
        ));
    }

    #[test]
    fn busy_disabled_or_unknown_idle_nodes_are_kept() {
        let tolerance = Duration::from_secs(60);
        let idle = Some(Duration::from_secs(600));
        assert!(!eligible_for_deletion(true, true, idle, tolerance));
        assert!(!eligible_for_deletion(false, false, idle, tolerance));
        assert!(!eligible_for_deletion(true, false, None, tolerance));
    }
}

//! Scheduler — the reconciler driving task state transitions.
//!
//! Tick period is the shortest engine poll interval. Each tick:
//!
//! 1. **Harvest** — probe every RUNNING task's process; when it is gone,
//!    download the declared outputs, mark DONE (download failures are
//!    recorded, never block completion), free the node, queue a webhook.
//! 2. **Assign** — pair TO_DO tasks with free nodes via the repository
//!    claim, then deploy + upload + spawn on each claimed node.
//!
//! Startup runs a recovery pass first: tasks on unregistered nodes go
//! back to the queue, everything else resumes monitoring as-is.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use yasched_core::{Config, Engine, Gate};
use yasched_db::{FreeNode, Task, TaskStore};
use yasched_remote::{deploy, MachinePool, RemoteError};

use crate::webhook::{WebhookNotice, WebhookQueue};

pub struct Scheduler {
    cfg: Arc<Config>,
    db: TaskStore,
    pool: Arc<MachinePool>,
    webhooks: WebhookQueue,
    /// Caps task assignment (shared with node creation).
    allocate_gate: Arc<Gate>,
    /// Caps result downloads.
    consume_gate: Gate,
    /// Immediate-deallocation requests to the cloud coordinator.
    evict_tx: mpsc::UnboundedSender<String>,
}

impl Scheduler {
    pub fn new(
        cfg: Arc<Config>,
        db: TaskStore,
        pool: Arc<MachinePool>,
        webhooks: WebhookQueue,
        allocate_gate: Arc<Gate>,
        evict_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        let consume_gate = Gate::new(
            "consume",
            cfg.local.consume_limit,
            cfg.local.consume_pending,
        );
        Self {
            cfg,
            db,
            pool,
            webhooks,
            allocate_gate,
            consume_gate,
            evict_tx,
        }
    }

    /// Reconcile until the shutdown signal fires. RUNNING tasks are left
    /// untouched on shutdown; the next start resumes them via recovery.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let this = Arc::new(self);
        if let Err(e) = this.recover().await {
            error!(error = %e, "startup recovery failed");
        }

        let period = this.cfg.engines.min_sleep_interval().unwrap_or(10).max(1);
        let mut tick = tokio::time::interval(Duration::from_secs(period));
        info!(period_secs = period, "scheduler loop started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !this.tick().await {
                        error!("permanent database error, scheduler terminating");
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("scheduler stopped");
    }

    /// Returns `false` only on a permanent database error; everything
    /// else is logged and retried next tick.
    async fn tick(self: &Arc<Self>) -> bool {
        let harvested = self.harvest().await;
        if !Self::pass_survivable("harvest", harvested) {
            return false;
        }
        let assigned = self.assign().await;
        Self::pass_survivable("assign", assigned)
    }

    fn pass_survivable(pass: &str, result: Result<(), yasched_db::DbError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) if e.is_transient() => {
                warn!(pass, error = %e, "tick pass failed, will retry");
                true
            }
            Err(e) => {
                error!(pass, error = %e, "tick pass failed permanently");
                false
            }
        }
    }

    // ── Recovery (startup only) ────────────────────────────────────

    /// Resume monitoring for RUNNING rows that still have a registered
    /// node; everything else returns to the queue. Liveness itself is
    /// settled by the first harvest pass.
    async fn recover(&self) -> Result<(), yasched_db::DbError> {
        self.db.recover_unregistered_orphans().await?;
        for task in self.db.list_running().await? {
            if let Some(ip) = &task.ip {
                self.pool.track(ip).await;
                self.pool.mark_busy(ip).await;
                debug!(task_id = task.task_id, %ip, "resuming monitoring");
            }
        }
        Ok(())
    }

    // ── Harvest ────────────────────────────────────────────────────

    async fn harvest(self: &Arc<Self>) -> Result<(), yasched_db::DbError> {
        let running = self.db.list_running().await?;
        join_all(running.into_iter().map(|t| self.harvest_task(t))).await;
        Ok(())
    }

    async fn harvest_task(&self, task: Task) {
        let task_id = task.task_id;
        let Some(ip) = task.ip.clone() else {
            // RUNNING without an ip cannot happen through claiming;
            // treat like an orphan.
            let _ = self.db.recover_unregistered_orphans().await;
            return;
        };

        let node = match self.db.get_node(&ip).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                let _ = self.db.recover_orphans(&[ip]).await;
                return;
            }
            Err(e) => {
                warn!(task_id, error = %e, "node lookup failed");
                return;
            }
        };

        let Some(engine) = self.cfg.engines.get(&task.metadata.engine) else {
            warn!(task_id, engine = %task.metadata.engine, "engine no longer configured");
            let mut metadata = task.metadata.clone();
            metadata.error = Some(format!("engine `{}` no longer configured", metadata.engine));
            self.finish_task(task_id, &task.label, metadata, &ip).await;
            return;
        };

        let machine = match self
            .pool
            .machine(&ip, &node.username, self.jump_for(node.cloud.as_deref()))
            .await
        {
            Ok(machine) => machine,
            Err(e) => {
                self.handle_remote_error(&ip, node.cloud.as_deref(), &e).await;
                return;
            }
        };

        let lock = self.pool.node_lock(&ip).await;
        let _guard = lock.lock().await;

        match machine.process_alive(&engine.check).await {
            Ok(true) => {
                self.pool.mark_busy(&ip).await;
            }
            Ok(false) => {
                // Completion and crash look the same here; outputs tell.
                let Some(_pass) = self.consume_gate.try_admit() else {
                    debug!(task_id, "consume limit reached, harvesting next tick");
                    return;
                };
                self.collect_outputs(&task, engine, &machine, &ip).await;
            }
            Err(e) => {
                self.handle_remote_error(&ip, node.cloud.as_deref(), &e).await;
            }
        }
    }

    /// Download declared outputs and mark the task DONE regardless of
    /// the download outcome.
    async fn collect_outputs(
        &self,
        task: &Task,
        engine: &Engine,
        machine: &yasched_remote::RemoteMachine,
        ip: &str,
    ) {
        let task_id = task.task_id;
        let mut metadata = task.metadata.clone();
        let local_dir = self.cfg.local.tasks_dir.join(task_id.to_string());

        let remote_dir = match &metadata.remote_dir {
            Some(dir) => Some(dir.clone()),
            None => match machine.resolve_path(&self.cfg.remote.tasks_dir).await {
                Ok(root) => {
                    let flavor = match machine.probe_platform().await {
                        Ok(info) => info.flavor,
                        Err(_) => yasched_remote::PathFlavor::Posix,
                    };
                    Some(flavor.join(&root, &task_id.to_string()))
                }
                Err(_) => None,
            },
        };

        match remote_dir {
            Some(remote_dir) => {
                match machine
                    .download(&remote_dir, &local_dir, &engine.output_files)
                    .await
                {
                    Ok(report) => {
                        metadata.download_errors = report.errors.into_iter().collect();
                    }
                    Err(e) => {
                        metadata.download_errors = engine
                            .output_files
                            .iter()
                            .map(|f| (f.clone(), e.to_string()))
                            .collect();
                    }
                }
            }
            None => {
                metadata.download_errors = engine
                    .output_files
                    .iter()
                    .map(|f| (f.clone(), "remote task directory unknown".to_string()))
                    .collect();
            }
        }
        metadata.local_dir = Some(local_dir.display().to_string());

        self.finish_task(task_id, &task.label, metadata, ip).await;
    }

    async fn finish_task(
        &self,
        task_id: i32,
        label: &str,
        metadata: yasched_db::TaskMetadata,
        ip: &str,
    ) {
        if let Err(e) = self.db.finish(task_id, &metadata).await {
            error!(task_id, error = %e, "cannot mark task done");
            return;
        }
        self.pool.mark_free(ip).await;
        info!(
            task_id,
            label,
            local_dir = metadata.local_dir.as_deref().unwrap_or("-"),
            "task done"
        );
        if let Some(url) = metadata.webhook_url {
            self.webhooks.enqueue(WebhookNotice {
                task_id,
                label: label.to_string(),
                status: yasched_db::TaskStatus::Done.code(),
                url,
            });
        }
    }

    // ── Assignment ─────────────────────────────────────────────────

    async fn assign(self: &Arc<Self>) -> Result<(), yasched_db::DbError> {
        let busy = self.db.busy_ips().await?;
        let mut free = Vec::new();
        for node in self.db.enabled_nodes().await? {
            if busy.contains(&node.ip) {
                continue;
            }
            // Pairing needs the probed platform, so free nodes are
            // connected here; one failing node never blocks the rest.
            match self
                .pool
                .machine(&node.ip, &node.username, self.jump_for(node.cloud.as_deref()))
                .await
            {
                Ok(machine) => match machine.probe_platform().await {
                    Ok(info) => free.push(FreeNode {
                        ip: node.ip.clone(),
                        platforms: info.tags.clone(),
                        ncpus: node.ncpus,
                    }),
                    Err(e) => {
                        self.handle_remote_error(&node.ip, node.cloud.as_deref(), &e)
                            .await
                    }
                },
                Err(e) => {
                    self.handle_remote_error(&node.ip, node.cloud.as_deref(), &e)
                        .await
                }
            }
        }
        if free.is_empty() {
            return Ok(());
        }

        // Take assignment slots up front; what cannot start this tick
        // stays TO_DO instead of being claimed and parked.
        let mut passes = Vec::new();
        while passes.len() < free.len() {
            match self.allocate_gate.try_admit() {
                Some(pass) => passes.push(pass),
                None => break,
            }
        }
        free.truncate(passes.len());
        if free.is_empty() {
            warn!("allocate limit reached, skipping assignment this tick");
            return Ok(());
        }

        let claimed = self.db.claim_ready_tasks(&free, &self.cfg.engines).await?;
        for (task, node) in claimed {
            let pass = passes.pop();
            let this = self.clone();
            tokio::spawn(async move {
                let _pass = pass;
                this.dispatch(task, node).await;
            });
        }
        Ok(())
    }

    /// Deploy, upload inputs, spawn. Any failure puts the task back in
    /// the queue; node-level failures also disable the node.
    async fn dispatch(&self, task: Task, free_node: FreeNode) {
        let task_id = task.task_id;
        let ip = free_node.ip.clone();

        let cloud = match self.db.get_node(&ip).await {
            Ok(Some(node)) => node.cloud,
            _ => {
                let _ = self.db.unclaim(task_id).await;
                return;
            }
        };

        let Some(engine) = self.cfg.engines.get(&task.metadata.engine) else {
            let mut metadata = task.metadata.clone();
            metadata.error = Some(format!("engine `{}` no longer configured", metadata.engine));
            self.finish_task(task_id, &task.label, metadata, &ip).await;
            return;
        };

        let result = self.try_dispatch(&task, engine, &ip).await;
        match result {
            Ok(()) => {
                self.pool.mark_busy(&ip).await;
                info!(task_id, label = %task.label, %ip, engine = %engine.name, "task dispatched");
            }
            Err(e) => {
                warn!(task_id, %ip, error = %e, "dispatch failed, task returns to queue");
                self.handle_remote_error(&ip, cloud.as_deref(), &e).await;
                if let Err(e) = self.db.unclaim(task_id).await {
                    error!(task_id, error = %e, "cannot unclaim task");
                }
            }
        }
    }

    async fn try_dispatch(&self, task: &Task, engine: &Engine, ip: &str) -> Result<(), RemoteError> {
        let node = self
            .db
            .get_node(ip)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| RemoteError::Connect {
                host: ip.to_string(),
                reason: "node vanished from registry".to_string(),
            })?;

        let machine = self
            .pool
            .machine(ip, &node.username, self.jump_for(node.cloud.as_deref()))
            .await?;
        let lock = self.pool.node_lock(ip).await;
        let _guard = lock.lock().await;

        deploy::deploy_engine(
            &machine,
            engine,
            &self.cfg.local.engines_dir,
            &self.cfg.remote.engines_dir,
        )
        .await?;

        let flavor = machine.probe_platform().await?.flavor;
        let tasks_root = machine.resolve_path(&self.cfg.remote.tasks_dir).await?;
        let task_dir = flavor.join(&tasks_root, &task.task_id.to_string());

        let files: Vec<(String, Vec<u8>)> = engine
            .input_files
            .iter()
            .map(|name| {
                let content = task.metadata.inputs.get(name).cloned().unwrap_or_default();
                (name.clone(), content.into_bytes())
            })
            .collect();
        let report = machine.upload(&task_dir, &files).await?;
        if !report.is_complete() {
            return Err(RemoteError::Connect {
                host: ip.to_string(),
                reason: format!("{} input file(s) failed to upload", report.errors.len()),
            });
        }

        let ncpus = match task.metadata.ncpus {
            Some(n) => n,
            None => match node.ncpus {
                Some(n) => n as u32,
                None => machine.probe_cpus().await?,
            },
        };
        let engines_root = machine.resolve_path(&self.cfg.remote.engines_dir).await?;
        let engine_path = flavor.join(&engines_root, &engine.name);
        let command = engine
            .render_spawn(&task_dir, &engine_path, ncpus)
            .map_err(|reason| RemoteError::Deploy {
                engine: engine.name.clone(),
                host: ip.to_string(),
                reason,
            })?;

        machine.spawn_detached(&command, &task_dir).await?;

        let mut metadata = task.metadata.clone();
        metadata.remote_dir = Some(task_dir);
        if let Err(e) = self.db.update_metadata(task.task_id, &metadata).await {
            warn!(task_id = task.task_id, error = %e, "cannot record remote dir");
        }
        Ok(())
    }

    // ── Node failure handling ──────────────────────────────────────

    /// Transient errors just log; permanent ones disable the node and,
    /// for cloud nodes, request immediate deallocation.
    async fn handle_remote_error(&self, ip: &str, cloud: Option<&str>, error: &RemoteError) {
        if error.is_auth_permanent() || matches!(error, RemoteError::Deploy { .. }) {
            error!(%ip, %error, "permanent node failure, disabling");
            if let Err(e) = self.db.disable_node(ip).await {
                error!(%ip, error = %e, "cannot disable node");
            }
            if cloud.is_some() && self.evict_tx.send(ip.to_string()).is_err() {
                warn!(%ip, "cloud coordinator is gone, deallocation not requested");
            }
        } else {
            debug!(%ip, %error, "transient node error, will retry");
        }
    }

    fn jump_for(&self, cloud: Option<&str>) -> Option<(String, String)> {
        let cloud = cloud?;
        let cfg = self.cfg.clouds.iter().find(|c| c.name == cloud)?;
        let host = cfg.jump_host.clone()?;
        let user = cfg.jump_user.clone().unwrap_or_else(|| cfg.username.clone());
        Some((host, user))
    }
}

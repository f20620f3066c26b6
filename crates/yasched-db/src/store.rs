//! TaskStore — typed repository over a PostgreSQL pool.
//!
//! Every public operation is a single transaction (or a single
//! statement). Transient connection errors are retried internally with
//! capped exponential backoff; anything the server actively rejects is
//! returned to the caller as permanent.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::time::Duration;

use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::types::Json;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info, warn};

use yasched_core::{DbConfig, EngineRepository};

use crate::error::{DbError, DbResult};
use crate::models::{Node, Task, TaskMetadata, TaskStatus};
use crate::pairing::{self, FreeNode};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS yascheduler_nodes (
    ip VARCHAR(15) UNIQUE,
    ncpus SMALLINT NULL,
    enabled BOOL DEFAULT TRUE,
    cloud VARCHAR(32) NULL,
    username VARCHAR(255) DEFAULT 'root'
);
CREATE TABLE IF NOT EXISTS yascheduler_tasks (
    task_id SERIAL PRIMARY KEY,
    label VARCHAR(256),
    metadata JSONB,
    ip VARCHAR(15),
    status SMALLINT
);
ALTER TABLE yascheduler_nodes
    ADD COLUMN IF NOT EXISTS username VARCHAR(255) DEFAULT 'root';
";

/// How many transient failures to absorb before giving up.
const MAX_RETRIES: u32 = 6;

/// Persistent queue + node registry.
#[derive(Clone)]
pub struct TaskStore {
    pool: Pool,
}

impl TaskStore {
    /// Build a connection pool from the `[db]` config section.
    pub fn connect(cfg: &DbConfig) -> DbResult<Self> {
        let mut pc = PoolConfig::new();
        pc.user = Some(cfg.user.clone());
        pc.password = Some(cfg.password.clone());
        pc.dbname = Some(cfg.database.clone());
        pc.host = Some(cfg.host.clone());
        pc.port = Some(cfg.port);
        pc.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let pool = pc.create_pool(Some(Runtime::Tokio1), NoTls)?;
        Ok(Self { pool })
    }

    /// Create the two tables and apply column migrations. Idempotent.
    pub async fn init_schema(&self) -> DbResult<()> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        info!("database schema is up to date");
        Ok(())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert a TO_DO task, returning its id.
    pub async fn submit(&self, label: &str, metadata: &TaskMetadata) -> DbResult<i32> {
        let meta = serde_json::to_value(metadata)?;
        let row = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .query_one(
                        "INSERT INTO yascheduler_tasks (label, metadata, ip, status)
                         VALUES ($1, $2, NULL, $3) RETURNING task_id;",
                        &[&label, &Json(&meta), &TaskStatus::ToDo.code()],
                    )
                    .await?)
            })
            .await?;
        let task_id: i32 = row.get(0);
        info!(task_id, label, "task submitted");
        Ok(task_id)
    }

    pub async fn get_task(&self, task_id: i32) -> DbResult<Option<Task>> {
        let rows = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .query(
                        "SELECT task_id, label, metadata, ip, status
                         FROM yascheduler_tasks WHERE task_id=$1;",
                        &[&task_id],
                    )
                    .await?)
            })
            .await?;
        rows.first().map(task_from_row).transpose()
    }

    pub async fn tasks_by_status(&self, status: TaskStatus) -> DbResult<Vec<Task>> {
        let rows = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .query(
                        "SELECT task_id, label, metadata, ip, status
                         FROM yascheduler_tasks WHERE status=$1 ORDER BY task_id;",
                        &[&status.code()],
                    )
                    .await?)
            })
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn list_running(&self) -> DbResult<Vec<Task>> {
        self.tasks_by_status(TaskStatus::Running).await
    }

    /// IPs currently referenced by a RUNNING task.
    pub async fn busy_ips(&self) -> DbResult<HashSet<String>> {
        let rows = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .query(
                        "SELECT DISTINCT ip FROM yascheduler_tasks
                         WHERE status=$1 AND ip IS NOT NULL;",
                        &[&TaskStatus::Running.code()],
                    )
                    .await?)
            })
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Atomically pair TO_DO tasks with free nodes and flip them to
    /// RUNNING.
    ///
    /// Candidate rows are locked with `FOR UPDATE SKIP LOCKED`, so
    /// concurrent invocations partition the queue: no task can be
    /// returned twice. Pairing policy is FIFO by task id with
    /// lowest-IP node tie-break (see [`pairing::pair`]).
    pub async fn claim_ready_tasks(
        &self,
        free: &[FreeNode],
        engines: &EngineRepository,
    ) -> DbResult<Vec<(Task, FreeNode)>> {
        if free.is_empty() {
            return Ok(Vec::new());
        }
        // Scan a window larger than the free-node count so tasks with no
        // matching node cannot starve later matchable ones.
        let window = (free.len() as i64 * 4).max(64);

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let rows = tx
            .query(
                "SELECT task_id, label, metadata, ip, status
                 FROM yascheduler_tasks WHERE status=$1
                 ORDER BY task_id LIMIT $2
                 FOR UPDATE SKIP LOCKED;",
                &[&TaskStatus::ToDo.code(), &window],
            )
            .await?;

        let mut tasks = BTreeMap::new();
        let mut candidates = Vec::new();
        for row in &rows {
            let task = task_from_row(row)?;
            candidates.push((task.task_id, task.metadata.engine.clone()));
            tasks.insert(task.task_id, task);
        }

        let claims = pairing::pair(&candidates, free, engines);
        let mut out = Vec::with_capacity(claims.len());
        for (task_id, ip) in claims {
            let (Some(mut task), Some(node)) =
                (tasks.remove(&task_id), free.iter().find(|n| n.ip == ip))
            else {
                continue;
            };
            tx.execute(
                "UPDATE yascheduler_tasks SET status=$1, ip=$2 WHERE task_id=$3;",
                &[&TaskStatus::Running.code(), &ip, &task_id],
            )
            .await?;
            task.status = TaskStatus::Running;
            task.ip = Some(ip);
            out.push((task, node.clone()));
        }
        tx.commit().await?;

        if !out.is_empty() {
            debug!(claimed = out.len(), "tasks claimed");
        }
        Ok(out)
    }

    /// Update task metadata without touching the status.
    pub async fn update_metadata(&self, task_id: i32, metadata: &TaskMetadata) -> DbResult<()> {
        let meta = serde_json::to_value(metadata)?;
        self.retrying(|| async {
            let client = self.pool.get().await?;
            client
                .execute(
                    "UPDATE yascheduler_tasks SET metadata=$1 WHERE task_id=$2;",
                    &[&Json(&meta), &task_id],
                )
                .await?;
            Ok(())
        })
        .await
    }

    /// Mark a task DONE (terminal) with its final metadata.
    pub async fn finish(&self, task_id: i32, metadata: &TaskMetadata) -> DbResult<()> {
        let meta = serde_json::to_value(metadata)?;
        self.retrying(|| async {
            let client = self.pool.get().await?;
            client
                .execute(
                    "UPDATE yascheduler_tasks SET status=$1, metadata=$2 WHERE task_id=$3;",
                    &[&TaskStatus::Done.code(), &Json(&meta), &task_id],
                )
                .await?;
            Ok(())
        })
        .await
    }

    /// Return a claimed-but-not-dispatched task to the queue. Only
    /// touches the row while it is still RUNNING.
    pub async fn unclaim(&self, task_id: i32) -> DbResult<()> {
        self.retrying(|| async {
            let client = self.pool.get().await?;
            client
                .execute(
                    "UPDATE yascheduler_tasks SET status=$1, ip=NULL
                     WHERE task_id=$2 AND status=$3;",
                    &[
                        &TaskStatus::ToDo.code(),
                        &task_id,
                        &TaskStatus::Running.code(),
                    ],
                )
                .await?;
            Ok(())
        })
        .await
    }

    /// Reset RUNNING tasks whose node is among `dead_ips` back to TO_DO
    /// with the ip cleared. Idempotent.
    pub async fn recover_orphans(&self, dead_ips: &[String]) -> DbResult<u64> {
        if dead_ips.is_empty() {
            return Ok(0);
        }
        let n = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .execute(
                        "UPDATE yascheduler_tasks SET status=$1, ip=NULL
                         WHERE status=$2 AND ip = ANY($3);",
                        &[
                            &TaskStatus::ToDo.code(),
                            &TaskStatus::Running.code(),
                            &dead_ips,
                        ],
                    )
                    .await?)
            })
            .await?;
        if n > 0 {
            warn!(recovered = n, ips = ?dead_ips, "orphaned tasks returned to queue");
        }
        Ok(n)
    }

    /// Reset RUNNING tasks referencing nodes absent from the registry.
    /// Safe to call at startup and after any deallocation.
    pub async fn recover_unregistered_orphans(&self) -> DbResult<u64> {
        let n = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .execute(
                        "UPDATE yascheduler_tasks SET status=$1, ip=NULL
                         WHERE status=$2 AND (ip IS NULL
                            OR ip NOT IN (SELECT ip FROM yascheduler_nodes));",
                        &[&TaskStatus::ToDo.code(), &TaskStatus::Running.code()],
                    )
                    .await?)
            })
            .await?;
        if n > 0 {
            warn!(recovered = n, "tasks on unregistered nodes returned to queue");
        }
        Ok(n)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub async fn add_node(
        &self,
        ip: &str,
        username: &str,
        cloud: Option<&str>,
        enabled: bool,
    ) -> DbResult<Node> {
        self.retrying(|| async {
            let client = self.pool.get().await?;
            client
                .execute(
                    "INSERT INTO yascheduler_nodes (ip, ncpus, enabled, cloud, username)
                     VALUES ($1, NULL, $2, $3, $4);",
                    &[&ip, &enabled, &cloud, &username],
                )
                .await?;
            Ok(())
        })
        .await?;
        Ok(Node {
            ip: ip.to_string(),
            ncpus: None,
            enabled,
            cloud: cloud.map(str::to_string),
            username: username.to_string(),
        })
    }

    /// Insert a disabled placeholder row while a cloud create is in
    /// flight, so provider capacity counts pending allocations.
    pub async fn add_provisioning_node(&self, cloud: &str, username: &str) -> DbResult<String> {
        let row = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .query_one(
                        "INSERT INTO yascheduler_nodes (ip, enabled, cloud, username)
                         VALUES ('prov' || SUBSTR(MD5(RANDOM()::TEXT), 0, 11),
                                 FALSE, $1, $2)
                         RETURNING ip;",
                        &[&cloud, &username],
                    )
                    .await?)
            })
            .await?;
        Ok(row.get(0))
    }

    /// Drop provisioning placeholder rows left behind by a previous
    /// process that died mid-allocation.
    pub async fn clear_provisioning_nodes(&self) -> DbResult<u64> {
        let n = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .execute(
                        "DELETE FROM yascheduler_nodes
                         WHERE ip LIKE 'prov%' AND enabled=FALSE;",
                        &[],
                    )
                    .await?)
            })
            .await?;
        if n > 0 {
            warn!(removed = n, "stale provisioning placeholders cleared");
        }
        Ok(n)
    }

    pub async fn get_node(&self, ip: &str) -> DbResult<Option<Node>> {
        let rows = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .query(
                        "SELECT ip, ncpus, enabled, cloud, username
                         FROM yascheduler_nodes WHERE ip=$1;",
                        &[&ip],
                    )
                    .await?)
            })
            .await?;
        Ok(rows.first().map(node_from_row))
    }

    pub async fn all_nodes(&self) -> DbResult<Vec<Node>> {
        let rows = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .query(
                        "SELECT ip, ncpus, enabled, cloud, username
                         FROM yascheduler_nodes ORDER BY ip;",
                        &[],
                    )
                    .await?)
            })
            .await?;
        Ok(rows.iter().map(node_from_row).collect())
    }

    /// Enabled nodes with a real address (provisioning placeholders have
    /// no dots and are excluded).
    pub async fn enabled_nodes(&self) -> DbResult<Vec<Node>> {
        Ok(self
            .all_nodes()
            .await?
            .into_iter()
            .filter(|n| n.enabled && n.ip.contains('.'))
            .collect())
    }

    pub async fn set_node_ncpus(&self, ip: &str, ncpus: i16) -> DbResult<()> {
        self.node_update("UPDATE yascheduler_nodes SET ncpus=$2 WHERE ip=$1;", ip, Some(ncpus))
            .await
    }

    pub async fn enable_node(&self, ip: &str) -> DbResult<()> {
        self.node_update("UPDATE yascheduler_nodes SET enabled=TRUE WHERE ip=$1;", ip, None)
            .await
    }

    pub async fn disable_node(&self, ip: &str) -> DbResult<()> {
        self.node_update("UPDATE yascheduler_nodes SET enabled=FALSE WHERE ip=$1;", ip, None)
            .await
    }

    pub async fn remove_node(&self, ip: &str) -> DbResult<()> {
        self.node_update("DELETE FROM yascheduler_nodes WHERE ip=$1;", ip, None)
            .await
    }

    /// Node count per provider tag, pending placeholders included.
    pub async fn count_cloud_nodes(&self) -> DbResult<BTreeMap<String, i64>> {
        let rows = self
            .retrying(|| async {
                let client = self.pool.get().await?;
                Ok(client
                    .query(
                        "SELECT cloud, COUNT(*) FROM yascheduler_nodes
                         WHERE cloud IS NOT NULL GROUP BY cloud;",
                        &[],
                    )
                    .await?)
            })
            .await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn node_update(&self, sql: &str, ip: &str, ncpus: Option<i16>) -> DbResult<()> {
        self.retrying(|| async {
            let client = self.pool.get().await?;
            match ncpus {
                Some(n) => client.execute(sql, &[&ip, &n]).await?,
                None => client.execute(sql, &[&ip]).await?,
            };
            Ok(())
        })
        .await
    }

    /// Run `op`, retrying transient failures with capped backoff.
    async fn retrying<T, F, Fut>(&self, mut op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut delay = Duration::from_millis(500);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(error = %e, attempt, "transient database error, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn task_from_row(row: &Row) -> DbResult<Task> {
    let task_id: i32 = row.get(0);
    let code: i16 = row.get(4);
    let status = TaskStatus::from_code(code).ok_or(DbError::InvalidStatus(task_id, code))?;
    let Json(meta): Json<serde_json::Value> = row.get(2);
    Ok(Task {
        task_id,
        label: row.get(1),
        metadata: serde_json::from_value(meta)?,
        ip: row.get(3),
        status,
    })
}

fn node_from_row(row: &Row) -> Node {
    Node {
        ip: row.get(0),
        ncpus: row.get(1),
        enabled: row.get(2),
        cloud: row.get(3),
        username: row.get(4),
    }
}

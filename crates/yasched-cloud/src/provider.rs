//! CloudProvider — one configured provider instance.
//!
//! Wraps an adapter with the provider-scoped settings and the policies
//! the adapters stay free of: an operation semaphore, SSH-readiness
//! waiting (with teardown of nodes that never come up), and cool-off
//! shunning after API errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use yasched_core::{CloudConfig, CloudCredentials};

use crate::adapter::{CloudAdapter, CreateContext};
use crate::error::{CloudError, CloudResult};
use crate::hetzner::HetznerAdapter;
use crate::upcloud::UpcloudAdapter;

/// Concurrent API operations per provider.
const OPS_LIMIT: usize = 2;

/// How long a provider is skipped after an API error.
const SHUN_COOL_OFF: Duration = Duration::from_secs(120);

/// Overall budget for a created node to accept TCP on port 22.
const SSH_READY_TIMEOUT: Duration = Duration::from_secs(300);
const SSH_READY_POLL: Duration = Duration::from_secs(5);

pub struct CloudProvider {
    pub config: CloudConfig,
    adapter: Box<dyn CloudAdapter>,
    ops: Semaphore,
    shunned_until: Mutex<Option<Instant>>,
}

impl CloudProvider {
    /// Build the driver matching the config's credentials.
    pub fn new(config: CloudConfig) -> Arc<Self> {
        let adapter: Box<dyn CloudAdapter> = match &config.credentials {
            CloudCredentials::Hetzner {
                token,
                server_type,
                image_name,
            } => Box::new(HetznerAdapter::new(
                token.clone(),
                server_type.clone(),
                image_name.clone(),
            )),
            CloudCredentials::Upcloud { login, password } => Box::new(UpcloudAdapter::new(
                login.clone(),
                password.clone(),
                config.username.clone(),
            )),
        };
        Arc::new(Self {
            config,
            adapter,
            ops: Semaphore::new(OPS_LIMIT),
            shunned_until: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn supports_any_platform(&self, platforms: &[String]) -> bool {
        platforms.iter().any(|p| self.adapter.supports_platform(p))
    }

    pub fn supports_platform(&self, platform: &str) -> bool {
        self.adapter.supports_platform(platform)
    }

    /// Whether the provider is inside an API-error cool-off window.
    pub async fn is_shunned(&self) -> bool {
        let mut shunned = self.shunned_until.lock().await;
        match *shunned {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *shunned = None;
                false
            }
            None => false,
        }
    }

    async fn shun(&self) {
        warn!(provider = self.name(), cool_off = ?SHUN_COOL_OFF, "provider shunned");
        *self.shunned_until.lock().await = Some(Instant::now() + SHUN_COOL_OFF);
    }

    async fn with_shun_on_error<T>(&self, result: CloudResult<T>) -> CloudResult<T> {
        if let Err(e) = &result {
            if matches!(e, CloudError::Api { .. } | CloudError::Http(_)) {
                self.shun().await;
            }
        }
        result
    }

    /// Create a node and wait until it accepts SSH connections. On
    /// timeout the half-created node is deleted before the error
    /// returns.
    pub async fn create_node(&self, ctx: &CreateContext) -> CloudResult<String> {
        let _permit = self.ops.acquire().await.map_err(|_| CloudError::Api {
            provider: "provider",
            reason: "operation semaphore closed".to_string(),
        })?;

        let ip = {
            let created = self.adapter.create_node(ctx).await;
            self.with_shun_on_error(created).await?
        };

        if !wait_ssh_ready(&ip, SSH_READY_TIMEOUT).await {
            warn!(%ip, provider = self.name(), "node never became reachable, deleting");
            let deleted = self.adapter.delete_node(&ip).await;
            let _ = self.with_shun_on_error(deleted).await;
            return Err(CloudError::CreateTimeout {
                ip,
                timeout: SSH_READY_TIMEOUT,
            });
        }
        Ok(ip)
    }

    pub async fn delete_node(&self, ip: &str) -> CloudResult<()> {
        let _permit = self.ops.acquire().await.map_err(|_| CloudError::Api {
            provider: "provider",
            reason: "operation semaphore closed".to_string(),
        })?;
        let deleted = self.adapter.delete_node(ip).await;
        self.with_shun_on_error(deleted).await
    }

    pub async fn list_nodes(&self) -> CloudResult<Vec<String>> {
        let listed = self.adapter.list_nodes().await;
        self.with_shun_on_error(listed).await
    }
}

/// Poll TCP port 22 until it accepts or the budget runs out.
async fn wait_ssh_ready(ip: &str, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        match tokio::net::TcpStream::connect((ip, 22)).await {
            Ok(_) => return true,
            Err(e) => debug!(%ip, error = %e, "ssh port not ready yet"),
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(SSH_READY_POLL).await;
    }
}

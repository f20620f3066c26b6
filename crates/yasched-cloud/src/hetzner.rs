//! Hetzner Cloud driver (`https://api.hetzner.cloud/v1`).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use crate::adapter::{debian_image_platforms, random_name, CloudAdapter, CreateContext};
use crate::error::{CloudError, CloudResult};

const API: &str = "https://api.hetzner.cloud/v1";

pub struct HetznerAdapter {
    http: reqwest::Client,
    token: String,
    server_type: String,
    image_name: String,
    platforms: Vec<String>,
}

#[derive(Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Deserialize)]
struct Server {
    id: i64,
    public_net: PublicNet,
}

#[derive(Deserialize)]
struct PublicNet {
    ipv4: Ipv4,
}

#[derive(Deserialize)]
struct Ipv4 {
    ip: String,
}

impl HetznerAdapter {
    pub fn new(token: String, server_type: String, image_name: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            server_type,
            platforms: debian_image_platforms(&image_name),
            image_name,
        }
    }

    fn api_error(reason: impl Into<String>) -> CloudError {
        CloudError::Api {
            provider: "hetzner",
            reason: reason.into(),
        }
    }

    async fn check(&self, resp: reqwest::Response) -> CloudResult<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(Self::api_error(format!("{status}: {body}")))
    }

    /// Register the process public key, tolerating an existing one.
    async fn ensure_ssh_key(&self, ctx: &CreateContext) -> CloudResult<()> {
        let resp = self
            .http
            .post(format!("{API}/ssh_keys"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "name": ctx.key_name,
                "public_key": ctx.public_key,
            }))
            .send()
            .await?;
        match resp.status() {
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                debug!(key = %ctx.key_name, "ssh key already registered");
                Ok(())
            }
            _ => self.check(resp).await.map(|_| ()),
        }
    }

    async fn find_server(&self, ip: &str) -> CloudResult<Option<i64>> {
        let resp = self
            .http
            .get(format!("{API}/servers"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let list: ServerList = self.check(resp).await?.json().await?;
        Ok(list
            .servers
            .iter()
            .find(|s| s.public_net.ipv4.ip == ip)
            .map(|s| s.id))
    }
}

#[async_trait]
impl CloudAdapter for HetznerAdapter {
    fn name(&self) -> &'static str {
        "hetzner"
    }

    fn supports_platform(&self, platform: &str) -> bool {
        self.platforms.iter().any(|p| p == platform)
    }

    async fn create_node(&self, ctx: &CreateContext) -> CloudResult<String> {
        self.ensure_ssh_key(ctx).await?;

        let name = random_name("node");
        let resp = self
            .http
            .post(format!("{API}/servers"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "name": name,
                "server_type": self.server_type,
                "image": self.image_name,
                "ssh_keys": [ctx.key_name],
                "user_data": ctx.user_data,
            }))
            .send()
            .await?;
        let created: ServerEnvelope = self.check(resp).await?.json().await?;
        let ip = created.server.public_net.ipv4.ip;
        info!(%ip, server = %name, "hetzner server created");
        Ok(ip)
    }

    async fn delete_node(&self, ip: &str) -> CloudResult<()> {
        let id = self
            .find_server(ip)
            .await?
            .ok_or_else(|| CloudError::UnknownNode {
                provider: "hetzner",
                ip: ip.to_string(),
            })?;
        let resp = self
            .http
            .delete(format!("{API}/servers/{id}"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        self.check(resp).await?;
        info!(%ip, "hetzner server deleted");
        Ok(())
    }

    async fn list_nodes(&self) -> CloudResult<Vec<String>> {
        let resp = self
            .http
            .get(format!("{API}/servers"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let list: ServerList = self.check(resp).await?.json().await?;
        Ok(list
            .servers
            .into_iter()
            .map(|s| s.public_net.ipv4.ip)
            .collect())
    }
}

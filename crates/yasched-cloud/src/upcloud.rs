//! UpCloud driver (`https://api.upcloud.com/1.3`, basic auth).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::adapter::{debian_image_platforms, random_name, CloudAdapter, CreateContext};
use crate::error::{CloudError, CloudResult};

const API: &str = "https://api.upcloud.com/1.3";

/// Public template UUID of Debian 11 (Bullseye).
const DEBIAN_TEMPLATE: &str = "01000000-0000-4000-8000-000020060100";

const STOP_POLL_INTERVAL: Duration = Duration::from_secs(5);
const STOP_ATTEMPTS: u32 = 24;

pub struct UpcloudAdapter {
    http: reqwest::Client,
    login: String,
    password: String,
    username: String,
    platforms: Vec<String>,
}

#[derive(Deserialize)]
struct ServersEnvelope {
    servers: ServerList,
}

#[derive(Deserialize)]
struct ServerList {
    server: Vec<ServerSummary>,
}

#[derive(Deserialize)]
struct ServerSummary {
    uuid: String,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerDetails,
}

#[derive(Deserialize)]
struct ServerDetails {
    uuid: String,
    #[serde(default)]
    state: String,
    ip_addresses: IpAddresses,
}

#[derive(Deserialize)]
struct IpAddresses {
    ip_address: Vec<IpAddress>,
}

#[derive(Deserialize)]
struct IpAddress {
    access: String,
    family: String,
    address: String,
}

impl UpcloudAdapter {
    pub fn new(login: String, password: String, username: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            login,
            password,
            username,
            platforms: debian_image_platforms("debian-11"),
        }
    }

    fn api_error(reason: impl Into<String>) -> CloudError {
        CloudError::Api {
            provider: "upcloud",
            reason: reason.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{API}{path}"))
            .basic_auth(&self.login, Some(&self.password))
    }

    async fn check(&self, resp: reqwest::Response) -> CloudResult<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(Self::api_error(format!("{status}: {body}")))
    }

    async fn server_details(&self, uuid: &str) -> CloudResult<ServerDetails> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/server/{uuid}"))
            .send()
            .await?;
        let env: ServerEnvelope = self.check(resp).await?.json().await?;
        Ok(env.server)
    }

    fn public_ipv4(details: &ServerDetails) -> Option<String> {
        details
            .ip_addresses
            .ip_address
            .iter()
            .find(|a| a.access == "public" && a.family == "IPv4")
            .map(|a| a.address.clone())
    }

    async fn find_server(&self, ip: &str) -> CloudResult<Option<ServerDetails>> {
        let resp = self.request(reqwest::Method::GET, "/server").send().await?;
        let list: ServersEnvelope = self.check(resp).await?.json().await?;
        for summary in list.servers.server {
            let details = self.server_details(&summary.uuid).await?;
            if Self::public_ipv4(&details).as_deref() == Some(ip) {
                return Ok(Some(details));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl CloudAdapter for UpcloudAdapter {
    fn name(&self) -> &'static str {
        "upcloud"
    }

    fn supports_platform(&self, platform: &str) -> bool {
        self.platforms.iter().any(|p| p == platform)
    }

    async fn create_node(&self, ctx: &CreateContext) -> CloudResult<String> {
        let name = random_name("node");
        let resp = self
            .request(reqwest::Method::POST, "/server")
            .json(&serde_json::json!({
                "server": {
                    "zone": "de-fra1",
                    "title": name,
                    "hostname": name,
                    "plan": "2xCPU-4GB",
                    "metadata": "yes",
                    "user_data": ctx.user_data,
                    "storage_devices": {
                        "storage_device": [{
                            "action": "clone",
                            "storage": DEBIAN_TEMPLATE,
                            "title": format!("{name}-disk"),
                            "size": 25,
                            "tier": "maxiops",
                        }]
                    },
                    "login_user": {
                        "username": self.username,
                        "ssh_keys": { "ssh_key": [ctx.public_key] },
                        "create_password": "no",
                    },
                }
            }))
            .send()
            .await?;
        let created: ServerEnvelope = self.check(resp).await?.json().await?;
        let ip = Self::public_ipv4(&created.server)
            .ok_or_else(|| Self::api_error("created server has no public IPv4"))?;
        info!(%ip, server = %name, "upcloud server created");
        Ok(ip)
    }

    async fn delete_node(&self, ip: &str) -> CloudResult<()> {
        let details = self
            .find_server(ip)
            .await?
            .ok_or_else(|| CloudError::UnknownNode {
                provider: "upcloud",
                ip: ip.to_string(),
            })?;
        let uuid = details.uuid;

        if details.state != "stopped" {
            let resp = self
                .request(reqwest::Method::POST, &format!("/server/{uuid}/stop"))
                .json(&serde_json::json!({ "stop_server": { "stop_type": "hard" } }))
                .send()
                .await?;
            self.check(resp).await?;

            let mut stopped = false;
            for _ in 0..STOP_ATTEMPTS {
                tokio::time::sleep(STOP_POLL_INTERVAL).await;
                if self.server_details(&uuid).await?.state == "stopped" {
                    stopped = true;
                    break;
                }
                debug!(%ip, "waiting for upcloud server to stop");
            }
            if !stopped {
                return Err(Self::api_error(format!("server {uuid} did not stop")));
            }
        }

        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("/server/{uuid}?storages=1"),
            )
            .send()
            .await?;
        self.check(resp).await?;
        info!(%ip, "upcloud server deleted");
        Ok(())
    }

    async fn list_nodes(&self) -> CloudResult<Vec<String>> {
        let resp = self.request(reqwest::Method::GET, "/server").send().await?;
        let list: ServersEnvelope = self.check(resp).await?.json().await?;
        let mut ips = Vec::new();
        for summary in list.servers.server {
            let details = self.server_details(&summary.uuid).await?;
            if let Some(ip) = Self::public_ipv4(&details) {
                ips.push(ip);
            }
        }
        Ok(ips)
    }
}

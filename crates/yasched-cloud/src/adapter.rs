//! The cloud adapter interface.
//!
//! One driver per provider, all implementing the same narrow surface:
//! create a node, delete a node, list what exists. Everything stateful
//! (capacity, throttling, readiness, shunning) lives above the adapter
//! in [`crate::provider::CloudProvider`].

use async_trait::async_trait;
use rand::Rng;

use crate::error::CloudResult;

/// Inputs every provider needs to create a node.
#[derive(Debug, Clone)]
pub struct CreateContext {
    /// Name under which the process keypair is registered at the provider.
    pub key_name: String,
    /// OpenSSH public key line of the process keypair.
    pub public_key: String,
    /// Rendered `#cloud-config` user data.
    pub user_data: String,
}

/// A thin driver over one provider's API.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether nodes from this provider satisfy the given platform tag.
    fn supports_platform(&self, platform: &str) -> bool;

    /// Create a server and return its public IPv4 address. The server
    /// may still be booting; readiness is the caller's concern.
    async fn create_node(&self, ctx: &CreateContext) -> CloudResult<String>;

    /// Delete the server holding this address, with its storage.
    async fn delete_node(&self, ip: &str) -> CloudResult<()>;

    /// Public addresses of all servers this provider currently runs.
    async fn list_nodes(&self) -> CloudResult<Vec<String>>;
}

/// `#cloud-config` user data attached at server creation.
#[derive(Debug, Clone, Default)]
pub struct CloudInit {
    pub package_upgrade: bool,
    pub packages: Vec<String>,
}

impl CloudInit {
    pub fn render(&self) -> String {
        let body = serde_json::json!({
            "package_upgrade": self.package_upgrade,
            "packages": self.packages,
        });
        format!("#cloud-config\n{body}")
    }
}

/// Platform tags implied by a debian image name like `debian-11`.
pub(crate) fn debian_image_platforms(image: &str) -> Vec<String> {
    let mut tags = vec![image.to_string()];
    if image.starts_with("debian") {
        tags.extend(
            ["debian", "debian-like", "linux"]
                .into_iter()
                .map(String::from),
        );
    }
    tags
}

/// `prefix-xxxxxxxx` with a random lowercase suffix.
pub(crate) fn random_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8).map(|_| rng.gen_range('a'..='z')).collect();
    format!("{prefix}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_init_renders_cloud_config_header_and_json() {
        let init = CloudInit {
            package_upgrade: true,
            packages: vec!["wget".to_string(), "openmpi-bin".to_string()],
        };
        let rendered = init.render();
        let (header, body) = rendered.split_once('\n').unwrap();
        assert_eq!(header, "#cloud-config");
        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed["package_upgrade"], true);
        assert_eq!(parsed["packages"][1], "openmpi-bin");
    }

    #[test]
    fn debian_image_implies_family_tags() {
        assert_eq!(
            debian_image_platforms("debian-11"),
            vec!["debian-11", "debian", "debian-like", "linux"]
        );
        assert_eq!(debian_image_platforms("fedora-39"), vec!["fedora-39"]);
    }

    #[test]
    fn random_names_carry_prefix_and_differ() {
        let a = random_name("node");
        let b = random_name("node");
        assert!(a.starts_with("node-"));
        assert_eq!(a.len(), "node-".len() + 8);
        assert_ne!(a, b);
    }
}

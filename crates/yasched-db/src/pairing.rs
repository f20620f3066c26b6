//! Task ↔ node pairing policy.
//!
//! Pure decision logic, separated from the SQL so the policy is testable:
//! FIFO by task id; a task goes to the lowest-IP free node whose probed
//! platforms cover the task's engine. Tasks with no matching free node
//! are skipped without blocking later tasks.

use std::net::IpAddr;

use yasched_core::EngineRepository;

/// A free node eligible for assignment, with its probed platform tags.
#[derive(Debug, Clone)]
pub struct FreeNode {
    pub ip: String,
    pub platforms: Vec<String>,
    pub ncpus: Option<i16>,
}

/// Pair candidate tasks (id, engine name), already FIFO-ordered, with
/// free nodes. Returns `(task_id, node_ip)` claims; each node is used at
/// most once.
pub fn pair(
    candidates: &[(i32, String)],
    free: &[FreeNode],
    engines: &EngineRepository,
) -> Vec<(i32, String)> {
    let mut nodes: Vec<&FreeNode> = free.iter().collect();
    nodes.sort_by_key(|n| ip_sort_key(&n.ip));

    let mut taken = vec![false; nodes.len()];
    let mut claims = Vec::new();

    for (task_id, engine_name) in candidates {
        let Some(engine) = engines.get(engine_name) else {
            continue;
        };
        let slot = nodes
            .iter()
            .enumerate()
            .find(|(i, n)| !taken[*i] && engine.supports_any(&n.platforms));
        if let Some((i, node)) = slot {
            taken[i] = true;
            claims.push((*task_id, node.ip.clone()));
        }
    }
    claims
}

/// Numeric ordering for real addresses, lexicographic fallback otherwise.
fn ip_sort_key(ip: &str) -> (bool, Option<IpAddr>, String) {
    let parsed = ip.parse::<IpAddr>().ok();
    (parsed.is_none(), parsed, ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use yasched_core::{DeploySource, Engine, ProcessCheck};

    fn engine(name: &str, platforms: &[&str]) -> Engine {
        Engine {
            name: name.to_string(),
            platforms: platforms.iter().map(|s| s.to_string()).collect(),
            platform_packages: vec![],
            deploy: DeploySource::LocalFiles {
                files: vec![PathBuf::from("bin")],
            },
            spawn: "{engine_path}/bin {task_path}/in".to_string(),
            check: ProcessCheck::ProcessName {
                name: "bin".to_string(),
            },
            sleep_interval: 1,
            input_files: vec!["in".to_string()],
            output_files: vec!["out".to_string()],
        }
    }

    fn node(ip: &str, platforms: &[&str]) -> FreeNode {
        FreeNode {
            ip: ip.to_string(),
            platforms: platforms.iter().map(|s| s.to_string()).collect(),
            ncpus: Some(4),
        }
    }

    #[test]
    fn fifo_by_task_id_lowest_ip_first() {
        let engines = EngineRepository::new([engine("dummy", &["debian-11"])]);
        let free = vec![
            node("10.0.0.10", &["debian-11", "debian", "linux"]),
            node("10.0.0.2", &["debian-11", "debian", "linux"]),
        ];
        let candidates = vec![(1, "dummy".to_string()), (2, "dummy".to_string())];

        let claims = pair(&candidates, &free, &engines);
        // 10.0.0.2 < 10.0.0.10 numerically, though not lexicographically.
        assert_eq!(
            claims,
            vec![(1, "10.0.0.2".to_string()), (2, "10.0.0.10".to_string())]
        );
    }

    #[test]
    fn unsupported_platform_is_never_assigned() {
        let engines = EngineRepository::new([engine("dummy", &["debian-11"])]);
        let free = vec![node("10.0.0.1", &["windows-10", "windows"])];
        let claims = pair(&[(1, "dummy".to_string())], &free, &engines);
        assert!(claims.is_empty());
    }

    #[test]
    fn unmatched_task_does_not_block_later_tasks() {
        let engines = EngineRepository::new([
            engine("lin", &["debian-11"]),
            engine("win", &["windows-10"]),
        ]);
        let free = vec![node("10.0.0.1", &["debian-11", "debian", "linux"])];
        let candidates = vec![(1, "win".to_string()), (2, "lin".to_string())];

        let claims = pair(&candidates, &free, &engines);
        assert_eq!(claims, vec![(2, "10.0.0.1".to_string())]);
    }

    #[test]
    fn each_node_claimed_at_most_once() {
        let engines = EngineRepository::new([engine("dummy", &["debian-11"])]);
        let free = vec![node("10.0.0.1", &["debian-11"])];
        let candidates = vec![(1, "dummy".to_string()), (2, "dummy".to_string())];

        let claims = pair(&candidates, &free, &engines);
        assert_eq!(claims, vec![(1, "10.0.0.1".to_string())]);
    }

    #[test]
    fn unknown_engine_is_skipped() {
        let engines = EngineRepository::new([engine("dummy", &["debian-11"])]);
        let free = vec![node("10.0.0.1", &["debian-11"])];
        let claims = pair(&[(1, "ghost".to_string())], &free, &engines);
        assert!(claims.is_empty());
    }

    #[test]
    fn provisioning_placeholder_ips_sort_last() {
        let engines = EngineRepository::new([engine("dummy", &["debian-11"])]);
        let free = vec![
            node("prov0a1b2c3d4e", &["debian-11"]),
            node("10.0.0.9", &["debian-11"]),
        ];
        let claims = pair(&[(1, "dummy".to_string())], &free, &engines);
        assert_eq!(claims, vec![(1, "10.0.0.9".to_string())]);
    }
}

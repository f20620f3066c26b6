//! Queue policy regression tests.
//!
//! Drives the pure decision pipeline end to end: parse a realistic
//! config, validate submissions against it, and pair tasks with nodes
//! the way the repository claim does.

use std::collections::BTreeMap;

use yasched_core::Config;
use yasched_db::{pairing, FreeNode};
use yasched_scheduler::{submit::validate_submission, SubmitError};

const CONFIG: &str = r#"
[db]
user = ya
password = pw
database = sched

[local]
data_dir = /var/lib/yascheduler

[remote]
data_dir = /data

[engine.dummy]
platforms = debian-11
deploy_local_files = dummyengine
spawn = {engine_path}/dummyengine {task_path}/1.input
check_pname = dummyengine
sleep_interval = 1
input_files = 1.input
output_files = 1.input 1.input.out

[engine.broken]
deploy_local_files = brokenengine
spawn = {nonsense} file
check_pname = brokenengine
input_files = 1.input
output_files = 1.input.out
"#;

fn debian_node(ip: &str) -> FreeNode {
    FreeNode {
        ip: ip.to_string(),
        platforms: ["debian-11", "debian", "debian-like", "linux"]
            .map(String::from)
            .to_vec(),
        ncpus: Some(4),
    }
}

fn windows_node(ip: &str) -> FreeNode {
    FreeNode {
        ip: ip.to_string(),
        platforms: ["windows-10", "windows"].map(String::from).to_vec(),
        ncpus: Some(8),
    }
}

fn inputs() -> BTreeMap<String, String> {
    BTreeMap::from([("1.input".to_string(), "hello".to_string())])
}

#[test]
fn submission_against_configured_engine_is_accepted() {
    let cfg = Config::from_ini(CONFIG).unwrap();
    assert!(validate_submission(&cfg.engines, "dummy", &inputs()).is_ok());
}

#[test]
fn broken_spawn_template_rejects_at_submission_not_dispatch() {
    let cfg = Config::from_ini(CONFIG).unwrap();
    // The engine section itself parses (the daemon must start even with
    // a broken engine on record)...
    assert!(cfg.engines.get("broken").is_some());
    // ...but no task against it ever enters the queue.
    let err = validate_submission(&cfg.engines, "broken", &inputs()).unwrap_err();
    assert!(matches!(err, SubmitError::BadSpawnTemplate { .. }));
}

#[test]
fn windows_node_is_never_assigned_a_debian_engine() {
    let cfg = Config::from_ini(CONFIG).unwrap();
    let free = vec![windows_node("10.0.0.5")];
    let claims = pairing::pair(&[(1, "dummy".to_string())], &free, &cfg.engines);
    assert!(claims.is_empty());

    // The same node still serves engines that do cover it.
    let free = vec![windows_node("10.0.0.5"), debian_node("10.0.0.6")];
    let claims = pairing::pair(&[(1, "dummy".to_string())], &free, &cfg.engines);
    assert_eq!(claims, vec![(1, "10.0.0.6".to_string())]);
}

#[test]
fn claims_are_fifo_and_exhaust_free_nodes() {
    let cfg = Config::from_ini(CONFIG).unwrap();
    let free = vec![debian_node("10.0.0.2"), debian_node("10.0.0.1")];
    let candidates: Vec<(i32, String)> =
        (1..=3).map(|id| (id, "dummy".to_string())).collect();

    let claims = pairing::pair(&candidates, &free, &cfg.engines);
    assert_eq!(
        claims,
        vec![(1, "10.0.0.1".to_string()), (2, "10.0.0.2".to_string())]
    );
}

#[test]
fn spawn_renders_with_node_cpu_fallback() {
    let cfg = Config::from_ini(CONFIG).unwrap();
    let engine = cfg.engines.get("dummy").unwrap();
    let cmd = engine
        .render_spawn("/data/tasks/7", "/data/engines/dummy", 4)
        .unwrap();
    assert_eq!(cmd, "/data/engines/dummy/dummyengine /data/tasks/7/1.input");
}

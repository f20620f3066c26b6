//! Engine declarations.
//!
//! An engine describes a simulation program: which platforms it runs on,
//! how its artifacts reach a node, how a task is spawned, and how the
//! spawned process is observed. Declarations are immutable for the
//! lifetime of the process; identity is the engine name.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Placeholders the spawn template may reference.
pub const SPAWN_PLACEHOLDERS: [&str; 3] = ["task_path", "engine_path", "ncpus"];

/// How an engine's artifacts are materialized on a remote node.
///
/// Exactly one variant per engine, enforced when the config is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploySource {
    /// Upload each named file from the local engine directory.
    LocalFiles { files: Vec<PathBuf> },
    /// Upload a single local archive and extract it in place.
    LocalArchive { file: PathBuf },
    /// Download an archive on the remote host and extract it in place.
    RemoteArchive { url: String },
}

/// How the liveness of a spawned engine process is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessCheck {
    /// `pgrep`-style match against the process name / command line.
    ProcessName { name: String },
    /// Run a command and compare its exit code against `expected_code`.
    Command { cmd: String, expected_code: i32 },
}

/// A single engine declaration, parsed from an `[engine.<name>]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Engine {
    pub name: String,
    /// Platform tags this engine may be deployed on (e.g. `debian-11`).
    pub platforms: Vec<String>,
    /// OS packages installed on the node before the engine runs.
    pub platform_packages: Vec<String>,
    pub deploy: DeploySource,
    /// Spawn command template; see [`SPAWN_PLACEHOLDERS`].
    pub spawn: String,
    pub check: ProcessCheck,
    /// Liveness poll interval in seconds.
    pub sleep_interval: u64,
    /// Input filenames a task must provide.
    pub input_files: Vec<String>,
    /// Output filenames collected when the task finishes.
    pub output_files: Vec<String>,
}

impl Engine {
    /// Whether any of the node's platform tags is covered by this engine.
    pub fn supports_any(&self, node_platforms: &[String]) -> bool {
        self.platforms.iter().any(|p| node_platforms.contains(p))
    }

    /// Placeholders in the spawn template that are not recognized.
    ///
    /// Non-empty means any submission against this engine must be
    /// rejected (the template can never be rendered).
    pub fn unknown_spawn_placeholders(&self) -> Vec<String> {
        placeholders(&self.spawn)
            .into_iter()
            .filter(|p| !SPAWN_PLACEHOLDERS.contains(&p.as_str()))
            .collect()
    }

    /// Render the spawn template. Strict: unrecognized placeholders are
    /// an error, never passed through.
    pub fn render_spawn(
        &self,
        task_path: &str,
        engine_path: &str,
        ncpus: u32,
    ) -> Result<String, String> {
        let unknown = self.unknown_spawn_placeholders();
        if !unknown.is_empty() {
            return Err(format!(
                "unknown spawn placeholder(s): {}",
                unknown.join(", ")
            ));
        }
        Ok(self
            .spawn
            .replace("{task_path}", task_path)
            .replace("{engine_path}", engine_path)
            .replace("{ncpus}", &ncpus.to_string()))
    }
}

/// Extract `{name}` tokens from a template.
fn placeholders(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rest = &rest[open + 1..];
        match rest.find('}') {
            Some(close) => {
                out.push(rest[..close].to_string());
                rest = &rest[close + 1..];
            }
            None => break,
        }
    }
    out
}

/// Immutable name → engine map built from the config file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineRepository {
    engines: BTreeMap<String, Engine>,
}

impl EngineRepository {
    pub fn new(engines: impl IntoIterator<Item = Engine>) -> Self {
        Self {
            engines: engines.into_iter().map(|e| (e.name.clone(), e)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Engine> {
        self.engines.get(name)
    }

    pub fn values(&self) -> impl Iterator<Item = &Engine> {
        self.engines.values()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Engines deployable on a node with the given platform tags.
    pub fn filter_platforms(&self, node_platforms: &[String]) -> Self {
        Self {
            engines: self
                .engines
                .iter()
                .filter(|(_, e)| e.supports_any(node_platforms))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Union of all platform packages, deduplicated and sorted.
    pub fn platform_packages(&self) -> Vec<String> {
        let mut pkgs: Vec<String> = self
            .engines
            .values()
            .flat_map(|e| e.platform_packages.iter().cloned())
            .collect();
        pkgs.sort();
        pkgs.dedup();
        pkgs
    }

    /// The shortest declared poll interval; drives the reconciler period.
    pub fn min_sleep_interval(&self) -> Option<u64> {
        self.engines.values().map(|e| e.sleep_interval).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_engine(spawn: &str) -> Engine {
        Engine {
            name: "dummy".to_string(),
            platforms: vec!["debian-11".to_string()],
            platform_packages: vec![],
            deploy: DeploySource::LocalFiles {
                files: vec![PathBuf::from("dummyengine")],
            },
            spawn: spawn.to_string(),
            check: ProcessCheck::ProcessName {
                name: "dummyengine".to_string(),
            },
            sleep_interval: 1,
            input_files: vec!["1.input".to_string()],
            output_files: vec!["1.input".to_string(), "1.input.out".to_string()],
        }
    }

    #[test]
    fn render_substitutes_all_placeholders() {
        let e = dummy_engine("{engine_path}/dummyengine {task_path}/1.input -n {ncpus}");
        let cmd = e.render_spawn("/data/tasks/7", "/data/engines/dummy", 4).unwrap();
        assert_eq!(cmd, "/data/engines/dummy/dummyengine /data/tasks/7/1.input -n 4");
    }

    #[test]
    fn render_rejects_unknown_placeholder() {
        let e = dummy_engine("{nonsense} file");
        assert_eq!(e.unknown_spawn_placeholders(), vec!["nonsense".to_string()]);
        let err = e.render_spawn("/t", "/e", 1).unwrap_err();
        assert!(err.contains("nonsense"));
    }

    #[test]
    fn render_accepts_template_without_placeholders() {
        let e = dummy_engine("run-fixed-job");
        assert_eq!(e.render_spawn("/t", "/e", 1).unwrap(), "run-fixed-job");
    }

    #[test]
    fn supports_any_intersects_platform_tags() {
        let e = dummy_engine("x");
        assert!(e.supports_any(&[
            "debian-11".to_string(),
            "debian".to_string(),
            "linux".to_string()
        ]));
        assert!(!e.supports_any(&["windows-10".to_string(), "windows".to_string()]));
    }

    #[test]
    fn filter_platforms_keeps_matching_engines_only() {
        let mut win = dummy_engine("x");
        win.name = "win-only".to_string();
        win.platforms = vec!["windows-11".to_string()];
        let repo = EngineRepository::new([dummy_engine("x"), win]);

        let on_debian = repo.filter_platforms(&["debian-11".to_string()]);
        assert_eq!(on_debian.len(), 1);
        assert!(on_debian.get("dummy").is_some());
        assert!(on_debian.get("win-only").is_none());
    }

    #[test]
    fn platform_packages_are_deduplicated() {
        let mut a = dummy_engine("x");
        a.platform_packages = vec!["wget".to_string(), "openmpi-bin".to_string()];
        let mut b = dummy_engine("x");
        b.name = "other".to_string();
        b.platform_packages = vec!["wget".to_string()];
        let repo = EngineRepository::new([a, b]);
        assert_eq!(repo.platform_packages(), vec!["openmpi-bin", "wget"]);
    }

    #[test]
    fn min_sleep_interval_over_engines() {
        let mut a = dummy_engine("x");
        a.sleep_interval = 10;
        let mut b = dummy_engine("x");
        b.name = "fast".to_string();
        b.sleep_interval = 2;
        let repo = EngineRepository::new([a, b]);
        assert_eq!(repo.min_sleep_interval(), Some(2));
        assert_eq!(EngineRepository::default().min_sleep_interval(), None);
    }
}

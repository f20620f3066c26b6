//! Configuration file parser.
//!
//! The config is INI-style with sections `[db]`, `[local]`, `[remote]`,
//! `[clouds]` and one `[engine.<name>]` per engine. `%(key)s` references
//! are interpolated within a section. Unknown keys warn but never fail;
//! structural problems (missing credentials, violated mutual exclusion)
//! are fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use configparser::ini::Ini;
use tracing::warn;

use crate::engine::{DeploySource, Engine, EngineRepository, ProcessCheck};
use crate::error::{ConfigError, ConfigResult};

/// Default config path, overridden by `YASCHEDULER_CONF_PATH`.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/yascheduler/yascheduler.conf";

type Section = HashMap<String, Option<String>>;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub clouds: Vec<CloudConfig>,
    pub engines: EngineRepository,
}

/// `[db]` — PostgreSQL connection parameters.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub user: String,
    pub password: String,
    pub database: String,
    pub host: String,
    pub port: u16,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            user: "yascheduler".to_string(),
            password: "password".to_string(),
            database: "database".to_string(),
            host: "localhost".to_string(),
            port: 5432,
        }
    }
}

/// `[local]` — scheduler-side paths and per-process rate limits.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub data_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub engines_dir: PathBuf,
    pub keys_dir: PathBuf,
    pub webhook_reqs_limit: usize,
    pub conn_machine_limit: usize,
    pub conn_machine_pending: usize,
    pub allocate_limit: usize,
    pub allocate_pending: usize,
    pub consume_limit: usize,
    pub consume_pending: usize,
    pub deallocate_limit: usize,
    pub deallocate_pending: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            tasks_dir: data_dir.join("tasks"),
            engines_dir: data_dir.join("engines"),
            keys_dir: data_dir.join("keys"),
            data_dir,
            webhook_reqs_limit: 5,
            conn_machine_limit: 5,
            conn_machine_pending: 10,
            allocate_limit: 10,
            allocate_pending: 1,
            consume_limit: 5,
            consume_pending: 1,
            deallocate_limit: 5,
            deallocate_pending: 1,
        }
    }
}

/// `[remote]` — node-side layout.
///
/// Paths stay as strings: separator and home-relative resolution depend
/// on the platform probed at connect time.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub data_dir: String,
    pub tasks_dir: String,
    pub engines_dir: String,
    pub username: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            tasks_dir: "./data/tasks".to_string(),
            engines_dir: "./data/engines".to_string(),
            username: "root".to_string(),
        }
    }
}

/// One provider entry from `[clouds]`, selected by key prefix.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Provider name; doubles as the node registry's cloud tag.
    pub name: String,
    pub credentials: CloudCredentials,
    /// `max_nodes < 1` disables the provider entirely.
    pub max_nodes: i64,
    pub username: String,
    pub priority: i32,
    /// Seconds a node must stay idle before scale-down may take it.
    pub idle_tolerance: u64,
    pub jump_host: Option<String>,
    pub jump_user: Option<String>,
}

/// Provider-specific credentials and machine shape.
#[derive(Debug, Clone)]
pub enum CloudCredentials {
    Hetzner {
        token: String,
        server_type: String,
        image_name: String,
    },
    Upcloud {
        login: String,
        password: String,
    },
}

impl Config {
    /// Config path from `YASCHEDULER_CONF_PATH`, else the default.
    pub fn default_path() -> PathBuf {
        std::env::var_os("YASCHEDULER_CONF_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_ini(&text)
    }

    /// Parse from INI text.
    pub fn from_ini(text: &str) -> ConfigResult<Self> {
        let mut ini = Ini::new_cs();
        let raw = ini.read(text.to_string()).map_err(ConfigError::Parse)?;

        let mut sections: HashMap<String, Section> = HashMap::new();
        for (name, sec) in raw {
            sections.insert(name, interpolate(sec));
        }

        let local = LocalConfig::from_section(sections.get("local"))?;
        let remote = RemoteConfig::from_section(sections.get("remote"))?;
        let clouds = parse_clouds(sections.get("clouds"), &remote)?;

        let mut engines = Vec::new();
        for (name, sec) in &sections {
            if let Some(engine_name) = name.strip_prefix("engine.") {
                engines.push(parse_engine(engine_name, sec)?);
            } else if !matches!(name.as_str(), "db" | "local" | "remote" | "clouds" | "default") {
                warn!(section = %name, "unknown config section");
            }
        }

        Ok(Self {
            db: DbConfig::from_section(sections.get("db"))?,
            local,
            remote,
            clouds,
            engines: EngineRepository::new(engines),
        })
    }
}

/// Expand `%(key)s` references against the same section.
///
/// One substitution per value per pass, ten passes at most, so nested
/// references resolve while self-references cannot spin forever.
fn interpolate(sec: Section) -> Section {
    let mut out = sec.clone();
    for _ in 0..10 {
        let mut changed = false;
        let snapshot = out.clone();
        for value in out.values_mut().flatten() {
            let Some(start) = value.find("%(") else {
                continue;
            };
            let Some(end) = value[start..].find(")s") else {
                continue;
            };
            let key = value[start + 2..start + end].to_string();
            if let Some(replacement) = snapshot.get(&key).and_then(|v| v.clone()) {
                value.replace_range(start..start + end + 2, &replacement);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    out
}

fn get(sec: Option<&Section>, key: &str) -> Option<String> {
    sec.and_then(|s| s.get(key)).and_then(|v| v.clone())
}

fn get_parsed<T: std::str::FromStr>(
    sec: Option<&Section>,
    section: &str,
    key: &str,
) -> ConfigResult<Option<T>> {
    match get(sec, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(section, key, format!("`{raw}` is not a number"))),
    }
}

/// Whitespace-separated list value.
fn get_list(sec: Option<&Section>, key: &str) -> Vec<String> {
    get(sec, key)
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn warn_unknown_keys(sec: Option<&Section>, section: &str, known: &[&str]) {
    let Some(sec) = sec else { return };
    for key in sec.keys() {
        if !known.contains(&key.as_str()) {
            warn!(section, key = %key, "unknown config key");
        }
    }
}

impl DbConfig {
    fn from_section(sec: Option<&Section>) -> ConfigResult<Self> {
        warn_unknown_keys(sec, "db", &["user", "password", "database", "host", "port"]);
        let d = Self::default();
        Ok(Self {
            user: get(sec, "user").unwrap_or(d.user),
            password: get(sec, "password").unwrap_or(d.password),
            database: get(sec, "database").unwrap_or(d.database),
            host: get(sec, "host").unwrap_or(d.host),
            port: get_parsed(sec, "db", "port")?.unwrap_or(d.port),
        })
    }
}

impl LocalConfig {
    fn from_section(sec: Option<&Section>) -> ConfigResult<Self> {
        warn_unknown_keys(
            sec,
            "local",
            &[
                "data_dir",
                "tasks_dir",
                "engines_dir",
                "keys_dir",
                "webhook_reqs_limit",
                "conn_machine_limit",
                "conn_machine_pending",
                "allocate_limit",
                "allocate_pending",
                "consume_limit",
                "consume_pending",
                "deallocate_limit",
                "deallocate_pending",
            ],
        );
        let d = Self::default();
        let data_dir = get(sec, "data_dir").map(PathBuf::from).unwrap_or(d.data_dir);

        let limit = |key: &str, default: usize| -> ConfigResult<usize> {
            let v = get_parsed(sec, "local", key)?.unwrap_or(default);
            if v < 1 {
                return Err(ConfigError::invalid("local", key, "must be at least 1"));
            }
            Ok(v)
        };

        Ok(Self {
            tasks_dir: get(sec, "tasks_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("tasks")),
            engines_dir: get(sec, "engines_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("engines")),
            keys_dir: get(sec, "keys_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("keys")),
            data_dir,
            webhook_reqs_limit: limit("webhook_reqs_limit", d.webhook_reqs_limit)?,
            conn_machine_limit: limit("conn_machine_limit", d.conn_machine_limit)?,
            conn_machine_pending: limit("conn_machine_pending", d.conn_machine_pending)?,
            allocate_limit: limit("allocate_limit", d.allocate_limit)?,
            allocate_pending: limit("allocate_pending", d.allocate_pending)?,
            consume_limit: limit("consume_limit", d.consume_limit)?,
            consume_pending: limit("consume_pending", d.consume_pending)?,
            deallocate_limit: limit("deallocate_limit", d.deallocate_limit)?,
            deallocate_pending: limit("deallocate_pending", d.deallocate_pending)?,
        })
    }
}

impl RemoteConfig {
    fn from_section(sec: Option<&Section>) -> ConfigResult<Self> {
        warn_unknown_keys(sec, "remote", &["data_dir", "tasks_dir", "engines_dir", "user"]);
        let data_dir = get(sec, "data_dir").unwrap_or_else(|| "./data".to_string());
        Ok(Self {
            tasks_dir: get(sec, "tasks_dir").unwrap_or_else(|| format!("{data_dir}/tasks")),
            engines_dir: get(sec, "engines_dir").unwrap_or_else(|| format!("{data_dir}/engines")),
            data_dir,
            username: get(sec, "user").unwrap_or_else(|| "root".to_string()),
        })
    }
}

/// Providers recognized in the `[clouds]` section, by key prefix.
const CLOUD_PREFIXES: [&str; 2] = ["hetzner", "upcloud"];

fn parse_clouds(sec: Option<&Section>, remote: &RemoteConfig) -> ConfigResult<Vec<CloudConfig>> {
    let Some(section) = sec else {
        return Ok(Vec::new());
    };

    for key in section.keys() {
        if !CLOUD_PREFIXES.iter().any(|p| key.starts_with(&format!("{p}_"))) {
            warn!(section = "clouds", key = %key, "unknown config key");
        }
    }

    let mut clouds = Vec::new();
    for prefix in CLOUD_PREFIXES {
        let has_any = section.keys().any(|k| k.starts_with(&format!("{prefix}_")));
        if !has_any {
            continue;
        }
        let sub = |key: &str| get(sec, &format!("{prefix}_{key}"));
        let require = |key: &str| {
            sub(key).ok_or_else(|| ConfigError::MissingKey {
                section: "clouds".to_string(),
                key: format!("{prefix}_{key}"),
            })
        };

        let credentials = match prefix {
            "hetzner" => CloudCredentials::Hetzner {
                token: require("token")?,
                server_type: sub("server_type").unwrap_or_else(|| "cx51".to_string()),
                image_name: sub("image_name").unwrap_or_else(|| "debian-11".to_string()),
            },
            "upcloud" => CloudCredentials::Upcloud {
                login: require("login")?,
                password: require("password")?,
            },
            _ => unreachable!(),
        };

        clouds.push(CloudConfig {
            name: prefix.to_string(),
            credentials,
            max_nodes: get_parsed(sec, "clouds", &format!("{prefix}_max_nodes"))?.unwrap_or(10),
            username: sub("user").unwrap_or_else(|| remote.username.clone()),
            priority: get_parsed(sec, "clouds", &format!("{prefix}_priority"))?.unwrap_or(0),
            idle_tolerance: get_parsed(sec, "clouds", &format!("{prefix}_idle_tolerance"))?
                .unwrap_or(60),
            jump_host: sub("jump_host"),
            jump_user: sub("jump_user"),
        });
    }
    Ok(clouds)
}

fn parse_engine(name: &str, sec: &Section) -> ConfigResult<Engine> {
    let sec = Some(sec);
    let section = format!("engine.{name}");
    warn_unknown_keys(
        sec,
        &section,
        &[
            "platforms",
            "platform_packages",
            "deploy_local_files",
            "deploy_local_archive",
            "deploy_remote_archive",
            "spawn",
            "check_pname",
            "check_cmd",
            "check_cmd_code",
            "sleep_interval",
            "input_files",
            "output_files",
        ],
    );

    let local_files = get_list(sec, "deploy_local_files");
    let local_archive = get(sec, "deploy_local_archive");
    let remote_archive = get(sec, "deploy_remote_archive");
    let mut sources = Vec::new();
    if !local_files.is_empty() {
        sources.push(DeploySource::LocalFiles {
            files: local_files.into_iter().map(PathBuf::from).collect(),
        });
    }
    if let Some(file) = local_archive {
        sources.push(DeploySource::LocalArchive {
            file: PathBuf::from(file),
        });
    }
    if let Some(url) = remote_archive {
        sources.push(DeploySource::RemoteArchive { url });
    }
    if sources.len() != 1 {
        return Err(ConfigError::engine(
            name,
            "exactly one of deploy_local_files, deploy_local_archive, \
             deploy_remote_archive must be set",
        ));
    }
    let deploy = sources.remove(0);

    let check_pname = get(sec, "check_pname");
    let check_cmd = get(sec, "check_cmd");
    let check = match (check_pname, check_cmd) {
        (Some(pname), None) => ProcessCheck::ProcessName { name: pname },
        (None, Some(cmd)) => ProcessCheck::Command {
            cmd,
            expected_code: get_parsed(sec, &section, "check_cmd_code")?.unwrap_or(0),
        },
        (Some(_), Some(_)) => {
            return Err(ConfigError::engine(
                name,
                "check_pname and check_cmd are mutually exclusive",
            ))
        }
        (None, None) => {
            return Err(ConfigError::engine(
                name,
                "one of check_pname or check_cmd must be set",
            ))
        }
    };

    let spawn = get(sec, "spawn").ok_or_else(|| ConfigError::engine(name, "spawn is required"))?;

    let input_files = get_list(sec, "input_files");
    let output_files = get_list(sec, "output_files");
    if input_files.is_empty() {
        return Err(ConfigError::engine(name, "input_files must not be empty"));
    }
    if output_files.is_empty() {
        return Err(ConfigError::engine(name, "output_files must not be empty"));
    }

    let mut platforms = get_list(sec, "platforms");
    if platforms.is_empty() {
        platforms.push("debian-11".to_string());
    }

    let engine = Engine {
        name: name.to_string(),
        platforms,
        platform_packages: get_list(sec, "platform_packages"),
        deploy,
        spawn,
        check,
        sleep_interval: get_parsed(sec, &section, "sleep_interval")?.unwrap_or(10),
        input_files,
        output_files,
    };

    // A broken spawn template is not fatal at startup: submissions against
    // this engine are rejected instead (never at dispatch time).
    let unknown = engine.unknown_spawn_placeholders();
    if !unknown.is_empty() {
        warn!(
            engine = %name,
            placeholders = %unknown.join(", "),
            "spawn template has unknown placeholders; submissions will be rejected"
        );
    }

    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[db]
user = ya
password = secret
database = sched
host = db.internal
port = 5433

[local]
data_dir = /var/lib/yascheduler
keys_dir = %(data_dir)s/keys
conn_machine_limit = 3
conn_machine_pending = 7

[remote]
data_dir = /data
user = worker

[clouds]
hetzner_token = tok123
hetzner_max_nodes = 2
hetzner_priority = 10
hetzner_idle_tolerance = 120
upcloud_login = cloudadmin
upcloud_password = pw
upcloud_max_nodes = 5
upcloud_priority = 5

[engine.dummy]
platforms = debian-11 debian-12
platform_packages = openmpi-bin
deploy_local_files = dummyengine
spawn = {engine_path}/dummyengine {task_path}/1.input
check_pname = dummyengine
sleep_interval = 1
input_files = 1.input
output_files = 1.input 1.input.out
"#;

    #[test]
    fn parses_full_config() {
        let cfg = Config::from_ini(FULL).unwrap();
        assert_eq!(cfg.db.host, "db.internal");
        assert_eq!(cfg.db.port, 5433);
        assert_eq!(cfg.local.data_dir, PathBuf::from("/var/lib/yascheduler"));
        assert_eq!(cfg.local.conn_machine_limit, 3);
        assert_eq!(cfg.local.conn_machine_pending, 7);
        assert_eq!(cfg.remote.username, "worker");
        assert_eq!(cfg.remote.tasks_dir, "/data/tasks");
        assert_eq!(cfg.clouds.len(), 2);
        assert_eq!(cfg.engines.len(), 1);

        let dummy = cfg.engines.get("dummy").unwrap();
        assert_eq!(dummy.platforms, vec!["debian-11", "debian-12"]);
        assert_eq!(dummy.sleep_interval, 1);
        assert!(matches!(dummy.deploy, DeploySource::LocalFiles { .. }));
        assert!(matches!(dummy.check, ProcessCheck::ProcessName { .. }));
    }

    #[test]
    fn interpolation_within_section() {
        let cfg = Config::from_ini(FULL).unwrap();
        assert_eq!(cfg.local.keys_dir, PathBuf::from("/var/lib/yascheduler/keys"));
    }

    #[test]
    fn empty_config_yields_defaults() {
        let cfg = Config::from_ini("").unwrap();
        assert_eq!(cfg.db.user, "yascheduler");
        assert_eq!(cfg.db.port, 5432);
        assert_eq!(cfg.local.tasks_dir, PathBuf::from("./data/tasks"));
        assert_eq!(cfg.local.allocate_limit, 10);
        assert_eq!(cfg.local.allocate_pending, 1);
        assert_eq!(cfg.remote.username, "root");
        assert!(cfg.clouds.is_empty());
        assert!(cfg.engines.is_empty());
    }

    #[test]
    fn cloud_settings_and_user_fallback() {
        let cfg = Config::from_ini(FULL).unwrap();
        let hetzner = cfg.clouds.iter().find(|c| c.name == "hetzner").unwrap();
        assert_eq!(hetzner.max_nodes, 2);
        assert_eq!(hetzner.priority, 10);
        assert_eq!(hetzner.idle_tolerance, 120);
        // No hetzner_user set: falls back to the remote username.
        assert_eq!(hetzner.username, "worker");
        assert!(matches!(
            &hetzner.credentials,
            CloudCredentials::Hetzner { token, .. } if token == "tok123"
        ));
    }

    #[test]
    fn cloud_requires_credentials() {
        let err = Config::from_ini("[clouds]\nhetzner_max_nodes = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
    }

    #[test]
    fn engine_requires_exactly_one_deploy_source() {
        let none = r#"
[engine.bad]
spawn = x
check_pname = x
input_files = a
output_files = b
"#;
        assert!(matches!(
            Config::from_ini(none).unwrap_err(),
            ConfigError::Engine { .. }
        ));

        let both = r#"
[engine.bad]
deploy_local_files = a
deploy_remote_archive = https://example.org/a.tar.gz
spawn = x
check_pname = x
input_files = a
output_files = b
"#;
        assert!(matches!(
            Config::from_ini(both).unwrap_err(),
            ConfigError::Engine { .. }
        ));
    }

    #[test]
    fn engine_requires_exactly_one_check() {
        let both = r#"
[engine.bad]
deploy_local_files = a
spawn = x
check_pname = x
check_cmd = pgrep x
input_files = a
output_files = b
"#;
        let err = Config::from_ini(both).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn engine_check_cmd_carries_expected_code() {
        let text = r#"
[engine.e]
deploy_local_files = bin
spawn = {engine_path}/bin
check_cmd = tasklist /fi "imagename eq bin"
check_cmd_code = 1
input_files = a
output_files = b
"#;
        let cfg = Config::from_ini(text).unwrap();
        match &cfg.engines.get("e").unwrap().check {
            ProcessCheck::Command { expected_code, .. } => assert_eq!(*expected_code, 1),
            other => panic!("unexpected check: {other:?}"),
        }
    }

    #[test]
    fn engine_with_unknown_placeholder_parses_but_flags_it() {
        let text = r#"
[engine.odd]
deploy_local_files = bin
spawn = {nonsense} file
check_pname = bin
input_files = a
output_files = b
"#;
        let cfg = Config::from_ini(text).unwrap();
        let odd = cfg.engines.get("odd").unwrap();
        assert_eq!(odd.unknown_spawn_placeholders(), vec!["nonsense"]);
    }

    #[test]
    fn limits_below_one_are_rejected() {
        let err = Config::from_ini("[local]\nconn_machine_limit = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}

//! RemoteMachine — one logical SSH session per node.
//!
//! All operations are async and cancellable. `exec` never errors on a
//! nonzero exit; transfers retry transient per-file failures and report
//! partial success instead of hiding it. The platform and home directory
//! are probed once per connection and cached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::ChannelMsg;
use russh_keys::key::{KeyPair, PublicKey};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use yasched_core::ProcessCheck;

use crate::error::{RemoteError, RemoteResult};
use crate::platform::{self, PathFlavor, PlatformInfo};

/// Transient transfer retries per file.
const TRANSFER_ATTEMPTS: u32 = 3;

/// Accepts any host key. Dynamically created nodes have fresh, unknown
/// keys; auth is key-based only.
struct AcceptHostKey;

#[async_trait]
impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connection parameters for one node.
#[derive(Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub username: String,
    pub keypair: Arc<KeyPair>,
    pub connect_timeout: Duration,
    /// Optional `(host, user)` jump host tunnel.
    pub jump: Option<(String, String)>,
}

/// Outcome of `exec`: exit code plus captured output. A nonzero exit is
/// data, not an error.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Per-file errors from a batch transfer. Partial success is reported,
/// never hidden.
#[derive(Debug, Clone, Default)]
pub struct TransferReport {
    /// Filename → error description for files that failed.
    pub errors: Vec<(String, String)>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One remote host, driven over a single SSH session.
pub struct RemoteMachine {
    host: String,
    username: String,
    handle: Mutex<Handle<AcceptHostKey>>,
    platform: OnceCell<PlatformInfo>,
    home: OnceCell<String>,
}

impl RemoteMachine {
    /// Open the SSH session and authenticate with the process keypair.
    pub async fn connect(opts: ConnectOptions) -> RemoteResult<Self> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: Some(Duration::from_secs(10)),
            ..Default::default()
        });

        let connect = Self::open_handle(config, &opts);
        let mut handle = tokio::time::timeout(opts.connect_timeout, connect)
            .await
            .map_err(|_| RemoteError::Connect {
                host: opts.host.clone(),
                reason: "connect timeout".to_string(),
            })??;

        let authenticated = handle
            .authenticate_publickey(&opts.username, opts.keypair.clone())
            .await
            .map_err(|e| RemoteError::Connect {
                host: opts.host.clone(),
                reason: e.to_string(),
            })?;
        if !authenticated {
            return Err(RemoteError::AuthRejected {
                user: opts.username.clone(),
                host: opts.host.clone(),
            });
        }

        debug!(host = %opts.host, user = %opts.username, "ssh session established");
        Ok(Self {
            host: opts.host,
            username: opts.username,
            handle: Mutex::new(handle),
            platform: OnceCell::new(),
            home: OnceCell::new(),
        })
    }

    async fn open_handle(
        config: Arc<client::Config>,
        opts: &ConnectOptions,
    ) -> RemoteResult<Handle<AcceptHostKey>> {
        match &opts.jump {
            None => client::connect(config, (opts.host.as_str(), 22), AcceptHostKey)
                .await
                .map_err(|e| RemoteError::Connect {
                    host: opts.host.clone(),
                    reason: e.to_string(),
                }),
            Some((jump_host, jump_user)) => {
                let mut jump =
                    client::connect(config.clone(), (jump_host.as_str(), 22), AcceptHostKey)
                        .await
                        .map_err(|e| RemoteError::Connect {
                            host: jump_host.clone(),
                            reason: e.to_string(),
                        })?;
                let authenticated = jump
                    .authenticate_publickey(jump_user, opts.keypair.clone())
                    .await?;
                if !authenticated {
                    return Err(RemoteError::AuthRejected {
                        user: jump_user.clone(),
                        host: jump_host.clone(),
                    });
                }
                let tunnel = jump
                    .channel_open_direct_tcpip(&opts.host, 22, "127.0.0.1", 0)
                    .await?;
                client::connect_stream(config, tunnel.into_stream(), AcceptHostKey)
                    .await
                    .map_err(|e| RemoteError::Connect {
                        host: opts.host.clone(),
                        reason: e.to_string(),
                    })
            }
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether the underlying session has been torn down.
    pub async fn is_closed(&self) -> bool {
        self.handle.lock().await.is_closed()
    }

    // ── Command execution ──────────────────────────────────────────

    /// Run a command and wait for it, capturing exit code and output.
    pub async fn exec(&self, command: &str) -> RemoteResult<ExecResult> {
        let mut channel = {
            let handle = self.handle.lock().await;
            handle.channel_open_session().await?
        };
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => code = Some(exit_status as i32),
                _ => {}
            }
        }
        let code = code.ok_or_else(|| RemoteError::NoExitStatus {
            command: command.to_string(),
        })?;
        Ok(ExecResult {
            code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Start a background process that survives the channel close.
    pub async fn spawn_detached(&self, command: &str, cwd: &str) -> RemoteResult<()> {
        let flavor = self.probe_platform().await?.flavor;
        let line = match flavor {
            PathFlavor::Posix => format!(
                "cd {} && nohup sh -c {} > run.log 2>&1 < /dev/null &",
                flavor.quote(cwd),
                flavor.quote(command),
            ),
            PathFlavor::Windows => format!(
                "Start-Process -WindowStyle Hidden cmd -WorkingDirectory {} \
                 -ArgumentList '/c', {}",
                flavor.quote(cwd),
                flavor.quote(command),
            ),
        };
        let result = self.exec(&line).await?;
        if !result.success() {
            warn!(host = %self.host, code = result.code, stderr = %result.stderr,
                  "detached spawn returned nonzero");
        }
        Ok(())
    }

    // ── Probes ─────────────────────────────────────────────────────

    /// The cached platform, if a probe already ran on this session.
    pub fn platform_if_probed(&self) -> Option<&PlatformInfo> {
        self.platform.get()
    }

    /// Probe and cache the platform tags and path flavor.
    pub async fn probe_platform(&self) -> RemoteResult<&PlatformInfo> {
        self.platform
            .get_or_try_init(|| async {
                let uname = self.exec("uname").await?;
                if uname.success() && uname.stdout.trim() == "Linux" {
                    let os_release = self
                        .exec("sh -c '. /etc/os-release; echo \"$ID@@@$ID_LIKE@@@$VERSION_ID\"'")
                        .await?;
                    let parts: Vec<String> = os_release
                        .stdout
                        .trim()
                        .split("@@@")
                        .map(str::to_string)
                        .collect();
                    let fields = (parts.len() == 3 && os_release.success())
                        .then(|| (parts[0].as_str(), parts[1].as_str(), parts[2].as_str()));
                    let info = PlatformInfo {
                        tags: platform::linux_tags(fields),
                        flavor: PathFlavor::Posix,
                    };
                    debug!(host = %self.host, platform = info.primary(), "platform probed");
                    return Ok(info);
                }

                // No uname: a Windows host answers PowerShell.
                let win = self.exec("[environment]::OSVersion").await?;
                if win.success() {
                    let caption = self
                        .exec("(Get-WmiObject -class Win32_OperatingSystem).Caption")
                        .await?;
                    let info = PlatformInfo {
                        tags: platform::windows_tags(caption.stdout.trim()),
                        flavor: PathFlavor::Windows,
                    };
                    debug!(host = %self.host, platform = info.primary(), "platform probed");
                    return Ok(info);
                }

                Err(RemoteError::PlatformGuess {
                    host: self.host.clone(),
                })
            })
            .await
    }

    /// Probe the core count; falls back to 1 on unparseable output.
    pub async fn probe_cpus(&self) -> RemoteResult<u32> {
        let flavor = self.probe_platform().await?.flavor;
        let cmd = match flavor {
            PathFlavor::Posix => {
                "getconf NPROCESSORS_ONLN 2> /dev/null || getconf _NPROCESSORS_ONLN"
            }
            PathFlavor::Windows => {
                "(Get-WmiObject -class Win32_ComputerSystem).NumberOfLogicalProcessors"
            }
        };
        let result = self.exec(cmd).await?;
        Ok(result.stdout.trim().parse().unwrap_or(1))
    }

    /// Resolve the remote user's home directory (cached).
    pub async fn home(&self) -> RemoteResult<&str> {
        let flavor = self.probe_platform().await?.flavor;
        self.home
            .get_or_try_init(|| async move {
                let cmd = match flavor {
                    PathFlavor::Posix => "pwd",
                    PathFlavor::Windows => "$env:USERPROFILE",
                };
                let result = self.exec(cmd).await?;
                Ok(result.stdout.trim().to_string())
            })
            .await
            .map(String::as_str)
    }

    /// Resolve a configured remote path against this node's flavor/home.
    pub async fn resolve_path(&self, configured: &str) -> RemoteResult<String> {
        let flavor = self.probe_platform().await?.flavor;
        let home = self.home().await?;
        Ok(flavor.resolve(home, configured))
    }

    // ── Liveness ───────────────────────────────────────────────────

    /// Apply an engine's liveness check.
    pub async fn process_alive(&self, check: &ProcessCheck) -> RemoteResult<bool> {
        let flavor = self.probe_platform().await?.flavor;
        match check {
            ProcessCheck::ProcessName { name } => {
                let cmd = match flavor {
                    PathFlavor::Posix => format!("pgrep -f {}", flavor.quote(name)),
                    PathFlavor::Windows => {
                        format!("Get-Process -Name {} -ErrorAction Stop", flavor.quote(name))
                    }
                };
                Ok(self.exec(&cmd).await?.success())
            }
            ProcessCheck::Command { cmd, expected_code } => {
                Ok(self.exec(cmd).await?.code == *expected_code)
            }
        }
    }

    // ── Packages ───────────────────────────────────────────────────

    /// Install OS packages with the platform's package manager.
    /// Idempotent; apt serializes behind the dpkg lock.
    pub async fn install_packages(&self, packages: &[String]) -> RemoteResult<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let info = self.probe_platform().await?;
        let line = if info.is_debian_like() {
            let sudo = if self.username == "root" { "" } else { "sudo " };
            let apt = format!("{sudo}apt-get -o DPkg::Lock::Timeout=600 -y");
            format!("{apt} update && {apt} install {}", packages.join(" "))
        } else if info.flavor == PathFlavor::Windows {
            format!("choco install -y {}", packages.join(" "))
        } else {
            warn!(host = %self.host, platform = info.primary(),
                  "no package manager support, skipping package install");
            return Ok(());
        };

        let result = self.exec(&line).await?;
        if !result.success() {
            return Err(RemoteError::Deploy {
                engine: "packages".to_string(),
                host: self.host.clone(),
                reason: format!("package install exited {}: {}", result.code, result.stderr),
            });
        }
        debug!(host = %self.host, count = packages.len(), "packages installed");
        Ok(())
    }

    // ── Filesystem & transfer ──────────────────────────────────────

    /// Create a directory (and parents) on the remote.
    pub async fn mkdirs(&self, path: &str) -> RemoteResult<()> {
        let flavor = self.probe_platform().await?.flavor;
        let cmd = match flavor {
            PathFlavor::Posix => format!("mkdir -p {}", flavor.quote(path)),
            PathFlavor::Windows => format!(
                "New-Item -ItemType Directory -Force -Path {}",
                flavor.quote(path)
            ),
        };
        let result = self.exec(&cmd).await?;
        if !result.success() {
            return Err(RemoteError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("mkdir {path} exited {}", result.code),
            )));
        }
        Ok(())
    }

    /// Whether a remote path exists.
    pub async fn exists(&self, path: &str) -> RemoteResult<bool> {
        let flavor = self.probe_platform().await?.flavor;
        let cmd = match flavor {
            PathFlavor::Posix => format!("test -e {}", flavor.quote(path)),
            PathFlavor::Windows => format!("Test-Path -PathType Any {}", flavor.quote(path)),
        };
        Ok(self.exec(&cmd).await?.success())
    }

    async fn sftp(&self) -> RemoteResult<SftpSession> {
        let channel = {
            let handle = self.handle.lock().await;
            handle.channel_open_session().await?
        };
        channel.request_subsystem(true, "sftp").await?;
        Ok(SftpSession::new(channel.into_stream()).await?)
    }

    /// Upload in-memory contents into `remote_dir` (created first).
    /// Per-file transient failures retry, then land in the report.
    pub async fn upload(
        &self,
        remote_dir: &str,
        files: &[(String, Vec<u8>)],
    ) -> RemoteResult<TransferReport> {
        let flavor = self.probe_platform().await?.flavor;
        self.mkdirs(remote_dir).await?;
        let sftp = self.sftp().await?;

        let mut report = TransferReport::default();
        for (name, content) in files {
            let path = flavor.join(remote_dir, name);
            if let Err(e) = self.put_file(&sftp, &path, content).await {
                warn!(host = %self.host, file = %name, error = %e, "upload failed");
                report.errors.push((name.clone(), e.to_string()));
            }
        }
        Ok(report)
    }

    /// Upload a local file into `remote_dir`, keeping its name.
    pub async fn upload_local_file(
        &self,
        local: &std::path::Path,
        remote_dir: &str,
    ) -> RemoteResult<()> {
        let flavor = self.probe_platform().await?.flavor;
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                RemoteError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no file name", local.display()),
                ))
            })?;
        let content = tokio::fs::read(local).await?;
        let sftp = self.sftp().await?;
        self.put_file(&sftp, &flavor.join(remote_dir, &name), &content)
            .await
    }

    async fn put_file(&self, sftp: &SftpSession, path: &str, content: &[u8]) -> RemoteResult<()> {
        let mut attempt = 0;
        loop {
            let result: RemoteResult<()> = async {
                let mut file = sftp.create(path).await?;
                file.write_all(content).await?;
                file.shutdown().await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < TRANSFER_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Download named files from `remote_dir` into the local `local_dir`.
    pub async fn download(
        &self,
        remote_dir: &str,
        local_dir: &std::path::Path,
        names: &[String],
    ) -> RemoteResult<TransferReport> {
        let flavor = self.probe_platform().await?.flavor;
        tokio::fs::create_dir_all(local_dir).await?;
        let sftp = self.sftp().await?;

        let mut report = TransferReport::default();
        for name in names {
            let remote = flavor.join(remote_dir, name);
            let local = local_dir.join(name);
            if let Err(e) = self.get_file(&sftp, &remote, &local).await {
                warn!(host = %self.host, file = %name, error = %e, "download failed");
                report.errors.push((name.clone(), e.to_string()));
            }
        }
        Ok(report)
    }

    async fn get_file(
        &self,
        sftp: &SftpSession,
        remote: &str,
        local: &std::path::Path,
    ) -> RemoteResult<()> {
        let mut attempt = 0;
        loop {
            let result: RemoteResult<()> = async {
                let mut file = sftp.open(remote).await?;
                let mut content = Vec::new();
                file.read_to_end(&mut content).await?;
                tokio::fs::write(local, content).await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < TRANSFER_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove a remote file, ignoring absence.
    pub async fn remove_file(&self, path: &str) -> RemoteResult<()> {
        let sftp = self.sftp().await?;
        match sftp.remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(host = %self.host, path, error = %e, "remove_file ignored");
                Ok(())
            }
        }
    }
}

//! Engine deployer.
//!
//! Materializes an engine's artifacts under `{engines_dir}/{name}` on a
//! node and installs its platform packages. Every step is idempotent:
//! artifacts already present are not re-uploaded, apt treats installed
//! packages as a no-op. Engines whose platform set does not cover the
//! node are skipped, never an error — a node may host a subset of
//! engines.

use std::path::Path;

use tracing::{debug, info};

use yasched_core::{DeploySource, Engine, EngineRepository};

use crate::error::{RemoteError, RemoteResult};
use crate::machine::RemoteMachine;

/// Marker file left after an archive deploy completes.
const ARCHIVE_MARKER: &str = ".deploy-ok";

/// Name the remote archive is fetched to before extraction.
const REMOTE_ARCHIVE_NAME: &str = "archive.tar.gz";

/// Deploy every matching engine onto the node. Used when provisioning a
/// fresh cloud node.
pub async fn deploy_engines(
    machine: &RemoteMachine,
    engines: &EngineRepository,
    local_engines_dir: &Path,
    remote_engines_dir: &str,
) -> RemoteResult<()> {
    let platforms = machine.probe_platform().await?.tags.clone();
    let matching = engines.filter_platforms(&platforms);
    for engine in matching.values() {
        deploy_engine(machine, engine, local_engines_dir, remote_engines_dir).await?;
    }
    Ok(())
}

/// Deploy one engine onto the node.
///
/// Skips silently when the node's platform is not covered. After a
/// successful return, `{engines_dir}/{name}` holds the artifacts and all
/// platform packages are installed.
pub async fn deploy_engine(
    machine: &RemoteMachine,
    engine: &Engine,
    local_engines_dir: &Path,
    remote_engines_dir: &str,
) -> RemoteResult<()> {
    let info = machine.probe_platform().await?;
    if !engine.supports_any(&info.tags) {
        debug!(
            engine = %engine.name,
            host = machine.host(),
            platform = info.primary(),
            "platform not supported, skipping engine"
        );
        return Ok(());
    }
    let flavor = info.flavor;

    let engines_root = machine.resolve_path(remote_engines_dir).await?;
    let engine_dir = flavor.join(&engines_root, &engine.name);
    machine.mkdirs(&engine_dir).await?;

    let fail = |reason: String| RemoteError::Deploy {
        engine: engine.name.clone(),
        host: machine.host().to_string(),
        reason,
    };

    match &engine.deploy {
        DeploySource::LocalFiles { files } => {
            for file in files {
                let name = file.to_string_lossy();
                let remote = flavor.join(&engine_dir, &name);
                if machine.exists(&remote).await? {
                    continue;
                }
                let local = local_engines_dir.join(&engine.name).join(file);
                machine
                    .upload_local_file(&local, &engine_dir)
                    .await
                    .map_err(|e| fail(format!("upload {name}: {e}")))?;
                if flavor == crate::platform::PathFlavor::Posix {
                    machine
                        .exec(&format!("chmod +x {}", flavor.quote(&remote)))
                        .await?;
                }
            }
        }
        DeploySource::LocalArchive { file } => {
            let marker = flavor.join(&engine_dir, ARCHIVE_MARKER);
            if !machine.exists(&marker).await? {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| fail("archive path has no file name".to_string()))?;
                let local = local_engines_dir.join(&engine.name).join(file);
                machine
                    .upload_local_file(&local, &engine_dir)
                    .await
                    .map_err(|e| fail(format!("upload {name}: {e}")))?;
                extract_archive(machine, &engine_dir, &name)
                    .await
                    .map_err(|e| fail(format!("extract {name}: {e}")))?;
                machine.exec(&format!("touch {}", flavor.quote(&marker))).await?;
            }
        }
        DeploySource::RemoteArchive { url } => {
            let marker = flavor.join(&engine_dir, ARCHIVE_MARKER);
            if !machine.exists(&marker).await? {
                let fetch = format!(
                    "cd {} && wget {} -O {}",
                    flavor.quote(&engine_dir),
                    flavor.quote(url),
                    REMOTE_ARCHIVE_NAME,
                );
                let result = machine.exec(&fetch).await?;
                if !result.success() {
                    return Err(fail(format!(
                        "download {url} exited {}: {}",
                        result.code, result.stderr
                    )));
                }
                extract_archive(machine, &engine_dir, REMOTE_ARCHIVE_NAME)
                    .await
                    .map_err(|e| fail(format!("extract {url}: {e}")))?;
                machine.exec(&format!("touch {}", flavor.quote(&marker))).await?;
            }
        }
    }

    machine.install_packages(&engine.platform_packages).await?;
    info!(engine = %engine.name, host = machine.host(), "engine deployed");
    Ok(())
}

/// Extract an uploaded archive in place and remove it.
async fn extract_archive(
    machine: &RemoteMachine,
    engine_dir: &str,
    archive_name: &str,
) -> RemoteResult<()> {
    let flavor = machine.probe_platform().await?.flavor;
    let cmd = format!(
        "cd {} && tar xf {}",
        flavor.quote(engine_dir),
        flavor.quote(archive_name),
    );
    let result = machine.exec(&cmd).await?;
    if !result.success() {
        return Err(RemoteError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("tar exited {}: {}", result.code, result.stderr),
        )));
    }
    machine
        .remove_file(&flavor.join(engine_dir, archive_name))
        .await
}

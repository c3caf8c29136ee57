//! `helm`: downloads and caches a pinned Helm release binary, shells out to
//! it with the step's `args`, and merges its rendered documents into the
//! document stream already flowing through the pipeline — mirroring the
//! original's behavior of piping the upstream resource stream and the Helm
//! process's own stdout into the same downstream writer.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info};

use crate::document::Document;
use crate::{Error, Result};

use super::BuiltinContext;

const DEFAULT_VERSION: &str = "3.8.1";

#[derive(Debug, Deserialize)]
struct Params {
    #[serde(default)]
    version: String,
    #[serde(default)]
    args: Vec<String>,
}

/// arch names the platform the upstream `https://get.helm.sh` release
/// archives are published under (`<os>-<arch>`), mirroring Go's
/// `runtime.GOOS + "-" + runtime.GOARCH`.
fn arch() -> &'static str {
    if cfg!(target_os = "macos") {
        if cfg!(target_arch = "aarch64") {
            "darwin-arm64"
        } else {
            "darwin-amd64"
        }
    } else if cfg!(target_arch = "aarch64") {
        "linux-arm64"
    } else {
        "linux-amd64"
    }
}

pub(super) fn invoke(ctx: &BuiltinContext, config_path: &Path, mut docs: Vec<Document>) -> Result<Vec<Document>> {
    let params: Params = super::super::config::load(config_path)?;
    let version = match params.version.as_str() {
        "" => DEFAULT_VERSION.to_owned(),
        v => v.strip_prefix('v').unwrap_or(v).to_owned(),
    };
    let arch = arch();

    // Cache key convention matches the original: `helm-v<ver>-<arch>`, so
    // repeated runs across steps/executions reuse the same cached binary.
    let helm_path = ctx.cache_dir.join(format!("helm-v{version}-{arch}"));
    if !helm_path.exists() {
        let archive_path = ctx.temp_dir.join(format!("helm-v{version}-{arch}.tar.gz"));
        if !archive_path.exists() {
            download_archive(&version, arch, &archive_path)?;
        }
        extract_helm(&archive_path, arch, &helm_path)?;
    }

    info!(version = %version, args = ?params.args, "invoking helm");
    let output = Command::new(&helm_path)
        .args(&params.args)
        .current_dir(&ctx.pwd)
        .output()
        .map_err(|e| Error::Other(anyhow::anyhow!("failed running helm at '{}': {e}", helm_path.display())))?;
    if !output.status.success() {
        return Err(Error::Other(anyhow::anyhow!(
            "helm exited with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let rendered = Document::parse_stream(&String::from_utf8_lossy(&output.stdout))
        .map_err(|e| Error::Other(anyhow::anyhow!("helm produced invalid YAML: {e}")))?;
    docs.extend(rendered);
    Ok(docs)
}

/// download_archive fetches `https://get.helm.sh/helm-v<ver>-<arch>.tar.gz`.
/// `invoke` runs synchronously inside a step worker already driven by the
/// multi-thread tokio runtime the CLI constructs, so `block_in_place` frees
/// this worker thread for the pool's other tasks while a nested `block_on`
/// drives the request to completion.
fn download_archive(version: &str, arch: &str, dest: &Path) -> Result<()> {
    let url = format!("https://get.helm.sh/helm-v{version}-{arch}.tar.gz");
    debug!(url = %url, "downloading helm archive");
    let bytes = tokio::task::block_in_place(|| {
        tokio::runtime::Handle::current().block_on(async {
            let response = reqwest::get(&url).await?.error_for_status()?;
            response.bytes().await
        })
    })?;
    std::fs::write(dest, &bytes)?;
    Ok(())
}

/// extract_helm pulls the single `<arch>/helm` entry out of the release
/// tarball and installs it (executable) at `helm_path`.
fn extract_helm(archive_path: &Path, arch: &str, helm_path: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| Error::Other(anyhow::anyhow!("failed opening '{}': {e}", archive_path.display())))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    let want = format!("{arch}/helm");

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path: PathBuf = entry.path()?.into_owned();
        if path.to_string_lossy() == want {
            let mut out = std::fs::File::create(helm_path)
                .map_err(|e| Error::Other(anyhow::anyhow!("failed creating '{}': {e}", helm_path.display())))?;
            std::io::copy(&mut entry, &mut out)?;
            set_executable(helm_path)?;
            return Ok(());
        }
    }
    Err(Error::Other(anyhow::anyhow!(
        "helm archive '{}' did not contain entry '{want}'",
        archive_path.display()
    )))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

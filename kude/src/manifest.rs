//! Manifest parsing and step normalization: `kude.yaml` → a [`Manifest`]
//! ready for the engine to execute.

use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;

use crate::filter::Filter;
use crate::{Error, Result};

const API_VERSION: &str = "kude.kfirs.com/v1alpha2";
const KIND: &str = "Pipeline";
const DEFAULT_WORKDIR: &str = "/workspace";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    #[serde(default)]
    resources: Vec<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    image: String,
    #[serde(default)]
    entrypoint: Option<Vec<String>>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    network: bool,
    #[serde(default)]
    mounts: Vec<String>,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    filter: Filter,
}

/// Mount is a parsed `LOCAL[:REMOTE]` bind-mount declaration.
#[derive(Debug, Clone)]
pub struct Mount {
    /// local is resolved against the package directory when relative.
    pub local: std::path::PathBuf,
    /// remote is resolved against the container's workdir when relative;
    /// defaults to `local` verbatim when `REMOTE` is omitted.
    pub remote: String,
}

/// Step is one normalized pipeline stage.
#[derive(Debug, Clone)]
pub struct Step {
    /// id defaults to the step's 1-based index, zero-padded to width 3.
    pub id: String,
    /// name defaults to `"<id> // <image>"`.
    pub name: String,
    /// image carries the engine's own build tag appended when the manifest
    /// omitted one.
    pub image: String,
    /// entrypoint overrides the image's own entrypoint when set.
    pub entrypoint: Option<Vec<String>>,
    /// user runs the container as this user when set.
    pub user: Option<String>,
    /// workdir defaults to `/workspace`.
    pub workdir: String,
    /// network disables the container's network namespace unless true.
    pub network: bool,
    /// mounts are bind mounts beyond the three the runner always injects.
    pub mounts: Vec<Mount>,
    /// config is the step's opaque configuration mapping.
    pub config: Value,
    /// filter restricts which documents this step's logic runs against.
    pub filter: Filter,
}

/// Manifest is a parsed, normalized `kude.yaml`.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// resources lists the input sources in declaration order.
    pub resources: Vec<String>,
    /// steps lists the normalized pipeline stages in execution order.
    pub steps: Vec<Step>,
}

impl Manifest {
    /// parse validates and normalizes a `kude.yaml` document read from
    /// `text`. `pkg_dir` resolves relative mount paths and `engine_version`
    /// supplies the default image tag.
    pub fn parse(text: &str, pkg_dir: &Path, engine_version: &str) -> Result<Manifest> {
        let raw: RawManifest = serde_yaml::from_str(text)
            .map_err(|e| Error::Manifest(format!("failed parsing kude.yaml: {e}")))?;

        if raw.api_version != API_VERSION {
            return Err(Error::Manifest(format!(
                "unsupported apiVersion: expected '{API_VERSION}', found '{}'",
                raw.api_version
            )));
        }
        if raw.kind != KIND {
            return Err(Error::Manifest(format!(
                "unsupported kind: expected '{KIND}', found '{}'",
                raw.kind
            )));
        }

        let mut steps = Vec::with_capacity(raw.steps.len());
        for (index, raw_step) in raw.steps.into_iter().enumerate() {
            steps.push(normalize_step(index, raw_step, pkg_dir, engine_version)?);
        }

        Ok(Manifest {
            resources: raw.resources,
            steps,
        })
    }
}

fn normalize_step(index: usize, raw: RawStep, pkg_dir: &Path, engine_version: &str) -> Result<Step> {
    let id = raw.id.unwrap_or_else(|| format!("{:03}", index + 1));

    if raw.image.is_empty() {
        return Err(Error::Manifest(format!(
            "step '{id}' is missing a required 'image'"
        )));
    }
    let image = if raw.image.contains(':') {
        raw.image
    } else {
        format!("{}:{engine_version}", raw.image)
    };

    let name = raw.name.unwrap_or_else(|| format!("{id} // {image}"));
    let workdir = raw.workdir.unwrap_or_else(|| DEFAULT_WORKDIR.to_owned());

    let mut mounts = Vec::with_capacity(raw.mounts.len());
    for spec in &raw.mounts {
        mounts.push(parse_mount(spec, pkg_dir, &id)?);
    }

    Ok(Step {
        id,
        name,
        image,
        entrypoint: raw.entrypoint,
        user: raw.user,
        workdir,
        network: raw.network,
        mounts,
        config: raw.config,
        filter: raw.filter,
    })
}

fn parse_mount(spec: &str, pkg_dir: &Path, step_id: &str) -> Result<Mount> {
    let (local, remote) = match spec.split_once(':') {
        Some((local, remote)) => (local, remote),
        None => (spec, spec),
    };
    if local.is_empty() {
        return Err(Error::Manifest(format!(
            "step '{step_id}' has a mount with an empty local path: '{spec}'"
        )));
    }

    let local_path = Path::new(local);
    let local_path = if local_path.is_absolute() {
        local_path.to_path_buf()
    } else {
        pkg_dir.join(local_path)
    };
    if !local_path.exists() {
        return Err(Error::Manifest(format!(
            "step '{step_id}' mount local path does not exist: '{}'",
            local_path.display()
        )));
    }

    let remote = if Path::new(remote).is_absolute() {
        remote.to_owned()
    } else {
        format!("{DEFAULT_WORKDIR}/{remote}")
    };

    Ok(Mount {
        local: local_path,
        remote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_kind() {
        let text = "apiVersion: kude.kfirs.com/v1alpha2\nkind: Package\nresources: []\n";
        let err = Manifest::parse(text, Path::new("/tmp"), "0.1.0").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Pipeline"));
        assert!(msg.contains("Package"));
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let text = "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: []\nbogus: true\n";
        assert!(Manifest::parse(text, Path::new("/tmp"), "0.1.0").is_err());
    }

    #[test]
    fn defaults_step_id_name_and_tag() {
        let text = "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: []\nsteps:\n  - image: ghcr.io/arikkfir/kude/functions/annotate\n";
        let m = Manifest::parse(text, Path::new("/tmp"), "1.2.3").unwrap();
        let step = &m.steps[0];
        assert_eq!(step.id, "001");
        assert_eq!(step.image, "ghcr.io/arikkfir/kude/functions/annotate:1.2.3");
        assert_eq!(step.name, "001 // ghcr.io/arikkfir/kude/functions/annotate:1.2.3");
        assert_eq!(step.workdir, "/workspace");
        assert!(!step.network);
    }

    #[test]
    fn rejects_step_without_image() {
        let text = "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: []\nsteps:\n  - id: a\n";
        assert!(Manifest::parse(text, Path::new("/tmp"), "0.1.0").is_err());
    }

    #[test]
    fn rejects_mount_with_missing_local_path() {
        let text = "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: []\nsteps:\n  - image: foo\n    mounts: [\"/no/such/path\"]\n";
        assert!(Manifest::parse(text, Path::new("/tmp"), "0.1.0").is_err());
    }
}

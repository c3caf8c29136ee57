//! The static built-in catalog: in-process implementations reachable by
//! the same image identifier a container step would use.

mod annotate;
mod create_configmap;
mod create_namespace;
mod create_secret;
mod helm;
mod label;
mod set_namespace;
mod yq;

use std::path::Path;

use crate::document::Document;
use crate::Result;

/// BuiltinContext carries the collaborators a built-in needs: a logger (via
/// `tracing`, ambient), the package directory, and the engine's cache/temp
/// directories.
#[derive(Debug, Clone)]
pub struct BuiltinContext {
    /// pwd is the package directory the step runs relative to.
    pub pwd: std::path::PathBuf,
    /// cache_dir is `<pkg>/.kude/cache`.
    pub cache_dir: std::path::PathBuf,
    /// temp_dir is `<pkg>/.kude/temp`.
    pub temp_dir: std::path::PathBuf,
}

/// BuiltinFn is the in-process shape every built-in implements: given the
/// context, the path to its already-written, env-overlaid config file, and
/// the input document stream, produce the output document stream.
pub type BuiltinFn = fn(&BuiltinContext, &Path, Vec<Document>) -> Result<Vec<Document>>;

const PREFIX: &str = "ghcr.io/arikkfir/kude/functions/";

/// dispatch maps an image's repository portion (the text before the first
/// `:`) to an in-process implementation, or `None` if the image names a
/// real container step.
pub fn dispatch(repository: &str) -> Option<BuiltinFn> {
    let identifier = repository.strip_prefix(PREFIX)?;
    match identifier {
        "annotate" => Some(annotate::invoke),
        "label" => Some(label::invoke),
        "create-namespace" => Some(create_namespace::invoke),
        "create-configmap" => Some(create_configmap::invoke),
        "create-secret" => Some(create_secret::invoke),
        "set-namespace" => Some(set_namespace::invoke),
        "yq" => Some(yq::invoke),
        "helm" => Some(helm::invoke),
        _ => None,
    }
}

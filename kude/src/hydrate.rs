//! The resource hydrator (C4): expands one source string into a stream of
//! documents, recursing into nested packages and following the local/HTTP
//! fetch contract.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::document::Document;
use crate::{Error, Result};

const MAX_RECURSION_DEPTH: u32 = 32;
const MANIFEST_FILE: &str = "kude.yaml";

/// NestedRunner re-enters the engine for a nested package's `kude.yaml`. A
/// boxed trait object rather than a generic callback, since the engine
/// re-enters this module recursively and a generic signature here would
/// make that recursion's type infinite.
pub type NestedRunner =
    Arc<dyn Fn(PathBuf) -> Pin<Box<dyn Future<Output = Result<Vec<Document>>> + Send>> + Send + Sync>;

/// hydrate_source expands `source` (a local path or `http(s)://` URL)
/// relative to `pwd`, sending every document it yields onto `tx`. Nested
/// packages are re-entered through `run_nested`, a callback into the engine
/// so this module stays free of a direct dependency on [`crate::engine`].
pub async fn hydrate_source(
    source: &str,
    pwd: &Path,
    tx: mpsc::Sender<Document>,
    run_nested: NestedRunner,
) -> Result<()> {
    let local_path = fetch(source, pwd).await?;
    hydrate_path(&local_path, pwd, &tx, run_nested, 0).await
}

/// fetch resolves a source string to a local filesystem path: a bare path
/// is resolved relative to `pwd`; `http(s)://` URLs are downloaded to a
/// temporary file; any other scheme is rejected.
async fn fetch(source: &str, pwd: &Path) -> Result<PathBuf> {
    if let Some(rest) = source.strip_prefix("http://").or_else(|| source.strip_prefix("https://")) {
        let _ = rest;
        return fetch_http(source).await;
    }
    if let Some((scheme, _)) = source.split_once("://") {
        return Err(Error::Hydration {
            source: source.to_owned(),
            message: format!("unsupported scheme '{scheme}'"),
        });
    }

    let path = Path::new(source);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        pwd.join(path)
    };
    if !path.exists() {
        return Err(Error::Hydration {
            source: source.to_owned(),
            message: format!("path does not exist: '{}'", path.display()),
        });
    }
    Ok(path)
}

async fn fetch_http(url: &str) -> Result<PathBuf> {
    let response = reqwest::get(url).await.map_err(|e| Error::Hydration {
        source: url.to_owned(),
        message: e.to_string(),
    })?;
    let response = response.error_for_status().map_err(|e| Error::Hydration {
        source: url.to_owned(),
        message: e.to_string(),
    })?;
    let bytes = response.bytes().await.map_err(|e| Error::Hydration {
        source: url.to_owned(),
        message: e.to_string(),
    })?;

    let mut dest = std::env::temp_dir();
    dest.push(format!("kude-fetch-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&dest, &bytes).await?;
    Ok(dest)
}

fn hydrate_path<'a>(
    path: &'a Path,
    pwd: &'a Path,
    tx: &'a mpsc::Sender<Document>,
    run_nested: NestedRunner,
    depth: u32,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_RECURSION_DEPTH {
            return Err(Error::Hydration {
                source: path.display().to_string(),
                message: format!("exceeded maximum nested-package depth of {MAX_RECURSION_DEPTH}"),
            });
        }

        let metadata = tokio::fs::metadata(path).await.map_err(|e| Error::Hydration {
            source: path.display().to_string(),
            message: e.to_string(),
        })?;

        if metadata.is_dir() {
            hydrate_directory(path, pwd, tx, run_nested, depth).await
        } else {
            hydrate_file(path, tx).await
        }
    })
}

async fn hydrate_file(path: &Path, tx: &mpsc::Sender<Document>) -> Result<()> {
    let text = tokio::fs::read_to_string(path).await?;
    let docs = Document::parse_stream(&text).map_err(|e| Error::Hydration {
        source: path.display().to_string(),
        message: e.to_string(),
    })?;
    for doc in docs {
        if tx.send(doc).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

async fn hydrate_directory(
    dir: &Path,
    pwd: &Path,
    tx: &mpsc::Sender<Document>,
    run_nested: NestedRunner,
    depth: u32,
) -> Result<()> {
    let manifest_path = dir.join(MANIFEST_FILE);
    match tokio::fs::metadata(&manifest_path).await {
        Ok(meta) if meta.is_dir() => {
            return Err(Error::Hydration {
                source: manifest_path.display().to_string(),
                message: "expected 'kude.yaml' to be a file, not a directory".to_owned(),
            });
        }
        Ok(_) => {
            debug!(path = %dir.display(), "entering nested package");
            let docs = run_nested(dir.to_path_buf()).await?;
            for doc in docs {
                if tx.send(doc).await.is_err() {
                    return Ok(());
                }
            }
            return Ok(());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::Hydration {
                source: manifest_path.display().to_string(),
                message: e.to_string(),
            })
        }
    }

    let mut entries = walkdir::WalkDir::new(dir)
        .follow_links(true)
        .min_depth(1)
        .max_depth(1)
        .into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry.map_err(|e| Error::Hydration {
            source: dir.display().to_string(),
            message: e.to_string(),
        })?;
        let path = entry.path();
        if entry.file_type().is_dir() {
            Box::pin(hydrate_directory(path, pwd, tx, run_nested.clone(), depth + 1)).await?;
        } else {
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_yaml {
                hydrate_file(path, tx).await?;
            } else {
                debug!(path = %path.display(), "skipping non-YAML file");
            }
        }
    }
    Ok(())
}

/// warn_if_depth_suspicious is a lightweight guard the engine can call
/// before kicking off hydration of user-supplied nested packages; a depth
/// this close to the cap is almost always a cyclic-import mistake.
pub fn warn_if_depth_suspicious(depth: u32) {
    if depth + 4 >= MAX_RECURSION_DEPTH {
        warn!(depth, cap = MAX_RECURSION_DEPTH, "nested package depth approaching the recursion cap");
    }
}

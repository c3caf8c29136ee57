//! `yq`: applies a small subset of `yq`-style expressions — `PATH = VALUE`
//! to set a scalar, or a bare `PATH` to log its current value — to every
//! document flowing through the step.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::document::Document;
use crate::{Error, Result};

use super::BuiltinContext;

#[derive(Debug, Deserialize)]
struct Params {
    expression: String,
}

pub(super) fn invoke(_ctx: &BuiltinContext, config_path: &Path, docs: Vec<Document>) -> Result<Vec<Document>> {
    let params: Params = super::super::config::load(config_path)?;
    let expression = params.expression.trim();
    if expression.is_empty() {
        return Err(Error::Other(anyhow::anyhow!(
            "the 'expression' property is required for the yq built-in"
        )));
    }

    match expression.split_once('=') {
        Some((path, value)) => {
            let path = path.trim().trim_start_matches('.');
            let value = unquote(value.trim());
            docs.into_iter()
                .map(|mut doc| {
                    doc.set_scalar(path, &value)?;
                    Ok(doc)
                })
                .collect()
        }
        None => {
            let path = expression.trim_start_matches('.');
            for doc in &docs {
                info!(
                    kind = %doc.kind(),
                    name = %doc.name(),
                    value = ?doc.get_scalar(path),
                    "yq read"
                );
            }
            Ok(docs)
        }
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(value)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::config::write_config_file;

    #[test]
    fn sets_scalar_at_path() {
        let dir = tempfile::tempdir().unwrap();
        let config: serde_yaml::Value =
            serde_yaml::from_str("expression: '.metadata.labels.team = \"platform\"'\n").unwrap();
        let config_path = write_config_file(dir.path(), "001", &config).unwrap();
        let ctx = BuiltinContext {
            pwd: dir.path().to_path_buf(),
            cache_dir: dir.path().to_path_buf(),
            temp_dir: dir.path().to_path_buf(),
        };
        let doc = Document::new(serde_yaml::from_str("apiVersion: v1\nkind: Pod\nmetadata:\n  labels: {}\n").unwrap());
        let out = invoke(&ctx, &config_path, vec![doc]).unwrap();
        assert_eq!(out[0].get_scalar("metadata.labels.team").as_deref(), Some("platform"));
    }

    #[test]
    fn bare_expression_leaves_documents_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config: serde_yaml::Value = serde_yaml::from_str("expression: .metadata.name\n").unwrap();
        let config_path = write_config_file(dir.path(), "001", &config).unwrap();
        let ctx = BuiltinContext {
            pwd: dir.path().to_path_buf(),
            cache_dir: dir.path().to_path_buf(),
            temp_dir: dir.path().to_path_buf(),
        };
        let doc = Document::new(serde_yaml::from_str("apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n").unwrap());
        let out = invoke(&ctx, &config_path, vec![doc]).unwrap();
        assert_eq!(out[0].name(), "p");
    }
}

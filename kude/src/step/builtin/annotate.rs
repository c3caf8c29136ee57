//! `annotate`: sets one annotation across every document selected by an
//! optional filter.

use std::path::Path;

use serde::Deserialize;

use crate::document::Document;
use crate::filter::Filter;
use crate::{Error, Result};

use super::BuiltinContext;

#[derive(Debug, Deserialize)]
struct Params {
    name: String,
    #[serde(default)]
    value: String,
    /// path, if set, reads the annotation value from a file relative to the
    /// package directory instead of `value`.
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    filter: Filter,
}

pub(super) fn invoke(ctx: &BuiltinContext, config_path: &Path, docs: Vec<Document>) -> Result<Vec<Document>> {
    let params: Params = super::super::config::load(config_path)?;
    if params.name.is_empty() {
        return Err(Error::Other(anyhow::anyhow!(
            "the 'name' property is required for the annotate built-in"
        )));
    }

    let value = match &params.path {
        Some(rel) => {
            let path = ctx.pwd.join(rel);
            std::fs::read_to_string(&path).map_err(|e| {
                Error::Other(anyhow::anyhow!("failed reading '{}': {e}", path.display()))
            })?
        }
        None => params.value.clone(),
    };

    docs.into_iter()
        .map(|mut doc| {
            if params.filter.selects(&doc)? {
                doc.set_annotation(&params.name, &value);
            }
            Ok(doc)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::config::write_config_file;

    #[test]
    fn sets_annotation_on_selected_documents() {
        let dir = tempfile::tempdir().unwrap();
        let config: serde_yaml::Value = serde_yaml::from_str("name: foo\nvalue: bar\n").unwrap();
        let config_path = write_config_file(dir.path(), "001", &config).unwrap();

        let ctx = BuiltinContext {
            pwd: dir.path().to_path_buf(),
            cache_dir: dir.path().to_path_buf(),
            temp_dir: dir.path().to_path_buf(),
        };
        let doc = Document::new(
            serde_yaml::from_str("apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: sa\n").unwrap(),
        );
        let out = invoke(&ctx, &config_path, vec![doc]).unwrap();
        assert_eq!(out[0].annotation("foo").as_deref(), Some("bar"));
    }
}

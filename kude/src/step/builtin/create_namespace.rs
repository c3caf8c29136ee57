//! `create-namespace`: emits a `Namespace` document, appended to the
//! documents already flowing through the pipeline.

use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;

use crate::document::Document;
use crate::{Error, Result};

use super::BuiltinContext;

#[derive(Debug, Deserialize)]
struct Params {
    name: String,
}

pub(super) fn invoke(_ctx: &BuiltinContext, config_path: &Path, mut docs: Vec<Document>) -> Result<Vec<Document>> {
    let params: Params = super::super::config::load(config_path)?;
    if params.name.is_empty() {
        return Err(Error::Other(anyhow::anyhow!(
            "the 'name' property is required for the create-namespace built-in"
        )));
    }

    let yaml = format!("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {}\n", params.name);
    let value: Value = serde_yaml::from_str(&yaml)?;
    docs.push(Document::new(value));
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::config::write_config_file;

    #[test]
    fn emits_a_namespace_document() {
        let dir = tempfile::tempdir().unwrap();
        let config: Value = serde_yaml::from_str("name: team-a\n").unwrap();
        let config_path = write_config_file(dir.path(), "001", &config).unwrap();
        let ctx = BuiltinContext {
            pwd: dir.path().to_path_buf(),
            cache_dir: dir.path().to_path_buf(),
            temp_dir: dir.path().to_path_buf(),
        };
        let out = invoke(&ctx, &config_path, Vec::new()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), "Namespace");
        assert_eq!(out[0].name(), "team-a");
    }
}

//! `set-namespace`: rewrites `metadata.namespace` across every document
//! selected by the step's filter, unconditionally of kind.

use std::path::Path;

use serde::Deserialize;

use crate::document::Document;
use crate::filter::Filter;
use crate::{Error, Result};

use super::BuiltinContext;

#[derive(Debug, Deserialize)]
struct Params {
    namespace: String,
    #[serde(default)]
    filter: Filter,
}

pub(super) fn invoke(_ctx: &BuiltinContext, config_path: &Path, docs: Vec<Document>) -> Result<Vec<Document>> {
    let params: Params = super::super::config::load(config_path)?;
    if params.namespace.is_empty() {
        return Err(Error::Other(anyhow::anyhow!(
            "the 'namespace' property is required for the set-namespace built-in"
        )));
    }

    docs.into_iter()
        .map(|mut doc| {
            if params.filter.selects(&doc)? {
                doc.set_namespace(&params.namespace);
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
    fn rewrites_namespace_on_selected_documents() {
        let dir = tempfile::tempdir().unwrap();
        let config: serde_yaml::Value = serde_yaml::from_str("namespace: prod\n").unwrap();
        let config_path = write_config_file(dir.path(), "001", &config).unwrap();
        let ctx = BuiltinContext {
            pwd: dir.path().to_path_buf(),
            cache_dir: dir.path().to_path_buf(),
            temp_dir: dir.path().to_path_buf(),
        };
        let doc = Document::new(serde_yaml::from_str("apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: sa\n  namespace: old\n").unwrap());
        let out = invoke(&ctx, &config_path, vec![doc]).unwrap();
        assert_eq!(out[0].namespace(), "prod");
    }

    #[test]
    fn rewrites_namespace_regardless_of_kind() {
        let dir = tempfile::tempdir().unwrap();
        let config: serde_yaml::Value = serde_yaml::from_str("namespace: prod\n").unwrap();
        let config_path = write_config_file(dir.path(), "001", &config).unwrap();
        let ctx = BuiltinContext {
            pwd: dir.path().to_path_buf(),
            cache_dir: dir.path().to_path_buf(),
            temp_dir: dir.path().to_path_buf(),
        };
        let doc = Document::new(serde_yaml::from_str("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: foo\n").unwrap());
        let out = invoke(&ctx, &config_path, vec![doc]).unwrap();
        assert_eq!(out[0].namespace(), "prod");
    }

    #[test]
    fn excluded_documents_are_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config: serde_yaml::Value =
            serde_yaml::from_str("namespace: prod\nfilter:\n  excludes:\n    - kind: Namespace\n").unwrap();
        let config_path = write_config_file(dir.path(), "001", &config).unwrap();
        let ctx = BuiltinContext {
            pwd: dir.path().to_path_buf(),
            cache_dir: dir.path().to_path_buf(),
            temp_dir: dir.path().to_path_buf(),
        };
        let doc = Document::new(serde_yaml::from_str("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: foo\n").unwrap());
        let out = invoke(&ctx, &config_path, vec![doc]).unwrap();
        assert_eq!(out[0].namespace(), "");
    }
}

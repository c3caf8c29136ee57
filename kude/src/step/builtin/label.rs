//! `label`: same shape as `annotate`, for `metadata.labels`.

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
    /// path, if set, reads the label value from a file relative to the
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
            "the 'name' property is required for the label built-in"
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
                doc.set_label(&params.name, &value);
            }
            Ok(doc)
        })
        .collect()
}

//! `create-secret`: same shape as `create-configmap`, emitting a `Secret`
//! with base64-encoded data, as the Kubernetes API requires.

use std::path::Path;

use base64::Engine;
use serde::Deserialize;
use serde_yaml::Value;
use sha2::{Digest, Sha256};

use crate::document::Document;
use crate::{Error, Result, PREVIOUS_NAME_ANNOTATION};

use super::BuiltinContext;

#[derive(Debug, Deserialize)]
struct Entry {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Params {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(rename = "type", default = "default_secret_type")]
    secret_type: String,
    #[serde(default)]
    immutable: Option<bool>,
    #[serde(default)]
    contents: Vec<Entry>,
}

fn default_secret_type() -> String {
    "Opaque".to_owned()
}

fn build_data(ctx: &BuiltinContext, contents: &[Entry]) -> Result<(Vec<(String, String)>, Vec<u8>)> {
    let mut data = Vec::with_capacity(contents.len());
    let mut hash_input = Vec::new();
    for (i, entry) in contents.iter().enumerate() {
        if entry.key.is_empty() {
            return Err(Error::Other(anyhow::anyhow!(
                "key is required for all entries (missing for entry {i})"
            )));
        }
        let has_value = !entry.value.is_empty();
        let has_path = entry.path.as_ref().is_some_and(|p| !p.is_empty());
        if !has_value && !has_path {
            return Err(Error::Other(anyhow::anyhow!(
                "value or path is required for all entries (missing for entry {i})"
            )));
        }
        if has_value && has_path {
            return Err(Error::Other(anyhow::anyhow!(
                "value and path cannot be used together in a single entry (encountered for entry {i})"
            )));
        }
        let raw = if has_value {
            entry.value.clone()
        } else {
            let rel = entry.path.as_ref().unwrap();
            let path = Path::new(rel);
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                ctx.pwd.join(path)
            };
            std::fs::read_to_string(&path)
                .map_err(|e| Error::Other(anyhow::anyhow!("error reading file '{}': {e}", path.display())))?
        };
        hash_input.extend_from_slice(raw.as_bytes());
        let encoded = base64::engine::general_purpose::STANDARD.encode(raw.as_bytes());
        data.push((entry.key.clone(), encoded));
    }
    Ok((data, hash_input))
}

pub(super) fn invoke(ctx: &BuiltinContext, config_path: &Path, mut docs: Vec<Document>) -> Result<Vec<Document>> {
    let params: Params = super::super::config::load(config_path)?;
    if params.name.is_empty() {
        return Err(Error::Other(anyhow::anyhow!(
            "name is required for creating secrets"
        )));
    }

    let (data, hash_input) = build_data(ctx, &params.contents)?;
    let mut hasher = Sha256::new();
    hasher.update(&hash_input);
    let hashed_name = format!("{}-{}", params.name, hex::encode(hasher.finalize())[..8].to_owned());

    let mut mapping = serde_yaml::Mapping::new();
    for (k, v) in data {
        mapping.insert(Value::String(k), Value::String(v));
    }

    let mut doc = serde_yaml::Mapping::new();
    doc.insert(Value::String("apiVersion".into()), Value::String("v1".into()));
    doc.insert(Value::String("kind".into()), Value::String("Secret".into()));
    let mut metadata = serde_yaml::Mapping::new();
    metadata.insert(Value::String("name".into()), Value::String(hashed_name));
    if !params.namespace.is_empty() {
        metadata.insert(Value::String("namespace".into()), Value::String(params.namespace.clone()));
    }
    let mut annotations = serde_yaml::Mapping::new();
    annotations.insert(
        Value::String(PREVIOUS_NAME_ANNOTATION.into()),
        Value::String(params.name.clone()),
    );
    metadata.insert(Value::String("annotations".into()), Value::Mapping(annotations));
    doc.insert(Value::String("metadata".into()), Value::Mapping(metadata));
    doc.insert(Value::String("type".into()), Value::String(params.secret_type));
    doc.insert(Value::String("data".into()), Value::Mapping(mapping));
    if let Some(immutable) = params.immutable {
        doc.insert(Value::String("immutable".into()), Value::Bool(immutable));
    }

    docs.push(Document::new(Value::Mapping(doc)));
    Ok(docs)
}

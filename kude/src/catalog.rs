//! The reference catalog (C2): a static, embedded table describing where
//! one Kubernetes resource kind refers to another by name, so the resolver
//! can rewrite those references after a content-addressed rename.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::Deserialize;

use crate::document::Document;

/// Gvk identifies a resource kind by group, version and kind string. The
/// empty group is the core API group (`v1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gvk {
    /// group is empty for the core API group.
    pub group: String,
    /// version is the resource's apiVersion trailing component.
    pub version: String,
    /// kind is the resource kind string.
    pub kind: String,
}

impl Gvk {
    fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    fn from_document(doc: &Document) -> Self {
        let api_version = doc.api_version();
        let (group, version) = match api_version.rsplit_once('/') {
            Some((group, version)) => (group.to_owned(), version.to_owned()),
            None => (String::new(), api_version),
        };
        Gvk {
            group,
            version,
            kind: doc.kind(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFieldType {
    #[serde(default)]
    group: String,
    version: String,
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RawField {
    #[serde(rename = "namePath")]
    name_path: String,
}

#[derive(Debug, Deserialize)]
struct RawReferencePoint {
    #[serde(default)]
    group: String,
    version: String,
    kind: String,
    field: RawField,
    #[serde(rename = "type")]
    ty: RawFieldType,
}

/// ReferencePoint is one compiled catalog entry: a path within a referrer
/// kind, and the (group, version, kind) of the referent it names.
#[derive(Debug, Clone)]
pub struct ReferencePoint {
    /// name_path is the dotted path expression within the referrer document
    /// at which the referent's name is recorded.
    pub name_path: String,
    dst_api_version: String,
    dst_kind: String,
}

impl ReferencePoint {
    /// resolve rewrites every scalar matched by `name_path` in `doc` if the
    /// rename map has an entry keyed by this point's referent type, the
    /// document's own namespace, and the matched value.
    pub fn resolve(
        &self,
        doc: &mut Document,
        rename_map: &HashMap<String, String>,
    ) -> crate::Result<()> {
        let namespace = doc.namespace();
        let matches = doc.find_scalars_mut(&self.name_path);
        for node in matches {
            let Some(current) = node.as_str().map(str::to_owned) else {
                continue;
            };
            let key = format!(
                "{}/{}/{}/{}",
                self.dst_api_version, self.dst_kind, namespace, current
            );
            if let Some(new_name) = rename_map.get(&key) {
                *node = serde_yaml::Value::String(new_name.clone());
            }
        }
        Ok(())
    }
}

const RAW_CATALOG: &str = include_str!("reference_types.yaml");

static CATALOG: LazyLock<HashMap<Gvk, Vec<ReferencePoint>>> = LazyLock::new(|| {
    let raw: Vec<RawReferencePoint> =
        serde_yaml::from_str(RAW_CATALOG).expect("embedded reference catalog is malformed");
    let mut out: HashMap<Gvk, Vec<ReferencePoint>> = HashMap::new();
    for entry in raw {
        let gvk = Gvk {
            group: entry.group,
            version: entry.version,
            kind: entry.kind,
        };
        let dst_api_version = if entry.ty.group.is_empty() {
            entry.ty.version.clone()
        } else {
            format!("{}/{}", entry.ty.group, entry.ty.version)
        };
        out.entry(gvk).or_default().push(ReferencePoint {
            name_path: entry.field.name_path,
            dst_api_version,
            dst_kind: entry.ty.kind,
        });
    }
    out
});

/// Catalog is a handle onto the process-global, load-once reference table.
#[derive(Debug, Default, Clone, Copy)]
pub struct Catalog;

impl Catalog {
    /// points_for returns the reference points declared for a document's own
    /// (group, version, kind), if any.
    pub fn points_for(&self, doc: &Document) -> &'static [ReferencePoint] {
        let gvk = Gvk::from_document(doc);
        CATALOG.get(&gvk).map(Vec::as_slice).unwrap_or(&[])
    }

    /// resolve applies every reference point declared for `doc`'s kind
    /// against the rename map, rewriting matched scalars in place.
    pub fn resolve(&self, doc: &mut Document, rename_map: &HashMap<String, String>) -> crate::Result<()> {
        let gvk = Gvk::from_document(doc);
        let Some(points) = CATALOG.get(&gvk) else {
            return Ok(());
        };
        for point in points.clone() {
            point.resolve(doc, rename_map)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_loads_without_panicking() {
        let _ = &*CATALOG;
    }

    #[test]
    fn deployment_configmap_reference_is_catalogued() {
        let doc = Document::new(serde_yaml::from_str("apiVersion: apps/v1\nkind: Deployment\n").unwrap());
        let points = Catalog.points_for(&doc);
        assert!(points.iter().any(|p| p.dst_kind == "ConfigMap"));
    }

    #[test]
    fn resolve_rewrites_matching_reference() {
        let mut doc = Document::new(
            serde_yaml::from_str(
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  namespace: ns\nspec:\n  template:\n    spec:\n      containers:\n        - envFrom:\n            - configMapRef:\n                name: cfg\n",
            )
            .unwrap(),
        );
        let mut rename_map = HashMap::new();
        rename_map.insert("v1/ConfigMap/ns/cfg".to_owned(), "cfg-deadbeef".to_owned());
        Catalog.resolve(&mut doc, &rename_map).unwrap();
        assert_eq!(
            doc.get_scalar("spec.template.spec.containers[0].envFrom[0].configMapRef.name")
                .as_deref(),
            Some("cfg-deadbeef")
        );
    }
}

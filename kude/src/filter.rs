//! The document filter: `includes`/`excludes` resource selection, consulted
//! by every built-in before acting on a document — one entry per field,
//! unset fields acting as wildcards.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::document::Document;

/// FilterEntry is one `includes`/`excludes` list entry: every field that is
/// set must match for the entry to match a document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterEntry {
    /// apiVersion, if set, must equal the document's apiVersion.
    #[serde(default)]
    pub api_version: Option<String>,
    /// kind, if set, must equal the document's kind.
    #[serde(default)]
    pub kind: Option<String>,
    /// namespace, if set, must equal the document's namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// name, if set, must equal the document's name.
    #[serde(default)]
    pub name: Option<String>,
    /// label_selector, if set, is evaluated against `metadata.labels` using
    /// Kubernetes label-selector syntax.
    #[serde(default)]
    pub label_selector: Option<String>,
}

impl FilterEntry {
    fn matches(&self, doc: &Document) -> crate::Result<bool> {
        if let Some(want) = &self.api_version {
            if want != &doc.api_version() {
                return Ok(false);
            }
        }
        if let Some(want) = &self.kind {
            if want != &doc.kind() {
                return Ok(false);
            }
        }
        if let Some(want) = &self.namespace {
            if want != &doc.namespace() {
                return Ok(false);
            }
        }
        if let Some(want) = &self.name {
            if want != &doc.name() {
                return Ok(false);
            }
        }
        if let Some(selector) = &self.label_selector {
            if !matches_label_selector(&doc.labels(), selector)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Filter is a step-scoped selector: a document is selected when
/// `(includes is empty OR any includes entry matches) AND NOT (any excludes
/// entry matches)`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Filter {
    /// includes, when non-empty, restricts selection to documents matching
    /// at least one entry.
    #[serde(default)]
    pub includes: Vec<FilterEntry>,
    /// excludes always vetoes a match, regardless of includes.
    #[serde(default)]
    pub excludes: Vec<FilterEntry>,
}

impl Filter {
    /// selects reports whether `doc` passes this filter.
    pub fn selects(&self, doc: &Document) -> crate::Result<bool> {
        let mut included = self.includes.is_empty();
        for entry in &self.includes {
            if entry.matches(doc)? {
                included = true;
            }
        }
        if !included {
            return Ok(false);
        }
        for entry in &self.excludes {
            if entry.matches(doc)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// matches_label_selector evaluates a Kubernetes-style label selector
/// (`k=v`, `k!=v`, `k`, `!k`, comma-separated conjunction — the
/// equality/existence subset; `in (...)`/`notin (...)` set-based
/// expressions are not implemented) against a document's labels.
fn matches_label_selector(labels: &BTreeMap<String, String>, selector: &str) -> crate::Result<bool> {
    for clause in selector.split(',') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        let matched = if let Some(key) = clause.strip_prefix('!') {
            !labels.contains_key(key.trim())
        } else if let Some((key, value)) = clause.split_once("!=") {
            labels.get(key.trim()).map(String::as_str) != Some(value.trim())
        } else if let Some((key, value)) = clause.split_once('=') {
            labels.get(key.trim()).map(String::as_str) == Some(value.trim())
        } else {
            labels.contains_key(clause)
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(yaml: &str) -> Document {
        Document::new(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn empty_filter_selects_everything() {
        let f = Filter::default();
        let d = doc("apiVersion: v1\nkind: Pod\n");
        assert!(f.selects(&d).unwrap());
    }

    #[test]
    fn includes_restricts_to_matching_kind() {
        let f = Filter {
            includes: vec![FilterEntry {
                kind: Some("Pod".into()),
                ..Default::default()
            }],
            excludes: vec![],
        };
        assert!(f.selects(&doc("apiVersion: v1\nkind: Pod\n")).unwrap());
        assert!(!f.selects(&doc("apiVersion: v1\nkind: Service\n")).unwrap());
    }

    #[test]
    fn excludes_vetoes_an_include_match() {
        let f = Filter {
            includes: vec![FilterEntry {
                kind: Some("Pod".into()),
                ..Default::default()
            }],
            excludes: vec![FilterEntry {
                name: Some("skip-me".into()),
                ..Default::default()
            }],
        };
        let ambiguous = doc("apiVersion: v1\nkind: Pod\nmetadata:\n  name: skip-me\n");
        assert!(!f.selects(&ambiguous).unwrap());
        let included = doc("apiVersion: v1\nkind: Pod\nmetadata:\n  name: keep-me\n");
        assert!(f.selects(&included).unwrap());
    }

    #[test]
    fn label_selector_equality_and_existence() {
        let labelled = doc("apiVersion: v1\nkind: Pod\nmetadata:\n  labels:\n    app: web\n    tier: frontend\n");
        assert!(matches_label_selector(&labelled.labels(), "app=web").unwrap());
        assert!(!matches_label_selector(&labelled.labels(), "app=api").unwrap());
        assert!(matches_label_selector(&labelled.labels(), "tier").unwrap());
        assert!(matches_label_selector(&labelled.labels(), "app=web,tier=frontend").unwrap());
        assert!(!matches_label_selector(&labelled.labels(), "app!=web").unwrap());
        assert!(!matches_label_selector(&labelled.labels(), "!app").unwrap());
    }
}

//! The [`Document`] type: a single YAML document flowing through the
//! pipeline, with the handful of accessors the engine needs without
//! committing callers to a particular Kubernetes object model.

use serde_yaml::Value;

use crate::PREVIOUS_NAME_ANNOTATION;

/// Document wraps one YAML document (a `serde_yaml::Value`, almost always a
/// mapping) and exposes path-based scalar access plus the distinguished
/// `apiVersion`/`kind`/`metadata.*` accessors every phase of the engine
/// needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    value: Value,
}

impl Document {
    /// Wraps an already-parsed YAML value.
    pub fn new(value: Value) -> Self {
        Document { value }
    }

    /// Parses every document in a multi-document YAML stream.
    pub fn parse_stream(input: &str) -> crate::Result<Vec<Document>> {
        let mut docs = Vec::new();
        for value in serde_yaml::Deserializer::from_str(input) {
            let value = Value::deserialize(value)?;
            if value.is_null() {
                continue;
            }
            docs.push(Document::new(value));
        }
        Ok(docs)
    }

    /// Borrows the underlying value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consumes the document, returning the underlying value.
    pub fn into_value(self) -> Value {
        self.value
    }

    /// apiVersion returns the empty string when the field is absent, per the
    /// contract that emptiness is a matter for callers to judge.
    pub fn api_version(&self) -> String {
        self.get_scalar("apiVersion").unwrap_or_default()
    }

    /// kind returns the empty string when the field is absent.
    pub fn kind(&self) -> String {
        self.get_scalar("kind").unwrap_or_default()
    }

    /// namespace returns the empty string for cluster-scoped resources.
    pub fn namespace(&self) -> String {
        self.get_scalar("metadata.namespace").unwrap_or_default()
    }

    /// name returns the empty string when `metadata.name` is absent.
    pub fn name(&self) -> String {
        self.get_scalar("metadata.name").unwrap_or_default()
    }

    /// previous_name reads the rename-pivot annotation, if present.
    pub fn previous_name(&self) -> Option<String> {
        self.annotation(PREVIOUS_NAME_ANNOTATION)
    }

    /// annotation reads a single key out of `metadata.annotations`.
    pub fn annotation(&self, key: &str) -> Option<String> {
        let annotations = self.value.get("metadata")?.get("annotations")?;
        annotations.get(key)?.as_str().map(str::to_owned)
    }

    /// annotations returns the full `metadata.annotations` mapping, empty if
    /// absent.
    pub fn annotations(&self) -> std::collections::BTreeMap<String, String> {
        let mut out = std::collections::BTreeMap::new();
        if let Some(Value::Mapping(m)) = self
            .value
            .get("metadata")
            .and_then(|m| m.get("annotations"))
        {
            for (k, v) in m {
                if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                    out.insert(k.to_owned(), v.to_owned());
                }
            }
        }
        out
    }

    /// labels returns the full `metadata.labels` mapping, empty if absent.
    pub fn labels(&self) -> std::collections::BTreeMap<String, String> {
        let mut out = std::collections::BTreeMap::new();
        if let Some(Value::Mapping(m)) = self.value.get("metadata").and_then(|m| m.get("labels")) {
            for (k, v) in m {
                if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                    out.insert(k.to_owned(), v.to_owned());
                }
            }
        }
        out
    }

    /// set_annotation materializes `metadata` and `metadata.annotations` if
    /// absent, then sets the key.
    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let metadata = ensure_mapping_key(&mut self.value, "metadata");
        let annotations = ensure_mapping_key(metadata, "annotations");
        insert_str(annotations, key, value);
    }

    /// set_label materializes `metadata` and `metadata.labels` if absent,
    /// then sets the key.
    pub fn set_label(&mut self, key: &str, value: &str) {
        let metadata = ensure_mapping_key(&mut self.value, "metadata");
        let labels = ensure_mapping_key(metadata, "labels");
        insert_str(labels, key, value);
    }

    /// remove_annotation deletes a single key from `metadata.annotations`, if
    /// present. Used by the collector to strip the rename-pivot annotation
    /// before a document is emitted.
    pub fn remove_annotation(&mut self, key: &str) {
        if let Some(Value::Mapping(metadata)) = self.value.get_mut("metadata") {
            if let Some(Value::Mapping(annotations)) = metadata.get_mut("annotations") {
                annotations.remove(&Value::String(key.to_owned()));
            }
        }
    }

    /// set_namespace writes `metadata.namespace`.
    pub fn set_namespace(&mut self, namespace: &str) {
        let metadata = ensure_mapping_key(&mut self.value, "metadata");
        insert_str(metadata, "namespace", namespace);
    }

    /// set_name writes `metadata.name`.
    pub fn set_name(&mut self, name: &str) {
        let metadata = ensure_mapping_key(&mut self.value, "metadata");
        insert_str(metadata, "name", name);
    }

    /// get_scalar resolves a dotted path expression (e.g.
    /// `spec.template.spec.containers[0].image`) against the document and
    /// returns the scalar's string form, or `None` if any segment is
    /// missing or the terminal node is not a scalar.
    pub fn get_scalar(&self, path: &str) -> Option<String> {
        let segments = Segment::parse(path);
        let node = resolve(&self.value, &segments)?;
        scalar_to_string(node)
    }

    /// set_scalar resolves a dotted path expression, creating intermediate
    /// mappings as needed, and overwrites the terminal scalar. Sequence
    /// indices must already exist (the model does not grow arrays).
    pub fn set_scalar(&mut self, path: &str, value: &str) -> crate::Result<()> {
        let segments = Segment::parse(path);
        let node = resolve_mut(&mut self.value, &segments)
            .ok_or_else(|| crate::Error::Resolver(format!("path '{path}' does not resolve")))?;
        *node = Value::String(value.to_owned());
        Ok(())
    }

    /// find_scalars walks every node matched by a path expression that may
    /// contain a wildcard segment `[*]`, returning mutable references to
    /// each matched scalar. Used by the reference resolver, which must
    /// rewrite every element of a list field (e.g. container env sources)
    /// rather than a single indexed one.
    pub fn find_scalars_mut(&mut self, path: &str) -> Vec<&mut Value> {
        let segments = Segment::parse(path);
        let mut out = Vec::new();
        collect_mut(&mut self.value, &segments, &mut out);
        out
    }
}

use serde::Deserialize;

fn ensure_mapping_key<'a>(value: &'a mut Value, key: &str) -> &'a mut Value {
    if !matches!(value, Value::Mapping(_)) {
        *value = Value::Mapping(serde_yaml::Mapping::new());
    }
    let Value::Mapping(map) = value else {
        unreachable!()
    };
    map.entry(Value::String(key.to_owned()))
        .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()))
}

fn insert_str(value: &mut Value, key: &str, s: &str) {
    if !matches!(value, Value::Mapping(_)) {
        *value = Value::Mapping(serde_yaml::Mapping::new());
    }
    let Value::Mapping(map) = value else {
        unreachable!()
    };
    map.insert(Value::String(key.to_owned()), Value::String(s.to_owned()));
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Segment is one component of a dotted path expression: a mapping key, a
/// sequence index, or a wildcard over a sequence.
#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

impl Segment {
    /// Parses expressions of the form `a.b[0].c` or the bracket-quoted form
    /// `a['b.c']` used for keys containing dots (mirrors
    /// `$.metadata.annotations['kude.kfirs.com/previous-name']`).
    fn parse(path: &str) -> Vec<Segment> {
        let mut segments = Vec::new();
        let path = path.strip_prefix("$.").unwrap_or(path);
        let mut chars = path.chars().peekable();
        let mut current = String::new();
        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if !current.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut current)));
                    }
                }
                '[' => {
                    if !current.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut current)));
                    }
                    let mut inner = String::new();
                    for c2 in chars.by_ref() {
                        if c2 == ']' {
                            break;
                        }
                        inner.push(c2);
                    }
                    let inner = inner.trim();
                    if inner == "*" {
                        segments.push(Segment::Wildcard);
                    } else if let Some(quoted) = inner
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                    {
                        segments.push(Segment::Key(quoted.to_owned()));
                    } else if let Ok(idx) = inner.parse::<usize>() {
                        segments.push(Segment::Index(idx));
                    }
                }
                _ => current.push(c),
            }
        }
        if !current.is_empty() {
            segments.push(Segment::Key(current));
        }
        segments
    }
}

fn resolve<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match segment {
            Segment::Key(k) => current.get(k)?,
            Segment::Index(i) => current.get(i)?,
            Segment::Wildcard => return None,
        };
    }
    Some(current)
}

fn resolve_mut<'a>(value: &'a mut Value, segments: &[Segment]) -> Option<&'a mut Value> {
    let mut current = value;
    for segment in segments {
        current = match segment {
            Segment::Key(k) => {
                if !matches!(current, Value::Mapping(_)) {
                    *current = Value::Mapping(serde_yaml::Mapping::new());
                }
                let Value::Mapping(map) = current else {
                    unreachable!()
                };
                map.entry(Value::String(k.clone()))
                    .or_insert(Value::Null)
            }
            Segment::Index(i) => current.get_mut(i)?,
            Segment::Wildcard => return None,
        };
    }
    Some(current)
}

fn collect_mut<'a>(value: &'a mut Value, segments: &[Segment], out: &mut Vec<&'a mut Value>) {
    match segments.split_first() {
        None => out.push(value),
        Some((Segment::Key(k), rest)) => {
            if let Some(next) = value.get_mut(k) {
                collect_mut(next, rest, out);
            }
        }
        Some((Segment::Index(i), rest)) => {
            if let Some(next) = value.get_mut(*i) {
                collect_mut(next, rest, out);
            }
        }
        Some((Segment::Wildcard, rest)) => {
            if let Value::Sequence(seq) = value {
                for item in seq {
                    collect_mut(item, rest, out);
                }
            }
        }
    }
}

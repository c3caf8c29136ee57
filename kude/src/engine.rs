//! The pipeline engine: orchestrates hydration, the step chain, the
//! collector, reference resolution and the kind sort, then emits the
//! resulting multi-document YAML stream.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::document::Document;
use crate::filter::Filter;
use crate::hydrate::{self, NestedRunner};
use crate::manifest::{Manifest, Step};
use crate::sort::sort_documents;
use crate::step::{self, container::ContainerRuntime};
use crate::{Error, Result, ENGINE_VERSION};

const MANIFEST_FILE: &str = "kude.yaml";
const CHANNEL_CAPACITY: usize = 64;
const MAX_NESTED_DEPTH: u32 = 32;

/// Annotation prefixes the collector strips before a document is considered
/// for the rename map or emitted. These mirror the bookkeeping annotations
/// the kpt/kustomize kyaml tooling attaches (indices, ids, path hints) —
/// never user intent, and never meant to survive to the rendered output.
const INTERNAL_ANNOTATION_PREFIXES: &[&str] =
    &["config.kubernetes.io/", "internal.config.kubernetes.io/"];

/// EngineOptions carries the knobs the CLI (or a test) sets on an [`Engine`]:
/// whether built-ins always run in-process, the sandbox backend, and the
/// cancellation signal threaded through every phase.
#[derive(Clone)]
pub struct EngineOptions {
    /// inline_builtins forces built-in steps to run in-process even when a
    /// container dispatch would otherwise be taken.
    pub inline_builtins: bool,
    /// runtime is the sandbox backend used to dispatch non-built-in steps.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// cancellation aborts the run the next time a phase checks it.
    pub cancellation: CancellationToken,
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("inline_builtins", &self.inline_builtins)
            .finish_non_exhaustive()
    }
}

/// Engine drives one package's pipeline from its manifest through to a
/// sorted, reference-resolved document sequence.
#[derive(Clone)]
pub struct Engine {
    pkg_dir: PathBuf,
    options: EngineOptions,
    depth: u32,
}

impl Engine {
    /// new roots an engine at `pkg_dir`, resolving it to an absolute path.
    pub fn new(pkg_dir: impl Into<PathBuf>, options: EngineOptions) -> Result<Self> {
        Self::at_depth(pkg_dir, options, 0)
    }

    fn at_depth(pkg_dir: impl Into<PathBuf>, options: EngineOptions, depth: u32) -> Result<Self> {
        let pkg_dir = pkg_dir.into();
        let resolved = std::fs::canonicalize(&pkg_dir).map_err(|e| {
            Error::Manifest(format!(
                "failed resolving package directory '{}': {e}",
                pkg_dir.display()
            ))
        })?;
        Ok(Engine {
            pkg_dir: resolved,
            options,
            depth,
        })
    }

    /// run executes the full pipeline and writes the resulting multi-
    /// document YAML stream to `writer`, two-space indented, each document
    /// prefixed by `---`.
    pub async fn run<W: Write>(&self, writer: &mut W) -> Result<()> {
        let docs = self.run_to_documents().await?;
        emit(writer, &docs)
    }

    /// run_to_documents executes phases 1-5 (prepare through sort),
    /// returning the final document sequence without emitting it anywhere.
    /// Used both by [`Engine::run`] and by nested-package re-entry, which
    /// only wants the document stream, not a standalone YAML stream.
    pub async fn run_to_documents(&self) -> Result<Vec<Document>> {
        if self.depth > MAX_NESTED_DEPTH {
            return Err(Error::Hydration {
                source: self.pkg_dir.display().to_string(),
                message: format!("exceeded maximum nested-package depth of {MAX_NESTED_DEPTH}"),
            });
        }

        let cancellation = self.options.cancellation.clone();
        tokio::select! {
            biased;
            () = cancellation.cancelled() => Err(Error::Other(anyhow::anyhow!("execution cancelled"))),
            result = self.execute() => result,
        }
    }

    async fn execute(&self) -> Result<Vec<Document>> {
        let (cache_dir, temp_dir) = self.prepare().await?;
        let manifest = self.parse_manifest().await?;

        debug!(pkg = %self.pkg_dir.display(), resources = manifest.resources.len(), steps = manifest.steps.len(), "prepared pipeline");
        let result = self.run_pipeline(&manifest, &cache_dir, &temp_dir).await;

        if result.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
                warn!(path = %temp_dir.display(), error = %e, "failed tearing down temp directory on clean exit");
            }
        }

        result
    }

    /// prepare creates `<pkg>/.kude/cache` (persisted across runs) and a
    /// fresh `<pkg>/.kude/temp` (any remnant of a previous, failed run is
    /// cleared first; this run's own temp subtree is torn down on success).
    async fn prepare(&self) -> Result<(PathBuf, PathBuf)> {
        let kude_dir = self.pkg_dir.join(".kude");
        let cache_dir = kude_dir.join("cache");
        let temp_dir = kude_dir.join("temp");
        tokio::fs::create_dir_all(&cache_dir).await?;
        let _ = tokio::fs::remove_dir_all(&temp_dir).await;
        tokio::fs::create_dir_all(&temp_dir).await?;
        Ok((cache_dir, temp_dir))
    }

    async fn parse_manifest(&self) -> Result<Manifest> {
        let path = self.pkg_dir.join(MANIFEST_FILE);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Manifest(format!("failed reading '{}': {e}", path.display())))?;
        Manifest::parse(&text, &self.pkg_dir, ENGINE_VERSION)
    }

    /// nested_runner is the callback the hydrator invokes when it finds a
    /// subdirectory with its own `kude.yaml`: it constructs a nested engine
    /// one depth deeper, sharing this engine's options (and therefore its
    /// cancellation token, inline-builtins setting and sandbox backend),
    /// and runs it to completion.
    fn nested_runner(&self) -> NestedRunner {
        let options = self.options.clone();
        let depth = self.depth;
        Arc::new(move |dir: PathBuf| {
            let options = options.clone();
            Box::pin(async move {
                let engine = Engine::at_depth(dir, options, depth + 1)?;
                engine.run_to_documents().await
            })
        })
    }

    async fn run_pipeline(
        &self,
        manifest: &Manifest,
        cache_dir: &Path,
        temp_dir: &Path,
    ) -> Result<Vec<Document>> {
        let mut joins: JoinSet<Result<()>> = JoinSet::new();

        let (hydrate_tx, mut stage_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let nested_runner = self.nested_runner();
        for source in &manifest.resources {
            let source = source.clone();
            let pkg_dir = self.pkg_dir.clone();
            let tx = hydrate_tx.clone();
            let nested_runner = nested_runner.clone();
            joins.spawn(async move { hydrate::hydrate_source(&source, &pkg_dir, tx, nested_runner).await });
        }
        drop(hydrate_tx);

        for step_def in &manifest.steps {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            let step_def = step_def.clone();
            let inline_builtins = self.options.inline_builtins;
            let pwd = self.pkg_dir.clone();
            let cache_dir = cache_dir.to_path_buf();
            let temp_dir = temp_dir.to_path_buf();
            let runtime = self.options.runtime.clone();
            let input = stage_rx;
            joins.spawn(async move {
                run_step_stage(step_def, inline_builtins, pwd, cache_dir, temp_dir, runtime, input, tx).await
            });
            stage_rx = rx;
        }

        let mut collected = Vec::new();
        while let Some(doc) = stage_rx.recv().await {
            collected.push(doc);
        }

        // Drain every spawned worker before deciding the outcome: a worker
        // error must not abort its siblings (dropping the JoinSet here
        // would do exactly that), matching the propagation policy that
        // subsequent errors are suppressed but every worker still runs to
        // completion.
        let mut first_error: Option<Error> = None;
        while let Some(joined) = joins.join_next().await {
            let outcome = joined.map_err(Error::from).and_then(|r| r);
            if let Err(e) = outcome {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let (docs, rename_map) = collect(collected);
        resolve_and_sort(docs, rename_map)
    }
}

/// run_step_stage is one step worker: it drains its entire input channel
/// (a step's built-in/container contract needs the complete batch, since a
/// container step receives one stdin stream and produces one stdout
/// stream), splits the batch by the step's filter, runs the step's logic
/// against the selected subset only, then forwards the transformed
/// documents and the untouched passthrough documents downstream.
async fn run_step_stage(
    step_def: Step,
    inline_builtins: bool,
    pwd: PathBuf,
    cache_dir: PathBuf,
    temp_dir: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    mut input: mpsc::Receiver<Document>,
    output: mpsc::Sender<Document>,
) -> Result<()> {
    let mut docs = Vec::new();
    while let Some(doc) = input.recv().await {
        docs.push(doc);
    }

    let (selected, passthrough) = split_by_filter(&step_def.filter, docs)?;
    info!(step = %step_def.id, name = %step_def.name, selected = selected.len(), passthrough = passthrough.len(), "running step");
    let transformed = step::run(
        &step_def,
        inline_builtins,
        &pwd,
        &cache_dir,
        &temp_dir,
        runtime.as_ref(),
        selected,
    )
    .await?;

    for doc in transformed.into_iter().chain(passthrough) {
        if output.send(doc).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// split_by_filter partitions `docs` into those the step's filter selects
/// (which the step's logic runs against) and the rest (which pass through
/// this step untouched).
fn split_by_filter(filter: &Filter, docs: Vec<Document>) -> Result<(Vec<Document>, Vec<Document>)> {
    let mut selected = Vec::with_capacity(docs.len());
    let mut passthrough = Vec::new();
    for doc in docs {
        if filter.selects(&doc)? {
            selected.push(doc);
        } else {
            passthrough.push(doc);
        }
    }
    Ok((selected, passthrough))
}

/// collect is engine phase 3: it strips internal tooling annotations from
/// every document, then builds the rename map from the `previous-name`
/// annotation any surviving document carries. The annotation itself is
/// left in place on the document.
fn collect(mut docs: Vec<Document>) -> (Vec<Document>, HashMap<String, String>) {
    let mut rename_map = HashMap::new();
    for doc in &mut docs {
        strip_internal_annotations(doc);
        if let Some(previous) = doc.previous_name() {
            let key = format!(
                "{}/{}/{}/{}",
                doc.api_version(),
                doc.kind(),
                doc.namespace(),
                previous
            );
            rename_map.insert(key, doc.name());
        }
    }
    (docs, rename_map)
}

fn strip_internal_annotations(doc: &mut Document) {
    let keys: Vec<String> = doc
        .annotations()
        .into_keys()
        .filter(|k| INTERNAL_ANNOTATION_PREFIXES.iter().any(|prefix| k.starts_with(prefix)))
        .collect();
    for key in keys {
        doc.remove_annotation(&key);
    }
}

/// resolve_and_sort is engine phases 4-5: apply the reference catalog
/// against the rename map built by the collector, then the kind-sort
/// policy, warning once per duplicate `(apiVersion, kind, namespace, name)`
/// tuple the sort surfaces.
fn resolve_and_sort(mut docs: Vec<Document>, rename_map: HashMap<String, String>) -> Result<Vec<Document>> {
    let catalog = Catalog;
    for doc in &mut docs {
        catalog.resolve(doc, &rename_map)?;
    }
    sort_documents(&mut docs);
    warn_on_duplicates(&docs);
    Ok(docs)
}

/// warn_on_duplicates surfaces, without deduplicating, runs of documents
/// that share (apiVersion, kind, namespace, name) after the sort. Duplicates
/// are tolerated rather than rejected, but worth a single warning per
/// offending tuple rather than silence.
fn warn_on_duplicates(docs: &[Document]) {
    let mut warned = HashSet::new();
    for pair in docs.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.api_version() == b.api_version()
            && a.kind() == b.kind()
            && a.namespace() == b.namespace()
            && a.name() == b.name()
        {
            let key = (a.api_version(), a.kind(), a.namespace(), a.name());
            if warned.insert(key) {
                warn!(
                    api_version = %a.api_version(),
                    kind = %a.kind(),
                    namespace = %a.namespace(),
                    name = %a.name(),
                    "duplicate document in final output"
                );
            }
        }
    }
}

/// emit is engine phase 6: write every document to `writer` as a `---`-
/// delimited multi-document YAML stream.
fn emit<W: Write>(writer: &mut W, docs: &[Document]) -> Result<()> {
    for doc in docs {
        writeln!(writer, "---")?;
        serde_yaml::to_writer(&mut *writer, doc.value())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::container::fake::FakeRuntime;
    use std::collections::HashMap as Map;

    fn options() -> EngineOptions {
        EngineOptions {
            inline_builtins: true,
            runtime: Arc::new(FakeRuntime::new(Map::new())),
            cancellation: CancellationToken::new(),
        }
    }

    async fn write_manifest(dir: &Path, body: &str) {
        tokio::fs::write(dir.join("kude.yaml"), body).await.unwrap();
    }

    #[tokio::test]
    async fn empty_pipeline_sorts_service_before_deployment() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: [a.yaml, b.yaml]\nsteps: []\n",
        )
        .await;
        tokio::fs::write(
            dir.path().join("a.yaml"),
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d1\n  namespace: ns\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join("b.yaml"),
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: s1\n  namespace: ns\n",
        )
        .await
        .unwrap();

        let engine = Engine::new(dir.path(), options()).unwrap();
        let docs = engine.run_to_documents().await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].kind(), "Service");
        assert_eq!(docs[1].kind(), "Deployment");

        assert!(dir.path().join(".kude/cache").is_dir());
        assert!(!dir.path().join(".kude/temp").exists());
    }

    #[tokio::test]
    async fn annotate_step_sets_annotation() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: [a.yaml]\nsteps:\n  - image: ghcr.io/arikkfir/kude/functions/annotate\n    config:\n      name: foo\n      value: bar\n",
        )
        .await;
        tokio::fs::write(
            dir.path().join("a.yaml"),
            "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: sa\n",
        )
        .await
        .unwrap();

        let engine = Engine::new(dir.path(), options()).unwrap();
        let docs = engine.run_to_documents().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].annotation("foo").as_deref(), Some("bar"));
    }

    #[tokio::test]
    async fn configmap_rename_propagates_to_deployment_reference() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: [deploy.yaml]\nsteps:\n  - image: ghcr.io/arikkfir/kude/functions/create-configmap\n    config:\n      name: cfg\n      contents:\n        - key: k\n          value: v\n",
        )
        .await;
        tokio::fs::write(
            dir.path().join("deploy.yaml"),
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d\nspec:\n  template:\n    spec:\n      containers:\n        - envFrom:\n            - configMapRef:\n                name: cfg\n",
        )
        .await
        .unwrap();

        let engine = Engine::new(dir.path(), options()).unwrap();
        let docs = engine.run_to_documents().await.unwrap();
        let deployment = docs.iter().find(|d| d.kind() == "Deployment").unwrap();
        let configmap = docs.iter().find(|d| d.kind() == "ConfigMap").unwrap();
        assert!(configmap.name().starts_with("cfg-"));
        assert_eq!(
            deployment
                .get_scalar("spec.template.spec.containers[0].envFrom[0].configMapRef.name")
                .as_deref(),
            Some(configmap.name().as_str())
        );
    }

    #[tokio::test]
    async fn no_rewrite_when_namespace_differs() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: [all.yaml]\nsteps: []\n",
        )
        .await;
        tokio::fs::write(
            dir.path().join("all.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg-deadbeef\n  namespace: other\n  annotations:\n    kude.kfirs.com/previous-name: cfg\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d\n  namespace: ns\nspec:\n  template:\n    spec:\n      containers:\n        - envFrom:\n            - configMapRef:\n                name: cfg\n",
        )
        .await
        .unwrap();

        let engine = Engine::new(dir.path(), options()).unwrap();
        let docs = engine.run_to_documents().await.unwrap();
        let deployment = docs.iter().find(|d| d.kind() == "Deployment").unwrap();
        assert_eq!(
            deployment
                .get_scalar("spec.template.spec.containers[0].envFrom[0].configMapRef.name")
                .as_deref(),
            Some("cfg")
        );
    }

    #[tokio::test]
    async fn nested_package_resources_are_included_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: [sub]\nsteps: []\n",
        )
        .await;
        let sub = dir.path().join("sub");
        tokio::fs::create_dir(&sub).await.unwrap();
        write_manifest(
            &sub,
            "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: [svc.yaml]\nsteps: []\n",
        )
        .await;
        tokio::fs::write(
            sub.join("svc.yaml"),
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: nested-svc\n",
        )
        .await
        .unwrap();

        let engine = Engine::new(dir.path(), options()).unwrap();
        let docs = engine.run_to_documents().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].name(), "nested-svc");
    }

    #[tokio::test]
    async fn container_step_non_zero_exit_is_a_step_error_with_no_partial_output() {
        use crate::step::container::fake::ScriptedOutcome;

        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: [a.yaml]\nsteps:\n  - id: broken\n    image: exit3:latest\n",
        )
        .await;
        tokio::fs::write(
            dir.path().join("a.yaml"),
            "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: sa\n",
        )
        .await
        .unwrap();

        let mut outcomes = Map::new();
        outcomes.insert(
            "exit3:latest".to_owned(),
            ScriptedOutcome {
                stdout: Vec::new(),
                exit_code: 3,
            },
        );
        let opts = EngineOptions {
            inline_builtins: false,
            runtime: Arc::new(FakeRuntime::new(outcomes)),
            cancellation: CancellationToken::new(),
        };
        let engine = Engine::new(dir.path(), opts).unwrap();
        let err = engine.run_to_documents().await.unwrap_err();
        match err {
            Error::Step { step, .. } => assert_eq!(step, "broken"),
            other => panic!("expected Error::Step, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_kind_is_rejected_before_any_worker_starts() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "apiVersion: kude.kfirs.com/v1alpha2\nkind: Package\nresources: []\n",
        )
        .await;

        let engine = Engine::new(dir.path(), options()).unwrap();
        let err = engine.run_to_documents().await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Pipeline"));
        assert!(msg.contains("Package"));
    }

    #[tokio::test]
    async fn run_writes_a_dash_delimited_yaml_stream() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "apiVersion: kude.kfirs.com/v1alpha2\nkind: Pipeline\nresources: [a.yaml]\nsteps: []\n",
        )
        .await;
        tokio::fs::write(
            dir.path().join("a.yaml"),
            "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: sa\n",
        )
        .await
        .unwrap();

        let engine = Engine::new(dir.path(), options()).unwrap();
        let mut out = Vec::new();
        engine.run(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("---\n"));
        assert!(text.contains("kind: ServiceAccount"));
    }
}

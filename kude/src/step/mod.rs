//! The step runner (C5): dispatches one pipeline step to either an
//! in-process built-in or a sandboxed container, enforcing the
//! emptiness-rejection invariant on whatever it produces.

pub mod builtin;
pub mod config;
pub mod container;

use std::path::Path;

use crate::document::Document;
use crate::manifest::Step;
use crate::{Error, Result};

pub use container::ContainerRuntime;

/// run executes one step to completion against `docs`, returning its
/// output document stream. The image's repository portion (text before the
/// first `:`) is looked up in the built-in table; a match runs in-process
/// when `inline_builtins` is set, otherwise (and for every other image)
/// the container path is taken.
pub async fn run(
    step: &Step,
    inline_builtins: bool,
    pwd: &Path,
    cache_dir: &Path,
    temp_dir: &Path,
    runtime: &dyn ContainerRuntime,
    docs: Vec<Document>,
) -> Result<Vec<Document>> {
    let config_path = config::write_config_file(temp_dir, &step.id, &step.config)?;
    let repository = step.image.split_once(':').map(|(repo, _)| repo).unwrap_or(&step.image);

    let output = if inline_builtins {
        match builtin::dispatch(repository) {
            Some(builtin_fn) => {
                let ctx = builtin::BuiltinContext {
                    pwd: pwd.to_path_buf(),
                    cache_dir: cache_dir.to_path_buf(),
                    temp_dir: temp_dir.to_path_buf(),
                };
                builtin_fn(&ctx, &config_path, docs).map_err(|e| match e {
                    Error::Step { .. } => e,
                    other => Error::Step {
                        step: step.id.clone(),
                        message: other.to_string(),
                    },
                })?
            }
            None => {
                container::run_to_documents(runtime, step, cache_dir, temp_dir, &config_path, docs).await?
            }
        }
    } else {
        container::run_to_documents(runtime, step, cache_dir, temp_dir, &config_path, docs).await?
    };

    for doc in &output {
        if doc.api_version().is_empty() || doc.kind().is_empty() {
            return Err(Error::Step {
                step: step.id.clone(),
                message: "step emitted a document missing apiVersion or kind".to_owned(),
            });
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::container::fake::FakeRuntime;
    use std::collections::HashMap;

    fn step() -> Step {
        Step {
            id: "001".to_owned(),
            name: "001 // annotate".to_owned(),
            image: "ghcr.io/arikkfir/kude/functions/annotate:0.1.0".to_owned(),
            entrypoint: None,
            user: None,
            workdir: "/workspace".to_owned(),
            network: false,
            mounts: vec![],
            config: serde_yaml::from_str("name: foo\nvalue: bar\n").unwrap(),
            filter: Default::default(),
        }
    }

    #[tokio::test]
    async fn inline_builtins_runs_annotate_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::new(HashMap::new());
        let doc = Document::new(serde_yaml::from_str("apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: sa\n").unwrap());
        let out = run(&step(), true, dir.path(), dir.path(), dir.path(), &runtime, vec![doc])
            .await
            .unwrap();
        assert_eq!(out[0].annotation("foo").as_deref(), Some("bar"));
    }

    #[tokio::test]
    async fn emptiness_is_rejected_as_a_step_error() {
        use crate::step::container::fake::ScriptedOutcome;

        let dir = tempfile::tempdir().unwrap();
        let mut outcomes = HashMap::new();
        outcomes.insert(
            "busybox".to_owned(),
            ScriptedOutcome {
                stdout: b"---\nfoo: bar\n".to_vec(),
                exit_code: 0,
            },
        );
        let runtime = FakeRuntime::new(outcomes);
        let mut s = step();
        s.image = "busybox:latest".to_owned();
        let err = run(&s, true, dir.path(), dir.path(), dir.path(), &runtime, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Step { .. }));
    }
}

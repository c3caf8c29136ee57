//! Container dispatch: a sandbox state machine expressed against a
//! [`ContainerRuntime`] trait so a real Docker/OCI backend and an
//! in-memory fake can both drive it.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::document::Document;
use crate::manifest::Step;
use crate::{Error, Result, CONTROLLER_NAME, ENGINE_VERSION};

const STOP_GRACE: Duration = Duration::from_secs(30);

/// ContainerSpec is everything [`ContainerRuntime::create`] needs to start
/// a step's sandbox.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// name is a unique, human-readable container name.
    pub name: String,
    /// image is the full image reference (repository:tag).
    pub image: String,
    /// entrypoint overrides the image's own entrypoint when set.
    pub entrypoint: Option<Vec<String>>,
    /// user runs the container as this user when set.
    pub user: Option<String>,
    /// env is the full list of environment variable assignments.
    pub env: Vec<String>,
    /// labels are applied to the created container.
    pub labels: Vec<(String, String)>,
    /// network_disabled mirrors the step's `network` flag, inverted.
    pub network_disabled: bool,
    /// binds are `host:container` bind mount specifications, including the
    /// three the runner always injects (cache, temp, config file).
    pub binds: Vec<String>,
    /// workdir is the container's working directory.
    pub workdir: String,
}

/// ContainerRuntime is the sandbox treated as an external collaborator:
/// `listImages`, `pullImage`, `create`, `start`, `attachStdio`, `wait`,
/// `remove`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// list_image_tags returns every locally known tag for `reference`'s
    /// repository (used to decide whether a pull is needed and to detect
    /// an ambiguous multi-match).
    async fn list_image_tags(&self, reference: &str) -> Result<Vec<String>>;
    /// pull_image pulls `reference`, logging each progress status line.
    async fn pull_image(&self, reference: &str) -> Result<()>;
    /// create starts a container in the created-but-not-running state and
    /// returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    /// start transitions a created container to running.
    async fn start(&self, id: &str) -> Result<()>;
    /// send_stdin writes the full input stream to the container's stdin,
    /// then closes it.
    async fn send_stdin(&self, id: &str, data: Vec<u8>) -> Result<()>;
    /// collect_output waits for the container to finish producing output
    /// and returns its demultiplexed stdout and stderr.
    async fn collect_output(&self, id: &str) -> Result<(Vec<u8>, Vec<u8>)>;
    /// wait blocks until the container exits and returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64>;
    /// stop requests a graceful stop within `grace`, force-killing after.
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;
    /// remove deletes a stopped container.
    async fn remove(&self, id: &str) -> Result<()>;
}

fn image_is_latest_only(tags: &[String]) -> bool {
    tags.len() == 1 && tags[0].ends_with(":latest")
}

/// run dispatches one step through the container state machine:
/// IMAGE_CHECK → (IMAGE_PULL) → CREATE → START → RUNNING → WAIT, with
/// unconditional cleanup (stop, remove) regardless of outcome.
pub async fn run(
    runtime: &dyn ContainerRuntime,
    step: &Step,
    cache_dir: &std::path::Path,
    temp_dir: &std::path::Path,
    config_file: &std::path::Path,
    input: Vec<u8>,
) -> Result<Vec<u8>> {
    let tags = runtime.list_image_tags(&step.image).await?;
    if tags.len() > 1 {
        return Err(Error::Step {
            step: step.id.clone(),
            message: "multiple matching images".to_owned(),
        });
    }
    if tags.is_empty() || image_is_latest_only(&tags) {
        debug!(step = %step.id, image = %step.image, "pulling image");
        runtime.pull_image(&step.image).await.map_err(|e| Error::Step {
            step: step.id.clone(),
            message: format!("failed pulling image: {e}"),
        })?;
    }

    let spec = ContainerSpec {
        name: format!("{CONTROLLER_NAME}-{}-{}", step.id, uuid::Uuid::new_v4()),
        image: step.image.clone(),
        entrypoint: step.entrypoint.clone(),
        user: step.user.clone(),
        env: vec![
            "KUDE=true".to_owned(),
            format!("KUDE_VERSION={ENGINE_VERSION}"),
        ],
        labels: vec![
            ("kude".to_owned(), "true".to_owned()),
            ("kudeVersion".to_owned(), ENGINE_VERSION.to_owned()),
        ],
        network_disabled: !step.network,
        binds: {
            let mut binds = vec![
                format!("{}:/workspace/.cache", cache_dir.display()),
                format!("{}:/workspace/.temp", temp_dir.display()),
                format!("{}:/etc/kude/function/config.yaml", config_file.display()),
            ];
            for mount in &step.mounts {
                binds.push(format!("{}:{}", mount.local.display(), mount.remote));
            }
            binds
        },
        workdir: step.workdir.clone(),
    };

    let container_id = runtime.create(&spec).await.map_err(|e| Error::Step {
        step: step.id.clone(),
        message: format!("failed creating container: {e}"),
    })?;

    let result = run_running(runtime, step, &container_id, input).await;

    if let Err(e) = runtime.stop(&container_id, STOP_GRACE).await {
        warn!(step = %step.id, container = %container_id, error = %e, "failed stopping container during cleanup");
    }
    if let Err(e) = runtime.remove(&container_id).await {
        warn!(step = %step.id, container = %container_id, error = %e, "failed removing container during cleanup");
    }

    result
}

async fn run_running(
    runtime: &dyn ContainerRuntime,
    step: &Step,
    container_id: &str,
    input: Vec<u8>,
) -> Result<Vec<u8>> {
    runtime.start(container_id).await.map_err(|e| Error::Step {
        step: step.id.clone(),
        message: format!("failed starting container: {e}"),
    })?;
    info!(step = %step.id, container = %container_id, "container running");

    // The three RUNNING-state legs run concurrently rather than
    // sequentially: a container whose input or output exceeds the OS pipe
    // buffer will block on a full stdout/stderr pipe until something reads
    // it, so writing all of stdin before reading any output can deadlock.
    let stdin = runtime.send_stdin(container_id, input);
    let output = runtime.collect_output(container_id);
    let wait = runtime.wait(container_id);
    let (_, (stdout, stderr), exit_code) = tokio::try_join!(stdin, output, wait).map_err(|e| Error::Step {
        step: step.id.clone(),
        message: format!("container run failed: {e}"),
    })?;

    if !stderr.is_empty() {
        for line in String::from_utf8_lossy(&stderr).lines() {
            info!(step = %step.id, container = %container_id, "{line}");
        }
    }

    if exit_code != 0 {
        let tail: String = String::from_utf8_lossy(&stderr)
            .lines()
            .rev()
            .take(20)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(Error::Step {
            step: step.id.clone(),
            message: format!("container exited with status code {exit_code}, container id {container_id}, stderr tail:\n{tail}"),
        });
    }

    Ok(stdout)
}

/// run_to_documents is the [`run`] entry point the engine uses: it
/// serializes `input` documents to YAML, runs the container, and parses
/// its stdout back into documents, enforcing the apiVersion/kind
/// emptiness-rejection invariant the built-in path also enforces.
pub async fn run_to_documents(
    runtime: &dyn ContainerRuntime,
    step: &Step,
    cache_dir: &std::path::Path,
    temp_dir: &std::path::Path,
    config_file: &std::path::Path,
    input: Vec<Document>,
) -> Result<Vec<Document>> {
    let mut buf = Vec::new();
    for doc in &input {
        buf.extend_from_slice(b"---\n");
        serde_yaml::to_writer(&mut buf, doc.value())?;
    }

    let output = run(runtime, step, cache_dir, temp_dir, config_file, buf).await?;
    let text = String::from_utf8_lossy(&output);
    let docs = Document::parse_stream(&text)?;
    for doc in &docs {
        if doc.api_version().is_empty() || doc.kind().is_empty() {
            return Err(Error::Step {
                step: step.id.clone(),
                message: "container emitted a document missing apiVersion or kind".to_owned(),
            });
        }
    }
    Ok(docs)
}

#[cfg(feature = "docker")]
pub mod docker {
    //! DockerRuntime drives the sandbox over the Docker Engine API via
    //! `bollard`, following the same image-check/pull/create/start/wait
    //! sequence of calls a Docker SDK client would make.

    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use bollard::container::{
        AttachContainerOptions, Config, CreateContainerOptions, RemoveContainerOptions,
        StopContainerOptions, WaitContainerOptions,
    };
    use bollard::image::{CreateImageOptions, ListImagesOptions};
    use bollard::Docker;
    use futures::StreamExt;

    use super::{ContainerRuntime, ContainerSpec};
    use crate::{Error, Result};

    /// DockerRuntime wraps a connected `bollard::Docker` client.
    pub struct DockerRuntime {
        client: Docker,
    }

    impl DockerRuntime {
        /// connect_with_defaults connects using the standard
        /// `DOCKER_HOST`/TLS environment conventions, same as the Docker
        /// CLI and SDKs do by default.
        pub fn connect_with_defaults() -> Result<Self> {
            let client = Docker::connect_with_local_defaults()
                .map_err(|e| Error::Other(anyhow::anyhow!("failed connecting to Docker daemon: {e}")))?;
            Ok(DockerRuntime { client })
        }
    }

    #[async_trait]
    impl ContainerRuntime for DockerRuntime {
        async fn list_image_tags(&self, reference: &str) -> Result<Vec<String>> {
            let mut filters = HashMap::new();
            filters.insert("reference".to_owned(), vec![reference.to_owned()]);
            let images = self
                .client
                .list_images(Some(ListImagesOptions {
                    all: false,
                    filters,
                    ..Default::default()
                }))
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("failed listing images: {e}")))?;
            Ok(images.into_iter().flat_map(|i| i.repo_tags).collect())
        }

        async fn pull_image(&self, reference: &str) -> Result<()> {
            let mut stream = self.client.create_image(
                Some(CreateImageOptions {
                    from_image: reference.to_owned(),
                    ..Default::default()
                }),
                None,
                None,
            );
            while let Some(progress) = stream.next().await {
                let info = progress.map_err(|e| Error::Other(anyhow::anyhow!("image pull failed: {e}")))?;
                if let Some(status) = info.status {
                    tracing::trace!(status, "docker image pull");
                }
            }
            Ok(())
        }

        async fn create(&self, spec: &ContainerSpec) -> Result<String> {
            let config = Config {
                attach_stderr: Some(true),
                attach_stdout: Some(true),
                attach_stdin: Some(true),
                open_stdin: Some(true),
                stdin_once: Some(true),
                tty: Some(false),
                user: spec.user.clone(),
                env: Some(spec.env.clone()),
                image: Some(spec.image.clone()),
                entrypoint: spec.entrypoint.clone(),
                working_dir: Some(spec.workdir.clone()),
                network_disabled: Some(spec.network_disabled),
                labels: Some(spec.labels.iter().cloned().collect()),
                host_config: Some(bollard::models::HostConfig {
                    binds: Some(spec.binds.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let created = self
                .client
                .create_container(
                    Some(CreateContainerOptions {
                        name: spec.name.clone(),
                        platform: None,
                    }),
                    config,
                )
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("failed creating container: {e}")))?;
            Ok(created.id)
        }

        async fn start(&self, id: &str) -> Result<()> {
            self.client
                .start_container::<String>(id, None)
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("failed starting container: {e}")))
        }

        async fn send_stdin(&self, id: &str, data: Vec<u8>) -> Result<()> {
            use futures::SinkExt;
            let attach = self
                .client
                .attach_container(
                    id,
                    Some(AttachContainerOptions::<String> {
                        stdin: Some(true),
                        stream: Some(true),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("failed attaching stdin: {e}")))?;
            let mut input = attach.input;
            input
                .send(data.into())
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("failed writing to container stdin: {e}")))?;
            Ok(())
        }

        async fn collect_output(&self, id: &str) -> Result<(Vec<u8>, Vec<u8>)> {
            let attach = self
                .client
                .attach_container(
                    id,
                    Some(AttachContainerOptions::<String> {
                        stdout: Some(true),
                        stderr: Some(true),
                        logs: Some(true),
                        stream: Some(true),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("failed attaching stdout/stderr: {e}")))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut output = attach.output;
            while let Some(chunk) = output.next().await {
                match chunk.map_err(|e| Error::Other(anyhow::anyhow!("failed reading container output: {e}")))? {
                    bollard::container::LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    bollard::container::LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
            Ok((stdout, stderr))
        }

        async fn wait(&self, id: &str) -> Result<i64> {
            let mut stream = self.client.wait_container(id, None::<WaitContainerOptions<String>>);
            match stream.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                Some(Err(e)) => Err(Error::Other(anyhow::anyhow!("failed waiting for container: {e}"))),
                None => Err(Error::Other(anyhow::anyhow!("container wait stream ended unexpectedly"))),
            }
        }

        async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
            let t = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
            self.client
                .stop_container(id, Some(StopContainerOptions { t }))
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("failed stopping container: {e}")))
        }

        async fn remove(&self, id: &str) -> Result<()> {
            self.client
                .remove_container(id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("failed removing container: {e}")))
        }
    }
}

/// unavailable provides a [`ContainerRuntime`] that fails every operation,
/// used as the CLI's default sandbox backend when the `docker` feature is
/// disabled or no daemon could be reached at startup: built-in steps keep
/// working via the in-process dispatch path, and only an actual container
/// step surfaces the failure.
pub mod unavailable {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{ContainerRuntime, ContainerSpec};
    use crate::{Error, Result};

    /// UnavailableRuntime rejects every call with the same explanatory
    /// error.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct UnavailableRuntime;

    fn unavailable() -> Error {
        Error::Other(anyhow::anyhow!(
            "no container sandbox is available; build with the 'docker' feature and a reachable daemon to run non-built-in steps"
        ))
    }

    #[async_trait]
    impl ContainerRuntime for UnavailableRuntime {
        async fn list_image_tags(&self, _reference: &str) -> Result<Vec<String>> {
            Err(unavailable())
        }

        async fn pull_image(&self, _reference: &str) -> Result<()> {
            Err(unavailable())
        }

        async fn create(&self, _spec: &ContainerSpec) -> Result<String> {
            Err(unavailable())
        }

        async fn start(&self, _id: &str) -> Result<()> {
            Err(unavailable())
        }

        async fn send_stdin(&self, _id: &str, _data: Vec<u8>) -> Result<()> {
            Err(unavailable())
        }

        async fn collect_output(&self, _id: &str) -> Result<(Vec<u8>, Vec<u8>)> {
            Err(unavailable())
        }

        async fn wait(&self, _id: &str) -> Result<i64> {
            Err(unavailable())
        }

        async fn stop(&self, _id: &str, _grace: Duration) -> Result<()> {
            Err(unavailable())
        }

        async fn remove(&self, _id: &str) -> Result<()> {
            Err(unavailable())
        }
    }

}

/// fake provides an in-memory [`ContainerRuntime`] for tests, so the step
/// runner and engine are exercised without a Docker daemon.
pub mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{ContainerRuntime, ContainerSpec};
    use crate::Result;

    /// ScriptedOutcome is what a fake container "runs" to produce.
    #[derive(Debug, Clone)]
    pub struct ScriptedOutcome {
        /// stdout is echoed back as the container's output.
        pub stdout: Vec<u8>,
        /// exit_code is returned by `wait`.
        pub exit_code: i64,
    }

    /// FakeRuntime maps image references to scripted outcomes. `create`
    /// records which image each container id was created from, so later
    /// calls keyed by container id can look the right outcome back up.
    pub struct FakeRuntime {
        outcomes: HashMap<String, ScriptedOutcome>,
        containers: Mutex<HashMap<String, String>>,
        stdin: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl FakeRuntime {
        /// new builds a fake that dispatches by image reference.
        pub fn new(outcomes: HashMap<String, ScriptedOutcome>) -> Self {
            FakeRuntime {
                outcomes,
                containers: Mutex::new(HashMap::new()),
                stdin: Mutex::new(HashMap::new()),
            }
        }

        fn outcome_for(&self, id: &str) -> Option<ScriptedOutcome> {
            let containers = self.containers.lock().unwrap();
            let image = containers.get(id)?;
            self.outcomes.get(image).cloned()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn list_image_tags(&self, _reference: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn pull_image(&self, _reference: &str) -> Result<()> {
            Ok(())
        }

        async fn create(&self, spec: &ContainerSpec) -> Result<String> {
            self.containers
                .lock()
                .unwrap()
                .insert(spec.name.clone(), spec.image.clone());
            Ok(spec.name.clone())
        }

        async fn start(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn send_stdin(&self, id: &str, data: Vec<u8>) -> Result<()> {
            self.stdin.lock().unwrap().insert(id.to_owned(), data);
            Ok(())
        }

        async fn collect_output(&self, id: &str) -> Result<(Vec<u8>, Vec<u8>)> {
            let stdout = self.outcome_for(id).map(|o| o.stdout).unwrap_or_default();
            Ok((stdout, Vec::new()))
        }

        async fn wait(&self, id: &str) -> Result<i64> {
            Ok(self.outcome_for(id).map(|o| o.exit_code).unwrap_or(0))
        }

        async fn stop(&self, _id: &str, _grace: Duration) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<()> {
            self.containers.lock().unwrap().remove(id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeRuntime, ScriptedOutcome};
    use super::*;
    use crate::manifest::Step;
    use std::collections::HashMap;

    fn step(image: &str) -> Step {
        Step {
            id: "001".to_owned(),
            name: "001 // step".to_owned(),
            image: image.to_owned(),
            entrypoint: None,
            user: None,
            workdir: "/workspace".to_owned(),
            network: false,
            mounts: vec![],
            config: serde_yaml::Value::Null,
            filter: Default::default(),
        }
    }

    #[tokio::test]
    async fn non_zero_exit_surfaces_as_step_error() {
        let mut outcomes = HashMap::new();
        outcomes.insert(
            "exit3".to_owned(),
            ScriptedOutcome {
                stdout: Vec::new(),
                exit_code: 3,
            },
        );
        let runtime = FakeRuntime::new(outcomes);
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("001.yaml");
        std::fs::write(&config_file, "").unwrap();

        let err = run_to_documents(&runtime, &step("exit3"), dir.path(), dir.path(), &config_file, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Step { .. }));
    }

    #[tokio::test]
    async fn successful_run_round_trips_documents() {
        let stdout = b"---\napiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n".to_vec();
        let mut outcomes = HashMap::new();
        outcomes.insert(
            "ok".to_owned(),
            ScriptedOutcome {
                stdout,
                exit_code: 0,
            },
        );
        let runtime = FakeRuntime::new(outcomes);
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("001.yaml");
        std::fs::write(&config_file, "").unwrap();

        let docs = run_to_documents(&runtime, &step("ok"), dir.path(), dir.path(), &config_file, vec![])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].name(), "p");
    }
}

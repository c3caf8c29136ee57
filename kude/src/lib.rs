#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Kude renders a package manifest (a `kude.yaml`) into a single, sorted,
//! reference-resolved multi-document YAML stream.
//!
//! A [`manifest::Manifest`] lists resource sources and an ordered pipeline of
//! transformation steps. [`engine::Engine`] hydrates the sources into a
//! stream of [`document::Document`]s, threads them through each
//! [`manifest::Step`], resolves cross-document references recorded via the
//! `kude.kfirs.com/previous-name` annotation, sorts the result with
//! [`sort`], and writes the stream out.

pub mod catalog;
pub mod document;
pub mod engine;
pub mod filter;
pub mod hydrate;
pub mod manifest;
pub mod sort;
pub mod step;

pub use document::Document;
pub use engine::Engine;
pub use manifest::Manifest;

/// CONTROLLER_NAME is the identifier the engine uses wherever it needs a
/// stable, human-readable name for itself (field managers, log prefixes).
pub const CONTROLLER_NAME: &str = "kude";

/// ENGINE_VERSION is the crate version: the build tag appended to step images
/// that omit one, and the value of the `KUDE_VERSION` environment variable
/// injected into step containers.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// PREVIOUS_NAME_ANNOTATION is the annotation consumed by the collector
/// (engine phase 3) to build the rename map, and by the reference resolver
/// (phase 4) to know which documents were renamed for content-addressing.
pub const PREVIOUS_NAME_ANNOTATION: &str = "kude.kfirs.com/previous-name";

/// Error is the taxonomy for every phase of a pipeline run: one variant
/// per phase, plus the external failure sources each phase can surface.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Manifest indicates `kude.yaml` was missing, malformed, or declared an
    /// unsupported `apiVersion`/`kind`.
    #[error("manifest error: {0}")]
    Manifest(String),
    /// Hydration indicates a resource source could not be fetched, decoded,
    /// or walked.
    #[error("hydration error for '{source}': {message}")]
    Hydration {
        /// Source is the resource string (path or URL) being hydrated.
        source: String,
        /// Message is the underlying cause.
        message: String,
    },
    /// Step indicates a step failed: container could not start, exited
    /// non-zero, or emitted a document missing `apiVersion`/`kind`.
    #[error("step '{step}' failed: {message}")]
    Step {
        /// Step is the id of the failing step.
        step: String,
        /// Message is the underlying cause.
        message: String,
    },
    /// Resolver indicates the reference catalog or a selector evaluation
    /// failed during reference resolution.
    #[error("resolver error: {0}")]
    Resolver(String),
    /// Io indicates some OS-level I/O error (including the final writer).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Yaml indicates a YAML (de)serialization failure.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Json indicates a JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Http indicates a remote-fetch request failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// Tokio indicates a spawned task could not be joined.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    /// TracingConfig indicates the env-filter directive string was invalid.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates installing the global subscriber failed.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Other is a catch-all for built-in and CLI-level errors.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result is the typedef used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

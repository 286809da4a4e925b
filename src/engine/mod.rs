//! Build engine boundary.
//!
//! pyimage decides what to build; turning a script into a build graph and
//! solving it belongs to an external engine. [`BuildEngine`] is that seam.
//! [`buildx::Buildx`] drives `docker buildx`, [`local::LocalContext`] reads
//! the build context from disk.

pub mod buildx;
pub mod local;

use crate::core::options::CacheImport;
use crate::core::platform::Platform;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// External engine failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("failed to read build metadata {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    #[error("i/o error talking to {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

/// Everything the engine needs besides the script text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvertOptions {
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Context paths the engine must not send
    pub excludes: Vec<String>,
    /// Platforms the build itself runs on
    pub build_platforms: Vec<Platform>,
    /// Platform to build for; `None` lets the engine pick its default
    pub target_platform: Option<Platform>,
    /// Set for multi-platform builds so results get per-platform prefixes
    pub prefix_platform: bool,
    pub cache_imports: Vec<CacheImport>,
}

/// What the engine hands back for one platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineOutput {
    pub image_config: serde_json::Value,
    pub build_info: serde_json::Value,
    /// Opaque reference to the produced filesystem or image
    pub reference: String,
}

/// An engine able to solve a build script.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Native platform of the first available worker.
    async fn default_platform(&self) -> Result<Platform, EngineError>;

    /// Convert and solve `script` for the platform in `options`.
    async fn solve(&self, script: &str, options: &ConvertOptions) -> Result<EngineOutput, EngineError>;
}

//! Build orchestration across target platforms.
//!
//! One task per platform solves the same compiled script through the
//! [`BuildEngine`]. The first failure aborts every sibling and fails the
//! whole build. Results land in per-platform slots and are aggregated in
//! input order, so completion order never shows in the output.

use crate::core::options::CacheImport;
use crate::core::platform::Platform;
use crate::engine::{BuildEngine, ConvertOptions, EngineError, EngineOutput};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::{self, JoinSet};
use tracing::{error, info};

pub const META_IMAGE_CONFIG: &str = "containerimage.config";
pub const META_BUILD_INFO: &str = "containerimage.buildinfo";
pub const META_PLATFORMS: &str = "refs.platforms";

/// Orchestration failure.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to determine the default build platform: {source}")]
    DefaultPlatform {
        #[source]
        source: EngineError,
    },

    #[error("failed to build image for {platform}: {source}")]
    Platform {
        platform: String,
        #[source]
        source: EngineError,
    },

    #[error("build task for {platform} panicked or was cancelled: {message}")]
    Task { platform: String, message: String },
}

/// Inputs of one (possibly multi-platform) build.
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    /// Rendered script text
    pub script: String,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub excludes: Vec<String>,
    /// Requested platforms; empty builds once for the engine default
    pub platforms: Vec<Platform>,
    pub cache_imports: Vec<CacheImport>,
}

/// Result of the build for one platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformBuildResult {
    /// Namespacing key, `os/arch[/variant]`
    pub id: String,
    pub platform: Platform,
    pub image_config: serde_json::Value,
    pub build_info: serde_json::Value,
    pub reference: String,
}

/// Platform entry of the `refs.platforms` metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExportPlatform<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    platform: &'a Platform,
}

/// Aggregate result of all platform builds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildOutcome {
    /// Exporter metadata; keys are suffixed `/<platform id>` for
    /// multi-platform builds
    pub metadata: IndexMap<String, serde_json::Value>,
    /// Per-platform references (multi-platform builds)
    pub refs: IndexMap<String, String>,
    /// The single reference (single-platform builds)
    pub reference: Option<String>,
    /// Per-platform results in request order
    pub platforms: Vec<PlatformBuildResult>,
}

impl BuildOutcome {
    fn aggregate(results: Vec<PlatformBuildResult>, multi: bool) -> Self {
        let mut outcome = Self::default();
        for result in &results {
            if multi {
                outcome.metadata.insert(
                    format!("{}/{}", META_IMAGE_CONFIG, result.id),
                    result.image_config.clone(),
                );
                outcome.metadata.insert(
                    format!("{}/{}", META_BUILD_INFO, result.id),
                    result.build_info.clone(),
                );
                outcome.refs.insert(result.id.clone(), result.reference.clone());
            } else {
                outcome
                    .metadata
                    .insert(META_IMAGE_CONFIG.to_string(), result.image_config.clone());
                outcome
                    .metadata
                    .insert(META_BUILD_INFO.to_string(), result.build_info.clone());
                outcome.reference = Some(result.reference.clone());
            }
        }
        if multi {
            let exported: Vec<ExportPlatform<'_>> = results
                .iter()
                .map(|r| ExportPlatform {
                    id: &r.id,
                    platform: &r.platform,
                })
                .collect();
            outcome.metadata.insert(
                META_PLATFORMS.to_string(),
                serde_json::json!({ "Platforms": exported }),
            );
        }
        outcome.platforms = results;
        outcome
    }
}

/// Build `config.script` for every requested platform in parallel.
pub async fn build(
    engine: Arc<dyn BuildEngine>,
    config: BuildConfig,
) -> Result<BuildOutcome, BuildError> {
    let start = Instant::now();
    let default_platform = engine
        .default_platform()
        .await
        .map_err(|source| BuildError::DefaultPlatform { source })?;

    let targets: Vec<Option<Platform>> = if config.platforms.is_empty() {
        vec![None]
    } else {
        config.platforms.iter().cloned().map(Some).collect()
    };
    let multi = targets.len() > 1;

    let base = ConvertOptions {
        build_args: config.build_args,
        labels: config.labels,
        excludes: config.excludes,
        build_platforms: vec![default_platform.clone()],
        target_platform: None,
        prefix_platform: multi,
        cache_imports: config.cache_imports,
    };
    let script = Arc::new(config.script);

    let mut join_set = JoinSet::new();
    let mut task_platforms: HashMap<task::Id, Platform> = HashMap::new();
    for (index, target) in targets.iter().enumerate() {
        let engine = Arc::clone(&engine);
        let script = Arc::clone(&script);
        let options = ConvertOptions {
            target_platform: target.clone(),
            ..base.clone()
        };
        let platform = target.clone().unwrap_or_else(|| default_platform.clone());

        let handle = join_set.spawn({
            let platform = platform.clone();
            async move {
                let result = engine.solve(&script, &options).await;
                (index, platform, result)
            }
        });
        task_platforms.insert(handle.id(), platform);
    }

    let mut slots: Vec<Option<PlatformBuildResult>> = vec![None; targets.len()];
    while let Some(joined) = join_set.join_next_with_id().await {
        match joined {
            Ok((_, (index, platform, Ok(output)))) => {
                info!(platform = %platform, reference = %output.reference, "platform build finished");
                slots[index] = Some(platform_result(platform, output));
            }
            Ok((_, (_, platform, Err(source)))) => {
                error!(platform = %platform, error = %source, "platform build failed, cancelling siblings");
                join_set.abort_all();
                return Err(BuildError::Platform {
                    platform: platform.to_string(),
                    source,
                });
            }
            Err(e) => {
                join_set.abort_all();
                let platform = task_platforms
                    .get(&e.id())
                    .map_or_else(|| "unknown".to_string(), Platform::to_string);
                error!(platform = %platform, error = %e, "platform build task failed, cancelling siblings");
                return Err(BuildError::Task {
                    platform,
                    message: e.to_string(),
                });
            }
        }
    }

    if let Some(missing) = slots.iter().position(Option::is_none) {
        let platform = targets[missing]
            .as_ref()
            .unwrap_or(&default_platform)
            .to_string();
        return Err(BuildError::Task {
            platform,
            message: "platform build produced no result".to_string(),
        });
    }
    let results: Vec<PlatformBuildResult> = slots.into_iter().flatten().collect();

    info!(
        platforms = results.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "build complete"
    );
    Ok(BuildOutcome::aggregate(results, multi))
}

fn platform_result(platform: Platform, output: EngineOutput) -> PlatformBuildResult {
    PlatformBuildResult {
        id: platform.to_string(),
        platform,
        image_config: output.image_config,
        build_info: output.build_info,
        reference: output.reference,
    }
}

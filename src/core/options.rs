//! Frontend option bag.
//!
//! Build engines hand frontends a flat string map. Recognised keys:
//! `filename`, `target`, `platform`, `cache-from`, `cache-imports`,
//! `build-arg:<NAME>` and `label:<NAME>`. The target can also be chosen
//! with the `PYIMAGE_TARGET` build argument (name compared
//! case-insensitively).

use super::platform::{parse_platforms, InvalidPlatform, Platform};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_FILENAME: &str = "pyproject.toml";
pub const KEY_FILENAME: &str = "filename";
pub const KEY_TARGET: &str = "target";
pub const KEY_PLATFORM: &str = "platform";
/// Legacy comma-separated registry refs
pub const KEY_CACHE_FROM: &str = "cache-from";
/// JSON array of cache import entries
pub const KEY_CACHE_IMPORTS: &str = "cache-imports";
pub const BUILD_ARG_PREFIX: &str = "build-arg:";
pub const LABEL_PREFIX: &str = "label:";
pub const TARGET_BUILD_ARG: &str = "PYIMAGE_TARGET";

/// Malformed frontend options.
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("failed to parse target platforms: {0}")]
    Platform(#[from] InvalidPlatform),

    #[error("failed to parse cache import options: {source}")]
    CacheImports {
        #[source]
        source: serde_json::Error,
    },

    #[error("option '{key}' has an empty name")]
    EmptyName { key: String },
}

/// One cache source the engine may import layers from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheImport {
    #[serde(rename = "Type", alias = "type")]
    pub kind: String,

    #[serde(rename = "Attrs", alias = "attrs", default)]
    pub attrs: BTreeMap<String, String>,
}

impl CacheImport {
    /// Registry cache at `reference`.
    pub fn registry(reference: &str) -> Self {
        Self {
            kind: "registry".to_string(),
            attrs: BTreeMap::from([("ref".to_string(), reference.to_string())]),
        }
    }
}

/// Parsed frontend options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontendOptions {
    /// Manifest file name inside the context
    pub filename: String,
    pub target: Option<String>,
    /// Requested platforms; empty means the engine default
    pub platforms: Vec<Platform>,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub cache_imports: Vec<CacheImport>,
}

impl FrontendOptions {
    pub fn parse(opts: &BTreeMap<String, String>) -> Result<Self, OptionsError> {
        let filename = opts
            .get(KEY_FILENAME)
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_FILENAME)
            .to_string();

        let build_args = prefixed(opts, BUILD_ARG_PREFIX)?;
        let labels = prefixed(opts, LABEL_PREFIX)?;

        let target = opts
            .get(KEY_TARGET)
            .or_else(|| {
                build_args
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(TARGET_BUILD_ARG))
                    .map(|(_, v)| v)
            })
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let platforms = match opts.get(KEY_PLATFORM) {
            Some(list) => parse_platforms(list)?,
            None => Vec::new(),
        };

        let cache_imports = parse_cache_imports(
            opts.get(KEY_CACHE_IMPORTS).map(String::as_str),
            opts.get(KEY_CACHE_FROM).map(String::as_str),
        )?;

        Ok(Self {
            filename,
            target,
            platforms,
            build_args,
            labels,
            cache_imports,
        })
    }
}

fn prefixed(
    opts: &BTreeMap<String, String>,
    prefix: &str,
) -> Result<BTreeMap<String, String>, OptionsError> {
    let mut out = BTreeMap::new();
    for (key, value) in opts {
        if let Some(name) = key.strip_prefix(prefix) {
            if name.is_empty() {
                return Err(OptionsError::EmptyName { key: key.clone() });
            }
            out.insert(name.to_string(), value.clone());
        }
    }
    Ok(out)
}

/// Merge `cache-imports` entries with legacy `cache-from` refs, dropping
/// repeats.
pub fn parse_cache_imports(
    imports: Option<&str>,
    cache_from: Option<&str>,
) -> Result<Vec<CacheImport>, OptionsError> {
    let entries: Vec<CacheImport> = match imports.map(str::trim).filter(|s| !s.is_empty()) {
        Some(json) => {
            serde_json::from_str(json).map_err(|source| OptionsError::CacheImports { source })?
        }
        None => Vec::new(),
    };
    let legacy = cache_from
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(CacheImport::registry);

    let mut unique: Vec<CacheImport> = Vec::with_capacity(entries.len());
    for entry in entries.into_iter().chain(legacy) {
        if !unique.contains(&entry) {
            unique.push(entry);
        }
    }
    Ok(unique)
}

//! Configuration resolution.
//!
//! Merges the project declaration with one named target's overrides into a
//! single [`ResolvedConfig`]: selects the target, solves the interpreter
//! version, computes the dependency set and infers which transports
//! (ssh, git, secret-backed index credentials) the build has to support.
//!
//! Default target rule: when no name is given, the lexicographically first
//! target wins. Manifests without targets resolve to a minimal debian
//! configuration built from the project dependencies alone.

use super::types::*;
use super::version::{self, VersionError};
use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info};

/// Label used in errors and logs when the manifest defines no targets.
pub const IMPLICIT_TARGET: &str = "default";

/// Packages added to the build dependencies per transport.
pub const SSH_CLIENT_PACKAGE: &str = "openssh-client";
pub const GIT_PACKAGE: &str = "git";
pub const URI_ESCAPE_PACKAGE: &str = "jq";

/// Read access to the build context, supplied by the caller.
pub trait ContextReader {
    /// Contents of the pinned interpreter-version file. An absent file is
    /// an empty string, not an error.
    fn pinned_python_version(&self) -> io::Result<String>;

    /// Raw lines of the lock file at `path` (relative to the context).
    fn lock_file(&self, path: &str) -> io::Result<Vec<String>>;
}

/// A context with no pin file and no readable files.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContext;

impl ContextReader for NoContext {
    fn pinned_python_version(&self) -> io::Result<String> {
        Ok(String::new())
    }

    fn lock_file(&self, path: &str) -> io::Result<Vec<String>> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no build context to read {}", path),
        ))
    }
}

/// Resolution failure. Every variant names the offending target.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown target '{target}' (available: {available})")]
    UnknownTarget { target: String, available: String },

    #[error("target '{target}': unknown flavor '{flavor}' (expected debian or alpine)")]
    UnknownFlavor { target: String, flavor: String },

    #[error("target '{target}': requirements and extras are mutually exclusive")]
    ExclusiveOptions { target: String },

    #[error("target '{target}': unknown extra '{extra}'")]
    UnknownExtra { target: String, extra: String },

    #[error("target '{target}': {source}")]
    Version {
        target: String,
        #[source]
        source: VersionError,
    },

    #[error("failed to read pinned python version: {source}")]
    PinnedVersion {
        #[source]
        source: io::Error,
    },

    #[error("target '{target}': failed to read lock file {path}: {source}")]
    LockFile {
        target: String,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("target '{target}': invalid index url '{url}': {source}")]
    InvalidIndex {
        target: String,
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("target '{target}': invalid lock file path '{path}': {reason}")]
    InvalidLockPath {
        target: String,
        path: String,
        reason: &'static str,
    },

    #[error("target '{target}': index '{url}': invalid secret id '{id}' (allowed: letters, digits, '_', '.', '-')")]
    InvalidSecretId {
        target: String,
        url: String,
        id: String,
    },

    #[error("target '{target}': {field} entry '{src}': {reason}")]
    InvalidFileSpec {
        target: String,
        field: &'static str,
        src: String,
        reason: &'static str,
    },
}

/// Transports the dependency install has to support.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    /// Some dependency is fetched with `git+ssh://`
    pub ssh: bool,
    /// Some dependency is fetched from a git repository
    pub git: bool,
    /// Some index credential is read from a build secret
    pub secrets: bool,
}

impl Transport {
    /// Scan dependency specs and index declarations.
    pub fn scan(dependencies: &[String], indices: &[PackageIndex]) -> Self {
        let ssh = dependencies.iter().any(|d| d.contains("git+ssh://"));
        Self {
            ssh,
            git: ssh || dependencies.iter().any(|d| d.contains("git+")),
            secrets: indices.iter().any(PackageIndex::uses_secrets),
        }
    }
}

/// Return `base` extended with the packages `transport` needs.
///
/// Builds a new list; `base` is never modified, and packages already
/// present are not added twice.
pub fn with_transport_packages(base: &[String], transport: Transport) -> Vec<String> {
    let mut packages: IndexSet<String> = base.iter().cloned().collect();
    let needed = [
        (transport.ssh, SSH_CLIENT_PACKAGE),
        (transport.git, GIT_PACKAGE),
        (transport.secrets, URI_ESCAPE_PACKAGE),
    ];
    for (wanted, package) in needed {
        if wanted {
            packages.insert(package.to_string());
        }
    }
    packages.into_iter().collect()
}

/// One fully merged build configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    /// Project name
    pub name: String,

    /// Selected target, `None` when the manifest defines none
    pub target: Option<String>,

    pub python_version: String,

    pub flavor: Flavor,

    pub authors: Vec<Author>,

    /// De-duplicated dependency specs (lock-file lines in lock mode)
    pub dependencies: Vec<String>,

    /// Lock file path; exclusive with `extras`
    pub requirements: Option<String>,

    pub extras: Vec<String>,

    /// Build-stage system packages, including transport packages
    pub build_deps: Vec<String>,

    pub system_deps: Vec<String>,

    pub env: BTreeMap<String, String>,

    pub labels: BTreeMap<String, String>,

    pub indices: Vec<PackageIndex>,

    pub entrypoint: Vec<String>,

    pub command: Vec<String>,

    pub copy_files: Vec<FileSpec>,

    pub add_files: Vec<FileSpec>,

    pub copy_files_before_build: Vec<FileSpec>,

    pub add_files_before_build: Vec<FileSpec>,

    pub transport: Transport,
}

impl ResolvedConfig {
    /// Target label for logs and errors.
    pub fn target_label(&self) -> &str {
        self.target.as_deref().unwrap_or(IMPLICIT_TARGET)
    }
}

/// Resolve `target` (or the default target) of `manifest`.
pub fn resolve(
    manifest: &PyProject,
    target: Option<&str>,
    ctx: &dyn ContextReader,
) -> Result<ResolvedConfig, ResolveError> {
    let project = manifest.declaration();
    let default_overrides = TargetOverride::default();
    let (name, overrides) = select_target(&manifest.tool.pyimage.target, target)?;
    let overrides = overrides.unwrap_or(&default_overrides);
    let label = name.unwrap_or(IMPLICIT_TARGET).to_string();

    let flavor = overrides
        .flavor
        .as_deref()
        .unwrap_or_default()
        .parse::<Flavor>()
        .map_err(|flavor| ResolveError::UnknownFlavor {
            target: label.clone(),
            flavor,
        })?;

    let requirements = lock_path(overrides).map(str::to_string);
    if requirements.is_some() && !overrides.extras.is_empty() {
        return Err(ResolveError::ExclusiveOptions { target: label });
    }
    if let Some(path) = &requirements {
        if let Some(reason) = lock_path_problem(path) {
            return Err(ResolveError::InvalidLockPath {
                target: label,
                path: path.clone(),
                reason,
            });
        }
    }

    let python_version = solve_python(&project.requires_python, overrides, ctx, &label)?;

    let dependencies = match &requirements {
        Some(path) => lock_dependencies(ctx, path, &label)?,
        None => manifest_dependencies(
            &project.dependencies,
            &project.optional_dependencies,
            &overrides.extras,
            &label,
        )?,
    };

    validate_indices(&overrides.indices, &label)?;
    validate_file_specs(overrides, &label)?;

    let transport = Transport::scan(&dependencies, &overrides.indices);
    let build_deps = with_transport_packages(&overrides.build_deps, transport);
    debug!(
        build_target = %label,
        ssh = transport.ssh,
        git = transport.git,
        secrets = transport.secrets,
        "inferred transports"
    );

    info!(
        build_target = %label,
        python_version = %python_version,
        flavor = %flavor,
        dependencies = dependencies.len(),
        lock_file = requirements.is_some(),
        "resolved build target"
    );

    Ok(ResolvedConfig {
        name: project.name,
        target: name.map(str::to_string),
        python_version,
        flavor,
        authors: project.authors,
        dependencies,
        requirements,
        extras: overrides.extras.clone(),
        build_deps,
        system_deps: overrides.system_deps.clone(),
        env: overrides.env.clone(),
        labels: overrides.labels.clone(),
        indices: overrides.indices.clone(),
        entrypoint: overrides.entrypoint.clone(),
        command: overrides.command.clone(),
        copy_files: overrides.copy_files.clone(),
        add_files: overrides.add_files.clone(),
        copy_files_before_build: overrides.copy_files_before_build.clone(),
        add_files_before_build: overrides.add_files_before_build.clone(),
        transport,
    })
}

/// Pick the requested target, or the lexicographically first one.
fn select_target<'a>(
    targets: &'a BTreeMap<String, TargetOverride>,
    requested: Option<&str>,
) -> Result<(Option<&'a str>, Option<&'a TargetOverride>), ResolveError> {
    match requested.map(str::trim).filter(|t| !t.is_empty()) {
        Some(name) => targets
            .get_key_value(name)
            .map(|(k, v)| (Some(k.as_str()), Some(v)))
            .ok_or_else(|| ResolveError::UnknownTarget {
                target: name.to_string(),
                available: if targets.is_empty() {
                    "none".to_string()
                } else {
                    targets.keys().cloned().collect::<Vec<_>>().join(", ")
                },
            }),
        None => Ok(targets
            .iter()
            .next()
            .map(|(k, v)| (Some(k.as_str()), Some(v)))
            .unwrap_or((None, None))),
    }
}

fn solve_python(
    constraint: &str,
    overrides: &TargetOverride,
    ctx: &dyn ContextReader,
    label: &str,
) -> Result<String, ResolveError> {
    let explicit = match overrides.python_version.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => ctx
            .pinned_python_version()
            .map_err(|source| ResolveError::PinnedVersion { source })?,
    };
    let explicit = Some(explicit.as_str()).filter(|v| !v.trim().is_empty());
    debug!(build_target = %label, constraint, explicit, "solving python version");

    version::solve(constraint, explicit).map_err(|source| ResolveError::Version {
        target: label.to_string(),
        source,
    })
}

fn lock_dependencies(
    ctx: &dyn ContextReader,
    path: &str,
    label: &str,
) -> Result<Vec<String>, ResolveError> {
    let lines = ctx.lock_file(path).map_err(|source| ResolveError::LockFile {
        target: label.to_string(),
        path: path.to_string(),
        source,
    })?;
    Ok(dedup(
        lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string),
    ))
}

fn manifest_dependencies(
    dependencies: &[String],
    groups: &IndexMap<String, Vec<String>>,
    extras: &[String],
    label: &str,
) -> Result<Vec<String>, ResolveError> {
    let mut all = dependencies.to_vec();
    for extra in extras {
        let group = groups.get(extra).ok_or_else(|| ResolveError::UnknownExtra {
            target: label.to_string(),
            extra: extra.clone(),
        })?;
        all.extend(group.iter().cloned());
    }
    Ok(dedup(all.into_iter().map(|d| d.trim().to_string())))
}

/// First occurrence wins.
fn dedup(items: impl IntoIterator<Item = String>) -> Vec<String> {
    items.into_iter().collect::<IndexSet<_>>().into_iter().collect()
}

/// The target's lock file path, with a blank value meaning none.
pub(crate) fn lock_path(overrides: &TargetOverride) -> Option<&str> {
    overrides
        .requirements
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
}

/// Why `path` cannot be bind-mounted from the build context, if it can't.
/// It must name the same file on the host and in the engine, and it ends
/// up inside a comma-separated `--mount` option.
pub(crate) fn lock_path_problem(path: &str) -> Option<&'static str> {
    if path.contains(|c: char| c == ',' || c == '"' || c == '\'' || c.is_whitespace()) {
        return Some("must not contain commas, quotes or whitespace");
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Some("must not contain '..'"),
            Component::RootDir | Component::Prefix(_) => {
                return Some("must be relative to the build context")
            }
        }
    }
    None
}

/// True when `id` can name a build secret.
pub(crate) fn is_valid_secret_id(id: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("secret id pattern is a valid regex"))
        .is_match(id)
}

/// Secret ids an index reads its credentials from.
pub(crate) fn secret_ids(index: &PackageIndex) -> impl Iterator<Item = &str> {
    [index.username_credential(), index.password_credential()]
        .into_iter()
        .filter_map(|c| match c {
            Some(Credential::Secret(id)) => Some(id),
            _ => None,
        })
}

fn validate_indices(indices: &[PackageIndex], label: &str) -> Result<(), ResolveError> {
    for index in indices {
        url::Url::parse(&index.url).map_err(|source| ResolveError::InvalidIndex {
            target: label.to_string(),
            url: index.url.clone(),
            source,
        })?;
        if let Some(id) = secret_ids(index).find(|id| !is_valid_secret_id(id)) {
            return Err(ResolveError::InvalidSecretId {
                target: label.to_string(),
                url: index.url.clone(),
                id: id.to_string(),
            });
        }
    }
    Ok(())
}

fn validate_file_specs(overrides: &TargetOverride, label: &str) -> Result<(), ResolveError> {
    let lists = [
        ("copy_files", &overrides.copy_files, false),
        ("add_files", &overrides.add_files, true),
        ("copy_files_before_build", &overrides.copy_files_before_build, false),
        ("add_files_before_build", &overrides.add_files_before_build, true),
    ];
    for (field, specs, fetchable) in lists {
        for spec in specs {
            let reason = if spec.src.trim().is_empty() || spec.dst.trim().is_empty() {
                "needs both src and dst"
            } else if spec.checksum.is_some() && !fetchable {
                "checksum is only allowed on add entries"
            } else {
                continue;
            };
            return Err(ResolveError::InvalidFileSpec {
                target: label.to_string(),
                field,
                src: spec.src.clone(),
                reason,
            });
        }
    }
    Ok(())
}

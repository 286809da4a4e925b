//! Manifest decoding and validation.
//!
//! Decodes `pyproject.toml`, normalises the project declaration (PEP 621
//! `[project]` first, `[tool.poetry]` as fallback) and validates structural
//! constraints of every build target:
//! - flavor must be known
//! - `requirements` and `extras` are mutually exclusive
//! - every requested extra must be declared
//! - version strings must parse
//! - index URLs must be absolute
//! - lock file paths must stay inside the build context
//! - secret ids are limited to letters, digits, `_`, `.` and `-`
//! - checksums are only meaningful on fetched (`add_*`) files

use super::resolver::{is_valid_secret_id, lock_path, lock_path_problem, secret_ids};
use super::types::*;
use super::version;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure to read or decode a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Decode(#[from] toml::de::Error),
}

/// Validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a manifest file from disk.
pub fn parse_manifest_file(path: &Path) -> Result<PyProject, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_manifest(&content)
}

/// Parse a manifest from a string.
pub fn parse_manifest(content: &str) -> Result<PyProject, ManifestError> {
    Ok(toml::from_str(content)?)
}

// ============================================================================
// Project declaration
// ============================================================================

/// Project-wide declarations, normalised from `[project]` or `[tool.poetry]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectDeclaration {
    pub name: String,
    pub authors: Vec<Author>,
    pub dependencies: Vec<String>,
    pub optional_dependencies: IndexMap<String, Vec<String>>,
    /// Empty means unconstrained
    pub requires_python: String,
}

impl PyProject {
    /// Normalise the project declaration.
    ///
    /// `[project]` wins whenever it names the project; otherwise a
    /// `[tool.poetry]` table is translated.
    pub fn declaration(&self) -> ProjectDeclaration {
        let project = &self.project;
        match &self.tool.poetry {
            Some(poetry) if project.name.is_empty() => poetry_declaration(poetry),
            _ => ProjectDeclaration {
                name: project.name.clone(),
                authors: project.authors.clone(),
                dependencies: project.dependencies.clone(),
                optional_dependencies: project.optional_dependencies.clone(),
                requires_python: project.requires_python.clone().unwrap_or_default(),
            },
        }
    }
}

fn poetry_declaration(poetry: &Poetry) -> ProjectDeclaration {
    let mut requires_python = String::new();
    let mut dependencies = Vec::new();
    for (name, dep) in &poetry.dependencies {
        if name == "python" {
            requires_python = dep.version().unwrap_or_default().to_string();
            continue;
        }
        dependencies.push(poetry_requirement(name, dep));
    }
    ProjectDeclaration {
        name: poetry.name.clone(),
        authors: poetry.authors.iter().map(|a| parse_author(a)).collect(),
        dependencies,
        optional_dependencies: IndexMap::new(),
        requires_python,
    }
}

/// Render a poetry dependency as a pip requirement string.
fn poetry_requirement(name: &str, dep: &PoetryDependency) -> String {
    let (extras, git, rev) = match dep {
        PoetryDependency::Version(_) => (&[][..], None, None),
        PoetryDependency::Detailed(d) => (&d.extras[..], d.git.as_deref(), d.rev.as_deref()),
    };
    let mut requirement = name.to_string();
    if !extras.is_empty() {
        requirement.push_str(&format!("[{}]", extras.join(",")));
    }
    if let Some(git) = git {
        let url = git.strip_prefix("git+").unwrap_or(git);
        requirement.push_str(&format!(" @ git+{}", url));
        if let Some(rev) = rev {
            requirement.push_str(&format!("@{}", rev));
        }
        return requirement;
    }
    if let Some(constraint) = dep.version() {
        requirement.push_str(&version::poetry_to_pep440(constraint));
    }
    requirement
}

/// Parse an RFC 5322-ish `"Name <email>"` author string.
pub fn parse_author(text: &str) -> Author {
    let text = text.trim();
    match (text.find('<'), text.strip_suffix('>')) {
        (Some(open), Some(inner)) if open < inner.len() => Author {
            name: text[..open].trim().trim_matches('"').to_string(),
            email: Some(inner[open + 1..].trim().to_string()),
        },
        _ => Author {
            name: text.to_string(),
            email: None,
        },
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Validate a parsed manifest. Returns a list of errors (empty = valid).
pub fn validate_manifest(manifest: &PyProject) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let project = manifest.declaration();

    if project.name.is_empty() {
        errors.push(ValidationError {
            message: "project name must not be empty".to_string(),
        });
    }

    if let Err(e) = version::Constraint::parse(&project.requires_python) {
        errors.push(ValidationError {
            message: format!("requires-python: {}", e),
        });
    }

    for (name, target) in &manifest.tool.pyimage.target {
        validate_target(name, target, &project, &mut errors);
    }

    errors
}

fn validate_target(
    name: &str,
    target: &TargetOverride,
    project: &ProjectDeclaration,
    errors: &mut Vec<ValidationError>,
) {
    let mut push = |message: String| {
        errors.push(ValidationError {
            message: format!("target '{}': {}", name, message),
        })
    };

    if let Some(flavor) = &target.flavor {
        if flavor.parse::<Flavor>().is_err() {
            push(format!("unknown flavor '{}' (expected debian or alpine)", flavor));
        }
    }

    if let Some(v) = &target.python_version {
        if let Err(e) = version::parse_version(v) {
            push(format!("python_version: {}", e));
        }
    }

    if let Some(path) = lock_path(target) {
        if !target.extras.is_empty() {
            push("requirements and extras are mutually exclusive".to_string());
        }
        if let Some(reason) = lock_path_problem(path) {
            push(format!("requirements '{}': {}", path, reason));
        }
    }

    for extra in &target.extras {
        if !project.optional_dependencies.contains_key(extra) {
            push(format!("unknown extra '{}'", extra));
        }
    }

    for index in &target.indices {
        if let Err(e) = url::Url::parse(&index.url) {
            push(format!("index url '{}': {}", index.url, e));
        }
        for id in secret_ids(index).filter(|id| !is_valid_secret_id(id)) {
            push(format!("index '{}': invalid secret id '{}'", index.url, id));
        }
    }

    let lists = [
        ("copy_files", &target.copy_files, false),
        ("add_files", &target.add_files, true),
        ("copy_files_before_build", &target.copy_files_before_build, false),
        ("add_files_before_build", &target.add_files_before_build, true),
    ];
    for (field, specs, fetchable) in lists {
        for spec in specs {
            if spec.src.trim().is_empty() || spec.dst.trim().is_empty() {
                push(format!("{} entry needs both src and dst", field));
            }
            if spec.checksum.is_some() && !fetchable {
                push(format!("{} entry '{}' cannot carry a checksum", field, spec.src));
            }
        }
    }
}

//! Manifest model: the typed shape of a decoded `pyproject.toml`.
//!
//! Covers the `[project]` table, the `[tool.pyimage.target.<name>]` build
//! targets and the legacy `[tool.poetry]` table used as a fallback project
//! declaration. Everything here is plain data; resolution happens in
//! [`crate::core::resolver`].

use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Top-level pyproject.toml
// ============================================================================

/// Root of a decoded manifest. Only the tables pyimage reads are modelled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PyProject {
    /// PEP 621 project metadata
    #[serde(default)]
    pub project: Project,

    /// `[tool.*]` tables
    #[serde(default)]
    pub tool: Tool,
}

/// PEP 621 `[project]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub authors: Vec<Author>,

    /// Raw requirement strings, e.g. `requests>=2.31`
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Named groups of optional dependencies ("extras")
    #[serde(default, rename = "optional-dependencies")]
    pub optional_dependencies: IndexMap<String, Vec<String>>,

    /// Interpreter constraint, e.g. `>=3.8,<3.12`
    #[serde(default, rename = "requires-python")]
    pub requires_python: Option<String>,
}

/// A project author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.email {
            Some(email) if self.name.is_empty() => write!(f, "<{}>", email),
            Some(email) => write!(f, "{} <{}>", self.name, email),
            None => write!(f, "{}", self.name),
        }
    }
}

/// The `[tool]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(default)]
    pub pyimage: PyImageTool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poetry: Option<Poetry>,
}

/// `[tool.pyimage]` table holding the named build targets.
///
/// Targets live in a `BTreeMap` so iteration (and default target
/// selection) is lexicographic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PyImageTool {
    #[serde(default)]
    pub target: BTreeMap<String, TargetOverride>,
}

// ============================================================================
// Targets
// ============================================================================

/// A named bundle of build overrides. Every field is optional; absence
/// means "inherit the default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetOverride {
    /// Base image family (`debian` or `alpine`)
    #[serde(default)]
    pub flavor: Option<String>,

    /// Explicit interpreter version, e.g. `3.11`
    #[serde(default)]
    pub python_version: Option<String>,

    /// Lock file path, relative to the build context
    #[serde(default)]
    pub requirements: Option<String>,

    /// Optional-dependency groups to install
    #[serde(default)]
    pub extras: Vec<String>,

    #[serde(default, alias = "environment")]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// System packages needed only while installing dependencies
    #[serde(default)]
    pub build_deps: Vec<String>,

    /// System packages installed into the runtime image
    #[serde(default)]
    pub system_deps: Vec<String>,

    #[serde(default)]
    pub indices: Vec<PackageIndex>,

    #[serde(default)]
    pub entrypoint: Vec<String>,

    #[serde(default)]
    pub command: Vec<String>,

    /// Copied into the runtime image
    #[serde(default)]
    pub copy_files: Vec<FileSpec>,

    /// Fetched into the runtime image
    #[serde(default)]
    pub add_files: Vec<FileSpec>,

    /// Copied into the builder before dependencies are installed
    #[serde(default)]
    pub copy_files_before_build: Vec<FileSpec>,

    /// Fetched into the builder before dependencies are installed
    #[serde(default)]
    pub add_files_before_build: Vec<FileSpec>,
}

/// An extra package index.
///
/// A `*_secret` field names a build secret and always wins over the
/// plaintext field for the same credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageIndex {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<String>,

    /// Pass the index host to `--trusted-host`
    #[serde(default)]
    pub trust: bool,
}

impl PackageIndex {
    /// Effective username source, secret first.
    pub fn username_credential(&self) -> Option<Credential<'_>> {
        Credential::pick(self.username_secret.as_deref(), self.username.as_deref())
    }

    /// Effective password source, secret first.
    pub fn password_credential(&self) -> Option<Credential<'_>> {
        Credential::pick(self.password_secret.as_deref(), self.password.as_deref())
    }

    /// True when any credential of this index is read from a build secret.
    pub fn uses_secrets(&self) -> bool {
        matches!(self.username_credential(), Some(Credential::Secret(_)))
            || matches!(self.password_credential(), Some(Credential::Secret(_)))
    }
}

/// Where a credential value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    /// Build secret identifier
    Secret(&'a str),
    /// Literal value from the manifest
    Plain(&'a str),
}

impl<'a> Credential<'a> {
    fn pick(secret: Option<&'a str>, plain: Option<&'a str>) -> Option<Self> {
        let non_blank = |s: &&str| !s.trim().is_empty();
        secret
            .filter(non_blank)
            .map(Self::Secret)
            .or_else(|| plain.filter(non_blank).map(Self::Plain))
    }
}

/// A file copy or fetch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub src: String,
    pub dst: String,

    /// Expected digest of a fetched source (`ADD --checksum=`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

// ============================================================================
// Flavor
// ============================================================================

/// Base-image family. Governs image tags, package-manager syntax and
/// user-creation syntax.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flavor {
    #[default]
    Debian,
    Alpine,
}

impl Flavor {
    /// Tag suffix of the official python images for this flavor.
    pub fn image_tag(&self) -> &'static str {
        match self {
            Self::Debian => "slim",
            Self::Alpine => "alpine",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debian => write!(f, "debian"),
            Self::Alpine => write!(f, "alpine"),
        }
    }
}

impl FromStr for Flavor {
    type Err = String;

    /// Empty input selects the default flavor.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "debian" => Ok(Self::Debian),
            "alpine" => Ok(Self::Alpine),
            other => Err(other.to_string()),
        }
    }
}

// ============================================================================
// Poetry fallback
// ============================================================================

/// Legacy `[tool.poetry]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Poetry {
    #[serde(default)]
    pub name: String,

    /// `"Name <email>"` strings
    #[serde(default)]
    pub authors: Vec<String>,

    /// Package name to constraint; the `python` key holds the interpreter
    /// constraint.
    #[serde(default)]
    pub dependencies: IndexMap<String, PoetryDependency>,
}

/// A poetry dependency value, either `"^1.2"` or `{ version = "^1.2", ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PoetryDependency {
    Version(String),
    Detailed(DetailedDependency),
}

/// Table form of a poetry dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetailedDependency {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

impl PoetryDependency {
    /// Version constraint, if the dependency carries one.
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::Version(v) => Some(v),
            Self::Detailed(d) => d.version.as_deref(),
        }
    }
}

// Decoded by inspecting the TOML value's shape so a table without
// `version` or `git` gets a precise error instead of an untagged mismatch.
impl<'de> Deserialize<'de> for PoetryDependency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = toml::Value::deserialize(deserializer)?;
        match value {
            toml::Value::String(s) => Ok(Self::Version(s)),
            toml::Value::Table(table) => {
                let text = |key: &str| -> Result<Option<String>, D::Error> {
                    match table.get(key) {
                        None => Ok(None),
                        Some(toml::Value::String(s)) => Ok(Some(s.clone())),
                        Some(other) => Err(de::Error::custom(format!(
                            "`{}` must be a string, got {}",
                            key,
                            other.type_str()
                        ))),
                    }
                };
                let extras = match table.get("extras") {
                    None => Vec::new(),
                    Some(toml::Value::Array(items)) => items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                    Some(other) => {
                        return Err(de::Error::custom(format!(
                            "`extras` must be an array, got {}",
                            other.type_str()
                        )))
                    }
                };
                let detailed = DetailedDependency {
                    version: text("version")?,
                    git: text("git")?,
                    rev: text("rev")?,
                    extras,
                };
                if detailed.version.is_none() && detailed.git.is_none() {
                    return Err(de::Error::custom("version field is required"));
                }
                Ok(Self::Detailed(detailed))
            }
            other => Err(de::Error::custom(format!(
                "expected string or table, got {}",
                other.type_str()
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Target platforms in `os/arch[/variant]` form.
//!
//! Architecture names are normalised the way image registries expect:
//! `x86_64` is `amd64`, `aarch64` is `arm64`, bare `arm` is `arm/v7`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const KNOWN_OS: &[&str] = &["linux", "windows", "darwin", "freebsd", "netbsd", "openbsd", "illumos", "solaris"];

/// A platform string that cannot be understood.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid platform '{input}': {reason}")]
pub struct InvalidPlatform {
    pub input: String,
    pub reason: String,
}

/// Operating system, CPU architecture and optional variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        let (architecture, variant) = normalize_arch(&architecture.to_lowercase(), variant);
        Self {
            os: normalize_os(&os.to_lowercase()),
            architecture,
            variant,
        }
    }

    /// Native platform of this machine. Images are always linux images,
    /// so only the architecture is taken from the host.
    pub fn host() -> Self {
        Self::new("linux", std::env::consts::ARCH, None)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = InvalidPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim().to_lowercase();
        let invalid = |reason: &str| InvalidPlatform {
            input: s.trim().to_string(),
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = input.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty component"));
        }
        if let Some(bad) = parts
            .iter()
            .find(|p| !p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        {
            return Err(invalid(&format!("unexpected characters in '{}'", bad)));
        }

        match parts.as_slice() {
            [single] if KNOWN_OS.contains(&normalize_os(single).as_str()) => {
                let host = Self::host();
                Ok(Self {
                    os: normalize_os(single),
                    ..host
                })
            }
            [arch] => Ok(Self::new("linux", arch, None)),
            [os, arch] => Ok(Self::new(os, arch, None)),
            [os, arch, variant] => Ok(Self::new(os, arch, Some(variant))),
            _ => Err(invalid("expected os/arch[/variant]")),
        }
    }
}

/// Parse a comma-separated platform list. Blank entries are skipped and
/// repeated platforms keep their first position.
pub fn parse_platforms(list: &str) -> Result<Vec<Platform>, InvalidPlatform> {
    let mut platforms: Vec<Platform> = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let platform: Platform = entry.parse()?;
        if !platforms.contains(&platform) {
            platforms.push(platform);
        }
    }
    Ok(platforms)
}

fn normalize_os(os: &str) -> String {
    match os {
        "macos" => "darwin".to_string(),
        other => other.to_string(),
    }
}

fn normalize_arch(arch: &str, variant: Option<&str>) -> (String, Option<String>) {
    let variant = variant.map(str::to_lowercase);
    let (arch, variant) = match (arch, variant.as_deref()) {
        ("x86_64" | "x86-64" | "amd64", Some("v1")) => ("amd64", None),
        ("x86_64" | "x86-64" | "amd64", v) => ("amd64", v.map(str::to_string)),
        ("aarch64" | "arm64", Some("8" | "v8") | None) => ("arm64", None),
        ("aarch64" | "arm64", Some(v)) => ("arm64", Some(v.to_string())),
        ("armhf", _) => ("arm", Some("v7".to_string())),
        ("armel", _) => ("arm", Some("v6".to_string())),
        ("arm", None) => ("arm", Some("v7".to_string())),
        ("arm", Some(v @ ("5" | "6" | "7" | "8"))) => ("arm", Some(format!("v{}", v))),
        ("arm", Some(v)) => ("arm", Some(v.to_string())),
        ("i386" | "i686" | "x86" | "386", _) => ("386", None),
        (other, v) => (other, v.map(str::to_string)),
    };
    (arch.to_string(), variant)
}

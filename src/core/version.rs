//! Interpreter-version constraints and solving.
//!
//! Supports the PEP 440 comparison operators (`==`, `!=`, `>=`, `<=`, `>`,
//! `<`, `~=`, `===`, trailing `.*` wildcards) plus the poetry shorthands
//! `^X.Y` and `~X.Y`. Clauses are separated by commas or whitespace.
//! Versions are compared as `semver::Version` after padding missing
//! components with zero, so `3.11` orders as `3.11.0`.

use regex::Regex;
use semver::Version;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Interpreter versions tried, most preferred first, when a target does
/// not pin one.
pub const PREFERRED_VERSIONS: &[&str] = &["3.13", "3.12", "3.11", "3.10", "3.9", "3.8", "3.7", "3.6"];

/// Version parsing or solving failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("version '{version}' is not valid: {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("constraint '{constraint}' is not valid: {reason}")]
    InvalidConstraint { constraint: String, reason: String },

    #[error("version {version} does not satisfy the constraint {constraint}")]
    Mismatch { version: String, constraint: String },

    #[error("no known interpreter version satisfies the constraint {constraint}")]
    Unsatisfiable { constraint: String },
}

/// Comparison operator of a single clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    /// `~=`
    Compatible,
    /// poetry `^`
    Caret,
    /// poetry `~`
    Tilde,
}

impl Op {
    fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "" | "=" | "==" | "===" => Self::Eq,
            "!=" => Self::Ne,
            ">=" => Self::Ge,
            "<=" => Self::Le,
            ">" => Self::Gt,
            "<" => Self::Lt,
            "~=" => Self::Compatible,
            "^" => Self::Caret,
            "~" => Self::Tilde,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Clause {
    op: Op,
    /// Release components as written (1 to 3 of them)
    release: Vec<u64>,
    wildcard: bool,
}

impl Clause {
    fn allows(&self, v: &Version) -> bool {
        let bound = pad(&self.release);
        match self.op {
            Op::Eq if self.wildcard => has_prefix(v, &self.release),
            Op::Eq => *v == bound,
            Op::Ne if self.wildcard => !has_prefix(v, &self.release),
            Op::Ne => *v != bound,
            Op::Ge => *v >= bound,
            Op::Le => *v <= bound,
            Op::Gt => *v > bound,
            Op::Lt => *v < bound,
            Op::Compatible => {
                *v >= bound && has_prefix(v, &self.release[..self.release.len() - 1])
            }
            Op::Caret => *v >= bound && *v < pad(&caret_upper(&self.release)),
            Op::Tilde => *v >= bound && *v < pad(&tilde_upper(&self.release)),
        }
    }
}

/// A parsed set of clauses; a version must satisfy all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    raw: String,
    clauses: Vec<Clause>,
}

impl Constraint {
    /// Parse a constraint expression. Empty input or `*` allows everything.
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        let raw = first_line(text).to_string();
        let invalid = |reason: String| VersionError::InvalidConstraint {
            constraint: raw.clone(),
            reason,
        };

        let mut clauses = Vec::new();
        for token in clause_tokens(&raw) {
            if token == "*" {
                continue;
            }
            let caps = clause_pattern()
                .captures(&token)
                .ok_or_else(|| invalid(format!("cannot parse clause '{}'", token)))?;
            let op = Op::parse(caps.name("op").map_or("", |m| m.as_str()))
                .ok_or_else(|| invalid(format!("unknown operator in '{}'", token)))?;
            let release = parse_release(&caps["release"])
                .map_err(|reason| invalid(format!("'{}': {}", token, reason)))?;
            let wildcard = caps.name("wildcard").is_some();

            if wildcard && !matches!(op, Op::Eq | Op::Ne) {
                return Err(invalid(format!("wildcard not allowed in '{}'", token)));
            }
            if op == Op::Compatible && release.len() < 2 {
                return Err(invalid(format!("'{}' needs at least two components", token)));
            }
            clauses.push(Clause { op, release, wildcard });
        }

        Ok(Self { raw, clauses })
    }

    /// True when `version` satisfies every clause.
    pub fn allows(&self, version: &Version) -> bool {
        self.clauses.iter().all(|c| c.allows(version))
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.raw)
        }
    }
}

/// Parse an interpreter version such as `3.11` or `3.11.4`.
pub fn parse_version(text: &str) -> Result<Version, VersionError> {
    let text = first_line(text);
    parse_release(text.strip_prefix('v').unwrap_or(text))
        .map(|release| pad(&release))
        .map_err(|reason| VersionError::InvalidVersion {
            version: text.to_string(),
            reason,
        })
}

/// Pick the interpreter version for a constraint.
///
/// An explicit candidate must satisfy the constraint; otherwise the first
/// entry of [`PREFERRED_VERSIONS`] that satisfies it wins. Only the first
/// line of each input is considered so version files with trailing
/// newlines work unchanged.
pub fn solve(constraint: &str, explicit: Option<&str>) -> Result<String, VersionError> {
    let constraint = Constraint::parse(constraint)?;

    if let Some(candidate) = explicit.map(first_line).filter(|c| !c.is_empty()) {
        let version = parse_version(candidate)?;
        if constraint.allows(&version) {
            return Ok(candidate.to_string());
        }
        return Err(VersionError::Mismatch {
            version: candidate.to_string(),
            constraint: constraint.to_string(),
        });
    }

    for candidate in PREFERRED_VERSIONS {
        let version = parse_version(candidate)?;
        if constraint.allows(&version) {
            return Ok(candidate.to_string());
        }
    }

    Err(VersionError::Unsatisfiable {
        constraint: constraint.to_string(),
    })
}

/// Translate a poetry constraint into a pip requirement suffix.
///
/// `^2.31` becomes `>=2.31,<3.0`, `~1.4` becomes `>=1.4,<1.5`, a bare
/// version becomes `==X`, `*` becomes nothing. PEP 440 clauses pass
/// through untouched, as does anything that cannot be parsed.
pub fn poetry_to_pep440(constraint: &str) -> String {
    let translate = |piece: &str| -> String {
        let (upper, rest): (fn(&[u64]) -> Vec<u64>, &str) =
            if let Some(rest) = piece.strip_prefix('^') {
                (caret_upper, rest)
            } else if let Some(rest) = piece.strip_prefix('~').filter(|r| !r.starts_with('=')) {
                (tilde_upper, rest)
            } else if piece.starts_with(|c: char| c.is_ascii_digit()) {
                return format!("=={}", piece);
            } else {
                return piece.to_string();
            };
        match parse_release(rest.trim()) {
            Ok(release) => format!(">={},<{}", render(&release), render(&upper(&release))),
            Err(_) => piece.to_string(),
        }
    };

    constraint
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty() && *p != "*")
        .map(translate)
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Helpers
// ============================================================================

fn clause_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<op>===|==|!=|~=|>=|<=|>|<|\^|~|=)?\s*v?(?P<release>[0-9]+(?:\.[0-9]+)*)(?P<wildcard>\.\*)?$")
            .expect("clause pattern is a valid regex")
    })
}

/// Split a constraint into clause tokens, re-attaching operators that
/// were separated from their version by whitespace.
fn clause_tokens(raw: &str) -> Vec<String> {
    let is_operator = |t: &str| t.chars().all(|c| "=<>!~^".contains(c));
    let mut tokens = Vec::new();
    for piece in raw.split(',') {
        let mut pending = String::new();
        for word in piece.split_whitespace() {
            pending.push_str(word);
            if !is_operator(word) {
                tokens.push(std::mem::take(&mut pending));
            }
        }
        if !pending.is_empty() {
            tokens.push(pending);
        }
    }
    tokens
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}

fn parse_release(text: &str) -> Result<Vec<u64>, String> {
    if text.is_empty() {
        return Err("empty version".to_string());
    }
    let release = text
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| format!("component '{}' is not a number", part))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if release.len() > 3 {
        return Err("at most three components are supported".to_string());
    }
    Ok(release)
}

fn pad(release: &[u64]) -> Version {
    let at = |i: usize| release.get(i).copied().unwrap_or(0);
    Version::new(at(0), at(1), at(2))
}

fn has_prefix(v: &Version, prefix: &[u64]) -> bool {
    [v.major, v.minor, v.patch]
        .iter()
        .zip(prefix)
        .all(|(a, b)| a == b)
}

/// Exclusive upper bound of `^release`: bump the first non-zero component.
fn caret_upper(release: &[u64]) -> Vec<u64> {
    let idx = release
        .iter()
        .position(|&c| c != 0)
        .unwrap_or(release.len() - 1);
    let mut upper = release[..=idx].to_vec();
    upper[idx] += 1;
    if upper.len() < 2 {
        upper.push(0);
    }
    upper
}

/// Exclusive upper bound of `~release`: bump minor, or major when only
/// the major is given.
fn tilde_upper(release: &[u64]) -> Vec<u64> {
    match release {
        [major] => vec![major + 1, 0],
        [major, minor, ..] => vec![*major, minor + 1],
        [] => vec![0, 1],
    }
}

fn render(release: &[u64]) -> String {
    release
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

//! Builder stage: install dependencies and the project into `/root/.local`.

use super::{packages, shell_quote, value_quote, StageWriter};
use crate::core::codegen::{CompileError, Instruction, Keyword, Stage};
use crate::core::resolver::ResolvedConfig;
use crate::core::types::{Credential, PackageIndex};
use indexmap::IndexSet;
use std::collections::BTreeMap;
use url::{Position, Url};

/// Environment set in the builder before anything is installed. User
/// values win on key collision.
pub const DEFAULT_ENV: [(&str, &str); 4] = [
    ("PIP_DISABLE_PIP_VERSION_CHECK", "1"),
    ("PIP_NO_WARN_SCRIPT_LOCATION", "0"),
    ("PIP_USER", "1"),
    ("PYTHONPYCACHEPREFIX", "$HOME/.pycache"),
];

pub const PIP_CACHE_MOUNT: &str = "--mount=type=cache,target=/root/.cache";
pub const SSH_MOUNT: &str = "--mount=type=ssh,required=true";
/// Where a lock file is bind-mounted for `pip install -r`.
pub const LOCK_MOUNT_TARGET: &str = "/tmp/requirements.txt";
pub const PROJECT_DIR: &str = "/projectdir";

const GIT_SSH_COMMAND: &str = "GIT_SSH_COMMAND='ssh -o StrictHostKeyChecking=no'";

/// Drops test suites, strips shared objects and removes bytecode from the
/// installed tree.
const CLEANUP: &str = "find /root/.local/lib/python*/ -name 'tests' -exec rm -r '{}' + && \
find /root/.local/lib/python*/site-packages/ -name '*.so' -exec sh -c 'file \"{}\" | grep -q \"not stripped\" && strip -s \"{}\"' \\; && \
find /root/.local/lib/python*/ -type f -name '*.pyc' -delete && \
find /root/.local/lib/python*/ -type d -name '__pycache__' -delete";

/// Render the builder stage.
pub fn instructions(config: &ResolvedConfig) -> Result<Vec<Instruction>, CompileError> {
    let mut w = StageWriter::new(Stage::Builder);

    w.push(
        Keyword::From,
        format!(
            "docker.io/python:{}-{} AS builder",
            config.python_version,
            config.flavor.image_tag()
        ),
    );

    if let Some(run) = packages::build_install(config.flavor, &config.build_deps) {
        w.push(Keyword::Run, run);
    }

    let mut env: BTreeMap<&str, &str> = DEFAULT_ENV.into_iter().collect();
    env.extend(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    for (key, value) in env {
        w.push(Keyword::Env, format!("{}={}", key, value_quote(value)));
    }

    w.file_operations(&config.copy_files_before_build, &config.add_files_before_build);

    if let Some(run) = install_dependencies(config)? {
        w.push(Keyword::Run, run);
    }

    w.push(Keyword::Copy, format!(". {}", PROJECT_DIR));
    w.push(
        Keyword::Run,
        format!(
            "{} python -m pip install --user --no-deps {}",
            PIP_CACHE_MOUNT, PROJECT_DIR
        ),
    );
    w.push(
        Keyword::Run,
        format!("{} && {}", packages::strip_tools_install(config.flavor), CLEANUP),
    );

    Ok(w.finish())
}

/// `RUN` arguments for the dependency install; `None` when there is
/// nothing to install.
fn install_dependencies(config: &ResolvedConfig) -> Result<Option<String>, CompileError> {
    let lock = config.requirements.as_deref();
    if lock.is_none() && config.dependencies.is_empty() {
        return Ok(None);
    }

    let mut parts = vec![PIP_CACHE_MOUNT.to_string()];
    if let Some(path) = lock {
        parts.push(format!(
            "--mount=type=bind,source={},target={}",
            path, LOCK_MOUNT_TARGET
        ));
    }
    for id in secret_ids(&config.indices) {
        parts.push(format!("--mount=type=secret,id={}", id));
    }
    if config.transport.ssh {
        parts.push(SSH_MOUNT.to_string());
        parts.push(GIT_SSH_COMMAND.to_string());
    }

    parts.push("python -m pip install --user --retries 2".to_string());
    for index in &config.indices {
        parts.push(index_args(index, config.target_label())?);
    }

    match lock {
        Some(_) => parts.push(format!("-r {}", LOCK_MOUNT_TARGET)),
        None => parts.extend(config.dependencies.iter().map(|d| shell_quote(d))),
    }

    Ok(Some(parts.join(" ")))
}

/// Secret identifiers referenced by index credentials, in declaration
/// order, without repeats.
fn secret_ids(indices: &[PackageIndex]) -> IndexSet<&str> {
    indices
        .iter()
        .flat_map(|i| [i.username_credential(), i.password_credential()])
        .filter_map(|c| match c {
            Some(Credential::Secret(id)) => Some(id),
            _ => None,
        })
        .collect()
}

/// Shell expression reading a secret and URI-escaping it at build time.
fn secret_expression(id: &str) -> String {
    format!("$(tr -d '\\n' < /run/secrets/{} | jq -sRr @uri)", id)
}

/// A piece of a rendered index URL.
enum Piece {
    Literal(String),
    Secret(String),
}

/// `--extra-index-url` (and `--trusted-host`) arguments for one index.
///
/// Plaintext credentials are percent-encoded into the URL. Secret-backed
/// credentials become command substitutions, which forces double quoting;
/// otherwise the URL is single-quoted.
fn index_args(index: &PackageIndex, target: &str) -> Result<String, CompileError> {
    let invalid = |reason: String| CompileError::IndexUrl {
        target: target.to_string(),
        url: index.url.clone(),
        reason,
    };
    let mut url = Url::parse(&index.url).map_err(|e| invalid(e.to_string()))?;
    let user = index.username_credential();
    let password = index.password_credential();

    if let Some(Credential::Plain(name)) = user {
        url.set_username(name)
            .map_err(|()| invalid("url cannot carry credentials".to_string()))?;
    }
    if let Some(Credential::Plain(secret)) = password {
        url.set_password(Some(secret))
            .map_err(|()| invalid("url cannot carry credentials".to_string()))?;
    }

    let mut pieces = vec![Piece::Literal(format!("{}://", url.scheme()))];
    match user {
        Some(Credential::Secret(id)) => pieces.push(Piece::Secret(secret_expression(id))),
        Some(Credential::Plain(_)) => pieces.push(Piece::Literal(url.username().to_string())),
        None => {}
    }
    match password {
        Some(Credential::Secret(id)) => {
            pieces.push(Piece::Literal(":".to_string()));
            pieces.push(Piece::Secret(secret_expression(id)));
        }
        Some(Credential::Plain(_)) => {
            pieces.push(Piece::Literal(format!(":{}", url.password().unwrap_or_default())));
        }
        None => {}
    }
    if user.is_some() || password.is_some() {
        pieces.push(Piece::Literal("@".to_string()));
    }
    pieces.push(Piece::Literal(url[Position::BeforeHost..].to_string()));

    let rendered = if index.uses_secrets() {
        let mut quoted = String::from('"');
        for piece in &pieces {
            match piece {
                Piece::Secret(expr) => quoted.push_str(expr),
                Piece::Literal(text) => quoted.push_str(&escape_double_quoted(text)),
            }
        }
        quoted.push('"');
        quoted
    } else {
        let plain: String = pieces
            .iter()
            .map(|p| match p {
                Piece::Literal(text) | Piece::Secret(text) => text.as_str(),
            })
            .collect();
        shell_quote(&plain)
    };

    let mut args = format!("--extra-index-url {}", rendered);
    if index.trust {
        let host = &url[Position::BeforeHost..Position::AfterPort];
        args.push_str(&format!(" --trusted-host {}", shell_quote(host)));
    }
    Ok(args)
}

fn escape_double_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '$' | '`' | '\\' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

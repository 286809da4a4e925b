//! Script compilation: render a [`ResolvedConfig`] into a two-stage build
//! script.
//!
//! Compilation is pure. The builder stage comes first, then the runtime
//! stage; each stage's instructions are produced by [`crate::stages`] in a
//! fixed order so the engine can reuse cached layers across builds.

use super::expand::ExpandError;
use super::resolver::ResolvedConfig;
use crate::stages;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Script rendering failure.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("target '{target}': {field}: {source}")]
    Placeholder {
        target: String,
        field: String,
        #[source]
        source: ExpandError,
    },

    #[error("target '{target}': invalid index url '{url}': {reason}")]
    IndexUrl {
        target: String,
        url: String,
        reason: String,
    },
}

/// Inputs to compilation that are not part of the resolved configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Build parameters substituted into runtime env and label values
    pub placeholders: BTreeMap<String, String>,
}

/// Script stage an instruction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Builder,
    Runtime,
}

/// Build-script instruction keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Keyword {
    From,
    Run,
    Env,
    Copy,
    Add,
    User,
    Entrypoint,
    Cmd,
    Label,
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::From => "FROM",
            Self::Run => "RUN",
            Self::Env => "ENV",
            Self::Copy => "COPY",
            Self::Add => "ADD",
            Self::User => "USER",
            Self::Entrypoint => "ENTRYPOINT",
            Self::Cmd => "CMD",
            Self::Label => "LABEL",
        };
        write!(f, "{}", s)
    }
}

/// One stage-tagged instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instruction {
    pub stage: Stage,
    pub keyword: Keyword,
    pub args: String,
}

impl Instruction {
    pub fn new(stage: Stage, keyword: Keyword, args: impl Into<String>) -> Self {
        Self {
            stage,
            keyword,
            args: args.into(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.keyword, self.args)
    }
}

/// Ordered, stage-tagged instruction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledScript {
    pub instructions: Vec<Instruction>,
}

impl CompiledScript {
    /// Instructions of one stage, in order.
    pub fn stage(&self, stage: Stage) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter().filter(move |i| i.stage == stage)
    }

    /// Script text handed to the build engine.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Content digest of the rendered script, `"blake3:{hex}"`.
    pub fn digest(&self) -> String {
        format!("blake3:{}", blake3::hash(self.render().as_bytes()).to_hex())
    }
}

impl fmt::Display for CompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut previous = None;
        for instruction in &self.instructions {
            if previous.is_some_and(|stage| stage != instruction.stage) {
                writeln!(f)?;
            }
            writeln!(f, "{}", instruction)?;
            previous = Some(instruction.stage);
        }
        Ok(())
    }
}

/// Compile a resolved configuration into a build script.
pub fn compile(
    config: &ResolvedConfig,
    options: &CompileOptions,
) -> Result<CompiledScript, CompileError> {
    let mut instructions = stages::builder::instructions(config)?;
    instructions.extend(stages::runtime::instructions(config, &options.placeholders)?);
    let script = CompiledScript { instructions };

    debug!(
        build_target = config.target_label(),
        instructions = script.instructions.len(),
        digest = %script.digest(),
        "compiled build script"
    );
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_manifest;
    use crate::core::resolver::{resolve, NoContext};
    use crate::core::types::{Flavor, PackageIndex};
    use proptest::prelude::*;

    fn config(src: &str, target: Option<&str>) -> ResolvedConfig {
        resolve(&parse_manifest(src).unwrap(), target, &NoContext).unwrap()
    }

    const MANIFEST: &str = r#"
[project]
name = "svc"
authors = [{ name = "Ada", email = "ada@example.com" }, { name = "Bob" }]
dependencies = ["requests>=2.31"]
requires-python = ">=3.8,<3.12"

[tool.pyimage.target.api]
entrypoint = ["svc", "serve"]
command = ["--port", "8080"]
system_deps = ["libpq5"]
build_deps = ["gcc"]
env = { APP_VERSION = "${VERSION:-dev}" }
labels = { "org.opencontainers.image.version" = "$VERSION" }
"#;

    #[test]
    fn test_compile_stage_order() {
        let cfg = config(MANIFEST, Some("api"));
        let script = compile(&cfg, &CompileOptions::default()).unwrap();
        let first_builder = script.instructions.first().unwrap();
        assert_eq!(first_builder.stage, Stage::Builder);
        assert_eq!(first_builder.keyword, Keyword::From);
        let first_runtime = script.stage(Stage::Runtime).next().unwrap();
        assert_eq!(first_runtime.keyword, Keyword::From);
        // builder precedes runtime, never interleaved
        let stages: Vec<Stage> = script.instructions.iter().map(|i| i.stage).collect();
        let split = stages.iter().position(|s| *s == Stage::Runtime).unwrap();
        assert!(stages[..split].iter().all(|s| *s == Stage::Builder));
        assert!(stages[split..].iter().all(|s| *s == Stage::Runtime));
    }

    #[test]
    fn test_compile_render_separates_stages() {
        let cfg = config(MANIFEST, Some("api"));
        let text = compile(&cfg, &CompileOptions::default()).unwrap().render();
        assert!(text.starts_with("FROM docker.io/python:3.11-slim AS builder\n"));
        assert!(text.contains("\n\nFROM docker.io/python:3.11-slim\n"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_compile_entrypoint_and_command() {
        let cfg = config(MANIFEST, Some("api"));
        let text = compile(&cfg, &CompileOptions::default()).unwrap().render();
        assert!(text.contains("ENTRYPOINT [\"svc\",\"serve\"]\n"));
        assert!(text.contains("CMD [\"--port\",\"8080\"]\n"));
    }

    #[test]
    fn test_compile_no_entrypoint_when_unset() {
        let cfg = config("[project]\nname = \"bare\"\n", None);
        let text = compile(&cfg, &CompileOptions::default()).unwrap().render();
        assert!(!text.contains("ENTRYPOINT"));
        assert!(!text.contains("CMD"));
        assert!(!text.contains("org.opencontainers.image.authors"));
    }

    #[test]
    fn test_compile_placeholders() {
        let cfg = config(MANIFEST, Some("api"));
        let options = CompileOptions {
            placeholders: BTreeMap::from([("VERSION".to_string(), "1.2.0".to_string())]),
        };
        let text = compile(&cfg, &options).unwrap().render();
        assert!(text.contains("ENV APP_VERSION=\"1.2.0\"\n"));
        assert!(text.contains("LABEL org.opencontainers.image.version=\"1.2.0\"\n"));

        let text = compile(&cfg, &CompileOptions::default()).unwrap().render();
        assert!(text.contains("ENV APP_VERSION=\"dev\"\n"));
    }

    #[test]
    fn test_compile_bad_placeholder_names_field() {
        let mut cfg = config(MANIFEST, Some("api"));
        cfg.labels.insert("broken".to_string(), "${VERSION".to_string());
        let err = compile(&cfg, &CompileOptions::default()).unwrap_err();
        assert!(err.to_string().contains("label 'broken'"));
    }

    #[test]
    fn test_compile_authors_label() {
        let cfg = config(MANIFEST, Some("api"));
        let text = compile(&cfg, &CompileOptions::default()).unwrap().render();
        assert!(text.contains("LABEL org.opencontainers.image.authors=\"Ada <ada@example.com>, Bob\"\n"));
    }

    #[test]
    fn test_compile_alpine_flavor_both_stages() {
        let mut cfg = config(MANIFEST, Some("api"));
        cfg.flavor = Flavor::Alpine;
        let script = compile(&cfg, &CompileOptions::default()).unwrap();
        let text = script.render();
        assert!(text.contains("FROM docker.io/python:3.11-alpine AS builder\n"));
        assert!(text.contains("FROM docker.io/python:3.11-alpine\n"));
        assert!(!text.contains("-slim"));
        assert!(!text.contains("apt-get"));
        let builder_runs: Vec<_> = script
            .stage(Stage::Builder)
            .filter(|i| i.args.contains("apk add --update-cache 'gcc'"))
            .collect();
        let runtime_runs: Vec<_> = script
            .stage(Stage::Runtime)
            .filter(|i| i.args.contains("apk add"))
            .collect();
        assert_eq!(builder_runs.len(), 1);
        assert_eq!(runtime_runs.len(), 1);
        assert!(text.contains("adduser -D -u 65532"));
    }

    #[test]
    fn test_compile_debian_flavor_both_stages() {
        let cfg = config(MANIFEST, Some("api"));
        let script = compile(&cfg, &CompileOptions::default()).unwrap();
        let text = script.render();
        assert!(!text.contains("alpine"));
        assert!(!text.contains("apk "));
        assert!(script
            .stage(Stage::Builder)
            .any(|i| i.args.contains("apt-get install")));
        assert!(script
            .stage(Stage::Runtime)
            .any(|i| i.args.contains("apt-get install")));
        assert!(text.contains("useradd --uid=65532"));
    }

    #[test]
    fn test_compile_secret_password_never_rendered() {
        let mut cfg = config(MANIFEST, Some("api"));
        cfg.indices.push(PackageIndex {
            url: "https://pypi.example.com/simple".to_string(),
            username: Some("deploy".to_string()),
            password: Some("hunter2".to_string()),
            password_secret: Some("pypi_token".to_string()),
            ..Default::default()
        });
        let text = compile(&cfg, &CompileOptions::default()).unwrap().render();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("--mount=type=secret,id=pypi_token"));
        assert!(text.contains("/run/secrets/pypi_token"));
    }

    #[test]
    fn test_compile_digest_format() {
        let cfg = config(MANIFEST, Some("api"));
        let digest = compile(&cfg, &CompileOptions::default()).unwrap().digest();
        assert!(digest.starts_with("blake3:"));
        assert_eq!(digest.len(), "blake3:".len() + 64);
    }

    #[test]
    fn test_compile_does_not_mutate_config() {
        let cfg = config(MANIFEST, Some("api"));
        let before = cfg.clone();
        let first = compile(&cfg, &CompileOptions::default()).unwrap();
        let second = compile(&cfg, &CompileOptions::default()).unwrap();
        assert_eq!(cfg, before);
        assert_eq!(first, second);
    }

    #[test]
    fn test_instruction_json_shape() {
        let i = Instruction::new(Stage::Runtime, Keyword::User, "65532:65532");
        let json = serde_json::to_value(&i).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"stage": "runtime", "keyword": "USER", "args": "65532:65532"})
        );
    }

    proptest! {
        #[test]
        fn prop_compile_is_deterministic(
            deps in proptest::collection::vec("[a-z]{1,8}", 0..6),
            env in proptest::collection::btree_map("[A-Z]{1,6}", "[a-z0-9]{0,6}", 0..4),
            alpine in any::<bool>(),
        ) {
            let mut cfg = config(MANIFEST, Some("api"));
            cfg.dependencies = deps;
            cfg.env = env;
            cfg.flavor = if alpine { Flavor::Alpine } else { Flavor::Debian };
            let a = compile(&cfg, &CompileOptions::default()).unwrap();
            let b = compile(&cfg.clone(), &CompileOptions::default()).unwrap();
            prop_assert_eq!(a.render(), b.render());
            prop_assert_eq!(a.digest(), b.digest());
        }
    }
}

//! End to end: manifest on disk → resolve → compile → multi-platform build.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use pyimage::core::codegen::{compile, CompileOptions, Stage};
use pyimage::core::executor::{build, BuildConfig, BuildError};
use pyimage::core::options::FrontendOptions;
use pyimage::core::parser::parse_manifest_file;
use pyimage::core::platform::Platform;
use pyimage::core::resolver::resolve;
use pyimage::engine::local::LocalContext;
use pyimage::engine::{BuildEngine, ConvertOptions, EngineError, EngineOutput};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MANIFEST: &str = r#"
[project]
name = "billing"
requires-python = ">=3.8,<3.12"
authors = [{ name = "Ops", email = "ops@example.com" }]
dependencies = ["fastapi", "internal-lib @ git+ssh://git@example.com/org/lib.git"]

[project.optional-dependencies]
metrics = ["prometheus-client"]

[tool.pyimage.target.api]
extras = ["metrics"]
entrypoint = ["uvicorn", "billing:app"]
labels = { "org.opencontainers.image.version" = "${VERSION:-dev}" }

[[tool.pyimage.target.api.indices]]
url = "https://pypi.example.com/simple"
username = "ci"
password = "hunter2"
password_secret = "pypi_token"

[tool.pyimage.target.locked]
flavor = "alpine"
requirements = "requirements.lock"
"#;

struct RecordingEngine {
    scripts: Mutex<Vec<(Option<Platform>, String)>>,
    slow: &'static str,
}

#[async_trait]
impl BuildEngine for RecordingEngine {
    async fn default_platform(&self) -> Result<Platform, EngineError> {
        Ok(Platform::new("linux", "amd64", None))
    }

    async fn solve(&self, script: &str, options: &ConvertOptions) -> Result<EngineOutput, EngineError> {
        let id = options
            .target_platform
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default();
        if id == self.slow {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.scripts
            .lock()
            .unwrap()
            .push((options.target_platform.clone(), script.to_string()));
        Ok(EngineOutput {
            image_config: serde_json::json!({ "os": "linux", "id": id }),
            build_info: serde_json::json!({}),
            reference: format!("sha256:{}", id.replace('/', "-")),
        })
    }
}

fn write_context() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("pyproject.toml"), MANIFEST).unwrap();
    std::fs::write(dir.path().join(".python-version"), "3.10\n").unwrap();
    std::fs::write(
        dir.path().join("requirements.lock"),
        "# generated\nfastapi==0.110.0\n\nuvicorn==0.29.0\nfastapi==0.110.0\n",
    )
    .unwrap();
    std::fs::write(dir.path().join(".dockerignore"), ".git\n.venv\n").unwrap();
    dir
}

#[tokio::test]
async fn test_manifest_to_multi_platform_build() {
    let dir = write_context();
    let context = LocalContext::new(dir.path());

    let frontend = FrontendOptions::parse(&BTreeMap::from([
        ("platform".to_string(), "linux/amd64,linux/arm64".to_string()),
        ("build-arg:PYIMAGE_TARGET".to_string(), "api".to_string()),
        ("build-arg:VERSION".to_string(), "1.4.0".to_string()),
    ]))
    .unwrap();

    let manifest = parse_manifest_file(&dir.path().join(&frontend.filename)).unwrap();
    let config = resolve(&manifest, frontend.target.as_deref(), &context).unwrap();
    assert_eq!(config.target.as_deref(), Some("api"));
    assert_eq!(config.python_version, "3.10");
    assert_eq!(
        config.dependencies,
        vec![
            "fastapi",
            "internal-lib @ git+ssh://git@example.com/org/lib.git",
            "prometheus-client",
        ]
    );

    let script = compile(
        &config,
        &CompileOptions {
            placeholders: frontend.build_args.clone(),
        },
    )
    .unwrap();
    let text = script.render();
    assert!(text.starts_with("FROM docker.io/python:3.10-slim AS builder\n"));
    assert!(text.contains("--mount=type=secret,id=pypi_token"));
    assert!(text.contains("--mount=type=ssh,required=true"));
    assert!(!text.contains("hunter2"));
    assert!(text.contains("LABEL org.opencontainers.image.version=\"1.4.0\""));
    assert_eq!(
        script.stage(Stage::Runtime).next().map(|i| i.to_string()),
        Some("FROM docker.io/python:3.10-slim".to_string())
    );

    let engine = Arc::new(RecordingEngine {
        scripts: Mutex::new(Vec::new()),
        slow: "linux/amd64",
    });
    let outcome = build(
        engine.clone(),
        BuildConfig {
            script: text.clone(),
            build_args: frontend.build_args,
            labels: frontend.labels,
            excludes: context.ignore_patterns().unwrap(),
            platforms: frontend.platforms,
            cache_imports: frontend.cache_imports,
        },
    )
    .await
    .unwrap();

    let ids: Vec<&str> = outcome.platforms.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["linux/amd64", "linux/arm64"]);
    assert_eq!(outcome.refs["linux/arm64"], "sha256:linux-arm64");
    assert_eq!(outcome.metadata["containerimage.config/linux/amd64"]["id"], "linux/amd64");
    assert!(engine.scripts.lock().unwrap().iter().all(|(_, s)| *s == text));
}

#[test]
fn test_lock_file_target_is_deterministic() {
    let dir = write_context();
    let context = LocalContext::new(dir.path());
    let manifest = parse_manifest_file(&dir.path().join("pyproject.toml")).unwrap();

    let first = resolve(&manifest, Some("locked"), &context).unwrap();
    let second = resolve(&manifest, Some("locked"), &context).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.dependencies, vec!["fastapi==0.110.0", "uvicorn==0.29.0"]);

    let a = compile(&first, &CompileOptions::default()).unwrap();
    let b = compile(&second, &CompileOptions::default()).unwrap();
    assert_eq!(a.render(), b.render());
    assert_eq!(a.digest(), b.digest());
    assert!(a.render().contains("python:3.10-alpine"));
    assert!(a
        .render()
        .contains("--mount=type=bind,source=requirements.lock,target=/tmp/requirements.txt"));
}

#[test]
fn test_default_target_is_first_by_name() {
    let dir = write_context();
    let context = LocalContext::new(dir.path());
    let manifest = parse_manifest_file(&dir.path().join("pyproject.toml")).unwrap();
    let config = resolve(&manifest, None, &context).unwrap();
    assert_eq!(config.target.as_deref(), Some("api"));
}

struct FailingEngine;

#[async_trait]
impl BuildEngine for FailingEngine {
    async fn default_platform(&self) -> Result<Platform, EngineError> {
        Err(EngineError::Other("no builder available".to_string()))
    }

    async fn solve(&self, _script: &str, _options: &ConvertOptions) -> Result<EngineOutput, EngineError> {
        unreachable!("solve must not run without a default platform")
    }
}

#[tokio::test]
async fn test_default_platform_failure_aborts_build() {
    let err = build(Arc::new(FailingEngine), BuildConfig::default()).await.unwrap_err();
    assert!(matches!(err, BuildError::DefaultPlatform { .. }));
    let err: pyimage::Error = err.into();
    assert!(err.to_string().contains("no builder available"));
}

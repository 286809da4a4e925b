//! `docker buildx build` as the build engine.
//!
//! The script is piped on stdin (`--file -`); results are read back from
//! the `--metadata-file` buildx writes. buildx applies the context's
//! ignore file itself, so exclude patterns are not forwarded.

use super::{BuildEngine, ConvertOptions, EngineError, EngineOutput};
use crate::core::options::CacheImport;
use crate::core::platform::Platform;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Lines of engine stderr kept in error messages.
const STDERR_TAIL: usize = 20;

/// Invocation settings for `docker buildx`.
#[derive(Debug, Clone)]
pub struct BuildxOptions {
    /// Executable, usually `docker`
    pub program: String,
    /// Build context directory
    pub context: PathBuf,
    /// Named buildx builder instance
    pub builder: Option<String>,
    /// `--secret` specs, e.g. `id=pypi,src=token.txt`
    pub secrets: Vec<String>,
    /// `--ssh` specs, e.g. `default`
    pub ssh: Vec<String>,
    pub tags: Vec<String>,
    /// `--output` specs
    pub outputs: Vec<String>,
    pub progress: Option<String>,
}

impl Default for BuildxOptions {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            context: PathBuf::from("."),
            builder: None,
            secrets: Vec::new(),
            ssh: Vec::new(),
            tags: Vec::new(),
            outputs: Vec::new(),
            progress: None,
        }
    }
}

/// Engine backed by a buildx subprocess per platform.
#[derive(Debug, Clone)]
pub struct Buildx {
    opts: BuildxOptions,
}

impl Buildx {
    pub fn new(opts: BuildxOptions) -> Self {
        Self { opts }
    }

    /// Arguments of one `buildx build` invocation.
    pub fn command_args(&self, options: &ConvertOptions, metadata_file: &Path) -> Vec<String> {
        let mut args = vec!["buildx".to_string(), "build".to_string()];
        if let Some(builder) = &self.opts.builder {
            args.extend(["--builder".to_string(), builder.clone()]);
        }
        args.extend([
            "--file".to_string(),
            "-".to_string(),
            "--metadata-file".to_string(),
            metadata_file.display().to_string(),
        ]);
        if let Some(progress) = &self.opts.progress {
            args.extend(["--progress".to_string(), progress.clone()]);
        }
        if let Some(platform) = &options.target_platform {
            args.extend(["--platform".to_string(), platform.to_string()]);
        }
        for (key, value) in &options.build_args {
            args.extend(["--build-arg".to_string(), format!("{}={}", key, value)]);
        }
        for (key, value) in &options.labels {
            args.extend(["--label".to_string(), format!("{}={}", key, value)]);
        }
        for import in &options.cache_imports {
            args.extend(["--cache-from".to_string(), cache_spec(import)]);
        }
        for secret in &self.opts.secrets {
            args.extend(["--secret".to_string(), secret.clone()]);
        }
        for ssh in &self.opts.ssh {
            args.extend(["--ssh".to_string(), ssh.clone()]);
        }
        for tag in &self.opts.tags {
            let tag = match (&options.target_platform, options.prefix_platform) {
                (Some(platform), true) => platform_tag(tag, platform),
                _ => tag.clone(),
            };
            args.extend(["--tag".to_string(), tag]);
        }
        for output in &self.opts.outputs {
            args.extend(["--output".to_string(), output.clone()]);
        }
        args.push(self.opts.context.display().to_string());
        args
    }

    fn inspect_args(&self) -> Vec<String> {
        let mut args = vec!["buildx".to_string(), "inspect".to_string()];
        if let Some(builder) = &self.opts.builder {
            args.push(builder.clone());
        }
        args
    }
}

#[async_trait]
impl BuildEngine for Buildx {
    async fn default_platform(&self) -> Result<Platform, EngineError> {
        let output = Command::new(&self.opts.program)
            .args(self.inspect_args())
            .stdin(Stdio::null())
            .output()
            .await;
        let platform = match output {
            Ok(out) if out.status.success() => {
                first_platform(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                warn!(status = %out.status, "buildx inspect failed, using host platform");
                None
            }
            Err(e) => {
                warn!(error = %e, "cannot run buildx inspect, using host platform");
                None
            }
        };
        Ok(platform.unwrap_or_else(Platform::host))
    }

    async fn solve(&self, script: &str, options: &ConvertOptions) -> Result<EngineOutput, EngineError> {
        let program = self.opts.program.clone();
        let io_error = |source| EngineError::Io {
            program: program.clone(),
            source,
        };

        let metadata = tempfile::NamedTempFile::new().map_err(io_error)?;
        let args = self.command_args(options, metadata.path());
        let platform = options
            .target_platform
            .as_ref()
            .map_or_else(|| "default".to_string(), Platform::to_string);
        info!(platform = %platform, "starting buildx build");
        debug!(args = ?args, "buildx command line");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Other(format!("{} stdin unavailable", program)))?;
        stdin.write_all(script.as_bytes()).await.map_err(io_error)?;
        drop(stdin);

        let output = child.wait_with_output().await.map_err(io_error)?;
        if !output.status.success() {
            return Err(EngineError::Failed {
                program,
                status: output.status.to_string(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL),
            });
        }

        let raw = tokio::fs::read_to_string(metadata.path())
            .await
            .map_err(|e| EngineError::Metadata {
                path: metadata.path().to_path_buf(),
                reason: e.to_string(),
            })?;
        let result = parse_metadata(&raw).map_err(|reason| EngineError::Metadata {
            path: metadata.path().to_path_buf(),
            reason,
        })?;
        info!(platform = %platform, reference = %result.reference, "buildx build finished");
        Ok(result)
    }
}

/// `--cache-from` value for an import entry.
fn cache_spec(import: &CacheImport) -> String {
    let mut spec = format!("type={}", import.kind);
    for (key, value) in &import.attrs {
        spec.push_str(&format!(",{}={}", key, value));
    }
    spec
}

/// Per-platform tag for multi-platform builds: `app:1.0` becomes
/// `app:1.0-linux-arm64`.
fn platform_tag(tag: &str, platform: &Platform) -> String {
    let suffix = platform.to_string().replace('/', "-");
    let name_end = tag.rfind('/').map_or(0, |i| i + 1);
    if tag[name_end..].contains(':') {
        format!("{}-{}", tag, suffix)
    } else {
        format!("{}:{}", tag, suffix)
    }
}

/// First platform listed by `buildx inspect`.
fn first_platform(inspect: &str) -> Option<Platform> {
    inspect
        .lines()
        .filter_map(|l| l.trim().strip_prefix("Platforms:"))
        .flat_map(|list| list.split(','))
        .map(|p| p.trim().trim_end_matches('*'))
        .find(|p| !p.is_empty())
        .and_then(|p| p.parse().ok())
}

/// Map the buildx metadata file onto an [`EngineOutput`].
fn parse_metadata(raw: &str) -> Result<EngineOutput, String> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let object = value
        .as_object()
        .ok_or_else(|| "metadata is not a JSON object".to_string())?;
    let field = |key: &str| object.get(key).cloned().unwrap_or(serde_json::Value::Null);
    let reference = ["containerimage.digest", "buildx.build.ref"]
        .iter()
        .find_map(|key| object.get(*key).and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string();
    Ok(EngineOutput {
        image_config: field("containerimage.descriptor"),
        build_info: field("buildx.build.provenance"),
        reference,
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn engine() -> Buildx {
        Buildx::new(BuildxOptions {
            context: PathBuf::from("/src/app"),
            builder: Some("ci".to_string()),
            secrets: vec!["id=pypi,src=/tmp/token".to_string()],
            ssh: vec!["default".to_string()],
            tags: vec!["registry.local/app:1.0".to_string()],
            ..Default::default()
        })
    }

    #[test]
    fn test_command_args_single_platform() {
        let options = ConvertOptions {
            build_args: BTreeMap::from([("VERSION".to_string(), "1.0".to_string())]),
            labels: BTreeMap::from([("team".to_string(), "billing".to_string())]),
            cache_imports: vec![CacheImport::registry("registry.local/app:cache")],
            ..Default::default()
        };
        let args = engine().command_args(&options, Path::new("/tmp/meta.json"));
        assert_eq!(
            args,
            vec![
                "buildx", "build", "--builder", "ci", "--file", "-", "--metadata-file",
                "/tmp/meta.json", "--build-arg", "VERSION=1.0", "--label", "team=billing",
                "--cache-from", "type=registry,ref=registry.local/app:cache", "--secret",
                "id=pypi,src=/tmp/token", "--ssh", "default", "--tag", "registry.local/app:1.0",
                "/src/app",
            ]
        );
    }

    #[test]
    fn test_command_args_multi_platform_tags() {
        let options = ConvertOptions {
            target_platform: Some("linux/arm64".parse().unwrap()),
            prefix_platform: true,
            ..Default::default()
        };
        let args = engine().command_args(&options, Path::new("/tmp/meta.json"));
        let platform = args.iter().position(|a| a == "--platform").unwrap();
        assert_eq!(args[platform + 1], "linux/arm64");
        let tag = args.iter().position(|a| a == "--tag").unwrap();
        assert_eq!(args[tag + 1], "registry.local/app:1.0-linux-arm64");
    }

    #[test]
    fn test_platform_tag_without_version() {
        let platform: Platform = "linux/arm/v7".parse().unwrap();
        assert_eq!(platform_tag("localhost:5000/app", &platform), "localhost:5000/app:linux-arm-v7");
    }

    #[test]
    fn test_first_platform() {
        let inspect = "Name:   ci\nDriver: docker-container\n\nNodes:\nName:      ci0\nPlatforms: linux/arm64*, linux/amd64, linux/arm/v7\n";
        assert_eq!(first_platform(inspect).unwrap().to_string(), "linux/arm64");
        assert!(first_platform("Name: x\n").is_none());
    }

    #[test]
    fn test_parse_metadata() {
        let raw = r#"{
            "buildx.build.ref": "ci/ci0/abc",
            "containerimage.digest": "sha256:1234",
            "containerimage.descriptor": {"mediaType": "application/vnd.oci.image.manifest.v1+json", "size": 1}
        }"#;
        let out = parse_metadata(raw).unwrap();
        assert_eq!(out.reference, "sha256:1234");
        assert_eq!(out.image_config["size"], 1);
        assert!(out.build_info.is_null());
    }

    #[test]
    fn test_parse_metadata_errors() {
        assert!(parse_metadata("not json").is_err());
        assert!(parse_metadata("[1, 2]").is_err());
        assert_eq!(parse_metadata("{}").unwrap().reference, "");
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("only", 5), "only");
    }

    #[tokio::test]
    async fn test_spawn_failure_reported() {
        let engine = Buildx::new(BuildxOptions {
            program: "/nonexistent/docker".to_string(),
            ..Default::default()
        });
        let err = engine.solve("FROM scratch\n", &ConvertOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));

        let platform = engine.default_platform().await.unwrap();
        assert_eq!(platform, Platform::host());
    }
}

//! CLI subcommands: validate, config, build.

use crate::core::codegen::{self, CompileOptions, CompiledScript};
use crate::core::executor::{self, BuildConfig};
use crate::core::options::{self, FrontendOptions};
use crate::core::{parser, resolver, types};
use crate::engine::buildx::{Buildx, BuildxOptions};
use crate::engine::local::LocalContext;
use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate pyproject.toml and resolve every build target
    Validate {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Print the resolved configuration of a target as JSON
    Config {
        #[command(flatten)]
        source: SourceArgs,

        /// Target to resolve (default: first target by name)
        #[arg(short, long, env = "PYIMAGE_TARGET")]
        target: Option<String>,
    },

    /// Compile a target and build it with docker buildx
    Build(BuildArgs),
}

/// Where the manifest lives.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Manifest file name, relative to the context directory
    #[arg(short, long, default_value = options::DEFAULT_FILENAME)]
    pub filename: String,

    /// Build context directory
    #[arg(short = 'C', long, default_value = ".")]
    pub context: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Target to build (default: first target by name)
    #[arg(short, long, env = "PYIMAGE_TARGET")]
    pub target: Option<String>,

    /// Print the compiled build script
    #[arg(long)]
    pub print_script: bool,

    /// Print the stage-tagged instruction list and its digest as JSON
    #[arg(long)]
    pub print_graph: bool,

    /// Print the resolved configuration as JSON
    #[arg(long)]
    pub print_config: bool,

    /// Run the build (default: only when nothing is printed)
    #[arg(long)]
    pub build: Option<bool>,

    /// Comma-separated target platforms, e.g. linux/amd64,linux/arm64
    #[arg(long)]
    pub platform: Option<String>,

    /// Build argument, KEY=VALUE (repeatable)
    #[arg(long = "build-arg", value_parser = parse_key_val)]
    pub build_args: Vec<(String, String)>,

    /// Image label, KEY=VALUE (repeatable)
    #[arg(long = "label", value_parser = parse_key_val)]
    pub labels: Vec<(String, String)>,

    /// Registry cache reference (repeatable)
    #[arg(long)]
    pub cache_from: Vec<String>,

    /// JSON array of cache import entries
    #[arg(long)]
    pub cache_imports: Option<String>,

    /// Secret passed to the engine, e.g. id=pypi,src=token.txt (repeatable)
    #[arg(long)]
    pub secret: Vec<String>,

    /// SSH agent socket or key passed to the engine (repeatable)
    #[arg(long)]
    pub ssh: Vec<String>,

    /// Image name and tag (repeatable)
    #[arg(long)]
    pub tag: Vec<String>,

    /// Output destination (repeatable)
    #[arg(long)]
    pub output: Vec<String>,

    /// buildx builder instance
    #[arg(long)]
    pub builder: Option<String>,

    /// buildx progress mode (auto, plain, tty)
    #[arg(long)]
    pub progress: Option<String>,
}

impl BuildArgs {
    /// Engine-style option map equivalent to these flags.
    pub fn frontend_options(&self) -> BTreeMap<String, String> {
        let mut opts = BTreeMap::new();
        opts.insert(options::KEY_FILENAME.to_string(), self.source.filename.clone());
        if let Some(target) = &self.target {
            opts.insert(options::KEY_TARGET.to_string(), target.clone());
        }
        if let Some(platform) = &self.platform {
            opts.insert(options::KEY_PLATFORM.to_string(), platform.clone());
        }
        if !self.cache_from.is_empty() {
            opts.insert(options::KEY_CACHE_FROM.to_string(), self.cache_from.join(","));
        }
        if let Some(imports) = &self.cache_imports {
            opts.insert(options::KEY_CACHE_IMPORTS.to_string(), imports.clone());
        }
        for (key, value) in &self.build_args {
            opts.insert(format!("{}{}", options::BUILD_ARG_PREFIX, key), value.clone());
        }
        for (key, value) in &self.labels {
            opts.insert(format!("{}{}", options::LABEL_PREFIX, key), value.clone());
        }
        opts
    }

    fn should_build(&self) -> bool {
        self.build
            .unwrap_or(!(self.print_script || self.print_graph || self.print_config))
    }
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Validate { source } => cmd_validate(&source),
        Commands::Config { source, target } => cmd_config(&source, target.as_deref()),
        Commands::Build(args) => cmd_build(args).await,
    }
}

fn load_manifest(source: &SourceArgs) -> Result<(types::PyProject, LocalContext)> {
    let context = LocalContext::new(&source.context);
    let path = context.root().join(&source.filename);
    let manifest = parser::parse_manifest_file(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let errors = parser::validate_manifest(&manifest);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        bail!("{} validation error(s) in {}", errors.len(), path.display());
    }
    Ok((manifest, context))
}

fn cmd_validate(source: &SourceArgs) -> Result<()> {
    let (manifest, context) = load_manifest(source)?;
    let declaration = manifest.declaration();

    let targets: Vec<Option<&str>> = if manifest.tool.pyimage.target.is_empty() {
        vec![None]
    } else {
        manifest.tool.pyimage.target.keys().map(|k| Some(k.as_str())).collect()
    };
    for target in &targets {
        let config = resolver::resolve(&manifest, *target, &context)?;
        codegen::compile(&config, &CompileOptions::default())?;
        println!(
            "  {}: python {} ({})",
            config.target_label(),
            config.python_version,
            config.flavor
        );
    }
    println!("OK: {} ({} target(s))", declaration.name, targets.len());
    Ok(())
}

fn cmd_config(source: &SourceArgs, target: Option<&str>) -> Result<()> {
    let (manifest, context) = load_manifest(source)?;
    let config = resolver::resolve(&manifest, target, &context)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn graph_json(script: &CompiledScript) -> serde_json::Value {
    serde_json::json!({
        "digest": script.digest(),
        "instructions": script.instructions,
    })
}

async fn cmd_build(args: BuildArgs) -> Result<()> {
    let frontend = FrontendOptions::parse(&args.frontend_options())?;
    let source = SourceArgs {
        filename: frontend.filename.clone(),
        ..args.source.clone()
    };
    let (manifest, context) = load_manifest(&source)?;

    let config = resolver::resolve(&manifest, frontend.target.as_deref(), &context)?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    let script = codegen::compile(
        &config,
        &CompileOptions {
            placeholders: frontend.build_args.clone(),
        },
    )?;
    if args.print_script {
        print!("{}", script);
    }
    if args.print_graph {
        println!("{}", serde_json::to_string_pretty(&graph_json(&script))?);
    }
    if !args.should_build() {
        return Ok(());
    }

    let excludes = context
        .ignore_patterns()
        .with_context(|| format!("failed to read ignore file in {}", context.root().display()))?;
    let engine = Arc::new(Buildx::new(BuildxOptions {
        context: source.context.clone(),
        builder: args.builder.clone(),
        secrets: args.secret.clone(),
        ssh: args.ssh.clone(),
        tags: args.tag.clone(),
        outputs: args.output.clone(),
        progress: args.progress.clone(),
        ..BuildxOptions::default()
    }));

    info!(
        build_target = config.target_label(),
        digest = %script.digest(),
        platforms = frontend.platforms.len(),
        "starting build"
    );
    let outcome = executor::build(
        engine,
        BuildConfig {
            script: script.render(),
            build_args: frontend.build_args,
            labels: frontend.labels,
            excludes,
            platforms: frontend.platforms,
            cache_imports: frontend.cache_imports,
        },
    )
    .await?;

    for result in &outcome.platforms {
        println!("{}  {}", result.id, result.reference);
    }
    Ok(())
}

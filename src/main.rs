//! pyimage CLI: pyproject.toml targets to multi-platform container images.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pyimage",
    version,
    about = "Compile pyproject.toml build targets into container build scripts and build them per platform"
)]
struct Cli {
    /// Enable debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: pyimage::cli::Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("pyimage=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    if let Err(e) = pyimage::cli::dispatch(cli.command).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

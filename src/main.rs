//! ptxsmoke CLI
//!
//! Main entry point for the `ptxsmoke` command. With no subcommand it runs
//! the smoke test.

use clap::{Parser, Subcommand};
use miette::Result;
use ptxsmoke::gpu::{BackendChoice, GpuRuntime};
use ptxsmoke::{SmokeConfig, SmokeError};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "ptxsmoke")]
#[command(author = "Demetrios Chiuratto Agourakis, Dionisio Chiuratto Agourakis")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "GPU toolchain smoke test: print test.ptx, then run add(2, 7) on the device", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// PTX file to print (default: test.ptx)
    #[arg(long, value_name = "FILE")]
    ptx: Option<PathBuf>,

    /// Fail with a non-zero exit status instead of skipping a step
    #[arg(long)]
    strict: bool,

    /// GPU backend
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendChoice>,

    /// Device ordinal
    #[arg(long, value_name = "N", global = true)]
    device: Option<u32>,

    /// Config file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the PTX of the built-in kernels
    Emit {
        /// Output file (default: stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Target compute capability, e.g. 75 or 8.6
        #[arg(long, value_name = "XY")]
        sm: Option<String>,
    },

    /// Show the selected backend and device
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; logs never go to stdout
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = resolve_config(&cli)?;

    match cli.command {
        None => smoke(config),
        Some(Commands::Emit { output, sm }) => emit(&config, output.as_deref(), sm.as_deref()),
        Some(Commands::Info) => info(&config),
    }
}

fn resolve_config(cli: &Cli) -> Result<SmokeConfig, SmokeError> {
    let mut config = match &cli.config {
        Some(path) => SmokeConfig::load(path)?,
        None => SmokeConfig::default(),
    };

    if let Some(ptx) = &cli.ptx {
        config.ptx_path = ptx.clone();
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(device) = cli.device {
        config.device = device;
    }
    if cli.strict {
        config.strict = true;
    }
    Ok(config)
}

fn smoke(config: SmokeConfig) -> Result<()> {
    tracing::info!(path = %config.ptx_path.display(), backend = %config.backend, "running smoke test");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let outcome = ptxsmoke::run(config, &mut out)?;

    tracing::debug!(?outcome, "smoke test finished");
    Ok(())
}

fn emit(config: &SmokeConfig, output: Option<&Path>, sm: Option<&str>) -> Result<()> {
    let compute_capability = match sm {
        Some(sm) => ptxsmoke::config::parse_compute_capability(sm)
            .ok_or_else(|| SmokeError::ComputeCapability(sm.to_string()))?,
        None => config.compute_capability,
    };

    let ptx = ptxsmoke::emit_ptx(compute_capability)?;

    match output {
        Some(path) => {
            std::fs::write(path, &ptx).map_err(|source| SmokeError::WriteFile {
                path: path.to_path_buf(),
                source,
            })?;
            tracing::info!(path = %path.display(), bytes = ptx.len(), "wrote PTX");
        }
        None => {
            let mut out = std::io::stdout().lock();
            out.write_all(ptx.as_bytes())
                .and_then(|()| out.flush())
                .map_err(SmokeError::Output)?;
        }
    }

    Ok(())
}

fn info(config: &SmokeConfig) -> Result<()> {
    println!("ptxsmoke {}", ptxsmoke::VERSION);
    println!();
    println!("Backends:");
    #[cfg(feature = "cuda")]
    println!("  - CUDA (enabled)");
    #[cfg(not(feature = "cuda"))]
    println!("  - CUDA (disabled)");
    println!("  - Simulated (enabled)");
    println!();

    let runtime = GpuRuntime::select(config.backend, config.device).map_err(SmokeError::from)?;
    println!("Selected: {} device {}", runtime.backend(), runtime.device_id());
    println!("{}", runtime.device_info());

    Ok(())
}

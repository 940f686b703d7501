//! Sketchrun CLI
//!
//! Serves the `POST /run` API, or runs a single sketch from the command line.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sketchrun::config::BackendKind;
use sketchrun::sandbox::validate_mounts;
use sketchrun::{Config, EXAMPLE_CONFIG, Executor, JobQueue, Report, api, preflight, prepare_cgroup};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sketchrun")]
#[command(about = "Compile and run Arduino-style sketches in bounded sandboxes")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Listen address (overrides server.bind)
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Compile and run one sketch, printing the response body
    Run {
        /// Sketch file
        #[arg(value_name = "FILE")]
        sketch: PathBuf,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path (default: sketchrun.toml)
        #[arg(short, long, default_value = "sketchrun.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Commands::Init { output, force } = &cli.command {
        return init_config(output, *force).await;
    }

    if let Some(path) = &cli.config {
        info!(?path, "loading configuration");
    } else {
        debug!("using default configuration with environment overrides");
    }
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Serve { bind } => {
            prepare_host(&mut config).await?;
            let bind = match bind {
                Some(bind) => bind,
                None => config.server.bind_addr().context("invalid server.bind")?,
            };
            api::serve(&config, bind)
                .await
                .context("server failed")
        }
        Commands::Run { sketch } => {
            prepare_host(&mut config).await?;
            run_sketch(&config, &sketch).await
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
        Commands::Init { .. } => Ok(()),
    }
}

/// Check host support for the configured sandbox.
///
/// The isolate backend degrades to RLIMIT_AS without cgroups; the process
/// backend refuses to start rather than run sketches outside the jail.
async fn prepare_host(config: &mut Config) -> Result<()> {
    preflight(config).await.context("refusing to start")?;

    if config.backend == BackendKind::Isolate {
        if config.isolate.cgroup {
            match prepare_cgroup(&config.isolate.cg_root) {
                Ok(true) => debug!("cgroup hierarchy ready"),
                Ok(false) => {
                    warn!(
                        "cgroup support unavailable (memory controller not found), falling back to RLIMIT_AS"
                    );
                    config.isolate.cgroup = false;
                }
                Err(e) => {
                    warn!("cgroup setup failed: {e}, falling back to RLIMIT_AS memory limiting");
                    config.isolate.cgroup = false;
                }
            }
        }
        validate_mounts(&config.isolate.mounts).context("invalid isolate mounts")?;
    }

    Ok(())
}

async fn run_sketch(config: &Config, sketch: &Path) -> Result<()> {
    let code = tokio::fs::read_to_string(sketch)
        .await
        .with_context(|| format!("failed to read sketch '{}'", sketch.display()))?;

    let queue = JobQueue::new(Executor::new(config), &config.pool);
    let result = queue.submit(&code).await;
    let report = Report::from_result(&result);

    // Keep stdout clean for piping; the verdict goes through tracing
    println!("{}", serde_json::to_string_pretty(&report.body)?);
    info!(kind = %result.kind, status = %report.status, "sketch finished");

    if result.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn show_config(config: &Config) {
    println!("Backend: {:?}", config.backend);
    println!("Scratch root: {}", config.scratch_root.display());
    println!();
    println!("Server:");
    println!("  Bind: {}", config.server.bind);
    println!("  Request timeout: {}s", config.server.request_timeout);
    println!("  Allowed origins: {:?}", config.server.allowed_origins);
    println!();
    println!(
        "Pool: {} workers, {} queued",
        config.pool.workers, config.pool.queue_capacity
    );
    println!();
    println!("Harness:");
    println!("  loop() calls: {}", config.harness.loop_iterations);
    println!("  println newline: {}", config.harness.println_newline);
    println!();
    println!("Compiler: {}", config.toolchain.command.join(" "));
    for (phase, limits) in [
        ("Compile", config.toolchain.effective_limits()),
        ("Run", config.run.effective_limits()),
    ] {
        println!("{phase} limits:");
        println!("  Time limit: {:?}", limits.time_limit);
        println!("  Wall time limit: {:?}", limits.wall_time_limit);
        println!("  Memory limit: {:?} KB", limits.memory_limit);
        println!("  Stack limit: {:?} KB", limits.stack_limit);
        println!("  Max processes: {:?}", limits.max_processes);
        println!("  Max output: {:?} KB", limits.max_output);
        println!("  Max file size: {:?} KB", limits.max_file_size);
    }
    println!();
    println!("Confinement: {}", config.confinement.enabled);
    for bind in &config.confinement.bind {
        println!("  Bind: {}", bind.display());
    }
    if let Some(user) = config.run.user {
        println!("  Run as: {user}:{}", config.run.group.unwrap_or(user));
    }

    if config.backend == BackendKind::Isolate {
        println!();
        println!("Isolate binary: {}", config.isolate.binary().display());
        println!("First box id: {}", config.isolate.first_box_id);
        println!("Cgroup mode: {}", config.isolate.cgroup);
    }
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}

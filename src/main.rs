//! moor - declarative convergence for Docker hosts
//!
//! This is the main CLI entry point for moor.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use moor::apply::{self, ApplyOptions};
use moor::config::MoorConfig;
use moor::converge::Controller;
use moor::engine::{Classifier, DockerCli};
use moor::image::{ImageReference, Registry};
use moor::resource::spec::sanitize_container_name;
use moor::resource::{Kind, Manifest};
use regex::Regex;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// moor - declarative convergence for Docker hosts
#[derive(Parser)]
#[command(name = "moor")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Converge images, containers, swarm membership and stacks to a manifest", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Docker client binary
    #[arg(long, global = true)]
    docker: Option<String>,

    /// Docker daemon to talk to
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Attempts per action before giving up on transient failures
    #[arg(long, global = true)]
    attempts: Option<u32>,

    /// Timeout of a single engine command, in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge the host to a manifest
    Apply {
        /// Manifest file
        manifest: PathBuf,
        /// Run a failed pass again when its error matches this pattern
        #[arg(long)]
        retry_on: Option<String>,
        /// Extra passes per resource for --retry-on
        #[arg(long, default_value = "3")]
        retries: u32,
        /// Seconds to wait between passes for --retry-on
        #[arg(long, default_value = "5")]
        retry_delay: u64,
    },

    /// Show what apply would do without changing anything
    Plan {
        /// Manifest file
        manifest: PathBuf,
    },

    /// Remove everything a manifest describes, in reverse order
    Destroy {
        /// Manifest file
        manifest: PathBuf,
    },

    /// Print the observed state of one resource as JSON
    Inspect {
        /// Resource kind (image, container, swarm_node, stack)
        kind: String,
        /// Resource name
        name: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("moor=debug")
        } else {
            EnvFilter::new("moor=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = MoorConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(binary) = cli.docker {
        config.docker.binary = binary;
    }
    if let Some(host) = cli.host {
        config.docker.host = Some(host);
    }
    if let Some(attempts) = cli.attempts {
        config.retry.max_attempts = attempts;
    }
    if let Some(timeout) = cli.timeout {
        config.docker.timeout_secs = timeout;
    }
    config.check()?;
    debug!(budget_secs = config.pass_budget().as_secs(), "Pass time budget");

    let engine = Arc::new(DockerCli::new(
        config.docker.clone(),
        Classifier::new(&config.transient_patterns),
    ));
    let registry = Arc::new(Registry::new(config.registry.clone())?);
    let controller = Controller::new(engine, registry, config.retry.clone());

    match cli.command {
        Commands::Apply {
            manifest,
            retry_on,
            retries,
            retry_delay,
        } => {
            let retry_on = retry_on
                .map(|pattern| Regex::new(&pattern))
                .transpose()
                .context("invalid --retry-on pattern")?;
            let options = ApplyOptions {
                retry_on,
                retries,
                retry_delay: Duration::from_secs(retry_delay),
                destroy: false,
            };
            converge(&controller, &manifest, &options).await
        }

        Commands::Destroy { manifest } => {
            let options = ApplyOptions {
                destroy: true,
                ..ApplyOptions::default()
            };
            converge(&controller, &manifest, &options).await
        }

        Commands::Plan { manifest } => {
            let manifest = Manifest::from_path(&manifest)?;
            let resources = apply::prepare(manifest.resources, false)?;

            let mut code = 0;
            for (resource, action) in apply::plan(&controller, &resources).await {
                match action {
                    Ok(action) if action.is_noop() => println!("{}: up to date", resource),
                    Ok(action) => {
                        println!("{}: {}", resource, action);
                        code |= 2;
                    }
                    Err(e) => {
                        println!("{}: cannot plan [{}]: {}", resource, e.cause(), e);
                        code |= 4;
                    }
                }
            }
            Ok(code)
        }

        Commands::Inspect { kind, name } => {
            let kind: Kind = kind.parse()?;
            let identity = match kind {
                Kind::Image => ImageReference::parse(&name)?.to_string(),
                Kind::Container => sanitize_container_name(&name),
                Kind::SwarmNode | Kind::Stack => name,
            };
            let observed = controller.reader().read(kind, &identity).await?;
            println!("{}", serde_json::to_string_pretty(&observed)?);
            Ok(0)
        }
    }
}

/// Apply or destroy a manifest, stopping cleanly on Ctrl-C
async fn converge(
    controller: &Controller,
    manifest: &std::path::Path,
    options: &ApplyOptions,
) -> Result<u8> {
    let manifest = Manifest::from_path(manifest)?;
    let resources = apply::prepare(manifest.resources, options.destroy)?;

    let (shutdown_tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, abandoning the current pass");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = apply::apply(controller, &resources, options, shutdown).await;
    for pass in &report.passes {
        println!("{}", pass.summary());
    }
    for skipped in &report.skipped {
        println!("{}: skipped", skipped);
    }
    Ok(report.exit_code() as u8)
}

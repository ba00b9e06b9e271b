use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use podfleet_config::{discover_hosts, select_hosts, ConfigError, DiscoveredHost, FleetConfig};
use podfleet_runner::inspect::inspect_host;
use podfleet_runner::reconcile::Phase;
use podfleet_runner::report::HostInfo;
use podfleet_runner::{run_fleet, HeadlessUI, HostConnector, PodmanConnector, QuietUI, RunOptions};
use tokio::sync::watch;
use tracing::warn;

#[derive(Parser)]
#[command(name = "podfleet", version, about = "Declarative container fleet reconciliation")]
struct Cli {
    /// Fleet settings; host_vars is resolved relative to this file
    #[arg(long, short, global = true, default_value = "fleet.toml")]
    config: PathBuf,
    /// Only run for this host (repeatable)
    #[arg(long = "host", global = true)]
    hosts: Vec<String>,
    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,
    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge hosts to their declarations
    Apply {
        /// Restrict the run to these phases (comma separated)
        #[arg(long, value_delimiter = ',')]
        phases: Vec<Phase>,
        /// Only print the plan
        #[arg(long)]
        dry_run: bool,
        /// Concurrent operations per host
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Show what apply would change (same as apply --dry-run)
    Plan {
        #[arg(long, value_delimiter = ',')]
        phases: Vec<Phase>,
    },
    /// Validate host declarations without contacting any host
    Validate,
    /// Show live containers and networks per host
    Hosts,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            // Konfigurationsfehler: gleicher Code wie ungültige Deklarationen
            if e.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = FleetConfig::load_or_default(&cli.config)?;
    let base = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let hosts = select_hosts(discover_hosts(&config.host_vars_dir(base))?, &cli.hosts)?;

    match cli.command {
        Commands::Apply {
            phases,
            dry_run,
            workers,
        } => converge(&config, hosts, phases, dry_run, workers, cli.format).await,
        Commands::Plan { phases } => converge(&config, hosts, phases, true, None, cli.format).await,
        Commands::Validate => Ok(validate(&hosts, cli.format)),
        Commands::Hosts => show_hosts(&config, &hosts, cli.format).await,
    }
}

async fn converge(
    config: &FleetConfig,
    hosts: Vec<DiscoveredHost>,
    phases: Vec<Phase>,
    dry_run: bool,
    workers: Option<usize>,
    format: Format,
) -> anyhow::Result<ExitCode> {
    let mut options = RunOptions::from_config(config);
    if !phases.is_empty() {
        options.phases = phases.into_iter().collect();
    }
    options.dry_run = dry_run;
    if let Some(workers) = workers {
        options.executor.workers = workers;
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, waiting for running operations to finish");
            let _ = cancel_tx.send(true);
        }
    });

    let connector = Arc::new(PodmanConnector {
        runtime: config.runtime.clone(),
    });
    let options = Arc::new(options);

    let report = match format {
        Format::Text => {
            let report = run_fleet(hosts, connector, options, cancel_rx, &mut HeadlessUI).await;
            println!("\n{}", report);
            report
        }
        Format::Json => {
            let report = run_fleet(hosts, connector, options, cancel_rx, &mut QuietUI).await;
            println!("{}", report.to_json()?);
            report
        }
    };

    Ok(ExitCode::from(report.exit_code() as u8))
}

fn validate(hosts: &[DiscoveredHost], format: Format) -> ExitCode {
    let mut results = BTreeMap::new();
    for host in hosts {
        results.insert(host.name.clone(), host.load());
    }

    match format {
        Format::Text => {
            for (name, outcome) in &results {
                match outcome {
                    Ok(profile) => println!(
                        "\x1b[1;32m✓ {}\x1b[0m ({} container(s), {} network(s), {} directory(ies))",
                        name,
                        profile.containers.len(),
                        profile.networks.len(),
                        profile.directories.len()
                    ),
                    Err(e) => eprintln!("\x1b[1;31m✗ {}: {}\x1b[0m", name, e),
                }
            }
        }
        Format::Json => {
            let json: BTreeMap<_, _> = results
                .iter()
                .map(|(name, outcome)| {
                    let value = match outcome {
                        Ok(_) => serde_json::json!({ "valid": true }),
                        Err(e) => serde_json::json!({ "valid": false, "error": e.to_string() }),
                    };
                    (name.clone(), value)
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
        }
    }

    if results.values().any(Result::is_err) {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

async fn show_hosts(
    config: &FleetConfig,
    hosts: &[DiscoveredHost],
    format: Format,
) -> anyhow::Result<ExitCode> {
    let connector = PodmanConnector {
        runtime: config.runtime.clone(),
    };
    let mut infos = BTreeMap::new();
    let mut failed = false;
    let mut invalid = false;

    for host in hosts {
        let profile = match host.load() {
            Ok(profile) => profile,
            Err(e) => {
                invalid = true;
                eprintln!("\x1b[1;31m✗ {}: {}\x1b[0m", host.name, e);
                continue;
            }
        };
        let runtime = connector.runtime(&profile);
        let fs = connector.filesystem(&profile);
        let state = inspect_host(&profile, runtime.as_ref(), fs.as_ref()).await;
        for error in &state.errors {
            failed = true;
            eprintln!("\x1b[33m! [{}] {}: {}\x1b[0m", host.name, error.resource(), error.message);
        }
        infos.insert(host.name.clone(), HostInfo::from_state(&state));
    }

    match format {
        Format::Text => {
            for (name, info) in &infos {
                println!("\x1b[1;34m▶ {}\x1b[0m", name);
                for c in &info.containers {
                    println!("  {:<24} {:<40} {} ({:?})", c.name, c.image, c.status, c.health);
                }
                if !info.networks.is_empty() {
                    println!("  networks: {}", info.networks.join(", "));
                }
            }
        }
        Format::Json => println!("{}", serde_json::to_string_pretty(&infos)?),
    }

    Ok(if invalid {
        ExitCode::from(2)
    } else if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use driftsentinel::config::{LoggingConfig, SentinelConfig};
use driftsentinel::detect::incident::{IncidentFilter, IncidentStatus};
use driftsentinel::detect::{CheckOrigin, CheckOutcome, SkipReason};
use driftsentinel::diagnosis::FixAction;
use driftsentinel::ingest::DecisionInput;
use driftsentinel::sentinel::Sentinel;
use driftsentinel::simulate;
use driftsentinel::storage;

#[derive(Parser)]
#[command(
    name = "driftsentinel",
    about = "Drift detection and incident resolution for algorithmic decision streams",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path, overriding the configuration
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + drift scanner + follow-up pipeline)
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },

    #[command(flatten)]
    Offline(OfflineCommand),
}

/// Commands that run against the database without the daemon.
#[derive(Subcommand)]
enum OfflineCommand {
    /// Run one drift check for an algorithm
    Check {
        algorithm: String,
    },

    /// Recompute an algorithm's baseline, ignoring the cache
    Baseline {
        algorithm: String,
    },

    /// List recent incidents
    Incidents {
        /// Look-back window in hours
        #[arg(long, default_value = "24")]
        hours: i64,

        /// Only incidents in this status
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Resolve an incident manually
    Resolve {
        incident_id: String,

        /// rollback, feature_override, zone_exclude, or pause
        #[arg(long)]
        action: String,

        #[arg(long, default_value = "1.0")]
        confidence: f64,
    },

    /// Aggregate incident metrics
    Metrics {
        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// Ingest decisions from a JSON file (one object or an array)
    Ingest {
        file: PathBuf,
    },

    /// Seed a synthetic baseline history and optionally inject drift
    Simulate {
        algorithm: String,

        /// Historical decisions to generate
        #[arg(long, default_value = "500")]
        count: usize,

        /// Also inject a recent drifted burst
        #[arg(long)]
        drift: bool,

        /// Confine the drifted burst to one zone
        #[arg(long)]
        zone: Option<String>,
    },

    /// Manage the monitored algorithm set
    Algorithms {
        #[command(subcommand)]
        action: AlgorithmAction,
    },
}

#[derive(Subcommand)]
enum AlgorithmAction {
    /// List monitored algorithms
    List,

    /// Start monitoring an algorithm
    Add { name: String },

    /// Stop monitoring an algorithm
    Remove { name: String },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SentinelConfig::load(path)?,
        None => SentinelConfig::load_or_default(),
    };
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    init_tracing(&config.logging);

    let command = match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting DriftSentinel daemon");
            return driftsentinel::serve(config).await;
        }
        Commands::Offline(command) => command,
    };

    let sentinel = Sentinel::open(config)?;

    match command {
        OfflineCommand::Check { algorithm } => {
            let result = sentinel
                .detector()
                .check_algorithm(&algorithm, CheckOrigin::OnDemand)
                .await?;

            println!("\n=== Drift Check: {} ===", result.algorithm);
            match result.divergence {
                Some(d) => println!("Divergence: {:.4} (threshold {})", d, result.threshold),
                None => println!("Divergence: n/a"),
            }
            println!(
                "Samples:    {} recent / {} baseline{}",
                result.current_samples,
                result.baseline_samples,
                if result.baseline_low_confidence { " (low confidence)" } else { "" }
            );
            if let Some(severity) = result.severity {
                println!("Severity:   {severity}");
            }
            let outcome = match &result.outcome {
                CheckOutcome::Clean => "no drift".to_string(),
                CheckOutcome::IncidentCreated { incident_id } => format!("DRIFT DETECTED, incident {incident_id} opened"),
                CheckOutcome::ActiveIncidentExists { incident_id } => {
                    format!("DRIFT DETECTED, incident {incident_id} already active")
                }
                CheckOutcome::Unmonitored => "drift detected but algorithm is not monitored".to_string(),
                CheckOutcome::Skipped { reason: SkipReason::NoBaseline } => "skipped: no baseline history".to_string(),
                CheckOutcome::Skipped {
                    reason: SkipReason::InsufficientSamples { have, need },
                } => format!("skipped: {have} recent decisions, need {need}"),
            };
            println!("Outcome:    {outcome}");
            for zone in &result.zones {
                println!("  zone {:<12} {:.4} ({} samples)", zone.zone, zone.divergence, zone.samples);
            }
            println!();
        }
        OfflineCommand::Baseline { algorithm } => {
            let baseline = sentinel.baselines().recompute(&algorithm)?;
            if baseline.is_empty() {
                println!("No decisions for '{algorithm}' in the last {} days.", baseline.window_days);
            } else {
                println!("{}", serde_json::to_string_pretty(&baseline)?);
            }
        }
        OfflineCommand::Incidents {
            hours,
            status,
            limit,
            json,
        } => {
            let status = status.as_deref().map(str::parse::<IncidentStatus>).transpose()?;
            let page = sentinel.incidents().list(&IncidentFilter {
                since: Some(storage::hours_before(Utc::now(), hours)?),
                status,
                algorithm: None,
                limit,
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else if page.incidents.is_empty() {
                println!("No incidents in the last {hours} hours.");
            } else {
                println!("{:<36} | {:<13} | {:<8} | {:>8} | Root cause", "Incident", "Status", "Severity", "KL");
                println!("{:-<36}-|-{:-<13}-|-{:-<8}-|-{:-<8}-|-{:-<14}", "", "", "", "", "");
                for i in &page.incidents {
                    println!(
                        "{:<36} | {:<13} | {:<8} | {:>8.4} | {}",
                        i.id,
                        i.status.as_str(),
                        i.severity.as_str(),
                        i.divergence,
                        i.root_cause.map_or("-", |r| r.as_str())
                    );
                }
                if page.skipped > 0 {
                    println!("({} unreadable incident records skipped)", page.skipped);
                }
            }
        }
        OfflineCommand::Resolve {
            incident_id,
            action,
            confidence,
        } => {
            let action: FixAction = action.parse()?;
            let incident = sentinel
                .resolver()
                .resolve_manual(&incident_id, action, confidence)
                .await?;
            println!("Incident '{}' resolved with {action}.", incident.id);
        }
        OfflineCommand::Metrics { hours } => {
            let metrics = sentinel.incidents().metrics(storage::hours_before(Utc::now(), hours)?)?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        OfflineCommand::Ingest { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let value: serde_json::Value = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            let inputs: Vec<DecisionInput> = match value {
                serde_json::Value::Array(_) => serde_json::from_value(value)?,
                other => vec![serde_json::from_value(other)?],
            };
            let report = sentinel.decisions().ingest_bulk(inputs)?;
            println!("Indexed: {}  Failed: {}", report.indexed, report.failed);
            for e in &report.errors {
                println!("  #{}: {}", e.index, e.reason);
            }
        }
        OfflineCommand::Simulate {
            algorithm,
            count,
            drift,
            zone,
        } => {
            let now = Utc::now();
            let mut rng = rand::thread_rng();
            let window_days = sentinel.config().baseline.window_days;
            let history = simulate::history(&algorithm, count, window_days, now, &mut rng);
            let report = sentinel.decisions().ingest_bulk(history)?;
            println!("Seeded {} historical decisions for '{algorithm}'.", report.indexed);

            let baseline = sentinel.baselines().recompute(&algorithm)?;
            println!("Baseline computed from {} samples.", baseline.sample_count);
            sentinel.registry().add(&algorithm)?;

            if drift {
                let burst = (count / 4).max(sentinel.config().detection.min_current_samples * 2);
                let minutes = (sentinel.config().detection.recent_window_minutes - 5).max(1);
                let decisions = simulate::drift(&algorithm, burst, minutes, zone.as_deref(), now, &mut rng);
                let report = sentinel.decisions().ingest_bulk(decisions)?;
                println!("Injected {} drifted decisions.", report.indexed);
            }
        }
        OfflineCommand::Algorithms { action } => match action {
            AlgorithmAction::List => {
                let names = sentinel.registry().list();
                if names.is_empty() {
                    println!("No algorithms monitored.");
                } else {
                    for name in names {
                        println!("{name}");
                    }
                }
            }
            AlgorithmAction::Add { name } => {
                if sentinel.registry().add(&name)? {
                    println!("Algorithm '{name}' added.");
                } else {
                    println!("Algorithm '{name}' already monitored.");
                }
            }
            AlgorithmAction::Remove { name } => {
                if sentinel.registry().remove(&name)? {
                    println!("Algorithm '{name}' removed.");
                } else {
                    println!("Algorithm '{name}' was not monitored.");
                }
            }
        },
    }

    Ok(())
}

//! Healer CLI
//!
//! Runs the self-healing control loop against the current cluster, performs
//! one-off scans, and validates configuration.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use healer::config::HealerConfig;
use healer::k8s::KubeClusterSource;
use healer::metrics::HealerMetrics;
use healer::orchestrator::{CycleReport, Disposition, EventSink, Healer};
use healer::server::{self, ServerState};
use healer::telemetry::{self, LogFormat};
use healer::types::{ActionMode, Outcome};
use notify::{Notifier, NotifyEvent};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Self-healing control loop - detects unhealthy pods and remediates them without flapping
#[derive(Parser)]
#[command(name = "healer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file
    #[arg(long, short, env = "HEALER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(flatten)]
    overrides: Overrides,
}

/// Settings that take precedence over the config file.
#[derive(Args)]
struct Overrides {
    /// Namespaces to watch, comma separated (empty = all)
    #[arg(long, env = "HEALER_NAMESPACES", value_delimiter = ',', global = true)]
    namespaces: Option<Vec<String>>,

    /// Kubernetes label selector for the pod list
    #[arg(long, env = "HEALER_LABEL_SELECTOR", global = true)]
    label_selector: Option<String>,

    /// Remediation strategy
    #[arg(long, env = "HEALER_ACTION", value_enum, global = true)]
    action: Option<ActionMode>,

    /// Seconds between scan cycles
    #[arg(long, env = "HEALER_SCAN_INTERVAL_SECS", global = true)]
    scan_interval_secs: Option<u64>,

    /// Evaluate and log decisions without acting
    #[arg(long, env = "HEALER_DRY_RUN", global = true)]
    dry_run: bool,

    /// Address for the health/metrics server, e.g. 0.0.0.0:8080
    #[arg(long, env = "HEALER_LISTEN_ADDR", global = true)]
    listen_addr: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut HealerConfig) {
        if let Some(namespaces) = self.namespaces {
            config.namespaces = namespaces.into_iter().filter(|ns| !ns.is_empty()).collect();
        }
        if let Some(selector) = self.label_selector {
            config.label_selector = Some(selector);
        }
        if let Some(action) = self.action {
            config.action = action;
        }
        if let Some(secs) = self.scan_interval_secs {
            config.scan_interval_secs = secs;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if let Some(addr) = self.listen_addr {
            config.listen_addr = Some(addr);
        }
    }
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop until SIGINT/SIGTERM
    Run,
    /// Run a single scan cycle and print what happened
    Scan {
        /// Report format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Load, validate and print the effective configuration
    CheckConfig,
}

/// Buffers events during a one-off scan so they can be delivered before exit.
#[derive(Default)]
struct BufferedEvents {
    events: Mutex<Vec<NotifyEvent>>,
}

impl BufferedEvents {
    fn drain(&self) -> Vec<NotifyEvent> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }
}

impl EventSink for BufferedEvents {
    fn emit(&self, event: NotifyEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose, cli.log_format);

    let mut config = HealerConfig::load(cli.config.as_deref()).context("failed to load config")?;
    cli.overrides.apply(&mut config);
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Scan { format } => scan(config, format).await,
        Commands::CheckConfig => check_config(&config),
    }
}

async fn run(config: HealerConfig) -> Result<()> {
    let metrics_guard = telemetry::init_metrics(config.otlp_endpoint.as_deref())?;
    let metrics = Arc::new(HealerMetrics::new());
    let notifier = Arc::new(
        Notifier::from_settings(&config.notify).context("invalid notification settings")?,
    );
    let cluster = Arc::new(
        KubeClusterSource::try_default()
            .await
            .context("failed to create Kubernetes client")?,
    );

    let healer = Healer::new(&config, cluster, notifier, metrics.clone())?;

    let pods = healer
        .probe()
        .await
        .context("cluster data source unreachable")?;
    info!(pods, namespaces = ?config.namespaces, "Cluster reachable");

    let shutdown = CancellationToken::new();

    let server = match &config.listen_addr {
        Some(addr) => {
            let listener = server::bind(addr).await?;
            let state = Arc::new(ServerState {
                store: healer.store().clone(),
                metrics: metrics.clone(),
                ready: healer.readiness(),
            });
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server::serve(listener, state, token).await {
                    error!(error = %e, "Status server stopped");
                }
            }))
        }
        None => None,
    };

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    healer.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!(error = %e, "Status server task failed");
        }
    }
    metrics_guard.shutdown();
    info!("Healer stopped");
    Ok(())
}

async fn scan(config: HealerConfig, format: OutputFormat) -> Result<()> {
    let metrics = Arc::new(HealerMetrics::new());
    let notifier =
        Notifier::from_settings(&config.notify).context("invalid notification settings")?;
    let events = Arc::new(BufferedEvents::default());
    let cluster = Arc::new(
        KubeClusterSource::try_default()
            .await
            .context("failed to create Kubernetes client")?,
    );

    let healer = Healer::new(&config, cluster, events.clone(), metrics)?;
    let report = healer
        .run_cycle_at(Utc::now())
        .await
        .context("scan failed")?;

    for event in events.drain() {
        for (channel, result) in notifier.notify_and_wait(event).await {
            if let Err(e) = result {
                warn!(channel, error = %e, "Failed to send notification");
            }
        }
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report, config.dry_run),
    }
    Ok(())
}

fn check_config(config: &HealerConfig) -> Result<()> {
    healer::heuristics::HeuristicEngine::from_config(config)
        .context("invalid signature pattern")?;
    println!("{}", "Configuration is valid".green().bold());
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn print_report(report: &CycleReport, dry_run: bool) {
    let mode = if dry_run { " (dry run)" } else { "" };
    println!(
        "{} cycle {}{mode}: {} pods, {} workloads, {} decisions",
        "Scan".bold(),
        report.cycle,
        report.pods_observed,
        report.workloads_observed,
        report.decisions.len()
    );

    if report.decisions.is_empty() {
        println!("  {}", "All workloads healthy".green());
        return;
    }

    for decision in &report.decisions {
        let status = match &decision.disposition {
            Disposition::DryRun => "would remediate".cyan().to_string(),
            Disposition::Denied { denied_by } => format!("denied ({denied_by})").yellow().to_string(),
            Disposition::Executed {
                action,
                outcome: Outcome::Success,
            } => format!("{action} ok").green().to_string(),
            Disposition::Executed {
                action,
                outcome: Outcome::Failure(cause),
            } => format!("{action} failed: {cause}").red().to_string(),
            Disposition::Aborted => "aborted".red().to_string(),
        };
        println!(
            "  {} [{}] {} -> {status}",
            decision.workload.to_string().bold(),
            decision.reason,
            decision.pods.join(", ")
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}

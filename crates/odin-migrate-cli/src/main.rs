//! odin-migrate CLI - Heimdall (V1) to Odin (V2) school data migration.

use clap::{Parser, Subcommand};
use odin_migrate::error::{EXIT_CANCELLED, EXIT_RUN_PARTIAL, EXIT_SUCCESS};
use odin_migrate::{Config, EntityKind, MigrateError, MigrationResult, Orchestrator, Severity};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "odin-migrate")]
#[command(about = "Migrate school data from Heimdall (V1) to Odin (V2)")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Shorthand for --verbosity debug
    #[arg(short, long)]
    verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Seconds to wait for the current batch after a shutdown signal
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration, resuming from --state-file when it exists
    Run {
        /// Resolve and write everything, then roll it all back
        #[arg(long)]
        dry_run: bool,

        /// Comma-separated stages to run: schools,teachers,parents,students
        #[arg(long)]
        entities: Option<String>,

        /// Discard an existing state file and start over
        #[arg(long)]
        force: bool,

        /// Stop the run at the first failed row or batch
        #[arg(long)]
        fail_fast: bool,

        /// Source filter, e.g. "school_id=12" or "id=4,id=9"
        #[arg(long)]
        filter: Option<String>,

        /// Run the integrity validator after the last stage
        #[arg(long)]
        validate: bool,

        /// Check the source for incomplete or dangling rows before writing
        #[arg(long)]
        preflight: bool,

        /// Fail students whose parent has not been migrated
        #[arg(long)]
        strict: bool,

        /// Override rows per batch
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Validate a finished run recorded in --state-file
    Validate,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, MigrateError> {
    let cli = Cli::parse();

    let verbosity = if cli.verbose { "debug" } else { cli.verbosity.as_str() };
    setup_logging(verbosity, &cli.log_format, cli.log_file.as_deref())?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            dry_run,
            entities,
            force,
            fail_fast,
            filter,
            validate,
            preflight,
            strict,
            batch_size,
        } => {
            // Apply overrides
            if let Some(list) = entities {
                config.migration.entities = EntityKind::parse_list(&list)?;
            }
            if let Some(f) = filter {
                config.migration.filter = Some(f);
            }
            if let Some(size) = batch_size {
                config.migration.batch_size = size;
            }
            config.migration.fail_fast |= fail_fast;
            config.migration.strict_parents |= strict;
            config.validate()?;

            if force {
                if let Some(ref path) = cli.state_file {
                    if path.exists() && !dry_run {
                        std::fs::remove_file(path)?;
                        warn!("Discarded existing state file {:?}", path);
                    }
                }
            }

            let cancel_token = setup_signal_handler(cli.shutdown_timeout)?;

            let mut orchestrator = Orchestrator::new(config)
                .await?
                .with_dry_run(dry_run)
                .with_validation(validate)
                .with_preflight(preflight);
            if let Some(path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path).resume()?;
            }

            let result = orchestrator.run(cancel_token).await?;
            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_result(&result);
            }
            Ok(result.exit_code())
        }

        Commands::Validate => {
            let mut orchestrator = Orchestrator::new(config).await?;
            if let Some(path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path);
            }
            let report = orchestrator.validate_only().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Validation Results:");
                for school in &report.school_summaries {
                    println!(
                        "  School {} ({}): {} teachers, {} parents, {} students",
                        school.school_id, school.name, school.teachers, school.parents, school.students
                    );
                }
                for finding in &report.findings {
                    println!("  {}", finding);
                }
                println!(
                    "\n  References checked: {}\n  Critical: {}\n  Warnings: {}",
                    report.references_checked,
                    report.critical_count(),
                    report.warning_count()
                );
            }

            Ok(if report.has_critical() {
                EXIT_RUN_PARTIAL
            } else {
                EXIT_SUCCESS
            })
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (Heimdall): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (Odin): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Connection("Health check failed".to_string()));
            }
            Ok(EXIT_SUCCESS)
        }
    }
}

fn print_result(result: &MigrationResult) {
    let heading = if result.dry_run {
        "Dry run finished (all writes rolled back)"
    } else {
        "Migration finished"
    };
    println!("\n{}: {}", heading, result.status.as_str());
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    if let Some(ref reason) = result.abort_reason {
        println!("  Aborted: {}", reason);
    }

    println!(
        "\n  {:<10} {:>10} {:>8} {:>8} {:>8} {:>8} {:>9}",
        "Stage", "Status", "Read", "Written", "Skipped", "Failed", "Warnings"
    );
    for stage in &result.stages {
        println!(
            "  {:<10} {:>10} {:>8} {:>8} {:>8} {:>8} {:>9}",
            stage.stage.as_str(),
            format!("{:?}", stage.status).to_lowercase(),
            stage.rows_read,
            stage.rows_written,
            stage.rows_skipped,
            stage.rows_failed,
            stage.warnings
        );
        for err in &stage.errors {
            println!("      {} {}: {}", stage.stage, err.source_id, err.message);
        }
    }

    println!(
        "\n  Users: {} -> {}   Schools: {} -> {}",
        result.rows_before.users,
        result.rows_after.users,
        result.rows_before.schools,
        result.rows_after.schools
    );

    if let Some(ref report) = result.preflight {
        println!("\n  Pre-flight: {} warnings", report.warning_count());
        for finding in &report.findings {
            println!("    {}", finding);
        }
    }

    if let Some(ref report) = result.validation {
        for school in &report.school_summaries {
            println!(
                "\n  School {} ({}): {} teachers, {} parents, {} students",
                school.school_id, school.name, school.teachers, school.parents, school.students
            );
        }
        println!(
            "\n  Validation: {} critical, {} warnings",
            report.critical_count(),
            report.warning_count()
        );
        for finding in report
            .findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
        {
            println!("    {}", finding);
        }
    }
}

fn setup_logging(verbosity: &str, format: &str, log_file: Option<&Path>) -> Result<(), MigrateError> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    match (log_file, format == "json") {
        (Some(path), json) => {
            let file = Mutex::new(File::create(path)?);
            let subscriber = subscriber.with_writer(file).with_ansi(false);
            if json {
                subscriber.json().init();
            } else {
                subscriber.init();
            }
        }
        (None, true) => subscriber.with_writer(std::io::stderr).json().init(),
        (None, false) => subscriber.with_writer(std::io::stderr).init(),
    }

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM. The run stops at the next
/// batch boundary; if it has not stopped `shutdown_timeout` seconds later the
/// process exits and the open batch transaction is dropped by the server.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Finishing the current batch (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
        force_exit_after(shutdown_timeout).await;
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nReceived Ctrl-C. Finishing the current batch...");
        token.cancel();
        force_exit_after(shutdown_timeout).await;
    });

    Ok(cancel_token)
}

async fn force_exit_after(shutdown_timeout: u64) {
    tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
    eprintln!("Shutdown timeout reached; exiting");
    std::process::exit(i32::from(EXIT_CANCELLED));
}

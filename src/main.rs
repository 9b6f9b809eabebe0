//! vpcforge CLI entrypoint.
//!
//! This is the main entrypoint for the vpcforge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use vpcforge::cli::{Cli, Commands, LogFormat, OutputFormatter, ProviderKind};
use vpcforge::config::{ConfigParser, ConfigValidator, EnvironmentConfig, find_config_file};
use vpcforge::error::Result;
use vpcforge::graph::GraphBuilder;
use vpcforge::planner::PlanMode;
#[cfg(feature = "aws")]
use vpcforge::planner::RetryPolicy;
use vpcforge::provider::{InMemoryCloud, ProviderRegistry};
use vpcforge::reconciler::{PreparedRun, Reconciler};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point. Returns the process exit status.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let mut config = load_config(cli.config.as_ref())?;
    if let Some(max) = cli.max_concurrency {
        config.engine.max_concurrency = max.max(1);
    }

    if let Commands::Validate { warnings } = cli.command {
        return cmd_validate(&config, warnings, &formatter);
    }

    let cancel = CancellationToken::new();
    let registry = build_registry(cli.provider, &config, &cancel).await?;
    spawn_interrupt_handler(cancel.clone());
    let reconciler = Reconciler::new(&config, &registry, cancel);

    match cli.command {
        Commands::Validate { .. } => Ok(0),
        Commands::Plan {
            prune,
            destroy,
            detailed,
        } => {
            let mode = if destroy {
                PlanMode::Destroy
            } else if prune {
                PlanMode::ApplyPrune
            } else {
                PlanMode::Apply
            };
            cmd_plan(&reconciler, mode, detailed, &formatter).await
        }
        Commands::Apply { yes, prune } => {
            let mode = if prune { PlanMode::ApplyPrune } else { PlanMode::Apply };
            cmd_apply(&reconciler, mode, yes, &formatter).await
        }
        Commands::Destroy { yes } => cmd_apply(&reconciler, PlanMode::Destroy, yes, &formatter).await,
        Commands::Drift => {
            let report = reconciler.drift().await?;
            emit(&formatter.format_drift(&report))?;
            Ok(0)
        }
        Commands::Status => {
            let report = reconciler.status().await?;
            emit(&formatter.format_status(&report))?;
            Ok(0)
        }
    }
}

/// Validate configuration and build the graph without touching the cloud.
fn cmd_validate(config: &EnvironmentConfig, show_warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    info!(environment = %config.environment, "Validating configuration");
    let result = ConfigValidator::new().validate(config)?;
    let graph = GraphBuilder::new(config).build()?;
    emit(&formatter.format_validation(&result, graph.len(), show_warnings))?;
    Ok(0)
}

/// Show the plan for a mode.
async fn cmd_plan(reconciler: &Reconciler<'_>, mode: PlanMode, detailed: bool, formatter: &OutputFormatter) -> Result<u8> {
    let prepared = reconciler.prepare(mode).await?;
    emit(&formatter.format_plan(&prepared.plan, detailed))?;
    if !prepared.plan.passes_guardrails {
        return Ok(2);
    }
    Ok(0)
}

/// Plan, confirm and execute.
async fn cmd_apply(reconciler: &Reconciler<'_>, mode: PlanMode, auto_approve: bool, formatter: &OutputFormatter) -> Result<u8> {
    let prepared = reconciler.prepare(mode).await?;
    emit(&formatter.format_plan(&prepared.plan, false))?;

    if prepared.plan.is_converged() {
        return Ok(0);
    }
    if !auto_approve && prepared.plan.passes_guardrails && !confirm(mode, &prepared)? {
        eprintln!("Cancelled, nothing was changed.");
        return Ok(0);
    }

    let report = reconciler.execute(prepared).await?;
    emit(&formatter.format_report(&report))?;
    Ok(report.outcome.exit_code())
}

/// Asks for confirmation on stderr. Destroy needs the word typed out.
fn confirm(mode: PlanMode, prepared: &PreparedRun) -> Result<bool> {
    let (prompt, expected) = match mode {
        PlanMode::Destroy => (
            format!(
                "\nThis deletes all {} resources of the environment and is IRREVERSIBLE. Type 'destroy' to confirm: ",
                prepared.plan.delete_count()
            ),
            "destroy",
        ),
        PlanMode::ApplyPrune if prepared.plan.delete_count() > 0 => (
            format!(
                "\nThis plan deletes {} resources. Do you want to apply it? [y/N]: ",
                prepared.plan.delete_count()
            ),
            "y",
        ),
        PlanMode::Apply | PlanMode::ApplyPrune => (String::from("\nDo you want to apply this plan? [y/N]: "), "y"),
    };

    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

/// Cancels the run on the first Ctrl-C. In-flight calls finish; nothing
/// new starts.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, waiting for in-flight operations");
            cancel.cancel();
        }
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads `.env` and the configuration with environment overrides.
fn load_config(config_path: Option<&PathBuf>) -> Result<EnvironmentConfig> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_file.parent().unwrap_or_else(|| Path::new(".")));
    parser.load_dotenv()?;
    parser.load_with_env(&config_file)
}

/// Builds the provider registry for the selected control plane.
async fn build_registry(
    provider: ProviderKind,
    config: &EnvironmentConfig,
    cancel: &CancellationToken,
) -> Result<ProviderRegistry> {
    match provider {
        ProviderKind::Memory => {
            warn!("Using the in-memory control plane; nothing persists after exit");
            Ok(InMemoryCloud::new().registry())
        }
        ProviderKind::Aws => aws_registry(config, cancel).await,
    }
}

#[cfg(feature = "aws")]
async fn aws_registry(config: &EnvironmentConfig, cancel: &CancellationToken) -> Result<ProviderRegistry> {
    let context = vpcforge::aws::AwsContext::load(config.region.as_deref()).await;
    let follow_up = vpcforge::aws::FollowUp::new(RetryPolicy::from(&config.engine.retry), cancel.clone());
    Ok(vpcforge::aws::registry(&context, &follow_up))
}

#[cfg(not(feature = "aws"))]
#[allow(clippy::unused_async)]
async fn aws_registry(_config: &EnvironmentConfig, _cancel: &CancellationToken) -> Result<ProviderRegistry> {
    Err(vpcforge::error::VpcForgeError::internal(
        "this build has no AWS support; rebuild with `--features aws` or use `--provider memory`",
    ))
}

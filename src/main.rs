use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use bunker_mesh::digest::{compute_sha256, write_sha256};
use bunker_mesh::error::ErrorKind;
use bunker_mesh::glb::{self, SizeBounds};
use bunker_mesh::manifest::Manifest;
use bunker_mesh::observability::{MetricsCollector, log_snapshot};
use bunker_mesh::pipeline::{Pipeline, RunOutcome};
use bunker_mesh::presets::generate_manifest;
use bunker_mesh::profile::QualityPreset;
use bunker_mesh::stages::{StageRegistry, register_defaults};
use bunker_mesh::validation::{ValidationReport, validate_manifest};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result: Result<()> = match command {
        Commands::Run {
            manifest,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            report,
            otlp_endpoint: _,
        } => run_manifest(
            manifest,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            report,
        ),
        Commands::Validate { manifest } => validate_manifest_cmd(manifest),
        Commands::Inspect { file, max_mb } => inspect(&file, max_mb),
        Commands::Digest { path, output } => digest(&path, output.as_deref()),
        Commands::Preset { action } => preset_command(action),
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "bunker-mesh", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "bunker-mesh")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
            endpoint
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct InputReport {
    input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejected: Option<Rejection>,
}

#[derive(Debug, Serialize)]
struct Rejection {
    kind: ErrorKind,
    detail: String,
}

fn run_manifest(
    manifest_path: PathBuf,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)?;
    let report = validate_manifest(&manifest);
    log_report(&manifest_path, &report);
    if !report.is_ok() {
        bail!(
            "Manifest validation failed with {} error(s)",
            report.errors.len()
        );
    }

    let inputs = manifest.expand_inputs()?;
    if inputs.is_empty() {
        warn!("No inputs resolved for manifest. Nothing to process.");
        return Ok(());
    }

    let config = manifest.into_config()?;
    let pipeline = Pipeline::new(config)
        .context("Failed to prepare pipeline")?
        .with_metrics(MetricsCollector::global().clone());

    let mut reports = Vec::with_capacity(inputs.len());
    let mut failures = 0usize;
    for input in inputs {
        match pipeline.run(&input, manifest.profile) {
            Ok(outcome) => {
                match &outcome {
                    RunOutcome::Completed {
                        output_path,
                        size_decision,
                        degraded,
                        ..
                    } => {
                        println!(
                            "published {input} -> {} ({size_decision:?}{})",
                            output_path.display(),
                            if *degraded { ", degraded" } else { "" }
                        );
                    }
                    RunOutcome::Failed {
                        stage, kind, detail, ..
                    } => {
                        failures += 1;
                        println!("failed {input}: {stage} {kind}: {detail}");
                    }
                }
                reports.push(InputReport {
                    input,
                    outcome: Some(outcome),
                    rejected: None,
                });
            }
            Err(err) => {
                failures += 1;
                println!("rejected {input}: {err}");
                reports.push(InputReport {
                    input,
                    outcome: None,
                    rejected: Some(Rejection {
                        kind: err.kind(),
                        detail: err.to_string(),
                    }),
                });
            }
        }
    }

    if let Some(path) = report_path {
        ensure_parent(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        to_writer_pretty(file, &reports)
            .with_context(|| format!("Failed to write report JSON: {}", path.display()))?;
        info!(report = %path.display(), "Run report written");
    }

    if print_metrics || metrics_json.is_some() || metrics_prometheus.is_some() {
        let snapshot = pipeline.metrics().snapshot();
        if print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = metrics_json {
            ensure_parent(&path)?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = metrics_prometheus {
            ensure_parent(&path)?;
            fs::write(&path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    if failures > 0 {
        bail!("{failures} of {} input(s) failed", reports.len());
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn log_report(manifest_path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %manifest_path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %manifest_path.display(), "{error_msg}");
    }
}

fn validate_manifest_cmd(manifest_path: PathBuf) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)?;
    let report = validate_manifest(&manifest);
    log_report(&manifest_path, &report);

    if report.is_ok() {
        info!(file = %manifest_path.display(), "Manifest validation passed");
        println!("Manifest OK: {}", manifest_path.display());
        Ok(())
    } else {
        Err(anyhow!(
            "Manifest validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn inspect(file: &Path, max_mb: u64) -> Result<()> {
    let bounds = SizeBounds::with_max(max_mb.saturating_mul(1024 * 1024));
    let summary = glb::validate_file(file, bounds)
        .with_context(|| format!("Invalid GLB: {}", file.display()))?;
    serde_json::to_writer_pretty(io::stdout(), &summary)?;
    println!();
    Ok(())
}

fn digest(path: &Path, output: Option<&Path>) -> Result<()> {
    if let Some(out_path) = output {
        let digest = write_sha256(path, out_path)?;
        println!("{}  {}", digest, path.display());
        info!(
            file = %path.display(),
            digest_output = %out_path.display(),
            "SHA256 digest written"
        );
    } else {
        let digest = compute_sha256(path)?;
        println!("{}  {}", digest, path.display());
        info!(file = %path.display(), "SHA256 computed");
    }
    Ok(())
}

fn preset_command(command: PresetCommands) -> Result<()> {
    match command {
        PresetCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("manifests/{preset}.yaml")));
            let generated = generate_manifest(preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Starter manifest generated"
            );
            println!("{}", generated.display());
            Ok(())
        }
    }
}

fn list_stages() {
    let mut registry = StageRegistry::new();
    register_defaults(&mut registry);
    println!("Stages (execution order):");
    for (kind, description) in registry.known_stages() {
        let role = if kind.is_critical() {
            "critical"
        } else {
            "optional"
        };
        println!("- {kind} [{role}]: {description}");
    }
}

#[derive(Parser)]
#[command(
    name = "bunker-mesh",
    version,
    about = "Sandboxed GLB compression pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every input named by a manifest.
    Run {
        manifest: PathBuf,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Check a manifest without running anything.
    Validate { manifest: PathBuf },
    /// Structurally validate a GLB file and print its chunk table.
    Inspect {
        file: PathBuf,
        #[arg(long = "max-mb", default_value_t = 512)]
        max_mb: u64,
    },
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Preset {
        #[command(subcommand)]
        action: PresetCommands,
    },
    ListStages,
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum PresetCommands {
    New {
        #[arg(long, value_enum)]
        preset: QualityPreset,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

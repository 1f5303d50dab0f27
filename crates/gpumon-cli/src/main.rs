use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use gpumon_common::config::{GpumonConfig, ReaderMode};
use gpumon_common::{stop_channel, TagSet};
use gpumon_core::{parse_log, Scheduler};
use gpumon_obs::PipelineMetrics;
use gpumon_reader::{DeviceReader, DmonReader, DmonRecorder, SmiQueryReader};
use gpumon_reader_nvml::NvmlReader;
use gpumon_sink::{bootstrap, BatchSink, BootstrapPlan, InfluxClient, RetryPolicy, SinkWriter, WriteTarget};
use opentelemetry_otlp::WithExportConfig;
use tracing::{debug, info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gpumon", version, about = "Samples GPU telemetry into InfluxDB")]
struct Cli {
    /// Force debug logging regardless of RUST_LOG
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sampling pipeline until Ctrl-C
    Log(LogArgs),
    /// Record `nvidia-smi dmon` output to a log file until Ctrl-C
    Record(RecordArgs),
    /// Parse a saved `nvidia-smi dmon` log and print one JSON object per line
    Parse(ParseArgs),
    /// List visible GPUs
    Devices(DevicesArgs),
    Version,
}

#[derive(Args, Debug)]
struct LogArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    database: Option<String>,
    #[arg(long)]
    series_name: Option<String>,
    /// Retention duration literal, e.g. 12h, 7d, 4w or INF
    #[arg(long)]
    retention: Option<String>,
    #[arg(long)]
    interval_ms: Option<u64>,
    #[arg(long)]
    tick_timeout_ms: Option<u64>,
    /// Total write attempts per batch
    #[arg(long)]
    retries: Option<u32>,
    #[arg(long)]
    retry_pause_ms: Option<u64>,
    /// query, dmon or nvml
    #[arg(long)]
    reader: Option<ReaderMode>,
    #[arg(long)]
    smi_path: Option<PathBuf>,
    /// Extra tag attached to every point (repeatable)
    #[arg(long = "tag", value_name = "KEY=VALUE")]
    tags: Vec<String>,
    /// Serve /metrics and /healthz on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Args, Debug)]
struct RecordArgs {
    file: PathBuf,
    /// Seconds between dmon samples
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,
    #[arg(long)]
    smi_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ParseArgs {
    file: PathBuf,
    /// Only print the rejection summary
    #[arg(long)]
    summary_only: bool,
}

#[derive(Args, Debug)]
struct DevicesArgs {
    #[arg(long)]
    reader: Option<ReaderMode>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.debug);
    match dotenv {
        Ok(path) => debug!("loaded {}", path.display()),
        Err(e) => debug!("no .env loaded: {e}"),
    }

    let result = match cli.command {
        Commands::Log(args) => log(args).await,
        Commands::Record(args) => record(args).await,
        Commands::Parse(args) => parse(args),
        Commands::Devices(args) => devices(args).await,
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gpumon: {e:#}");
            ExitCode::FAILURE
        }
    }
}

impl LogArgs {
    fn apply(&self, cfg: &mut GpumonConfig) -> anyhow::Result<()> {
        let store = &mut cfg.store;
        if let Some(v) = &self.host { store.host = v.clone(); }
        if let Some(v) = self.port { store.port = v; }
        if let Some(v) = &self.username { store.username = v.clone(); }
        if let Some(v) = &self.password { store.password = v.clone(); }
        if let Some(v) = &self.database { store.database = v.clone(); }
        if let Some(v) = &self.series_name { store.series_name = v.clone(); }
        if let Some(v) = &self.retention { store.retention_duration = v.clone(); }
        if let Some(v) = self.interval_ms { cfg.sampler.polling_interval_ms = v; }
        if let Some(v) = self.tick_timeout_ms { cfg.sampler.tick_timeout_ms = v; }
        if let Some(v) = self.retries { cfg.sampler.write_retries = v; }
        if let Some(v) = self.retry_pause_ms { cfg.sampler.retry_pause_ms = v; }
        if let Some(v) = self.reader { cfg.reader.mode = v; }
        if let Some(v) = &self.smi_path { cfg.reader.smi_path = v.clone(); }
        if !self.tags.is_empty() {
            cfg.tags.extend(&TagSet::from_pairs(&self.tags)?);
        }
        Ok(())
    }
}

fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".into())
}

async fn log(args: LogArgs) -> anyhow::Result<()> {
    let mut cfg = GpumonConfig::load().context("loading configuration")?;
    args.apply(&mut cfg)?;
    cfg.tags = std::mem::take(&mut cfg.tags).with_default("host", host_name());
    cfg.validate()?;

    let metrics = PipelineMetrics::new()?;
    let client = InfluxClient::connect(&cfg.store).await?;
    let report = bootstrap(&client, &BootstrapPlan::from_config(&cfg.store)?).await?;
    info!(
        "database {} (created: {}), retention policy {} ({:?})",
        cfg.store.database, report.created_database, cfg.store.retention_policy, report.policy
    );
    let sink = SinkWriter::new(
        client,
        WriteTarget::from_config(&cfg.store),
        cfg.tags.clone(),
        RetryPolicy::from_sampler(&cfg.sampler),
    );

    let reader = &cfg.reader;
    match reader.mode {
        ReaderMode::Query => {
            run_pipeline(SmiQueryReader::new(&reader.smi_path, reader.extended), sink, &cfg, metrics, args.metrics_addr).await
        }
        ReaderMode::Dmon => {
            let dmon = DmonReader::new(&reader.smi_path, reader.dmon_interval_secs, reader.line_wait());
            run_pipeline(dmon, sink, &cfg, metrics, args.metrics_addr).await
        }
        ReaderMode::Nvml => run_pipeline(NvmlReader::new(), sink, &cfg, metrics, args.metrics_addr).await,
    }
}

async fn run_pipeline<R, S>(
    reader: R,
    sink: S,
    cfg: &GpumonConfig,
    metrics: PipelineMetrics,
    metrics_addr: Option<SocketAddr>,
) -> anyhow::Result<()>
where
    R: DeviceReader + 'static,
    S: BatchSink + 'static,
{
    let scheduler = Scheduler::new(reader, sink, cfg.sampler.clone(), metrics.clone());
    let handle = scheduler.handle();

    let exporter = match metrics_addr {
        Some(addr) => {
            let listener =
                tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding metrics address {addr}"))?;
            Some(tokio::spawn(gpumon_obs::serve(listener, metrics.clone(), handle.signal())))
        }
        None => None,
    };

    let ctrl_c = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                handle.stop();
            }
        })
    };

    let result = scheduler.run().await;
    handle.stop();
    ctrl_c.abort();
    if let Some(exporter) = exporter {
        match exporter.await {
            Ok(Err(e)) => warn!("metrics exporter failed: {e}"),
            Err(e) => warn!("metrics exporter task failed: {e}"),
            Ok(Ok(())) => {}
        }
    }
    metrics.flush();
    Ok(result?)
}

async fn record(args: RecordArgs) -> anyhow::Result<()> {
    let cfg = GpumonConfig::load().context("loading configuration")?;
    let smi_path = args.smi_path.unwrap_or(cfg.reader.smi_path);
    let recorder = DmonRecorder::new(smi_path, args.interval, &args.file);

    let (trigger, stop) = stop_channel();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            trigger.stop();
        }
    });
    let result = recorder.record(&stop).await;
    ctrl_c.abort();
    result.with_context(|| format!("recording to {}", args.file.display()))
}

fn parse(args: ParseArgs) -> anyhow::Result<()> {
    let parsed = parse_log(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
    if !args.summary_only {
        for m in &parsed.measurements {
            println!("{}", serde_json::to_string(m)?);
        }
    }
    let mut by_reason: BTreeMap<&str, usize> = BTreeMap::new();
    for r in &parsed.rejected {
        *by_reason.entry(r.reason.reason()).or_default() += 1;
    }
    eprintln!("{} measurement(s), {} rejected line(s)", parsed.measurements.len(), parsed.rejected.len());
    for (reason, count) in by_reason {
        eprintln!("  {reason}: {count}");
    }
    Ok(())
}

async fn devices(args: DevicesArgs) -> anyhow::Result<()> {
    let cfg = GpumonConfig::load().context("loading configuration")?;
    let mode = args.reader.unwrap_or(cfg.reader.mode);
    let r = &cfg.reader;
    match mode {
        ReaderMode::Query => list_devices(SmiQueryReader::new(&r.smi_path, r.extended)).await,
        ReaderMode::Dmon => list_devices(DmonReader::new(&r.smi_path, r.dmon_interval_secs, r.line_wait())).await,
        ReaderMode::Nvml => list_devices(NvmlReader::new()).await,
    }
}

async fn list_devices<R: DeviceReader>(mut reader: R) -> anyhow::Result<()> {
    reader.open().await?;
    let listed = reader.describe().await;
    reader.close().await;
    let devices = listed?;
    if devices.is_empty() {
        println!("no devices reported by the {} reader", reader.name());
    }
    for d in devices {
        let name = d.name.as_deref().unwrap_or("unknown");
        match d.driver_version {
            Some(driver) => println!("gpu {}: {name} (driver {driver})", d.index),
            None => println!("gpu {}: {name}", d.index),
        }
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    let directives = if debug { "debug".to_string() } else { std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()) };
    let env_filter = tracing_subscriber::EnvFilter::new(directives);

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

mod prompts;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use enginebench_benchmark::export::to_csv;
use enginebench_benchmark::{
    BenchmarkRunner, ConcurrentRequest, ConnectionRegistry, ExportFormat, ExportSelection,
    LoadEvent, LoadTarget, LoadTestConfig, LoadTestReport, MetricsCollector, RunMode,
};
use enginebench_core::{AggregateMetrics, EngineBenchConfig, HealthStatus, RequestOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::prompts::get_prompts;

#[derive(Parser)]
#[command(name = "enginebench")]
#[command(about = "EngineBench - compare LLM inference backends", long_about = None)]
struct Cli {
    /// JSON config file with engine definitions
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every configured engine
    Health {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// List models served by each engine
    Models {
        /// Only this engine
        #[arg(short, long)]
        engine: Option<String>,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Fixed number of requests per engine, then aggregate
    Bench {
        /// Engines to benchmark (default: all registered)
        #[arg(short, long)]
        engine: Vec<String>,

        /// Model for every engine (default: each engine's default_model)
        #[arg(short, long)]
        model: Option<String>,

        /// Requests per engine
        #[arg(short, long, default_value = "5")]
        iterations: u32,

        /// Max requests in flight (default: from config)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Prompt set to use (mixed, short, long, coding, reasoning)
        #[arg(short, long, default_value = prompts::DEFAULT_SET)]
        prompts: String,

        /// Stream responses to measure TTFT directly
        #[arg(long)]
        stream: bool,

        /// Temperature for generation
        #[arg(short, long, default_value = "0.0")]
        temperature: f32,

        /// Max tokens to generate
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        output: String,

        /// Write the collection to this file
        #[arg(long)]
        export: Option<PathBuf>,

        /// Export format (json, csv)
        #[arg(long, default_value = "json")]
        export_format: String,
    },

    /// Sustained multi-user load for a fixed duration
    Load {
        /// Engines to load (default: all registered)
        #[arg(short, long)]
        engine: Vec<String>,

        /// Model for every engine (default: each engine's default_model)
        #[arg(short, long)]
        model: Option<String>,

        /// Concurrent virtual users per engine (default: from config)
        #[arg(short, long)]
        users: Option<u32>,

        /// Test duration in seconds (default: from config)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Delay between requests of one user, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Prompt set to use (mixed, short, long, coding, reasoning)
        #[arg(short, long, default_value = prompts::DEFAULT_SET)]
        prompts: String,

        /// Stream responses to measure TTFT directly
        #[arg(long)]
        stream: bool,

        /// Run engines one after another instead of together
        #[arg(long)]
        sequential: bool,

        /// Max tokens to generate
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        output: String,

        /// Write the collection to this file
        #[arg(long)]
        export: Option<PathBuf>,

        /// Export format (json, csv)
        #[arg(long, default_value = "json")]
        export_format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let registry = Arc::new(ConnectionRegistry::new(config.health_cache_ttl()));

    let registered = registry.register_all(config.engines.clone()).await;
    for (name, ok) in &registered {
        if !ok {
            warn!(engine = %name, "Engine unavailable, skipping");
        }
    }

    let outcome = run(cli.command, &config, &registry, &registered).await;
    registry.close_all().await;
    outcome
}

async fn run(
    command: Commands,
    config: &EngineBenchConfig,
    registry: &Arc<ConnectionRegistry>,
    registered: &BTreeMap<String, bool>,
) -> Result<()> {
    match command {
        Commands::Health { output } => cmd_health(registry, registered, &output).await,
        Commands::Models { engine, output } => cmd_models(registry, engine.as_deref(), &output).await,
        Commands::Bench {
            engine,
            model,
            iterations,
            concurrency,
            prompts,
            stream,
            temperature,
            max_tokens,
            output,
            export,
            export_format,
        } => {
            let collector = Arc::new(MetricsCollector::new(Arc::clone(registry)));
            let targets = resolve_targets(registry, &engine, model.as_deref())?;
            let options = RequestOptions {
                temperature: Some(temperature),
                max_tokens,
                ..RequestOptions::default()
            };
            cmd_bench(
                &collector,
                &targets,
                iterations,
                concurrency.unwrap_or(config.max_concurrency),
                &get_prompts(&prompts),
                stream,
                options,
                &output,
            )
            .await?;
            export_collection(&collector, export, &export_format)
        }
        Commands::Load {
            engine,
            model,
            users,
            duration,
            delay_ms,
            prompts,
            stream,
            sequential,
            max_tokens,
            output,
            export,
            export_format,
        } => {
            let collector = Arc::new(MetricsCollector::new(Arc::clone(registry)));
            let targets = resolve_targets(registry, &engine, model.as_deref())?;

            let mut load = LoadTestConfig::from_defaults(&config.load, get_prompts(&prompts));
            if let Some(users) = users {
                load.concurrent_users = users;
            }
            if let Some(secs) = duration {
                load.duration = Duration::from_secs(secs);
            }
            if let Some(ms) = delay_ms {
                load.request_delay = Duration::from_millis(ms);
            }
            load.capture_ttft = stream;
            load.mode = if sequential { RunMode::Sequential } else { RunMode::Simultaneous };
            load.options.max_tokens = max_tokens;

            cmd_load(&collector, &targets, &load, &output).await?;
            export_collection(&collector, export, &export_format)
        }
    }
}

/// Config file when given, otherwise defaults; environment applies on top.
fn load_config(path: Option<&PathBuf>) -> Result<EngineBenchConfig> {
    let mut config = match path {
        Some(path) => EngineBenchConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => EngineBenchConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok());

    if config.engines.is_empty() {
        debug!("No engines configured, falling back to local Ollama");
        config.apply_env(|key| (key == "OLLAMA_HOST").then(|| "http://localhost:11434".to_string()));
    }
    Ok(config)
}

fn resolve_targets(
    registry: &ConnectionRegistry,
    engines: &[String],
    model: Option<&str>,
) -> Result<Vec<LoadTarget>> {
    let names = match engines.is_empty() {
        true => registry.list_engines(),
        false => engines.to_vec(),
    };
    if names.is_empty() {
        bail!("no healthy engines registered");
    }

    names
        .into_iter()
        .map(|name| {
            let default_model = registry.config(&name).and_then(|c| c.default_model);
            let model = model
                .map(str::to_string)
                .or(default_model)
                .with_context(|| format!("no model for engine '{}': pass --model or set default_model", name))?;
            Ok(LoadTarget::new(name, model))
        })
        .collect()
}

async fn cmd_health(
    registry: &ConnectionRegistry,
    registered: &BTreeMap<String, bool>,
    output: &str,
) -> Result<()> {
    let statuses = registry.health_check_all(false).await;

    if output == "json" {
        let view: BTreeMap<&str, &HealthStatus> =
            statuses.iter().map(|(k, v)| (k.as_str(), &**v)).collect();
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Engine Health:");
    println!("{:-<60}", "");
    for (name, ok) in registered {
        match statuses.get(name).filter(|_| *ok) {
            Some(status) if status.healthy => println!(
                "  {:<12} UP    {:>8.1} ms  {}",
                name,
                status.response_time * 1000.0,
                status.version.as_deref().unwrap_or("-")
            ),
            Some(status) => println!(
                "  {:<12} DOWN  {}",
                name,
                status.error.as_deref().unwrap_or("unhealthy")
            ),
            None => println!("  {:<12} DOWN  failed registration", name),
        }
    }
    println!();

    Ok(())
}

async fn cmd_models(registry: &ConnectionRegistry, engine: Option<&str>, output: &str) -> Result<()> {
    let models = match engine {
        Some(name) => BTreeMap::from([(name.to_string(), registry.discover_models(name).await?)]),
        None => registry.discover_all_models().await,
    };

    if output == "json" {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    for (name, list) in &models {
        println!("{} ({} models):", name, list.len());
        println!("{:-<60}", "");
        for (i, m) in list.iter().enumerate() {
            let quant = m.quantization.as_deref().unwrap_or("-");
            println!("  {:<4} {:<40} {}", i + 1, m.name, quant);
        }
        println!();
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_bench(
    collector: &MetricsCollector,
    targets: &[LoadTarget],
    iterations: u32,
    concurrency: usize,
    prompts: &[String],
    stream: bool,
    options: RequestOptions,
    output: &str,
) -> Result<()> {
    collector.start_collection(Some(format!("bench: {} iterations", iterations)));

    let options = &options;
    let requests: Vec<ConcurrentRequest> = targets
        .iter()
        .flat_map(|t| {
            (0..iterations as usize).map(move |i| ConcurrentRequest {
                backend: t.backend.clone(),
                prompt: prompts[i % prompts.len()].clone(),
                model: t.model.clone(),
                stream,
                options: options.clone(),
            })
        })
        .collect();

    println!();
    println!("Running benchmark...");
    println!("  Engines:     {}", targets.len());
    println!("  Iterations:  {}", iterations);
    println!("  Concurrency: {}", concurrency);
    println!();

    let results = collector.collect_concurrent(requests, concurrency).await?;
    let failed = results.iter().filter(|r| !r.success).count();
    info!(total = results.len(), failed, "Benchmark requests complete");

    let aggregates = collector.aggregate(None)?;
    match output {
        "json" => println!("{}", serde_json::to_string_pretty(&aggregates)?),
        "csv" => {
            println!("engine,total,success_rate,mean_s,p50_s,p95_s,p99_s,mean_ttft_s,tokens_per_second");
            for a in &aggregates {
                println!(
                    "{},{},{:.4},{},{},{},{},{},{}",
                    a.engine_name,
                    a.total_requests,
                    a.success_rate,
                    cell(a.mean_latency),
                    cell(a.p50_latency),
                    cell(a.p95_latency),
                    cell(a.p99_latency),
                    cell(a.mean_ttft),
                    cell(a.tokens_per_second),
                );
            }
        }
        _ => print_aggregates(&aggregates),
    }

    Ok(())
}

async fn cmd_load(
    collector: &Arc<MetricsCollector>,
    targets: &[LoadTarget],
    config: &LoadTestConfig,
    output: &str,
) -> Result<()> {
    let runner = BenchmarkRunner::new(Arc::clone(collector));
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<LoadEvent>(256);

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight requests");
            ctrl_c.cancel();
        }
    });

    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                LoadEvent::Started { backend, users, duration_secs } => {
                    println!("  {} started: {} users for {:.0}s", backend, users, duration_secs)
                }
                LoadEvent::RequestComplete { backend, success: false, .. } => {
                    debug!(backend = %backend, "Request failed")
                }
                LoadEvent::BackendComplete { result } => println!(
                    "  {} finished: {} requests, {} failed",
                    result.backend, result.total_requests, result.failed_requests
                ),
                _ => {}
            }
        }
    });

    println!();
    println!("Running load test...");
    println!("  Users:    {}", config.concurrent_users);
    println!("  Duration: {}s", config.duration.as_secs());
    println!("  Mode:     {:?}", config.mode);
    println!();

    let report = runner.run(targets, config, cancel, Some(tx)).await?;
    progress.await.ok();
    collector.aggregate(None)?;

    match output {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_report(&report),
    }

    Ok(())
}

fn export_collection(collector: &MetricsCollector, path: Option<PathBuf>, format: &str) -> Result<()> {
    let Some(path) = path else { return Ok(()) };
    let format: ExportFormat = format.parse()?;

    if format == ExportFormat::Csv {
        // Fail before touching the file when there is nothing to write.
        to_csv(&collector.snapshot()?.parsed_metrics)?;
    }
    collector.export(&path, format, ExportSelection::default())?;
    println!("Exported {} to {}", format, path.display());
    Ok(())
}

fn print_aggregates(aggregates: &[AggregateMetrics]) {
    println!("Results:");
    for a in aggregates {
        println!("{:-<60}", "");
        println!("  Engine:        {}", a.engine_name);
        println!(
            "  Requests:      {} ({} ok, {} failed, {:.1}%)",
            a.total_requests,
            a.successful_requests,
            a.failed_requests,
            a.success_rate * 100.0
        );
        println!("  Latency mean:  {}", ms(a.mean_latency));
        println!("  Latency p50:   {}", ms(a.p50_latency));
        println!("  Latency p95:   {}", ms(a.p95_latency));
        println!("  Latency p99:   {}", ms(a.p99_latency));
        println!(
            "  TTFT mean:     {}{}",
            ms(a.mean_ttft),
            match a.estimated_ttft_count {
                0 => String::new(),
                n => format!(" ({} estimated)", n),
            }
        );
        println!("  Tokens/sec:    {}", a.tokens_per_second.map_or("-".into(), |t| format!("{:.2}", t)));
        for (kind, count) in &a.error_types {
            println!("  Errors:        {} x{}", kind, count);
        }
    }
    println!();
}

fn print_report(report: &LoadTestReport) {
    println!("Load Test Results:");
    for r in &report.results {
        println!("{:-<60}", "");
        println!("  Engine:        {} ({})", r.backend, r.model);
        println!("  Requests:      {} ({} failed)", r.total_requests, r.failed_requests);
        println!("  Wall clock:    {:.2}s", r.wall_clock_secs);
        println!("  Req/sec:       {:.2}", r.requests_per_second);
        println!("  p50 / p95:     {} / {}", ms(r.response_time.p50), ms(r.response_time.p95));
        println!("  TTFT p50:      {}", ms(r.ttft.p50));
    }
    println!("{:-<60}", "");
    match &report.winner {
        Some(winner) => println!("  Winner (lowest p95): {}", winner),
        None => println!("  Winner: none (no successful requests)"),
    }
    if report.cancelled {
        println!("  Run was cancelled early");
    }
    println!();
}

fn ms(secs: Option<f64>) -> String {
    secs.map_or("-".to_string(), |s| format!("{:.2} ms", s * 1000.0))
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| format!("{:.4}", v)).unwrap_or_default()
}

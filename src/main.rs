use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use cloudcache::agent::{
    scheduler, CachedResource, CachingAgent, HealthEnricher, PollingAgent, RouterHealthCheck,
    RoutedSource,
};
use cloudcache::backend::CacheBackend;
use cloudcache::cache::{Enricher, NoEnrichment, ReconcilingCache};
use cloudcache::config::Config;
use cloudcache::metrics::{MetricsSink, TracingMetrics};
use cloudcache::pool::WorkerPool;
use cloudcache::provider::{
    CredentialResolver, HttpLiveClient, HttpRoleExchange, LiveClient, ResolvedCredential,
};
use cloudcache::rate_limit::RateLimiter;
use cloudcache::router::{CallRouter, OperationRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Polls provider resources through the cache backend and keeps them reconciled
#[derive(Parser, Debug)]
#[command(name = "cloudcache", version = cloudcache::VERSION, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to {config_dir}/cloudcache/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off")]
    log_level: LogLevel,

    /// Run a single cycle of every agent and exit
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(tracing_level.as_str().to_ascii_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("cloudcache {} started with log level: {:?}", cloudcache::VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("cloudcache").join("cloudcache.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".cloudcache").join("cloudcache.log");
    }
    PathBuf::from("cloudcache.log")
}

/// An agent plus how often and how long it may run
struct Scheduled {
    agent: Arc<dyn CachingAgent>,
    interval: Duration,
    cycle_timeout: Duration,
}

fn build_agents(config: &Config, metrics: Arc<dyn MetricsSink>) -> Result<Vec<Scheduled>> {
    let base = ResolvedCredential::from_env()?;
    let exchange = Arc::new(HttpRoleExchange::new(
        Duration::from_millis(config.exchange.timeout_ms),
        Duration::from_secs(config.exchange.expiry_buffer_secs),
    )?);
    let resolver = Arc::new(CredentialResolver::new(
        base,
        exchange,
        config.exchange.endpoints.clone(),
    ));
    let backend = Arc::new(CacheBackend::new(config.cache_backend.clone(), metrics.clone())?);
    let live: Arc<dyn LiveClient> = Arc::new(HttpLiveClient::new(
        &config.live.endpoint,
        Duration::from_millis(config.live.timeout_ms),
    )?);
    let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone(), metrics.clone()));
    let registry = Arc::new(OperationRegistry::builtin());

    let mut scheduled = Vec::new();
    for account in &config.accounts {
        for def in &config.agents {
            for handle in account.handles(&def.service) {
                let router = Arc::new(
                    CallRouter::new(
                        handle.clone(),
                        registry.clone(),
                        backend.clone(),
                        live.clone(),
                        resolver.clone(),
                        limiter.clone(),
                        metrics.clone(),
                    )
                    .with_disabled_services(config.disabled_services.iter().cloned()),
                );

                let enricher: Arc<dyn Enricher<String, CachedResource>> = match &def.health_operation {
                    Some(operation) => Arc::new(HealthEnricher::new(Arc::new(RouterHealthCheck::new(
                        router.clone(),
                        operation,
                        &def.ids_param,
                        &def.health_items_field,
                        &def.health_state_field,
                    )))),
                    None => Arc::new(NoEnrichment),
                };

                let scope = format!("{}/{}", handle, def.resource_type);
                let agent = PollingAgent::new(
                    Arc::new(RoutedSource::new(def.clone(), router)),
                    Arc::new(ReconcilingCache::new(&def.resource_type)),
                    WorkerPool::new(&scope, config.worker_pool_size),
                    enricher,
                    metrics.clone(),
                );

                scheduled.push(Scheduled {
                    agent: Arc::new(agent),
                    interval: Duration::from_secs(def.interval_secs),
                    cycle_timeout: config.cycle_timeout(def),
                });
            }
        }
    }

    Ok(scheduled)
}

async fn run_once(scheduled: &[Scheduled]) -> Result<()> {
    let mut failed = 0;
    for entry in scheduled {
        match scheduler::run_bounded(entry.agent.as_ref(), entry.cycle_timeout).await {
            Ok(report) => println!(
                "{}: {} listed, {} added, {} changed, {} unchanged, {} evicted",
                entry.agent.name(),
                report.listed,
                report.added,
                report.changed,
                report.unchanged,
                report.evicted
            ),
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", entry.agent.name(), e);
            },
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} cycles failed", failed, scheduled.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level)?;

    let config = Config::load(args.config.as_deref())?;
    let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);
    let scheduled = build_agents(&config, metrics)?;

    if scheduled.is_empty() {
        tracing::warn!("No agents configured");
        eprintln!("No agents configured");
        return Ok(());
    }

    if args.once {
        return run_once(&scheduled).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles: Vec<_> = scheduled
        .iter()
        .map(|entry| {
            scheduler::spawn(
                entry.agent.clone(),
                entry.interval,
                entry.cycle_timeout,
                shutdown_rx.clone(),
            )
        })
        .collect();

    tracing::info!("Running {} agents", handles.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Agent task failed: {}", e);
        }
    }

    Ok(())
}

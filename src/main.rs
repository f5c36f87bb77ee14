//! api-pulse demo server
//!
//! Serves a small in-memory API, records every request into the metrics
//! aggregator and probes its own routes on demand.
//!
//! ```text
//!   curl localhost:3000/health/pulse                 # snapshot
//!   curl -N localhost:3000/health/pulse/stream       # SSE
//!   curl -X POST localhost:3000/health/pulse/probe   # start a probe job
//! ```

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use api_pulse::clock::{Clock, TokioClock};
use api_pulse::config::{AggregatorConfig, ProbeConfig};
use api_pulse::handlers::items::{self, ItemStore};
use api_pulse::metrics::MetricsAggregator;
use api_pulse::probe::{EndpointCatalog, HttpTransport, ProbeJobManager, StaticCatalog};
use api_pulse::{server, AppState};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Request metrics and synthetic probes for an axum service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    bind_addr: String,

    /// Base URL probes are sent to (defaults to the bound port on localhost)
    #[arg(long, env = "PROBE_BASE_URL")]
    probe_base_url: Option<String>,

    /// Rolling window length in seconds
    #[arg(long, env = "WINDOW_SECONDS", default_value = "300")]
    window_seconds: u64,

    /// Rolling window bucket width in seconds
    #[arg(long, env = "BUCKET_SECONDS", default_value = "60")]
    bucket_seconds: u64,

    /// Maximum number of tracked endpoints
    #[arg(long, env = "MAX_ENDPOINTS", default_value = "1000")]
    max_endpoints: usize,

    /// Centroid budget of each percentile estimator
    #[arg(long, env = "MAX_CENTROIDS", default_value = "100")]
    max_centroids: usize,

    /// Minimum seconds between probe job starts (0 disables the cooldown)
    #[arg(long, env = "MIN_PROBE_INTERVAL_SECONDS", default_value = "10")]
    min_probe_interval_seconds: u64,

    /// Maximum concurrently running probe jobs
    #[arg(long, env = "MAX_CONCURRENT_JOBS", default_value = "2")]
    max_concurrent_jobs: usize,

    /// Probe job deadline in seconds
    #[arg(long, env = "JOB_TIMEOUT_SECONDS", default_value = "30")]
    job_timeout_seconds: u64,

    /// Endpoints probed in parallel within one job
    #[arg(long, env = "PROBE_FAN_OUT", default_value = "4")]
    fan_out: usize,

    /// Per-request probe timeout in seconds
    #[arg(long, env = "PROBE_TIMEOUT_SECONDS", default_value = "10")]
    probe_timeout_seconds: u64,

    /// Latency above which a successful probe is reported as a warning
    #[arg(long, env = "LATENCY_THRESHOLD_MS", default_value = "1000")]
    latency_threshold_ms: u64,

    /// Run a probe of every catalogued endpoint once the server is up
    #[arg(long, env = "PROBE_ON_START")]
    probe_on_start: bool,

    /// Comma-separated CORS origins
    #[arg(
        long,
        env = "ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000"
    )]
    allowed_origins: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            window_seconds: self.window_seconds,
            bucket_seconds: self.bucket_seconds,
            max_endpoints: self.max_endpoints,
            max_centroids: self.max_centroids,
        }
    }

    fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            min_probe_interval: Duration::from_secs(self.min_probe_interval_seconds),
            max_concurrent_jobs: self.max_concurrent_jobs,
            job_timeout: Duration::from_secs(self.job_timeout_seconds),
            fan_out: self.fan_out,
            probe_timeout: Duration::from_secs(self.probe_timeout_seconds),
            latency_threshold: Duration::from_millis(self.latency_threshold_ms),
            ..ProbeConfig::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting api-pulse");
    info!("  Window: {}s in {}s buckets", args.window_seconds, args.bucket_seconds);
    info!("  Max endpoints: {}", args.max_endpoints);
    info!(
        "  Probe cooldown: {}s, max concurrent jobs: {}",
        args.min_probe_interval_seconds, args.max_concurrent_jobs
    );

    // ── 1. Bind first so the probe base URL knows the real port ──
    let listener = tokio::net::TcpListener::bind(&args.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.bind_addr))?;
    let local_addr = listener.local_addr()?;
    let probe_base_url = args
        .probe_base_url
        .clone()
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", local_addr.port()));

    // ── 2. Build shared state ────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let metrics = Arc::new(MetricsAggregator::new(args.aggregator_config(), clock.clone())?);

    let catalog = Arc::new(StaticCatalog::new());
    items::register(&catalog);

    let transport = Arc::new(HttpTransport::new(probe_base_url.clone())?);
    let probes = Arc::new(ProbeJobManager::new(
        args.probe_config(),
        clock,
        metrics.clone(),
        catalog.clone(),
        transport,
    )?);

    let state = Arc::new(AppState {
        metrics,
        probes: probes.clone(),
        catalog: catalog.clone(),
    });

    // ── 3. Build router ──────────────────────────────────────────
    let app = items::router(Arc::new(ItemStore::seeded()));
    let app = server::create_router(state, app).layer(server::cors_layer(&args.allowed_origins));

    info!("Listening on http://{}", local_addr);
    info!("  Metrics JSON → /health/pulse");
    info!("  Metrics SSE  → /health/pulse/stream");
    info!("  Probe target → {}", probe_base_url);

    if args.probe_on_start {
        let job_id = probes.start_probe(catalog.endpoints())?;
        info!(%job_id, "Startup probe scheduled");
    }

    // ── 4. Serve ─────────────────────────────────────────────────
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited with error")?;

    info!("api-pulse stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "tower_http=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

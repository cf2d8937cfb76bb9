//! Jiva Operator entry point
//!
//! Parses configuration from flags and environment, starts the health and
//! metrics endpoints, connects to the cluster, and runs the reconcile
//! loop until SIGTERM.

use clap::Parser;
use kube::{Client, CustomResourceExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jiva_operator::{
    BackoffConfig, EngineConfig, Error, JivaVolume, Operator, OperatorConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Jiva Operator - reconciles JivaVolume resources into jiva engine workloads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to watch (injected via the downward API in-cluster)
    #[arg(long, env = "OPENEBS_NAMESPACE")]
    namespace: Option<String>,

    /// Health probe bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8282")]
    health_addr: String,

    /// Metrics bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8383")]
    metrics_addr: String,

    /// Number of reconcile workers
    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Work queue capacity
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 512)]
    queue_capacity: usize,

    /// Deadline for individual state-store calls, in seconds
    #[arg(long, env = "API_TIMEOUT_SECS", default_value_t = 15)]
    api_timeout_secs: u64,

    /// Requeue interval while a volume is converging, in seconds
    #[arg(long, env = "REQUEUE_SECS", default_value_t = 5)]
    requeue_secs: u64,

    /// How long the controller may stay unready before the volume is
    /// marked Failed, in seconds
    #[arg(long, env = "CONTROLLER_RETRY_BUDGET_SECS", default_value_t = 300)]
    retry_budget_secs: u64,

    /// First retry delay after a transient failure, in milliseconds
    #[arg(long, env = "BACKOFF_INITIAL_MS", default_value_t = 500)]
    backoff_initial_ms: u64,

    /// Ceiling for the retry delay, in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,

    /// Growth factor between consecutive retry delays
    #[arg(long, env = "BACKOFF_MULTIPLIER", default_value_t = 2.0)]
    backoff_multiplier: f64,

    /// Image for jiva controller pods
    #[arg(
        long,
        env = "JIVA_CONTROLLER_IMAGE",
        default_value = "openebs/jiva:3.6.2"
    )]
    controller_image: String,

    /// Image for jiva replica pods
    #[arg(long, env = "JIVA_REPLICA_IMAGE", default_value = "openebs/jiva:3.6.2")]
    replica_image: String,

    /// Storage class for replica data claims when the volume names none
    #[arg(long, env = "JIVA_STORAGE_CLASS")]
    storage_class: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the JivaVolume CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

impl Args {
    fn to_config(&self, namespace: String) -> OperatorConfig {
        OperatorConfig {
            namespace,
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            api_timeout: Duration::from_secs(self.api_timeout_secs),
            requeue_converging: Duration::from_secs(self.requeue_secs),
            backoff: BackoffConfig {
                initial: Duration::from_millis(self.backoff_initial_ms),
                max: Duration::from_secs(self.backoff_max_secs),
                multiplier: self.backoff_multiplier,
            },
            controller_retry_budget: Duration::from_secs(self.retry_budget_secs),
            engine: EngineConfig {
                controller_image: self.controller_image.clone(),
                replica_image: self.replica_image.clone(),
                default_storage_class: self.storage_class.clone(),
            },
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.crd {
        let crd = serde_yaml::to_string(&JivaVolume::crd())
            .map_err(|e| Error::Internal(format!("Failed to render CRD: {}", e)))?;
        println!("{crd}");
        return Ok(());
    }

    init_logging(&args);

    let namespace = args.namespace.clone().ok_or_else(|| {
        Error::Configuration("OPENEBS_NAMESPACE must be set".to_string())
    })?;

    info!("Starting Jiva Operator");
    info!("  Version: {}", jiva_operator::VERSION);
    info!("  Namespace: {}", namespace);
    info!("  Workers: {}", args.workers);
    info!("  Controller image: {}", args.controller_image);
    info!("  Replica image: {}", args.replica_image);

    let config = args.to_config(namespace);

    let client = Client::try_default().await?;

    let operator = Operator::new(config, client, prometheus::default_registry())?;
    let ready = operator.ready_flag();
    let token = operator.shutdown_token();

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Translate SIGTERM/ctrl-c into a queue drain and worker stop
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        token.cancel();
    });

    operator.run().await?;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

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

// =============================================================================
// Shutdown Signal
// =============================================================================

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => ctrl_c.await,
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = Arc::clone(&ready);
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = Arc::clone(&ready);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => Response::builder()
                            .status(StatusCode::OK)
                            .body(Body::from("ok"))
                            .unwrap(),
                        "/readyz" => {
                            if ready.load(Ordering::SeqCst) {
                                Response::builder()
                                    .status(StatusCode::OK)
                                    .body(Body::from("ok"))
                                    .unwrap()
                            } else {
                                Response::builder()
                                    .status(StatusCode::SERVICE_UNAVAILABLE)
                                    .body(Body::from("not ready"))
                                    .unwrap()
                            }
                        }
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("not found"))
                            .unwrap(),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

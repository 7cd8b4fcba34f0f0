use std::process;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use slotgate::transport::{GateState, serve};
use slotgate::{AdmissionController, ExitProcess, GateConfig, ProxyForwarder};

/// Initialize tracing with SLOTGATE_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("SLOTGATE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!("slotgate={base_level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    info!("slotgate {}", env!("CARGO_PKG_VERSION"));

    let config = match GateConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!(error = %e, "Server failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(config: GateConfig) -> anyhow::Result<()> {
    info!(
        backend = %config.backend_url,
        max_concurrent_requests = config.max_concurrent_requests.get(),
        policy = %config.policy,
        queue_timeout = ?config.queue_timeout,
        "Loaded configuration"
    );

    let forwarder = ProxyForwarder::new(config.backend_url)?;
    let controller = AdmissionController::new(
        config.max_concurrent_requests,
        config.policy,
        Arc::new(forwarder),
    )
    .with_queue_timeout(config.queue_timeout);

    let state = GateState {
        controller: Arc::new(controller),
        halt: Arc::new(ExitProcess),
    };

    serve(config.server, state).await
}

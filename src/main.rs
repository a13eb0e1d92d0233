use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clustercoord::backend::dispatch::spawn_command_logger;
use clustercoord::backend::{ChannelDispatcher, Collaborators, TracingEventSink};
use clustercoord::cli::{format_dry_run, Args};
use clustercoord::cluster::{create_api_router, spawn_rederive_driver, ApiState, ClusterRegistry};
use clustercoord::config::{load_config_file, CoordinatorConfig};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    // Load and validate config
    let config = match load_config_file(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!(
                "Failed to load config file {}: {}",
                args.config_file.display(),
                e
            );
            process::exit(1);
        }
    };

    // Dry-run mode: print clusters and exit
    if args.dry_run {
        let output = format_dry_run(&config, &args);
        println!("{}", output);
        return;
    }

    if let Err(e) = run(config, &args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(config: CoordinatorConfig, args: &Args) -> anyhow::Result<()> {
    let seeded = config.seed_backends();
    let (dispatcher, commands) = ChannelDispatcher::channel();
    let configurations = seeded.configurations.clone();

    let registry = ClusterRegistry::new(Collaborators {
        configurations: seeded.configurations,
        accounts: seeded.accounts,
        networks: seeded.networks,
        addresses: seeded.addresses,
        dispatcher: Arc::new(dispatcher),
        events: Arc::new(TracingEventSink),
    });
    config.register_clusters(&registry);
    for (cluster, range) in registry.rederive_all().await {
        info!("Cluster {} starts with VLAN range {}", cluster, range);
    }

    let _commands = spawn_command_logger(commands);
    let _driver = spawn_rederive_driver(
        registry.clone(),
        Duration::from_secs(config.drivers.rederive_interval_secs),
    );

    let addr = format!(
        "{}:{}",
        args.effective_bind_addr(&config),
        args.effective_port(&config)
    );
    info!("Starting clustercoord on {}", addr);
    info!("Loaded {} clusters", registry.len());

    let app = create_api_router(ApiState::new(registry, configurations));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health                              - Health check");
    info!("  GET  /v1/clusters                         - Cluster summaries");
    info!("  POST /v1/clusters/{{name}}/tokens           - Reserve a network token");
    info!("  POST /v1/clusters/{{name}}/addresses/report - Reconcile reported addresses");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

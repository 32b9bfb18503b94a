use anyhow::Result;
use oxprobe_collector::Registry;
use oxprobe_storage::broadcast::ChannelBroadcaster;
use oxprobe_storage::database::{Database, InfluxDb, LogDatabase};
use oxprobe_storage::{Actor, MemoryStore, Store};
use oxprobe_transport::ssh::pool::{IDLE_TIMEOUT, SWEEP_INTERVAL};
use oxprobe_transport::ssh::SshPool;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use oxprobe_server::config::ServerConfig;
use oxprobe_server::scheduler::Scheduler;
use oxprobe_server::seed;
use oxprobe_server::sink::Forwarder;

const STORE_EVENT_CAPACITY: usize = 256;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  oxprobe-server [config.toml]     Start the scheduler (default: config/server.toml)");
    eprintln!("  oxprobe-server agents            List registered agents and their parameters");
}

#[tokio::main]
async fn main() -> Result<()> {
    oxprobe_common::id::init(1, 1);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("oxprobe=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let pool = SshPool::start(IDLE_TIMEOUT, SWEEP_INTERVAL);
    let registry = Registry::with_defaults(pool);

    match args.get(1).map(|s| s.as_str()) {
        Some("-h" | "--help") => {
            print_usage();
            Ok(())
        }
        Some("agents") => list_agents(&registry),
        path => {
            let config_path = path.unwrap_or("config/server.toml");
            let config = ServerConfig::load(config_path).map_err(|e| {
                print_usage();
                e.context(format!("loading {config_path}"))
            })?;
            run_server(config, registry).await
        }
    }
}

#[allow(clippy::print_stdout)]
fn list_agents(registry: &Registry) -> Result<()> {
    for name in registry.agent_names() {
        let doc = registry.describe_agent(name)?;
        println!("{name}: {}", doc.summary);
        for param in &doc.params {
            match &param.default {
                Some(default) => println!("    {} ({}, default {default}): {}", param.name, param.kind, param.description),
                None => println!("    {} ({}): {}", param.name, param.kind, param.description),
            }
        }
    }
    Ok(())
}

async fn run_server(config: ServerConfig, registry: Registry) -> Result<()> {
    let broadcaster = Arc::new(ChannelBroadcaster::new(STORE_EVENT_CAPACITY));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::with_broadcaster(broadcaster.clone()));

    let database: Arc<dyn Database> = match &config.influxdb {
        Some(influx) => {
            tracing::info!(url = %influx.url, database = %influx.database, "Writing points to InfluxDB");
            Arc::new(InfluxDb::new(&influx.url, &influx.database)?)
        }
        None => {
            tracing::info!("No [influxdb] section, points are logged at debug level");
            Arc::new(LogDatabase)
        }
    };
    let forwarder = Forwarder::new(database, config.sink_max_retries, config.sink_backoff());

    let scheduler = Scheduler::new(store.clone(), forwarder, &registry, Actor::System)?.with_tick(config.tick());
    seed::apply(&config, store.as_ref(), &registry)?;

    let mut events = broadcaster.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::trace!(event = %event.event, "Store event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Store event listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = scheduler.run() => {}
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Shutdown signal received");
        }
    }
    Ok(())
}

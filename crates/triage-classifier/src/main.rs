//! triage-service — classifies wearable vitals and emits actionable
//! triage transitions onto the broker.

use std::sync::Arc;

use clap::Parser;
use incident_broker::{connect_with_backoff, declare_exchange, declare_queue, run_consumer};
use incident_config::BrokerSettings;
use incident_health::HealthState;
use incident_proto::RoutingKey;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use triage_classifier::{consumer, Ledger};

const APP_ID: &str = "triage-service";

#[derive(Parser)]
#[command(name = "triage-service")]
#[command(about = "Classifies wearable vitals into actionable triage transitions")]
struct Cli {
    /// HTTP port for the /health endpoint.
    #[arg(long, default_value_t = 5001)]
    health_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("triage_classifier=info".parse()?))
        .init();

    let cli = Cli::parse();
    let broker_settings = BrokerSettings::from_env()?;
    let broker_config = broker_settings.to_broker_config();

    let health = HealthState::new("triage");
    let health_router = incident_health::router(health.clone());
    let health_listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.health_port)).await?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(health_listener, health_router).await {
            error!(error = %e, "health server exited");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let ledger = Arc::new(Ledger::new());

    let conn = connect_with_backoff(&broker_config).await?;
    health.set_broker_connected(true);

    let setup_channel = declare_exchange(&conn, &broker_config).await?;
    declare_queue(
        &setup_channel,
        &broker_config.exchange_name,
        consumer::QUEUE_NAME,
        &[RoutingKey::WearableData],
        false,
    )
    .await?;

    let publish_channel = conn.create_channel().await?;
    let exchange_name = broker_config.exchange_name.clone();

    run_consumer(
        &conn,
        consumer::QUEUE_NAME,
        "triage-classifier",
        shutdown_rx,
        move |body| {
            let ledger = ledger.clone();
            let publish_channel = publish_channel.clone();
            let exchange_name = exchange_name.clone();
            async move {
                consumer::handle_delivery(body, &ledger, &publish_channel, &exchange_name, APP_ID)
                    .await
            }
        },
    )
    .await?;

    health.set_broker_connected(false);
    info!("triage-service exiting");
    Ok(())
}

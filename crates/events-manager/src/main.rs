//! events-manager — orchestrates triage, dispatch, and billing events into
//! alert commands and conditional downstream commands.

use std::sync::Arc;

use clap::Parser;
use events_manager::{consumer, IdempotencyLedger};
use incident_broker::{connect_with_backoff, declare_exchange, declare_queue, run_consumer};
use incident_config::BrokerSettings;
use incident_health::HealthState;
use incident_proto::RoutingKey;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const APP_ID: &str = "events-manager";

#[derive(Parser)]
#[command(name = "events-manager")]
#[command(about = "Routes triage, dispatch, and billing events to alerts and commands")]
struct Cli {
    /// HTTP port for the /health endpoint.
    #[arg(long, default_value_t = 5002)]
    health_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("events_manager=info".parse()?))
        .init();

    let cli = Cli::parse();
    let broker_settings = BrokerSettings::from_env()?;
    let broker_config = broker_settings.to_broker_config();

    let health = HealthState::new("events-manager");
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

    let ledger = Arc::new(IdempotencyLedger::new());

    let conn = connect_with_backoff(&broker_config).await?;
    health.set_broker_connected(true);

    let setup_channel = declare_exchange(&conn, &broker_config).await?;
    declare_queue(
        &setup_channel,
        &broker_config.exchange_name,
        consumer::QUEUE_TRIAGE_ACTIONABLE,
        &[RoutingKey::TriageStatusAbnormal, RoutingKey::TriageStatusEmergency],
        true,
    )
    .await?;
    declare_queue(
        &setup_channel,
        &broker_config.exchange_name,
        consumer::QUEUE_DISPATCH_STATUS,
        &[
            RoutingKey::EventDispatchUnitAssigned,
            RoutingKey::EventDispatchEnroute,
            RoutingKey::EventDispatchPatientOnboard,
            RoutingKey::EventDispatchArrivedAtHospital,
        ],
        true,
    )
    .await?;
    declare_queue(
        &setup_channel,
        &broker_config.exchange_name,
        consumer::QUEUE_BILLING_STATUS,
        &[RoutingKey::EventBillingCompleted, RoutingKey::EventBillingFailed],
        true,
    )
    .await?;

    let exchange_name = broker_config.exchange_name.clone();

    let triage_channel = conn.create_channel().await?;
    let triage_task = {
        let exchange_name = exchange_name.clone();
        let shutdown_rx = shutdown_rx.clone();
        run_consumer(
            &conn,
            consumer::QUEUE_TRIAGE_ACTIONABLE,
            "events-manager-triage",
            shutdown_rx,
            move |body| {
                let triage_channel = triage_channel.clone();
                let exchange_name = exchange_name.clone();
                async move { consumer::handle_triage_delivery(body, &triage_channel, &exchange_name, APP_ID).await }
            },
        )
    };

    let dispatch_channel = conn.create_channel().await?;
    let dispatch_task = {
        let exchange_name = exchange_name.clone();
        let ledger = ledger.clone();
        let shutdown_rx = shutdown_rx.clone();
        run_consumer(
            &conn,
            consumer::QUEUE_DISPATCH_STATUS,
            "events-manager-dispatch",
            shutdown_rx,
            move |body| {
                let dispatch_channel = dispatch_channel.clone();
                let exchange_name = exchange_name.clone();
                let ledger = ledger.clone();
                async move {
                    consumer::handle_dispatch_delivery(body, &ledger, &dispatch_channel, &exchange_name, APP_ID).await
                }
            },
        )
    };

    let billing_channel = conn.create_channel().await?;
    let billing_task = {
        let exchange_name = exchange_name.clone();
        run_consumer(
            &conn,
            consumer::QUEUE_BILLING_STATUS,
            "events-manager-billing",
            shutdown_rx,
            move |body| {
                let billing_channel = billing_channel.clone();
                let exchange_name = exchange_name.clone();
                async move { consumer::handle_billing_delivery(body, &billing_channel, &exchange_name, APP_ID).await }
            },
        )
    };

    let (triage_result, dispatch_result, billing_result) =
        tokio::join!(triage_task, dispatch_task, billing_task);
    triage_result?;
    dispatch_result?;
    billing_result?;

    health.set_broker_connected(false);
    info!("events-manager exiting");
    Ok(())
}

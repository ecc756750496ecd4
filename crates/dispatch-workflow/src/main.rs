//! dispatch-workflow — picks a hospital for each ambulance request and
//! drives its unit-assigned → enroute → patient_onboard → arrived_at_hospital
//! lifecycle, with a concurrent synthetic vitals feed.

use std::sync::Arc;

use clap::Parser;
use dispatch_workflow::consumer;
use dispatch_workflow::hospital::{GooglePlacesFallback, HospitalDirectory, PlacesApiFallback, PostgresHospitalDirectory};
use dispatch_workflow::workflow::ActiveDispatches;
use incident_broker::{connect_with_backoff, declare_exchange, declare_queue, run_consumer};
use incident_config::{BrokerSettings, DatabaseSettings, PlacesApiSettings};
use incident_health::HealthState;
use incident_proto::RoutingKey;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const APP_ID: &str = "dispatch-workflow";

#[derive(Parser)]
#[command(name = "dispatch-workflow")]
#[command(about = "Selects a hospital and drives the per-incident ambulance dispatch workflow")]
struct Cli {
    /// HTTP port for the /health endpoint.
    #[arg(long, default_value_t = 5003)]
    health_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("dispatch_workflow=info".parse()?))
        .init();

    let cli = Cli::parse();
    let broker_settings = BrokerSettings::from_env()?;
    let broker_config = broker_settings.to_broker_config();
    let db_settings = DatabaseSettings::from_env()?;
    let places_settings = PlacesApiSettings::from_env()?;

    let health = HealthState::with_extra_dependency("dispatch-workflow", "db_connected");
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

    let pool = sqlx::PgPool::connect(&db_settings.connection_string()).await?;
    health.set_extra_dependency(true);
    let directory: Arc<dyn HospitalDirectory> = Arc::new(PostgresHospitalDirectory::new(pool));
    let fallback: Arc<dyn PlacesApiFallback> =
        Arc::new(GooglePlacesFallback::new(places_settings.base_url, places_settings.api_key));

    let active = Arc::new(ActiveDispatches::new());

    let conn = Arc::new(connect_with_backoff(&broker_config).await?);
    health.set_broker_connected(true);

    let setup_channel = declare_exchange(&conn, &broker_config).await?;
    declare_queue(
        &setup_channel,
        &broker_config.exchange_name,
        consumer::QUEUE_NAME,
        &[RoutingKey::CmdDispatchRequestAmbulance],
        false,
    )
    .await?;

    let exchange_name = broker_config.exchange_name.clone();
    let handler_conn = conn.clone();

    run_consumer(
        conn.as_ref(),
        consumer::QUEUE_NAME,
        "dispatch-workflow",
        shutdown_rx.clone(),
        move |body| {
            let conn = handler_conn.clone();
            let active = active.clone();
            let directory = directory.clone();
            let fallback = fallback.clone();
            let exchange_name = exchange_name.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move {
                consumer::handle_delivery(
                    body,
                    conn,
                    active,
                    directory,
                    fallback,
                    exchange_name,
                    APP_ID.to_string(),
                    shutdown_rx,
                )
                .await
            }
        },
    )
    .await?;

    health.set_broker_connected(false);
    info!("dispatch-workflow exiting");
    Ok(())
}

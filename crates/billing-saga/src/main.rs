//! billing-saga — runs insurance verification and payment for each
//! `cmd.billing.initiate` command, compensating with a refund and a
//! cancellation when any step downstream of a successful charge fails.

use std::sync::Arc;

use billing_saga::consumer;
use billing_saga::ports::{HttpInsurancePort, HttpPaymentGatewayPort, InsurancePort, PaymentGatewayPort};
use billing_saga::store::{BillingStore, PostgresBillingStore};
use clap::Parser;
use incident_broker::{connect_with_backoff, declare_exchange, declare_queue, run_consumer};
use incident_config::{BrokerSettings, DatabaseSettings, ExternalServiceSettings};
use incident_health::HealthState;
use incident_proto::RoutingKey;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const APP_ID: &str = "billing-saga";

#[derive(Parser)]
#[command(name = "billing-saga")]
#[command(about = "Runs the billing saga for each dispatched incident")]
struct Cli {
    /// HTTP port for the /health endpoint.
    #[arg(long, default_value_t = 5004)]
    health_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("billing_saga=info".parse()?))
        .init();

    let cli = Cli::parse();
    let broker_settings = BrokerSettings::from_env()?;
    let broker_config = broker_settings.to_broker_config();
    let db_settings = DatabaseSettings::from_env()?;
    let external_settings = ExternalServiceSettings::from_env()?;

    let health = HealthState::with_extra_dependency("billing-saga", "db_connected");
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
    let store: Arc<dyn BillingStore> = Arc::new(PostgresBillingStore::new(pool));
    let insurance: Arc<dyn InsurancePort> = Arc::new(HttpInsurancePort::new(external_settings.insurance_base_url));
    let payment: Arc<dyn PaymentGatewayPort> =
        Arc::new(HttpPaymentGatewayPort::new("https://api.stripe.com/v1".to_string(), external_settings.payment_gateway_api_key));

    let conn = connect_with_backoff(&broker_config).await?;
    health.set_broker_connected(true);

    let setup_channel = declare_exchange(&conn, &broker_config).await?;
    declare_queue(
        &setup_channel,
        &broker_config.exchange_name,
        consumer::QUEUE_NAME,
        &[RoutingKey::CmdBillingInitiate],
        false,
    )
    .await?;

    let publish_channel = conn.create_channel().await?;
    let exchange_name = broker_config.exchange_name.clone();

    run_consumer(&conn, consumer::QUEUE_NAME, APP_ID, shutdown_rx, move |body| {
        let store = store.clone();
        let insurance = insurance.clone();
        let payment = payment.clone();
        let publish_channel = publish_channel.clone();
        let exchange_name = exchange_name.clone();
        async move {
            consumer::handle_delivery(
                body,
                store.as_ref(),
                insurance.as_ref(),
                payment.as_ref(),
                &publish_channel,
                &exchange_name,
                APP_ID,
            )
            .await
        }
    })
    .await?;

    health.set_broker_connected(false);
    info!("billing-saga exiting");
    Ok(())
}

//! Thin wrapper over a single durable topic exchange.
//!
//! Every service in the pipeline (triage, events-manager, dispatch,
//! billing) talks to the broker only through this crate: connect with
//! backoff, declare topology, publish persistent messages with the
//! standard properties, and consume with manual ack and bounded prefetch.
//! None of those services touch `lapin` directly.

#![forbid(unsafe_code)]

use std::time::Duration;

use std::panic::AssertUnwindSafe;

use futures_util::{FutureExt, StreamExt};
use incident_proto::RoutingKey;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use lapin::Channel;

mod error;
pub use error::BrokerError;

const PREFETCH_COUNT: u16 = 16;
const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
const CONNECT_BUDGET: Duration = Duration::from_secs(60);

// ─── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub amqp_url: String,
    pub exchange_name: String,
    pub exchange_type: ExchangeKind,
}

// ─── Connection ────────────────────────────────────────────────────────────────

/// Connect with a 2-second retry interval until a 60-second budget elapses.
///
/// Matches spec §4.1's reconnection policy: retry steadily, then fail
/// outright rather than retrying forever — a caller that wants to keep
/// trying past the budget wraps this in its own outer loop (as the service
/// binaries do around their main run loop).
pub async fn connect_with_backoff(config: &BrokerConfig) -> Result<Connection, BrokerError> {
    let start = tokio::time::Instant::now();
    loop {
        match Connection::connect(&config.amqp_url, ConnectionProperties::default()).await {
            Ok(conn) => {
                info!(exchange = %config.exchange_name, "connected to broker");
                return Ok(conn);
            }
            Err(e) => {
                if start.elapsed() > CONNECT_BUDGET {
                    error!(error = %e, "broker connect budget exceeded");
                    return Err(BrokerError::ConnectBudgetExceeded(e.to_string()));
                }
                warn!(error = %e, "broker connect failed, retrying in 2s");
                tokio::time::sleep(RECONNECT_INTERVAL).await;
            }
        }
    }
}

/// Declare the shared durable topic exchange on a fresh channel.
pub async fn declare_exchange(conn: &Connection, config: &BrokerConfig) -> Result<Channel, BrokerError> {
    let channel = conn.create_channel().await?;
    channel
        .exchange_declare(
            &config.exchange_name,
            config.exchange_type.clone(),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(channel)
}

/// Declare a durable queue bound to one or more routing keys.
///
/// `single_active_consumer` should be set for events-manager's input
/// queues (spec §4.1: "single-active-consumer argument where ordering
/// matters"); dispatch and triage queues leave it unset.
pub async fn declare_queue(
    channel: &Channel,
    exchange_name: &str,
    queue_name: &str,
    routing_keys: &[RoutingKey],
    single_active_consumer: bool,
) -> Result<(), BrokerError> {
    let mut args = FieldTable::default();
    if single_active_consumer {
        args.insert(
            "x-single-active-consumer".into(),
            AMQPValue::Boolean(true),
        );
    }

    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await?;

    for rk in routing_keys {
        channel
            .queue_bind(
                queue_name,
                exchange_name,
                rk.as_str(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    channel
        .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
        .await?;

    Ok(())
}

// ─── Publishing ────────────────────────────────────────────────────────────────

/// Publish a JSON body as a persistent message with the standard property
/// set (spec §4.1 / §6): `content_type`, `correlation_id`, `type`, `app_id`.
pub async fn publish_json<T: serde::Serialize>(
    channel: &Channel,
    exchange_name: &str,
    routing_key: RoutingKey,
    body: &T,
    correlation_id: Uuid,
    message_type: &str,
    app_id: &str,
) -> Result<(), BrokerError> {
    let payload = serde_json::to_vec(body)?;
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2) // persistent
        .with_correlation_id(correlation_id.to_string().into())
        .with_kind(message_type.into())
        .with_app_id(app_id.into());

    channel
        .basic_publish(
            exchange_name,
            routing_key.as_str(),
            BasicPublishOptions::default(),
            &payload,
            properties,
        )
        .await?
        .await?; // wait for broker confirmation of the publish itself

    debug!(routing_key = %routing_key, correlation_id = %correlation_id, "published");
    Ok(())
}

// ─── Consuming ─────────────────────────────────────────────────────────────────

/// What a handler decided to do with a delivered message.
///
/// Maps directly onto spec §4.1's failure semantics: `Ack` acknowledges,
/// `Drop` nacks without requeue (malformed message, never retryable),
/// `Retry` nacks with requeue (transient downstream failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Ack,
    Drop,
    Retry,
}

/// Run a consumer loop against `queue_name` until `shutdown` resolves.
///
/// `handler` is called once per delivery with the raw body bytes; its
/// return value drives ack/nack. On stream loss this reconnects and
/// re-registers the consumer unless shutdown has already been requested —
/// spec §4.1's "consumer-loop stream loss" policy.
pub async fn run_consumer<F, Fut>(
    conn: &Connection,
    queue_name: &str,
    consumer_tag: &str,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    mut handler: F,
) -> Result<(), BrokerError>
where
    F: FnMut(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = HandlerOutcome>,
{
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let channel = conn.create_channel().await?;
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;
        let mut consumer = channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = queue_name, "consumer registered");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(queue = queue_name, "shutdown requested, exiting consumer loop");
                        return Ok(());
                    }
                }
                next = consumer.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            // A panicking handler is a programmer error (spec's
                            // "unexpected exception" row): log it, nack-requeue
                            // once, and keep the consumer loop alive rather than
                            // taking the whole process down with it.
                            let outcome = match AssertUnwindSafe(handler(delivery.data.clone())).catch_unwind().await {
                                Ok(outcome) => outcome,
                                Err(panic) => {
                                    let msg = panic
                                        .downcast_ref::<&str>()
                                        .map(|s| s.to_string())
                                        .or_else(|| panic.downcast_ref::<String>().cloned())
                                        .unwrap_or_else(|| "non-string panic payload".to_string());
                                    error!(queue = queue_name, panic = %msg, "handler panicked, nacking with requeue");
                                    HandlerOutcome::Retry
                                }
                            };
                            let result = match outcome {
                                HandlerOutcome::Ack => {
                                    delivery.ack(BasicAckOptions::default()).await
                                }
                                HandlerOutcome::Drop => {
                                    delivery
                                        .nack(BasicNackOptions { requeue: false, ..Default::default() })
                                        .await
                                }
                                HandlerOutcome::Retry => {
                                    delivery
                                        .nack(BasicNackOptions { requeue: true, ..Default::default() })
                                        .await
                                }
                            };
                            if let Err(e) = result {
                                warn!(error = %e, "ack/nack failed, will reconnect");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, queue = queue_name, "consumer stream error, reconnecting");
                            break;
                        }
                        None => {
                            warn!(queue = queue_name, "consumer stream closed, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        if *shutdown.borrow() {
            return Ok(());
        }
        tokio::time::sleep(RECONNECT_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_outcome_is_copy_and_eq() {
        assert_eq!(HandlerOutcome::Ack, HandlerOutcome::Ack);
        assert_ne!(HandlerOutcome::Ack, HandlerOutcome::Drop);
    }

    #[tokio::test]
    async fn panicking_handler_future_is_caught_as_retry() {
        let fut = async { panic!("boom") };
        let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(()) => HandlerOutcome::Ack,
            Err(_) => HandlerOutcome::Retry,
        };
        assert_eq!(outcome, HandlerOutcome::Retry);
    }

    #[tokio::test]
    async fn non_panicking_handler_future_passes_through() {
        let fut = async { HandlerOutcome::Ack };
        let outcome = AssertUnwindSafe(fut).catch_unwind().await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Ack);
    }
}

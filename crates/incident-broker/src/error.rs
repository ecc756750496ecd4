//! Broker error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connect budget exceeded: {0}")]
    ConnectBudgetExceeded(String),

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

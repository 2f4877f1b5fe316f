pub mod broker;
pub mod manager;
pub mod memory;

pub use broker::{Broker, Delivery, RedisStreamBroker};
pub use manager::{Disposition, MessageHandler, QueueManager};
pub use memory::MemoryBroker;

use crate::{error::QueueError, models::Blockchain};
use serde::Serialize;

pub const ETH_PAYMENT_CONFIRMATION_QUEUE: &str = "eth-payment-confirmation-queue";
pub const DASH_PAYMENT_CONFIRMATION_QUEUE: &str = "dash-payment-confirmation-queue";
pub const BCH_PAYMENT_CONFIRMATION_QUEUE: &str = "bch-payment-confirmation-queue";
pub const EMAIL_SEND_QUEUE: &str = "email-send-queue";

pub fn confirmation_queue(chain: Blockchain) -> &'static str {
    match chain {
        Blockchain::Ethereum => ETH_PAYMENT_CONFIRMATION_QUEUE,
        Blockchain::Dash => DASH_PAYMENT_CONFIRMATION_QUEUE,
        Blockchain::BitcoinCash => BCH_PAYMENT_CONFIRMATION_QUEUE,
    }
}

/// Declares `queue` and publishes `message` onto it as JSON.
pub async fn publish_json<T: Serialize + ?Sized>(
    broker: &dyn Broker,
    queue: &str,
    message: &T,
) -> Result<(), QueueError> {
    let body = serde_json::to_vec(message)?;
    broker.declare(queue).await?;
    broker.publish(queue, &body).await
}

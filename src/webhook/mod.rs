//! Webhook subscriptions, fan-out and signed delivery.

mod delivery;
mod dispatcher;
mod fanout;
mod in_memory;
#[cfg(feature = "postgres")]
mod postgres;
pub mod signature;
mod subscription;

pub use delivery::{Delivery, DeliveryQueue, DeliveryResponse, DeliveryStatus};
pub use dispatcher::{DeliveryOutcome, DispatchResult, WebhookDispatcher, WebhookEnvelope};
pub use fanout::WebhookFanout;
pub use in_memory::InMemoryWebhookStore;
#[cfg(feature = "postgres")]
pub use postgres::PgWebhookStore;
pub use subscription::{FixedPolicy, Subscription, SubscriptionStore, WebhookPolicy, DEFAULT_MAX_ATTEMPTS};

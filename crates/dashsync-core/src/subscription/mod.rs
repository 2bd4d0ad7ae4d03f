//! Topic subscriptions
//!
//! [`Subscription`] defines identity; [`SubscriptionRegistry`] keeps the
//! desired set alive across reconnects and fans published data out.

mod registry;
mod topic;

pub use registry::{SubscriptionRegistry, TopicData, DEFAULT_SUBSCRIPTION_TIMEOUT};
pub use topic::{canonical_json, filters_from_pairs, Filters, Subscription};

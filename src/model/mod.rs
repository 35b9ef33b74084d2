//! The record shapes shared by `store`, `state`, `subscription`, and the
//! transport/control handlers.

mod api_key;
mod entry_key;
mod integration_config;
mod object;
mod owner;
mod subscription;
mod weather;

pub use api_key::{ApiKey, ApiKeyContext, ApiKeyScopes};
pub use entry_key::EntryKey;
pub use integration_config::IntegrationConfig;
pub use object::{Object, ObjectSummary, ObjectWire};
pub use owner::DeviceOwner;
pub use subscription::{ProbedObject, Subscription, SubscriptionOutcome};
pub use weather::WeatherCacheEntry;

pub mod apns;
pub mod fcm;
pub mod mock;
pub mod provider_trait;

pub use apns::{ApnsDelivery, ApnsProvider, ApnsSettings};
pub use fcm::{FcmProvider, RetryPolicy};
pub use mock::MockProvider;
pub use provider_trait::{AndroidChannel, FeedbackSource, IosChannel};

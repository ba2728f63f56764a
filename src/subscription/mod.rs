pub mod definition;
pub mod registry;

pub use definition::{
    unsubscribe_request, Subscription, SubscriptionParams, DEFAULT_BOOK_DEPTH, MAX_DEPTH,
};
pub use registry::{SubscriptionContainer, SubscriptionRegistry};

pub mod handler;
pub mod lifecycle;
pub mod registry;

pub use handler::{handler_from_name, BarLogger, EventHandler};
pub use lifecycle::{Subscriber, SubscriberBuilder, SubscriberInfo, SubscriberState};
pub use registry::SubscriberRegistry;

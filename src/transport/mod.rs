pub mod connection;
pub mod frame;

pub use connection::{ConnectionManager, ConnectionState, TransportOptions};
pub use frame::{Event, EventKind};

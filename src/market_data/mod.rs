pub mod bar;
pub mod bar_ring;
pub mod order_flow;
pub mod payload;
pub mod processor;

pub use bar::{heiken_ashi, price_key, Bar, Delta, MarketProfile, ProfileLevel};
pub use bar_ring::{BarRing, DEFAULT_BAR_CAPACITY};
pub use order_flow::{OrderFlow, SideFlow};
pub use payload::{ExternalBar, OrderBookSnapshot, Quote, Trade};
pub use processor::{Applied, DataProcessor, Detailing};

pub mod client;

pub use client::{AllTradesQuery, RestClient, DEFAULT_TAKE};

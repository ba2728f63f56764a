// =============================================================================
// Feed Hub — market-data fan-out over one broker websocket
// =============================================================================

pub mod api;
pub mod app_state;
pub mod auth;
pub mod config;
pub mod error;
pub mod market_data;
pub mod queue;
pub mod rest;
pub mod subscriber;
pub mod subscription;
pub mod transport;
pub mod types;

pub use error::{FeedError, Result};

// =============================================================================
// Event Handlers — per-subscriber strategies run after aggregation
// =============================================================================

use tracing::info;

use crate::error::{FeedError, Result};
use crate::market_data::{Applied, DataProcessor, ExternalBar, OrderBookSnapshot, Trade};
use crate::subscriber::lifecycle::SubscriberInfo;

/// Capability a strategy implements to observe one subscriber's stream.
///
/// Hooks run only while the subscriber is Ready, after the processor has
/// folded the input in, with read access to the processor. An error marks the
/// subscriber Done. Every hook defaults to a no-op.
pub trait EventHandler: Send {
    fn name(&self) -> &str;

    fn init(&mut self, _subscriber: &SubscriberInfo) -> Result<()> {
        Ok(())
    }

    fn handle_all_trades(
        &mut self,
        _trade: &Trade,
        _applied: Applied,
        _processor: &DataProcessor,
    ) -> Result<()> {
        Ok(())
    }

    fn handle_order_book(
        &mut self,
        _book: &OrderBookSnapshot,
        _applied: Applied,
        _processor: &DataProcessor,
    ) -> Result<()> {
        Ok(())
    }

    fn handle_bars(
        &mut self,
        _bar: &ExternalBar,
        _applied: Applied,
        _processor: &DataProcessor,
    ) -> Result<()> {
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Resolve a strategy by name. Empty means no handler.
pub fn handler_from_name(name: &str) -> Result<Option<Box<dyn EventHandler>>> {
    match name.trim() {
        "" => Ok(None),
        BarLogger::NAME => Ok(Some(Box::new(BarLogger::default()))),
        other => Err(FeedError::InvalidRequest(format!("unknown strategy {other}"))),
    }
}

// ---------------------------------------------------------------------------
// BarLogger
// ---------------------------------------------------------------------------

/// Logs every bar as it is finalized.
#[derive(Debug, Default)]
pub struct BarLogger {
    label: String,
    finalized: u64,
}

impl BarLogger {
    pub const NAME: &'static str = "bar_logger";

    pub fn finalized(&self) -> u64 {
        self.finalized
    }

    fn on_applied(&mut self, applied: Applied, processor: &DataProcessor) {
        if applied != Applied::Opened {
            return;
        }
        if let Some(bar) = processor.last_finalized() {
            self.finalized += 1;
            info!(
                subscriber = %self.label,
                time = %bar.time,
                open = bar.open,
                high = bar.high,
                low = bar.low,
                close = bar.close,
                volume = bar.volume,
                delta = bar.delta.total,
                poc = bar.market_profile.poc_price,
                flow_imbalance = bar.order_flow.imbalance(),
                "bar finalized"
            );
        }
    }
}

impl EventHandler for BarLogger {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn init(&mut self, subscriber: &SubscriberInfo) -> Result<()> {
        self.label = format!("{} {}", subscriber.id, subscriber.instrument);
        Ok(())
    }

    fn handle_all_trades(
        &mut self,
        _trade: &Trade,
        applied: Applied,
        processor: &DataProcessor,
    ) -> Result<()> {
        self.on_applied(applied, processor);
        Ok(())
    }

    fn handle_bars(
        &mut self,
        _bar: &ExternalBar,
        applied: Applied,
        processor: &DataProcessor,
    ) -> Result<()> {
        self.on_applied(applied, processor);
        Ok(())
    }
}

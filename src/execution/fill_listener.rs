use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::execution::fill_flags::SharedFillFlags;
use crate::execution::limit_orders::ArmedLink;
use crate::models::{FilledOrderInfo, OrderEvent};

/// Routes order stream events into the shared fill flags
pub struct FillListener {
    symbol: String,
    flags: SharedFillFlags,
    armed: ArmedLink,
}

impl FillListener {
    pub fn new(symbol: impl Into<String>, flags: SharedFillFlags, armed: ArmedLink) -> Self {
        Self {
            symbol: symbol.into(),
            flags,
            armed,
        }
    }

    pub fn handle(&self, event: &OrderEvent) {
        if !event.is_filled() {
            return;
        }

        if event.symbol == self.symbol && event.is_full_tp_sl() {
            tracing::warn!(
                "🛑 Full {} fill on {} (order {}): position closed",
                event.stop_order_type,
                event.symbol,
                event.order_id
            );
            self.flags.mark_position_closed();
            return;
        }

        if self.armed.claim(&event.order_link_id) {
            tracing::info!(
                "✅ Profit-take limit filled: {} {} @ {}",
                event.side,
                event.qty,
                event.fill_price()
            );
            self.flags.mark_limit_filled(FilledOrderInfo {
                order_id: event.order_id.clone(),
                side: event.side.clone(),
                qty: event.qty.clone(),
                price: event.fill_price().to_string(),
            });
        }
    }

    pub async fn run(self, mut events: mpsc::Receiver<OrderEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(&event),
                    None => break,
                },
            }
        }
        tracing::debug!("Fill listener stopped");
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::api::{DriverError, ExchangeDriver, OrderRef};
use crate::execution::ledger::AveragingEntry;
use crate::models::{round_to_step, Side};

/// Cancelled links kept claimable while their fate is unknown
const MAX_PENDING_LINKS: usize = 8;

#[derive(Debug, Default)]
struct LinkSlots {
    current: Option<String>,
    /// The fill of `current` was already claimed
    current_claimed: bool,
    /// Links taken down by a cancel that may have raced a fill
    pending: VecDeque<String>,
}

/// Link ids of profit-take limit orders, shared with the fill listener
///
/// A link stays claimable after its cancel until the exchange confirms the
/// cancel, so a fill reported late is still routed to the decision loop.
#[derive(Debug, Clone, Default)]
pub struct ArmedLink {
    inner: Arc<Mutex<LinkSlots>>,
}

impl ArmedLink {
    fn lock(&self) -> MutexGuard<'_, LinkSlots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Link id of the resting order
    pub fn get(&self) -> Option<String> {
        self.lock().current.clone()
    }

    /// Claim a fill for `link_id`; each link can be claimed once
    pub fn claim(&self, link_id: &str) -> bool {
        if link_id.is_empty() {
            return false;
        }
        let mut slots = self.lock();
        if slots.current.as_deref() == Some(link_id) {
            if slots.current_claimed {
                return false;
            }
            slots.current_claimed = true;
            return true;
        }
        match slots.pending.iter().position(|l| l == link_id) {
            Some(i) => {
                slots.pending.remove(i);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set(&self, link_id: String) {
        let mut slots = self.lock();
        slots.current = Some(link_id);
        slots.current_claimed = false;
    }

    /// Take the resting link down, keeping it claimable unless already filled
    fn retire(&self) -> Option<String> {
        let mut slots = self.lock();
        let link_id = slots.current.take()?;
        if !std::mem::take(&mut slots.current_claimed) {
            if slots.pending.len() == MAX_PENDING_LINKS {
                slots.pending.pop_front();
            }
            slots.pending.push_back(link_id.clone());
        }
        Some(link_id)
    }

    /// The exchange confirmed the cancel; no fill can follow
    fn forget(&self, link_id: &str) {
        self.lock().pending.retain(|l| l != link_id);
    }
}

/// Limit price for closing `entry` at the minimum profit offset
pub fn profit_take_limit_price(side: Side, entry_price: f64, min_offset: f64, increment: f64) -> f64 {
    let raw = match side {
        Side::Buy => entry_price * (1.0 + min_offset),
        Side::Sell => entry_price * (1.0 - min_offset),
    };
    round_to_step(raw, increment)
}

/// Keeps at most one profit-take limit order resting for the ledger top
pub struct LimitOrderManager {
    driver: Arc<dyn ExchangeDriver>,
    symbol: String,
    side: Side,
    /// Minimum profit offset, as a fraction
    min_offset: f64,
    armed: ArmedLink,
}

impl LimitOrderManager {
    pub fn new(
        driver: Arc<dyn ExchangeDriver>,
        symbol: impl Into<String>,
        side: Side,
        min_offset: f64,
    ) -> Self {
        Self {
            driver,
            symbol: symbol.into(),
            side,
            min_offset,
            armed: ArmedLink::default(),
        }
    }

    /// Handle for the fill listener
    pub fn armed(&self) -> ArmedLink {
        self.armed.clone()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.get().is_some()
    }

    /// Place the limit order for `top` unless one is already resting
    pub async fn ensure_placed(&self, top: Option<AveragingEntry>) -> Result<(), DriverError> {
        let Some(entry) = top else {
            return Ok(());
        };
        if self.is_armed() {
            return Ok(());
        }

        let increment = self.driver.get_price_increment(&self.symbol).await?;
        let price = profit_take_limit_price(self.side, entry.price, self.min_offset, increment);
        let link_id = format!("prta-{}", Uuid::new_v4().simple());

        let ack = self
            .driver
            .place_limit_order(
                &self.symbol,
                self.side.inverse(),
                entry.quantity,
                price,
                self.side.position_idx(),
                &link_id,
            )
            .await?;

        tracing::info!(
            "📌 Profit-take limit placed: {} {} @ {} (order {}, link {})",
            self.side.inverse(),
            entry.quantity,
            price,
            ack.order_id,
            link_id
        );
        self.armed.set(link_id);
        Ok(())
    }

    /// Cancel the resting limit order, if any
    ///
    /// The slot is cleared before the exchange call, so a second cancel is a
    /// no-op. An order that already filled or vanished is not an error; its
    /// link stays claimable for a fill the stream has not delivered yet.
    pub async fn cancel(&self) -> Result<(), DriverError> {
        let Some(link_id) = self.armed.retire() else {
            return Ok(());
        };

        match self
            .driver
            .cancel_order(&self.symbol, &OrderRef::LinkId(link_id.clone()))
            .await
        {
            Ok(()) => {
                self.armed.forget(&link_id);
                tracing::info!("🗑️  Profit-take limit cancelled (link {})", link_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!("Profit-take limit {} already gone", link_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::paper::{PaperCall, PaperExchange};

    #[test]
    fn test_limit_price_by_side() {
        assert_eq!(profit_take_limit_price(Side::Buy, 100.0, 0.02, 0.01), 102.0);
        assert_eq!(profit_take_limit_price(Side::Sell, 100.0, 0.02, 0.01), 98.0);
        assert_eq!(profit_take_limit_price(Side::Buy, 33.333, 0.01, 0.01), 33.67);
    }

    #[test]
    fn test_armed_link_claims_once() {
        let armed = ArmedLink::default();
        assert!(!armed.claim(""));

        armed.set("prta-1".into());
        assert!(!armed.claim("prta-2"));
        assert!(!armed.claim(""));
        assert!(armed.claim("prta-1"));
        assert!(!armed.claim("prta-1"));

        // A claimed link is not kept after retiring
        assert_eq!(armed.retire().as_deref(), Some("prta-1"));
        assert!(!armed.claim("prta-1"));
    }

    #[test]
    fn test_retired_link_stays_claimable_until_forgotten() {
        let armed = ArmedLink::default();
        armed.set("prta-1".into());
        armed.retire();
        armed.set("prta-2".into());
        armed.retire();

        assert!(armed.get().is_none());
        armed.forget("prta-2");
        assert!(!armed.claim("prta-2"));
        assert!(armed.claim("prta-1"));
        assert!(!armed.claim("prta-1"));
    }

    #[test]
    fn test_pending_links_are_bounded() {
        let armed = ArmedLink::default();
        for i in 0..=MAX_PENDING_LINKS {
            armed.set(format!("prta-{}", i));
            armed.retire();
        }

        assert!(!armed.claim("prta-0"));
        assert!(armed.claim(&format!("prta-{}", MAX_PENDING_LINKS)));
    }

    #[tokio::test]
    async fn test_place_once_then_cancel_once() {
        let paper = Arc::new(PaperExchange::new("TESTUSDT", 100.0));
        let manager = LimitOrderManager::new(paper.clone(), "TESTUSDT", Side::Buy, 0.02);
        let top = Some(AveragingEntry {
            price: 100.0,
            quantity: 0.5,
        });

        manager.ensure_placed(top).await.unwrap();
        manager.ensure_placed(top).await.unwrap();
        assert_eq!(paper.open_orders().len(), 1);
        assert!(manager.is_armed());

        let link = manager.armed().get().unwrap();
        manager.cancel().await.unwrap();
        manager.cancel().await.unwrap();
        // Confirmed cancel: a stray fill for the link is not claimed
        assert!(!manager.armed().claim(&link));

        let calls = paper.calls();
        let limits: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, PaperCall::Limit { .. }))
            .collect();
        let cancels: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, PaperCall::Cancel(_)))
            .collect();

        assert_eq!(limits.len(), 1);
        assert_eq!(cancels.len(), 1);
        match limits[0] {
            PaperCall::Limit { side, qty, price, .. } => {
                assert_eq!(*side, Side::Sell);
                assert_eq!(*qty, 0.5);
                assert_eq!(*price, 102.0);
            }
            _ => unreachable!(),
        }
        assert!(paper.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_empty_ledger_places_nothing() {
        let paper = Arc::new(PaperExchange::new("TESTUSDT", 100.0));
        let manager = LimitOrderManager::new(paper.clone(), "TESTUSDT", Side::Buy, 0.02);

        manager.ensure_placed(None).await.unwrap();

        assert!(!manager.is_armed());
        assert!(paper.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_of_filled_order_is_swallowed() {
        let paper = Arc::new(PaperExchange::new("TESTUSDT", 100.0));
        let manager = LimitOrderManager::new(paper.clone(), "TESTUSDT", Side::Sell, 0.01);
        manager
            .ensure_placed(Some(AveragingEntry {
                price: 100.0,
                quantity: 1.0,
            }))
            .await
            .unwrap();

        // Fill removes the order from the book
        let order_id = paper.open_orders()[0].order_id.clone();
        paper.trigger_order(&order_id);

        let link = manager.armed().get().unwrap();
        tokio_test::assert_ok!(manager.cancel().await);
        assert!(!manager.is_armed());
        assert!(manager.armed().claim(&link));
    }
}

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::FilledOrderInfo;
use crate::persistence::PersistedState;

/// Consistent view of the fill flags
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillSnapshot {
    pub limit_order_filled: bool,
    pub last_filled_order: Option<FilledOrderInfo>,
    pub position_fully_closed: bool,
    /// The trailing stop ended on its own and must not be placed again
    pub trailing_stop_finished: bool,
}

/// Fill state shared between the order stream listener and the decision loop
///
/// All fields live behind one lock so a reader never sees a half-applied
/// update. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct SharedFillFlags {
    inner: Arc<Mutex<FillSnapshot>>,
}

impl SharedFillFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore flags from persisted state
    pub fn restored(state: &PersistedState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FillSnapshot {
                limit_order_filled: state.limit_order_filled,
                last_filled_order: state.last_filled_order.clone(),
                position_fully_closed: false,
                trailing_stop_finished: state.trailing_stop_finished,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FillSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> FillSnapshot {
        self.lock().clone()
    }

    /// Record a fill of the profit-take limit order
    pub fn mark_limit_filled(&self, order: FilledOrderInfo) {
        let mut flags = self.lock();
        flags.limit_order_filled = true;
        flags.last_filled_order = Some(order);
    }

    pub fn clear_limit_filled(&self) {
        self.lock().limit_order_filled = false;
    }

    pub fn mark_position_closed(&self) {
        self.lock().position_fully_closed = true;
    }

    pub fn mark_trailing_stop_finished(&self) {
        self.lock().trailing_stop_finished = true;
    }

    pub fn trailing_stop_finished(&self) -> bool {
        self.lock().trailing_stop_finished
    }

    pub fn limit_order_filled(&self) -> bool {
        self.lock().limit_order_filled
    }

    pub fn position_fully_closed(&self) -> bool {
        self.lock().position_fully_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill() -> FilledOrderInfo {
        FilledOrderInfo {
            order_id: "1".into(),
            side: "Sell".into(),
            qty: "0.5".into(),
            price: "101.2".into(),
        }
    }

    #[test]
    fn test_limit_fill_sets_both_fields() {
        let flags = SharedFillFlags::new();
        let listener_side = flags.clone();

        listener_side.mark_limit_filled(fill());

        let snap = flags.snapshot();
        assert!(snap.limit_order_filled);
        assert_eq!(snap.last_filled_order, Some(fill()));
        assert!(!snap.position_fully_closed);
    }

    fn saved() -> PersistedState {
        let stages = crate::config::testing::params(crate::models::Side::Buy).stages;
        PersistedState::new(Default::default(), stages)
    }

    #[test]
    fn test_clear_keeps_last_fill() {
        let mut state = saved();
        state.limit_order_filled = true;
        state.last_filled_order = Some(fill());
        let flags = SharedFillFlags::restored(&state);
        flags.clear_limit_filled();

        assert!(!flags.limit_order_filled());
        assert!(flags.snapshot().last_filled_order.is_some());
    }

    #[test]
    fn test_restore_keeps_finished_trailing_stop() {
        let mut state = saved();
        state.trailing_stop_finished = true;

        let flags = SharedFillFlags::restored(&state);

        assert!(flags.trailing_stop_finished());
        assert!(!flags.position_fully_closed());
        assert!(!SharedFillFlags::restored(&saved()).trailing_stop_finished());
    }

    #[test]
    fn test_close_flag_visible_across_threads() {
        let flags = SharedFillFlags::new();
        let writer = flags.clone();

        std::thread::spawn(move || writer.mark_position_closed())
            .join()
            .unwrap();

        assert!(flags.position_fully_closed());
    }
}

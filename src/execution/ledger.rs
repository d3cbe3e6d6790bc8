use serde::{Deserialize, Serialize};
use std::fmt;

/// One filled averaging trade awaiting profit-take
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AveragingEntry {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger is empty")]
    Empty,
}

/// LIFO stack of averaging entries
///
/// Mutated only from the decision context; every mutation is followed by a
/// state save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionLedger {
    entries: Vec<AveragingEntry>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, price: f64, quantity: f64) {
        self.entries.push(AveragingEntry { price, quantity });
    }

    pub fn pop(&mut self) -> Result<AveragingEntry, LedgerError> {
        self.entries.pop().ok_or(LedgerError::Empty)
    }

    pub fn peek(&self) -> Result<AveragingEntry, LedgerError> {
        self.entries.last().copied().ok_or(LedgerError::Empty)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[AveragingEntry] {
        &self.entries
    }

    /// Human-readable form, e.g. `[(100, 1), (105, 1)]`
    pub fn serialize(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PositionLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "({}, {})", entry.price, entry.quantity)?;
        }
        write!(f, "]")
    }
}

impl FromIterator<AveragingEntry> for PositionLedger {
    fn from_iter<I: IntoIterator<Item = AveragingEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_order() {
        let mut ledger = PositionLedger::new();
        ledger.push(100.0, 1.0);
        ledger.push(105.0, 2.0);

        assert_eq!(ledger.peek().unwrap().price, 105.0);
        assert_eq!(ledger.pop().unwrap(), AveragingEntry { price: 105.0, quantity: 2.0 });
        assert_eq!(ledger.pop().unwrap().price, 100.0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_empty_ledger_rejects_pop_and_peek() {
        let mut ledger = PositionLedger::new();
        assert_eq!(ledger.pop(), Err(LedgerError::Empty));
        assert_eq!(ledger.peek(), Err(LedgerError::Empty));
    }

    #[test]
    fn test_size_tracks_pushes_minus_pops() {
        // Deterministic mixed sequence: true = push, false = pop
        let ops = [
            true, true, false, true, true, true, false, false, true, false, true, true,
        ];
        let mut ledger = PositionLedger::new();
        let mut pushes = 0usize;
        let mut pops = 0usize;

        for (i, push) in ops.iter().enumerate() {
            if *push {
                let price = 100.0 + i as f64;
                ledger.push(price, 1.0);
                pushes += 1;
                // A pop right after a push returns that entry
                let top = ledger.pop().unwrap();
                assert_eq!(top.price, price);
                ledger.push(top.price, top.quantity);
            } else {
                ledger.pop().unwrap();
                pops += 1;
            }
            assert_eq!(ledger.size(), pushes - pops);
        }
    }

    #[test]
    fn test_serialize_format() {
        let mut ledger = PositionLedger::new();
        assert_eq!(ledger.serialize(), "[]");

        ledger.push(100.0, 1.0);
        ledger.push(105.5, 0.25);
        assert_eq!(ledger.serialize(), "[(100, 1), (105.5, 0.25)]");
    }

    #[test]
    fn test_serde_is_plain_list() {
        let ledger: PositionLedger = [AveragingEntry { price: 1.5, quantity: 2.0 }]
            .into_iter()
            .collect();

        let json = serde_json::to_string(&ledger).unwrap();
        assert_eq!(json, r#"[{"price":1.5,"quantity":2.0}]"#);

        let back: PositionLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ledger);
    }
}

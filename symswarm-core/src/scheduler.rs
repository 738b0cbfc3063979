//! Symbol scheduler: stride the symbol-id space across the `N` senders feeding one
//! receiver so each covers a disjoint remainder class without coordination.

use std::collections::HashMap;

/// Default stripe count: a lone sender covers every symbol id.
pub const DEFAULT_SLOTS: u32 = 1;

/// Per-connection scheduler. The sender with rank `slot` among `slots` senders sends
/// symbol ids `k` with `k mod slots == slot`, in increasing order per block.
#[derive(Debug, Clone)]
pub struct SymbolScheduler {
    slots: u32,
    slot: u32,
    /// Highest symbol id handed out by `next_outgoing`, per block.
    sent: HashMap<u32, u32>,
    /// Highest symbol id observed as received from any source, per block.
    received: HashMap<u32, u32>,
}

impl SymbolScheduler {
    pub fn new(slots: u32, slot: u32) -> Result<Self, SchedulerError> {
        if slots == 0 {
            return Err(SchedulerError::NoSlots);
        }
        if slot >= slots {
            return Err(SchedulerError::SlotOutOfRange { slot, slots });
        }
        Ok(Self {
            slots,
            slot,
            sent: HashMap::new(),
            received: HashMap::new(),
        })
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Smallest symbol id greater than the last one returned for this block that falls
    /// in this connection's remainder class. `None` once the id space is exhausted.
    pub fn next_outgoing(&mut self, block_id: u32) -> Option<u32> {
        let next = match self.sent.get(&block_id) {
            Some(&last) => last.checked_add(self.slots)?,
            None => self.slot,
        };
        self.sent.insert(block_id, next);
        Some(next)
    }

    /// Record a received symbol. Does not move the striding cursor.
    pub fn observe_received(&mut self, block_id: u32, symbol_id: u32) {
        let e = self.received.entry(block_id).or_insert(symbol_id);
        *e = (*e).max(symbol_id);
    }

    pub fn highest_received(&self, block_id: u32) -> Option<u32> {
        self.received.get(&block_id).copied()
    }

    pub fn highest_sent(&self, block_id: u32) -> Option<u32> {
        self.sent.get(&block_id).copied()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler needs at least one slot")]
    NoSlots,
    #[error("slot {slot} out of range for {slots} slots")]
    SlotOutOfRange { slot: u32, slots: u32 },
}

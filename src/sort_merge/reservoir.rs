//! Byte budget for the presort buffer
//!
//! The presort holds records in memory until either the run size is reached
//! or the records buffered so far would cost more than the budget. Each
//! record is charged its encoded size plus the size of the in-memory value,
//! which keeps a few huge records (long ways, big relations) from blowing
//! past a record-count limit that was tuned for small ones.

/// Counts the bytes buffered since the last flush.
///
/// A reservoir is single-use: once it reports pressure the caller flushes
/// and starts the next batch with a new one.
#[derive(Debug, Clone)]
pub struct MemoryReservoir {
    budget: usize,
    used: usize,
}

impl MemoryReservoir {
    /// A budget of 0 disables the check.
    pub fn new(budget: usize) -> Self {
        Self { budget, used: 0 }
    }

    /// Account for one buffered record.
    pub fn charge(&mut self, bytes: usize) {
        self.used = self.used.saturating_add(bytes);
    }

    pub fn is_under_pressure(&self) -> bool {
        self.budget > 0 && self.used >= self.budget
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn budget(&self) -> usize {
        self.budget
    }
}

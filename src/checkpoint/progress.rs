use crate::checkpoint::Cursor;
use std::collections::BTreeSet;

/// Tracks out-of-order unit completions and exposes the contiguous prefix
///
/// Workers finish in any order, but the checkpoint may only cover units whose
/// every predecessor is also done. Completions past a gap are parked until
/// the gap closes. A failed unit never closes, so it pins the cursor for the
/// rest of the run and is retried on the next one.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    /// Lowest unit not yet known to be complete
    next: u64,
    /// Completed units above `next`
    parked: BTreeSet<u64>,
    failed: BTreeSet<u64>,
}

impl ProgressTracker {
    /// Starts tracking from a loaded checkpoint
    pub fn new(resume_from: Cursor) -> Self {
        Self {
            next: resume_from.next_unit(),
            parked: BTreeSet::new(),
            failed: BTreeSet::new(),
        }
    }

    /// Records a completed unit
    ///
    /// # Returns
    ///
    /// * `Some(n)` - The contiguous prefix grew and now ends at `n`
    /// * `None` - The cursor did not move
    pub fn complete(&mut self, seq: u64) -> Option<u64> {
        if seq < self.next || self.failed.contains(&seq) {
            return None;
        }

        self.parked.insert(seq);

        let start = self.next;
        while self.parked.remove(&self.next) {
            self.next += 1;
        }

        (self.next > start).then(|| self.next - 1)
    }

    /// Records a failed unit; the cursor can no longer pass it this run
    pub fn fail(&mut self, seq: u64) {
        if seq >= self.next {
            self.failed.insert(seq);
        }
    }

    /// Highest contiguous completed unit
    pub fn cursor(&self) -> Cursor {
        match self.next {
            0 => Cursor::Start,
            n => Cursor::Completed(n - 1),
        }
    }

    /// Completed units waiting behind a gap
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    pub fn failed(&self) -> impl Iterator<Item = u64> + '_ {
        self.failed.iter().copied()
    }
}

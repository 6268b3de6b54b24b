//! Fixed-size bitmaps for effective days and minutes.

/// Days in a week.
pub const EFFECTIVE_DAY_SIZE: usize = 7;
/// Minutes in a day.
pub const EFFECTIVE_MINUTE_SIZE: usize = 1440;

/// A fixed-size set of positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMap {
    bits: Vec<bool>,
}

impl BitMap {
    /// Creates a bitmap of `size` cleared bits.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            bits: vec![false; size],
        }
    }

    /// Returns the number of positions.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bits.len()
    }

    fn index(&self, pos: i64) -> Option<usize> {
        usize::try_from(pos).ok().filter(|p| *p < self.bits.len())
    }

    /// Sets each position in order. Stops at the first out-of-range position,
    /// leaving the positions before it set.
    pub fn set(&mut self, positions: &[i64]) {
        for pos in positions {
            let Some(i) = self.index(*pos) else {
                return;
            };
            self.bits[i] = true;
        }
    }

    /// Sets `[start, end)`, clipped to the bitmap. Ignored if `end < start` or `start < 0`.
    pub fn set_range(&mut self, start: i64, end: i64) {
        if end < start || start < 0 {
            return;
        }
        let start = start as usize;
        let end = (end as usize).min(self.bits.len());
        for bit in self.bits.iter_mut().take(end).skip(start) {
            *bit = true;
        }
    }

    /// Returns true if `pos` is set. Out-of-range positions are never set.
    #[must_use]
    pub fn is_set(&self, pos: i64) -> bool {
        self.index(pos).is_some_and(|i| self.bits[i])
    }
}

//! Winner latch: the part number at which the turn loop must stop.
//!
//! A compare-and-swap cell: writers only ever install a smaller
//! non-zero part number, so the latch is monotonically non-increasing
//! once set. Zero means unlatched.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WinnerLatch {
    part: AtomicU64,
}

impl WinnerLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to latch `part`. Returns true when this call moved the latch
    /// (first winner, or an earlier winner than the current one).
    pub fn latch(&self, part: u32) -> bool {
        if part == 0 {
            return false;
        }
        let part = part as u64;
        let mut current = self.part.load(Ordering::Acquire);
        loop {
            if current != 0 && current <= part {
                return false;
            }
            match self.part.compare_exchange_weak(
                current,
                part,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn get(&self) -> Option<u32> {
        match self.part.load(Ordering::Acquire) {
            0 => None,
            part => Some(part as u32),
        }
    }

    pub fn is_latched(&self) -> bool {
        self.part.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_latch_wins() {
        let latch = WinnerLatch::new();
        assert!(!latch.is_latched());
        assert!(latch.latch(5));
        assert_eq!(latch.get(), Some(5));
    }

    #[test]
    fn only_smaller_parts_replace() {
        let latch = WinnerLatch::new();
        latch.latch(5);
        assert!(!latch.latch(7));
        assert_eq!(latch.get(), Some(5));
        assert!(latch.latch(3));
        assert_eq!(latch.get(), Some(3));
        assert!(!latch.latch(3));
    }

    #[test]
    fn zero_never_latches() {
        let latch = WinnerLatch::new();
        assert!(!latch.latch(0));
        assert!(!latch.is_latched());
    }
}

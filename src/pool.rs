//! The physical register pool: sole authority on free GRF rows and words.
//!
//! One `u32` per row tracks word occupancy (bit n set = word n busy). Rows
//! can additionally be marked unavailable, which permanently excludes them
//! from allocation (ABI areas, reserved rows); unavailable is different from
//! busy, which toggles as ranges come and go. Per-row last-use timestamps
//! feed the round-robin heuristics of the local allocator.

use crate::ir::arena::BitSet;
use crate::ir::declare::{PhysReg, SubAlign};
use crate::ir::types::WORDS_PER_ROW;
use crate::platform::{Platform, SECOND_BANK_START_ROW};

/// Row alignment / bank preference for a free-run search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BankAlign {
    #[default]
    Either,
    /// Even starting row (bank 0 on even/odd-banked parts).
    Even,
    /// Odd starting row.
    Odd,
    /// Even row, stepping two rows at a time (2GRF bank granularity).
    Even2Grf,
    /// Odd row, stepping two rows at a time.
    Odd2Grf,
}

impl BankAlign {
    /// Scan step between candidate start rows.
    pub const fn step(self) -> u16 {
        match self {
            BankAlign::Either => 1,
            BankAlign::Even | BankAlign::Odd | BankAlign::Even2Grf | BankAlign::Odd2Grf => 2,
        }
    }

    pub const fn matches(self, row: u16) -> bool {
        match self {
            BankAlign::Either => true,
            BankAlign::Even | BankAlign::Even2Grf => row % 2 == 0,
            BankAlign::Odd | BankAlign::Odd2Grf => row % 2 == 1,
        }
    }
}

/// Bundle bit of a row: rows sharing a bundle bit hit the same read bundle.
#[inline]
pub fn bundle_bit(row: u16) -> u16 {
    1 << ((row % 16) / 2)
}

/// A free-region request.
#[derive(Debug, Clone, Copy)]
pub struct FindReq<'a> {
    pub size_words: u32,
    pub bank_align: BankAlign,
    pub sub_align: SubAlign,
    /// First row to consider (rotating hint for round-robin).
    pub start_row: u16,
    /// Exclusive upper bound of the scan.
    pub end_row: u16,
    pub forward: bool,
    /// Bundles already taken by sibling operands; candidate start rows whose
    /// bundle bit is set are skipped.
    pub occupied_bundles: u16,
    /// Rows this range must not use.
    pub forbidden: Option<&'a BitSet>,
}

#[derive(Debug, Clone)]
pub struct PhysicalRegisterPool {
    num_rows: u16,
    busy: Vec<u32>,
    available: Vec<bool>,
    last_use: Vec<u32>,
    two_banks: bool,
}

impl PhysicalRegisterPool {
    pub fn new(platform: &Platform) -> Self {
        let n = platform.num_grf as usize;
        PhysicalRegisterPool {
            num_rows: platform.num_grf,
            busy: vec![0; n],
            available: vec![true; n],
            last_use: vec![0; n],
            two_banks: platform.two_banks(),
        }
    }

    pub fn num_rows(&self) -> u16 {
        self.num_rows
    }

    pub fn two_banks(&self) -> bool {
        self.two_banks
    }

    // -------------------------------------------------------------------
    // Availability (permanent exclusions)
    // -------------------------------------------------------------------

    /// Permanently exclude `count` rows starting at `row`. Idempotent.
    pub fn mark_unavailable(&mut self, row: u16, count: u16) {
        for r in row..(row + count).min(self.num_rows) {
            self.available[r as usize] = false;
        }
    }

    pub fn is_available(&self, row: u16) -> bool {
        (row as usize) < self.available.len() && self.available[row as usize]
    }

    pub fn all_available(&self, row: u16, count: u16) -> bool {
        (row..row + count).all(|r| self.is_available(r))
    }

    // -------------------------------------------------------------------
    // Busy bits
    // -------------------------------------------------------------------

    pub fn is_row_busy(&self, row: u16) -> bool {
        debug_assert!(self.is_available(row), "query on unavailable row");
        self.busy[row as usize] != 0
    }

    pub fn are_words_busy(&self, row: u16, word: u32, count: u32) -> bool {
        debug_assert!(word + count <= WORDS_PER_ROW);
        let mask = (((1u64 << count) - 1) as u32) << word;
        self.busy[row as usize] & mask != 0
    }

    fn set_words(&mut self, row: u16, word: u32, count: u32) {
        debug_assert!(word + count <= WORDS_PER_ROW);
        let mask = (((1u64 << count) - 1) as u32) << word;
        self.busy[row as usize] |= mask;
    }

    fn clear_words(&mut self, row: u16, word: u32, count: u32) {
        let mask = (((1u64 << count) - 1) as u32) << word;
        debug_assert_eq!(
            self.busy[row as usize] & mask,
            mask,
            "releasing words that were not busy"
        );
        self.busy[row as usize] &= !mask;
    }

    /// Mark `size_words` busy starting at `at`. Multi-row ranges must be
    /// row-aligned.
    pub fn commit(&mut self, at: PhysReg, size_words: u32) {
        if size_words <= WORDS_PER_ROW - at.sub_word as u32 {
            self.set_words(at.row, at.sub_word as u32, size_words);
            return;
        }
        assert_eq!(at.sub_word, 0, "multi-row range must start a row");
        let mut left = size_words;
        let mut row = at.row;
        while left > 0 {
            let in_row = left.min(WORDS_PER_ROW);
            self.set_words(row, 0, in_row);
            left -= in_row;
            row += 1;
        }
    }

    /// Free the words of a committed range, stamping each touched row with
    /// the releasing instruction id for round-robin reuse avoidance.
    pub fn release(&mut self, at: PhysReg, size_words: u32, now: u32) {
        if size_words <= WORDS_PER_ROW - at.sub_word as u32 {
            self.clear_words(at.row, at.sub_word as u32, size_words);
            self.last_use[at.row as usize] = now;
            return;
        }
        assert_eq!(at.sub_word, 0, "multi-row range must start a row");
        let mut left = size_words;
        let mut row = at.row;
        while left > 0 {
            let in_row = left.min(WORDS_PER_ROW);
            self.clear_words(row, 0, in_row);
            self.last_use[row as usize] = now;
            left -= in_row;
            row += 1;
        }
    }

    pub fn last_use(&self, row: u16) -> u32 {
        self.last_use[row as usize]
    }

    // -------------------------------------------------------------------
    // Bank bookkeeping
    // -------------------------------------------------------------------

    /// (free-and-available row count, sum of last-use stamps) per bank.
    pub fn bank_stats(&self) -> [(u32, u64); 2] {
        let mut stats = [(0u32, 0u64); 2];
        for row in 0..self.num_rows {
            if !self.is_available(row) {
                continue;
            }
            let bank = if self.two_banks && row >= SECOND_BANK_START_ROW {
                1
            } else {
                0
            };
            if self.busy[row as usize] == 0 {
                stats[bank].0 += 1;
            }
            stats[bank].1 += self.last_use[row as usize] as u64;
        }
        stats
    }

    /// Rows that are available and completely free.
    pub fn free_row_count(&self) -> u32 {
        (0..self.num_rows)
            .filter(|&r| self.is_available(r) && self.busy[r as usize] == 0)
            .count() as u32
    }

    // -------------------------------------------------------------------
    // Search
    // -------------------------------------------------------------------

    fn row_blocked(&self, row: u16, req: &FindReq<'_>) -> bool {
        !self.is_available(row)
            || req
                .forbidden
                .is_some_and(|f| f.contains(row as usize))
    }

    /// Whole rows plus a possibly partial last row, starting row-aligned.
    fn multi_row_fits(&self, row: u16, full_rows: u16, last_words: u32, req: &FindReq<'_>) -> bool {
        let total_rows = full_rows + (last_words > 0) as u16;
        if row + total_rows > req.end_row {
            return false;
        }
        for r in row..row + total_rows {
            if self.row_blocked(r, req) {
                return false;
            }
        }
        for r in row..row + full_rows {
            if self.busy[r as usize] != 0 {
                return false;
            }
        }
        if last_words > 0 && self.are_words_busy(row + full_rows, 0, last_words) {
            return false;
        }
        true
    }

    /// Find a free region of `size_words`, honoring alignment, forbidden
    /// rows and bundle occupancy. Multi-row results are row-aligned; ranges
    /// that fit in one row get a word-granular slot.
    pub fn find_free(&self, req: &FindReq<'_>) -> Option<PhysReg> {
        if req.size_words > WORDS_PER_ROW || req.sub_align == SubAlign::Grf {
            self.find_free_rows(req)
        } else {
            self.find_free_sub_row(req)
        }
    }

    fn find_free_rows(&self, req: &FindReq<'_>) -> Option<PhysReg> {
        let full_rows = (req.size_words / WORDS_PER_ROW) as u16;
        let last_words = req.size_words % WORDS_PER_ROW;
        let step = req.bank_align.step();

        let align_start = |mut r: u16| -> u16 {
            while !req.bank_align.matches(r) {
                r += 1;
            }
            r
        };

        if req.forward {
            let mut row = align_start(req.start_row);
            while row < req.end_row {
                if req.occupied_bundles & bundle_bit(row) == 0
                    && self.multi_row_fits(row, full_rows, last_words, req)
                {
                    return Some(PhysReg::row_aligned(row));
                }
                row += step;
            }
        } else {
            let mut row = req.end_row.saturating_sub(1) as i32;
            while row >= req.start_row as i32 && !req.bank_align.matches(row as u16) {
                row -= 1;
            }
            while row >= req.start_row as i32 {
                let r = row as u16;
                if req.occupied_bundles & bundle_bit(r) == 0
                    && self.multi_row_fits(r, full_rows, last_words, req)
                {
                    return Some(PhysReg::row_aligned(r));
                }
                row -= step as i32;
            }
        }
        None
    }

    fn find_free_sub_row(&self, req: &FindReq<'_>) -> Option<PhysReg> {
        let size = req.size_words;
        let align = req.sub_align.words();
        let step = req.bank_align.step();

        let scan_row = |row: u16| -> Option<PhysReg> {
            if self.row_blocked(row, req) || req.occupied_bundles & bundle_bit(row) != 0 {
                return None;
            }
            let mut word = 0u32;
            while word + size <= WORDS_PER_ROW {
                if !self.are_words_busy(row, word, size) {
                    return Some(PhysReg {
                        row,
                        sub_word: word as u16,
                    });
                }
                word += align;
            }
            None
        };

        if req.forward {
            let mut row = req.start_row;
            while row < req.end_row && !req.bank_align.matches(row) {
                row += 1;
            }
            while row < req.end_row {
                if let Some(found) = scan_row(row) {
                    return Some(found);
                }
                row += step;
            }
        } else {
            if req.end_row == 0 {
                return None;
            }
            let mut row = (req.end_row - 1) as i32;
            while row >= req.start_row as i32 && !req.bank_align.matches(row as u16) {
                row -= 1;
            }
            while row >= req.start_row as i32 {
                if let Some(found) = scan_row(row as u16) {
                    return Some(found);
                }
                row -= step as i32;
            }
        }
        None
    }

    /// Trace helper: rows currently busy.
    pub fn dump_busy(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for row in 0..self.num_rows {
            let bits = self.busy[row as usize];
            if bits != 0 {
                let _ = write!(out, "r{row}:{bits:04x} ");
            } else if !self.available[row as usize] {
                let _ = write!(out, "r{row}:---- ");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PhysicalRegisterPool {
        PhysicalRegisterPool::new(&Platform::default())
    }

    fn req(size_words: u32) -> FindReq<'static> {
        FindReq {
            size_words,
            bank_align: BankAlign::Either,
            sub_align: SubAlign::Any,
            start_row: 0,
            end_row: 128,
            forward: true,
            occupied_bundles: 0,
            forbidden: None,
        }
    }

    #[test]
    fn finds_first_free_rows() {
        let mut p = pool();
        p.commit(PhysReg::row_aligned(0), 2 * WORDS_PER_ROW);

        let got = p.find_free(&req(2 * WORDS_PER_ROW)).unwrap();
        assert_eq!(got, PhysReg::row_aligned(2));
    }

    #[test]
    fn honors_unavailable_rows() {
        let mut p = pool();
        p.mark_unavailable(0, 4);
        let got = p.find_free(&req(WORDS_PER_ROW)).unwrap();
        assert_eq!(got.row, 4);
    }

    #[test]
    fn sub_row_packing() {
        let mut p = pool();
        // 4 words at r0.0.
        p.commit(PhysReg { row: 0, sub_word: 0 }, 4);
        let got = p.find_free(&req(4)).unwrap();
        assert_eq!(got, PhysReg { row: 0, sub_word: 4 });
    }

    #[test]
    fn sub_align_even() {
        let mut p = pool();
        p.commit(PhysReg { row: 0, sub_word: 0 }, 1);
        let r = FindReq {
            sub_align: SubAlign::Even,
            ..req(2)
        };
        let got = p.find_free(&r).unwrap();
        assert_eq!(got, PhysReg { row: 0, sub_word: 2 });
    }

    #[test]
    fn bank_align_odd() {
        let p = pool();
        let r = FindReq {
            bank_align: BankAlign::Odd,
            ..req(WORDS_PER_ROW)
        };
        assert_eq!(p.find_free(&r).unwrap().row, 1);
    }

    #[test]
    fn backward_scan_picks_top() {
        let p = pool();
        let r = FindReq {
            forward: false,
            ..req(WORDS_PER_ROW)
        };
        assert_eq!(p.find_free(&r).unwrap().row, 127);
    }

    #[test]
    fn backward_scan_honors_sub_row_requests() {
        let mut p = pool();
        p.commit(PhysReg::row_aligned(127), WORDS_PER_ROW);
        let r = FindReq {
            forward: false,
            ..req(4)
        };
        let got = p.find_free(&r).unwrap();
        assert_eq!(got, PhysReg { row: 126, sub_word: 0 });
    }

    #[test]
    fn forbidden_rows_skipped() {
        let p = pool();
        let mut forbidden = BitSet::new();
        forbidden.insert(0);
        forbidden.insert(1);
        let r = FindReq {
            forbidden: Some(&forbidden),
            ..req(WORDS_PER_ROW)
        };
        assert_eq!(p.find_free(&r).unwrap().row, 2);
    }

    #[test]
    fn bundle_avoidance() {
        let p = pool();
        let r = FindReq {
            occupied_bundles: bundle_bit(0),
            ..req(WORDS_PER_ROW)
        };
        // r0/r1 share bundle bit 0; first conflict-free row is r2.
        assert_eq!(p.find_free(&r).unwrap().row, 2);
    }

    #[test]
    fn release_restamps_last_use() {
        let mut p = pool();
        p.commit(PhysReg::row_aligned(5), WORDS_PER_ROW);
        assert!(p.is_row_busy(5));
        p.release(PhysReg::row_aligned(5), WORDS_PER_ROW, 42);
        assert!(!p.is_row_busy(5));
        assert_eq!(p.last_use(5), 42);
    }

    #[test]
    fn partial_last_row() {
        let mut p = pool();
        // 1.5 rows: one full row plus 8 words.
        let got = p.find_free(&req(WORDS_PER_ROW + 8)).unwrap();
        assert_eq!(got, PhysReg::row_aligned(0));
        p.commit(got, WORDS_PER_ROW + 8);
        assert!(p.is_row_busy(0));
        assert!(p.are_words_busy(1, 0, 8));
        assert!(!p.are_words_busy(1, 8, 8));
    }

    #[test]
    #[should_panic(expected = "releasing words that were not busy")]
    fn double_release_asserts() {
        let mut p = pool();
        p.commit(PhysReg::row_aligned(0), WORDS_PER_ROW);
        p.release(PhysReg::row_aligned(0), WORDS_PER_ROW, 1);
        p.release(PhysReg::row_aligned(0), WORDS_PER_ROW, 2);
    }
}

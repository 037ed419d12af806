//! Platform capability flags consumed by the allocator.

/// GRF row index where the second register bank begins on split-bank parts.
pub const SECOND_BANK_START_ROW: u16 = 64;

/// Stack-call ABI register conventions. Argument and return rows are not
/// listed here: frontends bind them through pre-assigned declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackCallAbi {
    /// Frame-pointer row, pre-assigned and never spillable.
    pub fp_row: u16,
    /// Caller-save area: rows `[0, caller_save_rows)` may be clobbered by a
    /// callee; values live across a call must avoid them (modeled by the
    /// call-site pseudo range).
    pub caller_save_rows: u16,
    /// Callee-save area, kept out of the pool in functions that carry a
    /// callee-save marker.
    pub callee_save_row: u16,
    pub callee_save_rows: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Platform {
    /// Total GRF rows.
    pub num_grf: u16,
    /// Rows reserved off the top for EOT sources and other bindings.
    pub reserved_top_rows: u16,
    /// Rows reserved for internal use at the bottom (r0 is the thread
    /// header on every platform).
    pub reserved_bottom_rows: u16,
    /// Whether the register file is split into two banks with a read-port
    /// conflict between them.
    pub has_bank_split: bool,
    /// Load/store-cache messages available (otherwise legacy scratch block
    /// messages are used).
    pub has_lsc: bool,
    /// Scratch surface accessible for spill memory.
    pub has_scratch_surface: bool,
    /// Hardware limit on scratch bytes addressable per thread.
    pub scratch_size_limit: u32,
    /// Max send message length in rows.
    pub max_msg_rows: u8,
    /// EOT sources must land in the topmost rows.
    pub eot_binding: bool,
    /// ABI conventions, present when stack calls are supported.
    pub abi: StackCallAbi,
}

impl Platform {
    /// Whether bank-aware allocation is meaningful: parts with at most
    /// `SECOND_BANK_START_ROW` rows have a single bank.
    pub fn two_banks(&self) -> bool {
        self.has_bank_split && self.num_grf > SECOND_BANK_START_ROW
    }

    /// Bank of a GRF row (0 or 1).
    pub fn bank_of(&self, row: u16) -> usize {
        if self.two_banks() && row >= SECOND_BANK_START_ROW {
            1
        } else {
            0
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform {
            num_grf: 128,
            reserved_top_rows: 16,
            reserved_bottom_rows: 1,
            has_bank_split: true,
            has_lsc: false,
            has_scratch_surface: true,
            scratch_size_limit: 128 * 1024,
            max_msg_rows: 8,
            eot_binding: true,
            abi: StackCallAbi {
                fp_row: 125,
                caller_save_rows: 60,
                callee_save_row: 60,
                callee_save_rows: 65,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_grf_collapses_banks() {
        let mut p = Platform::default();
        assert!(p.two_banks());
        assert_eq!(p.bank_of(63), 0);
        assert_eq!(p.bank_of(64), 1);

        p.num_grf = 64;
        assert!(!p.two_banks());
        assert_eq!(p.bank_of(63), 0);
    }
}

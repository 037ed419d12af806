//! Scratch slot layout for spilled declares.
//!
//! First-fit from offset 0: a new slot takes the lowest displacement whose
//! byte range overlaps no already-placed slot it interferes with. Extents are
//! rounded to GRF granularity, so the scratch messages stay row-aligned. Two
//! declares whose live ranges never overlap may share a displacement.

use crate::driver::RaError;
use crate::global::GlobalInterval;
use crate::ir::cfg::Kernel;
use crate::ir::declare::DeclId;
use crate::ir::types::{round_up, ROW_BYTES};
use crate::platform::Platform;

#[derive(Debug, Clone)]
struct Slot {
    disp: u32,
    bytes: u32,
    start: u32,
    end: u32,
}

/// Slot assignments accumulated across spill iterations.
#[derive(Debug, Clone, Default)]
pub struct SpillLayout {
    slots: Vec<Slot>,
    /// One past the highest byte used; the kernel's scratch demand.
    pub next_offset: u32,
}

impl SpillLayout {
    pub fn new() -> Self {
        SpillLayout::default()
    }

    /// Assign displacements for this iteration's spills and record them on
    /// the declares. Fails when the scratch limit is exceeded; a platform
    /// without a scratch surface has a limit of zero.
    pub fn assign(
        &mut self,
        kernel: &mut Kernel,
        intervals: &[GlobalInterval],
        spilled: &[DeclId],
        platform: &Platform,
    ) -> Result<(), RaError> {
        let limit = if platform.has_scratch_surface {
            platform.scratch_size_limit
        } else {
            0
        };
        for &d in spilled {
            if kernel.decls[d].spill_disp.is_some() {
                continue;
            }
            let bytes = round_up(kernel.decls[d].byte_size(), ROW_BYTES);
            let (start, end) = match intervals.iter().find(|iv| iv.decl == d) {
                Some(iv) => (iv.start, iv.end),
                // No interval on record: assume whole-kernel lifetime.
                None => (0, u32::MAX),
            };

            let mut disp = 0u32;
            loop {
                let conflict = self.slots.iter().find(|s| {
                    disp < s.disp + s.bytes
                        && s.disp < disp + bytes
                        && start < s.end
                        && s.start < end
                });
                match conflict {
                    Some(s) => disp = round_up(s.disp + s.bytes, ROW_BYTES),
                    None => break,
                }
            }

            if disp + bytes > limit {
                return Err(RaError::SpillBudgetExceeded {
                    used: disp + bytes,
                    limit,
                });
            }

            kernel.decls[d].spill_disp = Some(disp);
            kernel.decls[d].spilled = true;
            self.slots.push(Slot {
                disp,
                bytes,
                start,
                end,
            });
            self.next_offset = self.next_offset.max(disp + bytes);
        }
        Ok(())
    }

    /// Close out an iteration: spill code insertion renumbers the kernel, so
    /// recorded ranges stop being comparable. Widen existing slots to
    /// whole-kernel lifetime so later iterations never share with them.
    pub fn seal(&mut self) {
        for s in &mut self.slots {
            s.start = 0;
            s.end = u32::MAX;
        }
    }
}

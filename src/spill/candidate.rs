//! Spill candidate selection for the global scan.
//!
//! When an interval finds no free window, every window of the required height
//! is costed: the occupants' total reference count divided by a denominator
//! that grows with the remaining lifetime (and width) of each occupant and
//! with each already-free row. The cheapest evictable window wins; ties go to
//! the lowest starting row.

use smallvec::SmallVec;

use crate::global::{GlobalAllocator, GlobalInterval};
use crate::pool::PhysicalRegisterPool;

#[derive(Debug, Clone)]
pub struct SpillChoice {
    /// Interval indices to evict.
    pub victims: SmallVec<[usize; 4]>,
    pub start_row: u16,
    pub cost: f32,
}

pub fn find_spill_candidate(
    scan: &GlobalAllocator<'_>,
    pool: &PhysicalRegisterPool,
    req: usize,
) -> Option<SpillChoice> {
    let iv = &scan.intervals[req];
    let rows_needed = iv.rows.max(1);
    let num_rows = pool.num_rows();
    if rows_needed > num_rows {
        return None;
    }

    let mut best: Option<SpillChoice> = None;

    'window: for row in 0..=(num_rows - rows_needed) {
        let mut occupants: SmallVec<[usize; 4]> = SmallVec::new();
        let mut denom = 1.0f32;

        for r in row..row + rows_needed {
            if !pool.is_available(r) {
                continue 'window;
            }
            if let Some(fb) = &iv.forbidden {
                if fb.contains(r as usize) {
                    continue 'window;
                }
            }
            let bucket = &scan.active_by_row[r as usize];
            if bucket.is_empty() {
                if pool.is_row_busy(r) {
                    // Busy without a tracked occupant (input rows); nothing
                    // here can be freed.
                    continue 'window;
                }
                denom += scan.kernel_end.saturating_sub(iv.start) as f32;
                continue;
            }
            for &occ in bucket {
                if occ == req || !can_be_spilled(scan, occ) {
                    continue 'window;
                }
                if !occupants.contains(&occ) {
                    occupants.push(occ);
                }
            }
        }

        if occupants.is_empty() {
            // The window is already free; the failure was fragmentation or
            // alignment, and evicting nothing here cannot fix it.
            continue;
        }

        let mut refs = 0.0f32;
        for &occ in &occupants {
            let o: &GlobalInterval = &scan.intervals[occ];
            refs += o.num_refs as f32;
            denom += (o.end.saturating_sub(iv.start) * o.rows as u32) as f32;
        }
        let cost = refs / denom;

        if best.as_ref().is_none_or(|b| cost < b.cost) {
            best = Some(SpillChoice {
                victims: occupants,
                start_row: row,
                cost,
            });
        }
    }

    best
}

/// Whether an active interval may be evicted to memory at all.
fn can_be_spilled(scan: &GlobalAllocator<'_>, occ: usize) -> bool {
    let o = &scan.intervals[occ];
    if o.pre.is_some() {
        return false;
    }
    // Live from entry with no visible def: an input or an undefined value;
    // there is nothing correct to store.
    if o.start == 0 {
        return false;
    }
    let d = &scan.kernel.decls[o.decl];
    !(d.do_not_spill
        || d.spilled
        || d.is_eot
        || d.is_input
        || d.address_taken
        || d.pre_assigned.is_some())
}

#[cfg(test)]
mod tests {
    use crate::driver::RaConfig;
    use crate::global::GlobalAllocator;
    use crate::ir::cfg::Kernel;
    use crate::ir::declare::Declare;
    use crate::ir::inst::{Instruction, Opcode};
    use crate::ir::operand::{DstRegion, Operand, SrcRegion};
    use crate::ir::types::ElemType;
    use crate::liveness::Liveness;
    use crate::local::{compute_input_intervals, mark_references, LocalAllocator};
    use crate::platform::Platform;

    /// Hot values (many references) must survive cheap ones.
    #[test]
    fn eviction_prefers_cold_ranges() {
        let mut platform = Platform::default();
        platform.num_grf = 4;
        platform.reserved_top_rows = 0;
        platform.reserved_bottom_rows = 1;
        platform.eot_binding = false;
        platform.has_bank_split = false;

        let mut k = Kernel::new("cold");
        let b0 = k.new_block();
        let b1 = k.new_block();
        k.add_edge(b0, b1);

        let hot = k.new_decl(Declare::new("hot", ElemType::F, 8));
        let cold = k.new_decl(Declare::new("cold", ElemType::F, 8));
        let extra = k.new_decl(Declare::new("extra", ElemType::F, 8));
        let late = k.new_decl(Declare::new("late", ElemType::F, 8));
        let sink = k.new_decl(Declare::new("sink", ElemType::F, 8));

        let def = |k: &mut Kernel, b, d| {
            let i = Instruction::new(Opcode::Mov, 8).with_dst(DstRegion::whole(d, ElemType::F));
            k.push_inst(b, i);
        };
        let use_ = |k: &mut Kernel, b, d, s| {
            let i = Instruction::new(Opcode::Mov, 8)
                .with_dst(DstRegion::whole(d, ElemType::F))
                .with_src(Operand::Src(SrcRegion::whole(s, ElemType::F)));
            k.push_inst(b, i);
        };

        def(&mut k, b0, hot);
        def(&mut k, b0, cold);
        def(&mut k, b0, extra);
        // Many uses of hot, one of cold.
        for _ in 0..6 {
            use_(&mut k, b0, sink, hot);
        }
        def(&mut k, b0, late); // fourth live value: no room (3 usable rows)
        use_(&mut k, b1, sink, hot);
        use_(&mut k, b1, sink, cold);
        use_(&mut k, b1, sink, extra);
        use_(&mut k, b1, sink, late);
        k.assign_lexical_ids();

        let config = RaConfig::default();
        let refs = mark_references(&mut k);
        let inputs = compute_input_intervals(&k);
        let liveness = Liveness::compute(&k);
        let mut pool = {
            let mut la = LocalAllocator::new(&mut k, &platform, &config);
            la.initial_pool()
        };
        let mut ga = GlobalAllocator::new(&mut k, &platform, &config, &liveness, &refs, inputs);
        let out = ga.run(&mut pool).unwrap();

        assert!(!out.spilled.is_empty());
        assert!(
            !out.spilled.contains(&hot),
            "hot range was evicted over colder ones"
        );
    }
}

//! Local register allocation: the cheap first pass.
//!
//! A reference-marking walk classifies each declare as *local* (all
//! references in one basic block, no indirect access, not an input/output)
//! or *global*. Locals get a fast per-block linear scan against the shared
//! register pool. If everything else fits trivially, meaning the row demand
//! of the remaining unassigned declares is within the free budget, it is
//! given disjoint rows on the spot and the expensive global pass is skipped.

use rustc_hash::FxHashMap;

use crate::driver::RaConfig;
use crate::ir::arena::SecondaryMap;
use crate::ir::cfg::{BlockId, Kernel};
use crate::ir::declare::{DeclId, Declare, PhysReg, RegFile, SubAlign};
use crate::ir::inst::{InstId, Opcode};
use crate::ir::operand::Operand;
use crate::ir::types::WORDS_PER_ROW;
use crate::platform::Platform;
use crate::pool::{BankAlign, FindReq, PhysicalRegisterPool};

// =============================================================================
// Reference marking
// =============================================================================

/// Per-declare reference summary, built lazily on first reference.
#[derive(Debug, Clone, Default)]
pub struct RefRange {
    pub first_lex: u32,
    pub last_lex: u32,
    pub first_inst: Option<InstId>,
    pub last_inst: Option<InstId>,
    pub num_refs: u32,
    pub first_block: Option<BlockId>,
    pub multi_block: bool,
    pub indirect: bool,
}

impl RefRange {
    fn record(&mut self, block: BlockId, inst: InstId, lex: u32) {
        if self.num_refs == 0 {
            self.first_lex = lex;
            self.first_inst = Some(inst);
            self.first_block = Some(block);
        } else if self.first_block != Some(block) {
            self.multi_block = true;
        }
        self.last_lex = lex;
        self.last_inst = Some(inst);
        self.num_refs += 1;
    }

    pub fn is_referenced(&self) -> bool {
        self.num_refs > 0
    }
}

/// Output of the marking pass.
#[derive(Debug, Clone)]
pub struct RefInfo {
    pub ranges: SecondaryMap<Declare, RefRange>,
    /// Rows demanded by EOT send sources, to size the reserved top area.
    pub num_rows_eot: u16,
}

/// Walk every instruction in lexical order, recording first/last reference,
/// reference counts and indirect accesses. Also flags EOT payload declares
/// and address-taken targets on the declares themselves.
pub fn mark_references(kernel: &mut Kernel) -> RefInfo {
    let mut ranges: SecondaryMap<Declare, RefRange> =
        SecondaryMap::with_default(kernel.decls.len());

    let layout = kernel.layout.clone();
    for &bid in &layout {
        let insts = kernel.blocks[bid].insts.clone();
        for &iid in &insts {
            let inst = kernel.insts[iid].clone();
            let lex = inst.lex_id;
            let eot = inst.is_eot();

            inst.for_each_grf_ref(|decl, _is_def| {
                ranges[decl].record(bid, iid, lex);
            });

            // Address-of pins its target: it may be reached indirectly later.
            for src in &inst.srcs {
                if let Operand::Addr(a) = src {
                    ranges[a.target].indirect = true;
                    kernel.decls[a.target].address_taken = true;
                }
            }

            if eot {
                if let Some(payload) = inst.send_payload_src() {
                    kernel.decls[payload.decl].is_eot = true;
                }
            }
        }
    }

    // The row demand is recomputed from the flags each time; the driver
    // re-marks the kernel on every spill iteration.
    let num_rows_eot = kernel
        .decls
        .iter()
        .filter(|(_, d)| d.is_eot)
        .map(|(_, d)| d.num_rows() as u16)
        .sum();

    RefInfo {
        ranges,
        num_rows_eot,
    }
}

/// A declare is local when a single block references it directly and the ABI
/// places no constraint on it.
pub fn is_local(decl: &Declare, range: &RefRange) -> bool {
    range.is_referenced()
        && !range.multi_block
        && !range.indirect
        && !decl.address_taken
        && !decl.is_input
        && !decl.is_output
        && !decl.is_eot
        && decl.pre_assigned.is_none()
        && decl.reg_file == RegFile::Grf
}

// =============================================================================
// Input intervals
// =============================================================================

/// A pre-loaded input row stays busy from kernel entry to its last read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputInterval {
    pub row: u16,
    pub last_lex: u32,
}

/// Backward walk computing the last lexical use of each input-bound row.
pub fn compute_input_intervals(kernel: &Kernel) -> Vec<InputInterval> {
    let mut last_use: FxHashMap<u16, u32> = FxHashMap::default();

    for &bid in kernel.layout.iter().rev() {
        for &iid in kernel.blocks[bid].insts.iter().rev() {
            let inst = &kernel.insts[iid];
            inst.for_each_grf_ref(|decl, _| {
                let d = &kernel.decls[decl];
                if d.is_input {
                    if let Some(pre) = d.pre_assigned {
                        for r in pre.row..pre.row + d.num_rows() as u16 {
                            last_use.entry(r).or_insert(inst.lex_id);
                        }
                    }
                }
            });
        }
    }

    let mut intervals: Vec<InputInterval> = last_use
        .into_iter()
        .map(|(row, last_lex)| InputInterval { row, last_lex })
        .collect();
    intervals.sort_by_key(|iv| iv.row);
    intervals
}

// =============================================================================
// Bank-conflict hints
// =============================================================================

/// Precomputed bank preferences for declares feeding 3-source instructions:
/// src1 and src2 are read in the same cycle, so they are steered to opposite
/// banks.
#[derive(Debug, Clone)]
pub struct BankHints {
    hints: SecondaryMap<Declare, Option<BankAlign>>,
    pub high_internal_conflict: bool,
}

impl BankHints {
    pub fn analyze(kernel: &Kernel) -> BankHints {
        let mut hints: SecondaryMap<Declare, Option<BankAlign>> =
            SecondaryMap::with_default(kernel.decls.len());
        let mut three_src = 0usize;

        for (_, inst) in kernel.insts.iter() {
            if !inst.op.is_three_source() {
                continue;
            }
            three_src += 1;
            if let Some(Operand::Src(s1)) = inst.srcs.get(1) {
                if hints[s1.decl].is_none() {
                    hints.set(s1.decl, Some(BankAlign::Even));
                }
            }
            if let Some(Operand::Src(s2)) = inst.srcs.get(2) {
                if hints[s2.decl].is_none() {
                    hints.set(s2.decl, Some(BankAlign::Odd));
                }
            }
        }

        let high_internal_conflict = three_src * 4 >= kernel.inst_count().max(1);
        BankHints {
            hints,
            high_internal_conflict,
        }
    }

    pub fn empty(kernel: &Kernel) -> BankHints {
        BankHints {
            hints: SecondaryMap::with_default(kernel.decls.len()),
            high_internal_conflict: false,
        }
    }

    pub fn align_for(&self, decl: DeclId) -> BankAlign {
        self.hints
            .get(decl)
            .copied()
            .flatten()
            .unwrap_or(BankAlign::Either)
    }
}

// =============================================================================
// Local allocator
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct LocalOutcome {
    /// Every referenced GRF declare got a register; the global pass can be
    /// skipped entirely.
    pub fully_allocated: bool,
    pub num_rows_eot: u16,
    pub locals_assigned: u32,
    pub trivially_assigned: u32,
}

pub struct LocalAllocator<'a> {
    kernel: &'a mut Kernel,
    platform: &'a Platform,
    config: &'a RaConfig,
    pub refs: RefInfo,
    pub input_intervals: Vec<InputInterval>,
    pub bank_hints: BankHints,
}

impl<'a> LocalAllocator<'a> {
    pub fn new(kernel: &'a mut Kernel, platform: &'a Platform, config: &'a RaConfig) -> Self {
        let refs = mark_references(kernel);
        let input_intervals = compute_input_intervals(kernel);
        let bank_hints = if config.bank_conflict_reduction {
            BankHints::analyze(kernel)
        } else {
            BankHints::empty(kernel)
        };
        LocalAllocator {
            kernel,
            platform,
            config,
            refs,
            input_intervals,
            bank_hints,
        }
    }

    /// Build the pool every allocation attempt starts from: reserved and ABI
    /// rows excluded, EOT sources bound to the top, inputs busy until their
    /// last use (the caller expires them).
    pub fn initial_pool(&mut self) -> PhysicalRegisterPool {
        let mut pool = PhysicalRegisterPool::new(self.platform);

        // r0 (thread header) at the bottom, binding area at the top.
        pool.mark_unavailable(0, self.platform.reserved_bottom_rows);
        if self.platform.reserved_top_rows > 0 {
            let top = self.platform.num_grf - self.platform.reserved_top_rows.min(self.platform.num_grf);
            pool.mark_unavailable(top, self.platform.reserved_top_rows);
        }

        if self.kernel.has_stack_calls || self.kernel.is_stack_call_func {
            let abi = &self.platform.abi;
            pool.mark_unavailable(abi.fp_row, 1);
            // The callee-save marker pins its area for the whole function.
            if self.kernel.is_stack_call_func
                && self
                    .kernel
                    .insts
                    .iter()
                    .any(|(_, i)| i.op == Opcode::PseudoCalleeSave)
            {
                pool.mark_unavailable(abi.callee_save_row, abi.callee_save_rows);
            }
        }

        // EOT sources bypass contention: bind them to the topmost rows now
        // and take those rows out of circulation.
        if self.platform.eot_binding && self.refs.num_rows_eot > 0 {
            let mut next = self.platform.num_grf - self.refs.num_rows_eot;
            let eot_decls: Vec<DeclId> = self
                .kernel
                .decls
                .iter()
                .filter(|(_, d)| d.is_eot)
                .map(|(id, _)| id)
                .collect();
            for id in eot_decls {
                let rows = self.kernel.decls[id].num_rows() as u16;
                self.kernel.decls[id].phys = Some(PhysReg::row_aligned(next));
                self.kernel.decls[id].do_not_spill = true;
                pool.mark_unavailable(next, rows);
                next += rows;
            }
        }

        // Inputs occupy their rows from entry; commit and let expiry free.
        for iv in &self.input_intervals {
            if pool.is_available(iv.row) {
                pool.commit(PhysReg::row_aligned(iv.row), WORDS_PER_ROW);
            }
        }

        pool
    }

    /// Run the local pass. Leaves unassigned (global) ranges for the caller.
    pub fn run(&mut self, pool: &mut PhysicalRegisterPool) -> LocalOutcome {
        let mut outcome = LocalOutcome {
            num_rows_eot: self.refs.num_rows_eot,
            ..Default::default()
        };

        // Trivial path first: when the whole row demand fits disjointly,
        // everything gets unique rows and no scanning happens at all.
        if self.unassigned_rows_needed() <= pool.free_row_count() {
            if let Some(n) = self.assign_unique_registers(pool) {
                outcome.trivially_assigned = n;
                outcome.fully_allocated = true;
                return outcome;
            }
        }

        let layout = self.kernel.layout.clone();
        for bid in layout {
            outcome.locals_assigned += self.scan_block(bid, pool);
        }

        outcome.fully_allocated = !self.unassigned_range_found();
        outcome
    }

    /// Total rows demanded by referenced, unassigned GRF declares.
    fn unassigned_rows_needed(&self) -> u32 {
        self.kernel
            .decls
            .iter()
            .filter(|(id, d)| {
                d.reg_file == RegFile::Grf
                    && d.assignment().is_none()
                    && self.refs.ranges[*id].is_referenced()
            })
            .map(|(_, d)| d.num_rows())
            .sum()
    }

    fn unassigned_range_found(&self) -> bool {
        self.kernel.decls.iter().any(|(id, d)| {
            d.reg_file == RegFile::Grf
                && d.assignment().is_none()
                && self.refs.ranges[id].is_referenced()
        })
    }

    /// Ascending-start linear scan over one block's local ranges.
    fn scan_block(&mut self, bid: BlockId, pool: &mut PhysicalRegisterPool) -> u32 {
        // (start, end, decl) for locals rooted in this block.
        let mut intervals: Vec<(u32, u32, DeclId)> = self
            .kernel
            .decls
            .iter()
            .filter(|(id, d)| {
                is_local(d, &self.refs.ranges[*id])
                    && self.refs.ranges[*id].first_block == Some(bid)
                    && d.assignment().is_none()
            })
            .map(|(id, _)| {
                let r = &self.refs.ranges[id];
                (r.first_lex, r.last_lex, id)
            })
            .collect();
        intervals.sort_by_key(|&(start, _, id)| (start, id));

        // Active list kept sorted by ascending end for O(1) expiry.
        let mut active: Vec<(u32, DeclId, PhysReg, u32)> = Vec::new();
        let mut input_cursor = 0usize;
        let mut assigned = 0u32;

        for (start, end, decl) in intervals {
            // Expire locals whose last reference is behind us.
            while let Some(&(aend, _, preg, words)) = active.first() {
                if aend > start {
                    break;
                }
                pool.release(preg, words, aend);
                active.remove(0);
            }
            // Expire input rows the same way.
            while input_cursor < self.input_intervals.len()
                && self.input_intervals[input_cursor].last_lex <= start
            {
                let iv = self.input_intervals[input_cursor];
                if pool.is_available(iv.row) && pool.is_row_busy(iv.row) {
                    pool.release(PhysReg::row_aligned(iv.row), WORDS_PER_ROW, iv.last_lex);
                }
                input_cursor += 1;
            }

            let d = &self.kernel.decls[decl];
            let size_words = d.size_in_words();
            let align = self.bank_hints.align_for(decl);
            // In high-conflict kernels the two operand banks grow toward
            // each other from opposite ends of the file.
            let forward = !(self.bank_hints.high_internal_conflict
                && matches!(align, BankAlign::Odd | BankAlign::Odd2Grf));
            let req = FindReq {
                size_words,
                bank_align: align,
                sub_align: d.sub_align,
                start_row: self.round_robin_start(pool),
                end_row: self.platform.num_grf,
                forward,
                occupied_bundles: 0,
                forbidden: None,
            };

            let found = pool.find_free(&req).or_else(|| {
                // Fail-safe: restart the scan from the bottom.
                pool.find_free(&FindReq {
                    start_row: 0,
                    ..req
                })
            });

            if let Some(preg) = found {
                pool.commit(preg, size_words);
                self.kernel.decls[decl].phys = Some(preg);
                let pos = active.partition_point(|&(aend, ..)| aend <= end);
                active.insert(pos, (end, decl, preg, size_words));
                assigned += 1;
            }
            // On failure the range simply stays unassigned; the global pass
            // (or the trivial path) picks it up.
        }

        // Return everything still active so the next block starts clean.
        for (aend, _, preg, words) in active {
            pool.release(preg, words, aend);
        }
        assigned
    }

    /// Rotating start row: prefer the bank whose rows were released longest
    /// ago (round robin flavored by last-use sums, 2:1 bias threshold).
    fn round_robin_start(&self, pool: &PhysicalRegisterPool) -> u16 {
        if !pool.two_banks() || !self.config.round_robin {
            return 0;
        }
        let [(free0, sum0), (free1, sum1)] = pool.bank_stats();
        if free1 == 0 {
            return 0;
        }
        if free0 == 0 {
            return crate::platform::SECOND_BANK_START_ROW;
        }
        // Prefer the second bank when the first looks much warmer.
        if sum0 > 2 * sum1 {
            crate::platform::SECOND_BANK_START_ROW
        } else {
            0
        }
    }

    /// Unique-assignment fast path: give every remaining referenced declare
    /// disjoint whole rows. Returns the number assigned, or None (with all
    /// partial work undone) when something did not fit after all.
    fn assign_unique_registers(&mut self, pool: &mut PhysicalRegisterPool) -> Option<u32> {
        let pending: Vec<DeclId> = self
            .kernel
            .decls
            .iter()
            .filter(|(id, d)| {
                d.reg_file == RegFile::Grf
                    && d.assignment().is_none()
                    && self.refs.ranges[*id].is_referenced()
            })
            .map(|(id, _)| id)
            .collect();

        let mut done: Vec<(DeclId, PhysReg, u32)> = Vec::new();
        for decl in pending {
            let d = &self.kernel.decls[decl];
            let rows = d.num_rows();
            let req = FindReq {
                size_words: rows * WORDS_PER_ROW,
                bank_align: self.bank_hints.align_for(decl),
                sub_align: SubAlign::Grf,
                start_row: 0,
                end_row: self.platform.num_grf,
                forward: true,
                occupied_bundles: 0,
                forbidden: None,
            };
            match pool.find_free(&req) {
                Some(preg) => {
                    pool.commit(preg, rows * WORDS_PER_ROW);
                    self.kernel.decls[decl].phys = Some(preg);
                    done.push((decl, preg, rows * WORDS_PER_ROW));
                }
                None => {
                    for (id, preg, words) in done {
                        pool.release(preg, words, 0);
                        self.kernel.decls[id].phys = None;
                    }
                    return None;
                }
            }
        }
        Some(done.len() as u32)
    }
}

/// Clear every allocator-produced assignment; pre-assigned and EOT bindings
/// survive. Used between spill iterations.
pub fn undo_assignments(kernel: &mut Kernel) {
    for (_, d) in kernel.decls.iter_mut() {
        if !d.is_eot {
            d.phys = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RaConfig;
    use crate::ir::declare::Declare;
    use crate::ir::inst::{Instruction, Opcode, SendDesc};
    use crate::ir::operand::{DstRegion, Operand, SrcRegion};
    use crate::ir::types::ElemType;

    fn mov(k: &mut Kernel, b: BlockId, dst: DeclId, src: Option<DeclId>) {
        let mut inst =
            Instruction::new(Opcode::Mov, 8).with_dst(DstRegion::whole(dst, ElemType::F));
        if let Some(s) = src {
            inst = inst.with_src(Operand::Src(SrcRegion::whole(s, ElemType::F)));
        }
        k.push_inst(b, inst);
    }

    fn row_decl(k: &mut Kernel, name: &str) -> DeclId {
        k.new_decl(Declare::new(name, ElemType::F, 8))
    }

    #[test]
    fn classify_local_vs_global() {
        let mut k = Kernel::new("t");
        let b0 = k.new_block();
        let b1 = k.new_block();
        k.add_edge(b0, b1);

        let local = row_decl(&mut k, "l");
        let global = row_decl(&mut k, "g");

        mov(&mut k, b0, local, None);
        mov(&mut k, b0, global, Some(local));
        mov(&mut k, b1, global, Some(global));
        k.assign_lexical_ids();

        let refs = mark_references(&mut k);
        assert!(is_local(&k.decls[local], &refs.ranges[local]));
        assert!(!is_local(&k.decls[global], &refs.ranges[global]));
        assert_eq!(refs.ranges[global].num_refs, 3);
    }

    #[test]
    fn sequential_locals_share_registers() {
        // Strictly sequential lifetimes reuse rows once the pool is too
        // small for the trivial unique-assignment path.
        let mut k = Kernel::new("seq");
        let b0 = k.new_block();
        let sink = row_decl(&mut k, "sink");
        mov(&mut k, b0, sink, None);

        let mut decls = Vec::new();
        for i in 0..4 {
            let d = row_decl(&mut k, &format!("v{i}"));
            mov(&mut k, b0, d, None);
            mov(&mut k, b0, sink, Some(d));
            decls.push(d);
        }
        k.assign_lexical_ids();

        let mut platform = Platform::default();
        platform.num_grf = 4;
        platform.reserved_top_rows = 0;
        platform.eot_binding = false;
        platform.has_bank_split = false;
        let config = RaConfig::default();
        let mut la = LocalAllocator::new(&mut k, &platform, &config);
        let mut pool = la.initial_pool();
        let outcome = la.run(&mut pool);

        assert!(outcome.fully_allocated);
        // All four sequential declares expire in turn; they can share one row.
        let rows: Vec<u16> = decls
            .iter()
            .map(|&d| k.decls[d].phys.unwrap().row)
            .collect();
        assert!(rows.iter().all(|&r| r == rows[0]));
    }

    #[test]
    fn overlapping_locals_get_distinct_rows() {
        let mut k = Kernel::new("ovl");
        let b0 = k.new_block();
        let a = row_decl(&mut k, "a");
        let b = row_decl(&mut k, "b");
        let s = row_decl(&mut k, "s");

        mov(&mut k, b0, a, None);
        mov(&mut k, b0, b, None);
        mov(&mut k, b0, s, Some(a));
        mov(&mut k, b0, s, Some(b));
        k.assign_lexical_ids();

        let platform = Platform::default();
        let config = RaConfig::default();
        let mut la = LocalAllocator::new(&mut k, &platform, &config);
        let mut pool = la.initial_pool();
        la.run(&mut pool);

        let ra = k.decls[a].phys.unwrap();
        let rb = k.decls[b].phys.unwrap();
        assert_ne!((ra.row, ra.sub_word), (rb.row, rb.sub_word));
    }

    #[test]
    fn eot_lands_in_top_rows() {
        let mut k = Kernel::new("eot");
        let b0 = k.new_block();
        let payload = k.new_decl(Declare::new("eot_src", ElemType::Ud, 16)); // 2 rows

        let mut send = Instruction::new(Opcode::Send, 16)
            .with_src(Operand::Src(SrcRegion::whole(payload, ElemType::Ud)));
        send.msg = Some(SendDesc {
            payload_rows: 2,
            response_rows: 0,
            is_eot: true,
            scratch: None,
        });
        k.push_inst(b0, send);
        k.assign_lexical_ids();

        let platform = Platform::default();
        let config = RaConfig::default();
        let mut la = LocalAllocator::new(&mut k, &platform, &config);
        let _pool = la.initial_pool();

        let preg = k.decls[payload].phys.unwrap();
        assert_eq!(preg.row, platform.num_grf - 2);
        assert!(k.decls[payload].do_not_spill);
    }

    #[test]
    fn remarking_keeps_eot_row_demand() {
        // The driver marks references again on every spill iteration; the
        // EOT row demand must not decay once the payload flag is set.
        let mut k = Kernel::new("remark");
        let b0 = k.new_block();
        let payload = k.new_decl(Declare::new("eot_src", ElemType::Ud, 16)); // 2 rows

        let mut send = Instruction::new(Opcode::Send, 16)
            .with_src(Operand::Src(SrcRegion::whole(payload, ElemType::Ud)));
        send.msg = Some(SendDesc {
            payload_rows: 2,
            response_rows: 0,
            is_eot: true,
            scratch: None,
        });
        k.push_inst(b0, send);
        k.assign_lexical_ids();

        let first = mark_references(&mut k);
        let second = mark_references(&mut k);
        assert_eq!(first.num_rows_eot, 2);
        assert_eq!(second.num_rows_eot, 2);
    }

    #[test]
    fn callee_save_marker_reserves_the_area() {
        let mut k = Kernel::new("callee");
        k.is_stack_call_func = true;
        let b0 = k.new_block();
        k.push_inst(b0, Instruction::new(Opcode::PseudoCalleeSave, 1));
        let v = row_decl(&mut k, "v");
        mov(&mut k, b0, v, None);
        k.assign_lexical_ids();

        let mut platform = Platform::default();
        platform.abi.callee_save_row = 8;
        platform.abi.callee_save_rows = 4;
        let config = RaConfig::default();
        let mut la = LocalAllocator::new(&mut k, &platform, &config);
        let pool = la.initial_pool();

        for r in 8..12 {
            assert!(!pool.is_available(r));
        }
        assert!(pool.is_available(12));
        assert!(!pool.is_available(platform.abi.fp_row));
    }

    #[test]
    fn input_rows_blocked_until_last_use() {
        let mut k = Kernel::new("in");
        let b0 = k.new_block();
        let input = k.new_input(Declare::new("in0", ElemType::F, 8), 4);
        let v = row_decl(&mut k, "v");
        mov(&mut k, b0, v, Some(input));
        k.assign_lexical_ids();

        let platform = Platform::default();
        let config = RaConfig::default();
        let mut la = LocalAllocator::new(&mut k, &platform, &config);
        assert_eq!(
            la.input_intervals,
            vec![InputInterval {
                row: 4,
                last_lex: 1
            }]
        );
        let pool = la.initial_pool();
        assert!(pool.is_row_busy(4));
    }

    #[test]
    fn undo_preserves_eot() {
        let mut k = Kernel::new("undo");
        let _b = k.new_block();
        let d = row_decl(&mut k, "v");
        k.decls[d].phys = Some(PhysReg::row_aligned(7));
        let e = row_decl(&mut k, "e");
        k.decls[e].is_eot = true;
        k.decls[e].phys = Some(PhysReg::row_aligned(126));

        undo_assignments(&mut k);
        assert!(k.decls[d].phys.is_none());
        assert!(k.decls[e].phys.is_some());
    }
}

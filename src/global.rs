//! Global linear scan over the whole kernel.
//!
//! Intervals are built from block liveness plus per-instruction references,
//! with back edges stretching loop-carried values to the bottom of the loop.
//! The scan walks intervals by ascending start, expires finished ones, and
//! allocates from the shared pool; when nothing fits, the spill candidate
//! selector evicts the cheapest window of occupants and the request retries.

use smallvec::SmallVec;

use crate::driver::{RaConfig, RaError};
use crate::ir::arena::BitSet;
use crate::ir::cfg::Kernel;
use crate::ir::declare::{DeclId, PhysReg, RegFile};
use crate::ir::types::{LexPoint, WORDS_PER_ROW};
use crate::liveness::Liveness;
use crate::local::{InputInterval, RefInfo};
use crate::platform::Platform;
use crate::pool::{BankAlign, FindReq, PhysicalRegisterPool};
use crate::spill::candidate;

// =============================================================================
// Intervals
// =============================================================================

/// One declare's whole-kernel live interval, in program points
/// (`2*lex_id` before, `2*lex_id + 1` after).
#[derive(Debug, Clone)]
pub struct GlobalInterval {
    pub decl: DeclId,
    pub start: u32,
    pub end: u32,
    pub num_refs: u32,
    pub size_words: u32,
    pub rows: u16,
    /// Fixed placement honored instead of searching (EOT, ABI declares).
    pub pre: Option<PhysReg>,
    /// Rows this interval must not occupy (caller-save area across calls).
    pub forbidden: Option<BitSet>,
    /// Where the scan put it, while active.
    pub assigned: Option<PhysReg>,
}

impl GlobalInterval {
    pub fn overlaps(&self, other: &GlobalInterval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Build start-sorted intervals for every referenced GRF declare. Public so
/// interference queries (spill layout, tests) can reuse the exact ranges the
/// scan allocates with.
pub fn build_intervals(
    kernel: &Kernel,
    liveness: &Liveness,
    refs: &RefInfo,
) -> Vec<GlobalInterval> {
    let n = kernel.decls.len();
    let mut start: Vec<Option<u32>> = vec![None; n];
    let mut end: Vec<u32> = vec![0; n];

    let touch = |idx: usize, s: u32, e: u32, start: &mut Vec<Option<u32>>, end: &mut Vec<u32>| {
        if start[idx].is_none() || start[idx].unwrap() > s {
            start[idx] = Some(s);
        }
        if end[idx] < e {
            end[idx] = e;
        }
    };

    for &bid in &kernel.layout {
        let (first, last) = match kernel.block_lex_range(bid) {
            Some(r) => r,
            None => continue,
        };
        let bstart = LexPoint::before(first).raw();
        let bend = LexPoint::after(last).raw();

        for d in liveness.live_in(bid).ones() {
            touch(d, bstart, bstart, &mut start, &mut end);
        }
        for &iid in &kernel.blocks[bid].insts {
            let inst = &kernel.insts[iid];
            let at_before = LexPoint::before(inst.lex_id).raw();
            let at_after = LexPoint::after(inst.lex_id).raw();
            inst.for_each_grf_ref(|decl, _is_def| {
                touch(decl.as_usize(), at_before, at_after, &mut start, &mut end);
            });
        }
        for d in liveness.live_out(bid).ones() {
            touch(d, bstart, bend, &mut start, &mut end);
        }
    }

    // Loop-carried values stay live to the bottom of the loop: every declare
    // live into the header is extended to the end of each latch block.
    for (latch, header) in kernel.back_edges() {
        if let Some((_, last)) = kernel.block_lex_range(latch) {
            let e = LexPoint::after(last).raw();
            for d in liveness.live_in(header).ones() {
                if start[d].is_some() && end[d] < e {
                    end[d] = e;
                }
            }
        }
    }

    let kernel_end = kernel.end_point().raw();
    let mut out = Vec::new();
    for (id, decl) in kernel.decls.iter() {
        if decl.reg_file != RegFile::Grf {
            continue;
        }
        let idx = id.as_usize();
        let s = match start[idx] {
            Some(s) => s,
            None => continue, // never referenced
        };
        let (s, mut e) = if decl.is_input { (0, end[idx]) } else { (s, end[idx]) };
        if decl.is_output {
            e = kernel_end;
        }
        out.push(GlobalInterval {
            decl: id,
            start: s,
            end: e.max(s),
            num_refs: refs.ranges[id].num_refs,
            size_words: decl.size_in_words(),
            rows: decl.num_rows() as u16,
            pre: decl.assignment(),
            forbidden: None,
            assigned: decl.assignment(),
        });
    }
    out.sort_by_key(|iv| (iv.start, iv.decl));
    out
}

/// Attach caller-save forbidden sets: any interval live across a call site
/// must stay out of rows the callee may clobber. `PseudoCallerSave` markers
/// count as clobber points the same as real calls.
fn apply_call_constraints(kernel: &Kernel, platform: &Platform, intervals: &mut [GlobalInterval]) {
    if !kernel.has_stack_calls {
        return;
    }
    let call_points: Vec<u32> = kernel
        .insts
        .iter()
        .filter(|(_, i)| {
            matches!(
                i.op,
                crate::ir::inst::Opcode::Call | crate::ir::inst::Opcode::PseudoCallerSave
            )
        })
        .map(|(_, i)| LexPoint::before(i.lex_id).raw())
        .collect();
    if call_points.is_empty() {
        return;
    }

    let mut caller_save = BitSet::with_capacity(platform.num_grf as usize);
    for r in 0..platform.abi.caller_save_rows.min(platform.num_grf) {
        caller_save.insert(r as usize);
    }

    for iv in intervals.iter_mut() {
        if iv.pre.is_some() {
            continue;
        }
        let crosses = call_points.iter().any(|&p| iv.start < p && iv.end > p);
        if crosses {
            iv.forbidden = Some(caller_save.clone());
        }
    }
}

// =============================================================================
// Scan
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct GlobalOutcome {
    /// Declares evicted this round; empty means the allocation converged.
    pub spilled: Vec<DeclId>,
    pub assigned: u32,
    pub peak_active_rows: u32,
}

pub struct GlobalAllocator<'a> {
    pub(crate) kernel: &'a mut Kernel,
    platform: &'a Platform,
    config: &'a RaConfig,
    pub(crate) intervals: Vec<GlobalInterval>,
    /// Indices into `intervals`, active and sorted ascending by end.
    pub(crate) active: Vec<usize>,
    /// Per-row occupancy buckets so the candidate selector can enumerate a
    /// window's occupants without scanning the whole active list.
    pub(crate) active_by_row: Vec<SmallVec<[usize; 4]>>,
    input_intervals: Vec<InputInterval>,
    pub(crate) kernel_end: u32,
}

impl<'a> GlobalAllocator<'a> {
    pub fn new(
        kernel: &'a mut Kernel,
        platform: &'a Platform,
        config: &'a RaConfig,
        liveness: &Liveness,
        refs: &RefInfo,
        input_intervals: Vec<InputInterval>,
    ) -> Self {
        let mut intervals = build_intervals(kernel, liveness, refs);
        apply_call_constraints(kernel, platform, &mut intervals);
        let kernel_end = kernel.end_point().raw();
        let rows = platform.num_grf as usize;
        GlobalAllocator {
            kernel,
            platform,
            config,
            intervals,
            active: Vec::new(),
            active_by_row: vec![SmallVec::new(); rows],
            input_intervals,
            kernel_end,
        }
    }

    /// Run one scan. Returns the set of declares evicted to memory (empty on
    /// convergence) or a hard failure when even spilling cannot make room.
    pub fn run(&mut self, pool: &mut PhysicalRegisterPool) -> Result<GlobalOutcome, RaError> {
        let mut outcome = GlobalOutcome::default();
        let mut input_cursor = 0usize;

        let order: Vec<usize> = (0..self.intervals.len()).collect();
        for idx in order {
            let start = self.intervals[idx].start;
            self.expire(pool, start);
            while input_cursor < self.input_intervals.len() {
                let iv = self.input_intervals[input_cursor];
                if LexPoint::after(iv.last_lex).raw() > start {
                    break;
                }
                if pool.is_available(iv.row) && pool.is_row_busy(iv.row) {
                    pool.release(PhysReg::row_aligned(iv.row), WORDS_PER_ROW, iv.last_lex);
                }
                input_cursor += 1;
            }

            if let Some(pre) = self.intervals[idx].pre {
                // Fixed placement: occupy it for the interval's duration when
                // the rows are in circulation at all.
                if pool.is_available(pre.row) {
                    let words = self.intervals[idx].size_words;
                    debug_assert!(
                        !pool.are_words_busy(pre.row, pre.sub_word as u32, words.min(WORDS_PER_ROW - pre.sub_word as u32)),
                        "pre-assigned rows already taken"
                    );
                    pool.commit(pre, words);
                    self.intervals[idx].assigned = Some(pre);
                    self.make_active(idx, pre);
                }
                continue;
            }

            let preg = self.allocate(pool, idx, &mut outcome.spilled)?;
            self.intervals[idx].assigned = Some(preg);
            self.kernel.decls[self.intervals[idx].decl].phys = Some(preg);
            self.make_active(idx, preg);
            outcome.assigned += 1;

            let live_rows: u32 = self.active.iter().map(|&i| self.intervals[i].rows as u32).sum();
            outcome.peak_active_rows = outcome.peak_active_rows.max(live_rows);
        }

        Ok(outcome)
    }

    /// Find a placement for `idx`, evicting occupants if needed.
    fn allocate(
        &mut self,
        pool: &mut PhysicalRegisterPool,
        idx: usize,
        spilled: &mut Vec<DeclId>,
    ) -> Result<PhysReg, RaError> {
        let mut evictions = 0u32;
        loop {
            let iv = &self.intervals[idx];
            let decl = &self.kernel.decls[iv.decl];
            let req = FindReq {
                size_words: iv.size_words,
                bank_align: BankAlign::Either,
                sub_align: decl.sub_align,
                start_row: self.round_robin_start(pool),
                end_row: self.platform.num_grf,
                forward: true,
                occupied_bundles: 0,
                forbidden: iv.forbidden.as_ref(),
            };
            if let Some(p) = pool
                .find_free(&req)
                .or_else(|| pool.find_free(&FindReq { start_row: 0, ..req }))
            {
                pool.commit(p, self.intervals[idx].size_words);
                return Ok(p);
            }

            let choice = match candidate::find_spill_candidate(self, pool, idx) {
                Some(c) => c,
                None => {
                    let name = self.kernel.decls[self.intervals[idx].decl].name.clone();
                    return Err(RaError::AllocationFailure { decl: name });
                }
            };
            if self.config.trace {
                eprintln!(
                    "lsra: evicting {} range(s) at row {} (cost {:.3})",
                    choice.victims.len(),
                    choice.start_row,
                    choice.cost
                );
                eprintln!("lsra: pool {}", pool.dump_busy());
            }
            self.evict(pool, &choice.victims, spilled);

            evictions += choice.victims.len().max(1) as u32;
            if evictions > self.intervals.len() as u32 + self.platform.num_grf as u32 {
                let name = self.kernel.decls[self.intervals[idx].decl].name.clone();
                return Err(RaError::AllocationFailure { decl: name });
            }
        }
    }

    /// Release intervals whose end is at or behind `point`.
    fn expire(&mut self, pool: &mut PhysicalRegisterPool, point: u32) {
        while let Some(&first) = self.active.first() {
            let iv = &self.intervals[first];
            if iv.end > point {
                break;
            }
            if let Some(p) = iv.assigned {
                pool.release(p, iv.size_words, LexPoint::from_raw(iv.end).inst_index());
                self.drop_from_rows(first, p);
            }
            self.active.remove(0);
        }
    }

    fn make_active(&mut self, idx: usize, at: PhysReg) {
        let end = self.intervals[idx].end;
        let pos = self
            .active
            .partition_point(|&i| self.intervals[i].end <= end);
        self.active.insert(pos, idx);
        for r in at.row..at.row + self.intervals[idx].rows {
            self.active_by_row[r as usize].push(idx);
        }
    }

    fn drop_from_rows(&mut self, idx: usize, at: PhysReg) {
        for r in at.row..at.row + self.intervals[idx].rows {
            self.active_by_row[r as usize].retain(|&mut i| i != idx);
        }
    }

    /// Evict active intervals: free their registers, clear the assignment,
    /// queue the declares for spill code generation.
    fn evict(
        &mut self,
        pool: &mut PhysicalRegisterPool,
        victims: &[usize],
        spilled: &mut Vec<DeclId>,
    ) {
        for &v in victims {
            let at = self.intervals[v]
                .assigned
                .take()
                .expect("evicting an interval that holds no register");
            let start = self.intervals[v].start;
            pool.release(at, self.intervals[v].size_words, LexPoint::from_raw(start).inst_index());
            self.drop_from_rows(v, at);
            self.active.retain(|&i| i != v);

            let decl = self.intervals[v].decl;
            self.kernel.decls[decl].phys = None;
            if !spilled.contains(&decl) {
                spilled.push(decl);
            }
        }
    }

    fn round_robin_start(&self, pool: &PhysicalRegisterPool) -> u16 {
        if !pool.two_banks() || !self.config.round_robin {
            return 0;
        }
        let [(_, sum0), (free1, sum1)] = pool.bank_stats();
        if free1 > 0 && sum0 > 2 * sum1 {
            crate::platform::SECOND_BANK_START_ROW
        } else {
            0
        }
    }
}

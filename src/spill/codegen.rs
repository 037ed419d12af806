//! Spill code insertion.
//!
//! Rewrites every reference to a spilled declare: sources read through a fill
//! temporary loaded from scratch, destinations write a store temporary that
//! is flushed back. Writes that do not cover their whole row segment (or that
//! are predicated, or sit under divergent control flow without NoMask) must
//! read-modify-write: the segment is preloaded before the def so the store
//! commits valid bytes. A def that dominates every use of its declare skips
//! the preload, since bytes it leaves untouched are never observed.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::cfg::{BlockId, Kernel};
use crate::ir::declare::{DeclId, Declare, PhysReg, SubAlign};
use crate::ir::inst::{InstId, Instruction, Opcode, SendDesc};
use crate::ir::operand::{DstRegion, Operand, SrcRegion};
use crate::ir::types::{ElemType, ROW_BYTES};
use crate::platform::Platform;
use crate::spill::message::{build_row_msgs, ScratchMsg};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillStats {
    pub fills: u32,
    pub stores: u32,
    /// Fills inserted purely to preload a read-modify-write segment.
    pub preloads: u32,
    pub temps: u32,
}

impl SpillStats {
    pub fn total_insts(&self) -> u32 {
        self.fills + self.stores
    }
}

#[derive(Debug, Default)]
struct DefUse {
    defs: Vec<(BlockId, u32)>,
    uses: Vec<(BlockId, u32)>,
}

/// Reserved-row state for fail-safe temporaries.
#[derive(Debug, Clone, Copy)]
pub struct FailSafeWindow {
    pub base: u16,
    pub rows: u16,
}

pub struct SpillCodeGenerator<'a> {
    kernel: &'a mut Kernel,
    platform: &'a Platform,
    pub stats: SpillStats,
    fail_safe: Option<FailSafeWindow>,
    fail_safe_cursor: u16,
    next_temp: u32,
}

impl<'a> SpillCodeGenerator<'a> {
    pub fn new(
        kernel: &'a mut Kernel,
        platform: &'a Platform,
        fail_safe: Option<FailSafeWindow>,
    ) -> Self {
        SpillCodeGenerator {
            kernel,
            platform,
            stats: SpillStats::default(),
            fail_safe,
            fail_safe_cursor: 0,
            next_temp: 0,
        }
    }

    /// Insert spill code for every reference to the given declares, which
    /// must already carry displacements. Rewrites block instruction lists in
    /// place; lexical ids are stale afterwards until the next renumbering.
    pub fn run(&mut self, spilled: &[DeclId]) {
        let spill_set: FxHashSet<DeclId> = spilled
            .iter()
            .copied()
            .filter(|&d| self.kernel.decls[d].spill_disp.is_some())
            .collect();
        if spill_set.is_empty() {
            return;
        }
        let defuse = self.collect_def_use(&spill_set);

        let layout = self.kernel.layout.clone();
        for bid in layout {
            let all_lanes = self.kernel.blocks[bid].all_lanes_active;
            let old = std::mem::take(&mut self.kernel.blocks[bid].insts);
            let mut list: Vec<InstId> = Vec::with_capacity(old.len());

            for iid in old {
                let mut touches = false;
                self.kernel.insts[iid].for_each_grf_ref(|d, _| {
                    touches |= spill_set.contains(&d);
                });
                if !touches {
                    list.push(iid);
                    continue;
                }

                let mut inst = self.kernel.insts[iid].clone();
                let mut pre: Vec<InstId> = Vec::new();
                let mut post: Vec<InstId> = Vec::new();

                if inst.op.is_send() && inst.msg.is_some() {
                    self.rewrite_send(&mut inst, &spill_set, &mut pre, &mut post);
                } else {
                    for si in 0..inst.srcs.len() {
                        if let Operand::Src(s) = inst.srcs[si] {
                            if spill_set.contains(&s.decl) {
                                let mut s = s;
                                self.fill_src(&mut s, inst.exec_size, &mut pre);
                                inst.srcs[si] = Operand::Src(s);
                            }
                        }
                    }
                    if let Some(Operand::Dst(dr)) = inst.dst {
                        if spill_set.contains(&dr.decl) {
                            let mut dr = dr;
                            self.store_dst(
                                &mut dr, &inst, bid, all_lanes, &defuse, &mut pre, &mut post,
                            );
                            inst.dst = Some(Operand::Dst(dr));
                        }
                    }
                }

                self.kernel.insts[iid] = inst;
                list.extend(pre);
                list.push(iid);
                list.extend(post);
            }
            self.kernel.blocks[bid].insts = list;
        }
    }

    fn collect_def_use(&self, spill_set: &FxHashSet<DeclId>) -> FxHashMap<DeclId, DefUse> {
        let mut map: FxHashMap<DeclId, DefUse> = FxHashMap::default();
        for &bid in &self.kernel.layout {
            for &iid in &self.kernel.blocks[bid].insts {
                let inst = &self.kernel.insts[iid];
                let lex = inst.lex_id;
                inst.for_each_grf_ref(|d, is_def| {
                    if spill_set.contains(&d) {
                        let du = map.entry(d).or_default();
                        if is_def {
                            du.defs.push((bid, lex));
                        } else {
                            du.uses.push((bid, lex));
                        }
                    }
                });
            }
        }
        map
    }

    /// Whether the def at (`block`, `lex`) is the declare's only def and
    /// lexically precedes every use in the same block. Such a def is the sole
    /// source of the value, so bytes it does not write are never observed.
    fn def_dominates_uses(du: &DefUse, block: BlockId, lex: u32) -> bool {
        du.defs.len() == 1
            && du.defs[0] == (block, lex)
            && du.uses.iter().all(|&(ub, ulex)| ub == block && ulex > lex)
    }

    // -------------------------------------------------------------------------
    // Sources
    // -------------------------------------------------------------------------

    fn fill_src(&mut self, src: &mut SrcRegion, exec_size: u8, pre: &mut Vec<InstId>) {
        let disp = self.spill_disp(src.decl);
        let first_row = src.row_off as u32;
        let extent = src.byte_extent(exec_size).max(1);
        let last_row = (src.byte_off() + extent - 1) / ROW_BYTES;
        let rows = last_row - first_row + 1;

        let temp = self.new_temp("FL", src.ty, rows);
        for (row_off, msg) in build_row_msgs(self.platform, disp + first_row * ROW_BYTES, rows, false)
        {
            let id = self.make_fill(temp, row_off, src.ty, msg);
            pre.push(id);
        }
        src.decl = temp;
        src.row_off -= first_row as u16;
    }

    // -------------------------------------------------------------------------
    // Destinations
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn store_dst(
        &mut self,
        dst: &mut DstRegion,
        inst: &Instruction,
        block: BlockId,
        all_lanes: bool,
        defuse: &FxHashMap<DeclId, DefUse>,
        pre: &mut Vec<InstId>,
        post: &mut Vec<InstId>,
    ) {
        let decl = dst.decl;
        let disp = self.spill_disp(decl);
        let first_row = dst.row_off as u32;
        let extent = dst.byte_extent(inst.exec_size).max(1);
        let last_row = (dst.byte_off() + extent - 1) / ROW_BYTES;
        let rows = last_row - first_row + 1;

        let covers_segment = dst.word_off == 0 && dst.hstride == 1 && extent == rows * ROW_BYTES;
        // `sel` writes every lane of its region regardless of the predicate.
        let predicated = inst.pred.is_some() && inst.op != Opcode::Sel;
        let divergent_write = !all_lanes && !inst.write_enable;
        let mut needs_rmw = !covers_segment || predicated || divergent_write;

        if needs_rmw {
            if let Some(du) = defuse.get(&decl) {
                if Self::def_dominates_uses(du, block, inst.lex_id) {
                    needs_rmw = false;
                }
            }
        }

        let temp = self.new_temp("SP", dst.ty, rows);
        let base = disp + first_row * ROW_BYTES;
        if needs_rmw {
            for (row_off, msg) in build_row_msgs(self.platform, base, rows, false) {
                let id = self.make_fill(temp, row_off, dst.ty, msg);
                pre.push(id);
                self.stats.preloads += 1;
            }
        }
        for (row_off, msg) in build_row_msgs(self.platform, base, rows, true) {
            let id = self.make_store(temp, row_off, dst.ty, msg);
            post.push(id);
        }
        dst.decl = temp;
        dst.row_off -= first_row as u16;
    }

    // -------------------------------------------------------------------------
    // Sends
    // -------------------------------------------------------------------------

    /// Send payloads and responses move whole-GRF units; spilled ones are
    /// filled/stored as complete declares, in portions capped by the message
    /// length limit.
    fn rewrite_send(
        &mut self,
        inst: &mut Instruction,
        spill_set: &FxHashSet<DeclId>,
        pre: &mut Vec<InstId>,
        post: &mut Vec<InstId>,
    ) {
        let msg = inst.msg.unwrap_or_default();

        if let Some(Operand::Src(s)) = inst.srcs.first().copied() {
            if spill_set.contains(&s.decl) {
                let rows = self.kernel.decls[s.decl].num_rows();
                let disp = self.spill_disp(s.decl);
                let temp = self.new_temp("FL", s.ty, rows);
                for (row_off, m) in build_row_msgs(self.platform, disp, rows, false) {
                    let id = self.make_fill(temp, row_off, s.ty, m);
                    pre.push(id);
                }
                let mut s = s;
                s.decl = temp;
                inst.srcs[0] = Operand::Src(s);
            }
        }

        if let Some(Operand::Dst(dr)) = inst.dst {
            if spill_set.contains(&dr.decl) {
                let rows = self.kernel.decls[dr.decl].num_rows();
                let disp = self.spill_disp(dr.decl);
                let temp = self.new_temp("SP", dr.ty, rows);

                // Response covering only part of the declare: preload the
                // rest so the writeback is whole.
                let partial = dr.row_off != 0 || (msg.response_rows as u32) < rows;
                if partial {
                    for (row_off, m) in build_row_msgs(self.platform, disp, rows, false) {
                        let id = self.make_fill(temp, row_off, dr.ty, m);
                        pre.push(id);
                        self.stats.preloads += 1;
                    }
                }
                for (row_off, m) in build_row_msgs(self.platform, disp, rows, true) {
                    let id = self.make_store(temp, row_off, dr.ty, m);
                    post.push(id);
                }
                let mut dr = dr;
                dr.decl = temp;
                inst.dst = Some(Operand::Dst(dr));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn spill_disp(&self, decl: DeclId) -> u32 {
        self.kernel.decls[decl]
            .spill_disp
            .expect("spill codegen on a declare without a displacement")
    }

    fn new_temp(&mut self, prefix: &str, ty: ElemType, rows: u32) -> DeclId {
        let mut d = Declare::new(
            format!("{prefix}_{}", self.next_temp),
            ty,
            rows * ROW_BYTES / ty.size(),
        );
        self.next_temp += 1;
        self.stats.temps += 1;
        d.sub_align = SubAlign::Grf;
        d.do_not_spill = true;
        if let Some(fs) = self.fail_safe {
            if self.fail_safe_cursor + rows as u16 > fs.rows {
                self.fail_safe_cursor = 0;
            }
            d.pre_assigned = Some(PhysReg::row_aligned(fs.base + self.fail_safe_cursor));
            self.fail_safe_cursor += rows as u16;
        }
        self.kernel.new_decl(d)
    }

    fn make_fill(&mut self, temp: DeclId, row_off: u32, ty: ElemType, msg: ScratchMsg) -> InstId {
        self.stats.fills += 1;
        let mut fill = Instruction::new(Opcode::SpillFill, 16);
        fill.write_enable = true;
        fill.dst = Some(Operand::Dst(DstRegion {
            decl: temp,
            row_off: row_off as u16,
            word_off: 0,
            hstride: 1,
            ty: ty.to_int_of_same_width(),
        }));
        fill.msg = Some(SendDesc {
            payload_rows: 0,
            response_rows: msg.rows() as u8,
            is_eot: false,
            scratch: Some(msg),
        });
        self.kernel.insts.alloc(fill)
    }

    fn make_store(&mut self, temp: DeclId, row_off: u32, ty: ElemType, msg: ScratchMsg) -> InstId {
        self.stats.stores += 1;
        let mut store = Instruction::new(Opcode::SpillStore, 16);
        store.write_enable = true;
        store.srcs.push(Operand::Src(SrcRegion {
            decl: temp,
            row_off: row_off as u16,
            word_off: 0,
            vstride: 1,
            width: 1,
            hstride: 1,
            ty: ty.to_int_of_same_width(),
        }));
        store.msg = Some(SendDesc {
            payload_rows: msg.rows() as u8,
            response_rows: 0,
            is_eot: false,
            scratch: Some(msg),
        });
        self.kernel.insts.alloc(store)
    }
}

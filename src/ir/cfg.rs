//! Basic blocks and the per-kernel instruction CFG.
//!
//! Blocks hold instruction id lists and reference each other by id, so the
//! graph has no ownership cycles. Layout order is the lexical order used for
//! interval construction; back edges are edges against layout order
//! (control flow is assumed reducible).

use rustc_hash::FxHashMap;

use super::arena::{Arena, Id};
use super::declare::{DeclId, Declare, PhysReg, RegFile};
use super::inst::{InstId, Instruction};
use super::types::LexPoint;

pub type BlockId = Id<BasicBlock>;

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub insts: Vec<InstId>,
    pub loop_depth: u32,
    /// Whether all SIMD lanes are known active throughout the block. Blocks
    /// under divergent control flow clear this; partial writes inside them
    /// need read-modify-write spills.
    pub all_lanes_active: bool,
}

impl BasicBlock {
    fn new() -> Self {
        BasicBlock {
            preds: Vec::new(),
            succs: Vec::new(),
            insts: Vec::new(),
            loop_depth: 0,
            all_lanes_active: true,
        }
    }
}

/// One kernel's IR: arenas plus block layout.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub name: String,
    pub decls: Arena<Declare>,
    pub insts: Arena<Instruction>,
    pub blocks: Arena<BasicBlock>,
    /// Blocks in layout (lexical) order; `layout[0]` is the entry.
    pub layout: Vec<BlockId>,
    pub has_stack_calls: bool,
    pub is_stack_call_func: bool,
    /// Highest lexical id after the last numbering pass.
    pub last_lex_id: u32,
}

impl Kernel {
    pub fn new(name: impl Into<String>) -> Self {
        Kernel {
            name: name.into(),
            decls: Arena::new(),
            insts: Arena::new(),
            blocks: Arena::new(),
            layout: Vec::new(),
            has_stack_calls: false,
            is_stack_call_func: false,
            last_lex_id: 0,
        }
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = self.blocks.alloc(BasicBlock::new());
        self.layout.push(id);
        id
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    pub fn new_decl(&mut self, decl: Declare) -> DeclId {
        self.decls.alloc(decl)
    }

    /// Declare a kernel input pre-loaded at `row`.
    pub fn new_input(&mut self, mut decl: Declare, row: u16) -> DeclId {
        decl.is_input = true;
        decl.reg_file = RegFile::Input;
        decl.pre_assigned = Some(PhysReg::row_aligned(row));
        self.decls.alloc(decl)
    }

    pub fn push_inst(&mut self, block: BlockId, inst: Instruction) -> InstId {
        let id = self.insts.alloc(inst);
        self.blocks[block].insts.push(id);
        id
    }

    pub fn entry(&self) -> BlockId {
        self.layout[0]
    }

    /// Renumber every instruction in layout order, starting at 1 so lexical
    /// id 0 is reserved for "live from kernel entry" (inputs). Returns the
    /// highest id assigned.
    pub fn assign_lexical_ids(&mut self) -> u32 {
        let mut next = 1u32;
        for &bid in &self.layout {
            for &iid in &self.blocks[bid].insts {
                self.insts[iid].lex_id = next;
                next += 1;
            }
        }
        self.last_lex_id = next.saturating_sub(1);
        self.last_lex_id
    }

    /// First and last lexical ids of a block, or `None` when empty.
    pub fn block_lex_range(&self, block: BlockId) -> Option<(u32, u32)> {
        let insts = &self.blocks[block].insts;
        let first = insts.first()?;
        let last = insts.last()?;
        Some((self.insts[*first].lex_id, self.insts[*last].lex_id))
    }

    /// Lexical end point of the whole kernel.
    pub fn end_point(&self) -> LexPoint {
        LexPoint::after(self.last_lex_id)
    }

    /// Back edges by layout position: an edge whose target does not come
    /// later in layout order closes a loop.
    pub fn back_edges(&self) -> Vec<(BlockId, BlockId)> {
        let mut pos = FxHashMap::default();
        for (i, &b) in self.layout.iter().enumerate() {
            pos.insert(b, i);
        }
        let mut edges = Vec::new();
        for &b in &self.layout {
            for &s in &self.blocks[b].succs {
                if pos[&s] <= pos[&b] {
                    edges.push((b, s));
                }
            }
        }
        edges
    }

    pub fn inst_count(&self) -> usize {
        self.insts.len()
    }

    /// Human-readable listing for allocator tracing. Not a stable format.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "kernel {}:", self.name);
        for (pos, &bid) in self.layout.iter().enumerate() {
            let bb = &self.blocks[bid];
            let _ = writeln!(
                out,
                "  BB{} (preds {:?}, succs {:?}, depth {}):",
                pos, bb.preds, bb.succs, bb.loop_depth
            );
            for &iid in &bb.insts {
                let inst = &self.insts[iid];
                let _ = writeln!(out, "    [{:>4}] {:?}", inst.lex_id, inst.op);
            }
        }
        out
    }
}

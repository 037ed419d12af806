//! Per-block liveness for GRF declares.
//!
//! Classic backward bitset dataflow: `live_out[b] = U live_in[succ]`,
//! `live_in[b] = gen[b] | (live_out[b] - kill[b])`. A def only kills when it
//! overwrites the whole declare unpredicated; partial defs leave the previous
//! value live through the instruction, which is also what forces
//! read-modify-write handling when such a def is spilled.

use crate::ir::arena::BitSet;
use crate::ir::cfg::{BlockId, Kernel};
use crate::ir::declare::RegFile;
use crate::ir::operand::Operand;

#[derive(Debug, Clone)]
pub struct Liveness {
    live_in: Vec<BitSet>,
    live_out: Vec<BitSet>,
}

impl Liveness {
    /// Declares the allocator tracks: GRF and input files only.
    fn selected(kernel: &Kernel, decl_idx: usize) -> bool {
        matches!(
            kernel.decls[crate::ir::DeclId::new(decl_idx as u32)].reg_file,
            RegFile::Grf | RegFile::Input
        )
    }

    pub fn compute(kernel: &Kernel) -> Liveness {
        let nblocks = kernel.blocks.len();
        let ndecls = kernel.decls.len();

        // Upward-exposed uses and complete defs per block, by reverse scan.
        let mut gen: Vec<BitSet> = (0..nblocks).map(|_| BitSet::with_capacity(ndecls)).collect();
        let mut kill: Vec<BitSet> = (0..nblocks).map(|_| BitSet::with_capacity(ndecls)).collect();

        for &bid in &kernel.layout {
            let b = bid.as_usize();
            for &iid in kernel.blocks[bid].insts.iter().rev() {
                let inst = &kernel.insts[iid];

                if let Some(Operand::Dst(d)) = &inst.dst {
                    if Self::selected(kernel, d.decl.as_usize()) {
                        let bytes = kernel.decls[d.decl].byte_size();
                        if inst.is_complete_def(bytes) {
                            kill[b].insert(d.decl.as_usize());
                            gen[b].remove(d.decl.as_usize());
                        } else {
                            // Partial def reads the surviving bytes.
                            gen[b].insert(d.decl.as_usize());
                        }
                    }
                }
                for src in &inst.srcs {
                    match src {
                        Operand::Src(s) => {
                            if Self::selected(kernel, s.decl.as_usize()) {
                                gen[b].insert(s.decl.as_usize());
                            }
                        }
                        Operand::Addr(a) => {
                            if Self::selected(kernel, a.target.as_usize()) {
                                gen[b].insert(a.target.as_usize());
                            }
                        }
                        Operand::Imm(_) | Operand::Indirect(_) => {}
                        Operand::Dst(_) => unreachable!("dst operand in src position"),
                    }
                }
            }
        }

        let mut live_in: Vec<BitSet> = (0..nblocks).map(|_| BitSet::with_capacity(ndecls)).collect();
        let mut live_out: Vec<BitSet> =
            (0..nblocks).map(|_| BitSet::with_capacity(ndecls)).collect();

        // Kernel outputs stay live to the end: seed exit-block live-outs.
        let mut outputs = BitSet::with_capacity(ndecls);
        for (id, decl) in kernel.decls.iter() {
            if decl.is_output && Self::selected(kernel, id.as_usize()) {
                outputs.insert(id.as_usize());
            }
        }
        for &bid in &kernel.layout {
            if kernel.blocks[bid].succs.is_empty() {
                live_out[bid.as_usize()].union_with(&outputs);
            }
        }

        // Iterate to a fixed point, backward over layout order.
        let mut changed = true;
        while changed {
            changed = false;
            for &bid in kernel.layout.iter().rev() {
                let b = bid.as_usize();
                let mut out = live_out[b].clone();
                for &succ in &kernel.blocks[bid].succs {
                    out.union_with(&live_in[succ.as_usize()]);
                }
                let mut inn = out.clone();
                inn.subtract(&kill[b]);
                inn.union_with(&gen[b]);

                if out != live_out[b] {
                    live_out[b] = out;
                    changed = true;
                }
                if inn != live_in[b] {
                    live_in[b] = inn;
                    changed = true;
                }
            }
        }

        Liveness { live_in, live_out }
    }

    pub fn live_in(&self, block: BlockId) -> &BitSet {
        &self.live_in[block.as_usize()]
    }

    pub fn live_out(&self, block: BlockId) -> &BitSet {
        &self.live_out[block.as_usize()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::declare::Declare;
    use crate::ir::inst::{Instruction, Opcode};
    use crate::ir::operand::{DstRegion, Operand, SrcRegion};
    use crate::ir::types::ElemType;

    #[test]
    fn value_live_across_block_boundary() {
        let mut k = Kernel::new("t");
        let b0 = k.new_block();
        let b1 = k.new_block();
        k.add_edge(b0, b1);

        let v = k.new_decl(Declare::new("v", ElemType::F, 8));
        let w = k.new_decl(Declare::new("w", ElemType::F, 8));

        // b0: v = ...
        k.push_inst(
            b0,
            Instruction::new(Opcode::Mov, 8).with_dst(DstRegion::whole(v, ElemType::F)),
        );
        // b1: w = v
        k.push_inst(
            b1,
            Instruction::new(Opcode::Mov, 8)
                .with_dst(DstRegion::whole(w, ElemType::F))
                .with_src(Operand::Src(SrcRegion::whole(v, ElemType::F))),
        );
        k.assign_lexical_ids();

        let lv = Liveness::compute(&k);
        assert!(lv.live_out(b0).contains(v.as_usize()));
        assert!(lv.live_in(b1).contains(v.as_usize()));
        assert!(!lv.live_out(b1).contains(v.as_usize()));
        assert!(!lv.live_in(b0).contains(v.as_usize()));
    }

    #[test]
    fn loop_keeps_value_live() {
        let mut k = Kernel::new("loop");
        let b0 = k.new_block();
        let b1 = k.new_block();
        let b2 = k.new_block();
        k.add_edge(b0, b1);
        k.add_edge(b1, b1);
        k.add_edge(b1, b2);

        let v = k.new_decl(Declare::new("v", ElemType::D, 8));
        let t = k.new_decl(Declare::new("t", ElemType::D, 8));

        k.push_inst(
            b0,
            Instruction::new(Opcode::Mov, 8).with_dst(DstRegion::whole(v, ElemType::D)),
        );
        // b1 reads v every trip.
        k.push_inst(
            b1,
            Instruction::new(Opcode::Add, 8)
                .with_dst(DstRegion::whole(t, ElemType::D))
                .with_src(Operand::Src(SrcRegion::whole(v, ElemType::D))),
        );
        k.assign_lexical_ids();

        let lv = Liveness::compute(&k);
        // v live around the loop, including the back edge.
        assert!(lv.live_in(b1).contains(v.as_usize()));
        assert!(lv.live_out(b1).contains(v.as_usize()));
        assert!(!lv.live_in(b2).contains(v.as_usize()));
    }

    #[test]
    fn output_live_to_exit() {
        let mut k = Kernel::new("out");
        let b0 = k.new_block();
        let mut d = Declare::new("o", ElemType::F, 8);
        d.is_output = true;
        let o = k.new_decl(d);
        k.push_inst(
            b0,
            Instruction::new(Opcode::Mov, 8).with_dst(DstRegion::whole(o, ElemType::F)),
        );
        k.assign_lexical_ids();

        let lv = Liveness::compute(&k);
        assert!(lv.live_out(b0).contains(o.as_usize()));
    }

    #[test]
    fn partial_def_does_not_kill() {
        let mut k = Kernel::new("partial");
        let b0 = k.new_block();
        let b1 = k.new_block();
        k.add_edge(b0, b1);

        let v = k.new_decl(Declare::new("v", ElemType::F, 16)); // 2 rows

        k.push_inst(
            b0,
            Instruction::new(Opcode::Mov, 16).with_dst(DstRegion::whole(v, ElemType::F)),
        );
        // b1 writes only the first 8 elements; the rest flows through.
        k.push_inst(
            b1,
            Instruction::new(Opcode::Mov, 8).with_dst(DstRegion::whole(v, ElemType::F)),
        );
        k.assign_lexical_ids();

        let lv = Liveness::compute(&k);
        assert!(lv.live_in(b1).contains(v.as_usize()));
    }
}

//! Instructions.
//!
//! Only the shapes the allocator cares about are modeled: ALU ops that read
//! and write GRF regions, sends (whose payload/response are multi-row units),
//! stack-call pseudo ops, and the spill store/fill sends this crate inserts.

use smallvec::SmallVec;

use super::arena::Id;
use super::declare::DeclId;
use super::operand::{DstRegion, Operand, SrcRegion};
use crate::spill::message::ScratchMsg;

pub type InstId = Id<Instruction>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Mov,
    Add,
    Mul,
    Mad,
    Cmp,
    Sel,
    Send,
    Call,
    Ret,
    /// Pseudo op marking the caller-save window around a stack call.
    PseudoCallerSave,
    /// Pseudo op marking the callee-save obligation of a stack-call function.
    PseudoCalleeSave,
    /// Scratch store inserted by the spill code generator.
    SpillStore,
    /// Scratch load inserted by the spill code generator.
    SpillFill,
}

impl Opcode {
    pub const fn is_send(self) -> bool {
        matches!(self, Opcode::Send | Opcode::SpillStore | Opcode::SpillFill)
    }

    /// 3-source instructions feed both src banks in one cycle and drive the
    /// bank-conflict bias.
    pub const fn is_three_source(self) -> bool {
        matches!(self, Opcode::Mad)
    }
}

/// Predication by a flag register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Predicate {
    pub flag: DeclId,
    pub inverted: bool,
}

/// Send message shape, as far as allocation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendDesc {
    /// Payload length in GRF rows (src0).
    pub payload_rows: u8,
    /// Response length in GRF rows (dst).
    pub response_rows: u8,
    /// End-of-thread send; its source must sit in the reserved top rows.
    pub is_eot: bool,
    /// Scratch-memory message, present on SpillStore/SpillFill.
    pub scratch: Option<ScratchMsg>,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Opcode,
    pub exec_size: u8,
    pub pred: Option<Predicate>,
    /// NoMask: executes on all lanes regardless of divergence.
    pub write_enable: bool,
    pub dst: Option<Operand>,
    pub srcs: SmallVec<[Operand; 3]>,
    pub msg: Option<SendDesc>,
    /// Lexical id, assigned per kernel in layout order.
    pub lex_id: u32,
}

impl Instruction {
    pub fn new(op: Opcode, exec_size: u8) -> Self {
        Instruction {
            op,
            exec_size,
            pred: None,
            write_enable: false,
            dst: None,
            srcs: SmallVec::new(),
            msg: None,
            lex_id: 0,
        }
    }

    pub fn with_dst(mut self, dst: DstRegion) -> Self {
        self.dst = Some(Operand::Dst(dst));
        self
    }

    pub fn with_src(mut self, src: Operand) -> Self {
        self.srcs.push(src);
        self
    }

    pub fn dst_region(&self) -> Option<&DstRegion> {
        self.dst.as_ref().and_then(Operand::as_dst)
    }

    /// GRF declare written by this instruction, if the dst is a direct region.
    pub fn dst_decl(&self) -> Option<DeclId> {
        self.dst_region().map(|d| d.decl)
    }

    /// Visit every GRF declare referenced by this instruction: the dst first
    /// (when direct), then sources in order, including address-of targets.
    pub fn for_each_grf_ref(&self, mut f: impl FnMut(DeclId, bool)) {
        if let Some(dst) = &self.dst {
            match dst {
                Operand::Dst(d) => f(d.decl, true),
                Operand::Indirect(_) => {}
                Operand::Src(_) | Operand::Imm(_) | Operand::Addr(_) => {
                    unreachable!("non-destination operand in dst position")
                }
            }
        }
        for src in &self.srcs {
            match src {
                Operand::Src(s) => f(s.decl, false),
                Operand::Addr(a) => f(a.target, false),
                Operand::Imm(_) | Operand::Indirect(_) => {}
                Operand::Dst(_) => unreachable!("destination operand in src position"),
            }
        }
    }

    /// Whether the write at `dst` covers the entire declare, unconditionally.
    /// Anything less leaves previously-written bytes live (read-modify-write
    /// territory for spills, and no liveness kill).
    pub fn is_complete_def(&self, decl_bytes: u32) -> bool {
        if self.pred.is_some() {
            return false;
        }
        match self.dst_region() {
            Some(d) => {
                d.row_off == 0
                    && d.word_off == 0
                    && d.hstride == 1
                    && d.byte_extent(self.effective_write_size()) >= decl_bytes
            }
            None => false,
        }
    }

    /// Elements written: sends write whole response rows, ALU ops write
    /// `exec_size` elements.
    fn effective_write_size(&self) -> u8 {
        self.exec_size
    }

    pub fn is_eot(&self) -> bool {
        self.msg.is_some_and(|m| m.is_eot)
    }

    /// Sources read by a send, as whole-payload units.
    pub fn send_payload_src(&self) -> Option<&SrcRegion> {
        if self.op.is_send() {
            self.srcs.first().and_then(Operand::as_src)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::operand::Immediate;
    use crate::ir::types::ElemType;

    fn decl(i: u32) -> DeclId {
        Id::new(i)
    }

    #[test]
    fn grf_refs_visits_dst_then_srcs() {
        let inst = Instruction::new(Opcode::Add, 8)
            .with_dst(DstRegion::whole(decl(0), ElemType::F))
            .with_src(Operand::Src(SrcRegion::whole(decl(1), ElemType::F)))
            .with_src(Operand::Imm(Immediate {
                bits: 1,
                ty: ElemType::F,
            }));

        let mut seen = Vec::new();
        inst.for_each_grf_ref(|d, is_def| seen.push((d.index(), is_def)));
        assert_eq!(seen, vec![(0, true), (1, false)]);
    }

    #[test]
    fn complete_def_requires_full_unpredicated_write() {
        let full = Instruction::new(Opcode::Mov, 8)
            .with_dst(DstRegion::whole(decl(0), ElemType::F));
        assert!(full.is_complete_def(32));
        assert!(!full.is_complete_def(64));

        let mut pred = full.clone();
        pred.pred = Some(Predicate {
            flag: decl(9),
            inverted: false,
        });
        assert!(!pred.is_complete_def(32));
    }

    #[test]
    fn send_shape() {
        let mut send = Instruction::new(Opcode::Send, 16);
        send.msg = Some(SendDesc {
            payload_rows: 4,
            response_rows: 0,
            is_eot: true,
            scratch: None,
        });
        assert!(send.is_eot());
        assert!(send.op.is_send());
    }
}

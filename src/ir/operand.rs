//! Instruction operands as a closed sum type.
//!
//! Each use site matches exhaustively over the five variants, so adding a
//! variant is a compile error everywhere an operand is inspected.

use super::declare::DeclId;
use super::types::ElemType;

/// Destination region: rooted at a declare, offset in rows and words, with a
/// horizontal stride between written elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstRegion {
    pub decl: DeclId,
    pub row_off: u16,
    /// Word offset within the starting row.
    pub word_off: u16,
    /// Stride between consecutive written elements, in elements.
    pub hstride: u8,
    pub ty: ElemType,
}

impl DstRegion {
    pub fn whole(decl: DeclId, ty: ElemType) -> Self {
        DstRegion {
            decl,
            row_off: 0,
            word_off: 0,
            hstride: 1,
            ty,
        }
    }

    /// Byte offset of the first written element from the declare base.
    pub fn byte_off(&self) -> u32 {
        self.row_off as u32 * crate::ir::types::ROW_BYTES + self.word_off as u32 * 2
    }

    /// Bytes covered by `exec_size` written elements.
    pub fn byte_extent(&self, exec_size: u8) -> u32 {
        if exec_size == 0 {
            return 0;
        }
        let elem = self.ty.size();
        ((exec_size as u32 - 1) * self.hstride as u32 + 1) * elem
    }
}

/// Source region with a `<vstride; width, hstride>` descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcRegion {
    pub decl: DeclId,
    pub row_off: u16,
    pub word_off: u16,
    pub vstride: u8,
    pub width: u8,
    pub hstride: u8,
    pub ty: ElemType,
}

impl SrcRegion {
    pub fn whole(decl: DeclId, ty: ElemType) -> Self {
        SrcRegion {
            decl,
            row_off: 0,
            word_off: 0,
            vstride: 1,
            width: 1,
            hstride: 1,
            ty,
        }
    }

    /// Scalar (broadcast) region.
    pub fn scalar(decl: DeclId, ty: ElemType) -> Self {
        SrcRegion {
            decl,
            row_off: 0,
            word_off: 0,
            vstride: 0,
            width: 1,
            hstride: 0,
            ty,
        }
    }

    pub fn byte_off(&self) -> u32 {
        self.row_off as u32 * crate::ir::types::ROW_BYTES + self.word_off as u32 * 2
    }

    /// Conservative byte extent read by `exec_size` elements.
    pub fn byte_extent(&self, exec_size: u8) -> u32 {
        if exec_size == 0 {
            return 0;
        }
        let elem = self.ty.size();
        if self.width == 0 || (self.vstride == 0 && self.hstride == 0) {
            return elem;
        }
        let rows = (exec_size as u32).div_ceil(self.width.max(1) as u32);
        let last_in_row = (self.width.max(1) as u32 - 1) * self.hstride as u32;
        ((rows - 1) * self.vstride as u32 + last_in_row + 1) * elem
    }
}

/// Immediate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Immediate {
    pub bits: i64,
    pub ty: ElemType,
}

/// Address-of expression: takes the address of a GRF declare into an address
/// register. The target declare becomes address-taken (unspillable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrExpr {
    /// The address register declare being written.
    pub addr_decl: DeclId,
    /// The GRF declare whose address is taken.
    pub target: DeclId,
    pub byte_off: u32,
}

/// Indirect region: access through an address register. The set of GRF
/// declares it may touch is unknown to the allocator, so indirect targets are
/// pinned via `address_taken`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectRegion {
    pub addr_decl: DeclId,
    pub ty: ElemType,
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Dst(DstRegion),
    Src(SrcRegion),
    Imm(Immediate),
    Addr(AddrExpr),
    Indirect(IndirectRegion),
}

impl Operand {
    /// The GRF declare this operand directly references, if any.
    pub fn grf_decl(&self) -> Option<DeclId> {
        match self {
            Operand::Dst(d) => Some(d.decl),
            Operand::Src(s) => Some(s.decl),
            Operand::Imm(_) => None,
            // The address-of target is a GRF reference (it pins the target);
            // the address register itself is not GRF-allocated.
            Operand::Addr(a) => Some(a.target),
            Operand::Indirect(_) => None,
        }
    }

    pub fn as_dst(&self) -> Option<&DstRegion> {
        match self {
            Operand::Dst(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_src(&self) -> Option<&SrcRegion> {
        match self {
            Operand::Src(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::arena::Id;

    #[test]
    fn dst_extent() {
        let d = DstRegion {
            decl: Id::new(0),
            row_off: 0,
            word_off: 0,
            hstride: 1,
            ty: ElemType::F,
        };
        assert_eq!(d.byte_extent(8), 32);

        let strided = DstRegion { hstride: 2, ..d };
        assert_eq!(strided.byte_extent(8), 60);
    }

    #[test]
    fn src_extent_scalar() {
        let s = SrcRegion::scalar(Id::new(0), ElemType::D);
        assert_eq!(s.byte_extent(16), 4);
    }

    #[test]
    fn src_extent_packed() {
        let s = SrcRegion {
            decl: Id::new(0),
            row_off: 0,
            word_off: 0,
            vstride: 8,
            width: 8,
            hstride: 1,
            ty: ElemType::F,
        };
        assert_eq!(s.byte_extent(16), 64);
    }
}

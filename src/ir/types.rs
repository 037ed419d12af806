//! Element types and GRF geometry.
//!
//! The GRF is addressed in rows; a row is `ROW_BYTES` bytes and the busy
//! bitmap tracks it at word (2-byte) granularity, matching the hardware's
//! subregister addressing.

/// Bytes per GRF row.
pub const ROW_BYTES: u32 = 32;

/// Words (2 bytes each) per GRF row.
pub const WORDS_PER_ROW: u32 = ROW_BYTES / 2;

/// Element data type of a declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElemType {
    Ub,
    B,
    Uw,
    W,
    Ud,
    D,
    Uq,
    Q,
    Hf,
    F,
    Df,
}

impl ElemType {
    /// Size of one element in bytes.
    pub const fn size(self) -> u32 {
        match self {
            ElemType::Ub | ElemType::B => 1,
            ElemType::Uw | ElemType::W | ElemType::Hf => 2,
            ElemType::Ud | ElemType::D | ElemType::F => 4,
            ElemType::Uq | ElemType::Q | ElemType::Df => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, ElemType::Hf | ElemType::F | ElemType::Df)
    }

    /// Integer type of the same width, used when spill copies must avoid
    /// float legalization.
    pub const fn to_int_of_same_width(self) -> ElemType {
        match self {
            ElemType::Hf => ElemType::Uw,
            ElemType::F => ElemType::Ud,
            ElemType::Df => ElemType::Uq,
            other => other,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElemType::Ub => "ub",
            ElemType::B => "b",
            ElemType::Uw => "uw",
            ElemType::W => "w",
            ElemType::Ud => "ud",
            ElemType::D => "d",
            ElemType::Uq => "uq",
            ElemType::Q => "q",
            ElemType::Hf => "hf",
            ElemType::F => "f",
            ElemType::Df => "df",
        }
    }
}

impl std::fmt::Display for ElemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Round `n` up to a multiple of `to` (`to` must be a power of two).
#[inline]
pub const fn round_up(n: u32, to: u32) -> u32 {
    (n + to - 1) & !(to - 1)
}

/// Rows needed for `bytes` bytes of storage.
#[inline]
pub const fn bytes_to_rows(bytes: u32) -> u32 {
    round_up(bytes, ROW_BYTES) / ROW_BYTES
}

// =============================================================================
// Lexical points
// =============================================================================

/// A position in the lexical instruction order.
///
/// Instruction ids are doubled so that "before" (even) and "after" (odd)
/// positions of the same instruction stay distinct; a def at instruction `n`
/// starts its interval at the odd point, a use ends it at the even one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LexPoint(u32);

impl LexPoint {
    #[inline]
    pub const fn before(inst_idx: u32) -> Self {
        LexPoint(inst_idx * 2)
    }

    #[inline]
    pub const fn after(inst_idx: u32) -> Self {
        LexPoint(inst_idx * 2 + 1)
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        LexPoint(raw)
    }

    #[inline]
    pub const fn inst_index(self) -> u32 {
        self.0 / 2
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for LexPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 % 2 == 0 {
            write!(f, "{}b", self.inst_index())
        } else {
            write!(f, "{}a", self.inst_index())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elem_sizes() {
        assert_eq!(ElemType::Ud.size(), 4);
        assert_eq!(ElemType::Df.size(), 8);
        assert_eq!(ElemType::F.to_int_of_same_width(), ElemType::Ud);
    }

    #[test]
    fn row_rounding() {
        assert_eq!(bytes_to_rows(1), 1);
        assert_eq!(bytes_to_rows(32), 1);
        assert_eq!(bytes_to_rows(33), 2);
        assert_eq!(round_up(33, 32), 64);
    }

    #[test]
    fn lex_point_ordering() {
        let b = LexPoint::before(4);
        let a = LexPoint::after(4);
        assert!(b < a);
        assert_eq!(b.inst_index(), 4);
        assert_eq!(a.inst_index(), 4);
        assert!(LexPoint::before(5) > a);
    }
}

//! Declares: program-level virtual registers.
//!
//! A declare is the allocator's unit of allocation. Its physical assignment
//! (row, subword) is recorded in place once allocation succeeds; a spilled
//! declare instead carries a byte displacement into the scratch region.

use super::arena::Id;
use super::types::{bytes_to_rows, ElemType, ROW_BYTES, WORDS_PER_ROW};

pub type DeclId = Id<Declare>;

/// Register file a declare lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegFile {
    /// General register file; the only file this allocator assigns.
    Grf,
    /// Address registers (indirect access bases). Not allocated here, but
    /// address expressions pin their GRF targets.
    Address,
    /// Flag registers (predicates).
    Flag,
    /// Kernel inputs, pre-loaded into fixed GRF rows before entry.
    Input,
}

/// Subregister / row alignment requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubAlign {
    /// Any word offset.
    #[default]
    Any,
    /// Even-word offset.
    Even,
    /// 4-word (quad) offset.
    Quad,
    /// Must start at a row boundary.
    Grf,
}

impl SubAlign {
    /// Alignment in words.
    pub const fn words(self) -> u32 {
        match self {
            SubAlign::Any => 1,
            SubAlign::Even => 2,
            SubAlign::Quad => 4,
            SubAlign::Grf => WORDS_PER_ROW,
        }
    }
}

/// A physical GRF location: row plus word offset within the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysReg {
    pub row: u16,
    pub sub_word: u16,
}

impl PhysReg {
    pub const fn row_aligned(row: u16) -> Self {
        PhysReg { row, sub_word: 0 }
    }
}

impl std::fmt::Display for PhysReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sub_word == 0 {
            write!(f, "r{}", self.row)
        } else {
            write!(f, "r{}.{}", self.row, self.sub_word)
        }
    }
}

/// A virtual register.
#[derive(Debug, Clone)]
pub struct Declare {
    pub name: String,
    pub elem_type: ElemType,
    pub num_elems: u32,
    pub reg_file: RegFile,
    pub sub_align: SubAlign,

    /// Kernel input: live from entry, pre-loaded into `pre_assigned` rows.
    pub is_input: bool,
    /// Kernel output: must survive to the end of the kernel.
    pub is_output: bool,
    /// Source of an EOT send; binds to the topmost reserved rows.
    pub is_eot: bool,
    /// Accessed through an address register; cannot be spilled.
    pub address_taken: bool,
    /// ABI or allocator-internal range that must never be spilled.
    pub do_not_spill: bool,
    /// Set once spill code has been generated for this declare.
    pub spilled: bool,

    /// ABI pre-assignment (stack-call FP/arg/ret, inputs). Pre-assigned
    /// declares bypass the free-register search and are never undone.
    pub pre_assigned: Option<PhysReg>,

    /// Physical assignment produced by the allocator. Cleared by undo.
    pub phys: Option<PhysReg>,

    /// Scratch displacement in bytes, set when the declare is spilled.
    pub spill_disp: Option<u32>,
}

impl Declare {
    pub fn new(name: impl Into<String>, elem_type: ElemType, num_elems: u32) -> Self {
        Declare {
            name: name.into(),
            elem_type,
            num_elems,
            reg_file: RegFile::Grf,
            sub_align: SubAlign::Any,
            is_input: false,
            is_output: false,
            is_eot: false,
            address_taken: false,
            do_not_spill: false,
            spilled: false,
            pre_assigned: None,
            phys: None,
            spill_disp: None,
        }
    }

    pub fn byte_size(&self) -> u32 {
        self.elem_type.size() * self.num_elems
    }

    pub fn size_in_words(&self) -> u32 {
        self.byte_size().div_ceil(2)
    }

    /// Rows this declare occupies, including a partial last row.
    pub fn num_rows(&self) -> u32 {
        bytes_to_rows(self.byte_size())
    }

    /// Words used in the last (possibly partial) row.
    pub fn last_row_words(&self) -> u32 {
        let rem = self.size_in_words() % WORDS_PER_ROW;
        if rem == 0 {
            WORDS_PER_ROW
        } else {
            rem
        }
    }

    /// Whether the declare occupies whole rows only.
    pub fn is_row_sized(&self) -> bool {
        self.byte_size() % ROW_BYTES == 0
    }

    /// Effective assignment: ABI pre-assignment wins over allocator output.
    pub fn assignment(&self) -> Option<PhysReg> {
        self.pre_assigned.or(self.phys)
    }
}

impl std::fmt::Display for Declare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}x{}", self.name, self.elem_type, self.num_elems)?;
        if let Some(p) = self.assignment() {
            write!(f, "@{p}")?;
        }
        if let Some(d) = self.spill_disp {
            write!(f, " spill[{d}]")?;
        }
        Ok(())
    }
}

//! IR substrate the allocator operates on: arena-allocated declares,
//! instructions and basic blocks, addressed by integer handles.

pub mod arena;
pub mod cfg;
pub mod declare;
pub mod inst;
pub mod operand;
pub mod types;

pub use arena::{Arena, BitSet, Id, SecondaryMap};
pub use cfg::{BasicBlock, BlockId, Kernel};
pub use declare::{DeclId, Declare, PhysReg, RegFile, SubAlign};
pub use inst::{InstId, Instruction, Opcode, Predicate, SendDesc};
pub use operand::{AddrExpr, DstRegion, Immediate, IndirectRegion, Operand, SrcRegion};
pub use types::{ElemType, LexPoint, ROW_BYTES, WORDS_PER_ROW};

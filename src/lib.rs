//! Linear-scan register allocation for a GPU shader backend.
//!
//! Maps virtual registers (declares) onto a fixed general register file of
//! 32-byte rows at word granularity. A cheap per-block local pass runs first;
//! whatever it cannot finish goes to a whole-kernel linear scan that evicts
//! the cheapest live ranges to scratch memory and retries, bounded by an
//! iteration cap. Spill code (scratch block or LSC messages) is inserted in
//! place, including read-modify-write preloads for partial writes.
//!
//! ```
//! use grf_lsra::{allocate, Kernel, Declare, ElemType, Platform, RaConfig};
//! use grf_lsra::ir::{Instruction, Opcode, DstRegion};
//!
//! let mut kernel = Kernel::new("example");
//! let block = kernel.new_block();
//! let v = kernel.new_decl(Declare::new("v", ElemType::F, 8));
//! kernel.push_inst(
//!     block,
//!     Instruction::new(Opcode::Mov, 8).with_dst(DstRegion::whole(v, ElemType::F)),
//! );
//!
//! let platform = Platform::default();
//! let stats = allocate(&mut kernel, &platform, RaConfig::default()).unwrap();
//! assert!(kernel.decls[v].phys.is_some());
//! assert!(stats.local_only);
//! ```

pub mod driver;
pub mod global;
pub mod ir;
pub mod liveness;
pub mod local;
pub mod platform;
pub mod pool;
pub mod spill;

pub use driver::{
    allocate, AllocObserver, AllocatorStats, NoopObserver, RaConfig, RaError, RaState,
    RegAllocPass,
};
pub use ir::{Declare, ElemType, Kernel, PhysReg};
pub use platform::{Platform, StackCallAbi};

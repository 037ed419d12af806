//! Spill handling: candidate selection during the global scan, scratch slot
//! layout, scratch message construction, and spill/fill code insertion.

pub mod candidate;
pub mod codegen;
pub mod layout;
pub mod message;

pub use candidate::{find_spill_candidate, SpillChoice};
pub use codegen::{SpillCodeGenerator, SpillStats};
pub use layout::SpillLayout;
pub use message::ScratchMsg;

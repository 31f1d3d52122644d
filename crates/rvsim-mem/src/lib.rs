//! Memory-domain runtime for the rvsim CPU model.
//!
//! A simulated hart never touches guest storage directly: every access goes
//! through a stack of *memory domains*. Each domain is an address space that
//! either owns backing storage, forwards to another domain through a static
//! window, forwards through ASID-validated virtual aliases, or hands the
//! access to a callback. Domains additionally carry a privilege map so that
//! protection units (PMP) can carve R/W/X out of an address range.
//!
//! The important invariant is that an access which cannot be satisfied does
//! not fault by itself: it returns a typed [`AccessError`] so the processor
//! loop can resolve the miss (translate, refine protection) and retry.

pub mod perms;
pub mod phys;
pub mod priv_map;
pub mod range_table;
pub mod space;

pub use perms::{MemPriv, ProtectOp};
pub use phys::{BusFault, DenseMemory, Endian, PhysMemory, SparseMemory};
pub use priv_map::PrivMap;
pub use range_table::{RangeHandle, RangeTable};
pub use space::{AccessError, AccessHandler, DomainId, MemorySpace, VmAlias};

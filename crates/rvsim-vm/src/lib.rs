//! RISC-V virtual-memory subsystem for the rvsim CPU model.
//!
//! This crate implements the address-translation path of a simulated hart:
//! - Sv32/Sv39/Sv48 page-table walking, plus the x4 widened variants used
//!   for hypervisor stage-2 translation
//! - one software TLB per translation regime (HS, VS stage 1, VS stage 2)
//!   with simulated-ASID keying so cached host mappings can be validated
//!   without re-walking
//! - two-stage composition of guest-virtual → guest-physical → supervisor
//!   physical mappings
//! - the PMP register bank and its refinement of physical accesses
//! - construction of the per-privilege-mode domain stack
//!   (PMA → PMP → Physical, plus Virtual) over `rvsim-mem`
//! - save/restore of TLB contents
//!
//! The surrounding processor owns the architectural registers; it mirrors
//! the fields this subsystem consumes into [`CsrView`] and drives the
//! public entry points on [`Vm`].

pub mod bits;
pub mod config;
pub mod csr;
pub mod domains;
pub mod exception;
pub mod ext;
pub mod mode;
pub mod pmp;
pub mod snapshot;
pub mod tlb;
pub mod translate;
pub mod vm;
pub mod walk;

pub use bits::{PmpMode, SimAsid};
pub use config::{PrivVersion, VmConfig};
pub use csr::CsrView;
pub use exception::{AccessAttrs, AccessFaultCause, ExceptionKind, MemoryException};
pub use ext::{NullExtension, PmaCheck};
pub use mode::{BaseMode, Mode5, VmMode};
pub use snapshot::SnapshotError;
pub use tlb::{TlbEntry, TlbId};
pub use translate::MissOutcome;
pub use vm::Vm;

pub use rvsim_mem::{
    AccessError, AccessHandler, DenseMemory, DomainId, Endian, MemPriv, MemorySpace, PhysMemory,
    SparseMemory,
};

/// Base page geometry shared by every translation mode.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

#[cfg(test)]
mod tests;

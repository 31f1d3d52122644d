//! Memory exceptions raised by translation and protection.

use rvsim_mem::MemPriv;
use thiserror::Error;

/// Architectural exception causes this subsystem can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExceptionKind {
    #[error("instruction access fault")]
    InstructionAccessFault,
    #[error("load access fault")]
    LoadAccessFault,
    #[error("store/AMO access fault")]
    StoreAmoAccessFault,
    #[error("instruction page fault")]
    InstructionPageFault,
    #[error("load page fault")]
    LoadPageFault,
    #[error("store/AMO page fault")]
    StoreAmoPageFault,
    #[error("instruction guest-page fault")]
    InstructionGuestPageFault,
    #[error("load guest-page fault")]
    LoadGuestPageFault,
    #[error("store/AMO guest-page fault")]
    StoreAmoGuestPageFault,
}

impl ExceptionKind {
    /// Access fault matching the privilege of the original access. Used for
    /// page-table bus errors and PMP/PMA denials.
    pub fn access_fault(required: MemPriv) -> ExceptionKind {
        if required.contains(MemPriv::X) {
            ExceptionKind::InstructionAccessFault
        } else if required.contains(MemPriv::W) {
            ExceptionKind::StoreAmoAccessFault
        } else {
            ExceptionKind::LoadAccessFault
        }
    }

    /// Page fault (guest variant when `stage2`) matching the privilege of
    /// the original access.
    pub fn page_fault(required: MemPriv, stage2: bool) -> ExceptionKind {
        if required.contains(MemPriv::W) {
            if stage2 {
                ExceptionKind::StoreAmoGuestPageFault
            } else {
                ExceptionKind::StoreAmoPageFault
            }
        } else if required.contains(MemPriv::X) {
            if stage2 {
                ExceptionKind::InstructionGuestPageFault
            } else {
                ExceptionKind::InstructionPageFault
            }
        } else if stage2 {
            ExceptionKind::LoadGuestPageFault
        } else {
            ExceptionKind::LoadPageFault
        }
    }
}

/// A raised memory exception, carrying everything the trap path needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} at {tval:#x}")]
pub struct MemoryException {
    pub kind: ExceptionKind,
    /// Faulting address reported to the guest (`xtval`). For a failure
    /// during a nested stage-2 walk this is the original stage-1 VA.
    pub tval: u64,
    /// Whether `tval` is a guest virtual address.
    pub gva: bool,
    /// Faulting guest physical address for guest-page faults, 0 otherwise.
    pub gpa: u64,
}

/// Subtype of an armed access fault, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessFaultCause {
    #[default]
    Bus,
    Pmp,
    Pma,
}

/// Attributes of the access that triggered a translation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessAttrs {
    /// Non-architectural probe (debugger read, pseudo-register walk).
    /// Artifact walks observe guest state but never mutate it, and the
    /// entries they create are reaped on the next lookup.
    pub artifact: bool,
}

impl AccessAttrs {
    pub const ARCH: AccessAttrs = AccessAttrs { artifact: false };
    pub const ARTIFACT: AccessAttrs = AccessAttrs { artifact: true };
}

//! Page-table walking for Sv32/Sv39/Sv48 and the x4 stage-2 variants.
//!
//! All modes share one walk routine parameterized by VPN width, level count
//! and entry width. Table reads and write-backs go through the
//! supervisor-mode PMP domain so that PMP/PMA refinement applies to walk
//! traffic like any other access.

use rvsim_mem::{AccessError, DomainId, Endian, MemPriv, MemorySpace, PhysMemory};
use tracing::{debug, warn};

use crate::bits::{leaf_size, va_sign_extends, vpn_slice, Pte};
use crate::csr::VaMode;
use crate::exception::AccessAttrs;
use crate::mode::Mode5;
use crate::tlb::{TlbEntry, TlbId};
use crate::vm::Vm;
use crate::{PAGE_MASK, PAGE_SHIFT};

/// Geometry of one translation mode.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WalkMode {
    pub vpn_bits: u32,
    pub levels: u32,
    pub entry_bytes: u32,
    pub va_bits: u32,
}

pub(crate) const SV32: WalkMode = WalkMode {
    vpn_bits: 10,
    levels: 2,
    entry_bytes: 4,
    va_bits: 32,
};

pub(crate) const SV39: WalkMode = WalkMode {
    vpn_bits: 9,
    levels: 3,
    entry_bytes: 8,
    va_bits: 39,
};

pub(crate) const SV48: WalkMode = WalkMode {
    vpn_bits: 9,
    levels: 4,
    entry_bytes: 8,
    va_bits: 48,
};

impl WalkMode {
    fn of(mode: VaMode) -> &'static WalkMode {
        match mode {
            VaMode::Sv32 => &SV32,
            VaMode::Sv39 => &SV39,
            VaMode::Sv48 => &SV48,
        }
    }
}

/// Walk failures, classified for exception mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PteError {
    /// VA high bits do not sign-extend the VPN.
    VaExtend,
    /// Page-table entry load failed.
    Read,
    /// Page-table entry store failed.
    Write,
    /// Entry has V=0.
    V0,
    /// Reserved R=0,W=1 encoding.
    R0W1,
    /// Walk ran out of levels without finding a leaf.
    Leaf,
    /// Misaligned superpage.
    Align,
    /// Entry does not allow the access.
    Priv,
    /// A=0 and hardware A-updates are disabled.
    A0,
    /// D=0 on a write and hardware D-updates are disabled.
    D0,
}

impl PteError {
    /// READ/WRITE are bus errors reported as access faults on the original
    /// access; everything else is a page fault.
    pub(crate) fn is_access_fault(self) -> bool {
        matches!(self, PteError::Read | PteError::Write)
    }

    /// Errors that indicate normal OS behavior log at debug level only.
    fn is_warning(self) -> bool {
        !matches!(self, PteError::V0 | PteError::Priv | PteError::A0 | PteError::D0)
    }

    fn describe(self) -> &'static str {
        match self {
            PteError::VaExtend => "VA has invalid extension",
            PteError::Read => "load failed",
            PteError::Write => "store failed",
            PteError::V0 => "V=0",
            PteError::R0W1 => "R=0 and W=1",
            PteError::Leaf => "must be leaf level",
            PteError::Align => "is a misaligned superpage",
            PteError::Priv => "does not allow access",
            PteError::A0 => "A=0",
            PteError::D0 => "D=0",
        }
    }
}

fn access_char(required: MemPriv) -> char {
    if required.contains(MemPriv::X) {
        'X'
    } else if required.contains(MemPriv::W) {
        'W'
    } else {
        'R'
    }
}

impl Vm {
    /// Walk the active regime's page table for `entry.low_va`, filling
    /// `entry` on success.
    pub(crate) fn walk_stage<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: Mode5,
        entry: &mut TlbEntry,
        required: MemPriv,
        artifact: bool,
    ) -> Result<(), PteError> {
        if self.active_tlb != TlbId::Vs2 {
            let virt = self.active_tlb == TlbId::Vs1;
            let va_mode = self
                .csr
                .stage1_va_mode(virt)
                .expect("stage-1 walk without an enabled translation mode");
            let ppn = if virt {
                self.csr.vsatp_ppn()
            } else {
                self.csr.satp_ppn()
            };
            let wm = WalkMode::of(va_mode);
            self.walk_table(space, mode, entry, required, artifact, wm, ppn << PAGE_SHIFT)
        } else {
            let gpa = entry.low_va;
            let result = self.walk_stage2(space, mode, entry, required, artifact);
            if result.is_err() {
                // Record the failing guest physical address for exception
                // reporting.
                self.pending_gpa = gpa;
            }
            result
        }
    }

    /// x4 widened stage-2 walk: the bits above the stage-1 address width
    /// select a 4 KiB slice of the widened root table.
    fn walk_stage2<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: Mode5,
        entry: &mut TlbEntry,
        required: MemPriv,
        artifact: bool,
    ) -> Result<(), PteError> {
        let va_mode = self
            .csr
            .stage2_va_mode()
            .expect("stage-2 walk without an enabled translation mode");
        let wm = WalkMode::of(va_mode);

        let gpa = entry.low_va;
        let extra = gpa >> wm.va_bits;
        if extra > 3 {
            return Err(self.walk_error(PteError::VaExtend, gpa, 0, required));
        }
        let shift = extra << wm.va_bits;
        entry.low_va = gpa - shift;

        let root = (self.csr.hgatp_ppn() << PAGE_SHIFT) + extra * 4096;
        let walked = self.walk_table(space, mode, entry, required, artifact, wm, root);
        if walked.is_ok() {
            entry.low_va += shift;
            entry.high_va += shift;
        }
        walked
    }

    /// The shared multi-level walk.
    fn walk_table<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: Mode5,
        entry: &mut TlbEntry,
        required: MemPriv,
        artifact: bool,
        wm: &WalkMode,
        root: u64,
    ) -> Result<(), PteError> {
        let mut va = entry.low_va;
        if wm.entry_bytes == 4 {
            // Sv32 has no high bits to validate.
            va &= 0xffff_ffff;
        } else if !va_sign_extends(va, wm.va_bits) {
            return Err(self.walk_error(PteError::VaExtend, va, 0, required));
        }

        // Page-offset bits are irrelevant for entry creation.
        va &= !PAGE_MASK;

        let mut level = wm.levels as i32 - 1;
        let mut table = root;
        let mut pte;
        let mut pte_addr;
        loop {
            pte_addr = table + vpn_slice(va, level as u32, wm.vpn_bits) * wm.entry_bytes as u64;
            let raw = self
                .read_pte(space, mode, pte_addr, wm.entry_bytes, artifact)
                .map_err(|e| self.walk_error(e, va, pte_addr, required))?;
            pte = Pte(raw);

            if !pte.valid() {
                return Err(self.walk_error(PteError::V0, va, pte_addr, required));
            }
            if pte.reserved_rw() {
                return Err(self.walk_error(PteError::R0W1, va, pte_addr, required));
            }
            if pte.leaf() {
                break;
            }

            table = pte.ppn() << PAGE_SHIFT;
            level -= 1;
            if level < 0 {
                return Err(self.walk_error(PteError::Leaf, va, pte_addr, required));
            }
        }

        let size = leaf_size(level as u32, wm.vpn_bits);
        let pa = pte.ppn() << PAGE_SHIFT;
        if pa & (size - 1) != 0 {
            return Err(self.walk_error(PteError::Align, va, pte_addr, required));
        }

        entry.low_va = va & size.wrapping_neg();
        entry.high_va = entry.low_va + size - 1;
        entry.pa = pa;
        entry.tlb = self.active_tlb;
        entry.perms = pte.perms();
        entry.user = pte.user();
        entry.global = self.entry_global(pte.global());
        entry.accessed = pte.accessed();
        entry.dirty = pte.dirty();

        if self.check_entry_permission(mode, entry, required).is_empty() {
            return Err(self.walk_error(PteError::Priv, va, pte_addr, required));
        }

        // A/D update, subject to hardware-update support.
        let mut do_write = false;
        if entry.accessed {
            // Already set.
        } else if !self.cfg.update_pte_a {
            return Err(self.walk_error(PteError::A0, va, pte_addr, required));
        } else {
            entry.accessed = true;
            pte.set_accessed();
            do_write = true;
        }

        if entry.dirty || !required.contains(MemPriv::W) {
            // Already set, or not a write.
        } else if !self.cfg.update_pte_d {
            return Err(self.walk_error(PteError::D0, va, pte_addr, required));
        } else {
            entry.dirty = true;
            pte.set_dirty();
            do_write = true;
        }

        if do_write {
            self.write_pte(space, mode, pte_addr, wm.entry_bytes, pte.0, artifact)
                .map_err(|e| self.walk_error(e, va, pte_addr, required))?;
        }

        Ok(())
    }

    /// Report a walk failure at the appropriate severity and pass it on.
    fn walk_error(&self, err: PteError, va: u64, pte_addr: u64, required: MemPriv) -> PteError {
        if err.is_warning() {
            warn!(
                target: "rvsim::ptw",
                "page table entry {} [VA={:#x} PTE address={:#x} access={}]",
                err.describe(),
                va,
                pte_addr,
                access_char(required)
            );
        } else {
            debug!(
                target: "rvsim::ptw",
                "page table entry {} [VA={:#x} PTE address={:#x} access={}]",
                err.describe(),
                va,
                pte_addr,
                access_char(required)
            );
        }
        err
    }

    fn ptw_endian(&self, mode: Mode5) -> Endian {
        let smode = if mode.is_virtual() {
            Mode5::VirtSupervisor
        } else {
            Mode5::Supervisor
        };
        self.csr.data_endian(smode)
    }

    fn domain_read<B: PhysMemory>(
        &self,
        space: &mut MemorySpace<B>,
        domain: DomainId,
        addr: u64,
        bytes: u32,
        endian: Endian,
    ) -> Result<u64, AccessError> {
        if bytes == 4 {
            space.read_u32(domain, addr, endian, MemPriv::R).map(u64::from)
        } else {
            space.read_u64(domain, addr, endian, MemPriv::R)
        }
    }

    fn domain_write<B: PhysMemory>(
        &self,
        space: &mut MemorySpace<B>,
        domain: DomainId,
        addr: u64,
        bytes: u32,
        value: u64,
        endian: Endian,
    ) -> Result<(), AccessError> {
        if bytes == 4 {
            space.write_u32(domain, addr, value as u32, endian, MemPriv::W)
        } else {
            space.write_u64(domain, addr, value, endian, MemPriv::W)
        }
    }

    /// Read one page-table entry through the PTW domain.
    ///
    /// A protection miss on the PMP domain is resolved by the ordinary miss
    /// path (PMP/PMA refinement) and retried once.
    fn read_pte<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: Mode5,
        addr: u64,
        bytes: u32,
        artifact: bool,
    ) -> Result<u64, PteError> {
        let Some(domain) = self.ptw_domain() else {
            return Err(PteError::Read);
        };
        let endian = self.ptw_endian(mode);

        self.ptw_active = true;
        let mut result = self.domain_read(space, domain, addr, bytes, endian);
        if matches!(result, Err(AccessError::Denied { .. })) {
            let attrs = AccessAttrs { artifact };
            if self
                .miss(space, domain, MemPriv::R, addr, bytes as u64, attrs)
                .is_ok()
            {
                result = self.domain_read(space, domain, addr, bytes, endian);
            }
        }
        self.ptw_active = false;

        result.map_err(|_| PteError::Read)
    }

    /// Write back a modified page-table entry.
    ///
    /// Artifact walks observe but never mutate guest memory.
    fn write_pte<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: Mode5,
        addr: u64,
        bytes: u32,
        value: u64,
        artifact: bool,
    ) -> Result<(), PteError> {
        if artifact {
            return Ok(());
        }
        let Some(domain) = self.ptw_domain() else {
            return Err(PteError::Write);
        };
        let endian = self.ptw_endian(mode);

        self.ptw_active = true;
        let mut result = self.domain_write(space, domain, addr, bytes, value, endian);
        if matches!(result, Err(AccessError::Denied { .. })) {
            let attrs = AccessAttrs { artifact };
            if self
                .miss(space, domain, MemPriv::W, addr, bytes as u64, attrs)
                .is_ok()
            {
                result = self.domain_write(space, domain, addr, bytes, value, endian);
            }
        }
        self.ptw_active = false;

        result.map_err(|_| PteError::Write)
    }
}

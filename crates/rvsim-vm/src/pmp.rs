//! Physical memory protection: register bank, region geometry and
//! per-access privilege refinement.
//!
//! Regions are prioritized lowest-index-first. Register writes invalidate
//! the affected region under both its old and new geometry so that stale
//! grants never survive in the protection maps. Machine-mode access is
//! clamped only where a locked region (or a lower-priority locked region)
//! is involved.

use rvsim_mem::{DomainId, MemPriv, MemorySpace, PhysMemory, ProtectOp};
use tracing::debug;

use crate::bits::{PmpCfg, PmpMode, PMPCFG_WRITE_MASK};
use crate::config::address_mask;
use crate::exception::{AccessAttrs, AccessFaultCause};
use crate::mode::{BaseMode, Mode5};
use crate::vm::Vm;

impl Vm {
    #[inline]
    fn num_pmp(&self) -> u32 {
        self.cfg.pmp_registers
    }

    #[inline]
    fn pmp_cfg_elem(&self, index: u32) -> PmpCfg {
        PmpCfg(self.pmp_cfg[index as usize])
    }

    /// Lock check for CSR writes; artifact (debugger) writes bypass locks.
    fn pmp_locked(&self, index: u32, artifact: bool) -> bool {
        !artifact && self.pmp_cfg_elem(index).locked()
    }

    fn pmp_locked_tor(&self, index: u32, artifact: bool) -> bool {
        index < self.num_pmp()
            && self.pmp_cfg_elem(index).mode() == PmpMode::Tor
            && self.pmp_locked(index, artifact)
    }

    /// Address-register value as read back, with grain-dependent masking.
    fn effective_pmp_addr(&self, index: u32) -> u64 {
        let e = self.pmp_cfg_elem(index);
        let g = self.cfg.pmp_grain;
        let mut value = self.pmp_addr[index as usize];

        if g >= 2 && e.mode() == PmpMode::Napot {
            // Bits [G-2:0] read as ones.
            value |= (1u64 << (g - 1)) - 1;
        } else if g >= 1 && e.mode() != PmpMode::Napot {
            // Bits [G-1:0] read as zeros.
            value &= u64::MAX << g;
        }

        value
    }

    fn pmp_region_active(&self, e: PmpCfg, index: u32) -> bool {
        match e.mode() {
            PmpMode::Off => false,
            PmpMode::Tor => self.effective_pmp_addr(index) != 0,
            _ => true,
        }
    }

    /// Inclusive physical bounds of region `index` under its current
    /// configuration. TOR regions may come back inverted (`low > high`);
    /// such regions are inert.
    fn pmp_entry_bounds(&self, index: u32) -> (u64, u64) {
        let e = self.pmp_cfg_elem(index);
        let low = self.effective_pmp_addr(index) << 2;

        match e.mode() {
            PmpMode::Na4 => (low, low + 3),
            PmpMode::Napot => {
                let not_low = !(low + 3);
                let mask = ((not_low & not_low.wrapping_neg()) << 1).wrapping_sub(1);
                (low & !mask, (low & !mask) | mask)
            }
            _ => {
                let high = low.wrapping_sub(1);
                let mut lo = if index > 0 {
                    self.pmp_addr[index as usize - 1] << 2
                } else {
                    0
                };
                lo &= 0u64.wrapping_sub(4) << self.cfg.pmp_grain;
                (lo, high)
            }
        }
    }

    fn lower_priority_pmp_locked(&self, index: u32) -> bool {
        (index + 1..self.num_pmp()).any(|i| {
            let e = self.pmp_cfg_elem(i);
            e.locked() && e.mode() != PmpMode::Off
        })
    }

    /// Apply `perms` to `[low, high]` of one PMP domain, guarding the
    /// adjacent bytes so straddling accesses are caught.
    fn pmp_protect<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        domain: DomainId,
        low: u64,
        high: u64,
        perms: MemPriv,
        update_priv: bool,
    ) {
        let unaligned = self.cfg.unaligned;

        if update_priv {
            space.protect_memory(domain, low, high, perms, ProtectOp::Set);
        }

        // Accesses can straddle the region boundary when unaligned
        // accesses are allowed or when registers are wider than 32 bits.
        let can_straddle = unaligned || self.cfg.flen > 32 || self.cfg.xlen > 32;
        if (!perms.is_empty() || !update_priv) && can_straddle {
            let hi_max = address_mask(self.ext_bits);
            if low > 0 && (unaligned || low & 4 != 0) {
                space.protect_memory(domain, low - 1, low - 1, MemPriv::empty(), ProtectOp::Set);
            }
            if high < hi_max && (unaligned || (high + 1) & 4 != 0) {
                space.protect_memory(domain, high + 1, high + 1, MemPriv::empty(), ProtectOp::Set);
            }
        }
    }

    /// Apply `perms` to `[low, high]` of the PMP domains of `mode`; with
    /// `update_priv` false only the boundary guards are refreshed.
    fn set_pmp_priv<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: BaseMode,
        low: u64,
        high: u64,
        perms: MemPriv,
        update_priv: bool,
    ) {
        let data = self.pmp_domain(mode, false);
        let code = self.pmp_domain(mode, true);

        if update_priv && self.cfg.debug_mmu {
            debug!(
                target: "rvsim::pmp",
                "PMP priv={} {:#018x}:{:#018x} (mode {})",
                perms.name(),
                low,
                high,
                mode.name()
            );
        }

        let (Some(data), Some(code)) = (data, code) else {
            return;
        };

        if data == code {
            self.pmp_protect(space, data, low, high, perms, update_priv);
        } else {
            let perms_rw = perms & MemPriv::RW;
            let perms_x = perms & MemPriv::X;

            if !update_priv || perms.is_empty() || !perms_rw.is_empty() {
                self.pmp_protect(space, data, low, high, perms_rw, update_priv);
            }
            if !update_priv || perms.is_empty() || !perms_x.is_empty() {
                self.pmp_protect(space, code, low, high, perms_x, update_priv);
            }
        }
    }

    /// Withdraw the grants a region may have contributed, under its
    /// current geometry.
    ///
    /// Supervisor access is always removed. Machine access is removed only
    /// when the region is locked or a lower-priority locked region exists,
    /// because the change could reveal or conceal that region.
    fn invalidate_pmp_entry<B: PhysMemory>(&mut self, space: &mut MemorySpace<B>, index: u32) {
        let e = self.pmp_cfg_elem(index);
        if !self.pmp_region_active(e, index) {
            return;
        }
        let (low, high) = self.pmp_entry_bounds(index);
        if low > high {
            return;
        }

        self.set_pmp_priv(space, BaseMode::Supervisor, low, high, MemPriv::empty(), true);

        let update_m = e.locked() || self.lower_priority_pmp_locked(index);
        self.set_pmp_priv(space, BaseMode::Machine, low, high, MemPriv::empty(), update_m);
    }

    /// Narrow `[low_map, high_map]` and refine `perms` by region `index`
    /// for an access at `pa`.
    fn refine_pmp_region(
        &self,
        mode: Mode5,
        low_map: &mut u64,
        high_map: &mut u64,
        pa: u64,
        index: u32,
        perms: &mut MemPriv,
    ) {
        let e = self.pmp_cfg_elem(index);
        if !self.pmp_region_active(e, index) {
            return;
        }
        let (low, high) = self.pmp_entry_bounds(index);
        if low > high {
            return;
        }

        if low <= pa && pa <= high {
            *low_map = low;
            *high_map = high;
            *perms = if mode.base() != BaseMode::Machine || e.locked() {
                e.perms()
            } else {
                MemPriv::RWX
            };
        } else if low > pa && low < *high_map {
            // Clamp away the part of the window above the access.
            *high_map = low - 1;
        } else if high < pa && high > *low_map {
            // Clamp away the part of the window below the access.
            *low_map = high + 1;
        }
    }

    /// Refine the PMP privilege of `[low_pa, high_pa]` for `mode` and, if
    /// the access is permitted, grant the resulting window in the PMP
    /// domains. Otherwise arm a PMP access fault.
    pub(crate) fn map_pmp<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: Mode5,
        required: MemPriv,
        low_pa: u64,
        high_pa: u64,
    ) {
        let num = self.num_pmp();
        if num == 0 {
            return;
        }

        let mut perms = if mode.base() == BaseMode::Machine {
            MemPriv::RWX
        } else {
            MemPriv::empty()
        };
        let mut low_map = 0u64;
        let mut high_map = address_mask(self.ext_bits);

        // Lowest priority first, so higher-priority regions override.
        for index in (0..num).rev() {
            self.refine_pmp_region(mode, &mut low_map, &mut high_map, low_pa, index, &mut perms);
        }

        if !perms.contains(required.rwx()) || high_map < high_pa {
            self.af_cause = AccessFaultCause::Pmp;
        } else {
            self.set_pmp_priv(space, mode.base(), low_map, high_map, perms, true);
        }
    }

    /// Run the registered PMA hooks over `[low_pa, high_pa]`; a veto arms
    /// a PMA access fault.
    pub(crate) fn map_pma(&mut self, mode: Mode5, required: MemPriv, low_pa: u64, high_pa: u64) {
        let mut ok = true;
        for hook in &mut self.pma_hooks {
            ok &= hook.pma_check(mode, required, low_pa, high_pa);
        }
        if !ok {
            self.af_cause = AccessFaultCause::Pma;
        }
    }

    // ------------------------------------------------------------------
    // CSR interface
    // ------------------------------------------------------------------

    #[inline]
    fn pmpcfg_entries_per_reg(&self) -> u32 {
        if self.csr.xlen64 {
            8
        } else {
            4
        }
    }

    /// With XLEN=64 only even pmpcfg registers exist; they fold onto the
    /// same bank offsets.
    #[inline]
    fn pmp_cfg_offset(&self, index: u32) -> u32 {
        if self.csr.xlen64 {
            index / 2
        } else {
            index
        }
    }

    fn valid_pmpcfg(&self, index: u32) -> bool {
        let per = self.pmpcfg_entries_per_reg();
        let num_cfg = self.num_pmp().div_ceil(per);
        self.pmp_cfg_offset(index) < num_cfg
    }

    fn read_pmpcfg_int(&self, index: u32) -> u64 {
        let per = self.pmpcfg_entries_per_reg();
        let base = (self.pmp_cfg_offset(index) * per) as usize;
        let mut value = 0u64;
        for i in 0..per as usize {
            if let Some(&byte) = self.pmp_cfg.get(base + i) {
                value |= (byte as u64) << (i * 8);
            }
        }
        value
    }

    #[inline]
    fn valid_pmpaddr(&self, index: u32) -> bool {
        index < self.num_pmp()
    }

    /// Read the indexed PMP configuration register.
    pub fn read_pmpcfg(&self, index: u32) -> u64 {
        if self.valid_pmpcfg(index) {
            self.read_pmpcfg_int(index)
        } else {
            0
        }
    }

    /// Write the indexed PMP configuration register; returns the new
    /// effective value.
    ///
    /// Bytes are processed highest-index-first so that the
    /// lower-priority-locked scan always sees settled state. Locked bytes
    /// are left unchanged, and NA4 is unselectable when the grain is at
    /// least 1.
    pub fn write_pmpcfg<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        index: u32,
        value: u64,
        attrs: AccessAttrs,
    ) -> u64 {
        if !self.valid_pmpcfg(index) {
            return 0;
        }

        let per = self.pmpcfg_entries_per_reg();
        let offset = self.pmp_cfg_offset(index);
        let num = self.num_pmp();
        let num_bytes = num - offset * per;
        let byte_mask: u64 = if num_bytes >= 8 {
            u64::MAX
        } else {
            (1u64 << (num_bytes * 8)) - 1
        };
        let src = value & u64::from_le_bytes([PMPCFG_WRITE_MASK; 8]) & byte_mask;

        for i in (0..per).rev() {
            let cfg_index = index * 4 + i;
            if cfg_index >= num {
                continue;
            }

            let old = self.pmp_cfg_elem(cfg_index);
            let mut new = PmpCfg(((src >> (i * 8)) & 0xff) as u8);

            if self.cfg.pmp_grain >= 1 && new.mode() == PmpMode::Na4 {
                new = new.with_mode(old.mode());
            }

            if new.0 != old.0 && !self.pmp_locked(cfg_index, attrs.artifact) {
                // Invalidate under the old geometry, switch, then
                // invalidate under the new one.
                self.invalidate_pmp_entry(space, cfg_index);
                self.pmp_cfg[cfg_index as usize] = new.0;
                self.invalidate_pmp_entry(space, cfg_index);
            }
        }

        self.read_pmpcfg_int(index)
    }

    /// Read the indexed PMP address register (grain-canonicalized).
    pub fn read_pmpaddr(&self, index: u32) -> u64 {
        if self.valid_pmpaddr(index) {
            self.effective_pmp_addr(index)
        } else {
            0
        }
    }

    /// Write the indexed PMP address register; returns the new effective
    /// value (0 when the write changed nothing).
    ///
    /// Rejected when the entry is locked or the next entry is a locked TOR
    /// region.
    pub fn write_pmpaddr<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        index: u32,
        value: u64,
        attrs: AccessAttrs,
    ) -> u64 {
        let g = self.cfg.pmp_grain;

        let mut new = value & (address_mask(self.ext_bits) >> 2);
        if g >= 1 {
            new &= u64::MAX << (g - 1);
        }

        let mut result = 0;
        if self.valid_pmpaddr(index) && self.pmp_addr[index as usize] != new {
            if self.pmp_locked(index, attrs.artifact) {
                // Entry is locked.
            } else if self.pmp_locked_tor(index + 1, attrs.artifact) {
                // Next entry is a locked TOR region using this address.
            } else {
                self.invalidate_pmp_entry(space, index);
                self.pmp_addr[index as usize] = new;
                self.invalidate_pmp_entry(space, index);
            }
            result = self.effective_pmp_addr(index);
        }
        result
    }

    /// Power-on reset: clear every region, invalidating stale grants.
    pub fn reset_pmp<B: PhysMemory>(&mut self, space: &mut MemorySpace<B>) {
        for index in 0..self.num_pmp() {
            if self.pmp_addr[index as usize] != 0 || self.pmp_cfg[index as usize] != 0 {
                self.invalidate_pmp_entry(space, index);
                self.pmp_addr[index as usize] = 0;
                self.pmp_cfg[index as usize] = 0;
            }
        }
    }
}

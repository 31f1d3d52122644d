//! The VM subsystem facade and general TLB management.

use rvsim_mem::{DomainId, MemPriv, MemorySpace, PhysMemory};
use tracing::{debug, warn};

use crate::bits::{entry_asid_mask, SimAsid};
use crate::config::VmConfig;
use crate::csr::CsrView;
use crate::exception::AccessFaultCause;
use crate::ext::PmaCheck;
use crate::mode::{BaseMode, Mode5};
use crate::tlb::{Tlb, TlbEntry, TlbId};

/// Which TLB entries a scoped invalidation removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchMode {
    /// Every overlapping entry.
    Any,
    /// Non-global overlapping entries whose ASID (and, where present,
    /// VMID) matches.
    Asid,
}

/// The virtual-memory subsystem of one simulated hart.
pub struct Vm {
    pub(crate) cfg: VmConfig,
    /// CSR mirror; the surrounding processor refreshes this before calling
    /// in.
    pub csr: CsrView,

    pub(crate) tlbs: [Option<Tlb>; 3],
    pub(crate) active_tlb: TlbId,

    pub(crate) pmp_cfg: Vec<u8>,
    pub(crate) pmp_addr: Vec<u64>,

    // Domain stacks, indexed by [base-mode][is_code] and [vm-mode][is_code].
    pub(crate) pma_domains: [[Option<DomainId>; 2]; 4],
    pub(crate) pmp_domains: [[Option<DomainId>; 2]; 4],
    pub(crate) phys_domains: [[Option<DomainId>; 2]; 4],
    pub(crate) vm_domains: [[Option<DomainId>; 2]; 4],
    pub(crate) tm_domain: Option<DomainId>,
    pub(crate) clic_domain: Option<DomainId>,
    /// Width of the external physical address space.
    pub(crate) ext_bits: u32,

    pub(crate) data_domain: Option<DomainId>,
    pub(crate) data_mode: Mode5,

    // Walk state.
    pub(crate) ptw_active: bool,
    pub(crate) s2_active: bool,
    pub(crate) s1_va: u64,
    pub(crate) pending_gpa: u64,
    pub(crate) af_cause: AccessFaultCause,

    pub(crate) pma_hooks: Vec<Box<dyn PmaCheck>>,
}

impl Vm {
    pub fn new(cfg: VmConfig) -> Self {
        let regs = cfg.pmp_registers as usize;
        Self {
            pmp_cfg: vec![0; regs],
            pmp_addr: vec![0; regs],
            cfg,
            csr: CsrView::default(),
            tlbs: [None, None, None],
            active_tlb: TlbId::Hs,
            pma_domains: [[None; 2]; 4],
            pmp_domains: [[None; 2]; 4],
            phys_domains: [[None; 2]; 4],
            vm_domains: [[None; 2]; 4],
            tm_domain: None,
            clic_domain: None,
            ext_bits: 64,
            data_domain: None,
            data_mode: Mode5::Machine,
            ptw_active: false,
            s2_active: false,
            s1_va: 0,
            pending_gpa: 0,
            af_cause: AccessFaultCause::Bus,
            pma_hooks: Vec::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.cfg
    }

    /// Register a physical-memory-attribute validation hook.
    pub fn register_pma_check(&mut self, hook: Box<dyn PmaCheck>) {
        self.pma_hooks.push(hook);
    }

    /// True while a page-table read or write is in flight; lets nested
    /// callbacks distinguish PTW traffic from ordinary loads and stores.
    pub fn ptw_active(&self) -> bool {
        self.ptw_active
    }

    /// Subtype of the most recently armed access fault.
    pub fn access_fault_cause(&self) -> AccessFaultCause {
        self.af_cause
    }

    // ------------------------------------------------------------------
    // TLB plumbing
    // ------------------------------------------------------------------

    pub(crate) fn tlb(&self, id: TlbId) -> &Tlb {
        self.tlbs[id.index()].as_ref().expect("TLB not initialized")
    }

    pub(crate) fn tlb_mut(&mut self, id: TlbId) -> &mut Tlb {
        self.tlbs[id.index()].as_mut().expect("TLB not initialized")
    }

    pub(crate) fn has_tlb(&self, id: TlbId) -> bool {
        self.tlbs[id.index()].is_some()
    }

    /// Stage-1 TLB for the current virtualization state.
    pub(crate) fn s1_tlb_id(&self) -> TlbId {
        if self.csr.mode.is_virtual() {
            TlbId::Vs1
        } else {
            TlbId::Hs
        }
    }

    /// The regime in force for the current privilege state, if translation
    /// is enabled at all.
    pub(crate) fn current_tlb_id(&self) -> Option<TlbId> {
        if !self.csr.mode.is_virtual() {
            self.csr.satp_mode_enabled().then_some(TlbId::Hs)
        } else if self.csr.vsatp_mode_enabled() {
            Some(TlbId::Vs1)
        } else if self.csr.hgatp_mode_enabled() {
            Some(TlbId::Vs2)
        } else {
            None
        }
    }

    /// ASID live in the active regime.
    pub(crate) fn active_asid(&self) -> u32 {
        match self.active_tlb {
            TlbId::Hs => self.csr.satp_asid(),
            TlbId::Vs1 => self.csr.vsatp_asid(),
            TlbId::Vs2 => 0,
        }
    }

    /// VMID live in the active regime.
    pub(crate) fn active_vmid(&self) -> u32 {
        match self.active_tlb {
            TlbId::Vs1 | TlbId::Vs2 => self.csr.hgatp_vmid(),
            TlbId::Hs => 0,
        }
    }

    /// The packed simulated ASID for the current architectural state.
    pub fn sim_asid(&self) -> SimAsid {
        SimAsid::pack(
            self.csr.satp_asid(),
            self.csr.vsatp_asid(),
            self.csr.hgatp_vmid(),
            self.csr.mstatus_mxr(),
            self.csr.mstatus_sum(),
            self.csr.vsstatus_mxr(),
            self.csr.vsstatus_sum(),
            self.csr.vsatp_mode_enabled(),
            self.csr.hgatp_mode_enabled(),
        )
    }

    /// Effective global flag of a fresh entry: forced for stage 2 and when
    /// ASIDs are not implemented.
    pub(crate) fn entry_global(&self, g: bool) -> bool {
        g || self.active_tlb == TlbId::Vs2 || self.cfg.asid_mask() == 0
    }

    /// Publish the simulated ASID to the memory runtime.
    pub fn set_asid<B: PhysMemory>(&self, space: &mut MemorySpace<B>) {
        space.set_processor_asid(self.sim_asid().0);
    }

    // ------------------------------------------------------------------
    // Domain lookup
    // ------------------------------------------------------------------

    pub(crate) fn phys_domain(&self, mode: BaseMode, is_code: bool) -> Option<DomainId> {
        self.phys_domains[mode.index()][is_code as usize]
    }

    pub(crate) fn pma_domain(&self, mode: BaseMode, is_code: bool) -> Option<DomainId> {
        self.pma_domains[mode.index()][is_code as usize]
    }

    pub(crate) fn pmp_domain(&self, mode: BaseMode, is_code: bool) -> Option<DomainId> {
        self.pmp_domains[mode.index()][is_code as usize]
    }

    pub(crate) fn virt_domain(&self, mode: Mode5, is_code: bool) -> Option<DomainId> {
        let vm = mode.vm_mode()?;
        self.vm_domains[vm.index()][is_code as usize]
    }

    /// PMP domain selected by the access type (code for fetches).
    pub(crate) fn pmp_domain_priv(&self, mode: Mode5, required: MemPriv) -> Option<DomainId> {
        self.pmp_domain(mode.base(), required.contains(MemPriv::X))
    }

    /// Domain used for page-table walk traffic: the supervisor-mode data
    /// PMP domain.
    pub(crate) fn ptw_domain(&self) -> Option<DomainId> {
        self.pmp_domain(BaseMode::Supervisor, false)
    }

    /// Data domain currently selected for the processor (after
    /// [`Vm::refresh_mprv_domain`]).
    pub fn data_domain(&self) -> Option<DomainId> {
        self.data_domain
    }

    pub fn transaction_domain(&self) -> Option<DomainId> {
        self.tm_domain
    }

    pub fn clic_domain(&self) -> Option<DomainId> {
        self.clic_domain
    }

    // ------------------------------------------------------------------
    // Entry deletion and alias teardown
    // ------------------------------------------------------------------

    /// Remove the virtual-domain aliases of an entry in one mode.
    fn delete_entry_mappings_mode<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        id: TlbId,
        idx: usize,
        mode: Mode5,
    ) {
        let entry = *self.tlb(id).get(idx);
        let mode_mask = mode.base().mask();
        if entry.mapped & mode_mask == 0 {
            return;
        }

        let data = self.virt_domain(mode, false);
        let code = self.virt_domain(mode, true);
        let asid_mask = entry_asid_mask(&entry, mode);
        let asid = entry.sim_asid.0;

        if let Some(d) = data {
            space.unalias_memory_vm(d, entry.low_va, entry.high_va, asid_mask, asid);
        }
        if let Some(c) = code {
            if data != Some(c) {
                space.unalias_memory_vm(c, entry.low_va, entry.high_va, asid_mask, asid);
            }
        }

        self.tlb_mut(id).get_mut(idx).mapped &= !mode_mask;
    }

    /// Remove an entry's aliases in one mode when its effective ASID would
    /// change under `new_asid`.
    fn delete_entry_mappings_mode_asid<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        id: TlbId,
        idx: usize,
        mode: Mode5,
        new_asid: SimAsid,
    ) {
        let entry = *self.tlb(id).get(idx);
        let mask = entry_asid_mask(&entry, mode);
        if (entry.sim_asid.0 & mask) != (new_asid.0 & mask) {
            self.delete_entry_mappings_mode(space, id, idx, mode);
        }
    }

    fn entry_modes(id: TlbId) -> [Mode5; 2] {
        match id {
            TlbId::Hs => [Mode5::User, Mode5::Supervisor],
            TlbId::Vs1 | TlbId::Vs2 => [Mode5::VirtUser, Mode5::VirtSupervisor],
        }
    }

    /// Tear down every alias an entry holds.
    pub(crate) fn unmap_entry<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        id: TlbId,
        idx: usize,
    ) {
        for mode in Self::entry_modes(id) {
            self.delete_entry_mappings_mode(space, id, idx, mode);
        }
    }

    /// Tear down the aliases invalidated by a simulated-ASID change.
    pub(crate) fn unmap_entry_new_asid<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        id: TlbId,
        idx: usize,
        new_asid: SimAsid,
    ) {
        for mode in Self::entry_modes(id) {
            self.delete_entry_mappings_mode_asid(space, id, idx, mode, new_asid);
        }
    }

    /// Delete one entry: tear down aliases, unlink, recycle the slot.
    pub(crate) fn delete_entry<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        id: TlbId,
        idx: usize,
    ) {
        if self.tlb(id).get(idx).mapped != 0 {
            self.unmap_entry(space, id, idx);
        }
        let entry = *self.tlb(id).get(idx);
        if !entry.artifact && self.cfg.debug_mmu {
            debug!(target: "rvsim::tlb", "delete TLB entry: {}", format_entry(&entry));
        }
        self.tlb_mut(id).remove(idx);
    }

    /// Find a live entry for `va` in the active TLB, matching the current
    /// ASID and VMID. Artifact entries encountered on the way are deleted.
    pub(crate) fn find_entry<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        va: u64,
    ) -> Option<usize> {
        let id = self.active_tlb;
        let asid = self.active_asid();
        let vmid = self.active_vmid();

        let mut cursor = self.tlb(id).first_overlap(va, va);
        while let Some((handle, idx)) = cursor {
            let entry = *self.tlb(id).get(idx);
            if entry.artifact {
                self.delete_entry(space, id, idx);
            } else {
                let vmid_ok = !entry.has_vmid() || vmid == entry.vmid();
                let asid_ok = entry.global || asid == entry.asid();
                if vmid_ok && asid_ok {
                    return Some(idx);
                }
            }
            cursor = self.tlb(id).next_overlap(handle, va, va);
        }
        None
    }

    // ------------------------------------------------------------------
    // Scoped invalidation
    // ------------------------------------------------------------------

    pub(crate) fn invalidate_range<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        id: TlbId,
        low: u64,
        high: u64,
        mode: MatchMode,
        asid: u32,
    ) {
        if !self.has_tlb(id) {
            return;
        }
        let mut cursor = self.tlb(id).first_overlap(low, high);
        while let Some((handle, idx)) = cursor {
            let entry = *self.tlb(id).get(idx);
            let delete = match mode {
                MatchMode::Any => true,
                MatchMode::Asid => {
                    if entry.has_vmid() && self.csr.hgatp_vmid() != entry.vmid() {
                        // Preserve entries belonging to another guest.
                        false
                    } else if self.cfg.asid_mask() == 0 {
                        // ASIDs absent: every entry is global.
                        true
                    } else {
                        !entry.global && asid == entry.asid()
                    }
                }
            };
            if delete {
                self.delete_entry(space, id, idx);
            }
            cursor = self.tlb(id).next_overlap(handle, low, high);
        }
    }

    /// Mask an invalidation ASID operand to the current `satp.ASID` field
    /// width, then to the implemented width.
    fn mask_asid(&self, asid: u32) -> u32 {
        asid & self.csr.satp_asid_field_mask() & self.cfg.asid_mask()
    }

    /// Invalidate the active stage-1 TLB entirely.
    pub fn invalidate_all<B: PhysMemory>(&mut self, space: &mut MemorySpace<B>) {
        self.invalidate_range(space, self.s1_tlb_id(), 0, u64::MAX, MatchMode::Any, 0);
    }

    /// Invalidate stage-1 entries with a matching ASID.
    pub fn invalidate_all_asid<B: PhysMemory>(&mut self, space: &mut MemorySpace<B>, asid: u32) {
        let asid = self.mask_asid(asid);
        self.invalidate_range(space, self.s1_tlb_id(), 0, u64::MAX, MatchMode::Asid, asid);
    }

    /// Invalidate stage-1 entries covering `va`.
    pub fn invalidate_va<B: PhysMemory>(&mut self, space: &mut MemorySpace<B>, va: u64) {
        self.invalidate_range(space, self.s1_tlb_id(), va, va, MatchMode::Any, 0);
    }

    /// Invalidate stage-1 entries covering `va` with a matching ASID.
    pub fn invalidate_va_asid<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        va: u64,
        asid: u32,
    ) {
        let asid = self.mask_asid(asid);
        self.invalidate_range(space, self.s1_tlb_id(), va, va, MatchMode::Asid, asid);
    }

    /// Dispose all TLBs, tearing down any remaining aliases.
    pub fn teardown<B: PhysMemory>(&mut self, space: &mut MemorySpace<B>) {
        for id in TlbId::ALL {
            if self.has_tlb(id) {
                self.invalidate_range(space, id, 0, u64::MAX, MatchMode::Any, 0);
                self.tlbs[id.index()] = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // MPRV data-domain selection
    // ------------------------------------------------------------------

    /// Effective `mstatus.MPRV`: in debug mode it applies only when
    /// `dcsr.mprven` is set.
    fn effective_mprv(&self) -> bool {
        self.csr.mstatus_mprv() && (!self.csr.debug_mode || self.csr.dcsr_mprven())
    }

    /// Reselect the data-access domain after an MPRV/MPP change and return
    /// it. Also records the effective data-access mode.
    pub fn refresh_mprv_domain(&mut self) -> Option<DomainId> {
        let mut mode = self.csr.mode;

        if self.effective_mprv() {
            let mut mpp = self.csr.mstatus_mpp();
            if !self.cfg.has_mode(mpp) {
                mpp = self.cfg.min_mode();
            }
            if mpp > mode.base() {
                warn!(
                    target: "rvsim::vm",
                    "suspicious execution in {} mode with mstatus.MPRV=1 and mstatus.MPP \
                     indicating {} mode",
                    mode.name(),
                    mpp.name()
                );
            }
            mode = match mpp {
                BaseMode::Machine => Mode5::Machine,
                BaseMode::Supervisor if self.csr.mpv() => Mode5::VirtSupervisor,
                BaseMode::Supervisor => Mode5::Supervisor,
                BaseMode::User if self.csr.mpv() => Mode5::VirtUser,
                BaseMode::User => Mode5::User,
            };
        }

        let vm_enabled = match mode {
            Mode5::Machine => false,
            _ => {
                let virt = mode.is_virtual();
                let stage1 = if virt {
                    self.csr.vsatp_mode_enabled()
                } else {
                    self.csr.satp_mode_enabled()
                };
                stage1 || (virt && self.csr.hgatp_mode_enabled())
            }
        };

        self.data_mode = mode;

        let domain = if vm_enabled {
            self.virt_domain(mode, false)
        } else {
            None
        };
        let domain = domain.or_else(|| self.phys_domain(mode.base(), false));
        self.data_domain = domain;
        domain
    }

    /// Effective mode of data accesses (for endianness selection).
    pub fn data_mode(&self) -> Mode5 {
        self.data_mode
    }

    // ------------------------------------------------------------------
    // Debug dump
    // ------------------------------------------------------------------

    /// Human-readable listing of one TLB.
    pub fn dump_tlb(&self, id: TlbId) -> String {
        let mut out = String::from("TLB CONTENTS:\n");
        if let Some(tlb) = &self.tlbs[id.index()] {
            for (_, entry) in tlb.iter() {
                out.push_str(&format_entry(entry));
                out.push('\n');
            }
        }
        out
    }
}

/// One dump line for a TLB entry; ASID suppressed for global entries.
pub(crate) fn format_entry(e: &TlbEntry) -> String {
    let asid = if e.global {
        String::new()
    } else {
        format!(" ASID={}", e.asid())
    };
    format!(
        "VA {:#018x}:{:#018x} PA {:#018x}:{:#018x} {} U={} G={} A={} D={}{}",
        e.low_va,
        e.high_va,
        e.pa,
        e.high_pa(),
        e.perms.name(),
        e.user as u8,
        e.global as u8,
        e.accessed as u8,
        e.dirty as u8,
        asid
    )
}

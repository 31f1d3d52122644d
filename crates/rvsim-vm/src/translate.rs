//! Translation orchestration: miss resolution, permission checking,
//! two-stage composition and alias installation.

use rvsim_mem::{DomainId, MemPriv, MemorySpace, PhysMemory};
use tracing::debug;

use crate::bits::entry_asid_mask;
use crate::config::PrivVersion;
use crate::exception::{AccessAttrs, AccessFaultCause, ExceptionKind, MemoryException};
use crate::mode::{BaseMode, Mode5};
use crate::tlb::{TlbEntry, TlbId};
use crate::vm::{format_entry, Vm};
use crate::walk::PteError;

/// Result of a successfully handled miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissOutcome {
    /// The access is now mapped (or its physical protection refreshed);
    /// the caller should retry it.
    Resolved,
    /// The domain is not one managed by this subsystem.
    NotMapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomainType {
    Phys,
    Virt,
    Pmp,
}

/// Working state of one mapping attempt: the span still to cover and the
/// effective privilege to map with.
#[derive(Debug, Clone, Copy)]
struct MapInfo {
    low_va: u64,
    high_va: u64,
    perms: MemPriv,
}

/// The largest window installed per alias; larger translations are mapped
/// in 4 GiB pieces around the touched address.
const MAP_CHUNK_MAX: u64 = 1 << 32;

impl Vm {
    fn domain_type(&self, domain: DomainId, mode: Mode5, is_code: bool) -> Option<DomainType> {
        if mode.is_virtual() && !self.cfg.has_hypervisor {
            return None;
        }
        if self.phys_domain(mode.base(), is_code) == Some(domain) {
            Some(DomainType::Phys)
        } else if self.virt_domain(mode, is_code) == Some(domain) {
            Some(DomainType::Virt)
        } else if self.pmp_domain(mode.base(), is_code) == Some(domain) {
            Some(DomainType::Pmp)
        } else {
            None
        }
    }

    /// Effective privilege the entry grants to `mode`, empty when the
    /// access must be denied.
    pub(crate) fn check_entry_permission(
        &self,
        mode: Mode5,
        entry: &TlbEntry,
        required: MemPriv,
    ) -> MemPriv {
        let mut perms = entry.perms;
        let mut mxr = self.csr.mstatus_mxr();
        let mut sum = self.csr.mstatus_sum();
        let mut eff_mode = mode;

        match self.active_tlb {
            TlbId::Vs1 => {
                // Stage-1 virtual access: VS-level MXR widens, VS-level SUM
                // replaces.
                mxr |= self.csr.vsstatus_mxr();
                sum = self.csr.vsstatus_sum();
            }
            TlbId::Vs2 => {
                // Stage-2 accesses are always taken to be user mode.
                eff_mode = Mode5::User;
            }
            TlbId::Hs => {}
        }

        // MXR grants read on executable pages. This must precede the
        // mode-specific handling for correct SUM interaction.
        if perms.contains(MemPriv::X) && mxr {
            perms |= MemPriv::R;
        }

        if eff_mode.base() == BaseMode::User {
            if !entry.user {
                perms = MemPriv::empty();
            }
        } else if entry.user {
            if !sum {
                perms = MemPriv::empty();
            } else if self.cfg.priv_version >= PrivVersion::V1_11 {
                // From 1.11 on, supervisor never executes user pages.
                perms.remove(MemPriv::X);
            }
        }

        if perms.contains(required.rwx()) {
            perms
        } else {
            MemPriv::empty()
        }
    }

    /// Convert a walk failure into the exception reported to the guest.
    fn walk_exception(&mut self, err: PteError, va: u64, required: MemPriv) -> MemoryException {
        let stage2 = self.active_tlb == TlbId::Vs2;
        let kind = if err.is_access_fault() {
            ExceptionKind::access_fault(required)
        } else {
            ExceptionKind::page_fault(required, stage2)
        };
        MemoryException {
            kind,
            // A failure inside the nested stage-2 walk is attributed to
            // the original stage-1 VA.
            tval: if self.s2_active { self.s1_va } else { va },
            gva: self.active_tlb != TlbId::Hs,
            gpa: if stage2 {
                std::mem::take(&mut self.pending_gpa)
            } else {
                0
            },
        }
    }

    /// Insert a freshly walked entry into the active TLB.
    fn allocate_entry(&mut self, entry: TlbEntry) -> usize {
        if !entry.artifact && self.cfg.debug_mmu {
            debug!(target: "rvsim::tlb", "create TLB entry: {}", format_entry(&entry));
        }
        let id = self.active_tlb;
        self.tlb_mut(id).insert(entry)
    }

    /// Check an entry against the required privilege, recording the
    /// privilege to map with.
    ///
    /// A write through a clean entry deletes it so the re-walk sets the
    /// dirty bit; a clean entry kept for a read is mapped without write
    /// permission for the same reason.
    fn validate_entry_priv<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: Mode5,
        idx: Option<usize>,
        required: MemPriv,
        mi: &mut MapInfo,
    ) -> Option<usize> {
        let idx = idx?;
        let entry = *self.tlb(self.active_tlb).get(idx);

        let mut perms = self.check_entry_permission(mode, &entry, required);
        if perms.is_empty() {
            return None;
        }

        if required.contains(MemPriv::W) && !entry.dirty {
            let id = self.active_tlb;
            self.delete_entry(space, id, idx);
            return None;
        }

        if !entry.dirty {
            perms.remove(MemPriv::W);
        }
        mi.perms = perms;
        Some(idx)
    }

    /// Find a usable entry for `mi.low_va`, walking the page table when
    /// the TLB has none.
    fn find_or_create<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: Mode5,
        attrs: AccessAttrs,
        mi: &mut MapInfo,
    ) -> Result<usize, MemoryException> {
        let va = mi.low_va;
        let required = mi.perms;

        let found = self.find_entry(space, va);
        if let Some(idx) = self.validate_entry_priv(space, mode, found, required, mi) {
            return Ok(idx);
        }

        let mut seed = TlbEntry::seed(va);
        match self.walk_stage(space, mode, &mut seed, required, attrs.artifact) {
            Err(err) => Err(self.walk_exception(err, va, required)),
            Ok(()) => {
                seed.artifact = attrs.artifact;
                seed.sim_asid = self.sim_asid();
                let idx = self.allocate_entry(seed);
                match self.validate_entry_priv(space, mode, Some(idx), required, mi) {
                    Some(idx) => Ok(idx),
                    None => {
                        debug_assert!(false, "fresh walk result failed validation");
                        Err(self.walk_exception(PteError::Priv, va, required))
                    }
                }
            }
        }
    }

    /// Resolve one translation stage in TLB `id`, refreshing the entry's
    /// simulated-ASID binding.
    fn tlb_stage_entry<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        id: TlbId,
        mode: Mode5,
        attrs: AccessAttrs,
        mi: &mut MapInfo,
    ) -> Result<usize, MemoryException> {
        let old = self.active_tlb;
        self.active_tlb = id;

        let result = self.find_or_create(space, mode, attrs, mi);
        if let Ok(idx) = result {
            let sim = self.sim_asid();
            // Status-bit changes invalidate aliases created under the old
            // simulated ASID.
            self.unmap_entry_new_asid(space, id, idx, sim);
            self.tlb_mut(id).get_mut(idx).sim_asid = sim;
        }

        self.active_tlb = old;
        result
    }

    /// Install the resolved translation as a virtual-domain alias, then
    /// refine PMP and PMA over the physical span of the access.
    #[allow(clippy::too_many_arguments)]
    fn map_tlb_entry<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        va: u64,
        gpa: u64,
        id: TlbId,
        e1_idx: usize,
        e2_idx: Option<usize>,
        domain_v: DomainId,
        mode: Mode5,
        required: MemPriv,
        mi: &mut MapInfo,
    ) {
        let Some(domain_p) = self.pmp_domain_priv(mode, required) else {
            return;
        };

        let e1 = *self.tlb(id).get(e1_idx);
        let mut low_va = e1.low_va;
        let mut high_va = e1.high_va;
        let mut va_to_pa = e1.va_to_pa();
        let mut asid_mask = entry_asid_mask(&e1, mode);
        let sim_asid = e1.sim_asid.0;

        // Cap at the maximum window size, centred on the touched page.
        if e1.size() > MAP_CHUNK_MAX {
            low_va = mi.low_va & MAP_CHUNK_MAX.wrapping_neg();
            high_va = low_va + MAP_CHUNK_MAX - 1;
        }

        if let Some(idx2) = e2_idx {
            let e2 = *self.tlb(TlbId::Vs2).get(idx2);

            // Offsets of the translated address from each entry's bounds;
            // the tighter bound on each side wins.
            let lo_delta1 = va - low_va;
            let lo_delta2 = gpa - e2.low_va;
            let hi_delta1 = high_va - va;
            let hi_delta2 = e2.high_va - gpa;

            if lo_delta1 > lo_delta2 {
                low_va += lo_delta1 - lo_delta2;
            }
            if hi_delta1 > hi_delta2 {
                high_va -= hi_delta1 - hi_delta2;
            }

            va_to_pa = va_to_pa.wrapping_add(e2.va_to_pa());
            asid_mask |= entry_asid_mask(&e2, mode);
        }

        // Artifact entries never enter host mappings; they exist only so
        // the next architectural lookup reaps and replaces them.
        if !e1.artifact {
            let low_pa = low_va.wrapping_add(va_to_pa);
            let high_pa = high_va.wrapping_add(va_to_pa);
            space.alias_memory_vm(
                domain_p, domain_v, low_pa, high_pa, low_va, mi.perms, asid_mask, sim_asid,
            );
        }

        // PMP/PMA refinement covers the physical span of the original
        // access, not just the window installed above.
        let acc_low = mi.low_va.wrapping_add(va_to_pa);
        let acc_high = mi.high_va.wrapping_add(va_to_pa);
        self.map_pmp(space, mode, required, acc_low, acc_high);
        self.map_pma(mode, required, acc_low, acc_high);

        if !e1.artifact {
            self.tlb_mut(id).get_mut(e1_idx).mapped |= mode.base().mask();
        }

        mi.low_va = low_va;
        mi.high_va = high_va;
    }

    /// Resolve a miss on a virtual domain for the span in `mi`.
    fn tlb_miss<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        domain_v: DomainId,
        mode: Mode5,
        mi: &mut MapInfo,
        attrs: AccessAttrs,
    ) -> Result<(), MemoryException> {
        let Some(id) = self.current_tlb_id() else {
            debug_assert!(false, "virtual-domain miss without an active regime");
            return Ok(());
        };
        let required = mi.perms;
        let va = mi.low_va;
        let mut gpa = va;

        let e1_idx = self.tlb_stage_entry(space, id, mode, attrs, mi)?;
        let mut e2_idx = None;

        if id == TlbId::Vs1 && self.csr.hgatp_mode_enabled() {
            // Nested stage-2 walk; fault reporting uses the original VA.
            self.s2_active = true;
            self.s1_va = va;

            let e1 = *self.tlb(TlbId::Vs1).get(e1_idx);
            gpa = va.wrapping_add(e1.va_to_pa());
            let mut mi2 = MapInfo {
                low_va: gpa,
                high_va: gpa,
                perms: required,
            };

            let stage2 = self.tlb_stage_entry(space, TlbId::Vs2, mode, attrs, &mut mi2);
            self.s2_active = false;
            let idx2 = stage2?;
            e2_idx = Some(idx2);

            // AND the R/W/X grants, keep user/alignment markers from both.
            let markers = MemPriv::USER | MemPriv::ALIGN;
            mi.perms = (mi.perms & (mi2.perms | markers)) | (mi2.perms & markers);
        }

        self.map_tlb_entry(
            space, va, gpa, id, e1_idx, e2_idx, domain_v, mode, required, mi,
        );
        Ok(())
    }

    /// Resolve a mapping miss on `domain` for `[addr, addr+bytes-1]`.
    ///
    /// For a virtual domain this translates (walking page tables as
    /// needed) and installs aliases across the whole span; for physical
    /// and PMP domains it refreshes PMP/PMA protection. PMP or PMA
    /// denial surfaces as the access-fault variant of the original
    /// access.
    ///
    /// Artifact probes report errors the same way but leave guest state
    /// untouched; the caller decides whether to raise.
    pub fn miss<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        domain: DomainId,
        required: MemPriv,
        addr: u64,
        bytes: u64,
        attrs: AccessAttrs,
    ) -> Result<MissOutcome, MemoryException> {
        debug_assert!(bytes > 0);
        // Until something more specific is armed, any access fault raised
        // from here is a plain bus error.
        self.af_cause = AccessFaultCause::Bus;

        let mut matched = None;
        'scan: for is_code in [false, true] {
            for mode in Mode5::SCAN_ORDER {
                if let Some(dt) = self.domain_type(domain, mode, is_code) {
                    matched = Some((dt, mode));
                    break 'scan;
                }
            }
        }
        let Some((dt, mode)) = matched else {
            return Ok(MissOutcome::NotMapped);
        };

        match dt {
            DomainType::Virt => {
                let last_va = addr.wrapping_add(bytes - 1);
                let mut mi = MapInfo {
                    low_va: addr,
                    high_va: addr.wrapping_sub(1),
                    perms: required,
                };
                // One access may straddle several translation regions.
                loop {
                    mi.low_va = mi.high_va.wrapping_add(1);
                    mi.high_va = last_va;
                    mi.perms = required;
                    self.tlb_miss(space, domain, mode, &mut mi, attrs)?;
                    if self.af_cause != AccessFaultCause::Bus {
                        break;
                    }
                    if last_va >= mi.low_va && last_va <= mi.high_va {
                        break;
                    }
                }
            }
            DomainType::Phys | DomainType::Pmp => {
                let high = addr.wrapping_add(bytes - 1);
                self.map_pmp(space, mode, required, addr, high);
                self.map_pma(mode, required, addr, high);
            }
        }

        match self.af_cause {
            AccessFaultCause::Bus => Ok(MissOutcome::Resolved),
            _ => Err(MemoryException {
                kind: ExceptionKind::access_fault(required),
                tval: addr,
                gva: false,
                gpa: 0,
            }),
        }
    }

    /// Translate `va` for the current privilege state without any
    /// guest-visible side effects: no A/D updates, no TLB population, no
    /// alias installation. Intended for debugger probes.
    ///
    /// With translation disabled the address maps onto itself.
    pub fn translate_probe<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        va: u64,
        required: MemPriv,
    ) -> Result<u64, MemoryException> {
        let Some(id) = self.current_tlb_id() else {
            return Ok(va);
        };
        let mode = self.csr.mode;

        let old = self.active_tlb;
        self.active_tlb = id;
        let result = (|| {
            let mut e1 = TlbEntry::seed(va);
            self.walk_stage(space, mode, &mut e1, required, true)
                .map_err(|err| self.walk_exception(err, va, required))?;
            let mut pa = va.wrapping_add(e1.va_to_pa());

            if id == TlbId::Vs1 && self.csr.hgatp_mode_enabled() {
                self.s2_active = true;
                self.s1_va = va;
                self.active_tlb = TlbId::Vs2;

                let gpa = pa;
                let mut e2 = TlbEntry::seed(gpa);
                let stage2 = self
                    .walk_stage(space, mode, &mut e2, required, true)
                    .map_err(|err| self.walk_exception(err, gpa, required));
                self.s2_active = false;
                stage2?;
                pa = gpa.wrapping_add(e2.va_to_pa());
            }
            Ok(pa)
        })();
        self.active_tlb = old;
        result
    }
}

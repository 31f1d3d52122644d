//! Construction of the per-privilege-mode domain stack.
//!
//! For each base mode the stack is PMA → PMP → Physical, with Virtual
//! domains on top for the modes that translate. User mode shares the
//! Supervisor physical stack. Code and data sides are unified whenever the
//! underlying domains coincide.

use rvsim_mem::{AccessHandler, DomainId, MemPriv, MemorySpace, PhysMemory, ProtectOp};

use crate::config::address_mask;
use crate::mode::{BaseMode, VmMode};
use crate::tlb::{Tlb, TlbId};
use crate::vm::Vm;

fn domain_name(mode: &str, kind: &str, is_code: bool, unified: bool) -> String {
    let side = if unified {
        "unified"
    } else if is_code {
        "code"
    } else {
        "data"
    };
    format!("{mode} {kind} {side}")
}

/// Default transaction-mode handler: loads read zero, stores are dropped.
struct NullTxHandler;

impl AccessHandler for NullTxHandler {
    fn read(&mut self, _addr: u64, buf: &mut [u8]) {
        buf.fill(0);
    }

    fn write(&mut self, _addr: u64, _buf: &[u8]) {}
}

impl Vm {
    fn create_pma_domain<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: BaseMode,
        is_code: bool,
        ext: DomainId,
        other: DomainId,
    ) -> bool {
        let unified = ext == other;
        let ext_mask = address_mask(self.ext_bits);

        let pma = space.new_domain(&domain_name(mode.name(), "PMA", is_code, unified), 64);
        space.alias_memory(ext, pma, 0, ext_mask, 0);

        self.pma_domains[mode.index()][is_code as usize] = Some(pma);
        unified
    }

    fn create_pmp_domain<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: BaseMode,
        is_code: bool,
    ) -> bool {
        let pma = self.pma_domain(mode, is_code).expect("PMA domain built first");
        let other = self.pma_domain(mode, !is_code).expect("PMA domain built first");
        let unified = pma == other;
        let ext_mask = address_mask(self.ext_bits);

        let pmp = space.new_domain(&domain_name(mode.name(), "PMP", is_code, unified), 64);
        space.alias_memory(pma, pmp, 0, ext_mask, 0);

        // With PMP regions implemented, all access starts withdrawn; every
        // grant goes through refinement.
        if self.cfg.pmp_registers != 0 {
            space.protect_memory(pmp, 0, u64::MAX, MemPriv::RWX, ProtectOp::Sub);
        }

        self.pmp_domains[mode.index()][is_code as usize] = Some(pmp);
        unified
    }

    fn create_physical_domain<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        mode: BaseMode,
        is_code: bool,
    ) -> bool {
        let pmp = self.pmp_domain(mode, is_code).expect("PMP domain built first");
        let other = self.pmp_domain(mode, !is_code).expect("PMP domain built first");
        let unified = pmp == other;
        let phys_bits = self.cfg.xlen;
        let phys_mask = address_mask(phys_bits);

        let phys = space.new_domain(
            &domain_name(mode.name(), "Physical", is_code, unified),
            phys_bits,
        );
        space.alias_memory(pmp, phys, 0, phys_mask, 0);

        self.phys_domains[mode.index()][is_code as usize] = Some(phys);
        unified
    }

    fn create_virtual_domain<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        vm_mode: VmMode,
        is_code: bool,
    ) -> bool {
        let base = vm_mode.mode5().base();
        let pmp_code = self.pmp_domain(base, true).expect("PMP domain built first");
        let pmp_data = self.pmp_domain(base, false).expect("PMP domain built first");
        let unified = pmp_code == pmp_data;

        let virt = space.new_domain(
            &domain_name(vm_mode.mode5().name(), "Virtual", is_code, unified),
            self.cfg.xlen,
        );
        self.vm_domains[vm_mode.index()][is_code as usize] = Some(virt);
        unified
    }

    /// Build the domain stack and the per-regime TLBs over the external
    /// code and data domains.
    ///
    /// `tx_handler` backs the transaction-mode domain; transaction loads
    /// and stores are routed to it. The CLIC alias domain (when
    /// configured) is exposed through [`Vm::clic_domain`] for the external
    /// block mapping.
    pub fn init<B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        code_domain: DomainId,
        data_domain: DomainId,
        tx_handler: Option<Box<dyn AccessHandler>>,
    ) {
        let code_bits = space.domain_bits(code_domain);
        let data_bits = space.domain_bits(data_domain);
        self.ext_bits = code_bits.min(data_bits);

        // The CLIC register block sits between the external data domain
        // and the rest of the stack.
        let mut data_ext = data_domain;
        if self.cfg.clic_internal {
            let clic = space.new_domain("Machine CLIC data", data_bits);
            space.alias_memory(data_domain, clic, 0, address_mask(data_bits), 0);
            self.clic_domain = Some(clic);
            data_ext = clic;
        }

        for mode in [BaseMode::Supervisor, BaseMode::Machine] {
            if self.create_pma_domain(space, mode, false, data_ext, code_domain) {
                self.pma_domains[mode.index()][1] = self.pma_domains[mode.index()][0];
            } else {
                self.create_pma_domain(space, mode, true, code_domain, data_ext);
            }

            if self.create_pmp_domain(space, mode, false) {
                self.pmp_domains[mode.index()][1] = self.pmp_domains[mode.index()][0];
            } else {
                self.create_pmp_domain(space, mode, true);
            }

            if self.create_physical_domain(space, mode, false) {
                self.phys_domains[mode.index()][1] = self.phys_domains[mode.index()][0];
            } else {
                self.create_physical_domain(space, mode, true);
            }
        }

        // User mode shares the Supervisor physical stack.
        let s = BaseMode::Supervisor.index();
        let u = BaseMode::User.index();
        self.pma_domains[u] = self.pma_domains[s];
        self.pmp_domains[u] = self.pmp_domains[s];
        self.phys_domains[u] = self.phys_domains[s];

        for vm_mode in VmMode::ALL {
            let virt = vm_mode.mode5().is_virtual();
            if virt && !self.cfg.has_hypervisor {
                continue;
            }
            if !virt && !self.cfg.has_supervisor {
                continue;
            }
            if self.create_virtual_domain(space, vm_mode, false) {
                self.vm_domains[vm_mode.index()][1] = self.vm_domains[vm_mode.index()][0];
            } else {
                self.create_virtual_domain(space, vm_mode, true);
            }
        }

        let handler = tx_handler.unwrap_or_else(|| Box::new(NullTxHandler));
        self.tm_domain = Some(space.new_callback_domain("Transaction", self.cfg.xlen, handler));

        if self.cfg.has_supervisor {
            self.tlbs[TlbId::Hs.index()] = Some(Tlb::new());
        }
        if self.cfg.has_hypervisor {
            self.tlbs[TlbId::Vs1.index()] = Some(Tlb::new());
            self.tlbs[TlbId::Vs2.index()] = Some(Tlb::new());
        }

        self.refresh_mprv_domain();
    }
}

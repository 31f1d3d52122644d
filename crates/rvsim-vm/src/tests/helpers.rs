//! Shared scaffolding: a small simulated hart around `Vm` plus page-table
//! builders.

use rvsim_mem::{AccessError, DomainId, MemPriv, MemorySpace, SparseMemory};

use crate::bits::vpn_slice;
use crate::config::VmConfig;
use crate::exception::{AccessAttrs, ExceptionKind, MemoryException};
use crate::mode::Mode5;
use crate::vm::Vm;

pub const PTE_V: u64 = 1 << 0;
pub const PTE_R: u64 = 1 << 1;
pub const PTE_W: u64 = 1 << 2;
pub const PTE_X: u64 = 1 << 3;
pub const PTE_U: u64 = 1 << 4;
pub const PTE_G: u64 = 1 << 5;
pub const PTE_A: u64 = 1 << 6;
pub const PTE_D: u64 = 1 << 7;

pub const RWX_AD: u64 = PTE_V | PTE_R | PTE_W | PTE_X | PTE_A | PTE_D;

/// A hart-shaped wrapper: memory space, VM subsystem, and the retry loop
/// the interpreter would run on access misses.
pub struct Sim {
    pub space: MemorySpace<SparseMemory>,
    pub vm: Vm,
    /// Unified external domain backing the whole stack.
    pub ext: DomainId,
}

impl Sim {
    pub fn new(cfg: VmConfig) -> Self {
        let mut space = MemorySpace::new(SparseMemory::new(1 << 40));
        let ext = space.new_root_domain("external", 40);
        let mut vm = Vm::new(cfg);
        vm.init(&mut space, ext, ext, None);
        let mut sim = Sim { space, vm, ext };
        sim.sync_asid();
        sim
    }

    pub fn mem(&mut self) -> &mut SparseMemory {
        self.space.backend_mut()
    }

    /// Publish the simulated ASID, as the processor does after any CSR
    /// write that affects it.
    pub fn sync_asid(&mut self) {
        self.vm.set_asid(&mut self.space);
    }

    /// Virtual data domain for the current mode.
    pub fn virt_data_domain(&self) -> DomainId {
        self.vm
            .virt_domain(self.vm.csr.mode, false)
            .expect("virtual domain exists")
    }

    /// Physical data domain for the current mode.
    pub fn phys_data_domain(&self) -> DomainId {
        self.vm
            .phys_domain(self.vm.csr.mode.base(), false)
            .expect("physical domain exists")
    }

    fn access(
        &mut self,
        domain: DomainId,
        addr: u64,
        data: Option<&[u8]>,
        len: usize,
        req: MemPriv,
        attrs: AccessAttrs,
    ) -> Result<Vec<u8>, MemoryException> {
        self.sync_asid();
        for _ in 0..8 {
            let result = match data {
                Some(src) => self
                    .space
                    .write_bytes(domain, addr, src, req)
                    .map(|()| Vec::new()),
                None => {
                    let mut buf = vec![0u8; len];
                    self.space
                        .read_bytes(domain, addr, &mut buf, req)
                        .map(|()| buf)
                }
            };
            match result {
                Ok(buf) => return Ok(buf),
                Err(AccessError::Bus { addr }) => {
                    return Err(MemoryException {
                        kind: ExceptionKind::access_fault(req),
                        tval: addr,
                        gva: false,
                        gpa: 0,
                    })
                }
                Err(_) => {
                    self.vm
                        .miss(&mut self.space, domain, req, addr, len as u64, attrs)?;
                }
            }
        }
        panic!("access at {addr:#x} did not settle after 8 miss rounds");
    }

    pub fn read(
        &mut self,
        domain: DomainId,
        addr: u64,
        len: usize,
    ) -> Result<Vec<u8>, MemoryException> {
        self.access(domain, addr, None, len, MemPriv::R, AccessAttrs::ARCH)
    }

    pub fn read_u64(&mut self, domain: DomainId, addr: u64) -> Result<u64, MemoryException> {
        self.read(domain, addr, 8)
            .map(|buf| u64::from_le_bytes(buf.try_into().unwrap()))
    }

    pub fn fetch(&mut self, domain: DomainId, addr: u64, len: usize) -> Result<Vec<u8>, MemoryException> {
        self.access(domain, addr, None, len, MemPriv::X, AccessAttrs::ARCH)
    }

    pub fn write(
        &mut self,
        domain: DomainId,
        addr: u64,
        data: &[u8],
    ) -> Result<(), MemoryException> {
        self.access(domain, addr, Some(data), data.len(), MemPriv::W, AccessAttrs::ARCH)
            .map(|_| ())
    }

    pub fn write_u64(&mut self, domain: DomainId, addr: u64, value: u64) -> Result<(), MemoryException> {
        self.write(domain, addr, &value.to_le_bytes())
    }

    /// Non-architectural probe read (debugger-style): side-effect-free
    /// translation followed by a physical read.
    pub fn probe_read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryException> {
        self.sync_asid();
        let pa = self.vm.translate_probe(&mut self.space, addr, MemPriv::R)?;
        let phys = self.phys_data_domain();
        self.access(phys, pa, None, len, MemPriv::R, AccessAttrs::ARTIFACT)
    }
}

/// Sv39 satp/vsatp/hgatp encodings (RV64, MODE=8).
pub fn satp_sv39(root: u64, asid: u32) -> u64 {
    (8u64 << 60) | ((asid as u64) << 44) | (root >> 12)
}

pub fn hgatp_sv39(root: u64, vmid: u32) -> u64 {
    (8u64 << 60) | ((vmid as u64) << 44) | (root >> 12)
}

pub fn satp_sv48(root: u64, asid: u32) -> u64 {
    (9u64 << 60) | ((asid as u64) << 44) | (root >> 12)
}

/// Sv32 satp encoding (RV32, MODE=1).
pub fn satp_sv32(root: u64, asid: u32) -> u64 {
    (1u64 << 31) | ((asid as u64) << 22) | (root >> 12)
}

/// Incremental Sv39/Sv48 page-table builder over sparse physical memory.
pub struct PageTables {
    pub root: u64,
    levels: u32,
    next: u64,
}

impl PageTables {
    pub fn sv39(root: u64) -> Self {
        Self {
            root,
            levels: 3,
            next: root + 0x1000,
        }
    }

    /// Sv39 tables rooted at `root` with intermediate tables allocated
    /// from `pool` (for roots that are part of a larger structure).
    pub fn sv39_with_pool(root: u64, pool: u64) -> Self {
        Self {
            root,
            levels: 3,
            next: pool,
        }
    }

    pub fn sv48(root: u64) -> Self {
        Self {
            root,
            levels: 4,
            next: root + 0x1000,
        }
    }

    fn alloc(&mut self) -> u64 {
        let table = self.next;
        self.next += 0x1000;
        table
    }

    /// Install a leaf for `va` at `level` (0 = 4 KiB), creating pointer
    /// entries down to it.
    pub fn map(&mut self, mem: &mut SparseMemory, va: u64, pa: u64, level: u32, flags: u64) {
        let leaf_addr = self.walk_to(mem, va, level);
        mem.write_u64_at(leaf_addr, ((pa >> 12) << 10) | flags);
    }

    /// Address of the PTE for `va` at `level`, creating intermediate
    /// tables as needed.
    pub fn walk_to(&mut self, mem: &mut SparseMemory, va: u64, level: u32) -> u64 {
        let mut table = self.root;
        for l in (level + 1..self.levels).rev() {
            let slot = table + vpn_slice(va, l, 9) * 8;
            let pte = mem.read_u64_at(slot);
            if pte & PTE_V != 0 {
                table = (pte >> 10) << 12;
            } else {
                let next = self.alloc();
                mem.write_u64_at(slot, ((next >> 12) << 10) | PTE_V);
                table = next;
            }
        }
        table + vpn_slice(va, level, 9) * 8
    }
}

/// Shorthand configs.
pub fn sv_config() -> VmConfig {
    VmConfig::default()
}

pub fn hyp_config() -> VmConfig {
    VmConfig {
        has_hypervisor: true,
        ..VmConfig::default()
    }
}

pub fn pmp_config(regions: u32, grain: u32) -> VmConfig {
    VmConfig {
        pmp_registers: regions,
        pmp_grain: grain,
        ..VmConfig::default()
    }
}

/// Switch the hart to supervisor mode with Sv39 enabled at `root`.
pub fn enter_sv39(sim: &mut Sim, root: u64, asid: u32, mode: Mode5) {
    sim.vm.csr.satp = satp_sv39(root, asid);
    sim.vm.csr.mode = mode;
    sim.sync_asid();
}

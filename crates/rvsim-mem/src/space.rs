//! Domain arena and access resolution.

use thiserror::Error;

use crate::perms::{MemPriv, ProtectOp};
use crate::phys::{Endian, PhysMemory};
use crate::priv_map::PrivMap;
use crate::range_table::RangeTable;

/// Handle to a domain inside a [`MemorySpace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainId(u32);

impl DomainId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Why an access could not be completed.
///
/// `Unmapped` and `Denied` are *misses*: the processor loop is expected to
/// give the VM subsystem a chance to resolve them and retry. `Bus` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("no mapping covers {addr:#x}")]
    Unmapped { addr: u64 },
    #[error("insufficient privilege for access at {addr:#x}")]
    Denied { addr: u64 },
    #[error("bus error at {addr:#x}")]
    Bus { addr: u64 },
}

/// Callback target for domains that model side effects instead of storage
/// (transaction mode).
pub trait AccessHandler {
    fn read(&mut self, addr: u64, buf: &mut [u8]);
    fn write(&mut self, addr: u64, buf: &[u8]);
}

/// One virtual-to-physical window installed by the translation layer.
///
/// An alias is live for a caller whose published ASID matches `asid` under
/// `asid_mask`; stale aliases are skipped (and later torn down by their
/// owner), they never satisfy an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmAlias {
    pub low_va: u64,
    pub high_va: u64,
    pub low_pa: u64,
    pub target: DomainId,
    pub perms: MemPriv,
    pub asid_mask: u64,
    pub asid: u64,
}

#[derive(Debug, Clone, Copy)]
struct StaticAlias {
    low: u64,
    high: u64,
    to: u64,
    target: DomainId,
}

struct Domain {
    name: String,
    bits: u32,
    root: bool,
    static_alias: Option<StaticAlias>,
    handler: Option<Box<dyn AccessHandler>>,
    prot: Option<PrivMap>,
    vm_aliases: RangeTable<VmAlias>,
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("bits", &self.bits)
            .field("root", &self.root)
            .field("static_alias", &self.static_alias)
            .field("has_handler", &self.handler.is_some())
            .field("vm_aliases", &self.vm_aliases.len())
            .finish()
    }
}

enum Route {
    Mem { addr: u64, chunk: usize },
    Callback { domain: usize, addr: u64, chunk: usize },
}

/// Arena of layered memory domains over one physical backend.
#[derive(Debug)]
pub struct MemorySpace<B> {
    backend: B,
    domains: Vec<Domain>,
    /// Packed ASID published by the processor; VM aliases are validated
    /// against it under their stored mask.
    asid: u64,
}

const MAX_DEPTH: usize = 8;

impl<B: PhysMemory> MemorySpace<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            domains: Vec::new(),
            asid: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn push(&mut self, domain: Domain) -> DomainId {
        let id = DomainId(self.domains.len() as u32);
        self.domains.push(domain);
        id
    }

    /// Domain backed directly by the physical storage.
    pub fn new_root_domain(&mut self, name: &str, bits: u32) -> DomainId {
        self.push(Domain {
            name: name.to_owned(),
            bits,
            root: true,
            static_alias: None,
            handler: None,
            prot: None,
            vm_aliases: RangeTable::new(),
        })
    }

    /// Detached domain; reachable content is defined by later
    /// [`Self::alias_memory`] / [`Self::alias_memory_vm`] calls.
    pub fn new_domain(&mut self, name: &str, bits: u32) -> DomainId {
        self.push(Domain {
            name: name.to_owned(),
            bits,
            root: false,
            static_alias: None,
            handler: None,
            prot: None,
            vm_aliases: RangeTable::new(),
        })
    }

    /// Domain whose accesses are handed to `handler`.
    pub fn new_callback_domain(
        &mut self,
        name: &str,
        bits: u32,
        handler: Box<dyn AccessHandler>,
    ) -> DomainId {
        self.push(Domain {
            name: name.to_owned(),
            bits,
            root: false,
            static_alias: None,
            handler: Some(handler),
            prot: None,
            vm_aliases: RangeTable::new(),
        })
    }

    pub fn domain_bits(&self, domain: DomainId) -> u32 {
        self.domains[domain.index()].bits
    }

    pub fn domain_name(&self, domain: DomainId) -> &str {
        &self.domains[domain.index()].name
    }

    /// Map `[low, high]` of `domain` onto `target` starting at `to`.
    pub fn alias_memory(&mut self, target: DomainId, domain: DomainId, low: u64, high: u64, to: u64) {
        debug_assert_ne!(target, domain);
        self.domains[domain.index()].static_alias = Some(StaticAlias {
            low,
            high,
            to,
            target,
        });
    }

    /// Install an ASID-keyed translation window in `domain`, mapping
    /// `[low_va ..]` onto `[low_pa, high_pa]` of `target`.
    pub fn alias_memory_vm(
        &mut self,
        target: DomainId,
        domain: DomainId,
        low_pa: u64,
        high_pa: u64,
        low_va: u64,
        perms: MemPriv,
        asid_mask: u64,
        asid: u64,
    ) {
        debug_assert!(low_pa <= high_pa);
        let high_va = low_va.wrapping_add(high_pa - low_pa);
        let alias = VmAlias {
            low_va,
            high_va,
            low_pa,
            target,
            perms,
            asid_mask,
            asid,
        };
        // Replace any previous window with the same key over this range.
        self.unalias_memory_vm(domain, low_va, high_va, asid_mask, asid);
        self.domains[domain.index()]
            .vm_aliases
            .insert(low_va, high_va, alias);
    }

    /// Remove translation windows overlapping `[low_va, high_va]` whose
    /// key matches `asid` under `asid_mask`.
    pub fn unalias_memory_vm(
        &mut self,
        domain: DomainId,
        low_va: u64,
        high_va: u64,
        asid_mask: u64,
        asid: u64,
    ) {
        let aliases = &mut self.domains[domain.index()].vm_aliases;
        let mut cursor = aliases.first_overlap(low_va, high_va);
        while let Some(handle) = cursor {
            let matches = aliases
                .get(handle)
                .is_some_and(|a| (a.asid & asid_mask) == (asid & asid_mask));
            if matches {
                aliases.remove(handle);
            }
            cursor = aliases.next_overlap(handle, low_va, high_va);
        }
    }

    /// Apply `op` with privilege `p` to `[low, high]` of `domain`.
    pub fn protect_memory(
        &mut self,
        domain: DomainId,
        low: u64,
        high: u64,
        p: MemPriv,
        op: ProtectOp,
    ) {
        let dom = &mut self.domains[domain.index()];
        let prot = dom.prot.get_or_insert_with(|| PrivMap::new(MemPriv::RWX));
        match op {
            ProtectOp::Set => prot.set(low, high, p.rwx()),
            ProtectOp::Sub => prot.sub(low, high, p.rwx()),
        }
    }

    /// Publish the processor's packed ASID; aliases are matched against it.
    pub fn set_processor_asid(&mut self, asid: u64) {
        self.asid = asid;
    }

    pub fn processor_asid(&self) -> u64 {
        self.asid
    }

    /// Resolve one contiguous chunk of an access starting at `addr`.
    fn resolve(
        &self,
        domain: DomainId,
        addr: u64,
        len: usize,
        req: MemPriv,
    ) -> Result<Route, AccessError> {
        let req = req.rwx();
        let mut d = domain.index();
        let mut a = addr;
        let mut chunk = len;

        for _ in 0..MAX_DEPTH {
            let dom = &self.domains[d];

            // Translation windows take priority; only a live one counts.
            let mut via_alias = None;
            let mut cursor = dom.vm_aliases.first_overlap(a, a);
            while let Some(handle) = cursor {
                let alias = dom.vm_aliases.get(handle).expect("handle from scan");
                let live = (alias.asid & alias.asid_mask) == (self.asid & alias.asid_mask);
                if live && alias.perms.rwx().contains(req) {
                    via_alias = Some(*alias);
                    break;
                }
                cursor = dom.vm_aliases.next_overlap(handle, a, a);
            }

            if let Some(alias) = via_alias {
                let coverage = (alias.high_va - a).saturating_add(1);
                chunk = chunk.min(coverage.min(usize::MAX as u64) as usize);
                if let Some(prot) = &dom.prot {
                    let end = a.saturating_add(chunk as u64 - 1);
                    if !prot.min_over(a, end).contains(req) {
                        return Err(AccessError::Denied { addr: a });
                    }
                }
                a = a.wrapping_sub(alias.low_va).wrapping_add(alias.low_pa);
                d = alias.target.index();
                continue;
            }

            if let Some(sa) = dom.static_alias {
                if a < sa.low || a > sa.high {
                    return Err(AccessError::Unmapped { addr: a });
                }
                let coverage = (sa.high - a).saturating_add(1);
                chunk = chunk.min(coverage.min(usize::MAX as u64) as usize);
                if let Some(prot) = &dom.prot {
                    let end = a.saturating_add(chunk as u64 - 1);
                    if !prot.min_over(a, end).contains(req) {
                        return Err(AccessError::Denied { addr: a });
                    }
                }
                a = a.wrapping_sub(sa.low).wrapping_add(sa.to);
                d = sa.target.index();
                continue;
            }

            if let Some(prot) = &dom.prot {
                let end = a.saturating_add(chunk as u64 - 1);
                if !prot.min_over(a, end).contains(req) {
                    return Err(AccessError::Denied { addr: a });
                }
            }

            if dom.handler.is_some() {
                return Ok(Route::Callback {
                    domain: d,
                    addr: a,
                    chunk,
                });
            }
            if dom.root {
                return Ok(Route::Mem { addr: a, chunk });
            }
            return Err(AccessError::Unmapped { addr: a });
        }

        Err(AccessError::Unmapped { addr })
    }

    pub fn read_bytes(
        &mut self,
        domain: DomainId,
        addr: u64,
        buf: &mut [u8],
        req: MemPriv,
    ) -> Result<(), AccessError> {
        let mut off = 0usize;
        while off < buf.len() {
            let a = addr.wrapping_add(off as u64);
            match self.resolve(domain, a, buf.len() - off, req)? {
                Route::Mem { addr: pa, chunk } => {
                    self.backend
                        .read(pa, &mut buf[off..off + chunk])
                        .map_err(|f| AccessError::Bus { addr: f.addr })?;
                    off += chunk;
                }
                Route::Callback {
                    domain: d,
                    addr: ca,
                    chunk,
                } => {
                    let handler = self.domains[d].handler.as_mut().expect("callback domain");
                    handler.read(ca, &mut buf[off..off + chunk]);
                    off += chunk;
                }
            }
        }
        Ok(())
    }

    pub fn write_bytes(
        &mut self,
        domain: DomainId,
        addr: u64,
        buf: &[u8],
        req: MemPriv,
    ) -> Result<(), AccessError> {
        let mut off = 0usize;
        while off < buf.len() {
            let a = addr.wrapping_add(off as u64);
            match self.resolve(domain, a, buf.len() - off, req)? {
                Route::Mem { addr: pa, chunk } => {
                    self.backend
                        .write(pa, &buf[off..off + chunk])
                        .map_err(|f| AccessError::Bus { addr: f.addr })?;
                    off += chunk;
                }
                Route::Callback {
                    domain: d,
                    addr: ca,
                    chunk,
                } => {
                    let handler = self.domains[d].handler.as_mut().expect("callback domain");
                    handler.write(ca, &buf[off..off + chunk]);
                    off += chunk;
                }
            }
        }
        Ok(())
    }

    pub fn read_u32(
        &mut self,
        domain: DomainId,
        addr: u64,
        endian: Endian,
        req: MemPriv,
    ) -> Result<u32, AccessError> {
        let mut buf = [0u8; 4];
        self.read_bytes(domain, addr, &mut buf, req)?;
        Ok(match endian {
            Endian::Little => u32::from_le_bytes(buf),
            Endian::Big => u32::from_be_bytes(buf),
        })
    }

    pub fn read_u64(
        &mut self,
        domain: DomainId,
        addr: u64,
        endian: Endian,
        req: MemPriv,
    ) -> Result<u64, AccessError> {
        let mut buf = [0u8; 8];
        self.read_bytes(domain, addr, &mut buf, req)?;
        Ok(match endian {
            Endian::Little => u64::from_le_bytes(buf),
            Endian::Big => u64::from_be_bytes(buf),
        })
    }

    pub fn write_u32(
        &mut self,
        domain: DomainId,
        addr: u64,
        value: u32,
        endian: Endian,
        req: MemPriv,
    ) -> Result<(), AccessError> {
        let bytes = match endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.write_bytes(domain, addr, &bytes, req)
    }

    pub fn write_u64(
        &mut self,
        domain: DomainId,
        addr: u64,
        value: u64,
        endian: Endian,
        req: MemPriv,
    ) -> Result<(), AccessError> {
        let bytes = match endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.write_bytes(domain, addr, &bytes, req)
    }
}

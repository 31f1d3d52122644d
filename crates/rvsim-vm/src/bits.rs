//! Bit-layout codecs: page-table entries, virtual-address validity, the
//! packed simulated ASID, and PMP configuration bytes.
//!
//! Everything here is explicit shift-and-mask; nothing relies on host
//! struct layout.

use rvsim_mem::MemPriv;

use crate::mode::{BaseMode, Mode5};
use crate::tlb::{TlbEntry, TlbId};
use crate::{PAGE_SHIFT, PAGE_SIZE};

const PTE_V: u64 = 1 << 0;
const PTE_U: u64 = 1 << 4;
const PTE_G: u64 = 1 << 5;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;
const PTE_PRIV_SHIFT: u32 = 1;
const PTE_PRIV_MASK: u64 = 0x7;
/// PFN starts above the flag bits and the two RSW bits.
const PTE_PFN_SHIFT: u32 = 10;
/// Sv39 and Sv48 both carry a 44-bit PFN; Sv32 entries are read as 32 bits
/// so the same mask applies.
const PTE_PFN_MASK: u64 = (1 << 44) - 1;

/// A page-table entry of any supported mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub u64);

impl Pte {
    #[inline]
    pub fn valid(self) -> bool {
        self.0 & PTE_V != 0
    }

    /// R/W/X bits of the entry.
    #[inline]
    pub fn perms(self) -> MemPriv {
        MemPriv::from_bits_truncate(((self.0 >> PTE_PRIV_SHIFT) & PTE_PRIV_MASK) as u8)
    }

    /// Leaf entries carry at least one of R/W/X.
    #[inline]
    pub fn leaf(self) -> bool {
        !self.perms().is_empty()
    }

    /// The reserved R=0,W=1 encoding.
    #[inline]
    pub fn reserved_rw(self) -> bool {
        self.perms() & MemPriv::RW == MemPriv::W
    }

    #[inline]
    pub fn user(self) -> bool {
        self.0 & PTE_U != 0
    }

    #[inline]
    pub fn global(self) -> bool {
        self.0 & PTE_G != 0
    }

    #[inline]
    pub fn accessed(self) -> bool {
        self.0 & PTE_A != 0
    }

    #[inline]
    pub fn dirty(self) -> bool {
        self.0 & PTE_D != 0
    }

    #[inline]
    pub fn ppn(self) -> u64 {
        (self.0 >> PTE_PFN_SHIFT) & PTE_PFN_MASK
    }

    #[inline]
    pub fn set_accessed(&mut self) {
        self.0 |= PTE_A;
    }

    #[inline]
    pub fn set_dirty(&mut self) {
        self.0 |= PTE_D;
    }
}

/// VPN slice `level` of a virtual address.
#[inline]
pub fn vpn_slice(va: u64, level: u32, vpn_bits: u32) -> u64 {
    (va >> (PAGE_SHIFT + level * vpn_bits)) & ((1 << vpn_bits) - 1)
}

/// True when bits `[63:va_bits]` of `va` sign-extend bit `va_bits-1`.
#[inline]
pub fn va_sign_extends(va: u64, va_bits: u32) -> bool {
    let shifted = (va as i64) >> (va_bits - 1);
    shifted == 0 || shifted == -1
}

const SIM_ASID_HS_SHIFT: u32 = 0;
const SIM_ASID_VS_SHIFT: u32 = 16;
const SIM_VMID_SHIFT: u32 = 32;
const SIM_MXR_HS: u64 = 1 << 48;
const SIM_SUM_HS: u64 = 1 << 49;
const SIM_MXR_VS: u64 = 1 << 50;
const SIM_SUM_VS: u64 = 1 << 51;
const SIM_S1: u64 = 1 << 52;
const SIM_S2: u64 = 1 << 53;
const SIM_FIELD16: u64 = 0xffff;

/// Packed simulated ASID: the architectural ASIDs and VMID together with
/// the status bits that decide whether a cached translation may be reused.
///
/// Layout: `ASID_HS[15:0] ASID_VS[31:16] VMID[47:32] MXR_HS[48] SUM_HS[49]
/// MXR_VS[50] SUM_VS[51] S1[52] S2[53]`, remaining bits zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimAsid(pub u64);

impl SimAsid {
    #[allow(clippy::too_many_arguments)]
    pub fn pack(
        asid_hs: u32,
        asid_vs: u32,
        vmid: u32,
        mxr_hs: bool,
        sum_hs: bool,
        mxr_vs: bool,
        sum_vs: bool,
        s1: bool,
        s2: bool,
    ) -> Self {
        let mut v = 0u64;
        v |= (asid_hs as u64 & SIM_FIELD16) << SIM_ASID_HS_SHIFT;
        v |= (asid_vs as u64 & SIM_FIELD16) << SIM_ASID_VS_SHIFT;
        v |= (vmid as u64 & SIM_FIELD16) << SIM_VMID_SHIFT;
        if mxr_hs {
            v |= SIM_MXR_HS;
        }
        if sum_hs {
            v |= SIM_SUM_HS;
        }
        if mxr_vs {
            v |= SIM_MXR_VS;
        }
        if sum_vs {
            v |= SIM_SUM_VS;
        }
        if s1 {
            v |= SIM_S1;
        }
        if s2 {
            v |= SIM_S2;
        }
        SimAsid(v)
    }

    #[inline]
    pub fn asid_hs(self) -> u32 {
        ((self.0 >> SIM_ASID_HS_SHIFT) & SIM_FIELD16) as u32
    }

    #[inline]
    pub fn asid_vs(self) -> u32 {
        ((self.0 >> SIM_ASID_VS_SHIFT) & SIM_FIELD16) as u32
    }

    #[inline]
    pub fn vmid(self) -> u32 {
        ((self.0 >> SIM_VMID_SHIFT) & SIM_FIELD16) as u32
    }
}

/// Mask selecting the [`SimAsid`] bits that participate in equality for a
/// given entry used from a given mode.
///
/// `MXR_HS` always participates. The regime's ASID participates only for
/// non-global entries. SUM participates only for user-accessible entries
/// used from supervisor mode (never for stage-2 entries, which are always
/// treated as user mode). Virtualized callers additionally match VMID,
/// `MXR_VS` and both stage-enable bits.
pub fn entry_asid_mask(entry: &TlbEntry, mode: Mode5) -> u64 {
    let virt = mode.is_virtual();
    let mut mask = SIM_MXR_HS;

    if !entry.global {
        if virt {
            mask |= SIM_FIELD16 << SIM_ASID_VS_SHIFT;
        } else {
            mask |= SIM_FIELD16 << SIM_ASID_HS_SHIFT;
        }
    }

    if entry.tlb == TlbId::Vs2 {
        // Stage-2 entries ignore SUM.
    } else if entry.user && mode.base() == BaseMode::Supervisor {
        if virt {
            mask |= SIM_SUM_VS;
        } else {
            mask |= SIM_SUM_HS;
        }
    }

    if virt {
        mask |= SIM_FIELD16 << SIM_VMID_SHIFT;
        mask |= SIM_MXR_VS | SIM_S1 | SIM_S2;
    }

    mask
}

/// PMP region address-matching mode (pmpcfg `A` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmpMode {
    Off = 0,
    Tor = 1,
    Na4 = 2,
    Napot = 3,
}

const PMPCFG_MODE_SHIFT: u32 = 3;
const PMPCFG_MODE_MASK: u8 = 0x3;
const PMPCFG_LOCK: u8 = 1 << 7;
/// Writable bits of a pmpcfg byte; bits 5..6 are reserved.
pub const PMPCFG_WRITE_MASK: u8 = 0x9f;

/// One PMP configuration byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PmpCfg(pub u8);

impl PmpCfg {
    #[inline]
    pub fn perms(self) -> MemPriv {
        MemPriv::from_bits_truncate(self.0 & 0x7)
    }

    #[inline]
    pub fn mode(self) -> PmpMode {
        match (self.0 >> PMPCFG_MODE_SHIFT) & PMPCFG_MODE_MASK {
            0 => PmpMode::Off,
            1 => PmpMode::Tor,
            2 => PmpMode::Na4,
            _ => PmpMode::Napot,
        }
    }

    #[inline]
    pub fn locked(self) -> bool {
        self.0 & PMPCFG_LOCK != 0
    }

    /// Same byte with the mode field replaced.
    #[inline]
    pub fn with_mode(self, mode: PmpMode) -> PmpCfg {
        let cleared = self.0 & !(PMPCFG_MODE_MASK << PMPCFG_MODE_SHIFT);
        PmpCfg(cleared | ((mode as u8) << PMPCFG_MODE_SHIFT))
    }
}

/// Size of the page mapped by a leaf found at walk level `i`.
#[inline]
pub fn leaf_size(level: u32, vpn_bits: u32) -> u64 {
    1u64 << (level * vpn_bits + PAGE_SHIFT)
}

const _: () = assert!(PAGE_SIZE == 4096);

//! Per-regime TLB: a pool of cached translations with a range-table index.
//!
//! Entries are pool-allocated; deletion unlinks the range index and pushes
//! the slot onto an intrusive free list. Slot memory is only released when
//! the TLB itself is dropped.

use rvsim_mem::{MemPriv, RangeHandle, RangeTable};

use crate::bits::SimAsid;

/// The three translation regimes, each with its own TLB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlbId {
    /// Non-virtualized supervisor (HS) stage 1.
    Hs = 0,
    /// Virtualized stage 1 (guest virtual → guest physical).
    Vs1 = 1,
    /// Virtualized stage 2 (guest physical → supervisor physical).
    Vs2 = 2,
}

impl TlbId {
    pub const ALL: [TlbId; 3] = [TlbId::Hs, TlbId::Vs1, TlbId::Vs2];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(v: u8) -> Option<TlbId> {
        match v {
            0 => Some(TlbId::Hs),
            1 => Some(TlbId::Vs1),
            2 => Some(TlbId::Vs2),
            _ => None,
        }
    }
}

/// One cached translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    /// Inclusive virtual range; size is a power of two, at least one page.
    pub low_va: u64,
    pub high_va: u64,
    /// Physical address of `low_va`.
    pub pa: u64,
    /// Simulated ASID in force when the entry was mapped.
    pub sim_asid: SimAsid,
    /// Owning regime.
    pub tlb: TlbId,
    /// Per-base-mode bitmask of virtual domains this entry is aliased into.
    pub mapped: u8,
    /// R/W/X from the leaf PTE.
    pub perms: MemPriv,
    pub user: bool,
    pub global: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// Created by a non-architectural probe; reaped on the next lookup and
    /// never aliased into host mappings.
    pub artifact: bool,
    /// Back-reference into the range index while linked.
    pub(crate) lut: Option<RangeHandle>,
}

impl TlbEntry {
    /// Seed entry handed to a walker; `low_va` carries the address to
    /// translate.
    pub fn seed(va: u64) -> TlbEntry {
        TlbEntry {
            low_va: va,
            high_va: va,
            pa: 0,
            sim_asid: SimAsid::default(),
            tlb: TlbId::Hs,
            mapped: 0,
            perms: MemPriv::empty(),
            user: false,
            global: false,
            accessed: false,
            dirty: false,
            artifact: false,
            lut: None,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.high_va - self.low_va + 1
    }

    #[inline]
    pub fn high_pa(&self) -> u64 {
        self.pa + (self.high_va - self.low_va)
    }

    /// Offset added to a VA in range to obtain its PA.
    #[inline]
    pub fn va_to_pa(&self) -> u64 {
        self.pa.wrapping_sub(self.low_va)
    }

    /// Regime ASID recorded in the entry (0 for stage 2).
    pub fn asid(&self) -> u32 {
        match self.tlb {
            TlbId::Hs => self.sim_asid.asid_hs(),
            TlbId::Vs1 => self.sim_asid.asid_vs(),
            TlbId::Vs2 => 0,
        }
    }

    /// Whether the entry is tagged with a VMID.
    #[inline]
    pub fn has_vmid(&self) -> bool {
        matches!(self.tlb, TlbId::Vs1 | TlbId::Vs2)
    }

    pub fn vmid(&self) -> u32 {
        if self.has_vmid() {
            self.sim_asid.vmid()
        } else {
            0
        }
    }
}

#[derive(Debug)]
enum Slot {
    Used(TlbEntry),
    Free { next: Option<usize> },
}

/// TLB store for one regime.
#[derive(Debug)]
pub struct Tlb {
    lut: RangeTable<usize>,
    slots: Vec<Slot>,
    free: Option<usize>,
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            lut: RangeTable::new(),
            slots: Vec::new(),
            free: None,
        }
    }

    pub fn len(&self) -> usize {
        self.lut.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lut.is_empty()
    }

    pub fn get(&self, idx: usize) -> &TlbEntry {
        match &self.slots[idx] {
            Slot::Used(e) => e,
            Slot::Free { .. } => panic!("TLB slot {idx} is free"),
        }
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut TlbEntry {
        match &mut self.slots[idx] {
            Slot::Used(e) => e,
            Slot::Free { .. } => panic!("TLB slot {idx} is free"),
        }
    }

    /// Insert `entry`, reusing a free slot when one exists, and link it
    /// into the range index.
    pub fn insert(&mut self, mut entry: TlbEntry) -> usize {
        let idx = match self.free {
            Some(idx) => {
                let next = match self.slots[idx] {
                    Slot::Free { next } => next,
                    Slot::Used(_) => unreachable!("free list points at a used slot"),
                };
                self.free = next;
                idx
            }
            None => {
                self.slots.push(Slot::Free { next: None });
                self.slots.len() - 1
            }
        };
        entry.lut = Some(self.lut.insert(entry.low_va, entry.high_va, idx));
        self.slots[idx] = Slot::Used(entry);
        idx
    }

    /// Unlink `idx` from the range index and push its slot onto the free
    /// list, returning the entry contents.
    pub fn remove(&mut self, idx: usize) -> TlbEntry {
        let entry = match std::mem::replace(&mut self.slots[idx], Slot::Free { next: self.free }) {
            Slot::Used(e) => e,
            Slot::Free { .. } => panic!("TLB slot {idx} already free"),
        };
        self.free = Some(idx);
        if let Some(handle) = entry.lut {
            self.lut.remove(handle);
        }
        entry
    }

    /// First entry overlapping `[low, high]`, with its index.
    pub fn first_overlap(&self, low: u64, high: u64) -> Option<(RangeHandle, usize)> {
        let handle = self.lut.first_overlap(low, high)?;
        Some((handle, *self.lut.get(handle).expect("handle from scan")))
    }

    /// Next overlapping entry strictly after `prev` (which may have been
    /// removed in the meantime).
    pub fn next_overlap(&self, prev: RangeHandle, low: u64, high: u64) -> Option<(RangeHandle, usize)> {
        let handle = self.lut.next_overlap(prev, low, high)?;
        Some((handle, *self.lut.get(handle).expect("handle from scan")))
    }

    /// All linked entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &TlbEntry)> {
        self.lut.iter().map(move |(_, _, idx)| (*idx, self.get(*idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(low: u64, size: u64) -> TlbEntry {
        TlbEntry {
            low_va: low,
            high_va: low + size - 1,
            pa: 0x8000_0000,
            ..TlbEntry::seed(low)
        }
    }

    #[test]
    fn free_list_reuses_slots() {
        let mut tlb = Tlb::new();
        let a = tlb.insert(entry(0x1000, 0x1000));
        let b = tlb.insert(entry(0x2000, 0x1000));
        assert_eq!(tlb.slots.len(), 2);

        tlb.remove(a);
        tlb.remove(b);
        assert!(tlb.is_empty());

        // LIFO reuse, no new slot allocation.
        let c = tlb.insert(entry(0x3000, 0x1000));
        assert_eq!(c, b);
        let d = tlb.insert(entry(0x4000, 0x1000));
        assert_eq!(d, a);
        assert_eq!(tlb.slots.len(), 2);
    }

    #[test]
    fn removed_entries_leave_the_index() {
        let mut tlb = Tlb::new();
        let a = tlb.insert(entry(0x1000, 0x1000));
        assert!(tlb.first_overlap(0x1800, 0x1800).is_some());
        tlb.remove(a);
        assert!(tlb.first_overlap(0x1800, 0x1800).is_none());
    }

    #[test]
    fn superpage_point_lookup() {
        let mut tlb = Tlb::new();
        tlb.insert(entry(0x4000_0000, 0x4000_0000)); // 1 GiB
        let (_, idx) = tlb.first_overlap(0x5555_5555, 0x5555_5555).unwrap();
        assert_eq!(tlb.get(idx).low_va, 0x4000_0000);
    }

    #[test]
    fn entry_geometry() {
        let e = entry(0x8000_0000, 0x20_0000);
        assert_eq!(e.size(), 0x20_0000);
        assert_eq!(e.high_pa(), 0x8000_0000 + 0x20_0000 - 1);
        assert_eq!(e.va_to_pa(), 0);
        let e2 = TlbEntry {
            low_va: 0x4000,
            high_va: 0x4fff,
            pa: 0x1_0000,
            ..TlbEntry::seed(0)
        };
        assert_eq!(e2.va_to_pa().wrapping_add(0x4321), 0x1_0321);
    }
}

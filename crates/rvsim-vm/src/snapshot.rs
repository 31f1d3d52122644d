//! Save/restore of TLB contents.
//!
//! Each TLB streams as a sequence of little-endian length-prefixed entry
//! records followed by a zero-length terminator. Mapping state (`mapped`,
//! the range-index back-reference) is not persisted; restore reinserts the
//! entries unmapped, and the next access re-establishes aliases.

use std::io::{Read, Write};

use rvsim_mem::{MemPriv, MemorySpace, PhysMemory};
use thiserror::Error;

use crate::bits::SimAsid;
use crate::tlb::{TlbEntry, TlbId};
use crate::vm::{MatchMode, Vm};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt TLB snapshot: {0}")]
    Corrupt(&'static str),
}

const TLB_MAGIC: &[u8; 8] = b"RVSMTLB\x01";
/// low_va + high_va + pa + sim_asid + tlb + perms + flags.
const ENTRY_LEN: u32 = 8 * 4 + 3;

const FLAG_U: u8 = 1 << 0;
const FLAG_G: u8 = 1 << 1;
const FLAG_A: u8 = 1 << 2;
const FLAG_D: u8 = 1 << 3;

trait WriteLeExt: Write {
    fn write_u32_le(&mut self, v: u32) -> Result<(), SnapshotError> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<(), SnapshotError> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

trait ReadLeExt: Read {
    fn read_u32_le(&mut self) -> Result<u32, SnapshotError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64, SnapshotError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

fn write_entry<W: Write>(w: &mut W, entry: &TlbEntry) -> Result<(), SnapshotError> {
    w.write_u32_le(ENTRY_LEN)?;
    w.write_u64_le(entry.low_va)?;
    w.write_u64_le(entry.high_va)?;
    w.write_u64_le(entry.pa)?;
    w.write_u64_le(entry.sim_asid.0)?;
    w.write_all(&[entry.tlb as u8])?;
    w.write_all(&[entry.perms.rwx().bits()])?;
    let mut flags = 0u8;
    if entry.user {
        flags |= FLAG_U;
    }
    if entry.global {
        flags |= FLAG_G;
    }
    if entry.accessed {
        flags |= FLAG_A;
    }
    if entry.dirty {
        flags |= FLAG_D;
    }
    w.write_all(&[flags])?;
    Ok(())
}

fn read_entry<R: Read>(r: &mut R) -> Result<TlbEntry, SnapshotError> {
    let low_va = r.read_u64_le()?;
    let high_va = r.read_u64_le()?;
    let pa = r.read_u64_le()?;
    let sim_asid = SimAsid(r.read_u64_le()?);
    let tlb =
        TlbId::from_u8(r.read_u8()?).ok_or(SnapshotError::Corrupt("invalid TLB identifier"))?;
    let perms = MemPriv::from_bits_truncate(r.read_u8()?) & MemPriv::RWX;
    let flags = r.read_u8()?;

    if low_va > high_va {
        return Err(SnapshotError::Corrupt("inverted entry range"));
    }

    Ok(TlbEntry {
        low_va,
        high_va,
        pa,
        sim_asid,
        tlb,
        mapped: 0,
        perms,
        user: flags & FLAG_U != 0,
        global: flags & FLAG_G != 0,
        accessed: flags & FLAG_A != 0,
        dirty: flags & FLAG_D != 0,
        artifact: false,
        lut: None,
    })
}

impl Vm {
    /// Stream the contents of every TLB. Artifact entries are skipped;
    /// mapping state is not persisted.
    pub fn save_tlbs<W: Write>(&self, w: &mut W) -> Result<(), SnapshotError> {
        w.write_all(TLB_MAGIC)?;
        for id in TlbId::ALL {
            if !self.has_tlb(id) {
                continue;
            }
            for (_, entry) in self.tlb(id).iter() {
                if entry.artifact {
                    continue;
                }
                write_entry(w, entry)?;
            }
            // Terminator record.
            w.write_u32_le(0)?;
        }
        Ok(())
    }

    /// Restore TLB contents saved by [`Vm::save_tlbs`]. Each TLB is fully
    /// invalidated first, then the saved entries are reinserted unmapped.
    pub fn restore_tlbs<R: Read, B: PhysMemory>(
        &mut self,
        space: &mut MemorySpace<B>,
        r: &mut R,
    ) -> Result<(), SnapshotError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != TLB_MAGIC {
            return Err(SnapshotError::Corrupt("bad magic"));
        }

        for id in TlbId::ALL {
            if !self.has_tlb(id) {
                continue;
            }
            self.invalidate_range(space, id, 0, u64::MAX, MatchMode::Any, 0);
            loop {
                let len = r.read_u32_le()?;
                if len == 0 {
                    break;
                }
                if len != ENTRY_LEN {
                    return Err(SnapshotError::Corrupt("unexpected record length"));
                }
                let entry = read_entry(r)?;
                self.tlb_mut(id).insert(entry);
            }
        }
        Ok(())
    }
}

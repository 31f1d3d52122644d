//! Physical backing storage behind the domain stack.

use thiserror::Error;

/// Byte order of a multi-byte access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Raised when backing storage cannot satisfy an access (bus error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bus error at physical address {addr:#x}")]
pub struct BusFault {
    pub addr: u64,
}

/// Backing storage for the root of a domain stack.
///
/// Implementations decide how sparse or dense the guest address space is;
/// out-of-range accesses report a [`BusFault`] rather than panicking.
pub trait PhysMemory {
    fn size(&self) -> u64;
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), BusFault>;
    fn write(&mut self, addr: u64, buf: &[u8]) -> Result<(), BusFault>;
}

/// Flat, fully populated guest memory. Primarily a test backend.
#[derive(Debug, Clone)]
pub struct DenseMemory {
    bytes: Vec<u8>,
}

impl DenseMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    fn span(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, BusFault> {
        let start = usize::try_from(addr).map_err(|_| BusFault { addr })?;
        let end = start.checked_add(len).ok_or(BusFault { addr })?;
        if end > self.bytes.len() {
            return Err(BusFault { addr });
        }
        Ok(start..end)
    }

    pub fn read_u64_at(&self, addr: u64) -> u64 {
        let start = addr as usize;
        u64::from_le_bytes(self.bytes[start..start + 8].try_into().unwrap())
    }

    pub fn write_u64_at(&mut self, addr: u64, value: u64) {
        let start = addr as usize;
        self.bytes[start..start + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u32_at(&self, addr: u64) -> u32 {
        let start = addr as usize;
        u32::from_le_bytes(self.bytes[start..start + 4].try_into().unwrap())
    }

    pub fn write_u32_at(&mut self, addr: u64, value: u32) {
        let start = addr as usize;
        self.bytes[start..start + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Page-granular sparse guest memory over a large address space.
#[derive(Debug, Clone, Default)]
pub struct SparseMemory {
    pages: std::collections::HashMap<u64, Box<[u8; SPARSE_PAGE]>>,
    size: u64,
}

const SPARSE_PAGE: usize = 4096;

impl SparseMemory {
    /// Sparse memory covering `[0, size)`; untouched pages read as zero.
    pub fn new(size: u64) -> Self {
        Self {
            pages: std::collections::HashMap::new(),
            size,
        }
    }

    pub fn read_u64_at(&mut self, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf).expect("address in range");
        u64::from_le_bytes(buf)
    }

    pub fn write_u64_at(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes()).expect("address in range");
    }

    pub fn read_u32_at(&mut self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf).expect("address in range");
        u32::from_le_bytes(buf)
    }

    pub fn write_u32_at(&mut self, addr: u64, value: u32) {
        self.write(addr, &value.to_le_bytes()).expect("address in range");
    }
}

impl PhysMemory for SparseMemory {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), BusFault> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = addr
            .checked_add(buf.len() as u64 - 1)
            .ok_or(BusFault { addr })?;
        if end >= self.size {
            return Err(BusFault { addr });
        }
        for (i, slot) in buf.iter_mut().enumerate() {
            let a = addr + i as u64;
            let page = a / SPARSE_PAGE as u64;
            let off = (a % SPARSE_PAGE as u64) as usize;
            *slot = self.pages.get(&page).map_or(0, |p| p[off]);
        }
        Ok(())
    }

    fn write(&mut self, addr: u64, buf: &[u8]) -> Result<(), BusFault> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = addr
            .checked_add(buf.len() as u64 - 1)
            .ok_or(BusFault { addr })?;
        if end >= self.size {
            return Err(BusFault { addr });
        }
        for (i, byte) in buf.iter().copied().enumerate() {
            let a = addr + i as u64;
            let page = a / SPARSE_PAGE as u64;
            let off = (a % SPARSE_PAGE as u64) as usize;
            let p = self
                .pages
                .entry(page)
                .or_insert_with(|| Box::new([0; SPARSE_PAGE]));
            p[off] = byte;
        }
        Ok(())
    }
}

impl PhysMemory for DenseMemory {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), BusFault> {
        let span = self.span(addr, buf.len())?;
        buf.copy_from_slice(&self.bytes[span]);
        Ok(())
    }

    fn write(&mut self, addr: u64, buf: &[u8]) -> Result<(), BusFault> {
        let span = self.span(addr, buf.len())?;
        self.bytes[span].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_is_a_bus_fault() {
        let mut mem = DenseMemory::new(0x1000);
        let mut buf = [0u8; 8];
        assert!(mem.read(0xff8, &mut buf).is_ok());
        assert_eq!(mem.read(0xffc, &mut buf), Err(BusFault { addr: 0xffc }));
        assert_eq!(mem.write(0x1000, &buf), Err(BusFault { addr: 0x1000 }));
    }
}

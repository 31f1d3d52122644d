use bitflags::bitflags;

bitflags! {
    /// Access privilege set attached to mappings, protection ranges and
    /// access requests.
    ///
    /// `USER` and `ALIGN` are not checked by the domain layer; they ride
    /// along so that two-stage translation can merge them separately from
    /// the R/W/X bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemPriv: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        const USER = 1 << 3;
        const ALIGN = 1 << 4;

        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl MemPriv {
    /// The R/W/X subset of this privilege set.
    #[inline]
    pub fn rwx(self) -> MemPriv {
        self & MemPriv::RWX
    }

    /// `"rwx"`-style rendering used by debug dumps.
    pub fn name(self) -> &'static str {
        const NAMES: [&str; 8] = ["---", "r--", "-w-", "rw-", "--x", "r-x", "-wx", "rwx"];
        NAMES[(self.bits() & 7) as usize]
    }
}

/// How [`crate::MemorySpace::protect_memory`] combines the new privilege
/// with what a range already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectOp {
    /// Replace the privilege of the range.
    Set,
    /// Remove the given bits from the range.
    Sub,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_rwx_bits() {
        assert_eq!(MemPriv::empty().name(), "---");
        assert_eq!(MemPriv::R.name(), "r--");
        assert_eq!(MemPriv::RW.name(), "rw-");
        assert_eq!(MemPriv::RWX.name(), "rwx");
        assert_eq!((MemPriv::W | MemPriv::X).name(), "-wx");
        // Marker bits do not change the rendering.
        assert_eq!((MemPriv::RWX | MemPriv::USER).name(), "rwx");
    }
}

//! Mirror of the CSR fields the translation path consumes.
//!
//! The register file itself lives in the surrounding processor; it refreshes
//! this view whenever one of the mirrored registers or the privilege mode
//! changes, the same way the core keeps its control-register mirror in sync
//! before touching the MMU.

use rvsim_mem::Endian;

use crate::mode::{BaseMode, Mode5};

/// Translation modes encoded in `satp.MODE` / `vsatp.MODE` / `hgatp.MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaMode {
    Sv32,
    Sv39,
    Sv48,
}

const SATP64_MODE_SHIFT: u32 = 60;
const SATP64_ASID_SHIFT: u32 = 44;
const SATP64_ASID_MASK: u64 = 0xffff;
const SATP64_PPN_MASK: u64 = (1 << 44) - 1;

const SATP32_ASID_SHIFT: u32 = 22;
const SATP32_ASID_MASK: u64 = 0x1ff;
const SATP32_PPN_MASK: u64 = (1 << 22) - 1;

const HGATP64_VMID_SHIFT: u32 = 44;
const HGATP64_VMID_MASK: u64 = 0x3fff;
const HGATP32_VMID_SHIFT: u32 = 22;
const HGATP32_VMID_MASK: u64 = 0x7f;

const MSTATUS_UBE: u64 = 1 << 6;
const MSTATUS_MPP_SHIFT: u32 = 11;
const MSTATUS_MPRV: u64 = 1 << 17;
const MSTATUS_SUM: u64 = 1 << 18;
const MSTATUS_MXR: u64 = 1 << 19;
const MSTATUS64_SBE: u64 = 1 << 36;
const MSTATUS64_MBE: u64 = 1 << 37;
const MSTATUS64_MPV: u64 = 1 << 39;
const MSTATUSH_SBE: u64 = 1 << 4;
const MSTATUSH_MBE: u64 = 1 << 5;
const MSTATUSH_MPV: u64 = 1 << 7;

const DCSR_MPRVEN: u32 = 1 << 4;

/// Snapshot of the architectural state translation depends on.
#[derive(Debug, Clone)]
pub struct CsrView {
    pub xlen64: bool,
    pub satp: u64,
    pub vsatp: u64,
    pub hgatp: u64,
    pub mstatus: u64,
    pub mstatush: u64,
    pub vsstatus: u64,
    pub dcsr: u32,
    /// Current privilege mode, including virtualization.
    pub mode: Mode5,
    pub debug_mode: bool,
}

impl Default for CsrView {
    fn default() -> Self {
        Self {
            xlen64: true,
            satp: 0,
            vsatp: 0,
            hgatp: 0,
            mstatus: 0,
            mstatush: 0,
            vsstatus: 0,
            dcsr: 0,
            mode: Mode5::Machine,
            debug_mode: false,
        }
    }
}

impl CsrView {
    fn atp_mode_raw(&self, atp: u64) -> u64 {
        if self.xlen64 {
            atp >> SATP64_MODE_SHIFT
        } else {
            (atp >> 31) & 1
        }
    }

    fn atp_va_mode(&self, atp: u64) -> Option<VaMode> {
        match self.atp_mode_raw(atp) {
            1 if !self.xlen64 => Some(VaMode::Sv32),
            8 if self.xlen64 => Some(VaMode::Sv39),
            9 if self.xlen64 => Some(VaMode::Sv48),
            _ => None,
        }
    }

    fn atp_asid(&self, atp: u64) -> u32 {
        if self.xlen64 {
            ((atp >> SATP64_ASID_SHIFT) & SATP64_ASID_MASK) as u32
        } else {
            ((atp >> SATP32_ASID_SHIFT) & SATP32_ASID_MASK) as u32
        }
    }

    fn atp_ppn(&self, atp: u64) -> u64 {
        if self.xlen64 {
            atp & SATP64_PPN_MASK
        } else {
            atp & SATP32_PPN_MASK
        }
    }

    pub fn satp_mode_enabled(&self) -> bool {
        self.atp_mode_raw(self.satp) != 0
    }

    pub fn vsatp_mode_enabled(&self) -> bool {
        self.atp_mode_raw(self.vsatp) != 0
    }

    pub fn hgatp_mode_enabled(&self) -> bool {
        self.atp_mode_raw(self.hgatp) != 0
    }

    /// Stage-1 translation mode for the current virtualization state.
    pub fn stage1_va_mode(&self, virt: bool) -> Option<VaMode> {
        let atp = if virt { self.vsatp } else { self.satp };
        self.atp_va_mode(atp)
    }

    pub fn stage2_va_mode(&self) -> Option<VaMode> {
        self.atp_va_mode(self.hgatp)
    }

    pub fn satp_asid(&self) -> u32 {
        self.atp_asid(self.satp)
    }

    pub fn vsatp_asid(&self) -> u32 {
        self.atp_asid(self.vsatp)
    }

    pub fn satp_ppn(&self) -> u64 {
        self.atp_ppn(self.satp)
    }

    pub fn vsatp_ppn(&self) -> u64 {
        self.atp_ppn(self.vsatp)
    }

    pub fn hgatp_ppn(&self) -> u64 {
        self.atp_ppn(self.hgatp)
    }

    pub fn hgatp_vmid(&self) -> u32 {
        if self.xlen64 {
            ((self.hgatp >> HGATP64_VMID_SHIFT) & HGATP64_VMID_MASK) as u32
        } else {
            ((self.hgatp >> HGATP32_VMID_SHIFT) & HGATP32_VMID_MASK) as u32
        }
    }

    /// Width of the `satp.ASID` field at the current XLEN (not the
    /// implemented width).
    pub fn satp_asid_field_mask(&self) -> u32 {
        if self.xlen64 {
            SATP64_ASID_MASK as u32
        } else {
            SATP32_ASID_MASK as u32
        }
    }

    pub fn mstatus_mxr(&self) -> bool {
        self.mstatus & MSTATUS_MXR != 0
    }

    pub fn mstatus_sum(&self) -> bool {
        self.mstatus & MSTATUS_SUM != 0
    }

    pub fn mstatus_mprv(&self) -> bool {
        self.mstatus & MSTATUS_MPRV != 0
    }

    pub fn mstatus_mpp(&self) -> BaseMode {
        match (self.mstatus >> MSTATUS_MPP_SHIFT) & 3 {
            0 => BaseMode::User,
            1 => BaseMode::Supervisor,
            _ => BaseMode::Machine,
        }
    }

    /// `MPV` lives in `mstatus` on RV64 and in `mstatush` on RV32.
    pub fn mpv(&self) -> bool {
        if self.xlen64 {
            self.mstatus & MSTATUS64_MPV != 0
        } else {
            self.mstatush & MSTATUSH_MPV != 0
        }
    }

    pub fn vsstatus_mxr(&self) -> bool {
        self.vsstatus & MSTATUS_MXR != 0
    }

    pub fn vsstatus_sum(&self) -> bool {
        self.vsstatus & MSTATUS_SUM != 0
    }

    pub fn dcsr_mprven(&self) -> bool {
        self.dcsr & DCSR_MPRVEN != 0
    }

    /// Data endianness in force for the given mode.
    pub fn data_endian(&self, mode: Mode5) -> Endian {
        let big = match mode.base() {
            BaseMode::Machine => {
                if self.xlen64 {
                    self.mstatus & MSTATUS64_MBE != 0
                } else {
                    self.mstatush & MSTATUSH_MBE != 0
                }
            }
            BaseMode::Supervisor => {
                if self.xlen64 {
                    self.mstatus & MSTATUS64_SBE != 0
                } else {
                    self.mstatush & MSTATUSH_SBE != 0
                }
            }
            BaseMode::User => self.mstatus & MSTATUS_UBE != 0,
        };
        if big {
            Endian::Big
        } else {
            Endian::Little
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satp_fields_rv64() {
        let csr = CsrView {
            satp: (8u64 << 60) | (0x42u64 << 44) | 0x8_0000,
            ..CsrView::default()
        };
        assert_eq!(csr.stage1_va_mode(false), Some(VaMode::Sv39));
        assert_eq!(csr.satp_asid(), 0x42);
        assert_eq!(csr.satp_ppn(), 0x8_0000);
    }

    #[test]
    fn satp_fields_rv32() {
        let csr = CsrView {
            xlen64: false,
            satp: (1u64 << 31) | (0x55u64 << 22) | 0x3ff,
            ..CsrView::default()
        };
        assert_eq!(csr.stage1_va_mode(false), Some(VaMode::Sv32));
        assert_eq!(csr.satp_asid(), 0x55);
        assert_eq!(csr.satp_ppn(), 0x3ff);
    }

    #[test]
    fn mpv_follows_xlen() {
        let mut csr = CsrView {
            mstatus: MSTATUS64_MPV,
            ..CsrView::default()
        };
        assert!(csr.mpv());
        csr.xlen64 = false;
        assert!(!csr.mpv());
        csr.mstatush = MSTATUSH_MPV;
        assert!(csr.mpv());
    }
}

//! PMP register bank, region geometry and refinement.

use pretty_assertions::assert_eq;

use super::helpers::*;
use crate::exception::{AccessAttrs, ExceptionKind};
use crate::mode::Mode5;

const TOR: u8 = 1 << 3;
const NA4: u8 = 2 << 3;
const NAPOT: u8 = 3 << 3;
const LOCK: u8 = 1 << 7;
const R: u8 = 1;
const W: u8 = 2;
const X: u8 = 4;

fn m_mode(sim: &mut Sim) {
    sim.vm.csr.mode = Mode5::Machine;
    sim.sync_asid();
}

fn s_mode(sim: &mut Sim) {
    sim.vm.csr.mode = Mode5::Supervisor;
    sim.sync_asid();
}

#[test]
fn tor_region_grants_read_only() {
    let mut sim = Sim::new(pmp_config(4, 0));
    sim.vm.write_pmpaddr(&mut sim.space, 0, 0x40, AccessAttrs::ARCH);
    sim.vm.write_pmpaddr(&mut sim.space, 1, 0x80, AccessAttrs::ARCH);
    // Region 1: TOR over [0x100, 0x1ff], read-only, unlocked.
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(TOR | R) << 8, AccessAttrs::ARCH);

    s_mode(&mut sim);
    let domain = sim.phys_data_domain();

    assert!(sim.read(domain, 0x180, 4).is_ok());
    let err = sim.write(domain, 0x180, &[0; 4]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::StoreAmoAccessFault);

    // Outside the region supervisor has nothing.
    let err = sim.read(domain, 0x240, 4).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::LoadAccessFault);

    // Machine mode passes: no matching region means full access.
    m_mode(&mut sim);
    let domain = sim.phys_data_domain();
    assert!(sim.read(domain, 0x240, 4).is_ok());
    assert!(sim.write(domain, 0x240, &[1; 4]).is_ok());
}

#[test]
fn napot_grain_readback_and_bounds() {
    let mut sim = Sim::new(pmp_config(4, 3));
    // Low G-1 bits are dropped on write.
    sim.vm.write_pmpaddr(&mut sim.space, 0, 0x0f, AccessAttrs::ARCH);
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(NAPOT | R | W | X), AccessAttrs::ARCH);

    // NAPOT read-back forces bits [G-2:0] to ones: 0x0c | 0x3.
    assert_eq!(sim.vm.read_pmpaddr(0), 0x0f);

    // Region is [0x00, 0x7f]; supervisor gets RWX inside, nothing beyond.
    s_mode(&mut sim);
    let domain = sim.phys_data_domain();
    assert!(sim.read(domain, 0x10, 4).is_ok());
    assert!(sim.write(domain, 0x70, &[0; 4]).is_ok());
    assert!(sim.read(domain, 0x80, 4).is_err());

    // OFF/TOR read-back forces bits [G-1:0] to zeros instead.
    sim.vm.write_pmpcfg(&mut sim.space, 0, 0, AccessAttrs::ARCH);
    assert_eq!(sim.vm.read_pmpaddr(0), 0x08);
}

#[test]
fn na4_is_unselectable_with_nonzero_grain() {
    let mut sim = Sim::new(pmp_config(4, 1));
    // NA4 write keeps the previous (OFF) mode; everything else sticks.
    let result = sim
        .vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(NA4 | R), AccessAttrs::ARCH);
    assert_eq!(result, u64::from(R));
    assert_eq!(sim.vm.read_pmpcfg(0), u64::from(R));

    // With TOR configured first, a later NA4 write keeps TOR.
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(TOR | R), AccessAttrs::ARCH);
    let result = sim
        .vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(NA4 | R | W), AccessAttrs::ARCH);
    assert_eq!(result, u64::from(TOR | R | W));
}

#[test]
fn reserved_cfg_bits_read_as_zero() {
    let mut sim = Sim::new(pmp_config(4, 0));
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, 0x60 | u64::from(R), AccessAttrs::ARCH);
    assert_eq!(sim.vm.read_pmpcfg(0), u64::from(R));
}

#[test]
fn locked_cfg_byte_rejects_writes_except_artifact() {
    let mut sim = Sim::new(pmp_config(4, 0));
    sim.vm.write_pmpaddr(&mut sim.space, 0, 0x10, AccessAttrs::ARCH);
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(LOCK | NAPOT | R), AccessAttrs::ARCH);

    // Architectural writes to a locked byte are dropped.
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(NAPOT | R | W), AccessAttrs::ARCH);
    assert_eq!(sim.vm.read_pmpcfg(0), u64::from(LOCK | NAPOT | R));
    sim.vm.write_pmpaddr(&mut sim.space, 0, 0x20, AccessAttrs::ARCH);
    assert_eq!(sim.vm.read_pmpaddr(0), 0x10);

    // Debugger writes bypass the lock.
    sim.vm.write_pmpaddr(&mut sim.space, 0, 0x20, AccessAttrs::ARTIFACT);
    assert_eq!(sim.vm.read_pmpaddr(0), 0x20);
}

#[test]
fn locked_tor_successor_freezes_previous_address() {
    let mut sim = Sim::new(pmp_config(4, 0));
    sim.vm.write_pmpaddr(&mut sim.space, 0, 0x40, AccessAttrs::ARCH);
    sim.vm.write_pmpaddr(&mut sim.space, 1, 0x80, AccessAttrs::ARCH);
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(LOCK | TOR | R) << 8, AccessAttrs::ARCH);

    // pmpaddr0 is the base of the locked TOR region above it.
    sim.vm.write_pmpaddr(&mut sim.space, 0, 0x20, AccessAttrs::ARCH);
    assert_eq!(sim.vm.read_pmpaddr(0), 0x40);
}

#[test]
fn locked_region_clamps_machine_mode() {
    let mut sim = Sim::new(pmp_config(4, 0));
    sim.vm.write_pmpaddr(&mut sim.space, 0, 0x10, AccessAttrs::ARCH);
    // Locked NAPOT read-only region [0x40, 0x47].
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(LOCK | NAPOT | R), AccessAttrs::ARCH);

    m_mode(&mut sim);
    let domain = sim.phys_data_domain();
    assert!(sim.read(domain, 0x40, 4).is_ok());
    let err = sim.write(domain, 0x40, &[0; 4]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::StoreAmoAccessFault);
}

#[test]
fn straddling_access_across_region_boundary_is_caught() {
    let mut sim = Sim::new(pmp_config(4, 0));
    // NA4 region [0x44, 0x47].
    sim.vm.write_pmpaddr(&mut sim.space, 0, 0x11, AccessAttrs::ARCH);
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(NA4 | R | W | X), AccessAttrs::ARCH);

    m_mode(&mut sim);
    let domain = sim.phys_data_domain();

    // Machine access below the region is granted up to its boundary.
    assert!(sim.read(domain, 0x20, 4).is_ok());
    // An access straddling into the region cannot be served by a single
    // window and faults.
    let err = sim.read(domain, 0x40, 8).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::LoadAccessFault);
    // The region itself works.
    assert!(sim.read(domain, 0x44, 4).is_ok());
}

#[test]
fn rv64_packs_eight_cfg_bytes_per_even_register() {
    let mut sim = Sim::new(pmp_config(16, 0));
    let value = 0x000a_0908_0302_0100u64 | (u64::from(NAPOT | R) << 56);
    sim.vm.write_pmpcfg(&mut sim.space, 0, value, AccessAttrs::ARCH);

    // Byte 7 of pmpcfg0 is region 7.
    assert_eq!(sim.vm.read_pmpcfg(0) >> 56, u64::from(NAPOT | R));

    // pmpcfg2 covers regions 8..16.
    sim.vm
        .write_pmpcfg(&mut sim.space, 2, u64::from(TOR | R | W), AccessAttrs::ARCH);
    assert_eq!(sim.vm.read_pmpcfg(2) & 0xff, u64::from(TOR | R | W));
}

#[test]
fn reset_clears_every_region() {
    let mut sim = Sim::new(pmp_config(4, 0));
    sim.vm.write_pmpaddr(&mut sim.space, 0, 0x10, AccessAttrs::ARCH);
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(NAPOT | R | W | X), AccessAttrs::ARCH);

    s_mode(&mut sim);
    let domain = sim.phys_data_domain();
    assert!(sim.read(domain, 0x40, 4).is_ok());

    sim.vm.reset_pmp(&mut sim.space);
    assert_eq!(sim.vm.read_pmpcfg(0), 0);
    assert_eq!(sim.vm.read_pmpaddr(0), 0);

    // The stale grant is gone with the region.
    assert!(sim.read(domain, 0x40, 4).is_err());
}

#[test]
fn pma_hook_veto_arms_access_fault() {
    use crate::exception::AccessFaultCause;
    use crate::ext::PmaCheck;
    use crate::MemPriv;

    struct DeviceHole;
    impl PmaCheck for DeviceHole {
        fn pma_check(&mut self, _mode: Mode5, _req: MemPriv, low: u64, high: u64) -> bool {
            // Veto anything touching [0x1000, 0x10ff].
            !(low <= 0x10ff && high >= 0x1000)
        }
    }

    let mut sim = Sim::new(pmp_config(4, 0));
    sim.vm.register_pma_check(Box::new(DeviceHole));
    // Blanket PMP grant so only the PMA hook can object.
    sim.vm
        .write_pmpaddr(&mut sim.space, 0, u64::MAX >> 10, AccessAttrs::ARCH);
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(NAPOT | R | W | X), AccessAttrs::ARCH);

    s_mode(&mut sim);
    let domain = sim.phys_data_domain();

    // The veto fires on the refinement of the first touching access.
    let err = sim.read(domain, 0x1000, 4).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::LoadAccessFault);
    assert_eq!(sim.vm.access_fault_cause(), AccessFaultCause::Pma);
}

#[test]
fn ptw_traffic_is_subject_to_pmp() {
    let mut sim = Sim::new(pmp_config(4, 0));
    let root = 0x8000_0000u64;
    let mut pt = PageTables::sv39(root);
    pt.map(sim.mem(), 0x4000, 0x1_0000, 0, RWX_AD);
    sim.mem().write_u64_at(0x1_0000, 0x42);

    // Grant RWX over all of memory via one NAPOT region so both the walk
    // and the data access pass.
    sim.vm
        .write_pmpaddr(&mut sim.space, 0, u64::MAX >> 10, AccessAttrs::ARCH);
    sim.vm
        .write_pmpcfg(&mut sim.space, 0, u64::from(NAPOT | R | W | X), AccessAttrs::ARCH);

    enter_sv39(&mut sim, root, 0, Mode5::Supervisor);
    let domain = sim.virt_data_domain();
    assert_eq!(sim.read_u64(domain, 0x4000).unwrap(), 0x42);

    // With the region removed, the page-table read itself is refused and
    // the access reports an access fault, not a page fault.
    sim.vm.invalidate_all(&mut sim.space);
    sim.vm.reset_pmp(&mut sim.space);
    let err = sim.read(domain, 0x4000, 4).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::LoadAccessFault);
}

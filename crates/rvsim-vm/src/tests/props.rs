//! Property-based invariants over translation and the PMP register bank.

use proptest::prelude::*;

use super::helpers::*;
use crate::mode::Mode5;
use crate::tlb::TlbId;
use crate::{VmConfig, PAGE_SIZE};

const ROOT: u64 = 0x8000_0000;

prop_compose! {
    /// A random Sv39 mapping: leaf level, page-aligned VA inside the low
    /// canonical half, suitably aligned PA.
    fn arb_mapping()(
        level in 0u32..3,
        vpn in 0u64..(1 << 20),
        ppn in 1u64..(1 << 10),
    ) -> (u64, u64, u32) {
        let size = PAGE_SIZE << (9 * level);
        // Keep VAs in the low half so sign extension holds, and both
        // addresses aligned to the leaf size.
        let va = (vpn << 12) % (1u64 << 37);
        let va = va & !(size - 1);
        let pa = (ppn << 30) & !(size - 1);
        (va, pa, level)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Successful translations always produce a power-of-two range, at
    /// least one page, aligned on both sides, with matching offsets.
    #[test]
    fn translation_geometry_invariants(mappings in prop::collection::vec(arb_mapping(), 1..6)) {
        let mut sim = Sim::new(sv_config());
        let mut pt = PageTables::sv39(ROOT);
        for (va, pa, level) in &mappings {
            pt.map(sim.mem(), *va, *pa, *level, RWX_AD);
        }
        enter_sv39(&mut sim, ROOT, 0, Mode5::Supervisor);
        let domain = sim.virt_data_domain();

        // Later mappings may shadow earlier ones; only successful
        // translations are constrained.
        for (va, _, _) in &mappings {
            let _ = sim.read(domain, *va, 4);
        }

        for (_, entry) in sim.vm.tlb(TlbId::Hs).iter() {
            let size = entry.size();
            prop_assert!(size.is_power_of_two());
            prop_assert!(size >= PAGE_SIZE);
            prop_assert_eq!(entry.low_va % size, 0);
            prop_assert_eq!(entry.pa % size, 0);
        }
    }

    /// No two live entries in one TLB overlap under the same ASID key.
    #[test]
    fn no_overlapping_entries_for_one_asid(mappings in prop::collection::vec(arb_mapping(), 1..6)) {
        let mut sim = Sim::new(sv_config());
        let mut pt = PageTables::sv39(ROOT);
        for (va, pa, level) in &mappings {
            pt.map(sim.mem(), *va, *pa, *level, RWX_AD);
        }
        enter_sv39(&mut sim, ROOT, 3, Mode5::Supervisor);
        let domain = sim.virt_data_domain();
        for (va, _, _) in &mappings {
            let _ = sim.read(domain, *va, 4);
        }

        let entries: Vec<_> = sim.vm.tlb(TlbId::Hs).iter().map(|(_, e)| *e).collect();
        for (i, a) in entries.iter().enumerate() {
            for b in entries.iter().skip(i + 1) {
                let overlap = a.low_va <= b.high_va && b.low_va <= a.high_va;
                let same_key = a.asid() == b.asid() && a.vmid() == b.vmid();
                prop_assert!(!(overlap && same_key));
            }
        }
    }

    /// Grain masking rules of the PMP address registers (spec rules for
    /// NAPOT vs OFF/TOR read-back).
    #[test]
    fn pmp_addr_grain_masking(
        grain in 0u32..10,
        raw in any::<u64>(),
        mode_bits in 0u8..4,
    ) {
        let mut sim = Sim::new(pmp_config(4, grain));
        let cfg_byte = (mode_bits << 3) | 0x7;
        sim.vm.write_pmpcfg(&mut sim.space, 0, cfg_byte as u64, crate::exception::AccessAttrs::ARCH);
        sim.vm.write_pmpaddr(&mut sim.space, 0, raw, crate::exception::AccessAttrs::ARCH);

        let effective = sim.vm.read_pmpaddr(0);
        let napot = sim.vm.read_pmpcfg(0) & 0x18 == 0x18;
        if napot && grain >= 2 {
            let ones = (1u64 << (grain - 1)) - 1;
            prop_assert_eq!(effective & ones, ones);
        } else if !napot && grain >= 1 {
            let zeros = (1u64 << grain) - 1;
            prop_assert_eq!(effective & zeros, 0);
        }
    }

    /// Writing a pmpcfg register twice with the same value is a fixed
    /// point: the read-back after the first write rewrites to itself.
    #[test]
    fn pmpcfg_write_is_idempotent(value in any::<u64>(), grain in 0u32..4) {
        let mut sim = Sim::new(pmp_config(8, grain));
        let attrs = crate::exception::AccessAttrs::ARCH;
        let first = sim.vm.write_pmpcfg(&mut sim.space, 0, value, attrs);
        let second = sim.vm.write_pmpcfg(&mut sim.space, 0, first, attrs);
        prop_assert_eq!(first, second);
        prop_assert_eq!(sim.vm.read_pmpcfg(0), second);
    }
}

/// Two-stage composition: the installed window never exceeds either
/// stage's span (deterministic variant of spec property 7).
#[test]
fn composed_mapping_size_is_min_of_stages() {
    let cfg = VmConfig {
        has_hypervisor: true,
        ..VmConfig::default()
    };
    for (s1_level, s2_level) in [(0u32, 1u32), (1, 0), (1, 1)] {
        let mut sim = Sim::new(cfg.clone());
        let s1_root = 0x8000_0000;
        let s2_root = 0x9000_0000;
        let mut s1 = PageTables::sv39(s1_root);
        let mut s2 = PageTables::sv39(s2_root);

        let va = 0x4000_0000u64;
        let gpa = 0x2000_0000u64;
        let pa = 0x1000_0000u64;
        s1.map(sim.mem(), va, gpa, s1_level, RWX_AD | PTE_U);
        s2.map(sim.mem(), gpa, pa, s2_level, RWX_AD | PTE_U);

        sim.vm.csr.vsatp = satp_sv39(s1_root, 0);
        sim.vm.csr.hgatp = hgatp_sv39(s2_root, 1);
        sim.vm.csr.mode = Mode5::VirtUser;
        sim.sync_asid();

        let domain = sim.virt_data_domain();
        sim.read(domain, va, 4).unwrap();

        let e1 = *sim.vm.tlb(TlbId::Vs1).iter().next().unwrap().1;
        let e2 = *sim.vm.tlb(TlbId::Vs2).iter().next().unwrap().1;
        let s1_size = PAGE_SIZE << (9 * s1_level);
        let s2_size = PAGE_SIZE << (9 * s2_level);
        assert_eq!(e1.size(), s1_size);
        assert_eq!(e2.size(), s2_size);

        // The data itself lands at the composed physical address.
        sim.mem().write_u64_at(pa + 0x18, 0x7777);
        assert_eq!(sim.read_u64(domain, va + 0x18).unwrap(), 0x7777);
    }
}

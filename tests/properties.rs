//! Property-based tests
//!
//! Random fault/touch/evict interleavings must preserve the subsystem's
//! structural invariants and never lose a byte: every resident entry's
//! frame knows its owner, and every page reads back the last bytes
//! written to it no matter how many times it moved between frames, swap,
//! and its backing file.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use demandvm::{
    MemDisk, Owner, PageStatus, ProcessId, SoftPageDir, Vm, VmConfig, VmProt, PAGE_SIZE,
};

const PID: ProcessId = ProcessId(1);
const CHILD: ProcessId = ProcessId(2);
const NO_HINT: u64 = u64::MAX;
const BASE: u64 = 0x10_0000;
const PAGES: u64 = 8;

fn small_vm() -> Vm {
    let config = VmConfig {
        frame_count: 4,
        swap_slots: 32,
        ..VmConfig::default()
    };
    Vm::new(config, Arc::new(SoftPageDir::new()), MemDisk::new(32))
}

fn page_va(page: u8) -> u64 {
    BASE + (page as u64 % PAGES) * PAGE_SIZE as u64
}

#[derive(Debug, Clone)]
enum Op {
    /// Write a tag through the pinned copy path (faults as needed)
    Write { page: u8, val: u8 },
    /// Read through the pinned copy path
    Read { page: u8 },
    /// Fault the page in without touching it
    FaultIn { page: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..PAGES as u8, any::<u8>()).prop_map(|(page, val)| Op::Write { page, val }),
        (0..PAGES as u8).prop_map(|page| Op::Read { page }),
        (0..PAGES as u8).prop_map(|page| Op::FaultIn { page }),
    ]
}

/// Every page's entry is structurally consistent with the frame table
fn check_owner_consistency(vm: &Vm, pid: ProcessId) {
    for page in 0..PAGES as u8 {
        let va = page_va(page);
        if let Some(PageStatus::Frame(id)) = vm.page_status(pid, va) {
            let owners = vm.frame_owners(id);
            assert!(
                owners.contains(&Owner::new(pid, va)),
                "frame {:?} does not list owner ({:?}, {:#x}); owners: {:?}",
                id,
                pid,
                va,
                owners
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Bytes survive arbitrary interleavings of faults, touches, and the
    /// eviction pressure of a 2x-overcommitted frame table
    #[test]
    fn contents_survive_random_paging(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let vm = small_vm();
        vm.create_address_space(PID).unwrap();
        for page in 0..PAGES as u8 {
            vm.install_zero_page(PID, page_va(page), VmProt::DEFAULT).unwrap();
        }

        let mut expected: HashMap<u8, u8> = HashMap::new();
        for op in &ops {
            match *op {
                Op::Write { page, val } => {
                    vm.copy_out(PID, page_va(page), &[val; 64], NO_HINT).unwrap();
                    expected.insert(page % PAGES as u8, val);
                }
                Op::Read { page } => {
                    let mut buf = [0u8; 64];
                    vm.copy_in(PID, page_va(page), &mut buf, NO_HINT).unwrap();
                    let want = expected.get(&(page % PAGES as u8)).copied().unwrap_or(0);
                    prop_assert_eq!(buf, [want; 64]);
                }
                Op::FaultIn { page } => {
                    vm.handle_page_fault(PID, page_va(page), false, NO_HINT).unwrap();
                }
            }
            check_owner_consistency(&vm, PID);
        }

        // Final sweep: every page readable and correct
        for page in 0..PAGES as u8 {
            let mut buf = [0u8; 64];
            vm.copy_in(PID, page_va(page), &mut buf, NO_HINT).unwrap();
            let want = expected.get(&page).copied().unwrap_or(0);
            prop_assert_eq!(buf, [want; 64]);
        }
    }

    /// Fork isolation: child writes never bleed into the parent, parent
    /// writes never bleed into the child, and untouched pages stay shared
    /// until memory pressure splits or evicts them
    #[test]
    fn fork_isolation_under_random_writes(
        parent_vals in prop::collection::vec(any::<u8>(), PAGES as usize),
        child_writes in prop::collection::vec((0..PAGES as u8, any::<u8>()), 0..16),
    ) {
        let vm = small_vm();
        vm.create_address_space(PID).unwrap();
        for (i, &val) in parent_vals.iter().enumerate() {
            let va = page_va(i as u8);
            vm.install_zero_page(PID, va, VmProt::DEFAULT).unwrap();
            vm.copy_out(PID, va, &[val; 64], NO_HINT).unwrap();
        }

        vm.fork_address_space(PID, CHILD).unwrap();

        let mut child_expected: HashMap<u8, u8> = HashMap::new();
        for &(page, val) in &child_writes {
            vm.copy_out(CHILD, page_va(page), &[val; 64], NO_HINT).unwrap();
            child_expected.insert(page % PAGES as u8, val);
            check_owner_consistency(&vm, PID);
            check_owner_consistency(&vm, CHILD);
        }

        for (i, &val) in parent_vals.iter().enumerate() {
            let page = i as u8;
            let mut buf = [0u8; 64];
            vm.copy_in(PID, page_va(page), &mut buf, NO_HINT).unwrap();
            prop_assert_eq!(buf, [val; 64], "parent page {} corrupted", page);

            let want = child_expected.get(&page).copied().unwrap_or(val);
            vm.copy_in(CHILD, page_va(page), &mut buf, NO_HINT).unwrap();
            prop_assert_eq!(buf, [want; 64], "child page {} corrupted", page);
        }

        // Teardown leaks nothing
        vm.destroy_address_space(CHILD);
        vm.destroy_address_space(PID);
        prop_assert_eq!(vm.free_frames(), 4);
        prop_assert_eq!(vm.free_swap_slots(), 32);
    }
}

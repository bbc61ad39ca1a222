//! Memory-mapped file scenarios: lazy loading, dirty write-back on unmap
//! and eviction, untouched pages never written, exit-time write-back.

use std::sync::Arc;

use demandvm::{
    MemDisk, MemFile, MmapError, PageStatus, ProcessId, SoftPageDir, Vm, VmConfig, VmProt,
    PAGE_SIZE,
};

const PID: ProcessId = ProcessId(1);
const NO_HINT: u64 = u64::MAX;
const MAP_AT: u64 = 0x4000_0000;

fn vm_with(frames: usize) -> (Vm, Arc<SoftPageDir>) {
    let config = VmConfig {
        frame_count: frames,
        swap_slots: 32,
        ..VmConfig::default()
    };
    let pagedir = Arc::new(SoftPageDir::new());
    let vm = Vm::new(config, pagedir.clone(), MemDisk::new(32));
    (vm, pagedir)
}

/// A 3-page file filled with 0x11 so unintended writes are visible
fn marker_file() -> Arc<MemFile> {
    MemFile::from_bytes(&vec![0x11u8; 3 * PAGE_SIZE])
}

#[test]
fn mmap_is_lazy_and_loads_file_bytes() {
    let (vm, _) = vm_with(8);
    vm.create_address_space(PID).unwrap();
    let file = marker_file();
    vm.mmap(PID, MAP_AT, 3 * PAGE_SIZE as u64, file.clone(), 0).unwrap();

    // No page resident, no byte read yet
    for i in 0..3u64 {
        assert_eq!(
            vm.page_status(PID, MAP_AT + i * PAGE_SIZE as u64),
            Some(PageStatus::File)
        );
    }
    assert_eq!(vm.stats().file_loads, 0);

    let mut buf = [0u8; 8];
    vm.copy_in(PID, MAP_AT + PAGE_SIZE as u64, &mut buf, NO_HINT).unwrap();
    assert_eq!(buf, [0x11; 8]);
    assert_eq!(vm.stats().file_loads, 1);
}

#[test]
fn munmap_writes_back_touched_pages_only() {
    let (vm, _) = vm_with(8);
    vm.create_address_space(PID).unwrap();
    let file = marker_file();
    vm.mmap(PID, MAP_AT, 3 * PAGE_SIZE as u64, file.clone(), 0).unwrap();

    // Write pages 0 and 2; read (but never write) nothing else
    vm.copy_out(PID, MAP_AT + 100, b"first-page", NO_HINT).unwrap();
    vm.copy_out(
        PID,
        MAP_AT + 2 * PAGE_SIZE as u64 + 200,
        b"third-page",
        NO_HINT,
    )
    .unwrap();

    vm.munmap(PID, MAP_AT, 3 * PAGE_SIZE as u64).unwrap();

    let bytes = file.snapshot();
    assert_eq!(&bytes[100..110], b"first-page");
    assert_eq!(
        &bytes[2 * PAGE_SIZE + 200..2 * PAGE_SIZE + 210],
        b"third-page"
    );
    // The untouched middle page is bit-for-bit unchanged
    assert!(bytes[PAGE_SIZE..2 * PAGE_SIZE].iter().all(|&b| b == 0x11));
    // The written pages carry the marker outside the written ranges
    assert_eq!(bytes[0], 0x11);

    // Entries are gone
    assert_eq!(vm.page_status(PID, MAP_AT), None);
    assert_eq!(vm.stats().file_writebacks, 2);
}

#[test]
fn munmap_of_never_loaded_region_does_no_io() {
    let (vm, _) = vm_with(8);
    vm.create_address_space(PID).unwrap();
    let file = marker_file();
    let before = file.snapshot();

    vm.mmap(PID, MAP_AT, 3 * PAGE_SIZE as u64, file.clone(), 0).unwrap();
    vm.munmap(PID, MAP_AT, 3 * PAGE_SIZE as u64).unwrap();

    assert_eq!(file.snapshot(), before);
    assert_eq!(vm.stats().file_writebacks, 0);
}

#[test]
fn read_only_use_is_not_written_back() {
    let (vm, _) = vm_with(8);
    vm.create_address_space(PID).unwrap();
    let file = marker_file();
    vm.mmap(PID, MAP_AT, PAGE_SIZE as u64, file.clone(), 0).unwrap();

    let mut buf = [0u8; 16];
    vm.copy_in(PID, MAP_AT, &mut buf, NO_HINT).unwrap();
    vm.munmap(PID, MAP_AT, PAGE_SIZE as u64).unwrap();

    assert_eq!(vm.stats().file_writebacks, 0);
}

#[test]
fn eviction_writes_dirty_mapped_pages_to_the_file() {
    let (vm, _) = vm_with(2);
    vm.create_address_space(PID).unwrap();
    let file = marker_file();
    vm.mmap(PID, MAP_AT, 3 * PAGE_SIZE as u64, file.clone(), 0).unwrap();

    // Dirty all three pages; with two frames at least one is evicted
    for i in 0..3u64 {
        let va = MAP_AT + i * PAGE_SIZE as u64;
        vm.copy_out(PID, va, &[0x40 + i as u8; 32], NO_HINT).unwrap();
    }
    assert!(vm.stats().file_writebacks >= 1);
    // Mapped pages never consume swap
    assert_eq!(vm.stats().swap_outs, 0);

    // An evicted page reverted to File status and reloads the written
    // bytes from the file
    let demoted: Vec<u64> = (0..3u64)
        .map(|i| MAP_AT + i * PAGE_SIZE as u64)
        .filter(|&va| vm.page_status(PID, va) == Some(PageStatus::File))
        .collect();
    assert!(!demoted.is_empty());
    for &va in &demoted {
        let seed = 0x40 + ((va - MAP_AT) / PAGE_SIZE as u64) as u8;
        let mut buf = [0u8; 32];
        vm.copy_in(PID, va, &mut buf, NO_HINT).unwrap();
        assert_eq!(buf, [seed; 32]);
    }

    vm.munmap(PID, MAP_AT, 3 * PAGE_SIZE as u64).unwrap();
    let bytes = file.snapshot();
    for i in 0..3 {
        assert_eq!(bytes[i * PAGE_SIZE], 0x40 + i as u8);
    }
}

#[test]
fn exit_writes_dirty_mapped_pages_back() {
    let (vm, _) = vm_with(8);
    vm.create_address_space(PID).unwrap();
    let file = marker_file();
    vm.mmap(PID, MAP_AT, PAGE_SIZE as u64, file.clone(), 0).unwrap();
    vm.copy_out(PID, MAP_AT, b"at-exit", NO_HINT).unwrap();

    vm.destroy_address_space(PID);

    assert_eq!(&file.snapshot()[..7], b"at-exit");
    assert_eq!(vm.free_frames(), 8);
}

#[test]
fn mmap_rejects_bad_ranges() {
    let (vm, _) = vm_with(8);
    vm.create_address_space(PID).unwrap();
    let file = marker_file();

    assert_eq!(
        vm.mmap(PID, MAP_AT + 8, PAGE_SIZE as u64, file.clone(), 0),
        Err(MmapError::Misaligned)
    );
    assert_eq!(
        vm.mmap(PID, MAP_AT, 0, file.clone(), 0),
        Err(MmapError::EmptyRange)
    );

    // Overlap with an existing anonymous page
    vm.install_zero_page(PID, MAP_AT + PAGE_SIZE as u64, VmProt::DEFAULT)
        .unwrap();
    assert_eq!(
        vm.mmap(PID, MAP_AT, 2 * PAGE_SIZE as u64, file.clone(), 0),
        Err(MmapError::Overlap)
    );
    // The failed map installed nothing
    assert_eq!(vm.page_status(PID, MAP_AT), None);

    assert_eq!(
        vm.munmap(PID, 0x7000_0000, PAGE_SIZE as u64),
        Err(MmapError::NotMapped)
    );
}

#[test]
fn partial_final_page_zero_fills_past_eof() {
    let (vm, _) = vm_with(8);
    vm.create_address_space(PID).unwrap();
    // File covers half a page; the rest of the mapping reads as zero
    let file = MemFile::from_bytes(&vec![0x22u8; PAGE_SIZE / 2]);
    vm.mmap(PID, MAP_AT, PAGE_SIZE as u64, file, 0).unwrap();

    let mut buf = [0u8; 4];
    vm.copy_in(PID, MAP_AT + PAGE_SIZE as u64 / 2 - 2, &mut buf, NO_HINT)
        .unwrap();
    assert_eq!(buf, [0x22, 0x22, 0, 0]);
}

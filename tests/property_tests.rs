//! Property-based tests for the handle manager.
//!
//! All cases share one simulated platform, so they also run against each other's
//! live handles.

use hwmem_rs::{Coherency, HeapKind, MemoryManager};
use proptest::prelude::*;
use std::sync::LazyLock;

static MANAGER: LazyLock<MemoryManager> =
    LazyLock::new(|| MemoryManager::simulated().expect("simulated platform"));

/// Heaps the simulated platform offers for CPU-visible buffers
fn cpu_heap() -> impl Strategy<Value = HeapKind> {
    prop_oneof![
        Just(HeapKind::System),
        Just(HeapKind::CarveOut),
        Just(HeapKind::OnChipFast),
        Just(HeapKind::TranslatedIo),
        Just(HeapKind::Secured),
    ]
}

fn coherency() -> impl Strategy<Value = Coherency> {
    prop_oneof![
        Just(Coherency::Uncached),
        Just(Coherency::WriteCombined),
        Just(Coherency::WriteBack),
        Just(Coherency::InnerWriteBack),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// N add_refs need N + 1 releases before the handle goes away
    #[test]
    fn refcount_idempotence(n in 0usize..16) {
        let mgr = &*MANAGER;
        let h = mgr.create(256).unwrap();

        for _ in 0..n {
            mgr.add_ref(h);
        }
        for _ in 0..n {
            mgr.release(h);
        }
        prop_assert!(mgr.is_valid(h));

        mgr.release(h);
        prop_assert!(!mgr.is_valid(h));
    }

    /// k pins followed by k unpins always return the count to zero
    #[test]
    fn pin_unpin_symmetry(k in 0usize..32, heap in cpu_heap()) {
        let mgr = &*MANAGER;
        let h = mgr.create(4096).unwrap();
        mgr.allocate(h, &[heap], 0, Coherency::WriteBack).unwrap();

        let addrs: Vec<_> = (0..k).map(|_| mgr.pin(h).unwrap()).collect();
        prop_assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        prop_assert_eq!(mgr.pin_count(h), k as i32);

        for _ in 0..k {
            mgr.unpin(h);
        }
        prop_assert_eq!(mgr.pin_count(h), 0);
        mgr.release(h);
    }

    /// Same-handle copies match `copy_within` for every overlap
    #[test]
    fn copy_matches_memmove(
        src in 0u32..200,
        dst in 0u32..200,
        len in 0u32..56,
        heap in cpu_heap(),
    ) {
        let mgr = &*MANAGER;
        let h = mgr.create(256).unwrap();
        mgr.allocate(h, &[heap], 0, Coherency::WriteBack).unwrap();

        let pattern: Vec<u8> = (0..=255).collect();
        mgr.write_block(h, 0, &pattern);
        mgr.copy(h, dst, h, src, len);

        let mut expected = pattern;
        expected.copy_within(src as usize..(src + len) as usize, dst as usize);
        let mut got = vec![0u8; 256];
        mgr.read_block(h, 0, &mut got);
        prop_assert_eq!(got, expected);
        mgr.release(h);
    }

    /// write, sync for device, sync for CPU, read returns what was written
    #[test]
    fn write_sync_read_round_trip(
        mode in coherency(),
        heap in cpu_heap(),
        offset in 0u32..4000,
        data in prop::collection::vec(any::<u8>(), 1..96),
    ) {
        let mgr = &*MANAGER;
        let h = mgr.create(4096).unwrap();
        mgr.allocate(h, &[heap], 0, mode).unwrap();

        let offset = offset.min(4096 - data.len() as u32);
        mgr.write_block(h, offset, &data);

        // Use the canonical mapping where the heap allows one, else any pointer.
        let addr = mgr
            .map(h, offset, data.len() as u32, hwmem_rs::AccessFlags::READ)
            .map_or(std::ptr::null(), |p| p.as_ptr().cast_const());
        mgr.sync_for_device(h, addr, data.len());
        mgr.sync_for_cpu(h, addr, data.len());

        let mut back = vec![0u8; data.len()];
        mgr.read_block(h, offset, &mut back);
        prop_assert_eq!(back, data);
        mgr.release(h);
    }
}

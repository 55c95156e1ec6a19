use hwmem_rs::{Coherency, HeapKind, MemResult, MemoryManager, PlatformConfig};

fn print_heaps(mgr: &MemoryManager) {
    for kind in HeapKind::ALL {
        match mgr.heap_usage(kind) {
            Some(usage) => println!(
                "  - {:<16} | Total: {:>6} KB | Used: {:>6} KB | Largest free: {:>6} KB",
                kind.name(),
                usage.total / 1024,
                usage.used / 1024,
                usage.largest_free / 1024
            ),
            None => println!("  - {:<16} | not present", kind.name()),
        }
    }
}

fn main() -> MemResult<()> {
    println!("--- Platform ---");

    // HWMEM_PLATFORM_PATH selects a property tree; otherwise the simulated platform is used.
    let config = PlatformConfig::from_env()?;
    println!("Page size: {} bytes", config.page_size);
    println!("Cache line: {} bytes", config.cache_line_size);
    println!("Eager mapping: {}", config.eager_map);

    let mgr = MemoryManager::open(config)?;

    println!("\n--- Heaps ---");
    print_heaps(&mgr);

    println!("\n--- Sample Allocations ---");
    let requests: [(u32, &[HeapKind], Coherency); 3] = [
        (4096, &[], Coherency::WriteBack),
        (1 << 20, &[], Coherency::Uncached),
        (64 * 1024, &[HeapKind::Secured], Coherency::WriteCombined),
    ];

    let mut handles = Vec::new();
    for (size, heaps, coherency) in requests {
        let handle = mgr.create(size)?;
        if let Err(e) = mgr.allocate(handle, heaps, 0, coherency) {
            println!("  - {size:>8} bytes: allocation failed: {e}");
            mgr.release(handle);
            continue;
        }

        let addr = mgr.pin(handle)?;
        println!(
            "  - {size:>8} bytes: {:<10} {:?} align {} at 0x{addr:x}",
            mgr.get_heap_kind(handle).map_or("?", HeapKind::name),
            mgr.get_coherency(handle),
            mgr.get_alignment(handle)
        );
        mgr.unpin(handle);
        handles.push(handle);
    }

    println!("\n--- Heaps (after allocation) ---");
    print_heaps(&mgr);

    for handle in handles {
        mgr.release(handle);
    }
    Ok(())
}

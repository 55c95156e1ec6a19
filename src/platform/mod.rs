pub mod properties;
pub mod service;

pub use properties::{HeapConfig, PlatformConfig};

use crate::error::MemResult;
use crate::heap::contiguous::ContiguousHeap;
use crate::heap::iommu::TranslatedIoHeap;
use crate::heap::secure::ServiceHeap;
use crate::heap::{HeapBackend, HeapKind};
use service::LocalMemService;
use std::sync::Arc;

/// Instantiates one backend per heap the platform describes, in description order.
///
/// # Errors
/// Returns an error if the configuration is invalid or a heap's storage cannot be set up.
pub fn open_heaps(config: &PlatformConfig) -> MemResult<Vec<Arc<dyn HeapBackend>>> {
    config.validate()?;

    let mut heaps: Vec<Arc<dyn HeapBackend>> = Vec::with_capacity(config.heaps.len());
    for heap in &config.heaps {
        let desc = config.descriptor(heap.kind);

        let backend: Arc<dyn HeapBackend> = match heap.kind {
            HeapKind::TranslatedIo => Arc::new(TranslatedIoHeap::new(
                desc,
                heap.size,
                heap.base_address,
                heap.iova_base,
                heap.iova_size,
            )?),
            HeapKind::Secured => {
                let service = LocalMemService::new(
                    heap.size,
                    heap.base_address,
                    u64::from(desc.min_alignment),
                    false,
                )?;
                Arc::new(ServiceHeap::new(desc, Arc::new(service)))
            }
            kind => Arc::new(ContiguousHeap::new(
                kind,
                desc,
                heap.size,
                heap.base_address,
            )?),
        };

        log::debug!(
            "platform: {} heap, 0x{:x} bytes at 0x{:x}",
            heap.kind,
            heap.size,
            heap.base_address
        );
        heaps.push(backend);
    }

    Ok(heaps)
}

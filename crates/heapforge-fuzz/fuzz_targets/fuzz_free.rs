#![no_main]
use heapforge_core::{Handle, Heap, HeapConfig, ViolationMode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary handle values must be rejected, never trusted.
    if data.len() < 8 {
        return;
    }

    let config = HeapConfig::fixed(16 * 1024)
        .with_violation_mode(ViolationMode::Report)
        .with_log_capacity(0);
    let Ok(mut heap) = Heap::new(config) else {
        return;
    };
    let anchor = heap.allocate(256, 16).unwrap();
    let base = heap.base_address();

    for chunk in data.chunks_exact(8) {
        let raw = u64::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ]) as usize;
        // Half the probes land inside the arena.
        let addr = if raw & 1 == 0 { base.wrapping_add(raw % (32 * 1024)) } else { raw };
        let Some(handle) = Handle::from_addr(addr) else {
            continue;
        };
        if handle == anchor {
            continue;
        }
        let _ = heap.deallocate(handle);
        let _ = heap.reallocate(handle, 64);
        heap.check_integrity().unwrap();
    }

    heap.deallocate(anchor).unwrap();
});

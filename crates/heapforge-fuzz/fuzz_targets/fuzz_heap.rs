#![no_main]
use heapforge_core::{Handle, Heap, HeapConfig, HeapError, ViolationMode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one operation: op, size (u16), alignment shift.
    if data.len() < 4 {
        return;
    }

    let config = HeapConfig::default()
        .with_initial_size(4096)
        .with_max_size(256 * 1024)
        .with_growth_step(4096)
        .with_violation_mode(ViolationMode::Report)
        .with_log_capacity(0);
    let Ok(mut heap) = Heap::new(config) else {
        return;
    };
    let mut live: Vec<(Handle, usize, u8)> = Vec::new();

    for (step, chunk) in data.chunks_exact(4).enumerate() {
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let alignment = 1usize << (chunk[3] % 13);
        let fill = step as u8;

        match chunk[0] % 4 {
            0 => match heap.allocate(size, alignment) {
                Ok(handle) => {
                    assert_eq!(handle.addr() % alignment, 0);
                    if let Ok(bytes) = heap.payload_mut(handle) {
                        bytes.fill(fill);
                    }
                    live.push((handle, size, fill));
                }
                Err(HeapError::OutOfMemory { .. }) => {}
                Err(err) => panic!("allocate({size}, {alignment}): {err}"),
            },
            1 if !live.is_empty() => {
                let (handle, len, fill) = live.swap_remove(size % live.len());
                if len > 0 {
                    let bytes = heap.payload(handle).unwrap();
                    assert!(bytes[..len].iter().all(|&b| b == fill));
                }
                heap.deallocate(handle).unwrap();
            }
            2 if !live.is_empty() => {
                let slot = chunk[3] as usize % live.len();
                let (handle, len, fill) = live[slot];
                match heap.reallocate(handle, size) {
                    Ok(moved) => {
                        let kept = len.min(size);
                        if kept > 0 {
                            let bytes = heap.payload(moved).unwrap();
                            assert!(bytes[..kept].iter().all(|&b| b == fill));
                        }
                        if size == 0 {
                            live.swap_remove(slot);
                        } else {
                            heap.payload_mut(moved).unwrap()[..size].fill(fill);
                            live[slot] = (moved, size, fill);
                        }
                    }
                    Err(HeapError::OutOfMemory { .. }) => {}
                    Err(err) => panic!("reallocate({size}): {err}"),
                }
            }
            _ => {
                let stats = heap.stats();
                assert_eq!(
                    stats.bytes_in_use + stats.bytes_free + stats.header_bytes,
                    stats.total_capacity
                );
            }
        }
    }

    heap.check_integrity().unwrap();
    for (handle, _, _) in live {
        heap.deallocate(handle).unwrap();
    }
    assert_eq!(heap.stats().allocated_blocks, 0);
});

use heapforge_core::{BlockState, Heap, HeapConfig, HeapError, ViolationMode};

fn fixed_heap(bytes: usize) -> Heap {
    Heap::new(HeapConfig::fixed(bytes).with_violation_mode(ViolationMode::Report))
        .expect("heap construction")
}

fn growable_heap() -> Heap {
    Heap::new(HeapConfig::default().with_violation_mode(ViolationMode::Report))
        .expect("heap construction")
}

fn assert_accounting(heap: &Heap) {
    let stats = heap.stats();
    assert_eq!(
        stats.bytes_in_use + stats.bytes_free + stats.header_bytes,
        stats.total_capacity,
        "accounting identity broken: {stats:?}"
    );
    heap.check_integrity().expect("heap integrity");
}

fn free_block_sizes(heap: &Heap) -> Vec<usize> {
    heap.blocks()
        .map(|block| block.expect("walk"))
        .filter(|block| block.state == BlockState::Free)
        .map(|block| block.size)
        .collect()
}

#[test]
fn freed_block_is_reused_for_smaller_request() {
    let mut heap = fixed_heap(1024);
    let first = heap.allocate(100, 8).unwrap();
    let first_size = heap.usable_size(first).unwrap();
    let _second = heap.allocate(200, 8).unwrap();
    heap.deallocate(first).unwrap();

    let first_block = heap.blocks().next().unwrap().unwrap();
    assert_eq!(first_block.state, BlockState::Free);
    assert_eq!(first_block.size, first_size);
    assert_eq!(first_block.address, first.addr());

    let reused = heap.allocate(50, 8).unwrap();
    assert_eq!(reused, first);
    assert_eq!(heap.metrics().snapshot().grows, 0);
    assert_accounting(&heap);
}

#[test]
fn two_frees_merge_into_one_block_with_reclaimed_header() {
    let mut heap = fixed_heap(672);
    let a = heap.allocate(300, 8).unwrap();
    let b = heap.allocate(300, 8).unwrap();
    let size_a = heap.usable_size(a).unwrap();
    let size_b = heap.usable_size(b).unwrap();
    assert_eq!(heap.stats().free_blocks, 0);

    heap.deallocate(a).unwrap();
    heap.deallocate(b).unwrap();
    assert_eq!(free_block_sizes(&heap), [size_a + size_b + 32]);
    assert_eq!(heap.stats().largest_free_block, 640);

    let big = heap.allocate(590, 8).unwrap();
    assert_eq!(big.addr(), a.addr());
    assert_eq!(heap.metrics().snapshot().grows, 0);
    assert_accounting(&heap);
}

#[test]
fn two_frees_merge_with_tail_in_larger_arena() {
    let mut heap = fixed_heap(1024);
    let a = heap.allocate(300, 8).unwrap();
    let b = heap.allocate(300, 8).unwrap();
    heap.deallocate(a).unwrap();
    heap.deallocate(b).unwrap();
    assert_eq!(free_block_sizes(&heap), [1024 - 32]);
    assert!(heap.allocate(590, 8).is_ok());
    assert_eq!(heap.metrics().snapshot().grows, 0);
}

#[test]
fn only_adjacent_frees_merge() {
    let mut heap = fixed_heap(1024);
    let handles: Vec<_> = (0..4).map(|_| heap.allocate(64, 16).unwrap()).collect();
    let before = heap.stats().free_blocks;

    heap.deallocate(handles[0]).unwrap();
    heap.deallocate(handles[2]).unwrap();
    assert_eq!(heap.stats().free_blocks, before + 2, "non-adjacent frees stay apart");

    heap.deallocate(handles[1]).unwrap();
    assert_eq!(heap.stats().free_blocks, before + 1, "neighbours coalesce");
    assert_eq!(heap.metrics().snapshot().merges, 2);
    assert_accounting(&heap);
}

#[test]
fn payloads_honour_requested_alignment() {
    let mut heap = growable_heap();
    let mut live = Vec::new();
    for round in 0..16 {
        for alignment in [8, 16, 32, 64, 128, 4096] {
            let size = 8 + round * 40;
            let handle = heap.allocate(size, alignment).unwrap();
            assert_eq!(
                handle.addr() % alignment,
                0,
                "size {size} at alignment {alignment}"
            );
            assert!(heap.usable_size(handle).unwrap() >= size);
            live.push(handle);
        }
        if round % 3 == 0 {
            for handle in live.drain(..live.len() / 2) {
                heap.deallocate(handle).unwrap();
            }
        }
        assert_accounting(&heap);
    }
    for handle in live {
        heap.deallocate(handle).unwrap();
    }
    assert_eq!(heap.stats().free_blocks, 1);
}

#[test]
fn repeated_alloc_free_does_not_creep() {
    let mut heap = fixed_heap(4096);
    let initial_largest = heap.stats().largest_free_block;
    for _ in 0..1000 {
        let handle = heap.allocate(72, 16).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.bytes_in_use, 80);
        heap.deallocate(handle).unwrap();
    }
    let stats = heap.stats();
    assert_eq!(stats.bytes_in_use, 0);
    assert_eq!(stats.largest_free_block, initial_largest);
    assert_eq!(stats.free_blocks, 1);
}

#[test]
fn double_free_is_recoverable_in_report_mode() {
    let mut heap = fixed_heap(2048);
    let a = heap.allocate(128, 16).unwrap();
    let _b = heap.allocate(128, 16).unwrap();
    heap.deallocate(a).unwrap();
    assert_eq!(
        heap.deallocate(a),
        Err(HeapError::DoubleFree { addr: a.addr() })
    );
    for _ in 0..4 {
        assert!(heap.allocate(96, 16).is_ok());
    }
    assert_accounting(&heap);
}

#[test]
fn handles_from_another_heap_are_foreign() {
    let mut mine = fixed_heap(1024);
    let mut other = fixed_heap(1024);
    let theirs = other.allocate(64, 16).unwrap();
    assert_eq!(
        mine.deallocate(theirs),
        Err(HeapError::ForeignPointer { addr: theirs.addr() })
    );
    assert_eq!(mine.metrics().snapshot().foreign_pointers, 1);
    other.deallocate(theirs).unwrap();
}

#[test]
fn arena_grows_in_steps_and_never_moves() {
    let mut heap = Heap::new(
        HeapConfig::default()
            .with_initial_size(4096)
            .with_max_size(1 << 20)
            .with_growth_step(8192)
            .with_violation_mode(ViolationMode::Report),
    )
    .unwrap();
    let base = heap.base_address();
    let mut live = Vec::new();
    for _ in 0..64 {
        live.push(heap.allocate(1000, 16).unwrap());
    }
    let stats = heap.stats();
    assert!(stats.total_capacity > 4096);
    assert!(stats.total_capacity <= stats.max_capacity);
    assert_eq!(heap.base_address(), base);
    assert!(heap.metrics().snapshot().grows >= 1);
    assert_accounting(&heap);

    for handle in live {
        heap.deallocate(handle).unwrap();
    }
    assert_eq!(heap.stats().free_blocks, 1);
    heap.release().unwrap();
}

#[test]
fn growth_stops_at_reservation() {
    let mut heap = Heap::new(
        HeapConfig::default()
            .with_initial_size(1024)
            .with_max_size(4096)
            .with_growth_step(1024)
            .with_violation_mode(ViolationMode::Report),
    )
    .unwrap();
    let mut live = Vec::new();
    loop {
        match heap.allocate(480, 16) {
            Ok(handle) => live.push(handle),
            Err(err) => {
                assert_eq!(err, HeapError::OutOfMemory { requested: 480 });
                break;
            }
        }
    }
    assert_eq!(heap.stats().total_capacity, 4096);
    assert!(heap.metrics().snapshot().out_of_memory >= 1);
    assert_accounting(&heap);
}

#[test]
fn stats_serialize_to_json() {
    let mut heap = fixed_heap(1024);
    let _a = heap.allocate(100, 8).unwrap();
    let json = serde_json::to_value(heap.stats()).unwrap();
    assert_eq!(json["total_capacity"], 1024);
    assert_eq!(json["bytes_in_use"], 112);
    assert_eq!(json["allocated_blocks"], 1);
    assert!(json["fragmentation_ratio"].is_number());
}

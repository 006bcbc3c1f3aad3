use heapforge_core::HeapConfig;
use heapforge_harness::{StormConfig, StormType, run_storm};

fn short(kind: StormType) -> StormConfig {
    StormConfig::new(kind).with_ops(4_000)
}

#[test]
fn every_storm_passes_integrity() {
    for kind in StormType::all() {
        let report = run_storm(&short(kind)).unwrap();
        assert!(report.passed(), "storm {kind} failed: {report:?}");
        assert!(report.ops_count >= 4_000, "storm {kind} ran {} ops", report.ops_count);
        assert!(report.allocations > 0, "storm {kind} never allocated");
        assert!((0.0..1.0).contains(&report.mean_fragmentation_ratio));
        assert!(report.final_stats.total_capacity <= report.final_stats.max_capacity);
    }
}

#[test]
fn storms_replay_from_seed() {
    let config = short(StormType::RandomChurn).with_seed(0x5EED);
    let first = run_storm(&config).unwrap();
    let second = run_storm(&config).unwrap();
    assert_eq!(first.trace_digest, second.trace_digest);
    assert_eq!(first.final_stats, second.final_stats);

    let other = run_storm(&config.clone().with_seed(0x5EEE)).unwrap();
    assert_ne!(first.trace_digest, other.trace_digest);
}

#[test]
fn exhaustion_storm_hits_the_reservation() {
    let config = StormConfig::new(StormType::ArenaExhaustion)
        .with_ops(4_000)
        .with_heap(
            HeapConfig::default()
                .with_initial_size(16 * 1024)
                .with_max_size(128 * 1024)
                .with_growth_step(16 * 1024)
                .with_log_capacity(0),
        );
    let report = run_storm(&config).unwrap();
    assert!(report.passed(), "{report:?}");
    assert!(report.failed_allocations > 0);
    assert_eq!(report.metrics.out_of_memory as usize, report.failed_allocations);
    assert_eq!(report.final_stats.total_capacity, 128 * 1024);
}

#[test]
fn report_serializes_with_snake_case_kind() {
    let report = run_storm(&short(StormType::SizeClassThrash)).unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["storm_type"], "size_class_thrash");
    assert_eq!(json["trace_digest"].as_str().unwrap().len(), 64);
    assert!(json["final_stats"]["fragmentation_ratio"].is_number());
    assert!(json["metrics"]["allocations"].is_u64());
}

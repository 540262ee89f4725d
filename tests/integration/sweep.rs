use loaded_latency::report::{write_report, OutputFormat, CSV_HEADER};
use loaded_latency::{
    ConfigError, CoreAssignment, Orchestrator, PortablePlatform, RegionPurpose, ShuffleKind,
    StepError, SweepRow, TestConfig, MAX_REGION_BYTES,
};

fn sweep_config(cap: usize) -> TestConfig {
    TestConfig {
        bandwidth_memory_bytes: 2 * 1024 * 1024,
        latency_memory_bytes: 512 * 1024,
        latency_iterations: 10_000,
        bandwidth_thread_cap: cap,
        huge_pages: false,
        ..TestConfig::small()
    }
}

#[test]
fn sweep_renders_csv_rows_in_thread_order() {
    let orch = Orchestrator::new(sweep_config(3))
        .unwrap()
        .with_platform(Box::new(PortablePlatform));
    let result = orch.run_sweep();

    assert!(!result.aborted);
    assert!(result.failures.is_empty());
    assert_eq!(result.measurements.len(), 4);

    let mut out = Vec::new();
    write_report(&result, OutputFormat::Csv, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some(CSV_HEADER));

    for (expected, line) in (0..=3).zip(lines.by_ref()) {
        let fields: Vec<&str> = line.split(", ").collect();
        assert_eq!(fields.len(), 3, "{line}");
        assert_eq!(fields[0].parse::<usize>().unwrap(), expected);
        let bw: f64 = fields[1].parse().unwrap();
        let lat: f64 = fields[2].parse().unwrap();
        assert!(bw > 0.0, "{line}");
        assert!(lat > 0.0, "{line}");
        assert_eq!(fields[2].split('.').nth(1).map(str::len), Some(6));
    }
    assert_eq!(lines.next(), None);
}

#[test]
fn zero_cap_sweep_is_a_single_unloaded_row() {
    let cfg = TestConfig {
        bandwidth_memory_bytes: 0,
        ..sweep_config(0)
    };
    let orch = Orchestrator::new(cfg)
        .unwrap()
        .with_platform(Box::new(PortablePlatform));
    let result = orch.run_sweep();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].bandwidth_threads, 0);
    assert!(result.rows[0].latency_ns > 0.0);
}

#[test]
fn sattolo_sweep_matches_literal_shape() {
    let cfg = TestConfig {
        shuffle: ShuffleKind::Sattolo,
        ..sweep_config(1)
    };
    let orch = Orchestrator::new(cfg)
        .unwrap()
        .with_platform(Box::new(PortablePlatform));
    let result = orch.run_sweep();
    assert_eq!(result.settings.shuffle, ShuffleKind::Sattolo);
    assert_eq!(result.settings.platform, "portable");

    let rows: Vec<SweepRow> = result.rows;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.latency_ns > 0.0));
}

#[test]
fn explicit_cores_run_without_pinning_support() {
    let cfg = TestConfig {
        latency_core: 0,
        bandwidth_cores: CoreAssignment::Explicit(vec![1, 2]),
        ..sweep_config(2)
    };
    let orch = Orchestrator::new(cfg)
        .unwrap()
        .with_platform(Box::new(PortablePlatform));
    let m = orch.run_step(2).unwrap();
    assert_eq!(m.pinned_saturators, 0);
    assert!(!m.probe.pinned);
    assert!(m.saturator_bytes.iter().all(|&b| b > 0));
}

#[test]
fn invalid_configs_never_reach_a_step() {
    let cases = [
        (
            TestConfig {
                latency_iterations: 0,
                ..sweep_config(1)
            },
            ConfigError::ZeroIterations,
        ),
        (
            TestConfig {
                bandwidth_cores: CoreAssignment::Explicit(vec![0, 1]),
                ..sweep_config(2)
            },
            ConfigError::LatencyCoreReused { core: 0 },
        ),
        (
            TestConfig {
                bandwidth_memory_bytes: 0,
                ..sweep_config(2)
            },
            ConfigError::ZeroBandwidthMemory { cap: 2 },
        ),
        (
            TestConfig {
                bandwidth_memory_bytes: usize::MAX - 5,
                ..sweep_config(1)
            },
            ConfigError::BandwidthRegionTooLarge {
                bytes: usize::MAX - 5,
                max: MAX_REGION_BYTES,
            },
        ),
    ];
    for (cfg, expected) in cases {
        match Orchestrator::new(cfg) {
            Err(err) => assert_eq!(err, expected),
            Ok(_) => panic!("expected {expected}"),
        }
    }
}

#[test]
fn unallocatable_bandwidth_memory_yields_zero_row() {
    let cfg = TestConfig {
        bandwidth_memory_bytes: MAX_REGION_BYTES,
        ..sweep_config(2)
    };
    let orch = Orchestrator::new(cfg)
        .unwrap()
        .with_platform(Box::new(PortablePlatform));
    let result = orch.run_sweep();

    assert!(result.aborted);
    assert_eq!(result.rows.len(), 2);
    assert!(result.rows[0].latency_ns > 0.0);
    assert_eq!(result.rows[1], SweepRow::failed(1));
    assert_eq!(result.failures.len(), 1);
    assert!(matches!(
        result.failures[0].error,
        StepError::Allocation {
            purpose: RegionPurpose::SaturatorBuffer(0),
            bytes: MAX_REGION_BYTES,
            ..
        }
    ));
}

use std::io;
use std::sync::{Arc, Mutex};

use loaded_latency::{
    CpuSet, Orchestrator, PageHint, PageKind, Platform, Region, StepError, TestConfig,
};

#[derive(Default)]
struct Requests {
    large: Mutex<Vec<usize>>,
    standard: Mutex<Vec<(usize, PageHint)>>,
}

/// Platform without a hugetlb pool that records every allocation request.
struct NoHugePages(Arc<Requests>);

impl Platform for NoHugePages {
    fn name(&self) -> &'static str {
        "no-huge-pages"
    }

    fn pin_current_thread(&self, _cores: &CpuSet) -> io::Result<()> {
        Ok(())
    }

    fn allocate_large(&self, bytes: usize) -> io::Result<Region> {
        self.0.large.lock().unwrap().push(bytes);
        Err(io::Error::new(io::ErrorKind::OutOfMemory, "hugetlb pool empty"))
    }

    fn allocate_standard(&self, bytes: usize, hint: PageHint) -> io::Result<Region> {
        self.0.standard.lock().unwrap().push((bytes, hint));
        Region::heap(bytes)
    }
}

fn config(huge_pages: bool) -> TestConfig {
    TestConfig {
        bandwidth_memory_bytes: 2 * 1024 * 1024,
        latency_memory_bytes: 1024 * 1024,
        latency_iterations: 20_000,
        bandwidth_thread_cap: 2,
        huge_pages,
        ..TestConfig::small()
    }
}

#[test]
fn large_page_failure_falls_back_to_hinted_standard_pages() {
    let requests = Arc::new(Requests::default());
    let orch = Orchestrator::new(config(true))
        .unwrap()
        .with_platform(Box::new(NoHugePages(Arc::clone(&requests))));

    let m = orch.run_step(2).unwrap();
    assert_eq!(m.latency_pages, PageKind::Standard);
    assert!(m.latency_ns > 0.0 && m.latency_ns.is_finite());
    assert_eq!(m.saturator_bytes.len(), 2);

    assert_eq!(*requests.large.lock().unwrap(), vec![1024 * 1024]);
    let standard = requests.standard.lock().unwrap();
    assert_eq!(standard.len(), 3);
    assert_eq!(standard[2], (1024 * 1024, PageHint::PreferHuge));
    assert!(standard[..2]
        .iter()
        .all(|&(bytes, hint)| bytes == 1024 * 1024 && hint == PageHint::Default));
}

#[test]
fn disabled_huge_pages_never_asks_for_them() {
    let requests = Arc::new(Requests::default());
    let orch = Orchestrator::new(config(false))
        .unwrap()
        .with_platform(Box::new(NoHugePages(Arc::clone(&requests))));

    orch.run_step(0).unwrap();

    assert!(requests.large.lock().unwrap().is_empty());
    assert_eq!(requests.standard.lock().unwrap().len(), 1);
}

/// Refuses every allocation.
struct OutOfMemory;

impl Platform for OutOfMemory {
    fn name(&self) -> &'static str {
        "oom"
    }

    fn pin_current_thread(&self, _cores: &CpuSet) -> io::Result<()> {
        Ok(())
    }

    fn allocate_large(&self, _bytes: usize) -> io::Result<Region> {
        Err(io::Error::new(io::ErrorKind::OutOfMemory, "no huge pages"))
    }

    fn allocate_standard(&self, _bytes: usize, _hint: PageHint) -> io::Result<Region> {
        Err(io::Error::new(io::ErrorKind::OutOfMemory, "no memory"))
    }
}

#[test]
fn allocation_failure_is_reported_with_purpose() {
    let orch = Orchestrator::new(config(true))
        .unwrap()
        .with_platform(Box::new(OutOfMemory));
    let err = orch.run_step(0).unwrap_err();
    assert!(err.is_memory_pressure());
    assert!(matches!(err, StepError::Allocation { bytes, .. } if bytes == 1024 * 1024));
    assert!(err.to_string().contains("latency array"));
}

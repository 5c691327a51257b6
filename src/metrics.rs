/// Metrics Module - Prometheus Instrumentation
///
/// Storage and chain-organizer counters, gauges, and latency histograms,
/// registered against a process-global registry.
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use lazy_static::lazy_static;
use std::time::Instant;

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ------------------------------------------------------------------
    // Push/pop throughput
    // ------------------------------------------------------------------

    pub static ref BLOCKS_PUSHED: IntCounter = IntCounter::new(
        "blockvault_blocks_pushed_total",
        "Total blocks committed to the block table"
    ).unwrap();

    pub static ref BLOCKS_POPPED: IntCounter = IntCounter::new(
        "blockvault_blocks_popped_total",
        "Total blocks removed from the top of the chain"
    ).unwrap();

    pub static ref CHAIN_TIP_HEIGHT: IntGauge = IntGauge::new(
        "blockvault_chain_tip_height",
        "Height of the confirmed chain's top block"
    ).unwrap();

    // ------------------------------------------------------------------
    // Organizer
    // ------------------------------------------------------------------

    pub static ref REORGANIZATIONS: IntCounter = IntCounter::new(
        "blockvault_reorganizations_total",
        "Completed reorganizations (branch swaps)"
    ).unwrap();

    pub static ref REORG_DEPTH: Histogram = Histogram::with_opts(
        HistogramOpts::new("blockvault_reorg_depth_blocks", "Depth of each reorganization, in blocks")
            .buckets(vec![1.0, 2.0, 3.0, 5.0, 10.0, 25.0, 50.0, 100.0])
    ).unwrap();

    pub static ref ORGANIZE_OUTCOMES: IntCounterVec = IntCounterVec::new(
        Opts::new("blockvault_organize_outcomes_total", "organize() results by outcome"),
        &["outcome"] // accepted, orphan, duplicate, insufficient_work, rejected
    ).unwrap();

    pub static ref VALIDATION_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("blockvault_validation_failures_total", "Validator rejections by error kind"),
        &["kind"]
    ).unwrap();

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    pub static ref ORPHAN_POOL_SIZE: IntGauge = IntGauge::new(
        "blockvault_orphan_pool_size",
        "Entries currently retained in the orphan/branch pool"
    ).unwrap();

    pub static ref POOL_PRUNED_TOTAL: IntCounter = IntCounter::new(
        "blockvault_pool_pruned_total",
        "Pool entries discarded by prune()"
    ).unwrap();

    // ------------------------------------------------------------------
    // Sequence lock
    // ------------------------------------------------------------------

    pub static ref READ_RETRIES: IntCounter = IntCounter::new(
        "blockvault_read_retries_total",
        "Reader attempts abandoned due to writer interference"
    ).unwrap();

    // ------------------------------------------------------------------
    // Latency
    // ------------------------------------------------------------------

    pub static ref PUSH_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("blockvault_push_duration_seconds", "Database facade push() latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["table"]
    ).unwrap();

    pub static ref VALIDATE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("blockvault_validate_duration_seconds", "Validator phase latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["phase"] // check, accept, connect
    ).unwrap();
}

pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(BLOCKS_PUSHED.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_POPPED.clone()))?;
    REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(REORGANIZATIONS.clone()))?;
    REGISTRY.register(Box::new(REORG_DEPTH.clone()))?;
    REGISTRY.register(Box::new(ORGANIZE_OUTCOMES.clone()))?;
    REGISTRY.register(Box::new(VALIDATION_FAILURES.clone()))?;
    REGISTRY.register(Box::new(ORPHAN_POOL_SIZE.clone()))?;
    REGISTRY.register(Box::new(POOL_PRUNED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READ_RETRIES.clone()))?;
    REGISTRY.register(Box::new(PUSH_DURATION.clone()))?;
    REGISTRY.register(Box::new(VALIDATE_DURATION.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

pub fn record_organize_outcome(outcome: &str) {
    ORGANIZE_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_validation_failure(kind: &str) {
    VALIDATION_FAILURES.with_label_values(&[kind]).inc();
}

/// Wall-clock timer for histogram observations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Timer { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_metrics_does_not_panic() {
        // REGISTRY is process-global and shared across tests in this
        // module; double-registration errors are tolerated here.
        let _ = init_metrics();
    }

    #[test]
    fn gather_includes_registered_metric_names() {
        let _ = init_metrics();
        BLOCKS_PUSHED.inc();
        CHAIN_TIP_HEIGHT.set(12);
        let output = gather_metrics();
        assert!(output.contains("blockvault_blocks_pushed_total"));
        assert!(output.contains("blockvault_chain_tip_height"));
    }

    #[test]
    fn timer_measures_elapsed_time() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_secs() >= 0.01);
    }
}

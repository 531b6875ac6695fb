use prometheus::core::Collector;
use prometheus::{Error as PrometheusError, IntCounter, IntGauge, Registry};

fn register<T: Collector + Clone + 'static>(
    metric: T,
    registry: &Registry,
) -> Result<T, PrometheusError> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Working set metrics.
///
/// Reaching the capacity is handled internally by evicting, it is only visible here.
#[derive(Clone)]
pub struct Metrics {
    resident_entries: IntGauge,
    capacity_exceeded: IntCounter,
    evictions: IntCounter,
    evicted_entries: IntCounter,
    pruned_spent_entries: IntCounter,
    durable_write_failures: IntCounter,
}

impl Metrics {
    pub fn register(registry: &Registry) -> Result<Self, PrometheusError> {
        Ok(Self {
            resident_entries: register(
                IntGauge::new(
                    "subcoin_utxo_resident_entries",
                    "Number of entries held by the UTXO working set",
                )?,
                registry,
            )?,
            capacity_exceeded: register(
                IntCounter::new(
                    "subcoin_utxo_capacity_exceeded_total",
                    "Number of times the UTXO working set reached its capacity",
                )?,
                registry,
            )?,
            evictions: register(
                IntCounter::new(
                    "subcoin_utxo_evictions_total",
                    "Number of evictions from the UTXO working set",
                )?,
                registry,
            )?,
            evicted_entries: register(
                IntCounter::new(
                    "subcoin_utxo_evicted_entries_total",
                    "Number of entries evicted from the UTXO working set",
                )?,
                registry,
            )?,
            pruned_spent_entries: register(
                IntCounter::new(
                    "subcoin_utxo_pruned_spent_entries_total",
                    "Number of spent entries dropped without being persisted",
                )?,
                registry,
            )?,
            durable_write_failures: register(
                IntCounter::new(
                    "subcoin_utxo_durable_write_failures_total",
                    "Number of failed flushes to the durable store",
                )?,
                registry,
            )?,
        })
    }

    pub(crate) fn report_resident(&self, resident: usize) {
        self.resident_entries.set(resident as i64);
    }

    pub(crate) fn report_capacity_exceeded(&self) {
        self.capacity_exceeded.inc();
    }

    pub(crate) fn report_eviction(&self, evicted: usize, pruned_spent: usize) {
        self.evictions.inc();
        self.evicted_entries.inc_by(evicted as u64);
        self.pruned_spent_entries.inc_by(pruned_spent as u64);
    }

    pub(crate) fn report_durable_write_failure(&self) {
        self.durable_write_failures.inc();
    }

    pub fn capacity_exceeded_total(&self) -> u64 {
        self.capacity_exceeded.get()
    }

    pub fn evicted_entries_total(&self) -> u64 {
        self.evicted_entries.get()
    }

    pub fn durable_write_failures_total(&self) -> u64 {
        self.durable_write_failures.get()
    }
}

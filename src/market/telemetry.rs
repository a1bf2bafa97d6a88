// =============================================================================
// Telemetry — lock-free-from-the-producer's-perspective counters and ring
// buffers for percentile estimation, plus the latency-decomposition gauges
// that Consumer and Heartbeat read without touching ConflatedState's mutex.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

use crate::types::ConnectionState;

const RING_CAPACITY: usize = 1024;

/// Fixed-capacity ring buffer. Single producer appends, the telemetry task
/// takes a read snapshot (copy) to compute percentiles without holding up
/// the producer.
struct RingBuffer {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, v: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(v);
    }

    fn percentiles(&self) -> Percentiles {
        if self.values.is_empty() {
            return Percentiles::default();
        }
        let mut copy: Vec<f64> = self.values.iter().copied().collect();
        copy.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Percentiles {
            p50: percentile_of(&copy, 0.50),
            p95: percentile_of(&copy, 0.95),
            p99: percentile_of(&copy, 0.99),
        }
    }
}

fn percentile_of(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// A point-in-time perf snapshot suitable for a `market_perf` event.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PerfSnapshot {
    pub parse_us: Percentiles,
    pub apply_us: Percentiles,
    pub local_pipeline_ms: Percentiles,
    pub ingest_count: u64,
    pub emit_count: u64,
}

pub struct PipelineTelemetry {
    last_agg_id: AtomicU64,
    raw_exchange_latency_ms: AtomicI64,
    clock_offset_ms: AtomicI64,
    adjusted_network_latency_ms: AtomicI64,
    local_pipeline_latency_ms: AtomicI64,
    connection_state: AtomicU8,

    ingest_count: AtomicU64,
    emit_count: AtomicU64,
    protocol_violation_count: AtomicU64,

    parse_us: Mutex<RingBuffer>,
    apply_us: Mutex<RingBuffer>,
    local_pipeline_ms_ring: Mutex<RingBuffer>,
}

impl PipelineTelemetry {
    pub fn new() -> Self {
        Self {
            last_agg_id: AtomicU64::new(0),
            raw_exchange_latency_ms: AtomicI64::new(0),
            clock_offset_ms: AtomicI64::new(0),
            adjusted_network_latency_ms: AtomicI64::new(0),
            local_pipeline_latency_ms: AtomicI64::new(0),
            connection_state: AtomicU8::new(ConnectionState::Stopped.into()),
            ingest_count: AtomicU64::new(0),
            emit_count: AtomicU64::new(0),
            protocol_violation_count: AtomicU64::new(0),
            parse_us: Mutex::new(RingBuffer::new(RING_CAPACITY)),
            apply_us: Mutex::new(RingBuffer::new(RING_CAPACITY)),
            local_pipeline_ms_ring: Mutex::new(RingBuffer::new(RING_CAPACITY)),
        }
    }

    // -- sequence / connection state -----------------------------------

    pub fn last_agg_id(&self) -> u64 {
        self.last_agg_id.load(Ordering::Relaxed)
    }

    pub fn set_last_agg_id(&self, id: u64) {
        self.last_agg_id.store(id, Ordering::Relaxed);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state.load(Ordering::Relaxed).into()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.store(state.into(), Ordering::Relaxed);
    }

    // -- latency decomposition ------------------------------------------

    pub fn set_raw_exchange_latency_ms(&self, v: i64) {
        self.raw_exchange_latency_ms.store(v, Ordering::Relaxed);
        self.recompute_adjusted_latency();
    }

    pub fn raw_exchange_latency_ms(&self) -> i64 {
        self.raw_exchange_latency_ms.load(Ordering::Relaxed)
    }

    pub fn set_clock_offset_ms(&self, v: i64) {
        self.clock_offset_ms.store(v, Ordering::Relaxed);
        self.recompute_adjusted_latency();
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.clock_offset_ms.load(Ordering::Relaxed)
    }

    fn recompute_adjusted_latency(&self) {
        let raw = self.raw_exchange_latency_ms.load(Ordering::Relaxed);
        let offset = self.clock_offset_ms.load(Ordering::Relaxed);
        let adjusted = (raw - offset).max(0);
        self.adjusted_network_latency_ms.store(adjusted, Ordering::Relaxed);
    }

    pub fn adjusted_network_latency_ms(&self) -> i64 {
        self.adjusted_network_latency_ms.load(Ordering::Relaxed)
    }

    /// Legacy fallback `latencyMs`: adjusted if a clock sample has landed,
    /// else the raw exchange latency.
    pub fn legacy_latency_ms(&self) -> i64 {
        if self.clock_offset_ms.load(Ordering::Relaxed) != 0 {
            self.adjusted_network_latency_ms()
        } else {
            self.raw_exchange_latency_ms()
        }
    }

    pub fn set_local_pipeline_latency_ms(&self, v: i64) {
        self.local_pipeline_latency_ms.store(v, Ordering::Relaxed);
        self.local_pipeline_ms_ring.lock().push(v as f64);
    }

    pub fn local_pipeline_latency_ms(&self) -> i64 {
        self.local_pipeline_latency_ms.load(Ordering::Relaxed)
    }

    // -- counters --------------------------------------------------------

    pub fn increment_ingest(&self) {
        self.ingest_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_emit(&self) {
        self.emit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_protocol_violation(&self) -> u64 {
        self.protocol_violation_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn ingest_count(&self) -> u64 {
        self.ingest_count.load(Ordering::Relaxed)
    }

    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }

    // -- ring buffers ------------------------------------------------------

    pub fn record_parse_us(&self, v: f64) {
        self.parse_us.lock().push(v);
    }

    pub fn record_apply_us(&self, v: f64) {
        self.apply_us.lock().push(v);
    }

    /// Snapshot all three ring buffers, compute percentiles, and clear them.
    pub fn perf_snapshot(&self) -> PerfSnapshot {
        let parse = self.parse_us.lock().percentiles();
        let apply = self.apply_us.lock().percentiles();
        let local = self.local_pipeline_ms_ring.lock().percentiles();

        self.parse_us.lock().values.clear();
        self.apply_us.lock().values.clear();
        self.local_pipeline_ms_ring.lock().values.clear();

        PerfSnapshot {
            parse_us: parse,
            apply_us: apply,
            local_pipeline_ms: local,
            ingest_count: self.ingest_count(),
            emit_count: self.emit_count(),
        }
    }
}

impl Default for PipelineTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_trims_to_capacity() {
        let mut rb = RingBuffer::new(4);
        for i in 0..10 {
            rb.push(i as f64);
        }
        assert_eq!(rb.values.len(), 4);
        assert_eq!(rb.values.front().copied(), Some(6.0));
    }

    #[test]
    fn percentiles_of_uniform_series() {
        let mut rb = RingBuffer::new(100);
        for i in 1..=100 {
            rb.push(i as f64);
        }
        let p = rb.percentiles();
        assert_eq!(p.p50, 50.0);
        assert_eq!(p.p99, 99.0);
    }

    #[test]
    fn adjusted_latency_clamps_to_zero() {
        let t = PipelineTelemetry::new();
        t.set_raw_exchange_latency_ms(10);
        t.set_clock_offset_ms(50);
        assert_eq!(t.adjusted_network_latency_ms(), 0);
    }

    #[test]
    fn ingest_count_is_monotonic_and_never_less_than_emit_count() {
        let t = PipelineTelemetry::new();
        t.increment_ingest();
        t.increment_ingest();
        t.increment_emit();
        assert!(t.ingest_count() >= t.emit_count());
    }

    #[test]
    fn perf_snapshot_resets_ring_buffers_but_not_cumulative_counters() {
        let t = PipelineTelemetry::new();
        t.increment_ingest();
        t.record_parse_us(100.0);
        let snap = t.perf_snapshot();
        assert_eq!(snap.parse_us.p50, 100.0);
        assert_eq!(snap.ingest_count, 1);

        let second = t.perf_snapshot();
        assert_eq!(second.parse_us.p50, 0.0);
        assert_eq!(second.ingest_count, 1);
    }
}

// =============================================================================
// SessionKnobs — the subset of a running session's configuration that can be
// refreshed in place by a second `start_market_stream` call with the same
// (marketKind, symbol, timeframe): the WebSocket is not dropped, only these
// values change under the Producer/Consumer's next read.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct SessionKnobs {
    min_notional_usdt_bits: AtomicU64,
    emit_legacy_price_event: AtomicBool,
    emit_legacy_frame_events: AtomicBool,
    perf_telemetry: AtomicBool,
}

impl SessionKnobs {
    pub fn new(
        min_notional_usdt: f64,
        emit_legacy_price_event: bool,
        emit_legacy_frame_events: bool,
        perf_telemetry: bool,
    ) -> Self {
        Self {
            min_notional_usdt_bits: AtomicU64::new(min_notional_usdt.to_bits()),
            emit_legacy_price_event: AtomicBool::new(emit_legacy_price_event),
            emit_legacy_frame_events: AtomicBool::new(emit_legacy_frame_events),
            perf_telemetry: AtomicBool::new(perf_telemetry),
        }
    }

    pub fn min_notional_usdt(&self) -> f64 {
        f64::from_bits(self.min_notional_usdt_bits.load(Ordering::Relaxed))
    }

    pub fn set_min_notional_usdt(&self, v: f64) {
        self.min_notional_usdt_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn emit_legacy_price_event(&self) -> bool {
        self.emit_legacy_price_event.load(Ordering::Relaxed)
    }

    pub fn set_emit_legacy_price_event(&self, v: bool) {
        self.emit_legacy_price_event.store(v, Ordering::Relaxed);
    }

    pub fn emit_legacy_frame_events(&self) -> bool {
        self.emit_legacy_frame_events.load(Ordering::Relaxed)
    }

    pub fn set_emit_legacy_frame_events(&self, v: bool) {
        self.emit_legacy_frame_events.store(v, Ordering::Relaxed);
    }

    pub fn perf_telemetry(&self) -> bool {
        self.perf_telemetry.load(Ordering::Relaxed)
    }

    pub fn set_perf_telemetry(&self, v: bool) {
        self.perf_telemetry.store(v, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_are_visible_through_shared_handle() {
        let knobs = std::sync::Arc::new(SessionKnobs::new(100.0, false, false, false));
        let other = knobs.clone();
        other.set_min_notional_usdt(500.0);
        other.set_emit_legacy_price_event(true);
        assert_eq!(knobs.min_notional_usdt(), 500.0);
        assert!(knobs.emit_legacy_price_event());
    }
}

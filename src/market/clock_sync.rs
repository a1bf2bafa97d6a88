// =============================================================================
// ClockSync — periodic server-time fetch with an EWMA-smoothed offset, fed
// into Telemetry's latency decomposition. Suspends only on I/O.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::market::shutdown::ShutdownSignal;

use crate::exchange::ExchangeClient;

use super::telemetry::PipelineTelemetry;

const EWMA_ALPHA: f64 = 0.25;

/// Smooths successive `server_time_ms - local_time_ms` samples. First sample
/// is taken as-is; afterwards `new = alpha*sample + (1-alpha)*prev`.
pub struct ClockOffsetEstimator {
    smoothed_ms: Option<f64>,
}

impl ClockOffsetEstimator {
    pub fn new() -> Self {
        Self { smoothed_ms: None }
    }

    pub fn sample(&mut self, offset_ms: f64) -> f64 {
        let next = match self.smoothed_ms {
            None => offset_ms,
            Some(prev) => EWMA_ALPHA * offset_ms + (1.0 - EWMA_ALPHA) * prev,
        };
        self.smoothed_ms = Some(next);
        next
    }

    pub fn current(&self) -> Option<f64> {
        self.smoothed_ms
    }
}

impl Default for ClockOffsetEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs until `cancel` fires, refreshing `telemetry.clock_offset_ms` every
/// `interval_ms`, jittered +/-10%.
pub async fn run_clock_sync(
    client: Arc<ExchangeClient>,
    telemetry: Arc<PipelineTelemetry>,
    interval_ms: u64,
    mut shutdown: ShutdownSignal,
) {
    let mut estimator = ClockOffsetEstimator::new();

    loop {
        let local_before = now_ms();
        match client.fetch_server_time().await {
            Ok(server_ms) => {
                let local_after = now_ms();
                let local_mid = (local_before + local_after) / 2;
                let raw_offset = (server_ms - local_mid) as f64;
                let smoothed = estimator.sample(raw_offset);
                telemetry.set_clock_offset_ms(smoothed as i64);
                debug!(raw_offset_ms = raw_offset, smoothed_offset_ms = smoothed, "clock sync sample");
            }
            Err(e) => {
                warn!(error = %e, "clock sync fetch_server_time failed, keeping previous offset");
            }
        }

        let jitter = rand::thread_rng().gen_range(-0.10..=0.10);
        let delay_ms = (interval_ms as f64 * (1.0 + jitter)).max(0.0) as u64;

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_taken_as_is() {
        let mut e = ClockOffsetEstimator::new();
        assert_eq!(e.sample(100.0), 100.0);
    }

    #[test]
    fn ewma_converges_toward_a_step_within_a_few_samples() {
        let mut e = ClockOffsetEstimator::new();
        e.sample(0.0);
        for _ in 0..4 {
            e.sample(100.0);
        }
        let converged = e.current().unwrap();
        assert!((converged - 100.0).abs() < 5.0, "expected near-convergence, got {converged}");
    }
}

// =============================================================================
// PipelineError — the six named error kinds at the Controller/command
// boundary. Everything below this boundary uses anyhow::Result with .context;
// it is narrowed into one of these variants only where it must become
// caller-visible or drive a ConnectionState transition.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid argument `{field}`: {reason}")]
    InvalidArgs { field: String, reason: String },

    #[error("transient network failure: {reason}")]
    NetworkTransient { reason: String },

    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("sequence gap: missed {missed} trade(s) after id {last_agg_id}")]
    SequenceGap { last_agg_id: u64, missed: u64 },

    #[error("fatal rejection from exchange: {reason}")]
    FatalRejection { reason: String },

    #[error("internal invariant violated: {reason}")]
    InternalInvariant { reason: String },

    #[error("a start_market_stream call is already in progress")]
    AlreadyStarting,
}

impl PipelineError {
    /// Human-readable `reason` string suitable for a `market_status` event.
    pub fn status_reason(&self) -> String {
        self.to_string()
    }

    /// Whether this error kind is surfaced as a failed command response
    /// (as opposed to being absorbed into `market_status`).
    pub fn is_command_visible(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidArgs { .. }
                | PipelineError::FatalRejection { .. }
                | PipelineError::AlreadyStarting
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_args_and_fatal_rejection_are_command_visible() {
        let invalid = PipelineError::InvalidArgs {
            field: "emitIntervalMs".into(),
            reason: "must be >= 8".into(),
        };
        assert!(invalid.is_command_visible());

        let fatal = PipelineError::FatalRejection {
            reason: "invalid symbol".into(),
        };
        assert!(fatal.is_command_visible());
    }

    #[test]
    fn network_transient_and_sequence_gap_are_not_command_visible() {
        let net = PipelineError::NetworkTransient {
            reason: "connect reset".into(),
        };
        assert!(!net.is_command_visible());

        let gap = PipelineError::SequenceGap {
            last_agg_id: 101,
            missed: 3,
        };
        assert!(!gap.is_command_visible());
        assert!(gap.status_reason().contains("missed=3") || gap.status_reason().contains("missed 3"));
    }
}

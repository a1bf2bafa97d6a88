// =============================================================================
// Process-level configuration — bind address, admin token source, and the
// session defaults from which a `start_market_stream` call fills in whatever
// the caller omitted. Loaded once at startup; `start_market_stream` arguments
// are never read from disk.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

fn default_bind_addr() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_market_kind() -> String {
    "spot".to_string()
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_timeframe() -> String {
    "1m".to_string()
}

fn default_min_notional_usdt() -> f64 {
    100.0
}

fn default_emit_interval_ms() -> u64 {
    8
}

fn default_clock_sync_interval_ms() -> u64 {
    30_000
}

fn default_history_limit() -> u32 {
    1_000
}

/// Process-wide settings plus the session defaults `start_market_stream`
/// falls back to. Mirrors the clamped defaults named in the component design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_market_kind")]
    pub default_market_kind: String,

    #[serde(default = "default_symbol")]
    pub default_symbol: String,

    #[serde(default = "default_timeframe")]
    pub default_timeframe: String,

    #[serde(default = "default_min_notional_usdt")]
    pub default_min_notional_usdt: f64,

    #[serde(default = "default_emit_interval_ms")]
    pub default_emit_interval_ms: u64,

    #[serde(default = "default_clock_sync_interval_ms")]
    pub default_clock_sync_interval_ms: u64,

    #[serde(default = "default_history_limit")]
    pub default_history_limit: u32,

    #[serde(default)]
    pub default_mock_mode: bool,

    #[serde(default)]
    pub default_perf_telemetry: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            default_market_kind: default_market_kind(),
            default_symbol: default_symbol(),
            default_timeframe: default_timeframe(),
            default_min_notional_usdt: default_min_notional_usdt(),
            default_emit_interval_ms: default_emit_interval_ms(),
            default_clock_sync_interval_ms: default_clock_sync_interval_ms(),
            default_history_limit: default_history_limit(),
            default_mock_mode: false,
            default_perf_telemetry: false,
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file, falling back to defaults (with a logged
    /// warning) if the file is missing or malformed.
    pub fn load(path: &str) -> Result<Self> {
        if !std::path::Path::new(path).exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading runtime config at {path}"))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing runtime config at {path}"))?;
        Ok(cfg)
    }

    /// Persist via write-to-temp-then-rename so a crash mid-write never
    /// leaves a truncated config file behind.
    pub fn save(&self, path: &str) -> Result<()> {
        let tmp_path = format!("{path}.tmp");
        let body = serde_json::to_string_pretty(self).context("serialising runtime config")?;
        std::fs::write(&tmp_path, body).with_context(|| format!("writing {tmp_path}"))?;
        std::fs::rename(&tmp_path, path).with_context(|| format!("renaming {tmp_path} to {path}"))?;
        Ok(())
    }

    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, path, "failed to load runtime config, using defaults");
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.default_symbol, "BTCUSDT");
        assert_eq!(cfg.default_emit_interval_ms, 8);
        assert_eq!(cfg.default_history_limit, 1_000);
        assert!(!cfg.default_mock_mode);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.default_market_kind, "spot");
        assert_eq!(cfg.default_clock_sync_interval_ms, 30_000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let cfg: RuntimeConfig =
            serde_json::from_str(r#"{"default_symbol": "ETHUSDT"}"#).unwrap();
        assert_eq!(cfg.default_symbol, "ETHUSDT");
        assert_eq!(cfg.default_timeframe, "1m");
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bind_addr, cfg.bind_addr);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let cfg = RuntimeConfig::load("/tmp/this-config-does-not-exist.json").unwrap();
        assert_eq!(cfg.default_symbol, "BTCUSDT");
    }
}

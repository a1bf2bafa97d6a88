// =============================================================================
// Tagged variants shared across the pipeline — market kind, timeframe,
// startup mode, connection state. Exhaustive matching everywhere, no runtime
// inheritance.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange endpoint family. Selects host, path prefixes, and response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    Spot,
    FuturesUsdm,
}

impl Default for MarketKind {
    fn default() -> Self {
        MarketKind::Spot
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketKind::Spot => write!(f, "spot"),
            MarketKind::FuturesUsdm => write!(f, "futures_usdm"),
        }
    }
}

/// OHLCV bucket size. `bucket_seconds` gives the nominal width in seconds;
/// month is nominal (30 days), not calendar-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Month1,
}

impl Timeframe {
    /// Bucket width in whole seconds.
    pub fn bucket_seconds(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::H1 => 60 * 60,
            Timeframe::H4 => 4 * 60 * 60,
            Timeframe::D1 => 24 * 60 * 60,
            Timeframe::W1 => 7 * 24 * 60 * 60,
            Timeframe::Month1 => 2_592_000,
        }
    }

    /// Bucket width in milliseconds, the unit trade timestamps arrive in.
    pub fn bucket_ms(self) -> i64 {
        self.bucket_seconds() * 1000
    }

    /// The exchange's own interval string, e.g. for `/klines?interval=`.
    pub fn as_exchange_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
            Timeframe::Month1 => "1M",
        }
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::M1
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_exchange_str())
    }
}

/// Ordering of WebSocket-vs-history bootstrap on start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    LiveFirst,
    HistoryFirst,
}

impl Default for StartupMode {
    fn default() -> Self {
        StartupMode::LiveFirst
    }
}

/// Connection state machine: `stopped -> connecting -> live`, with
/// `desynced`/`reconnecting` excursions and a terminal `error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Live,
    Desynced,
    Reconnecting,
    Stopped,
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Stopped
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Live => "live",
            ConnectionState::Desynced => "desynced",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
            ConnectionState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Encode a [`ConnectionState`] into the `u8` an atomic gauge can hold.
impl From<ConnectionState> for u8 {
    fn from(s: ConnectionState) -> u8 {
        match s {
            ConnectionState::Connecting => 0,
            ConnectionState::Live => 1,
            ConnectionState::Desynced => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Stopped => 4,
            ConnectionState::Error => 5,
        }
    }
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Live,
            2 => ConnectionState::Desynced,
            3 => ConnectionState::Reconnecting,
            5 => ConnectionState::Error,
            _ => ConnectionState::Stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_seconds_matches_spec_table() {
        assert_eq!(Timeframe::M1.bucket_seconds(), 60);
        assert_eq!(Timeframe::M5.bucket_seconds(), 300);
        assert_eq!(Timeframe::H1.bucket_seconds(), 3600);
        assert_eq!(Timeframe::H4.bucket_seconds(), 14_400);
        assert_eq!(Timeframe::D1.bucket_seconds(), 86_400);
        assert_eq!(Timeframe::W1.bucket_seconds(), 604_800);
        assert_eq!(Timeframe::Month1.bucket_seconds(), 2_592_000);
    }

    #[test]
    fn connection_state_roundtrips_through_u8() {
        for s in [
            ConnectionState::Connecting,
            ConnectionState::Live,
            ConnectionState::Desynced,
            ConnectionState::Reconnecting,
            ConnectionState::Stopped,
            ConnectionState::Error,
        ] {
            let encoded: u8 = s.into();
            let decoded: ConnectionState = encoded.into();
            assert_eq!(decoded, s);
        }
    }

    #[test]
    fn market_kind_default_is_spot() {
        assert_eq!(MarketKind::default(), MarketKind::Spot);
    }

    #[test]
    fn startup_mode_default_is_live_first() {
        assert_eq!(StartupMode::default(), StartupMode::LiveFirst);
    }
}

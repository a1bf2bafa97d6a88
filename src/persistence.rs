// =============================================================================
// Persistence repository — user preferences singleton plus scoped chart
// drawings. An external collaborator: never touched on the hot path, invoked
// only from the command surface. Backed by a single JSON file written
// atomically (write-to-temp-then-rename), matching the rest of the process's
// config persistence discipline.
// =============================================================================

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{MarketKind, Timeframe};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPreferences {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub magnet_strong: bool,
    pub updated_at_ms: i64,
}

impl Default for MarketPreferences {
    fn default() -> Self {
        Self {
            market_kind: MarketKind::Spot,
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M1,
            magnet_strong: false,
            updated_at_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DrawingScope {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drawing {
    pub id: String,
    pub drawing_type: String,
    /// `#RRGGBB`, uppercase.
    pub color: String,
    pub label: Option<String>,
    pub payload_json: serde_json::Value,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Document {
    preferences: Option<MarketPreferences>,
    drawings: Vec<(DrawingScope, Drawing)>,
}

pub trait PreferencesRepository: Send + Sync {
    fn get_preferences(&self) -> Result<MarketPreferences>;
    fn set_preferences(&self, prefs: MarketPreferences) -> Result<()>;
    fn list_drawings(&self, scope: &DrawingScope) -> Result<Vec<Drawing>>;
    fn upsert_drawing(&self, scope: DrawingScope, drawing: Drawing) -> Result<()>;
    fn delete_drawing(&self, scope: &DrawingScope, id: &str) -> Result<()>;
}

/// JSON-file-backed implementation. Defaults are written on first open, as
/// required by the persisted-state layout.
pub struct JsonFileRepository {
    path: String,
    doc: Mutex<Document>,
}

impl JsonFileRepository {
    pub fn open(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let doc = if std::path::Path::new(&path).exists() {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?
        } else {
            Document {
                preferences: Some(MarketPreferences::default()),
                drawings: Vec::new(),
            }
        };
        let repo = Self { path, doc: Mutex::new(doc) };
        repo.flush()?;
        Ok(repo)
    }

    fn flush(&self) -> Result<()> {
        let doc = self.doc.lock();
        let tmp_path = format!("{}.tmp", self.path);
        let body = serde_json::to_string_pretty(&*doc).context("serialising persisted state")?;
        std::fs::write(&tmp_path, body).with_context(|| format!("writing {tmp_path}"))?;
        std::fs::rename(&tmp_path, &self.path).with_context(|| format!("renaming {tmp_path} to {}", self.path))?;
        Ok(())
    }
}

impl PreferencesRepository for JsonFileRepository {
    fn get_preferences(&self) -> Result<MarketPreferences> {
        Ok(self.doc.lock().preferences.clone().unwrap_or_default())
    }

    fn set_preferences(&self, prefs: MarketPreferences) -> Result<()> {
        self.doc.lock().preferences = Some(prefs);
        self.flush()
    }

    fn list_drawings(&self, scope: &DrawingScope) -> Result<Vec<Drawing>> {
        let doc = self.doc.lock();
        Ok(doc
            .drawings
            .iter()
            .filter(|(s, _)| s == scope)
            .map(|(_, d)| d.clone())
            .collect())
    }

    fn upsert_drawing(&self, scope: DrawingScope, drawing: Drawing) -> Result<()> {
        {
            let mut doc = self.doc.lock();
            if let Some(entry) = doc
                .drawings
                .iter_mut()
                .find(|(s, d)| *s == scope && d.id == drawing.id)
            {
                entry.1 = drawing;
            } else {
                doc.drawings.push((scope, drawing));
            }
        }
        self.flush()
    }

    fn delete_drawing(&self, scope: &DrawingScope, id: &str) -> Result<()> {
        {
            let mut doc = self.doc.lock();
            doc.drawings.retain(|(s, d)| !(s == scope && d.id == id));
        }
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> String {
        format!("/tmp/aggflow-test-{name}-{}.json", std::process::id())
    }

    fn scope() -> DrawingScope {
        DrawingScope {
            market_kind: MarketKind::Spot,
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M1,
        }
    }

    #[test]
    fn opening_a_fresh_path_writes_default_preferences() {
        let path = temp_path("defaults");
        let _ = std::fs::remove_file(&path);
        let repo = JsonFileRepository::open(&path).unwrap();
        let prefs = repo.get_preferences().unwrap();
        assert_eq!(prefs.symbol, "BTCUSDT");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn upsert_and_list_drawings_round_trip() {
        let path = temp_path("drawings");
        let _ = std::fs::remove_file(&path);
        let repo = JsonFileRepository::open(&path).unwrap();

        let drawing = Drawing {
            id: "d1".into(),
            drawing_type: "trendline".into(),
            color: "#FF0000".into(),
            label: None,
            payload_json: serde_json::json!({"x1": 0, "y1": 0}),
            created_at_ms: 1,
            updated_at_ms: 1,
        };
        repo.upsert_drawing(scope(), drawing.clone()).unwrap();

        let listed = repo.list_drawings(&scope()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "d1");

        repo.delete_drawing(&scope(), "d1").unwrap();
        assert!(repo.list_drawings(&scope()).unwrap().is_empty());
        std::fs::remove_file(&path).ok();
    }
}

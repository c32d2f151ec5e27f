//! Typed structured payload attached to every crawl result.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Extraction technique that produced a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Jsonld,
    Og,
    Microdata,
    Script,
    Ml,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Jsonld => "jsonld",
            SourceKind::Og => "og",
            SourceKind::Microdata => "microdata",
            SourceKind::Script => "script",
            SourceKind::Ml => "ml",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown extraction source: {0}")]
pub struct UnknownSource(pub String);

impl std::str::FromStr for SourceKind {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jsonld" | "json-ld" => Ok(SourceKind::Jsonld),
            "og" | "opengraph" => Ok(SourceKind::Og),
            "microdata" => Ok(SourceKind::Microdata),
            "script" => Ok(SourceKind::Script),
            "ml" => Ok(SourceKind::Ml),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceReading {
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MlReading {
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    pub confidence: f64,
}

/// One reading per extraction source, tagged by `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ExtractionSource {
    Jsonld(SourceReading),
    Og(SourceReading),
    Microdata(SourceReading),
    Script(SourceReading),
    Ml(MlReading),
}

impl ExtractionSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            ExtractionSource::Jsonld(_) => SourceKind::Jsonld,
            ExtractionSource::Og(_) => SourceKind::Og,
            ExtractionSource::Microdata(_) => SourceKind::Microdata,
            ExtractionSource::Script(_) => SourceKind::Script,
            ExtractionSource::Ml(_) => SourceKind::Ml,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            ExtractionSource::Ml(reading) => Some(reading.confidence),
            _ => None,
        }
    }
}

/// Why a crawl failed, kept for later analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub will_retry: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredPayload {
    #[serde(default)]
    pub sources: Vec<ExtractionSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

impl StructuredPayload {
    pub fn has_source(&self, kind: SourceKind) -> bool {
        self.sources.iter().any(|s| s.kind() == kind)
    }

    /// Lowest confidence reported by any ML reading.
    pub fn ml_confidence(&self) -> Option<f64> {
        self.sources
            .iter()
            .filter_map(ExtractionSource::confidence)
            .reduce(f64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tagged_sources() {
        let payload: StructuredPayload = serde_json::from_value(json!({
            "sources": [
                {"source": "jsonld", "price": "19.99", "currency": "USD"},
                {"source": "ml", "price": 19.5, "confidence": 0.72}
            ]
        }))
        .unwrap();

        assert!(payload.has_source(SourceKind::Jsonld));
        assert!(!payload.has_source(SourceKind::Og));
        assert_eq!(payload.ml_confidence(), Some(0.72));
        assert!(payload.failure.is_none());
    }

    #[test]
    fn rejects_unknown_source_tags() {
        let parsed = serde_json::from_value::<StructuredPayload>(json!({
            "sources": [{"source": "guess", "price": "1"}]
        }));
        assert!(parsed.is_err());
        assert!("guess".parse::<SourceKind>().is_err());
        assert_eq!("JSON-LD".parse::<SourceKind>().unwrap(), SourceKind::Jsonld);
    }
}

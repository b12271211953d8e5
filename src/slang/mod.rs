//! Slang entries and the sources that produce them.
//! A source resolves a term (or picks one), looks it up in a community
//! dictionary and runs the definition through LLM enrichment.

pub mod cache;
pub mod curated;
pub mod openai;
pub mod service;
pub mod urban;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Social appropriateness of a slang term, assigned by enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Careful,
    Avoid,
}

impl RiskLevel {
    /// Fixed scan order used when no specific level is requested.
    pub const PRIORITY: [RiskLevel; 3] = [RiskLevel::Safe, RiskLevel::Careful, RiskLevel::Avoid];

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Careful => "careful",
            RiskLevel::Avoid => "avoid",
        }
    }

    /// Lenient parse of a model-produced label: `"safe（普通に使える）"` → Safe.
    pub fn parse_label(raw: &str) -> Option<Self> {
        let word: String = raw
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_lowercase();
        match word.as_str() {
            "safe" => Some(RiskLevel::Safe),
            "careful" => Some(RiskLevel::Careful),
            "avoid" => Some(RiskLevel::Avoid),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Casual,
    Polite,
    Serious,
    Playful,
}

impl Tone {
    pub fn as_str(self) -> &'static str {
        match self {
            Tone::Casual => "casual",
            Tone::Polite => "polite",
            Tone::Serious => "serious",
            Tone::Playful => "playful",
        }
    }

    /// Unknown or missing labels fall back to `Casual`.
    pub fn parse_label(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "polite" => Tone::Polite,
            "serious" => Tone::Serious,
            "playful" => Tone::Playful,
            _ => Tone::Casual,
        }
    }
}

/// Where seed terms come from when the caller asks for a random entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Curated,
    Random,
}

impl SourceMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "curated" => Some(SourceMode::Curated),
            "random" => Some(SourceMode::Random),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceMode::Curated => "curated",
            SourceMode::Random => "random",
        }
    }
}

/// Term requested from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermQuery {
    Random,
    Phrase(String),
}

impl TermQuery {
    /// `None`, empty and `"random"` all mean "pick one for me".
    pub fn from_param(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") | Some("random") => TermQuery::Random,
            Some(term) => TermQuery::Phrase(term.to_string()),
        }
    }
}

/// A fully enriched slang item. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlangEntry {
    pub phrase: String,
    #[serde(rename = "reading_hint_ja", default)]
    pub reading_hint: Option<String>,
    #[serde(rename = "meaning_ja")]
    pub meaning: String,
    #[serde(rename = "nuance_ja", default)]
    pub nuance: Option<String>,
    #[serde(rename = "example_en", default)]
    pub example_foreign: Option<String>,
    #[serde(rename = "example_ja", default)]
    pub example_native: Option<String>,
    #[serde(default)]
    pub tone: Tone,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(rename = "popularity_score", default)]
    pub popularity: f64,
}

pub(crate) fn default_region() -> String {
    "global".to_string()
}

impl SlangEntry {
    /// Checks the invariants enrichment output must satisfy.
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.phrase.trim().is_empty() {
            return Err(FetchError::Enrichment("empty phrase".into()));
        }
        if self.meaning.trim().is_empty() {
            return Err(FetchError::Enrichment("empty meaning".into()));
        }
        if !self.popularity.is_finite() || self.popularity < 0.0 {
            return Err(FetchError::Enrichment(format!(
                "invalid popularity {}",
                self.popularity
            )));
        }
        Ok(())
    }
}

/// Why a single fetch attempt produced no entry.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("dictionary lookup failed: {0}")]
    Dictionary(String),
    #[error("no dictionary entry for {0:?}")]
    NotFound(String),
    #[error("enrichment failed: {0}")]
    Enrichment(String),
    #[error("missing upstream credential: {0}")]
    MissingCredential(&'static str),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("upstream timeout")]
    Timeout,
    #[error("http error: {0}")]
    Http(String),
}

/// Produces one enriched entry per call. Implementations must be safe to call
/// concurrently; a batch is many in-flight calls on the same source.
#[async_trait]
pub trait SlangSource: Send + Sync {
    async fn fetch_one(&self, term: &TermQuery, mode: SourceMode) -> Result<SlangEntry, FetchError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn entry(phrase: &str, risk_level: RiskLevel) -> SlangEntry {
        SlangEntry {
            phrase: phrase.to_string(),
            reading_hint: None,
            meaning: format!("meaning of {phrase}"),
            nuance: None,
            example_foreign: None,
            example_native: None,
            tone: Tone::Casual,
            risk_level,
            tags: Vec::new(),
            region: default_region(),
            popularity: 0.0,
        }
    }
}

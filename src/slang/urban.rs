//! Community dictionary lookups (Urban Dictionary JSON API).

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::FetchError;

/// One raw community definition.
#[derive(Debug, Clone, Deserialize)]
pub struct DictionaryDefinition {
    pub word: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub example: String,
    #[serde(default)]
    pub thumbs_up: u64,
    #[serde(default)]
    pub thumbs_down: u64,
}

#[derive(Debug, Deserialize)]
struct DefineResponse {
    #[serde(default)]
    list: Vec<DictionaryDefinition>,
}

/// What to ask the dictionary for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Define(String),
    Random,
}

impl std::fmt::Display for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lookup::Define(term) => write!(f, "define:{term}"),
            Lookup::Random => write!(f, "random"),
        }
    }
}

#[async_trait]
pub trait Dictionary: Send + Sync {
    /// All definitions returned for the lookup, unsorted.
    async fn lookup(&self, lookup: &Lookup) -> Result<Vec<DictionaryDefinition>, FetchError>;
}

pub struct UrbanDictionary {
    http: reqwest::Client,
    base_url: String,
}

impl UrbanDictionary {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FetchError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Dictionary for UrbanDictionary {
    async fn lookup(&self, lookup: &Lookup) -> Result<Vec<DictionaryDefinition>, FetchError> {
        let request = match lookup {
            Lookup::Define(term) => self
                .http
                .get(format!("{}/v0/define", self.base_url))
                .query(&[("term", term.as_str())]),
            Lookup::Random => self.http.get(format!("{}/v0/random", self.base_url)),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Dictionary(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(FetchError::Dictionary(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let body: DefineResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Dictionary(format!("bad response body: {e}")))?;
        debug!(%lookup, definitions = body.list.len(), "dictionary lookup done");
        Ok(body.list)
    }
}

/// Picks the most up-voted definition.
pub fn best_definition(mut definitions: Vec<DictionaryDefinition>) -> Option<DictionaryDefinition> {
    definitions.sort_by(|a, b| b.thumbs_up.cmp(&a.thumbs_up));
    definitions.into_iter().next()
}

/// Strips the `[linked term]` markup the dictionary embeds in text.
pub fn strip_link_markup(text: &str) -> String {
    static BRACKETS: OnceLock<Regex> = OnceLock::new();
    let re = BRACKETS.get_or_init(|| Regex::new(r"[\[\]]").expect("static regex"));
    re.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(word: &str, up: u64) -> DictionaryDefinition {
        DictionaryDefinition {
            word: word.into(),
            definition: String::new(),
            example: String::new(),
            thumbs_up: up,
            thumbs_down: 0,
        }
    }

    #[test]
    fn most_upvoted_wins() {
        let best = best_definition(vec![def("a", 3), def("b", 40), def("c", 7)]).unwrap();
        assert_eq!(best.word, "b");
        assert!(best_definition(Vec::new()).is_none());
    }

    #[test]
    fn link_markup_removed() {
        assert_eq!(
            strip_link_markup("when someone is [lowkey] [into] you "),
            "when someone is lowkey into you"
        );
    }

    #[test]
    fn response_body_tolerates_missing_fields() {
        let body: DefineResponse =
            serde_json::from_str(r#"{"list":[{"word":"bet","thumbs_up":5}]}"#).unwrap();
        assert_eq!(body.list.len(), 1);
        assert_eq!(body.list[0].definition, "");
        let empty: DefineResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.list.is_empty());
    }
}

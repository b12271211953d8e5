//! LLM enrichment client (OpenAI-compatible chat/completions).
//! Connection pooling via reqwest, JSON-object responses, simple min-interval
//! pacing, bounded retries on 429/5xx/timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::urban::DictionaryDefinition;
use super::{default_region, FetchError, RiskLevel, SlangEntry, Tone};

/// Turns a raw dictionary definition into a learner-facing entry.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, definition: &DictionaryDefinition) -> Result<SlangEntry, FetchError>;
}

#[derive(Debug, Clone)]
pub struct EnricherConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub min_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com".into(),
            model: "gpt-4o".into(),
            min_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// How often a failed completion request is tried again.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    /// 429 retries; waits follow Retry-After, else 1s, 2s, 4s.
    rate_limited: u32,
    /// 5xx retries; waits 500ms, 1s.
    server_error: u32,
    /// A timed-out request is resent once, immediately.
    timeout: u32,
}

const RETRY: RetryPolicy = RetryPolicy {
    rate_limited: 3,
    server_error: 2,
    timeout: 1,
};

/// Spaces requests at least `interval` apart across all callers.
struct Pacer {
    interval: Duration,
    next_slot: tokio::sync::Mutex<Instant>,
}

impl Pacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    async fn wait_turn(&self) {
        let mut slot = self.next_slot.lock().await;
        let now = Instant::now();
        if *slot > now {
            tokio::time::sleep(*slot - now).await;
        }
        *slot = Instant::now() + self.interval;
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub struct OpenAiEnricher {
    http: reqwest::Client,
    /// Checked per call: a missing key fails each fetch, not startup.
    api_key: Option<String>,
    endpoint: String,
    model: String,
    pacer: Arc<Pacer>,
}

impl OpenAiEnricher {
    pub fn new(config: EnricherConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FetchError::Http(e.to_string()))?;

        Ok(Self {
            http,
            api_key: config.api_key.filter(|k| !k.trim().is_empty()),
            endpoint: format!(
                "{}/v1/chat/completions",
                config.base_url.trim_end_matches('/')
            ),
            model: config.model,
            pacer: Arc::new(Pacer::new(config.min_interval)),
        })
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    async fn post_completion(
        &self,
        api_key: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, FetchError> {
        let (mut rate_limited, mut server_errors, mut timeouts) = (0u32, 0u32, 0u32);

        loop {
            let sent = self
                .http
                .post(&self.endpoint)
                .bearer_auth(api_key)
                .json(body)
                .send()
                .await;

            let resp = match sent {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    if timeouts >= RETRY.timeout {
                        return Err(FetchError::Timeout);
                    }
                    timeouts += 1;
                    warn!("enrichment request timed out, resending");
                    continue;
                }
                Err(e) => return Err(FetchError::Http(e.to_string())),
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after(&resp)
                    .unwrap_or_else(|| Duration::from_secs(1 << rate_limited));
                if rate_limited >= RETRY.rate_limited {
                    return Err(FetchError::RateLimited {
                        retry_after_ms: wait.as_millis() as u64,
                    });
                }
                rate_limited += 1;
                warn!(attempt = rate_limited, wait_ms = wait.as_millis() as u64, "enrichment rate limited");
                tokio::time::sleep(wait).await;
            } else if status.is_server_error() {
                if server_errors >= RETRY.server_error {
                    return Err(FetchError::Http(format!("enrichment upstream {status}")));
                }
                let wait = Duration::from_millis(500 << server_errors);
                server_errors += 1;
                warn!(
                    attempt = server_errors,
                    status = status.as_u16(),
                    wait_ms = wait.as_millis() as u64,
                    "enrichment upstream error"
                );
                tokio::time::sleep(wait).await;
            } else {
                let detail: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
                return Err(FetchError::Http(format!("enrichment rejected ({status}): {detail}")));
            }
        }
    }
}

#[async_trait]
impl Enricher for OpenAiEnricher {
    async fn enrich(&self, definition: &DictionaryDefinition) -> Result<SlangEntry, FetchError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(FetchError::MissingCredential("OPENAI_API_KEY"))?;

        self.pacer.wait_turn().await;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_user_prompt(definition)}
            ],
            "temperature": 0.7,
            "max_tokens": 1000,
            "response_format": {"type": "json_object"}
        });

        let started = Instant::now();
        let response = self.post_completion(api_key, &body).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| FetchError::Enrichment(format!("bad completion body: {e}")))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| FetchError::Enrichment("empty completion".into()))?;

        debug!(
            word = %definition.word,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "enrichment completed"
        );
        parse_enrichment(&content, definition.thumbs_up as f64)
    }
}

const SYSTEM_PROMPT: &str = "You explain English slang to Japanese learners. \
Given a slang term and its community dictionary definition, reply with one JSON object:
{\"phrase\": \"the slang as-is\", \"reading_hint_ja\": \"katakana reading\", \
\"meaning_ja\": \"short meaning in Japanese\", \"nuance_ja\": \"when and with what feeling it is used, in Japanese\", \
\"example_en\": \"English example\", \"example_ja\": \"Japanese translation of the example\", \
\"tone\": \"casual|playful|serious|polite\", \"risk_level\": \"safe|careful|avoid\", \
\"region\": \"global|US|UK|internet\", \"tags\": [\"tag\"]}
risk_level: safe = fine with anyone; careful = close friends or casual settings only, easy to misread; \
avoid = insulting, discriminatory, vulgar or likely to cause trouble.";

fn build_user_prompt(definition: &DictionaryDefinition) -> String {
    format!(
        "Slang: {:?}\nDefinition: {:?}\nExample: {:?}\nVotes: +{} / -{}",
        definition.word,
        definition.definition,
        definition.example,
        definition.thumbs_up,
        definition.thumbs_down
    )
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Model output before validation; every field is optional here so that a
/// missing required field reports which one.
#[derive(Deserialize)]
struct RawEnrichment {
    phrase: Option<String>,
    reading_hint_ja: Option<String>,
    meaning_ja: Option<String>,
    nuance_ja: Option<String>,
    example_en: Option<String>,
    example_ja: Option<String>,
    tone: Option<String>,
    risk_level: Option<String>,
    region: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parses and validates the model's JSON object.
pub fn parse_enrichment(content: &str, popularity: f64) -> Result<SlangEntry, FetchError> {
    let raw: RawEnrichment = serde_json::from_str(content.trim())
        .map_err(|e| FetchError::Enrichment(format!("malformed JSON: {e}")))?;

    let phrase = non_blank(raw.phrase).ok_or_else(|| FetchError::Enrichment("missing phrase".into()))?;
    let meaning =
        non_blank(raw.meaning_ja).ok_or_else(|| FetchError::Enrichment("missing meaning_ja".into()))?;
    let risk_label =
        non_blank(raw.risk_level).ok_or_else(|| FetchError::Enrichment("missing risk_level".into()))?;
    let risk_level = RiskLevel::parse_label(&risk_label)
        .ok_or_else(|| FetchError::Enrichment(format!("unknown risk_level {risk_label:?}")))?;

    let entry = SlangEntry {
        phrase,
        reading_hint: non_blank(raw.reading_hint_ja),
        meaning,
        nuance: non_blank(raw.nuance_ja),
        example_foreign: non_blank(raw.example_en),
        example_native: non_blank(raw.example_ja),
        tone: raw.tone.as_deref().map(Tone::parse_label).unwrap_or_default(),
        risk_level,
        tags: raw
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        region: non_blank(raw.region).unwrap_or_else(default_region),
        popularity: popularity.max(0.0),
    };
    entry.validate()?;
    Ok(entry)
}

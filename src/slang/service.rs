//! The production `SlangSource`: resolve a term, look it up in the community
//! dictionary, enrich it (or reuse a cached enrichment) and hand the result
//! to persistence without waiting for the write.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::cache::EnrichmentCache;
use super::curated::CuratedTerms;
use super::openai::Enricher;
use super::urban::{best_definition, strip_link_markup, Dictionary, Lookup};
use super::{FetchError, SlangEntry, SlangSource, SourceMode, TermQuery};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::store::SlangPersistence;

pub struct SlangService {
    dictionary: Arc<dyn Dictionary>,
    enricher: Arc<dyn Enricher>,
    curated: CuratedTerms,
    cache: Arc<EnrichmentCache>,
    persistence: Option<Arc<dyn SlangPersistence>>,
    metrics: Arc<MetricsRegistry>,
}

impl SlangService {
    pub fn new(
        dictionary: Arc<dyn Dictionary>,
        enricher: Arc<dyn Enricher>,
        curated: CuratedTerms,
        cache: Arc<EnrichmentCache>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            dictionary,
            enricher,
            curated,
            cache,
            persistence: None,
            metrics,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn SlangPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    fn resolve_lookup(&self, term: &TermQuery, mode: SourceMode) -> Lookup {
        match (term, mode) {
            (TermQuery::Phrase(phrase), _) => Lookup::Define(phrase.clone()),
            (TermQuery::Random, SourceMode::Curated) => match self.curated.next_term() {
                Some(seed) => Lookup::Define(seed),
                None => {
                    warn!("curated list empty, falling back to random lookup");
                    Lookup::Random
                }
            },
            (TermQuery::Random, SourceMode::Random) => Lookup::Random,
        }
    }

    async fn fetch_uncounted(&self, term: &TermQuery, mode: SourceMode) -> Result<SlangEntry, FetchError> {
        let lookup = self.resolve_lookup(term, mode);

        let lookup_span = self.metrics.span(metric_names::DICTIONARY_LOOKUP);
        let definitions = self.dictionary.lookup(&lookup).await?;
        lookup_span.finish();

        let mut definition =
            best_definition(definitions).ok_or_else(|| FetchError::NotFound(lookup.to_string()))?;

        if let Some(cached) = self.cache.get(&definition.word) {
            debug!(word = %definition.word, "enrichment cache hit");
            return Ok(cached);
        }

        definition.definition = strip_link_markup(&definition.definition);
        definition.example = strip_link_markup(&definition.example);

        let enrich_span = self.metrics.span(metric_names::ENRICH);
        let entry = self.enricher.enrich(&definition).await?;
        enrich_span.finish();

        let entry = SlangEntry {
            popularity: definition.thumbs_up as f64,
            ..entry
        };
        entry.validate()?;
        self.cache.insert(&definition.word, entry.clone());
        Ok(entry)
    }
}

#[async_trait]
impl SlangSource for SlangService {
    async fn fetch_one(&self, term: &TermQuery, mode: SourceMode) -> Result<SlangEntry, FetchError> {
        let span = self.metrics.span(metric_names::SLANG_FETCH);
        let result = self.fetch_uncounted(term, mode).await;
        span.finish();

        match &result {
            Ok(entry) => {
                debug!(
                    phrase = %entry.phrase,
                    risk = %entry.risk_level,
                    mode = mode.as_str(),
                    "slang fetched"
                );
                if let Some(persistence) = &self.persistence {
                    persistence.upsert_by_phrase(entry.clone());
                }
            }
            Err(e) => debug!(error = %e, mode = mode.as_str(), "slang fetch failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slang::testing::entry;
    use crate::slang::urban::DictionaryDefinition;
    use crate::slang::RiskLevel;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDictionary {
        lookups: Mutex<Vec<Lookup>>,
        empty: bool,
    }

    #[async_trait]
    impl Dictionary for RecordingDictionary {
        async fn lookup(&self, lookup: &Lookup) -> Result<Vec<DictionaryDefinition>, FetchError> {
            self.lookups.lock().push(lookup.clone());
            if self.empty {
                return Ok(Vec::new());
            }
            let word = match lookup {
                Lookup::Define(term) => term.clone(),
                Lookup::Random => "yeet".to_string(),
            };
            Ok(vec![
                DictionaryDefinition {
                    word: word.clone(),
                    definition: "a [weak] one".into(),
                    example: String::new(),
                    thumbs_up: 2,
                    thumbs_down: 0,
                },
                DictionaryDefinition {
                    word,
                    definition: "the [best] one".into(),
                    example: "[use] it".into(),
                    thumbs_up: 90,
                    thumbs_down: 1,
                },
            ])
        }
    }

    #[derive(Default)]
    struct EchoEnricher {
        calls: AtomicUsize,
        seen_definitions: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Enricher for EchoEnricher {
        async fn enrich(&self, definition: &DictionaryDefinition) -> Result<SlangEntry, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_definitions.lock().push(definition.definition.clone());
            Ok(entry(&definition.word, RiskLevel::Careful))
        }
    }

    #[derive(Default)]
    struct RecordingPersistence {
        upserts: Mutex<Vec<String>>,
    }

    impl SlangPersistence for RecordingPersistence {
        fn upsert_by_phrase(&self, entry: SlangEntry) {
            self.upserts.lock().push(entry.phrase);
        }
    }

    fn service(
        dictionary: Arc<RecordingDictionary>,
        enricher: Arc<EchoEnricher>,
        curated: CuratedTerms,
    ) -> SlangService {
        SlangService::new(
            dictionary,
            enricher,
            curated,
            Arc::new(EnrichmentCache::new(16, Duration::from_secs(60))),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[tokio::test]
    async fn explicit_term_uses_best_definition_and_persists() {
        let dictionary = Arc::new(RecordingDictionary::default());
        let enricher = Arc::new(EchoEnricher::default());
        let persistence = Arc::new(RecordingPersistence::default());
        let svc = service(Arc::clone(&dictionary), Arc::clone(&enricher), CuratedTerms::builtin())
            .with_persistence(persistence.clone());

        let got = svc
            .fetch_one(&TermQuery::Phrase("no cap".into()), SourceMode::Random)
            .await
            .unwrap();

        assert_eq!(got.phrase, "no cap");
        assert_eq!(got.popularity, 90.0);
        assert_eq!(*dictionary.lookups.lock(), vec![Lookup::Define("no cap".into())]);
        assert_eq!(*enricher.seen_definitions.lock(), vec!["the best one".to_string()]);
        assert_eq!(*persistence.upserts.lock(), vec!["no cap".to_string()]);
    }

    #[tokio::test]
    async fn curated_random_draws_seed_terms() {
        let dictionary = Arc::new(RecordingDictionary::default());
        let svc = service(
            Arc::clone(&dictionary),
            Arc::new(EchoEnricher::default()),
            CuratedTerms::new(["bet", "mid"]),
        );
        svc.fetch_one(&TermQuery::Random, SourceMode::Curated).await.unwrap();
        svc.fetch_one(&TermQuery::Random, SourceMode::Curated).await.unwrap();

        let mut seeds: Vec<Lookup> = dictionary.lookups.lock().clone();
        seeds.sort_by_key(|l| l.to_string());
        assert_eq!(seeds, vec![Lookup::Define("bet".into()), Lookup::Define("mid".into())]);
    }

    #[tokio::test]
    async fn random_mode_uses_dictionary_random() {
        let dictionary = Arc::new(RecordingDictionary::default());
        let svc = service(
            Arc::clone(&dictionary),
            Arc::new(EchoEnricher::default()),
            CuratedTerms::builtin(),
        );
        let got = svc.fetch_one(&TermQuery::Random, SourceMode::Random).await.unwrap();
        assert_eq!(got.phrase, "yeet");
        assert_eq!(*dictionary.lookups.lock(), vec![Lookup::Random]);
    }

    #[tokio::test]
    async fn repeated_word_is_enriched_once() {
        let enricher = Arc::new(EchoEnricher::default());
        let svc = service(
            Arc::new(RecordingDictionary::default()),
            Arc::clone(&enricher),
            CuratedTerms::builtin(),
        );
        let term = TermQuery::Phrase("slay".into());
        svc.fetch_one(&term, SourceMode::Curated).await.unwrap();
        svc.fetch_one(&term, SourceMode::Curated).await.unwrap();
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_dictionary_result_is_not_found() {
        let dictionary = Arc::new(RecordingDictionary {
            empty: true,
            ..Default::default()
        });
        let persistence = Arc::new(RecordingPersistence::default());
        let svc = service(dictionary, Arc::new(EchoEnricher::default()), CuratedTerms::builtin())
            .with_persistence(persistence.clone());

        let err = svc
            .fetch_one(&TermQuery::Phrase("zzz".into()), SourceMode::Curated)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
        assert!(persistence.upserts.lock().is_empty());
    }
}

//! Slangdeck: slang discovery backend.
//! Library root: tracing setup, service wiring, HTTP server lifecycle.

pub mod cancellation;
pub mod config;
pub mod metrics;
pub mod server;
pub mod session;
pub mod slang;
pub mod stack;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, ConfigError};
use metrics::MetricsRegistry;
use server::AppContext;
use session::SessionRegistry;
use slang::cache::EnrichmentCache;
use slang::curated::CuratedTerms;
use slang::openai::OpenAiEnricher;
use slang::service::SlangService;
use slang::urban::UrbanDictionary;
use slang::{FetchError, SlangSource};
use store::{PersistenceError, SlangPersistence, SlangStore};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("upstream client: {0}")]
    Client(#[from] FetchError),
    #[error("store: {0}")]
    Store(#[from] PersistenceError),
    #[error("server: {0}")]
    Io(#[from] std::io::Error),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("slangdeck=debug,tower_http=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if config::log_json_enabled() {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Dictionary, enricher and cache behind one `SlangSource` that upserts
/// every fetched entry into `store`.
fn build_slang_source(
    config: &Config,
    store: &Arc<SlangStore>,
    metrics: &Arc<MetricsRegistry>,
) -> Result<Arc<dyn SlangSource>, StartupError> {
    let cache = Arc::new(EnrichmentCache::new(config.cache_capacity, config.cache_ttl));
    let dictionary = Arc::new(UrbanDictionary::new(config.urban_base_url.clone())?);
    let enricher = OpenAiEnricher::new(config.enricher.clone())?;
    if !enricher.has_credential() {
        warn!("no enrichment credential, discovery batches will fail until OPENAI_API_KEY is set");
    }

    let persistence: Arc<dyn SlangPersistence> = store.clone();
    let service = SlangService::new(
        dictionary,
        Arc::new(enricher),
        CuratedTerms::builtin(),
        cache,
        Arc::clone(metrics),
    )
    .with_persistence(persistence);
    Ok(Arc::new(service))
}

/// Build every service and serve HTTP until ctrl-c / SIGTERM.
pub async fn run() -> Result<(), StartupError> {
    init_tracing();
    info!("slangdeck starting");

    let config = Config::load()?;
    let metrics = Arc::new(MetricsRegistry::new());
    let store = SlangStore::open(&config.db_path)?;

    let slang = build_slang_source(&config, &store, &metrics)?;

    let sessions = Arc::new(SessionRegistry::new(
        Arc::clone(&slang),
        config.stack,
        Arc::clone(&metrics),
        Some(Arc::clone(&store)),
    ));
    let sweep_shutdown = CancellationToken::new();
    let sweeper = sessions.spawn_idle_sweep(
        config.session_idle_ttl,
        sweep_period(config.session_idle_ttl),
        sweep_shutdown.clone(),
    );

    let app = server::router(AppContext {
        slang,
        store: Arc::clone(&store),
        sessions: Arc::clone(&sessions),
        metrics,
    });

    let address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep_shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "idle sweep task failed");
    }
    sessions.dispose_all();
    if let Err(e) = store.flush().await {
        warn!(error = %e, "final store flush failed");
    }
    info!("slangdeck stopped");
    Ok(())
}

fn sweep_period(ttl: Duration) -> Duration {
    (ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(60))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                warn!(error = %e, "Ctrl+C handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn slang_source_builds_over_the_store() {
        let dir = TempDir::new().unwrap();
        let store = SlangStore::open(&dir.path().join("slang.db")).unwrap();
        let config = Config::from_lookup(|_| None).unwrap();
        let metrics = Arc::new(MetricsRegistry::new());

        let source = build_slang_source(&config, &store, &metrics).ok();
        assert!(source.is_some());
        // The service holds the store as its persistence.
        assert_eq!(Arc::strong_count(&store), 2);
    }

    #[test]
    fn sweep_period_stays_within_bounds() {
        assert_eq!(sweep_period(Duration::from_secs(1800)), Duration::from_secs(60));
        assert_eq!(sweep_period(Duration::from_secs(120)), Duration::from_secs(30));
        assert_eq!(sweep_period(Duration::from_secs(2)), Duration::from_secs(1));
    }
}

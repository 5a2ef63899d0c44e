//! Wiring: build the store, generation client and services from config.

use std::sync::Arc;
use std::time::Duration;

use parley_core::config::{GenerationBackend, GenerationConfig, StoreBackend};
use parley_core::generation::{GeminiClient, GeminiConfig, GenerationClient};
use parley_core::store::{MemoryMessageStore, MessageStore, PgMessageStore};
use parley_core::{ParleyConfig, ParleyError};

use crate::http::HttpState;
use crate::subsystems::health::HealthProbe;
use crate::subsystems::lifecycle::SessionService;
use crate::subsystems::orchestrator::ChatOrchestrator;
use crate::subsystems::registry::SessionRegistry;

/// Everything the server runs, assembled once at startup.
pub struct App {
    pub registry: Arc<SessionRegistry>,
    pub health: Arc<HealthProbe>,
    pub http: Arc<HttpState>,
}

impl App {
    pub async fn from_config(config: &ParleyConfig) -> Result<Self, ParleyError> {
        let store = create_store(config).await?;
        let generator = create_generation_client(&config.generation);
        Ok(Self::assemble(config, store, generator))
    }

    /// Assemble from already-built collaborators.
    pub fn assemble(
        config: &ParleyConfig,
        store: Arc<dyn MessageStore>,
        generator: Option<Arc<dyn GenerationClient>>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::from_config(&config.registry));
        Self::assemble_with_registry(config, store, generator, registry)
    }

    pub fn assemble_with_registry(
        config: &ParleyConfig,
        store: Arc<dyn MessageStore>,
        generator: Option<Arc<dyn GenerationClient>>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let orchestrator = Arc::new(ChatOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            generator.clone(),
            config.generation.model.clone(),
            config.generation.history_window,
        ));
        let sessions = Arc::new(SessionService::new(Arc::clone(&store), orchestrator));
        let health = Arc::new(HealthProbe::new(
            Some(store),
            generator,
            Duration::from_secs(config.health.probe_timeout_secs),
        ));

        let http = Arc::new(HttpState {
            sessions,
            health: Arc::clone(&health),
            cors_origins: config.http.cors_allowed_origins.clone(),
        });

        Self {
            registry,
            health,
            http,
        }
    }
}

pub async fn create_store(config: &ParleyConfig) -> Result<Arc<dyn MessageStore>, ParleyError> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryMessageStore::new()))
        }
        StoreBackend::Postgres => {
            let pool = parley_core::db::create_pool(&config.database).await?;
            let version = parley_core::db::health_check(&pool).await?;
            tracing::info!(version = %version, "Connected to PostgreSQL");
            if config.database.run_migrations {
                parley_core::db::run_migrations(&pool).await?;
                tracing::info!("Database migrations applied");
            }
            Ok(Arc::new(PgMessageStore::new(pool)))
        }
    }
}

/// `None` when generation is disabled or cannot be configured; chat then
/// answers 503 and health reports `not_configured`.
pub fn create_generation_client(config: &GenerationConfig) -> Option<Arc<dyn GenerationClient>> {
    if config.backend == GenerationBackend::Disabled {
        tracing::info!("Generation backend disabled");
        return None;
    }

    let Some(gemini) = GeminiConfig::from_config(config) else {
        tracing::warn!("Generation disabled: no API key (set generation.api_key or GOOGLE_API_KEY)");
        return None;
    };

    match GeminiClient::new(gemini) {
        Ok(client) => {
            tracing::info!(model = %config.model, "Gemini generation client ready");
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Generation disabled: failed to create Gemini client");
            None
        }
    }
}

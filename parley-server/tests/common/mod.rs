//! Shared fixtures for the HTTP integration tests: an in-memory app with a
//! scripted generation client, and a oneshot request helper.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use parley_core::generation::{GenerateOptions, Generation, GenerationClient, GenerationError, Prompt, TokenUsage};
use parley_core::store::MemoryMessageStore;
use parley_core::ParleyConfig;
use parley_server::app::App;
use parley_server::http::build_router;
use parley_server::subsystems::registry::SessionRegistry;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Generation client that answers after `delay`, honouring cancellation.
pub struct ScriptedClient {
    pub delay: Duration,
    pub probe_ok: AtomicBool,
}

impl ScriptedClient {
    pub fn instant() -> Self {
        Self::sleeping(Duration::ZERO)
    }

    pub fn sleeping(delay: Duration) -> Self {
        Self {
            delay,
            probe_ok: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn generate(
        &self,
        cancel: &CancellationToken,
        prompt: &Prompt,
        options: &GenerateOptions,
    ) -> Result<Generation, GenerationError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            _ = tokio::time::sleep(self.delay) => Ok(Generation {
                text: format!("you said: {}", prompt.message),
                model: options.model.clone().unwrap_or_else(|| "scripted".to_string()),
                usage: TokenUsage {
                    prompt_tokens: 3,
                    completion_tokens: 5,
                    total_tokens: 8,
                },
            }),
        }
    }

    async fn probe(&self, _cancel: &CancellationToken) -> Result<(), GenerationError> {
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GenerationError::Api {
                code: 503,
                message: "probe refused".to_string(),
            })
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub struct TestApp {
    pub app: App,
    pub router: Router,
    pub store: MemoryMessageStore,
}

pub fn test_config() -> ParleyConfig {
    let mut config = ParleyConfig::default();
    config.generation.model = "test-model".to_string();
    config
}

pub fn test_app(client: ScriptedClient) -> TestApp {
    test_app_with(test_config(), Some(Arc::new(client)))
}

pub fn test_app_with(config: ParleyConfig, client: Option<Arc<ScriptedClient>>) -> TestApp {
    let registry = Arc::new(SessionRegistry::from_config(&config.registry));
    test_app_with_registry(config, client, registry)
}

pub fn test_app_with_registry(
    config: ParleyConfig,
    client: Option<Arc<ScriptedClient>>,
    registry: Arc<SessionRegistry>,
) -> TestApp {
    let store = MemoryMessageStore::new();
    let generator = client.map(|c| c as Arc<dyn GenerationClient>);
    let app = App::assemble_with_registry(&config, Arc::new(store.clone()), generator, registry);
    let router = build_router(Arc::clone(&app.http));
    TestApp { app, router, store }
}

#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Send one request through the router. `user` sets `X-User-ID`.
pub async fn call(router: &Router, method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> TestResponse {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("X-User-ID", user);
    }
    let request = match body {
        Some(json) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    TestResponse {
        status,
        headers,
        body,
    }
}

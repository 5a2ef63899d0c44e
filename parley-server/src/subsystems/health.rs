//! HealthProbe: uptime, version and per-dependency liveness.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_core::generation::GenerationClient;
use parley_core::store::MessageStore;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Connected,
    Disconnected,
    NotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dependencies {
    pub genkit: DependencyStatus,
    pub database: DependencyStatus,
}

impl Dependencies {
    fn all(&self) -> [DependencyStatus; 2] {
        [self.genkit, self.database]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub uptime: String,
    pub dependencies: Dependencies,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

pub struct HealthProbe {
    store: Option<Arc<dyn MessageStore>>,
    generator: Option<Arc<dyn GenerationClient>>,
    timeout: Duration,
    started: Instant,
}

impl HealthProbe {
    pub fn new(
        store: Option<Arc<dyn MessageStore>>,
        generator: Option<Arc<dyn GenerationClient>>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            generator,
            timeout,
            started: Instant::now(),
        }
    }

    /// Probe every configured dependency concurrently, each under `timeout`.
    pub async fn check(&self) -> HealthReport {
        let (genkit, database) = futures::join!(self.probe_generator(), self.probe_store());
        let dependencies = Dependencies { genkit, database };

        let status = if dependencies
            .all()
            .iter()
            .all(|s| *s != DependencyStatus::Disconnected)
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: format_uptime(self.started.elapsed()),
            dependencies,
        }
    }

    async fn probe_generator(&self) -> DependencyStatus {
        let Some(generator) = &self.generator else {
            return DependencyStatus::NotConfigured;
        };

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        match tokio::time::timeout(self.timeout, generator.probe(&cancel)).await {
            Ok(Ok(())) => DependencyStatus::Connected,
            Ok(Err(e)) => {
                tracing::warn!(backend = generator.name(), error = %e, "Generation probe failed");
                DependencyStatus::Disconnected
            }
            Err(_) => {
                tracing::warn!(backend = generator.name(), "Generation probe timed out");
                DependencyStatus::Disconnected
            }
        }
    }

    async fn probe_store(&self) -> DependencyStatus {
        let Some(store) = &self.store else {
            return DependencyStatus::NotConfigured;
        };

        match tokio::time::timeout(self.timeout, store.ping()).await {
            Ok(Ok(())) => DependencyStatus::Connected,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Store ping failed");
                DependencyStatus::Disconnected
            }
            Err(_) => {
                tracing::warn!("Store ping timed out");
                DependencyStatus::Disconnected
            }
        }
    }
}

/// "1h2m3s" style; zero components are omitted (but "0s" for zero).
pub fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (days, hours, minutes, seconds) = (
        total / 86_400,
        (total % 86_400) / 3_600,
        (total % 3_600) / 60,
        total % 60,
    );

    let mut out = String::new();
    for (value, unit) in [(days, "d"), (hours, "h"), (minutes, "m")] {
        if value > 0 {
            out.push_str(&format!("{}{}", value, unit));
        }
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{}s", seconds));
    }
    out
}

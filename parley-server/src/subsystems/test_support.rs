use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use parley_core::generation::{GenerateOptions, Generation, GenerationClient, GenerationError, Prompt, TokenUsage};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Echo the prompt message back after `delay`.
    Echo { delay: Duration },
    /// Fail with an upstream error.
    Upstream,
}

/// Generation client double that records what it was asked.
pub struct StubGenerator {
    pub behaviour: Behaviour,
    pub probe_ok: bool,
    pub calls: AtomicUsize,
    pub last_prompt: Mutex<Option<Prompt>>,
    pub last_options: Mutex<Option<GenerateOptions>>,
}

impl StubGenerator {
    pub fn echo() -> Self {
        Self::with(Behaviour::Echo { delay: Duration::ZERO })
    }

    pub fn slow(delay: Duration) -> Self {
        Self::with(Behaviour::Echo { delay })
    }

    pub fn failing() -> Self {
        Self::with(Behaviour::Upstream)
    }

    pub fn with(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            probe_ok: true,
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
            last_options: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationClient for StubGenerator {
    async fn generate(
        &self,
        cancel: &CancellationToken,
        prompt: &Prompt,
        options: &GenerateOptions,
    ) -> Result<Generation, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(prompt.clone());
        *self.last_options.lock().unwrap() = Some(options.clone());

        match &self.behaviour {
            Behaviour::Echo { delay } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(GenerationError::Cancelled),
                    _ = tokio::time::sleep(*delay) => Ok(Generation {
                        text: format!("echo: {}", prompt.message),
                        model: options.model.clone().unwrap_or_else(|| "stub".to_string()),
                        usage: TokenUsage {
                            prompt_tokens: 4,
                            completion_tokens: 6,
                            total_tokens: 10,
                        },
                    }),
                }
            }
            Behaviour::Upstream => Err(GenerationError::Api {
                code: 500,
                message: "model exploded".to_string(),
            }),
        }
    }

    async fn probe(&self, _cancel: &CancellationToken) -> Result<(), GenerationError> {
        if self.probe_ok {
            Ok(())
        } else {
            Err(GenerationError::Api {
                code: 503,
                message: "probe failed".to_string(),
            })
        }
    }

    fn name(&self) -> &str {
        "stub"
    }
}

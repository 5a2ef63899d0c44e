pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod models;
pub mod store;

pub use config::ParleyConfig;
pub use error::{AppError, ErrorCode, ParleyError};
pub use generation::{
    GeminiClient, GenerateOptions, Generation, GenerationClient, GenerationError, Prompt,
    PromptTurn, TokenUsage,
};
pub use models::{Message, MessageRole, SamplingDefaults, Session};
pub use store::{MessageStore, StoreError, StoreTx};

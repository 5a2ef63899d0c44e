use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-session sampling defaults; every field may be unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingDefaults {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i32>,
    pub max_tokens: Option<i32>,
}

impl SamplingDefaults {
    /// Range check: temperature 0-2, top-p 0-1, top-k >= 0, max-tokens > 0.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("temperature must be between 0 and 2, got {}", t));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("topP must be between 0 and 1, got {}", p));
            }
        }
        if let Some(k) = self.top_k {
            if k < 0 {
                return Err(format!("topK must be non-negative, got {}", k));
            }
        }
        if let Some(m) = self.max_tokens {
            if m <= 0 {
                return Err(format!("maxTokens must be positive, got {}", m));
            }
        }
        Ok(())
    }

    /// Fields set in `self` win over `fallback`.
    pub fn or(self, fallback: SamplingDefaults) -> SamplingDefaults {
        SamplingDefaults {
            temperature: self.temperature.or(fallback.temperature),
            top_p: self.top_p.or(fallback.top_p),
            top_k: self.top_k.or(fallback.top_k),
            max_tokens: self.max_tokens.or(fallback.max_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub model: String,
    pub system_prompt: Option<String>,
    #[serde(flatten)]
    pub sampling: SamplingDefaults,
    pub pinned: bool,
    pub archived: bool,
    #[serde(skip)]
    pub deleted: bool,
    pub message_count: i32,
    pub last_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh session with a random 122-bit identifier.
    pub fn new(user_id: impl Into<String>, title: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            model: model.into(),
            system_prompt: None,
            sampling: SamplingDefaults::default(),
            pinned: false,
            archived: false,
            deleted: false,
            message_count: 0,
            last_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

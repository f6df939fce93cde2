//! LLM provider abstraction.
//!
//! The kernel never talks to a model service itself; agent loops hand a
//! prompt to a pluggable provider and get back content plus usage. Cost is
//! mandatory at the type level — a provider wrapper deserializing an
//! external response must fail loudly if cost is absent, because silently
//! zeroed costs corrupt budget accounting.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
}

/// Token and cost accounting for one completion. `cost` is in dollars.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl Usage {
    /// Convert the provider's dollar cost to the ledgered integer
    /// micro-dollars, rejecting anything non-finite or negative.
    pub fn cost_micro_dollars(&self) -> Result<u64, LlmError> {
        if !self.cost.is_finite() || self.cost < 0.0 {
            return Err(LlmError::InvalidUsage(format!(
                "cost must be a finite non-negative number, got {}",
                self.cost
            )));
        }
        Ok((self.cost * 1_000_000.0).ceil() as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("invalid usage accounting: {0}")]
    InvalidUsage(String),
    #[error("provider exhausted: no scripted completions left")]
    Exhausted,
}

/// The provider seam. Implementations perform their own I/O; the caller
/// applies the per-call timeout.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<Completion, LlmError>;
}

/// Deterministic provider for tests and demos: a queue of canned
/// completions, returned in order.
pub struct ScriptedProvider {
    queue: Mutex<VecDeque<Completion>>,
}

impl ScriptedProvider {
    pub fn new(completions: Vec<Completion>) -> Self {
        Self {
            queue: Mutex::new(completions.into()),
        }
    }

    /// A scripted completion carrying an action intent as its content.
    pub fn action(content: impl Into<String>, cost: f64) -> Completion {
        let content = content.into();
        Completion {
            usage: Usage {
                input_tokens: 128,
                output_tokens: (content.len() / 4).max(1) as u64,
                cost,
            },
            content,
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, _request: LlmRequest) -> Result<Completion, LlmError> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| LlmError::Provider("scripted queue poisoned".into()))?;
        queue.pop_front().ok_or(LlmError::Exhausted)
    }
}

/// Parse a raw provider completion into an action intent. Tolerates a
/// fenced code block around the JSON, nothing more.
pub fn parse_action_content(content: &str) -> Result<crate::action::ActionIntent, String> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).map_err(|e| format!("unparseable action: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn scripted_provider_drains_in_order() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::action(r#"{"action_type":"noop","principal_id":"a"}"#, 0.001),
            ScriptedProvider::action(r#"{"action_type":"noop","principal_id":"b"}"#, 0.002),
        ]);
        let request = LlmRequest {
            model: "test".into(),
            messages: vec![Message::user("go")],
            max_tokens: 256,
        };
        let first = provider.complete(request.clone()).await.unwrap();
        assert!(first.content.contains("\"a\""));
        let second = provider.complete(request.clone()).await.unwrap();
        assert!(second.content.contains("\"b\""));
        assert_eq!(
            provider.complete(request).await.unwrap_err(),
            LlmError::Exhausted
        );
    }

    #[test]
    fn cost_conversion_is_fail_loud() {
        let usage = Usage {
            input_tokens: 1,
            output_tokens: 1,
            cost: 0.0025,
        };
        assert_eq!(usage.cost_micro_dollars().unwrap(), 2_500);

        let usage = Usage {
            cost: f64::NAN,
            ..usage
        };
        assert!(usage.cost_micro_dollars().is_err());

        let usage = Usage {
            cost: -0.1,
            input_tokens: 1,
            output_tokens: 1,
        };
        assert!(usage.cost_micro_dollars().is_err());
    }

    #[test]
    fn missing_cost_fails_at_the_boundary() {
        // A provider response without cost must not deserialize into Usage.
        let raw = r#"{"input_tokens": 10, "output_tokens": 5}"#;
        assert!(serde_json::from_str::<Usage>(raw).is_err());
    }

    #[test]
    fn fenced_action_content_parses() {
        let content = "```json\n{\"action_type\":\"noop\",\"principal_id\":\"alice\"}\n```";
        let intent = parse_action_content(content).unwrap();
        assert_eq!(intent.kind_name(), "noop");

        assert!(parse_action_content("I would rather chat.").is_err());
    }
}

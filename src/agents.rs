//! Opaque collaborator seams: LLM agents and the search provider.
//!
//! The orchestration core never builds prompts or schemas. It hands an
//! [`AgentRequest`] to an [`Agent`] and gets back either a structured JSON
//! value or an error it knows how to classify: format trouble (retry a
//! bounded number of times, then fail the node/unit) versus provider
//! unavailability (transient, backoff).
//!
//! Test doubles live in the integration-test fixtures; production wiring
//! supplies real implementations at engine construction.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::RetryPolicy;

/// What a node or worker asks an agent to do.
///
/// `purpose` names the call site for logging; `payload` is the opaque
/// context the agent's own prompt layer consumes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRequest {
    pub purpose: String,
    pub payload: Value,
}

impl AgentRequest {
    pub fn new(purpose: impl Into<String>, payload: Value) -> Self {
        Self {
            purpose: purpose.into(),
            payload,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    /// The agent produced output that failed schema validation. Bounded
    /// retry; exhausted retries fail the node or unit, never the siblings.
    #[error("agent returned non-conforming output: {message}")]
    #[diagnostic(code(curricle::agent::format))]
    Format { message: String },

    /// The agent could not be reached. Transient; retried with backoff.
    #[error("agent unavailable: {message}")]
    #[diagnostic(
        code(curricle::agent::unavailable),
        help("Transient provider trouble; the call site retries with backoff.")
    )]
    Unavailable { message: String },
}

impl AgentError {
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// An LLM-backed collaborator returning validated structured output.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<Value, AgentError>;
}

/// Invoke an agent with bounded retry and exponential backoff, decoding the
/// result into `T`. A payload that decodes incorrectly counts as a format
/// error and consumes an attempt, same as one the agent flagged itself.
pub async fn invoke_structured<T: DeserializeOwned>(
    agent: &dyn Agent,
    request: AgentRequest,
    policy: RetryPolicy,
) -> Result<T, AgentError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match agent.invoke(request.clone()).await {
            Ok(value) => serde_json::from_value::<T>(value)
                .map_err(|e| AgentError::format(format!("decode: {e}"))),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(decoded) => return Ok(decoded),
            Err(err) if attempt < policy.max_attempts => {
                tracing::warn!(
                    purpose = %request.purpose,
                    attempt,
                    error = %err,
                    "agent call failed; retrying"
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(err) => {
                tracing::error!(
                    purpose = %request.purpose,
                    attempts = attempt,
                    error = %err,
                    "agent retry budget exhausted"
                );
                return Err(err);
            }
        }
    }
}

/// One ranked search result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Debug, Error, Diagnostic)]
pub enum SearchError {
    #[error("search provider unavailable: {message}")]
    #[diagnostic(code(curricle::search::unavailable))]
    Unavailable { message: String },
}

/// Search/retrieval collaborator used for resource recommendation.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn query(&self, q: &str) -> Result<Vec<SearchHit>, SearchError>;
}

/// Primary provider with a documented fallback: when the primary reports
/// `Unavailable`, the query is rerun against the fallback before giving up.
pub struct FallbackSearch<P, F> {
    primary: P,
    fallback: F,
}

impl<P: SearchProvider, F: SearchProvider> FallbackSearch<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P: SearchProvider, F: SearchProvider> SearchProvider for FallbackSearch<P, F> {
    async fn query(&self, q: &str) -> Result<Vec<SearchHit>, SearchError> {
        match self.primary.query(q).await {
            Ok(hits) => Ok(hits),
            Err(SearchError::Unavailable { message }) => {
                tracing::warn!(error = %message, "primary search unavailable; using fallback");
                self.fallback.query(q).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyAgent {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        async fn invoke(&self, _request: AgentRequest) -> Result<Value, AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(serde_json::json!({ "ok": true }))
            } else {
                Err(AgentError::format("malformed"))
            }
        }
    }

    #[derive(Deserialize)]
    struct OkPayload {
        ok: bool,
    }

    fn tight_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn retries_format_errors_up_to_budget() {
        let agent = FlakyAgent {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        };
        let result: OkPayload = invoke_structured(
            &agent,
            AgentRequest::new("test", Value::Null),
            tight_policy(3),
        )
        .await
        .unwrap();
        assert!(result.ok);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_propagates_error() {
        let agent = FlakyAgent {
            calls: AtomicU32::new(0),
            succeed_on: 10,
        };
        let result: Result<OkPayload, _> = invoke_structured(
            &agent,
            AgentRequest::new("test", Value::Null),
            tight_policy(2),
        )
        .await;
        assert!(matches!(result, Err(AgentError::Format { .. })));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }

    struct DownProvider;
    struct UpProvider;

    #[async_trait]
    impl SearchProvider for DownProvider {
        async fn query(&self, _q: &str) -> Result<Vec<SearchHit>, SearchError> {
            Err(SearchError::Unavailable {
                message: "down".into(),
            })
        }
    }

    #[async_trait]
    impl SearchProvider for UpProvider {
        async fn query(&self, q: &str) -> Result<Vec<SearchHit>, SearchError> {
            Ok(vec![SearchHit {
                title: q.to_string(),
                url: "https://example.com".into(),
                snippet: String::new(),
            }])
        }
    }

    #[tokio::test]
    async fn fallback_search_covers_primary_outage() {
        let search = FallbackSearch::new(DownProvider, UpProvider);
        let hits = search.query("ownership").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "ownership");
    }
}

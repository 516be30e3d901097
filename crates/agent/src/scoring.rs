//! Scoring collaborator client.
//!
//! The extraction/classification capability is an opaque service: given the
//! conversation so far it returns extracted fields and a bounded
//! qualification score. This module normalizes whatever it answers into the
//! state model and keeps the engine alive when it does not answer at all.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use triage_core::domain::conversation::{ConversationState, MAX_SCORE, MIN_SCORE};
use triage_core::{Message, Role};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScoringError {
    #[error("scoring request failed: {0}")]
    Http(String),
    #[error("scoring response could not be decoded: {0}")]
    Decode(String),
    #[error("scoring endpoint returned status {0}")]
    Status(u16),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoringOutcome {
    /// Clamped into `MIN_SCORE..=MAX_SCORE`; the caller's `absorb_score`
    /// enforces monotonicity on top of this.
    pub score: u8,
    pub fields: BTreeMap<String, String>,
}

#[async_trait]
pub trait ScoringClient: Send + Sync {
    async fn score(&self, state: &ConversationState) -> Result<ScoringOutcome, ScoringError>;
}

/// Retry wrapper shared by all scoring call sites: `max_retries` additional
/// attempts with fixed backoff. On exhaustion the last error is returned and
/// the orchestrator keeps the prior score.
pub async fn score_with_retries(
    client: &dyn ScoringClient,
    state: &ConversationState,
    max_retries: u32,
    backoff: Duration,
) -> Result<ScoringOutcome, ScoringError> {
    let mut attempt = 0;
    loop {
        match client.score(state).await {
            Ok(outcome) => return Ok(outcome),
            Err(error) if attempt < max_retries => {
                attempt += 1;
                warn!(
                    event_name = "scoring.retry",
                    thread_key = %state.thread_key,
                    attempt,
                    error = %error,
                    "scoring attempt failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    known_fields: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    score: i64,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

/// HTTP client for a hosted scoring service.
pub struct HttpScoringClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
}

impl HttpScoringClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ScoringError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ScoringError::Http(error.to_string()))?;
        Ok(Self { client, endpoint: endpoint.into(), api_key, model: model.into() })
    }
}

#[async_trait]
impl ScoringClient for HttpScoringClient {
    async fn score(&self, state: &ConversationState) -> Result<ScoringOutcome, ScoringError> {
        let request = ScoreRequest {
            model: &self.model,
            messages: state
                .messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
            known_fields: &state.extracted_fields,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|error| ScoringError::Http(error.to_string()))?;
        if !response.status().is_success() {
            return Err(ScoringError::Status(response.status().as_u16()));
        }

        let decoded: ScoreResponse = response
            .json()
            .await
            .map_err(|error| ScoringError::Decode(error.to_string()))?;

        Ok(normalize_outcome(decoded.score, decoded.fields))
    }
}

fn normalize_outcome(raw_score: i64, fields: BTreeMap<String, String>) -> ScoringOutcome {
    let score = raw_score.clamp(i64::from(MIN_SCORE), i64::from(MAX_SCORE)) as u8;
    ScoringOutcome { score, fields }
}

/// Deterministic in-process scorer used when no scoring endpoint is
/// configured. Counts qualification signals in the customer's messages; it
/// is intentionally coarse and exists so the engine works end to end without
/// the hosted collaborator.
#[derive(Clone, Debug, Default)]
pub struct KeywordScoringClient;

impl KeywordScoringClient {
    pub fn new() -> Self {
        Self
    }

    fn evaluate(&self, messages: &[Message]) -> ScoringOutcome {
        let human_text: Vec<String> = messages
            .iter()
            .filter(|message| message.role == Role::Human)
            .map(|message| message.content.to_lowercase())
            .collect();
        let combined = human_text.join(" ");

        let mut score = u32::from(MIN_SCORE);
        let mut fields = BTreeMap::new();

        if let Some(budget) = extract_budget(&combined) {
            score += 3;
            fields.insert("budget".to_string(), budget);
        }
        if let Some(timeline) = extract_timeline(&combined) {
            score += 2;
            fields.insert("timeline".to_string(), timeline);
        }
        if ["buy", "book", "schedule", "quote", "price", "appointment"]
            .iter()
            .any(|keyword| combined.contains(keyword))
        {
            score += 2;
        }
        if let Some(email) = extract_email(&combined) {
            score += 1;
            fields.insert("email".to_string(), email);
        }
        if human_text.len() >= 3 {
            score += 1;
        }

        ScoringOutcome { score: score.min(u32::from(MAX_SCORE)) as u8, fields }
    }
}

#[async_trait]
impl ScoringClient for KeywordScoringClient {
    async fn score(&self, state: &ConversationState) -> Result<ScoringOutcome, ScoringError> {
        Ok(self.evaluate(&state.messages))
    }
}

fn extract_budget(text: &str) -> Option<String> {
    let index = text.find('$').or_else(|| text.find("budget"))?;
    let tail = &text[index..];
    let amount: String = tail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    (!amount.is_empty()).then(|| amount.replace(',', ""))
}

fn extract_timeline(text: &str) -> Option<String> {
    ["today", "tomorrow", "asap", "this week", "next week", "this month"]
        .iter()
        .find(|hint| text.contains(**hint))
        .map(|hint| hint.to_string())
}

fn extract_email(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|token| {
            token.contains('@') && token.rsplit_once('@').is_some_and(|(_, domain)| {
                domain.contains('.')
            })
        })
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '.')
            .to_string())
}

/// Returns a fixed outcome, or a sequence of outcomes, for tests.
pub struct FixedScoringClient {
    outcomes: std::sync::Mutex<Vec<ScoringOutcome>>,
    fallback: ScoringOutcome,
}

impl FixedScoringClient {
    pub fn always(score: u8) -> Self {
        Self {
            outcomes: std::sync::Mutex::new(Vec::new()),
            fallback: ScoringOutcome { score, fields: BTreeMap::new() },
        }
    }

    /// Yields `scores` in order, then repeats the last one.
    pub fn sequence(scores: &[u8]) -> Self {
        let mut outcomes: Vec<ScoringOutcome> = scores
            .iter()
            .map(|score| ScoringOutcome { score: *score, fields: BTreeMap::new() })
            .collect();
        let fallback = outcomes.last().cloned().unwrap_or(ScoringOutcome {
            score: MIN_SCORE,
            fields: BTreeMap::new(),
        });
        outcomes.reverse();
        Self { outcomes: std::sync::Mutex::new(outcomes), fallback }
    }
}

#[async_trait]
impl ScoringClient for FixedScoringClient {
    async fn score(&self, _state: &ConversationState) -> Result<ScoringOutcome, ScoringError> {
        let mut outcomes = self
            .outcomes
            .lock()
            .map_err(|_| ScoringError::Http("poisoned outcome queue".into()))?;
        Ok(outcomes.pop().unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Always fails, for retry-exhaustion tests.
pub struct UnavailableScoringClient;

#[async_trait]
impl ScoringClient for UnavailableScoringClient {
    async fn score(&self, _state: &ConversationState) -> Result<ScoringOutcome, ScoringError> {
        Err(ScoringError::Http("connection refused".into()))
    }
}

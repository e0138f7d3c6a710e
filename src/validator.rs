//! Result validation: did the last action bring the task to its goal?

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::ValidationError;
use crate::perception::Snapshot;
use crate::reasoning::proposal::extract_json;
use crate::reasoning::{ActionProposal, ReasoningProvider, verify_prompt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    GoalMet,
    NotYetMet,
    /// Cannot tell; never treated as success
    Ambiguous,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::GoalMet => "GoalMet",
            Verdict::NotYetMet => "NotYetMet",
            Verdict::Ambiguous => "Ambiguous",
        };
        f.write_str(s)
    }
}

/// Everything a validator may look at
#[derive(Debug, Clone, Copy)]
pub struct ValidationRequest<'a> {
    pub goal: &'a str,
    pub proposal: &'a ActionProposal,
    pub before: &'a Snapshot,
    pub after: &'a Snapshot,
}

#[async_trait]
pub trait ResultValidator: Send + Sync {
    async fn validate(&self, request: &ValidationRequest<'_>) -> Result<Verdict, ValidationError>;
}

/// Deterministic checks on the post-action screen.
///
/// - `GoalMet` when every expected text appears in some post-action label
/// - `Ambiguous` when an action other than a wait left the screen unchanged
/// - `NotYetMet` otherwise
#[derive(Debug, Clone, Default)]
pub struct ScreenDiffValidator {
    expected: Vec<String>,
}

impl ScreenDiffValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(mut self, text: impl Into<String>) -> Self {
        self.expected.push(text.into());
        self
    }

    pub fn expect_all<I, S>(mut self, texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected.extend(texts.into_iter().map(Into::into));
        self
    }

    fn goal_visible(&self, after: &Snapshot) -> bool {
        if self.expected.is_empty() {
            return false;
        }
        let labels = after.labels();
        self.expected
            .iter()
            .all(|want| labels.iter().any(|label| label.contains(want.as_str())))
    }
}

#[async_trait]
impl ResultValidator for ScreenDiffValidator {
    async fn validate(&self, request: &ValidationRequest<'_>) -> Result<Verdict, ValidationError> {
        if self.goal_visible(request.after) {
            return Ok(Verdict::GoalMet);
        }
        let waited = matches!(request.proposal, ActionProposal::Wait { .. });
        if !waited && request.before.same_content_as(request.after) {
            tracing::debug!(proposal = %request.proposal, "screen unchanged after action");
            return Ok(Verdict::Ambiguous);
        }
        Ok(Verdict::NotYetMet)
    }
}

/// Delegates the judgement to a reasoning provider
pub struct ModelValidator {
    provider: Arc<dyn ReasoningProvider>,
    timeout: Duration,
}

impl ModelValidator {
    pub fn new(provider: Arc<dyn ReasoningProvider>) -> Self {
        Self {
            provider,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Read `{"verdict": "..."}` from a model answer
pub(crate) fn parse_verdict(text: &str) -> Result<Verdict, ValidationError> {
    let json = extract_json(text)
        .ok_or_else(|| ValidationError::Unreadable(format!("no JSON in '{}'", text.trim())))?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ValidationError::Unreadable(e.to_string()))?;
    let verdict = value["verdict"]
        .as_str()
        .ok_or_else(|| ValidationError::Unreadable("missing 'verdict'".to_string()))?;
    match verdict.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
        "goal_met" | "met" | "success" => Ok(Verdict::GoalMet),
        "not_yet_met" | "not_met" | "in_progress" => Ok(Verdict::NotYetMet),
        "ambiguous" | "unknown" => Ok(Verdict::Ambiguous),
        other => Err(ValidationError::Unreadable(format!(
            "unknown verdict '{}'",
            other
        ))),
    }
}

#[async_trait]
impl ResultValidator for ModelValidator {
    async fn validate(&self, request: &ValidationRequest<'_>) -> Result<Verdict, ValidationError> {
        let prompt = verify_prompt(
            request.goal,
            request.proposal,
            request.before,
            request.after,
        );
        let answer = timeout(self.timeout, self.provider.propose(&prompt))
            .await
            .map_err(|_| ValidationError::Timeout(self.timeout))??;
        tracing::debug!(provider = self.provider.name(), response = %answer.text, "verdict answer");
        parse_verdict(&answer.text)
    }
}

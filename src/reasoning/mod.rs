//! Reasoning: choosing the next action from what is on screen.
//!
//! A [`ReasoningProvider`] is one model backend. The [`Planner`] is the caller
//! side: it frames the prompt, enforces the per-call timeout, falls back across
//! providers in priority order and validates the answer.

pub mod prompt;
pub mod proposal;
pub mod screenshot;
pub mod vlm;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{PlanError, ProviderError, ProviderResult};
use crate::perception::Snapshot;
use crate::task::{FailureNote, Step};

pub use prompt::{PlanPrompt, StructuredPrompt, verify_prompt};
pub use proposal::{ActionProposal, Direction, SwipeMotion, TapTarget, parse_proposal};
pub use screenshot::{EncodedScreenshot, compress_screenshot};
pub use vlm::{VlmConfig, VlmProvider, check_health};

/// Raw provider answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredResponse {
    pub text: String,
}

impl StructuredResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// One model backend (cloud API, local server, test stub)
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn propose(&self, prompt: &StructuredPrompt) -> ProviderResult<StructuredResponse>;
}

/// Context for one planning call
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub instruction: &'a str,
    pub snapshot: &'a Snapshot,
    pub history: &'a [Step],
    pub recent_failures: &'a [FailureNote],
}

const DEFAULT_HISTORY_WINDOW: usize = 10;

/// Caller-side planning over a prioritized provider list
#[derive(Clone)]
pub struct Planner {
    providers: Vec<Arc<dyn ReasoningProvider>>,
    timeout: Duration,
    history_window: usize,
}

impl Planner {
    pub fn new(provider: Arc<dyn ReasoningProvider>) -> Self {
        Self {
            providers: vec![provider],
            timeout: Duration::from_secs(60),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    /// Planner with no providers; every call fails with `NoProviders`
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
            timeout: Duration::from_secs(60),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    /// Add a lower-priority provider tried when the earlier ones error
    pub fn fallback(mut self, provider: Arc<dyn ReasoningProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn history_window(mut self, steps: usize) -> Self {
        self.history_window = steps;
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn prompt_for(&self, request: &PlanRequest<'_>) -> StructuredPrompt {
        PlanPrompt {
            instruction: request.instruction,
            snapshot: request.snapshot,
            history: request.history,
            recent_failures: request.recent_failures,
            history_window: self.history_window,
        }
        .render()
    }

    /// Ask for the next action.
    ///
    /// Providers are tried in order until one answers. A provider error or
    /// timeout moves on to the next provider; a malformed answer does not.
    pub async fn propose_action(
        &self,
        request: &PlanRequest<'_>,
    ) -> Result<ActionProposal, PlanError> {
        let prompt = self.prompt_for(request);
        let mut last_error: Option<ProviderError> = None;

        for provider in &self.providers {
            let answer = match timeout(self.timeout, provider.propose(&prompt)).await {
                Ok(Ok(answer)) => answer,
                Ok(Err(err)) => {
                    tracing::warn!(provider = provider.name(), error = %err, "provider failed");
                    last_error = Some(err);
                    continue;
                }
                Err(_) => {
                    tracing::warn!(provider = provider.name(), timeout = ?self.timeout, "provider timed out");
                    last_error = Some(ProviderError::Timeout(self.timeout));
                    continue;
                }
            };

            tracing::debug!(provider = provider.name(), response = %answer.text, "provider answered");
            return parse_proposal(&answer.text, request.snapshot);
        }

        Err(last_error.map_or(PlanError::NoProviders, PlanError::Provider))
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("providers", &self.provider_names())
            .field("timeout", &self.timeout)
            .field("history_window", &self.history_window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Bounds, ScreenSize, UiElement};
    use parking_lot::Mutex;

    struct Canned {
        name: &'static str,
        answer: ProviderResult<StructuredResponse>,
        delay: Duration,
        calls: Mutex<usize>,
    }

    impl Canned {
        fn ok(name: &'static str, text: &str) -> Arc<Self> {
            Arc::new(Self {
                name,
                answer: Ok(StructuredResponse::new(text)),
                delay: Duration::ZERO,
                calls: Mutex::new(0),
            })
        }

        fn err(name: &'static str, err: ProviderError) -> Arc<Self> {
            Arc::new(Self {
                name,
                answer: Err(err),
                delay: Duration::ZERO,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl ReasoningProvider for Canned {
        fn name(&self) -> &str {
            self.name
        }

        async fn propose(&self, _prompt: &StructuredPrompt) -> ProviderResult<StructuredResponse> {
            *self.calls.lock() += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.answer.clone()
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot::new(
            ScreenSize::new(100, 100),
            Vec::new(),
            vec![UiElement::new("42", Bounds::new(10, 10, 50, 50))],
        )
    }

    fn request(snapshot: &Snapshot) -> PlanRequest<'_> {
        PlanRequest {
            instruction: "tap element #42",
            snapshot,
            history: &[],
            recent_failures: &[],
        }
    }

    #[tokio::test]
    async fn test_fallback_on_provider_error() {
        let primary = Canned::err("primary", ProviderError::Unavailable("503".into()));
        let backup = Canned::ok("backup", r#"{"action":"tap","element":"42"}"#);
        let planner = Planner::new(primary.clone()).fallback(backup.clone());

        let snap = snapshot();
        let proposal = planner.propose_action(&request(&snap)).await.unwrap();
        assert_eq!(
            proposal,
            ActionProposal::Tap {
                target: TapTarget::Element("42".into())
            }
        );
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_fallback_on_malformed_output() {
        let primary = Canned::ok("primary", "I think you should tap it");
        let backup = Canned::ok("backup", r#"{"action":"tap","element":"42"}"#);
        let planner = Planner::new(primary).fallback(backup.clone());

        let snap = snapshot();
        let err = planner.propose_action(&request(&snap)).await.unwrap_err();
        assert!(matches!(err, PlanError::Malformed(_)));
        assert_eq!(backup.calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_provider_timeout() {
        let slow = Arc::new(Canned {
            name: "slow",
            answer: Ok(StructuredResponse::new("{}")),
            delay: Duration::from_secs(5),
            calls: Mutex::new(0),
        });
        let planner = Planner::new(slow).timeout(Duration::from_millis(20));
        let snap = snapshot();
        let err = planner.propose_action(&request(&snap)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProviderTimeout);
    }

    #[tokio::test]
    async fn test_empty_planner() {
        let snap = snapshot();
        let err = Planner::empty()
            .propose_action(&request(&snap))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::NoProviders));
    }
}

//! Test doubles shared by the integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use mobile_pilot::config::Config;
use mobile_pilot::error::{ProviderError, ProviderResult, ValidationError};
use mobile_pilot::reasoning::{ReasoningProvider, StructuredPrompt, StructuredResponse};
use mobile_pilot::validator::{ResultValidator, ValidationRequest, Verdict};
use mobile_pilot::{Bounds, LoopConfig, MockDevice, MockScreen, UiElement};

/// Provider that replays a script of answers; the last one repeats forever
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<ProviderResult<String>>>,
    last: Mutex<Option<ProviderResult<String>>>,
    prompts: Mutex<Vec<StructuredPrompt>>,
    delay: Duration,
}

impl ScriptedProvider {
    pub fn new(answers: Vec<ProviderResult<String>>) -> Self {
        Self {
            name: "scripted".to_string(),
            script: Mutex::new(answers.into()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Always answer `text`
    pub fn always(text: &str) -> Self {
        Self::new(vec![Ok(text.to_string())])
    }

    pub fn answers(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(t.to_string())).collect())
    }

    pub fn failing(err: ProviderError) -> Self {
        Self::new(vec![Err(err)])
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }

    pub fn prompts(&self) -> Vec<StructuredPrompt> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn propose(&self, prompt: &StructuredPrompt) -> ProviderResult<StructuredResponse> {
        self.prompts.lock().push(prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = {
            let mut script = self.script.lock();
            let mut last = self.last.lock();
            match script.pop_front() {
                Some(answer) => {
                    *last = Some(answer.clone());
                    answer
                }
                None => last
                    .clone()
                    .unwrap_or_else(|| Err(ProviderError::Unavailable("script is empty".into()))),
            }
        };
        next.map(StructuredResponse::new)
    }
}

/// Validator that replays verdicts; the last one repeats forever
pub struct FixedValidator {
    verdicts: Mutex<VecDeque<Result<Verdict, ValidationError>>>,
    last: Mutex<Result<Verdict, ValidationError>>,
}

impl FixedValidator {
    pub fn always(verdict: Verdict) -> Self {
        Self::sequence(vec![Ok(verdict)])
    }

    pub fn sequence(verdicts: Vec<Result<Verdict, ValidationError>>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            last: Mutex::new(Ok(Verdict::Ambiguous)),
        }
    }
}

#[async_trait]
impl ResultValidator for FixedValidator {
    async fn validate(&self, _request: &ValidationRequest<'_>) -> Result<Verdict, ValidationError> {
        let mut verdicts = self.verdicts.lock();
        let mut last = self.last.lock();
        if let Some(next) = verdicts.pop_front() {
            *last = next.clone();
        }
        last.clone()
    }
}

/// Fast loop settings for tests
pub fn fast_config() -> LoopConfig {
    LoopConfig::from_config(&Config::defaults())
        .settle_delay(Duration::ZERO)
        .action_timeout(Duration::from_secs(5))
        .plan_timeout(Duration::from_secs(5))
        .validation_timeout(Duration::from_secs(5))
}

/// Home screen holding element `42`; tapping it opens a detail screen
pub fn home_device(name: &str) -> MockDevice {
    let home = MockScreen::new("home", 100, 100).element(
        UiElement::new("42", Bounds::new(10, 10, 50, 50))
            .role("Button")
            .label("Open"),
    );
    let detail = MockScreen::new("detail", 100, 100).element(
        UiElement::new("title", Bounds::new(0, 0, 100, 20))
            .role("TextView")
            .label("Detail")
            .interactive(false),
    );
    MockDevice::named(name, home)
        .screen(detail)
        .on_tap("home", "42", "detail")
}

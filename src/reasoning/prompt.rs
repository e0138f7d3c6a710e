//! Structured prompt construction.
//!
//! Prompts depend only on the instruction, the snapshot's screen and elements,
//! and the history passed in, so identical inputs always render identically.

use std::fmt::Write;
use std::sync::Arc;

use super::ActionProposal;
use crate::perception::Snapshot;
use crate::task::{FailureNote, Step};

/// Provider-independent prompt fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredPrompt {
    pub system: String,
    pub text: String,
    /// PNG screen capture, when the provider should see the screen
    pub image: Option<Arc<Vec<u8>>>,
}

const PLAN_SYSTEM: &str = "You operate an Android phone to complete the user's task. \
Each turn you receive the task, the current screen and the elements on it, and the \
actions taken so far. Reply with exactly one JSON object describing the next action:\n\
{\"action\":\"tap\",\"element\":\"<id>\"}\n\
{\"action\":\"tap\",\"x\":<int>,\"y\":<int>}\n\
{\"action\":\"swipe\",\"direction\":\"up|down|left|right\"}\n\
{\"action\":\"swipe\",\"from\":[x,y],\"to\":[x,y]}\n\
{\"action\":\"type_text\",\"text\":\"...\"}\n\
{\"action\":\"key_press\",\"key\":\"BACK|HOME|ENTER|...\"}\n\
{\"action\":\"wait\",\"ms\":<int up to 60000>}\n\
{\"action\":\"done\",\"success\":true|false,\"summary\":\"...\"}\n\
Prefer element ids over coordinates. Only answer done with success true when the \
screen already shows the requested final state. If a previous action failed, choose \
a different approach instead of repeating it.";

const VERIFY_SYSTEM: &str = "You check whether a phone automation task has reached its goal. \
You receive the goal, the action just performed and the screen before and after it. \
Reply with exactly one JSON object: {\"verdict\":\"goal_met\"|\"not_yet_met\"|\"ambiguous\",\
\"reason\":\"...\"}. Use ambiguous when the screen does not let you tell.";

/// Inputs to one planning call
#[derive(Debug, Clone, Copy)]
pub struct PlanPrompt<'a> {
    pub instruction: &'a str,
    pub snapshot: &'a Snapshot,
    pub history: &'a [Step],
    pub recent_failures: &'a [FailureNote],
    /// Most recent steps to include
    pub history_window: usize,
}

impl PlanPrompt<'_> {
    pub fn render(&self) -> StructuredPrompt {
        let mut text = String::new();
        let _ = writeln!(text, "Task: {}", self.instruction);
        let _ = writeln!(
            text,
            "Screen: {}x{}",
            self.snapshot.screen.width, self.snapshot.screen.height
        );
        text.push_str("\nElements:\n");
        write_elements(&mut text, self.snapshot);

        let start = self.history.len().saturating_sub(self.history_window);
        if self.history.is_empty() {
            text.push_str("\nHistory: none\n");
        } else {
            text.push_str("\nHistory:\n");
            for step in &self.history[start..] {
                let _ = writeln!(text, "{}", step.describe());
            }
        }

        if !self.recent_failures.is_empty() {
            text.push_str("\nRecent failures:\n");
            for failure in self.recent_failures {
                let _ = writeln!(text, "- {}", failure);
            }
        }

        StructuredPrompt {
            system: PLAN_SYSTEM.to_string(),
            text,
            image: Some(self.snapshot.shared_image()),
        }
    }
}

/// Prompt asking a provider whether `goal` now holds
pub fn verify_prompt(
    goal: &str,
    proposal: &ActionProposal,
    before: &Snapshot,
    after: &Snapshot,
) -> StructuredPrompt {
    let mut text = String::new();
    let _ = writeln!(text, "Goal: {}", goal);
    let _ = writeln!(text, "Action performed: {}", proposal);
    text.push_str("\nElements before:\n");
    write_elements(&mut text, before);
    text.push_str("\nElements after:\n");
    write_elements(&mut text, after);
    StructuredPrompt {
        system: VERIFY_SYSTEM.to_string(),
        text,
        image: Some(after.shared_image()),
    }
}

fn write_elements(out: &mut String, snapshot: &Snapshot) {
    if snapshot.elements().is_empty() {
        out.push_str("(none recognized)\n");
        return;
    }
    for element in snapshot.elements() {
        let _ = write!(out, "[{}] {} {}", element.id, element.role, element.bounds);
        if !element.label.is_empty() {
            let _ = write!(out, " \"{}\"", element.label);
        }
        if !element.interactive {
            out.push_str(" (static)");
        }
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Bounds, ScreenSize, UiElement};
    use crate::error::ErrorKind;

    fn snapshot() -> Snapshot {
        Snapshot::new(
            ScreenSize::new(1080, 1920),
            vec![1, 2, 3],
            vec![
                UiElement::new("login", Bounds::new(100, 900, 980, 1020))
                    .role("Button")
                    .label("Sign in"),
                UiElement::new("title", Bounds::new(0, 0, 1080, 100))
                    .label("Welcome")
                    .interactive(false),
            ],
        )
    }

    #[test]
    fn test_plan_prompt_lists_elements() {
        let snap = snapshot();
        let prompt = PlanPrompt {
            instruction: "sign in",
            snapshot: &snap,
            history: &[],
            recent_failures: &[],
            history_window: 10,
        }
        .render();
        assert!(prompt.text.contains("Task: sign in"));
        assert!(prompt.text.contains("[login] Button [100,900][980,1020] \"Sign in\""));
        assert!(prompt.text.contains("[title] View [0,0][1080,100] \"Welcome\" (static)"));
        assert!(prompt.text.contains("History: none"));
        assert_eq!(prompt.image.as_deref(), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn test_plan_prompt_includes_failures() {
        let snap = snapshot();
        let failures = [FailureNote {
            kind: ErrorKind::StaleReference,
            reason: "element 'ok' is gone".into(),
        }];
        let prompt = PlanPrompt {
            instruction: "sign in",
            snapshot: &snap,
            history: &[],
            recent_failures: &failures,
            history_window: 10,
        }
        .render();
        assert!(prompt.text.contains("- StaleReference: element 'ok' is gone"));
    }

    #[test]
    fn test_identical_inputs_render_identically() {
        let a = snapshot();
        let b = snapshot();
        let render = |s: &Snapshot| {
            PlanPrompt {
                instruction: "sign in",
                snapshot: s,
                history: &[],
                recent_failures: &[],
                history_window: 10,
            }
            .render()
        };
        assert_eq!(render(&a), render(&b));
    }
}

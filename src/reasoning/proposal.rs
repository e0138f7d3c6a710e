//! Action proposals and the strict parser for provider output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::device::{KeyCode, Point, duration_ms};
use crate::error::PlanError;
use crate::perception::Snapshot;

/// Longest wait a provider may ask for
pub const MAX_WAIT: Duration = Duration::from_secs(60);

/// What a tap aims at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapTarget {
    /// Element id, re-resolved against the live element list before dispatch
    Element(String),
    Point(Point),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwipeMotion {
    Direction(Direction),
    Vector { from: Point, to: Point },
}

/// The next action chosen by the reasoning step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionProposal {
    Tap {
        target: TapTarget,
    },
    Swipe {
        motion: SwipeMotion,
    },
    TypeText {
        text: String,
    },
    KeyPress {
        key: KeyCode,
    },
    Wait {
        #[serde(with = "duration_ms")]
        duration: Duration,
    },
    Done {
        success: bool,
        summary: String,
    },
}

impl ActionProposal {
    pub fn is_done(&self) -> bool {
        matches!(self, ActionProposal::Done { .. })
    }
}

impl fmt::Display for ActionProposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionProposal::Tap {
                target: TapTarget::Element(id),
            } => write!(f, "tap element '{}'", id),
            ActionProposal::Tap {
                target: TapTarget::Point(p),
            } => write!(f, "tap at {}", p),
            ActionProposal::Swipe {
                motion: SwipeMotion::Direction(d),
            } => write!(f, "swipe {}", d.as_str()),
            ActionProposal::Swipe {
                motion: SwipeMotion::Vector { from, to },
            } => write!(f, "swipe {} -> {}", from, to),
            ActionProposal::TypeText { text } => write!(f, "type {:?}", text),
            ActionProposal::KeyPress { key } => write!(f, "press {}", key),
            ActionProposal::Wait { duration } => write!(f, "wait {}ms", duration.as_millis()),
            ActionProposal::Done { success, summary } => {
                write!(f, "done (success={}): {}", success, summary)
            }
        }
    }
}

fn malformed(msg: impl Into<String>) -> PlanError {
    PlanError::Malformed(msg.into())
}

/// Parse a provider answer into a proposal, validated against `snapshot`.
///
/// Accepts a bare JSON object, one wrapped in a ```json fence, or one embedded
/// in surrounding prose. The action may sit at the top level or under
/// `next_step`; fields may sit at the top level or under `parameters`.
pub fn parse_proposal(text: &str, snapshot: &Snapshot) -> Result<ActionProposal, PlanError> {
    let json = extract_json(text).ok_or_else(|| malformed("no JSON object in response"))?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;
    let root = value
        .as_object()
        .ok_or_else(|| malformed("response is not a JSON object"))?;

    let summary = string_field(root, &["summary", "reason", "reasoning"]).unwrap_or_default();
    if root.get("task_complete").and_then(Value::as_bool) == Some(true) {
        return Ok(ActionProposal::Done {
            success: true,
            summary,
        });
    }

    let step = match root.get("next_step") {
        Some(Value::Object(step)) => step,
        Some(Value::Null) | None => root,
        Some(_) => return Err(malformed("next_step is not an object")),
    };
    let fields = Fields::new(step);

    let action = fields
        .str(&["action", "type"])
        .ok_or_else(|| malformed("missing 'action'"))?
        .trim()
        .to_lowercase();

    match action.as_str() {
        "tap" | "click" => parse_tap(&fields, snapshot),
        "long_press" | "long_click" => Err(malformed(format!(
            "'{}' is not supported, only plain taps",
            action
        ))),
        "swipe" | "scroll" => parse_swipe(&fields),
        "type_text" | "type" | "input" | "text" => {
            let text = fields
                .str(&["text", "value", "content"])
                .ok_or_else(|| malformed("type_text requires 'text'"))?;
            if text.is_empty() {
                return Err(malformed("type_text with empty text"));
            }
            Ok(ActionProposal::TypeText { text })
        }
        "key_press" | "press_key" | "key" | "keyevent" => {
            let name = fields
                .str(&["key", "keycode", "code"])
                .ok_or_else(|| malformed("key_press requires 'key'"))?;
            let key = name.parse::<KeyCode>().map_err(malformed)?;
            Ok(ActionProposal::KeyPress { key })
        }
        "back" => Ok(ActionProposal::KeyPress { key: KeyCode::Back }),
        "home" => Ok(ActionProposal::KeyPress { key: KeyCode::Home }),
        "wait" => {
            let ms = if let Some(ms) = fields.number(&["ms", "duration_ms", "duration"]) {
                non_negative(ms, "wait")?
            } else if let Some(s) = fields.number(&["seconds", "secs"]) {
                non_negative(s, "wait")? * 1000.0
            } else {
                return Err(malformed("wait requires 'ms'"));
            };
            if ms > MAX_WAIT.as_millis() as f64 {
                return Err(malformed(format!(
                    "wait of {}ms exceeds {}s",
                    ms,
                    MAX_WAIT.as_secs()
                )));
            }
            Ok(ActionProposal::Wait {
                duration: Duration::from_millis(ms as u64),
            })
        }
        "done" | "finish" | "complete" | "task_complete" => {
            let success = match fields.get(&["success"]) {
                None => true,
                Some(Value::Bool(b)) => *b,
                Some(_) => return Err(malformed("'success' must be a boolean")),
            };
            let summary = fields
                .str(&["summary", "reason", "description"])
                .unwrap_or(summary);
            Ok(ActionProposal::Done { success, summary })
        }
        other => Err(malformed(format!("unknown action '{}'", other))),
    }
}

fn parse_tap(fields: &Fields<'_>, snapshot: &Snapshot) -> Result<ActionProposal, PlanError> {
    if let Some(id) = fields.id(&["element", "element_id", "target_id"]) {
        if snapshot.element(&id).is_none() {
            return Err(malformed(format!("unknown element '{}'", id)));
        }
        return Ok(ActionProposal::Tap {
            target: TapTarget::Element(id),
        });
    }
    if let Some(index) = fields.id(&["target_index", "index"]) {
        let id = resolve_index(&index, snapshot)
            .ok_or_else(|| malformed(format!("unknown element '{}'", index)))?;
        return Ok(ActionProposal::Tap {
            target: TapTarget::Element(id),
        });
    }
    if let Some(point) = fields.point(&["point", "coordinates"])? {
        return Ok(ActionProposal::Tap {
            target: TapTarget::Point(point),
        });
    }
    match (fields.number(&["x"]), fields.number(&["y"])) {
        (Some(x), Some(y)) => Ok(ActionProposal::Tap {
            target: TapTarget::Point(Point::new(
                non_negative(x, "x")? as i32,
                non_negative(y, "y")? as i32,
            )),
        }),
        _ => Err(malformed("tap requires 'element' or 'x'/'y'")),
    }
}

/// `target_index` names an element id, or failing that its 1-based position
fn resolve_index(index: &str, snapshot: &Snapshot) -> Option<String> {
    if let Some(element) = snapshot.element(index) {
        return Some(element.id.clone());
    }
    let position: usize = index.parse().ok()?;
    snapshot
        .elements()
        .get(position.checked_sub(1)?)
        .map(|e| e.id.clone())
}

fn parse_swipe(fields: &Fields<'_>) -> Result<ActionProposal, PlanError> {
    if let Some(direction) = fields.str(&["direction"]) {
        let direction = match direction.trim().to_lowercase().as_str() {
            "up" => Direction::Up,
            "down" => Direction::Down,
            "left" => Direction::Left,
            "right" => Direction::Right,
            other => return Err(malformed(format!("unknown swipe direction '{}'", other))),
        };
        return Ok(ActionProposal::Swipe {
            motion: SwipeMotion::Direction(direction),
        });
    }
    match (fields.point(&["from", "start"])?, fields.point(&["to", "end"])?) {
        (Some(from), Some(to)) => Ok(ActionProposal::Swipe {
            motion: SwipeMotion::Vector { from, to },
        }),
        _ => Err(malformed("swipe requires 'direction' or 'from'/'to'")),
    }
}

fn non_negative(value: f64, field: &str) -> Result<f64, PlanError> {
    if value < 0.0 || !value.is_finite() {
        return Err(malformed(format!("'{}' must be a non-negative number", field)));
    }
    Ok(value)
}

/// Field lookup across a step object and its `parameters` map
struct Fields<'a> {
    step: &'a Map<String, Value>,
    params: Option<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
    fn new(step: &'a Map<String, Value>) -> Self {
        Self {
            step,
            params: step.get("parameters").and_then(Value::as_object),
        }
    }

    fn get(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter().find_map(|k| {
            self.step
                .get(*k)
                .filter(|v| !v.is_null())
                .or_else(|| self.params.and_then(|p| p.get(*k)).filter(|v| !v.is_null()))
        })
    }

    fn str(&self, keys: &[&str]) -> Option<String> {
        self.get(keys).and_then(Value::as_str).map(str::to_string)
    }

    fn number(&self, keys: &[&str]) -> Option<f64> {
        self.get(keys).and_then(Value::as_f64)
    }

    /// A string or integer identifier
    fn id(&self, keys: &[&str]) -> Option<String> {
        match self.get(keys)? {
            Value::String(s) => Some(s.trim().trim_start_matches('#').to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// `[x, y]` or `{"x": .., "y": ..}`
    fn point(&self, keys: &[&str]) -> Result<Option<Point>, PlanError> {
        let Some(value) = self.get(keys) else {
            return Ok(None);
        };
        let (x, y) = match value {
            Value::Array(items) if items.len() == 2 => (items[0].as_f64(), items[1].as_f64()),
            Value::Object(map) => (
                map.get("x").and_then(Value::as_f64),
                map.get("y").and_then(Value::as_f64),
            ),
            _ => (None, None),
        };
        match (x, y) {
            (Some(x), Some(y)) => Ok(Some(Point::new(
                non_negative(x, "x")? as i32,
                non_negative(y, "y")? as i32,
            ))),
            _ => Err(malformed(format!("invalid point: {}", value))),
        }
    }
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// Locate the JSON object in a model answer
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let body = if let Some(start) = text.find("```json") {
        let rest = &text[start + "```json".len()..];
        rest.find("```").map_or(rest, |end| &rest[..end])
    } else if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        rest.find("```").map_or(rest, |end| &rest[..end])
    } else {
        text
    };
    let open = body.find('{')?;
    let close = body.rfind('}')?;
    (close > open).then(|| &body[open..=close])
}

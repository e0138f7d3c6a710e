//! Action execution: turning a proposal into primitive bridge calls.

use std::time::Duration;
use tokio::time::timeout;

use crate::device::{DeviceBridge, Point, PrimitiveAction, ScreenSize};
use crate::error::{BridgeError, ErrorKind};
use crate::perception::Snapshot;
use crate::reasoning::{ActionProposal, Direction, SwipeMotion, TapTarget};

pub const DEFAULT_SWIPE_DURATION: Duration = Duration::from_millis(500);

/// A proposal that could not be carried out
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct ExecutionFailure {
    pub kind: ErrorKind,
    pub reason: String,
    /// Primitives that reached the device before the failure
    pub dispatched: Vec<PrimitiveAction>,
}

impl ExecutionFailure {
    fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            dispatched: Vec::new(),
        }
    }
}

impl From<BridgeError> for ExecutionFailure {
    /// A bridge call that hangs while acting is a failed action, the same as
    /// when the executor's own timeout fires first. Only an unreachable device
    /// stays `BridgeUnavailable`.
    fn from(err: BridgeError) -> Self {
        let kind = match err {
            BridgeError::Timeout(_) => ErrorKind::BridgeActionFailed,
            _ => err.kind(),
        };
        Self::new(kind, err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ActionExecutor {
    timeout: Duration,
    swipe_duration: Duration,
}

impl ActionExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            swipe_duration: DEFAULT_SWIPE_DURATION,
        }
    }

    pub fn swipe_duration(mut self, duration: Duration) -> Self {
        self.swipe_duration = duration;
        self
    }

    /// Carry out `proposal`, planned against `snapshot`, within the action
    /// timeout. Returns the primitives dispatched.
    ///
    /// Coordinates are checked against the snapshot's screen before anything
    /// is dispatched. Element targets are looked up in the live element list,
    /// not the snapshot.
    pub async fn execute(
        &self,
        bridge: &dyn DeviceBridge,
        snapshot: &Snapshot,
        proposal: &ActionProposal,
    ) -> Result<Vec<PrimitiveAction>, ExecutionFailure> {
        let mut dispatched = Vec::new();
        let result = timeout(
            self.timeout,
            self.run(bridge, snapshot, proposal, &mut dispatched),
        )
        .await;

        match result {
            Ok(Ok(())) => Ok(dispatched),
            Ok(Err(mut failure)) => {
                failure.dispatched = dispatched;
                Err(failure)
            }
            Err(_) => Err(ExecutionFailure {
                kind: ErrorKind::BridgeActionFailed,
                reason: format!("{} timed out after {:?}", proposal, self.timeout),
                dispatched,
            }),
        }
    }

    async fn run(
        &self,
        bridge: &dyn DeviceBridge,
        snapshot: &Snapshot,
        proposal: &ActionProposal,
        dispatched: &mut Vec<PrimitiveAction>,
    ) -> Result<(), ExecutionFailure> {
        let primitives = match proposal {
            ActionProposal::Wait { duration } => {
                tokio::time::sleep(*duration).await;
                return Ok(());
            }
            ActionProposal::Done { .. } => return Ok(()),
            ActionProposal::Tap {
                target: TapTarget::Element(id),
            } => {
                let point = resolve_element(bridge, snapshot, id).await?;
                vec![PrimitiveAction::Tap { point }]
            }
            ActionProposal::Tap {
                target: TapTarget::Point(point),
            } => {
                check_bounds(snapshot, *point)?;
                vec![PrimitiveAction::Tap { point: *point }]
            }
            ActionProposal::Swipe { motion } => {
                let (from, to) = match motion {
                    SwipeMotion::Direction(direction) => swipe_vector(snapshot.screen, *direction),
                    SwipeMotion::Vector { from, to } => {
                        check_bounds(snapshot, *from)?;
                        check_bounds(snapshot, *to)?;
                        (*from, *to)
                    }
                };
                vec![PrimitiveAction::Swipe {
                    from,
                    to,
                    duration: self.swipe_duration,
                }]
            }
            ActionProposal::TypeText { text } => vec![PrimitiveAction::Text { text: text.clone() }],
            ActionProposal::KeyPress { key } => vec![PrimitiveAction::Key { key: *key }],
        };

        for primitive in primitives {
            tracing::debug!(device = bridge.id(), action = %primitive, "dispatching");
            bridge.dispatch(&primitive).await?;
            dispatched.push(primitive);
        }
        Ok(())
    }
}

/// Find `id` on the current screen and return its center.
///
/// The live element must still be the widget that was planned against: an id
/// now held by a different widget is a stale reference.
async fn resolve_element(
    bridge: &dyn DeviceBridge,
    snapshot: &Snapshot,
    id: &str,
) -> Result<Point, ExecutionFailure> {
    let live = bridge.list_elements().await?;
    // Normalize the same way the snapshot did so ids line up
    let current = Snapshot::new(snapshot.screen, Vec::new(), live);
    let element = current.element(id).ok_or_else(|| {
        ExecutionFailure::new(
            ErrorKind::StaleReference,
            format!("element '{}' is no longer on screen", id),
        )
    })?;
    let planned = snapshot.element(id);
    if let Some(planned) = planned.filter(|p| !p.same_widget(element)) {
        return Err(ExecutionFailure::new(
            ErrorKind::StaleReference,
            format!(
                "element '{}' now refers to {} '{}' instead of {} '{}'",
                id, element.role, element.label, planned.role, planned.label
            ),
        ));
    }
    let center = element.bounds.center();
    check_bounds(snapshot, center)?;
    Ok(center)
}

fn check_bounds(snapshot: &Snapshot, point: Point) -> Result<(), ExecutionFailure> {
    if snapshot.contains_point(point) {
        Ok(())
    } else {
        Err(ExecutionFailure::new(
            ErrorKind::OutOfBounds,
            format!(
                "{} is outside the {}x{} screen",
                point, snapshot.screen.width, snapshot.screen.height
            ),
        ))
    }
}

/// Swipe along the screen's center line: vertical swipes span 70% to 30% of
/// the height, horizontal ones 80% to 20% of the width.
pub fn swipe_vector(screen: ScreenSize, direction: Direction) -> (Point, Point) {
    let w = screen.width as f64;
    let h = screen.height as f64;
    let at = |fx: f64, fy: f64| Point::new((w * fx) as i32, (h * fy) as i32);
    match direction {
        Direction::Up => (at(0.5, 0.7), at(0.5, 0.3)),
        Direction::Down => (at(0.5, 0.3), at(0.5, 0.7)),
        Direction::Left => (at(0.8, 0.5), at(0.2, 0.5)),
        Direction::Right => (at(0.2, 0.5), at(0.8, 0.5)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Bounds, KeyCode, MockDevice, MockScreen, UiElement};

    fn device() -> MockDevice {
        MockDevice::new(
            MockScreen::new("home", 1000, 2000).element(
                UiElement::new("ok", Bounds::new(100, 100, 300, 200)).label("OK"),
            ),
        )
    }

    fn snapshot() -> Snapshot {
        Snapshot::new(
            ScreenSize::new(1000, 2000),
            Vec::new(),
            vec![UiElement::new("ok", Bounds::new(100, 100, 300, 200))],
        )
    }

    #[test]
    fn test_swipe_geometry() {
        let screen = ScreenSize::new(1000, 2000);
        assert_eq!(
            swipe_vector(screen, Direction::Up),
            (Point::new(500, 1400), Point::new(500, 600))
        );
        assert_eq!(
            swipe_vector(screen, Direction::Left),
            (Point::new(800, 1000), Point::new(200, 1000))
        );
    }

    #[tokio::test]
    async fn test_tap_element_uses_live_position() {
        let device = MockDevice::new(
            MockScreen::new("home", 1000, 2000)
                .element(UiElement::new("ok", Bounds::new(100, 500, 300, 600))),
        );
        let executor = ActionExecutor::new(Duration::from_secs(1));
        let proposal = ActionProposal::Tap {
            target: TapTarget::Element("ok".into()),
        };
        let sent = executor
            .execute(&device, &snapshot(), &proposal)
            .await
            .unwrap();
        assert_eq!(
            sent,
            vec![PrimitiveAction::Tap {
                point: Point::new(200, 550)
            }]
        );
    }

    #[tokio::test]
    async fn test_stale_reference_does_not_dispatch() {
        let device = device();
        let executor = ActionExecutor::new(Duration::from_secs(1));
        let proposal = ActionProposal::Tap {
            target: TapTarget::Element("gone".into()),
        };
        let failure = executor
            .execute(&device, &snapshot(), &proposal)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::StaleReference);
        assert_eq!(device.dispatch_attempts(), 0);
    }

    #[tokio::test]
    async fn test_id_taken_by_another_widget_is_stale() {
        // The planned id now names a different button on the live screen
        let device = MockDevice::new(
            MockScreen::new("home", 1000, 2000).element(
                UiElement::new("row#2", Bounds::new(100, 100, 300, 200))
                    .role("Button")
                    .label("Delete"),
            ),
        );
        let planned = Snapshot::new(
            ScreenSize::new(1000, 2000),
            Vec::new(),
            vec![
                UiElement::new("row#2", Bounds::new(100, 1500, 300, 1700))
                    .role("Button")
                    .label("Cancel"),
            ],
        );
        let executor = ActionExecutor::new(Duration::from_secs(1));
        let proposal = ActionProposal::Tap {
            target: TapTarget::Element("row#2".into()),
        };
        let failure = executor
            .execute(&device, &planned, &proposal)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::StaleReference);
        assert!(failure.reason.contains("Delete"));
        assert_eq!(device.dispatch_attempts(), 0);
    }

    #[tokio::test]
    async fn test_out_of_bounds_does_not_dispatch() {
        let device = device();
        let executor = ActionExecutor::new(Duration::from_secs(1));
        let proposal = ActionProposal::Tap {
            target: TapTarget::Point(Point::new(1000, 10)),
        };
        let failure = executor
            .execute(&device, &snapshot(), &proposal)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::OutOfBounds);
        assert_eq!(device.dispatch_attempts(), 0);
    }

    #[tokio::test]
    async fn test_bridge_failure_is_classified() {
        let device = device();
        device.fail_dispatches(1, BridgeError::ActionFailed("injected".into()));
        let executor = ActionExecutor::new(Duration::from_secs(1));
        let failure = executor
            .execute(
                &device,
                &snapshot(),
                &ActionProposal::KeyPress { key: KeyCode::Back },
            )
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::BridgeActionFailed);
        assert!(failure.dispatched.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_action_failure() {
        let device = device();
        device.set_dispatch_delay(Duration::from_secs(5));
        let executor = ActionExecutor::new(Duration::from_millis(20));
        let failure = executor
            .execute(
                &device,
                &snapshot(),
                &ActionProposal::TypeText {
                    text: "hello".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::BridgeActionFailed);
        assert!(failure.reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_bridge_timeout_is_action_failure() {
        let device = device();
        device.fail_dispatches(1, BridgeError::Timeout(Duration::from_secs(15)));
        let executor = ActionExecutor::new(Duration::from_secs(30));
        let failure = executor
            .execute(
                &device,
                &snapshot(),
                &ActionProposal::KeyPress { key: KeyCode::Home },
            )
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::BridgeActionFailed);
    }

    #[tokio::test]
    async fn test_unavailable_device_stays_unavailable() {
        let device = device();
        device.fail_dispatches(1, BridgeError::Unavailable("device offline".into()));
        let executor = ActionExecutor::new(Duration::from_secs(1));
        let failure = executor
            .execute(
                &device,
                &snapshot(),
                &ActionProposal::KeyPress { key: KeyCode::Home },
            )
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::BridgeUnavailable);
    }

    #[tokio::test]
    async fn test_wait_longer_than_timeout_fails() {
        let executor = ActionExecutor::new(Duration::from_millis(20));
        let failure = executor
            .execute(
                &device(),
                &snapshot(),
                &ActionProposal::Wait {
                    duration: Duration::from_secs(5),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::BridgeActionFailed);
    }
}

//! Device bridge abstraction.
//!
//! A bridge is the only way the control loop touches a device:
//! - `capture()` for the raw screen image
//! - `list_elements()` for the structured element list
//! - `dispatch()` for primitive input
//! - `is_connected()` for a cheap liveness check
//!
//! Concrete bridges: [`AdbBridge`] for Android devices and emulators,
//! [`MockDevice`] for tests and demos.

pub mod adb;
pub mod hierarchy;
pub mod lease;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::BridgeResult;

pub use adb::{AdbBridge, AdbDevice};
pub use hierarchy::parse_hierarchy;
pub use lease::{DeviceLease, DeviceRegistry, LeaseError};
pub use mock::{MockDevice, MockFramebuffer, MockScreen};

/// A point in device pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Screen dimensions in device pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether the point lies on the screen (right/bottom edges exclusive)
    pub fn contains(&self, point: Point) -> bool {
        point.x >= 0
            && point.y >= 0
            && (point.x as i64) < self.width as i64
            && (point.y as i64) < self.height as i64
    }

    pub fn center(&self) -> Point {
        Point::new((self.width / 2) as i32, (self.height / 2) as i32)
    }
}

/// Axis-aligned element bounds, `[left, top)` to `[right, bottom)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width() as i64 * self.height() as i64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn center(&self) -> Point {
        Point::new((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.left && point.x < self.right && point.y >= self.top && point.y < self.bottom
    }

    /// Intersect with the screen rectangle
    pub fn clip(&self, screen: ScreenSize) -> Bounds {
        Bounds {
            left: self.left.max(0),
            top: self.top.max(0),
            right: self.right.min(screen.width as i32),
            bottom: self.bottom.min(screen.height as i32),
        }
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}][{},{}]", self.left, self.top, self.right, self.bottom)
    }
}

/// A recognized UI element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiElement {
    /// Identifier, stable across captures when derivable
    pub id: String,
    pub bounds: Bounds,
    /// Short widget type (e.g. "Button", "EditText")
    pub role: String,
    /// Visible text, falling back to the accessibility description
    pub label: String,
    /// Platform resource id, if any
    pub resource_id: Option<String>,
    /// Whether the element accepts taps or input
    pub interactive: bool,
}

impl UiElement {
    pub fn new(id: impl Into<String>, bounds: Bounds) -> Self {
        Self {
            id: id.into(),
            bounds,
            role: "View".to_string(),
            label: String::new(),
            resource_id: None,
            interactive: true,
        }
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Whether `other` is the same widget, ignoring where it sits now
    pub fn same_widget(&self, other: &UiElement) -> bool {
        self.role == other.role && self.label == other.label && self.resource_id == other.resource_id
    }
}

/// Raw screen capture returned by a bridge
#[derive(Debug, Clone)]
pub struct ScreenCapture {
    /// PNG-encoded image data
    pub image_data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Hardware and navigation keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyCode {
    Back,
    Home,
    Enter,
    Menu,
    Recent,
    Search,
    VolumeUp,
    VolumeDown,
    Power,
    Tab,
    Delete,
    Up,
    Down,
    Left,
    Right,
    Center,
}

impl KeyCode {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyCode::Back => "BACK",
            KeyCode::Home => "HOME",
            KeyCode::Enter => "ENTER",
            KeyCode::Menu => "MENU",
            KeyCode::Recent => "RECENT",
            KeyCode::Search => "SEARCH",
            KeyCode::VolumeUp => "VOLUME_UP",
            KeyCode::VolumeDown => "VOLUME_DOWN",
            KeyCode::Power => "POWER",
            KeyCode::Tab => "TAB",
            KeyCode::Delete => "DELETE",
            KeyCode::Up => "UP",
            KeyCode::Down => "DOWN",
            KeyCode::Left => "LEFT",
            KeyCode::Right => "RIGHT",
            KeyCode::Center => "CENTER",
        }
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['-', ' '], "_");
        let key = match normalized.trim_start_matches("KEYCODE_") {
            "BACK" => KeyCode::Back,
            "HOME" => KeyCode::Home,
            "ENTER" | "RETURN" => KeyCode::Enter,
            "MENU" => KeyCode::Menu,
            "RECENT" | "RECENTS" | "APP_SWITCH" => KeyCode::Recent,
            "SEARCH" => KeyCode::Search,
            "VOLUME_UP" | "VOLUMEUP" => KeyCode::VolumeUp,
            "VOLUME_DOWN" | "VOLUMEDOWN" => KeyCode::VolumeDown,
            "POWER" => KeyCode::Power,
            "TAB" => KeyCode::Tab,
            "DELETE" | "DEL" | "BACKSPACE" => KeyCode::Delete,
            "UP" | "DPAD_UP" => KeyCode::Up,
            "DOWN" | "DPAD_DOWN" => KeyCode::Down,
            "LEFT" | "DPAD_LEFT" => KeyCode::Left,
            "RIGHT" | "DPAD_RIGHT" => KeyCode::Right,
            "CENTER" | "DPAD_CENTER" => KeyCode::Center,
            other => return Err(format!("unknown key '{}'", other)),
        };
        Ok(key)
    }
}

/// Input the bridge can perform in a single call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrimitiveAction {
    Tap { point: Point },
    Swipe {
        from: Point,
        to: Point,
        #[serde(with = "duration_ms")]
        duration: Duration,
    },
    Text { text: String },
    Key { key: KeyCode },
}

impl fmt::Display for PrimitiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveAction::Tap { point } => write!(f, "tap {}", point),
            PrimitiveAction::Swipe { from, to, duration } => {
                write!(f, "swipe {} -> {} in {}ms", from, to, duration.as_millis())
            }
            PrimitiveAction::Text { text } => write!(f, "text {:?}", text),
            PrimitiveAction::Key { key } => write!(f, "key {}", key),
        }
    }
}

/// Uniform capability interface over a physical or emulated device
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Stable identifier of the controlled device (serial, mock name)
    fn id(&self) -> &str;

    /// Capture the current screen as PNG
    async fn capture(&self) -> BridgeResult<ScreenCapture>;

    /// Enumerate the elements currently on screen
    async fn list_elements(&self) -> BridgeResult<Vec<UiElement>>;

    /// Perform one primitive action
    async fn dispatch(&self, action: &PrimitiveAction) -> BridgeResult<()>;

    /// Cheap connectivity check
    async fn is_connected(&self) -> bool;
}

/// Serde helper storing durations as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_center_and_contains() {
        let b = Bounds::new(10, 10, 50, 50);
        assert_eq!(b.center(), Point::new(30, 30));
        assert!(b.contains(Point::new(10, 10)));
        assert!(!b.contains(Point::new(50, 50)));
        assert_eq!(b.area(), 1600);
    }

    #[test]
    fn test_bounds_clip() {
        let screen = ScreenSize::new(100, 200);
        let clipped = Bounds::new(-10, 190, 120, 260).clip(screen);
        assert_eq!(clipped, Bounds::new(0, 190, 100, 200));
        assert!(Bounds::new(120, 0, 150, 10).clip(screen).is_empty());
    }

    #[test]
    fn test_screen_contains() {
        let screen = ScreenSize::new(1080, 1920);
        assert!(screen.contains(Point::new(0, 0)));
        assert!(screen.contains(Point::new(1079, 1919)));
        assert!(!screen.contains(Point::new(1080, 10)));
        assert!(!screen.contains(Point::new(-1, 10)));
    }

    #[test]
    fn test_key_aliases() {
        assert_eq!("back".parse::<KeyCode>().unwrap(), KeyCode::Back);
        assert_eq!("RECENTS".parse::<KeyCode>().unwrap(), KeyCode::Recent);
        assert_eq!("backspace".parse::<KeyCode>().unwrap(), KeyCode::Delete);
        assert_eq!("VolumeUp".parse::<KeyCode>().unwrap(), KeyCode::VolumeUp);
        assert_eq!("KEYCODE_ENTER".parse::<KeyCode>().unwrap(), KeyCode::Enter);
        assert!("hyperdrive".parse::<KeyCode>().is_err());
    }

    #[test]
    fn test_primitive_action_json() {
        let action = PrimitiveAction::Swipe {
            from: Point::new(1, 2),
            to: Point::new(3, 4),
            duration: Duration::from_millis(500),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "swipe");
        assert_eq!(json["duration"], 500);
    }
}

//! Scriptable in-memory device for tests and demos.
//!
//! A [`MockDevice`] is a small state machine over named [`MockScreen`]s. Taps
//! on an element, key presses, swipes and typed text can move it to another
//! screen. Captures are rendered with [`MockFramebuffer`] so the images are
//! real PNGs whose content changes with the screen.

use async_trait::async_trait;
use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, RgbImage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

use super::{DeviceBridge, KeyCode, PrimitiveAction, ScreenCapture, UiElement};
use crate::error::{BridgeError, BridgeResult};

const INTERACTIVE_FILL: [u8; 3] = [52, 101, 164];
const STATIC_FILL: [u8; 3] = [90, 90, 90];
const LABEL_FG: [u8; 3] = [255, 255, 255];

/// A virtual framebuffer for programmatic drawing
///
/// Provides a small drawing API for building screen images:
/// - `fill()` - Fill entire buffer with a color
/// - `draw_rect()` - Draw a filled rectangle
/// - `draw_text()` - Draw text using font8x8 glyphs
/// - `get_pixel()` / `set_pixel()` - Direct pixel access
#[derive(Debug, Clone)]
pub struct MockFramebuffer {
    width: u32,
    height: u32,
    /// RGB pixel buffer (row-major, 3 bytes per pixel)
    buffer: Vec<u8>,
}

impl MockFramebuffer {
    /// Create a new framebuffer with the given dimensions, initialized to black
    pub fn new(width: u32, height: u32) -> Self {
        let buffer = vec![0u8; (width as usize) * (height as usize) * 3];
        Self {
            width,
            height,
            buffer,
        }
    }

    /// Create a framebuffer initialized to a specific color
    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        let mut fb = Self::new(width, height);
        fb.fill(color);
        fb
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fill(&mut self, color: [u8; 3]) {
        for chunk in self.buffer.chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }
    }

    /// Draw a filled rectangle, clipped to the buffer
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        let bottom = y.saturating_add(h).min(self.height);
        let right = x.saturating_add(w).min(self.width);
        for py in y..bottom {
            for px in x..right {
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Draw text using font8x8 glyphs
    ///
    /// Each character is 8x8 pixels. Text does not wrap.
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3]) {
        let mut cursor_x = x;
        for ch in text.chars() {
            if cursor_x >= self.width {
                break;
            }
            self.draw_char(cursor_x, y, ch, fg, bg);
            cursor_x += 8;
        }
    }

    fn draw_char(&mut self, x: u32, y: u32, ch: char, fg: [u8; 3], bg: [u8; 3]) {
        let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
        for (row_idx, row) in glyph.iter().enumerate() {
            let py = y + row_idx as u32;
            if py >= self.height {
                break;
            }
            for bit in 0..8 {
                let px = x + bit;
                if px >= self.width {
                    break;
                }
                // font8x8 stores LSB as leftmost pixel
                let color = if (row >> bit) & 1 == 1 { fg } else { bg };
                self.set_pixel(px, py, color);
            }
        }
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let idx = ((y as usize) * (self.width as usize) + x as usize) * 3;
        [self.buffer[idx], self.buffer[idx + 1], self.buffer[idx + 2]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y as usize) * (self.width as usize) + x as usize) * 3;
        self.buffer[idx..idx + 3].copy_from_slice(&color);
    }

    pub fn to_image(&self) -> BridgeResult<RgbImage> {
        ImageBuffer::from_raw(self.width, self.height, self.buffer.clone()).ok_or_else(|| {
            BridgeError::InvalidOutput("framebuffer size does not match dimensions".to_string())
        })
    }

    /// Encode the framebuffer as PNG bytes
    pub fn to_png(&self) -> BridgeResult<Vec<u8>> {
        let img = self.to_image()?;
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| BridgeError::InvalidOutput(format!("failed to encode PNG: {}", e)))?;
        Ok(bytes)
    }
}

/// One named screen of a [`MockDevice`]
#[derive(Debug, Clone)]
pub struct MockScreen {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub background: [u8; 3],
    pub elements: Vec<UiElement>,
}

impl MockScreen {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            background: [240, 240, 240],
            elements: Vec::new(),
        }
    }

    pub fn element(mut self, element: UiElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn background(mut self, color: [u8; 3]) -> Self {
        self.background = color;
        self
    }

    /// Render elements as filled boxes with their labels
    pub fn render(&self) -> MockFramebuffer {
        let mut fb = MockFramebuffer::with_color(self.width, self.height, self.background);
        for element in &self.elements {
            let b = element.bounds.clip(super::ScreenSize::new(self.width, self.height));
            if b.is_empty() {
                continue;
            }
            let fill = if element.interactive {
                INTERACTIVE_FILL
            } else {
                STATIC_FILL
            };
            fb.draw_rect(
                b.left as u32,
                b.top as u32,
                b.width() as u32,
                b.height() as u32,
                fill,
            );
            if !element.label.is_empty() {
                fb.draw_text(
                    b.left as u32 + 2,
                    b.top as u32 + 2,
                    &element.label,
                    LABEL_FG,
                    fill,
                );
            }
        }
        fb
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Trigger {
    Tap(String),
    Key(KeyCode),
    Swipe,
    Text,
}

#[derive(Debug)]
struct MockState {
    current: String,
    connected: bool,
    dispatched: Vec<PrimitiveAction>,
    dispatch_attempts: usize,
    captures: usize,
    typed: String,
    failing_dispatches: usize,
    dispatch_error: Option<BridgeError>,
    failing_captures: usize,
    capture_error: Option<BridgeError>,
    dispatch_delay: Duration,
}

/// A scriptable device: screens, transitions and failure injection
#[derive(Debug)]
pub struct MockDevice {
    id: String,
    screens: HashMap<String, MockScreen>,
    transitions: HashMap<(String, Trigger), String>,
    state: Mutex<MockState>,
}

impl MockDevice {
    /// Device named `mock-device` starting on `screen`
    pub fn new(screen: MockScreen) -> Self {
        Self::named("mock-device", screen)
    }

    pub fn named(id: impl Into<String>, screen: MockScreen) -> Self {
        let current = screen.name.clone();
        let mut screens = HashMap::new();
        screens.insert(screen.name.clone(), screen);
        Self {
            id: id.into(),
            screens,
            transitions: HashMap::new(),
            state: Mutex::new(MockState {
                current,
                connected: true,
                dispatched: Vec::new(),
                dispatch_attempts: 0,
                captures: 0,
                typed: String::new(),
                failing_dispatches: 0,
                dispatch_error: None,
                failing_captures: 0,
                capture_error: None,
                dispatch_delay: Duration::ZERO,
            }),
        }
    }

    /// Register an additional screen
    pub fn screen(mut self, screen: MockScreen) -> Self {
        self.screens.insert(screen.name.clone(), screen);
        self
    }

    /// Tapping `element` on `from` switches to `to`
    pub fn on_tap(mut self, from: &str, element: &str, to: &str) -> Self {
        self.transitions
            .insert((from.to_string(), Trigger::Tap(element.to_string())), to.to_string());
        self
    }

    pub fn on_key(mut self, from: &str, key: KeyCode, to: &str) -> Self {
        self.transitions
            .insert((from.to_string(), Trigger::Key(key)), to.to_string());
        self
    }

    /// Any swipe on `from` switches to `to`
    pub fn on_swipe(mut self, from: &str, to: &str) -> Self {
        self.transitions
            .insert((from.to_string(), Trigger::Swipe), to.to_string());
        self
    }

    /// Any typed text on `from` switches to `to`
    pub fn on_text(mut self, from: &str, to: &str) -> Self {
        self.transitions
            .insert((from.to_string(), Trigger::Text), to.to_string());
        self
    }

    /// Make the next `count` dispatches fail with `error`
    pub fn fail_dispatches(&self, count: usize, error: BridgeError) {
        let mut state = self.state.lock();
        state.failing_dispatches = count;
        state.dispatch_error = Some(error);
    }

    /// Make the next `count` captures fail with `error`
    pub fn fail_captures(&self, count: usize, error: BridgeError) {
        let mut state = self.state.lock();
        state.failing_captures = count;
        state.capture_error = Some(error);
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Delay every dispatch by `delay` before it takes effect
    pub fn set_dispatch_delay(&self, delay: Duration) {
        self.state.lock().dispatch_delay = delay;
    }

    pub fn current_screen(&self) -> String {
        self.state.lock().current.clone()
    }

    /// Actions that took effect, in order
    pub fn dispatched(&self) -> Vec<PrimitiveAction> {
        self.state.lock().dispatched.clone()
    }

    /// Number of dispatch calls, including failed and interrupted ones
    pub fn dispatch_attempts(&self) -> usize {
        self.state.lock().dispatch_attempts
    }

    pub fn capture_count(&self) -> usize {
        self.state.lock().captures
    }

    /// Concatenation of all typed text
    pub fn typed_text(&self) -> String {
        self.state.lock().typed.clone()
    }

    fn current(&self, state: &MockState) -> BridgeResult<&MockScreen> {
        self.screens.get(&state.current).ok_or_else(|| {
            BridgeError::InvalidOutput(format!("unknown mock screen '{}'", state.current))
        })
    }

    fn trigger_for(&self, state: &MockState, action: &PrimitiveAction) -> Option<Trigger> {
        match action {
            PrimitiveAction::Tap { point } => {
                let screen = self.screens.get(&state.current)?;
                // Topmost element wins
                screen
                    .elements
                    .iter()
                    .rev()
                    .find(|e| e.interactive && e.bounds.contains(*point))
                    .map(|e| Trigger::Tap(e.id.clone()))
            }
            PrimitiveAction::Key { key } => Some(Trigger::Key(*key)),
            PrimitiveAction::Swipe { .. } => Some(Trigger::Swipe),
            PrimitiveAction::Text { .. } => Some(Trigger::Text),
        }
    }

    fn apply(&self, action: &PrimitiveAction) -> BridgeResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BridgeError::Unavailable(format!("{} disconnected", self.id)));
        }
        if state.failing_dispatches > 0 {
            state.failing_dispatches -= 1;
            let err = state
                .dispatch_error
                .clone()
                .unwrap_or_else(|| BridgeError::ActionFailed("injected failure".to_string()));
            return Err(err);
        }

        if let PrimitiveAction::Text { text } = action {
            state.typed.push_str(text);
        }
        let next = self
            .trigger_for(&state, action)
            .and_then(|t| self.transitions.get(&(state.current.clone(), t)))
            .cloned();
        if let Some(next) = next {
            tracing::trace!(device = %self.id, from = %state.current, to = %next, "mock screen transition");
            state.current = next;
        }
        state.dispatched.push(action.clone());
        Ok(())
    }
}

#[async_trait]
impl DeviceBridge for MockDevice {
    fn id(&self) -> &str {
        &self.id
    }

    async fn capture(&self) -> BridgeResult<ScreenCapture> {
        let fb = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(BridgeError::Unavailable(format!("{} disconnected", self.id)));
            }
            if state.failing_captures > 0 {
                state.failing_captures -= 1;
                return Err(state
                    .capture_error
                    .clone()
                    .unwrap_or_else(|| BridgeError::Unavailable("injected failure".to_string())));
            }
            state.captures += 1;
            self.current(&state)?.render()
        };
        Ok(ScreenCapture {
            image_data: fb.to_png()?,
            width: fb.width(),
            height: fb.height(),
        })
    }

    async fn list_elements(&self) -> BridgeResult<Vec<UiElement>> {
        let state = self.state.lock();
        if !state.connected {
            return Err(BridgeError::Unavailable(format!("{} disconnected", self.id)));
        }
        Ok(self.current(&state)?.elements.clone())
    }

    async fn dispatch(&self, action: &PrimitiveAction) -> BridgeResult<()> {
        let delay = {
            let mut state = self.state.lock();
            state.dispatch_attempts += 1;
            state.dispatch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.apply(action)
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Bounds, Point};

    fn login_device() -> MockDevice {
        let home = MockScreen::new("home", 200, 200).element(
            UiElement::new("login", Bounds::new(10, 10, 110, 50))
                .role("Button")
                .label("Login"),
        );
        let welcome = MockScreen::new("welcome", 200, 200).element(
            UiElement::new("greeting", Bounds::new(10, 10, 190, 50))
                .label("Welcome")
                .interactive(false),
        );
        MockDevice::new(home)
            .screen(welcome)
            .on_tap("home", "login", "welcome")
            .on_key("welcome", KeyCode::Back, "home")
    }

    #[test]
    fn test_framebuffer_draw_rect() {
        let mut fb = MockFramebuffer::new(20, 20);
        fb.draw_rect(5, 5, 10, 10, [255, 0, 0]);
        assert_eq!(fb.get_pixel(4, 4), [0, 0, 0]);
        assert_eq!(fb.get_pixel(5, 5), [255, 0, 0]);
        assert_eq!(fb.get_pixel(14, 14), [255, 0, 0]);
        assert_eq!(fb.get_pixel(15, 15), [0, 0, 0]);
    }

    #[test]
    fn test_framebuffer_draw_text() {
        let mut fb = MockFramebuffer::new(80, 16);
        fb.draw_text(0, 0, "Hi", [255, 255, 255], [0, 0, 0]);
        let lit = (0..8)
            .flat_map(|y| (0..8).map(move |x| (x, y)))
            .any(|(x, y)| fb.get_pixel(x, y) == [255, 255, 255]);
        assert!(lit, "glyph 'H' should have foreground pixels");
    }

    #[test]
    fn test_framebuffer_png_magic() {
        let fb = MockFramebuffer::with_color(50, 50, [128, 128, 128]);
        let png = fb.to_png().unwrap();
        assert_eq!(&png[0..4], &[0x89, 0x50, 0x4E, 0x47]);
    }

    #[tokio::test]
    async fn test_tap_transitions_screen() {
        let device = login_device();
        device
            .dispatch(&PrimitiveAction::Tap {
                point: Point::new(50, 30),
            })
            .await
            .unwrap();
        assert_eq!(device.current_screen(), "welcome");
        let elements = device.list_elements().await.unwrap();
        assert_eq!(elements[0].id, "greeting");
    }

    #[tokio::test]
    async fn test_tap_outside_element_stays() {
        let device = login_device();
        device
            .dispatch(&PrimitiveAction::Tap {
                point: Point::new(150, 150),
            })
            .await
            .unwrap();
        assert_eq!(device.current_screen(), "home");
        assert_eq!(device.dispatched().len(), 1);
    }

    #[tokio::test]
    async fn test_capture_differs_between_screens() {
        let device = login_device();
        let before = device.capture().await.unwrap();
        device
            .dispatch(&PrimitiveAction::Tap {
                point: Point::new(50, 30),
            })
            .await
            .unwrap();
        let after = device.capture().await.unwrap();
        assert_eq!((after.width, after.height), (200, 200));
        assert_ne!(before.image_data, after.image_data);
    }

    #[tokio::test]
    async fn test_injected_dispatch_failures() {
        let device = login_device();
        device.fail_dispatches(2, BridgeError::ActionFailed("rejected".into()));
        let tap = PrimitiveAction::Tap {
            point: Point::new(50, 30),
        };
        assert!(device.dispatch(&tap).await.is_err());
        assert!(device.dispatch(&tap).await.is_err());
        assert!(device.dispatch(&tap).await.is_ok());
        assert_eq!(device.dispatch_attempts(), 3);
        assert_eq!(device.dispatched().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_device() {
        let device = login_device();
        device.set_connected(false);
        assert!(!device.is_connected().await);
        let err = device.capture().await.unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_text_is_recorded() {
        let device = login_device();
        device
            .dispatch(&PrimitiveAction::Text {
                text: "hello".into(),
            })
            .await
            .unwrap();
        assert_eq!(device.typed_text(), "hello");
    }
}

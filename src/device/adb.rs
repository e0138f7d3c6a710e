//! Android bridge backed by the `adb` command line tool.
//!
//! Every call spawns `adb [-s serial] ...` with `kill_on_drop`, so a timed-out
//! or cancelled call never leaves a stray process behind.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::hierarchy::{extract_xml, parse_hierarchy};
use super::{DeviceBridge, KeyCode, PrimitiveAction, ScreenCapture, UiElement};
use crate::error::{BridgeError, BridgeResult};

/// A device as reported by `adb devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbDevice {
    pub serial: String,
    /// `device`, `offline`, `unauthorized`, ...
    pub state: String,
}

impl AdbDevice {
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb_path: PathBuf,
    serial: String,
    timeout: Duration,
}

impl AdbBridge {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            serial: serial.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn adb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.adb_path = path.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Enumerate attached devices
    pub async fn list_devices(adb_path: &std::path::Path, wait: Duration) -> BridgeResult<Vec<AdbDevice>> {
        let output = run(adb_path, None, &["devices"], wait).await?;
        if !output.status.success() {
            return Err(BridgeError::Unavailable(stderr_of(&output)));
        }
        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn adb(&self, args: &[&str]) -> BridgeResult<Output> {
        run(&self.adb_path, Some(&self.serial), args, self.timeout).await
    }

    async fn shell(&self, args: &[&str]) -> BridgeResult<()> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let output = self.adb(&full).await?;
        if !output.status.success() {
            let message = stderr_of(&output);
            if is_offline(&message) {
                return Err(BridgeError::Unavailable(message));
            }
            return Err(BridgeError::ActionFailed(message));
        }
        Ok(())
    }
}

async fn run(
    adb_path: &std::path::Path,
    serial: Option<&str>,
    args: &[&str],
    wait: Duration,
) -> BridgeResult<Output> {
    let mut cmd = Command::new(adb_path);
    if let Some(serial) = serial {
        cmd.arg("-s").arg(serial);
    }
    cmd.args(args).kill_on_drop(true);
    tracing::trace!(?args, serial = serial.unwrap_or("-"), "adb");

    match timeout(wait, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(BridgeError::Unavailable(format!(
            "failed to run {}: {}",
            adb_path.display(),
            e
        ))),
        Err(_) => Err(BridgeError::Timeout(wait)),
    }
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("adb exited with {}", output.status)
    } else {
        stderr
    }
}

fn is_offline(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found") || lower.contains("offline") || lower.contains("no devices")
}

/// Parse `adb devices` output
pub(crate) fn parse_devices(output: &str) -> Vec<AdbDevice> {
    output
        .lines()
        .skip_while(|l| !l.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(AdbDevice {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// Escape text for `input text`: spaces become `%s`, shell metacharacters are
/// backslash-escaped.
pub(crate) fn escape_input_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        match ch {
            ' ' => escaped.push_str("%s"),
            '\\' | '"' | '\'' | '`' | '$' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '*'
            | '?' | '~' | '#' | '!' | '[' | ']' | '{' | '}' | '%' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn keyevent_name(key: KeyCode) -> &'static str {
    match key {
        KeyCode::Back => "KEYCODE_BACK",
        KeyCode::Home => "KEYCODE_HOME",
        KeyCode::Enter => "KEYCODE_ENTER",
        KeyCode::Menu => "KEYCODE_MENU",
        KeyCode::Recent => "KEYCODE_APP_SWITCH",
        KeyCode::Search => "KEYCODE_SEARCH",
        KeyCode::VolumeUp => "KEYCODE_VOLUME_UP",
        KeyCode::VolumeDown => "KEYCODE_VOLUME_DOWN",
        KeyCode::Power => "KEYCODE_POWER",
        KeyCode::Tab => "KEYCODE_TAB",
        KeyCode::Delete => "KEYCODE_DEL",
        KeyCode::Up => "KEYCODE_DPAD_UP",
        KeyCode::Down => "KEYCODE_DPAD_DOWN",
        KeyCode::Left => "KEYCODE_DPAD_LEFT",
        KeyCode::Right => "KEYCODE_DPAD_RIGHT",
        KeyCode::Center => "KEYCODE_DPAD_CENTER",
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    fn id(&self) -> &str {
        &self.serial
    }

    async fn capture(&self) -> BridgeResult<ScreenCapture> {
        let output = self.adb(&["exec-out", "screencap", "-p"]).await?;
        if !output.status.success() {
            return Err(BridgeError::Unavailable(stderr_of(&output)));
        }
        let image_data = output.stdout;
        let (width, height) = image::io::Reader::new(std::io::Cursor::new(&image_data))
            .with_guessed_format()
            .map_err(|e| BridgeError::InvalidOutput(e.to_string()))?
            .into_dimensions()
            .map_err(|e| BridgeError::InvalidOutput(format!("screencap is not an image: {}", e)))?;
        Ok(ScreenCapture {
            image_data,
            width,
            height,
        })
    }

    async fn list_elements(&self) -> BridgeResult<Vec<UiElement>> {
        let output = self
            .adb(&["exec-out", "uiautomator", "dump", "/dev/tty"])
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let xml = extract_xml(&text).ok_or_else(|| {
            BridgeError::InvalidOutput(format!(
                "no hierarchy in uiautomator output: {}",
                text.trim()
            ))
        })?;
        parse_hierarchy(xml)
    }

    async fn dispatch(&self, action: &PrimitiveAction) -> BridgeResult<()> {
        tracing::debug!(serial = %self.serial, %action, "dispatch");
        match action {
            PrimitiveAction::Tap { point } => {
                self.shell(&["input", "tap", &point.x.to_string(), &point.y.to_string()])
                    .await
            }
            PrimitiveAction::Swipe { from, to, duration } => {
                self.shell(&[
                    "input",
                    "swipe",
                    &from.x.to_string(),
                    &from.y.to_string(),
                    &to.x.to_string(),
                    &to.y.to_string(),
                    &duration.as_millis().to_string(),
                ])
                .await
            }
            PrimitiveAction::Text { text } => {
                self.shell(&["input", "text", &escape_input_text(text)]).await
            }
            PrimitiveAction::Key { key } => {
                self.shell(&["input", "keyevent", keyevent_name(*key)]).await
            }
        }
    }

    async fn is_connected(&self) -> bool {
        match self.adb(&["get-state"]).await {
            Ok(output) => {
                output.status.success()
                    && String::from_utf8_lossy(&output.stdout).trim() == "device"
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        let output = "* daemon started successfully\nList of devices attached\nemulator-5554\tdevice\nR58M12345\toffline\n\n";
        let devices = parse_devices(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert!(devices[0].is_online());
        assert!(!devices[1].is_online());
    }

    #[test]
    fn test_parse_devices_empty() {
        assert!(parse_devices("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn test_escape_input_text() {
        assert_eq!(escape_input_text("hello world"), "hello%sworld");
        assert_eq!(escape_input_text("a&b"), "a\\&b");
        assert_eq!(escape_input_text("it's"), "it\\'s");
        assert_eq!(escape_input_text("50%"), "50\\%");
    }

    #[test]
    fn test_keyevent_names() {
        assert_eq!(keyevent_name(KeyCode::Recent), "KEYCODE_APP_SWITCH");
        assert_eq!(keyevent_name(KeyCode::Delete), "KEYCODE_DEL");
    }

    #[tokio::test]
    async fn test_missing_adb_is_unavailable() {
        let bridge = AdbBridge::new("emulator-5554")
            .adb_path("/nonexistent/adb-binary")
            .timeout(Duration::from_secs(2));
        let err = bridge.capture().await.unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable(_)));
        assert!(!bridge.is_connected().await);
    }
}

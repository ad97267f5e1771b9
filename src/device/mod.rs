//! DeviceClient (§4.5): a narrow, typed surface over the remote automation
//! session. `AdbDeviceClient` is the concrete realization used when the
//! configured transport is plain ADB; a WebDriver/Appium-backed client would
//! implement the same trait.

pub mod fingerprint;

use crate::errors::CrawlError;
use async_trait::async_trait;
use serde::Serialize;
use std::process::Command;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// §4.5 session state machine: `UNINITIALIZED → CONNECTED → (RUNNING ↔
/// RECOVERING) → CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized,
    Connected,
    Running,
    Recovering,
    Closed,
}

/// Result of a screenshot capture: either the PNG bytes, or the `BLOCKED`
/// sentinel when the device has set a secure-screen flag (glossary: "Blocked
/// screenshot").
#[derive(Debug, Clone)]
pub enum ScreenshotResult {
    Bytes(Vec<u8>),
    Blocked,
}

#[derive(Debug, Clone, Copy)]
pub enum ScrollDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
pub enum SwipeDirection {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy)]
pub enum FlickDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Where a tap/gesture should land. Priority order per §4.5's `tap` row is
/// coords > bbox > id; callers build this from whichever fields the action
/// batch actually supplied.
#[derive(Debug, Clone)]
pub enum Target {
    Coords { x: i32, y: i32 },
    BoundingBox(crate::types::BoundingBox),
    Identifier(String),
}

impl Target {
    fn resolve_point(&self) -> Option<(i32, i32)> {
        match self {
            Target::Coords { x, y } => Some((*x, *y)),
            Target::BoundingBox(bbox) => Some(bbox.center()),
            Target::Identifier(_) => None,
        }
    }
}

#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn initialize_session(&self, target_package: &str, device_id: Option<&str>) -> Result<bool, CrawlError>;
    async fn validate_session(&self) -> bool;
    async fn get_screenshot_bytes(&self) -> Result<ScreenshotResult, CrawlError>;
    async fn get_ui_tree(&self) -> Result<String, CrawlError>;
    async fn get_current_package(&self) -> Option<String>;
    async fn get_current_activity(&self) -> Option<String>;

    async fn tap(&self, target: &Target) -> bool;
    async fn input_text(&self, target: &Target, text: &str) -> bool;
    async fn long_press(&self, target: &Target, duration_ms: u64) -> bool;
    async fn double_tap(&self, target: &Target) -> bool;
    async fn clear_text(&self, identifier: &str) -> bool;
    async fn replace_text(&self, target: &Target, text: &str) -> bool;
    async fn scroll(&self, dir: ScrollDirection) -> bool;
    async fn swipe(&self, dir: SwipeDirection) -> bool;
    async fn flick(&self, dir: FlickDirection) -> bool;
    async fn press_back(&self) -> bool;
    async fn reset_app(&self) -> bool;

    async fn terminate_app(&self, package: &str) -> bool;
    async fn launch_app(&self, package: &str) -> bool;
    async fn start_activity(&self, package: &str, activity: &str, wait: bool) -> bool;

    async fn session_state(&self) -> SessionState;
}

/// ADB-transport `DeviceClient`. Generalizes the perception engine's polling
/// commands and the action executor's `adb()` shell wrapper into the single
/// typed surface the rest of the core depends on.
pub struct AdbDeviceClient {
    adb_device: Option<String>,
    target_package: Arc<Mutex<Option<String>>>,
    state: Arc<Mutex<SessionState>>,
    max_retries: u32,
}

const DUMP_PATH: &str = "/sdcard/hermitcrawl_ui_dump.xml";
const MIN_SCREENSHOT_BYTES: usize = 200;

impl AdbDeviceClient {
    pub fn new(adb_device: Option<String>, max_retries: u32) -> Self {
        Self {
            adb_device,
            target_package: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(SessionState::Uninitialized)),
            max_retries,
        }
    }

    fn adb(&self, args: &[&str]) -> anyhow::Result<String> {
        let mut cmd = Command::new("adb");
        if let Some(dev) = &self.adb_device {
            cmd.args(["-s", dev]);
        }
        cmd.args(args);
        let out = cmd.output()?;
        let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        if out.status.success() {
            Ok(stdout)
        } else if !stdout.is_empty() {
            warn!("adb warning: {}", stderr);
            Ok(stdout)
        } else {
            anyhow::bail!("adb error: {}", if stderr.is_empty() { "unknown error".into() } else { stderr })
        }
    }

    fn adb_bytes(&self, args: &[&str]) -> anyhow::Result<Vec<u8>> {
        let mut cmd = Command::new("adb");
        if let Some(dev) = &self.adb_device {
            cmd.args(["-s", dev]);
        }
        cmd.args(args);
        let out = cmd.output()?;
        if !out.status.success() {
            anyhow::bail!("adb error capturing bytes");
        }
        Ok(out.stdout)
    }

    /// Wait until the foreground activity changes or `max_ms` elapses,
    /// whichever comes first.
    async fn wait_for_settle(&self, max_ms: u64) {
        let before = self.current_resumed_line();
        let interval = 50u64;
        let checks = (max_ms / interval).max(1);
        for _ in 0..checks {
            tokio::time::sleep(tokio::time::Duration::from_millis(interval)).await;
            if self.current_resumed_line() != before {
                debug!("screen settled");
                return;
            }
        }
    }

    fn current_resumed_line(&self) -> String {
        self.adb(&["shell", "dumpsys", "activity", "activities"])
            .ok()
            .and_then(|raw| {
                raw.lines()
                    .find(|l| l.contains("mResumedActivity:") || l.contains("topResumedActivity:"))
                    .map(|l| l.to_string())
            })
            .unwrap_or_default()
    }

    async fn try_reinitialize(&self) -> bool {
        *self.state.lock().await = SessionState::Recovering;
        let pkg = self.target_package.lock().await.clone();
        for attempt in 1..=self.max_retries {
            debug!("recovery attempt {}/{}", attempt, self.max_retries);
            if let Ok(out) = self.adb(&["get-state"]) {
                if out.trim() == "device" {
                    *self.state.lock().await = SessionState::Running;
                    if let Some(pkg) = &pkg {
                        let _ = self.launch_app(pkg).await;
                    }
                    return true;
                }
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        }
        *self.state.lock().await = SessionState::Closed;
        false
    }

    fn escape_for_input_text(text: &str) -> String {
        text.replace('\\', "\\\\")
            .replace(' ', "%s")
            .replace('&', "\\&")
            .replace('<', "\\<")
            .replace('>', "\\>")
            .replace('|', "\\|")
            .replace(';', "\\;")
            .replace('(', "\\(")
            .replace(')', "\\)")
            .replace('\'', "\\'")
            .replace('"', "\\\"")
            .replace('$', "\\$")
            .replace('`', "\\`")
    }

    /// Three ordered typing methods per §4.11 `input`: primary `input text`,
    /// then clipboard broadcast, then a key-event fallback for short strings.
    fn type_text_ladder(&self, text: &str) -> bool {
        let escaped = Self::escape_for_input_text(text);
        if self.adb(&["shell", "input", "text", &escaped]).is_ok() {
            return true;
        }
        if self
            .adb(&["shell", "am", "broadcast", "-a", "ADB_INPUT_TEXT", "--es", "msg", text])
            .is_ok()
        {
            return true;
        }
        for ch in text.chars().take(64) {
            let keyevent = match ch {
                'a'..='z' | 'A'..='Z' | '0'..='9' => format!("KEYCODE_{}", ch.to_ascii_uppercase()),
                ' ' => "KEYCODE_SPACE".to_string(),
                _ => continue,
            };
            if self.adb(&["shell", "input", "keyevent", &keyevent]).is_err() {
                return false;
            }
        }
        true
    }

    async fn tap_point(&self, target: &Target) -> bool {
        let point = match target.resolve_point() {
            Some(p) => p,
            None => match target {
                Target::Identifier(_id) => {
                    // Identifier-only targets require a UI-tree lookup the
                    // caller (ActionExecutor) is expected to have already
                    // resolved into coordinates; nothing more we can do here.
                    return false;
                }
                _ => return false,
            },
        };
        let ok = self
            .adb(&["shell", "input", "tap", &point.0.to_string(), &point.1.to_string()])
            .is_ok();
        self.wait_for_settle(200).await;
        ok
    }
}

#[async_trait]
impl DeviceClient for AdbDeviceClient {
    async fn initialize_session(&self, target_package: &str, device_id: Option<&str>) -> Result<bool, CrawlError> {
        if let Some(id) = device_id {
            debug!("device id override requested: {id} (auto-detect still used by the adb -s flag at construction)");
        }
        match self.adb(&["get-state"]) {
            Ok(out) if out.trim() == "device" => {
                *self.target_package.lock().await = Some(target_package.to_string());
                *self.state.lock().await = SessionState::Connected;
                Ok(true)
            }
            _ => Err(CrawlError::Session("no device reachable via adb get-state".into())),
        }
    }

    async fn validate_session(&self) -> bool {
        let probe_ok = self.adb(&["shell", "echo", "ok"]).map(|s| s.trim() == "ok").unwrap_or(false);
        if probe_ok {
            let mut st = self.state.lock().await;
            if *st == SessionState::Connected {
                *st = SessionState::Running;
            }
            true
        } else {
            drop(self.state.lock().await);
            self.try_reinitialize().await
        }
    }

    async fn get_screenshot_bytes(&self) -> Result<ScreenshotResult, CrawlError> {
        match self.adb_bytes(&["exec-out", "screencap", "-p"]) {
            Ok(bytes) if bytes.len() >= MIN_SCREENSHOT_BYTES => Ok(ScreenshotResult::Bytes(bytes)),
            Ok(_) => Ok(ScreenshotResult::Blocked),
            Err(e) => Err(CrawlError::Session(format!("screenshot capture failed: {e}"))),
        }
    }

    async fn get_ui_tree(&self) -> Result<String, CrawlError> {
        self.adb(&["shell", "uiautomator", "dump", DUMP_PATH])
            .map_err(|e| CrawlError::Session(format!("uiautomator dump failed: {e}")))?;
        let xml = self
            .adb(&["shell", "cat", DUMP_PATH])
            .map_err(|e| CrawlError::Session(format!("reading ui dump failed: {e}")))?;
        if xml.contains("<hierarchy") && xml.contains("<node") {
            Ok(xml)
        } else {
            Err(CrawlError::Session("ui dump did not contain a valid tree".into()))
        }
    }

    async fn get_current_package(&self) -> Option<String> {
        self.adb(&["shell", "dumpsys", "window"])
            .ok()
            .and_then(|raw| parse_current_package(&raw))
    }

    async fn get_current_activity(&self) -> Option<String> {
        self.adb(&["shell", "dumpsys", "activity", "activities"])
            .ok()
            .and_then(|raw| parse_current_activity(&raw))
    }

    async fn tap(&self, target: &Target) -> bool {
        self.tap_point(target).await
    }

    async fn input_text(&self, target: &Target, text: &str) -> bool {
        if !self.tap_point(target).await {
            return false;
        }
        self.wait_for_settle(150).await;
        if text.is_empty() {
            return true;
        }
        self.type_text_ladder(text)
    }

    async fn long_press(&self, target: &Target, duration_ms: u64) -> bool {
        let Some((x, y)) = target.resolve_point() else { return false };
        self.adb(&[
            "shell", "input", "swipe",
            &x.to_string(), &y.to_string(), &x.to_string(), &y.to_string(),
            &duration_ms.to_string(),
        ])
        .is_ok()
    }

    async fn double_tap(&self, target: &Target) -> bool {
        let first = self.tap_point(target).await;
        tokio::time::sleep(tokio::time::Duration::from_millis(80)).await;
        let second = self.tap_point(target).await;
        first && second
    }

    async fn clear_text(&self, identifier: &str) -> bool {
        if identifier.is_empty() {
            return false;
        }
        self.adb(&["shell", "input", "keyevent", "--longpress", "KEYCODE_DEL"]).is_ok()
    }

    async fn replace_text(&self, target: &Target, text: &str) -> bool {
        if !self.tap_point(target).await {
            return false;
        }
        // select-all then delete
        let _ = self.adb(&["shell", "input", "keyevent", "KEYCODE_CTRL_LEFT", "KEYCODE_A"]);
        let _ = self.adb(&["shell", "input", "keyevent", "--longpress", "KEYCODE_DEL"]);
        self.type_text_ladder(text)
    }

    async fn scroll(&self, dir: ScrollDirection) -> bool {
        match dir {
            ScrollDirection::Down => self
                .adb(&["shell", "input", "swipe", "540", "1500", "540", "500", "300"])
                .is_ok(),
            ScrollDirection::Up => self
                .adb(&["shell", "input", "swipe", "540", "500", "540", "1500", "300"])
                .is_ok(),
        }
    }

    async fn swipe(&self, dir: SwipeDirection) -> bool {
        match dir {
            SwipeDirection::Left => self
                .adb(&["shell", "input", "swipe", "900", "1200", "200", "1200", "300"])
                .is_ok(),
            SwipeDirection::Right => self
                .adb(&["shell", "input", "swipe", "200", "1200", "900", "1200", "300"])
                .is_ok(),
        }
    }

    async fn flick(&self, dir: FlickDirection) -> bool {
        let args = match dir {
            FlickDirection::Up => ["540", "1700", "540", "300", "120"],
            FlickDirection::Down => ["540", "300", "540", "1700", "120"],
            FlickDirection::Left => ["900", "1200", "100", "1200", "120"],
            FlickDirection::Right => ["100", "1200", "900", "1200", "120"],
        };
        self.adb(&["shell", "input", "swipe", args[0], args[1], args[2], args[3], args[4]]).is_ok()
    }

    async fn press_back(&self) -> bool {
        let ok = self.adb(&["shell", "input", "keyevent", "KEYCODE_BACK"]).is_ok();
        self.wait_for_settle(200).await;
        ok
    }

    async fn reset_app(&self) -> bool {
        let pkg = self.target_package.lock().await.clone();
        match pkg {
            Some(pkg) => self.terminate_app(&pkg).await && self.launch_app(&pkg).await,
            None => false,
        }
    }

    async fn terminate_app(&self, package: &str) -> bool {
        self.adb(&["shell", "am", "force-stop", package]).is_ok()
    }

    async fn launch_app(&self, package: &str) -> bool {
        let ok = self
            .adb(&["shell", "monkey", "-p", package, "-c", "android.intent.category.LAUNCHER", "1"])
            .is_ok();
        self.wait_for_settle(800).await;
        ok
    }

    async fn start_activity(&self, package: &str, activity: &str, wait: bool) -> bool {
        let component = format!("{package}/{activity}");
        let ok = self.adb(&["shell", "am", "start", "-n", &component]).is_ok();
        if wait {
            self.wait_for_settle(800).await;
        }
        ok
    }

    async fn session_state(&self) -> SessionState {
        *self.state.lock().await
    }
}

fn parse_current_package(dumpsys_window: &str) -> Option<String> {
    let line = dumpsys_window
        .lines()
        .find(|l| l.contains("mCurrentFocus") || l.contains("mFocusedApp"))?;
    let token = line.split_whitespace().find(|tok| tok.contains('/'))?;
    let trimmed = token.trim_end_matches('}');
    trimmed.split('/').next().map(|s| s.to_string()).filter(|s| !s.is_empty())
}

fn parse_current_activity(dumpsys_activities: &str) -> Option<String> {
    dumpsys_activities
        .lines()
        .find(|l| l.contains("mResumedActivity:") || l.contains("topResumedActivity:"))
        .and_then(|l| l.split_whitespace().find(|tok| tok.contains('/')))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_resolve_point_prefers_coords() {
        let t = Target::Coords { x: 10, y: 20 };
        assert_eq!(t.resolve_point(), Some((10, 20)));
    }

    #[test]
    fn target_resolve_point_from_bbox_is_center() {
        let bbox = crate::types::BoundingBox { top_left: [0.0, 0.0], bottom_right: [100.0, 50.0] };
        let t = Target::BoundingBox(bbox);
        assert_eq!(t.resolve_point(), Some((50, 25)));
    }

    #[test]
    fn target_resolve_point_identifier_has_none() {
        let t = Target::Identifier("login_btn".into());
        assert_eq!(t.resolve_point(), None);
    }

    #[test]
    fn parse_current_package_extracts_name() {
        let sample = "  mCurrentFocus=Window{abc u0 com.example.app/com.example.app.MainActivity}";
        assert_eq!(parse_current_package(sample).as_deref(), Some("com.example.app"));
    }

    #[test]
    fn escape_for_input_text_handles_spaces_and_quotes() {
        let escaped = AdbDeviceClient::escape_for_input_text("hello world's \"test\"");
        assert!(escaped.contains("%s"));
        assert!(!escaped.contains(' '));
    }
}

//! ActionExecutor (§4.11): turns a validated `ActionBatch` into device calls,
//! one action at a time, through the `DeviceClient` trait object.
//!
//! Generic `scroll`/`swipe` kinds (accepted on the wire for LLM convenience)
//! are normalized to a concrete direction using a text heuristic over the
//! action's reasoning and description before dispatch.

use crate::device::{DeviceClient, FlickDirection, ScrollDirection, SwipeDirection, Target};
use crate::types::{Action, ActionKind, ActionOutcome};
use std::time::Duration;
use tracing::{debug, warn};

/// Coarse duration used for `long_press` when the model didn't supply one.
const DEFAULT_LONG_PRESS_MS: u64 = 600;

pub struct ActionExecutor;

impl ActionExecutor {
    /// Executes `actions` in order against `device`, sleeping
    /// `wait_between_actions` after each successful action. Stops early if
    /// `stop_on_error` is set and an action fails. Returns the number of
    /// actions attempted, the per-action outcomes, and an overall batch
    /// error if execution stopped early.
    pub async fn execute_batch(
        device: &dyn DeviceClient,
        actions: &[Action],
        wait_between_actions: Duration,
        stop_on_error: bool,
    ) -> (usize, Vec<ActionOutcome>, Option<String>) {
        let mut outcomes = Vec::with_capacity(actions.len());
        let mut batch_error = None;

        for action in actions {
            let outcome = Self::execute_one(device, action).await;
            let failed = !outcome.success;
            if failed {
                warn!("action {} failed: {:?}", action.action.as_str(), outcome.error);
            }
            outcomes.push(outcome);

            if failed && stop_on_error {
                batch_error = Some(format!(
                    "batch aborted after action {} of {} failed",
                    outcomes.len(),
                    actions.len()
                ));
                break;
            }
            if !failed {
                tokio::time::sleep(wait_between_actions).await;
            }
        }

        (outcomes.len(), outcomes, batch_error)
    }

    async fn execute_one(device: &dyn DeviceClient, action: &Action) -> ActionOutcome {
        debug!("executing {}: {}", action.action.as_str(), action.reasoning);
        match action.action {
            ActionKind::Click => match build_target(action) {
                Some(target) => from_bool(device.tap(&target).await, "tap failed"),
                None => ActionOutcome::fail("click requires target_identifier or target_bounding_box"),
            },
            ActionKind::Input => {
                let Some(text) = action.input_text.as_deref() else {
                    return ActionOutcome::fail("input requires input_text");
                };
                match build_target(action) {
                    Some(target) => from_bool(device.input_text(&target, text).await, "input failed"),
                    None => ActionOutcome::fail("input requires target_identifier or target_bounding_box"),
                }
            }
            ActionKind::LongPress => match build_target(action) {
                Some(target) => {
                    let duration = action.duration_ms.unwrap_or(DEFAULT_LONG_PRESS_MS);
                    from_bool(device.long_press(&target, duration).await, "long press failed")
                }
                None => ActionOutcome::fail("long_press requires target_identifier or target_bounding_box"),
            },
            ActionKind::DoubleTap => match build_target(action) {
                Some(target) => from_bool(device.double_tap(&target).await, "double tap failed"),
                None => ActionOutcome::fail("double_tap requires target_identifier or target_bounding_box"),
            },
            ActionKind::ClearText => {
                let Some(identifier) = action.target_identifier.as_deref() else {
                    return ActionOutcome::fail("clear_text requires target_identifier");
                };
                from_bool(device.clear_text(identifier).await, "clear text failed")
            }
            ActionKind::ReplaceText => {
                let Some(text) = action.input_text.as_deref() else {
                    return ActionOutcome::fail("replace_text requires input_text");
                };
                match build_target(action) {
                    Some(target) => from_bool(device.replace_text(&target, text).await, "replace text failed"),
                    None => ActionOutcome::fail("replace_text requires target_identifier or target_bounding_box"),
                }
            }
            ActionKind::ScrollUp => from_bool(device.scroll(ScrollDirection::Up).await, "scroll up failed"),
            ActionKind::ScrollDown => from_bool(device.scroll(ScrollDirection::Down).await, "scroll down failed"),
            ActionKind::ScrollGeneric => {
                let dir = infer_scroll_direction(action);
                from_bool(device.scroll(dir).await, "scroll failed")
            }
            ActionKind::SwipeLeft => from_bool(device.swipe(SwipeDirection::Left).await, "swipe left failed"),
            ActionKind::SwipeRight => from_bool(device.swipe(SwipeDirection::Right).await, "swipe right failed"),
            ActionKind::SwipeGeneric => {
                let dir = infer_swipe_direction(action);
                from_bool(device.swipe(dir).await, "swipe failed")
            }
            ActionKind::Flick => {
                let dir = infer_flick_direction(action);
                from_bool(device.flick(dir).await, "flick failed")
            }
            ActionKind::Back => from_bool(device.press_back().await, "back failed"),
            ActionKind::ResetApp => from_bool(device.reset_app().await, "reset app failed"),
        }
    }
}

fn from_bool(ok: bool, failure_reason: &str) -> ActionOutcome {
    if ok {
        ActionOutcome::ok()
    } else {
        ActionOutcome::fail(failure_reason)
    }
}

/// Target priority is bounding box over identifier (§4.5): a resolved
/// bounding box is a concrete on-screen location, while an identifier needs a
/// downstream lookup the device client cannot perform on its own.
fn build_target(action: &Action) -> Option<Target> {
    if let Some(bbox) = action.target_bounding_box {
        return Some(Target::BoundingBox(bbox));
    }
    action.target_identifier.clone().map(Target::Identifier)
}

fn direction_text(action: &Action) -> String {
    format!(
        "{} {}",
        action.reasoning,
        action.action_desc.as_deref().unwrap_or("")
    )
    .to_lowercase()
}

fn infer_scroll_direction(action: &Action) -> ScrollDirection {
    let text = direction_text(action);
    if text.contains("up") && !text.contains("down") {
        ScrollDirection::Up
    } else {
        ScrollDirection::Down
    }
}

fn infer_swipe_direction(action: &Action) -> SwipeDirection {
    let text = direction_text(action);
    if text.contains("right") && !text.contains("left") {
        SwipeDirection::Right
    } else {
        SwipeDirection::Left
    }
}

fn infer_flick_direction(action: &Action) -> FlickDirection {
    let text = direction_text(action);
    if text.contains("up") {
        FlickDirection::Up
    } else if text.contains("left") {
        FlickDirection::Left
    } else if text.contains("right") {
        FlickDirection::Right
    } else {
        FlickDirection::Down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ScreenshotResult, SessionState};
    use crate::errors::CrawlError;
    use crate::types::BoundingBox;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDevice {
        taps: AtomicUsize,
        scrolls: Mutex<Vec<&'static str>>,
        swipes: Mutex<Vec<&'static str>>,
        fail_next: Mutex<bool>,
    }

    #[async_trait]
    impl DeviceClient for FakeDevice {
        async fn initialize_session(&self, _p: &str, _d: Option<&str>) -> Result<bool, CrawlError> { Ok(true) }
        async fn validate_session(&self) -> bool { true }
        async fn get_screenshot_bytes(&self) -> Result<ScreenshotResult, CrawlError> { Ok(ScreenshotResult::Blocked) }
        async fn get_ui_tree(&self) -> Result<String, CrawlError> { Ok(String::new()) }
        async fn get_current_package(&self) -> Option<String> { None }
        async fn get_current_activity(&self) -> Option<String> { None }
        async fn tap(&self, _t: &Target) -> bool {
            self.taps.fetch_add(1, Ordering::SeqCst);
            !*self.fail_next.lock().unwrap()
        }
        async fn input_text(&self, _t: &Target, _text: &str) -> bool { true }
        async fn long_press(&self, _t: &Target, _d: u64) -> bool { true }
        async fn double_tap(&self, _t: &Target) -> bool { true }
        async fn clear_text(&self, _id: &str) -> bool { true }
        async fn replace_text(&self, _t: &Target, _text: &str) -> bool { true }
        async fn scroll(&self, dir: ScrollDirection) -> bool {
            self.scrolls.lock().unwrap().push(if matches!(dir, ScrollDirection::Up) { "up" } else { "down" });
            true
        }
        async fn swipe(&self, dir: SwipeDirection) -> bool {
            self.swipes.lock().unwrap().push(if matches!(dir, SwipeDirection::Left) { "left" } else { "right" });
            true
        }
        async fn flick(&self, _dir: FlickDirection) -> bool { true }
        async fn press_back(&self) -> bool { true }
        async fn reset_app(&self) -> bool { true }
        async fn terminate_app(&self, _p: &str) -> bool { true }
        async fn launch_app(&self, _p: &str) -> bool { true }
        async fn start_activity(&self, _p: &str, _a: &str, _w: bool) -> bool { true }
        async fn session_state(&self) -> SessionState { SessionState::Running }
    }

    fn click_action(id: &str) -> Action {
        Action {
            action: ActionKind::Click,
            action_desc: None,
            target_identifier: Some(id.to_string()),
            target_bounding_box: None,
            input_text: None,
            duration_ms: None,
            reasoning: "tap it".into(),
        }
    }

    #[tokio::test]
    async fn executes_all_actions_when_no_failures() {
        let device = FakeDevice::default();
        let actions = vec![click_action("a"), click_action("b")];
        let (count, outcomes, err) = ActionExecutor::execute_batch(&device, &actions, Duration::from_millis(0), false).await;
        assert_eq!(count, 2);
        assert!(outcomes.iter().all(|o| o.success));
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn stops_on_first_failure_when_configured() {
        let device = FakeDevice::default();
        *device.fail_next.lock().unwrap() = true;
        let actions = vec![click_action("a"), click_action("b")];
        let (count, outcomes, err) = ActionExecutor::execute_batch(&device, &actions, Duration::from_millis(0), true).await;
        assert_eq!(count, 1);
        assert!(!outcomes[0].success);
        assert!(err.is_some());
    }

    #[tokio::test]
    async fn continues_past_failure_when_not_configured() {
        let device = FakeDevice::default();
        *device.fail_next.lock().unwrap() = true;
        let actions = vec![click_action("a"), click_action("b")];
        let (count, outcomes, err) = ActionExecutor::execute_batch(&device, &actions, Duration::from_millis(0), false).await;
        assert_eq!(count, 2);
        assert!(!outcomes[0].success);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn click_without_target_fails_without_touching_device() {
        let device = FakeDevice::default();
        let action = Action {
            action: ActionKind::Click,
            action_desc: None,
            target_identifier: None,
            target_bounding_box: None,
            input_text: None,
            duration_ms: None,
            reasoning: "tap nothing".into(),
        };
        let (_count, outcomes, _err) = ActionExecutor::execute_batch(&device, &[action], Duration::from_millis(0), false).await;
        assert!(!outcomes[0].success);
        assert_eq!(device.taps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bounding_box_beats_identifier_for_target_priority() {
        let action = Action {
            action: ActionKind::Click,
            action_desc: None,
            target_identifier: Some("login_btn".into()),
            target_bounding_box: Some(BoundingBox { top_left: [0.0, 0.0], bottom_right: [10.0, 10.0] }),
            input_text: None,
            duration_ms: None,
            reasoning: "tap".into(),
        };
        assert!(matches!(build_target(&action), Some(Target::BoundingBox(_))));
    }

    #[test]
    fn generic_scroll_defaults_to_down() {
        let action = Action {
            action: ActionKind::ScrollGeneric,
            action_desc: None,
            target_identifier: None,
            target_bounding_box: None,
            input_text: None,
            duration_ms: None,
            reasoning: "scroll to see more content".into(),
        };
        assert!(matches!(infer_scroll_direction(&action), ScrollDirection::Down));
    }

    #[test]
    fn generic_scroll_infers_up_from_reasoning() {
        let action = Action {
            action: ActionKind::ScrollGeneric,
            action_desc: None,
            target_identifier: None,
            target_bounding_box: None,
            input_text: None,
            duration_ms: None,
            reasoning: "scroll up to see the header".into(),
        };
        assert!(matches!(infer_scroll_direction(&action), ScrollDirection::Up));
    }
}

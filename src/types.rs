//! Shared domain types: the closed sum type for action kinds (§9 design
//! note: "Dynamic JSON from the LLM → tagged variants"), the wire shapes the
//! LLM emits, and the normalized in-memory `ActionBatch`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Input,
    LongPress,
    DoubleTap,
    ClearText,
    ReplaceText,
    ScrollUp,
    ScrollDown,
    SwipeLeft,
    SwipeRight,
    Flick,
    Back,
    ResetApp,
    /// Accepted on the wire as a generic `scroll`/`swipe`; normalized by the
    /// executor to a concrete direction using a text heuristic (§4.11).
    #[serde(rename = "scroll")]
    ScrollGeneric,
    #[serde(rename = "swipe")]
    SwipeGeneric,
}

impl ActionKind {
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            ActionKind::ScrollUp
                | ActionKind::ScrollDown
                | ActionKind::ScrollGeneric
                | ActionKind::SwipeLeft
                | ActionKind::SwipeRight
                | ActionKind::SwipeGeneric
                | ActionKind::Back
                | ActionKind::ResetApp
                | ActionKind::Flick
        )
    }

    pub fn requires_input_text(&self) -> bool {
        matches!(self, ActionKind::Input | ActionKind::ReplaceText)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Input => "input",
            ActionKind::LongPress => "long_press",
            ActionKind::DoubleTap => "double_tap",
            ActionKind::ClearText => "clear_text",
            ActionKind::ReplaceText => "replace_text",
            ActionKind::ScrollUp => "scroll_up",
            ActionKind::ScrollDown => "scroll_down",
            ActionKind::SwipeLeft => "swipe_left",
            ActionKind::SwipeRight => "swipe_right",
            ActionKind::Flick => "flick",
            ActionKind::Back => "back",
            ActionKind::ResetApp => "reset_app",
            ActionKind::ScrollGeneric => "scroll",
            ActionKind::SwipeGeneric => "swipe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top_left: [f64; 2],
    pub bottom_right: [f64; 2],
}

impl BoundingBox {
    pub fn center(&self) -> (i32, i32) {
        let cx = (self.top_left[0] + self.bottom_right[0]) / 2.0;
        let cy = (self.top_left[1] + self.bottom_right[1]) / 2.0;
        (cx as i32, cy as i32)
    }
}

/// A single atomic intent (§3 "Action").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action: ActionKind,
    #[serde(default)]
    pub action_desc: Option<String>,
    #[serde(default)]
    pub target_identifier: Option<String>,
    #[serde(default)]
    pub target_bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub input_text: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub reasoning: String,
}

/// An ordered sequence of 1-12 Actions for a single step (§3 "Action Batch").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBatch {
    pub actions: Vec<Action>,
    pub exploration_journal: String,
    #[serde(default)]
    pub signup_completed: Option<bool>,
}

pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 12;

/// Result of a single action execution, per DeviceClient call.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }
    pub fn fail(msg: impl Into<String>) -> Self {
        Self { success: false, error: Some(msg.into()) }
    }
}

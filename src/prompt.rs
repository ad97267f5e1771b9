//! PromptBuilder (§4.8): assembles the text sent to the model from a static
//! instructional part (built once) and a dynamic part rebuilt every step.
//!
//! Section order in the dynamic part is load-bearing: synthetic-screenshot
//! notice, visit count, last-action feedback, UI elements, OCR block, stuck
//! notice, exploration journal, actions already tried on this screen,
//! authentication strategy, then the task line. Given identical inputs the
//! output is byte-identical.

use crate::model::parser::OcrResult;
use crate::types::ActionKind;
use serde_json::json;

/// One step's worth of screen state and history, already collected by
/// ScreenStateManager/ContextBuilder/StuckDetector — PromptBuilder only
/// formats, it never fetches.
pub struct PromptContext<'a> {
    pub is_synthetic_screenshot: bool,
    pub current_screen_visit_count: i64,
    pub last_action_feedback: Option<String>,
    pub ui_elements_json: String,
    pub ocr_results: &'a [OcrResult],
    pub is_stuck: bool,
    pub stuck_reason: String,
    pub exploration_journal: String,
    pub journal_max_chars: usize,
    pub current_screen_id: Option<i64>,
    pub current_screen_actions: Vec<ScreenActionSummary>,
    pub credentials: AuthStrategy,
    pub task: Option<String>,
}

pub struct ScreenActionSummary {
    pub action_desc: String,
    pub execution_success: bool,
    pub to_screen_id: Option<i64>,
}

/// Which strategy to tell the model to follow, decided by whether the
/// credential store already has an entry for the target package.
pub enum AuthStrategy {
    Login { email: String, password: String, name: Option<String> },
    Signup { email: String, password: String, name: String },
}

const DEFAULT_SIGNUP_EMAIL: &str = "test@email.com";
const DEFAULT_SIGNUP_PASSWORD: &str = "Test123!";
const DEFAULT_SIGNUP_NAME: &str = "Test User";

pub struct PromptBuilder {
    static_part: String,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self { static_part: build_static_part() }
    }

    pub fn format(&self, context: &PromptContext) -> String {
        let mut parts = vec!["=== CONTEXT (Static - Instructions) ===".to_string(), self.static_part.clone()];
        parts.push("\n=== CURRENT STATE ===".to_string());

        if context.is_synthetic_screenshot {
            parts.push(
                "\n**VISUAL CONTEXT**: The attached image is a synthetic wireframe rendered \
                 from the UI tree (the real screenshot was blocked). Trust the labels and \
                 bounding boxes shown; use it for spatial reasoning only."
                    .to_string(),
            );
        }

        if context.current_screen_visit_count > 0 {
            parts.push(format!(
                "**Screen Visit Context**: visited {} times.",
                context.current_screen_visit_count
            ));
        }

        if let Some(feedback) = &context.last_action_feedback {
            parts.push(format!("**Last Action Outcome**:\n{feedback}"));
        }

        parts.push(format!("\n**UI Elements (JSON Structure)**:\n```json\n{}\n```", context.ui_elements_json));

        if !context.ocr_results.is_empty() {
            let mut lines = vec!["\n**Visual Elements (OCR)**:".to_string()];
            for (idx, hit) in context.ocr_results.iter().enumerate() {
                lines.push(format!(
                    "- ocr_{idx} = \"{}\" [{:.0},{:.0}]-[{:.0},{:.0}]",
                    hit.text,
                    hit.bounding_box.top_left[0],
                    hit.bounding_box.top_left[1],
                    hit.bounding_box.bottom_right[0],
                    hit.bounding_box.bottom_right[1],
                ));
            }
            parts.push(lines.join("\n"));
        }

        if context.is_stuck {
            parts.push(format!(
                "\n⚠️ **STUCK DETECTED**: {}. You must escape — do not repeat previous actions.",
                context.stuck_reason
            ));
        }

        if context.exploration_journal.is_empty() {
            parts.push(format!(
                "\n=== EXPLORATION JOURNAL (max {} chars, you own compression) ===\n(empty - start of session)",
                context.journal_max_chars
            ));
        } else {
            parts.push(format!(
                "\n=== EXPLORATION JOURNAL (max {} chars, you own compression) ===\n{}",
                context.journal_max_chars, context.exploration_journal
            ));
        }

        if !context.current_screen_actions.is_empty() {
            let mut lines = vec![format!(
                "\n**Actions Tried on This Screen (#{})**:",
                context.current_screen_id.map(|id| id.to_string()).unwrap_or_else(|| "?".into())
            )];
            for action in context.current_screen_actions.iter().rev().take(8).rev() {
                let result = if action.execution_success && action.to_screen_id != context.current_screen_id {
                    match action.to_screen_id {
                        Some(id) => format!("-> screen #{id}"),
                        None => "-> navigated away".to_string(),
                    }
                } else {
                    "-> ineffective/failed".to_string()
                };
                lines.push(format!("- {} {}", action.action_desc, result));
            }
            parts.push(lines.join("\n"));
        }

        parts.push(format_auth_strategy(&context.credentials));

        let task_line = context.task.as_deref().unwrap_or("Explore the app to maximize screen coverage.");
        parts.push(format!("\n\n**TASK**: {task_line} Choose the next best action batch. Respond in JSON."));

        parts.join("\n")
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn format_auth_strategy(strategy: &AuthStrategy) -> String {
    match strategy {
        AuthStrategy::Login { email, password, name } => format!(
            "\n**AUTHENTICATION STRATEGY**: LOGIN (credentials exist for this app)\n\
             - Email: {email}\n- Password: {password}\n- Name: {}\n\
             When you see a login/signup choice, choose LOGIN and use these credentials.",
            name.as_deref().unwrap_or("n/a")
        ),
        AuthStrategy::Signup { email, password, name } => format!(
            "\n**AUTHENTICATION STRATEGY**: SIGNUP (no stored credentials for this app)\n\
             - Email: {email}\n- Password: {password}\n- Name: {name}\n\
             When you see a login/signup choice, choose SIGNUP and create a new account.\n\
             After completing signup, set \"signup_completed\": true in your response so \
             these credentials are saved for future runs."
        ),
    }
}

impl AuthStrategy {
    pub fn signup_with_defaults(email: Option<String>, password: Option<String>, name: Option<String>) -> Self {
        AuthStrategy::Signup {
            email: email.unwrap_or_else(|| DEFAULT_SIGNUP_EMAIL.to_string()),
            password: password.unwrap_or_else(|| DEFAULT_SIGNUP_PASSWORD.to_string()),
            name: name.unwrap_or_else(|| DEFAULT_SIGNUP_NAME.to_string()),
        }
    }
}

const ACTION_KINDS: &[ActionKind] = &[
    ActionKind::Click,
    ActionKind::Input,
    ActionKind::LongPress,
    ActionKind::DoubleTap,
    ActionKind::ClearText,
    ActionKind::ReplaceText,
    ActionKind::ScrollUp,
    ActionKind::ScrollDown,
    ActionKind::SwipeLeft,
    ActionKind::SwipeRight,
    ActionKind::Flick,
    ActionKind::Back,
    ActionKind::ResetApp,
];

fn action_description(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Click => "tap an element identified by target_identifier or target_bounding_box",
        ActionKind::Input => "tap a field then type input_text into it",
        ActionKind::LongPress => "press and hold an element for duration_ms (default 600ms)",
        ActionKind::DoubleTap => "tap an element twice in quick succession",
        ActionKind::ClearText => "clear the contents of a text field identified by target_identifier",
        ActionKind::ReplaceText => "select all text in a field and replace it with input_text",
        ActionKind::ScrollUp => "scroll the current screen upward",
        ActionKind::ScrollDown => "scroll the current screen downward",
        ActionKind::SwipeLeft => "swipe the current screen leftward",
        ActionKind::SwipeRight => "swipe the current screen rightward",
        ActionKind::Flick => "a quick directional flick gesture, direction inferred from reasoning",
        ActionKind::Back => "press the device back button",
        ActionKind::ResetApp => "force-stop and relaunch the target app",
        ActionKind::ScrollGeneric | ActionKind::SwipeGeneric => "generic form, direction inferred from reasoning",
    }
}

fn build_static_part() -> String {
    let action_list: String = ACTION_KINDS
        .iter()
        .map(|k| format!("- {}: {}", k.as_str(), action_description(*k)))
        .collect::<Vec<_>>()
        .join("\n");

    let schema = json!({
        "actions": [{
            "action": "click | input | long_press | double_tap | clear_text | replace_text | scroll_up | scroll_down | swipe_left | swipe_right | flick | back | reset_app",
            "action_desc": "short human-readable description (optional)",
            "target_identifier": "element id, resource-id, or ocr_<i> reference (optional)",
            "target_bounding_box": {"top_left": [0, 0], "bottom_right": [0, 0]},
            "input_text": "text to type, required for input/replace_text",
            "duration_ms": 600,
            "reasoning": "why this action moves exploration forward (required)"
        }],
        "exploration_journal": "running narrative of what has been explored so far",
        "signup_completed": false
    });

    format!(
        "You are exploring a mobile app to maximize UI coverage. Every response must be a \
         single JSON object matching this schema:\n```json\n{}\n```\n\n\
         Available actions:\n{action_list}\n\n\
         Batches may contain 1-12 actions. Update exploration_journal every step with what \
         you just did and what you learned — it is the only memory carried to the next step. \
         Only global actions (scroll/swipe/flick/back/reset_app) may omit a target; every \
         other action requires target_identifier or target_bounding_box.",
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn base_context<'a>() -> PromptContext<'a> {
        PromptContext {
            is_synthetic_screenshot: false,
            current_screen_visit_count: 0,
            last_action_feedback: None,
            ui_elements_json: "[]".to_string(),
            ocr_results: &[],
            is_stuck: false,
            stuck_reason: String::new(),
            exploration_journal: String::new(),
            journal_max_chars: 4000,
            current_screen_id: None,
            current_screen_actions: Vec::new(),
            credentials: AuthStrategy::signup_with_defaults(None, None, None),
            task: None,
        }
    }

    #[test]
    fn format_is_deterministic_given_identical_input() {
        let builder = PromptBuilder::new();
        let ctx1 = base_context();
        let ctx2 = base_context();
        assert_eq!(builder.format(&ctx1), builder.format(&ctx2));
    }

    #[test]
    fn includes_stuck_notice_when_stuck() {
        let builder = PromptBuilder::new();
        let mut ctx = base_context();
        ctx.is_stuck = true;
        ctx.stuck_reason = "high visit count (6)".to_string();
        let output = builder.format(&ctx);
        assert!(output.contains("STUCK DETECTED"));
        assert!(output.contains("high visit count (6)"));
    }

    #[test]
    fn includes_login_strategy_when_credentials_present() {
        let builder = PromptBuilder::new();
        let mut ctx = base_context();
        ctx.credentials = AuthStrategy::Login {
            email: "a@b.com".into(),
            password: "pw".into(),
            name: Some("Tester".into()),
        };
        let output = builder.format(&ctx);
        assert!(output.contains("LOGIN"));
        assert!(output.contains("a@b.com"));
    }

    #[test]
    fn includes_ocr_block_when_present() {
        let builder = PromptBuilder::new();
        let ocr = vec![OcrResult {
            text: "Sign in".into(),
            bounding_box: BoundingBox { top_left: [10.0, 20.0], bottom_right: [100.0, 50.0] },
        }];
        let mut ctx = base_context();
        ctx.ocr_results = &ocr;
        let output = builder.format(&ctx);
        assert!(output.contains("ocr_0"));
        assert!(output.contains("Sign in"));
    }

    #[test]
    fn omits_ocr_block_when_empty() {
        let builder = PromptBuilder::new();
        let ctx = base_context();
        let output = builder.format(&ctx);
        assert!(!output.contains("Visual Elements (OCR)"));
    }

    #[test]
    fn caps_actions_tried_to_last_eight() {
        let builder = PromptBuilder::new();
        let mut ctx = base_context();
        ctx.current_screen_id = Some(1);
        ctx.current_screen_actions = (0..10)
            .map(|i| ScreenActionSummary { action_desc: format!("tap {i}"), execution_success: true, to_screen_id: Some(1) })
            .collect();
        let output = builder.format(&ctx);
        assert!(!output.contains("tap 0"));
        assert!(output.contains("tap 9"));
    }
}

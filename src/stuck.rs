//! Stuck-loop detection.
//!
//! Recognizes non-productive repetition — the crawler bouncing around the
//! same screen without making progress — and hands the loop a reason string
//! to fold into the next prompt. Thresholds are hard-coded per the source
//! this was distilled from; a configurable version must preserve these
//! defaults.

use serde::{Deserialize, Serialize};

const HIGH_VISIT_COUNT_THRESHOLD: u32 = 5;
const NO_OP_SUCCESS_THRESHOLD: usize = 3;
const RECENT_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StuckConfig {
    #[serde(default = "default_high_visit_count")]
    pub high_visit_count_threshold: u32,
    #[serde(default = "default_no_op_success")]
    pub no_op_success_threshold: usize,
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
}

fn default_high_visit_count() -> u32 {
    HIGH_VISIT_COUNT_THRESHOLD
}
fn default_no_op_success() -> usize {
    NO_OP_SUCCESS_THRESHOLD
}
fn default_recent_window() -> usize {
    RECENT_WINDOW
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            high_visit_count_threshold: HIGH_VISIT_COUNT_THRESHOLD,
            no_op_success_threshold: NO_OP_SUCCESS_THRESHOLD,
            recent_window: RECENT_WINDOW,
        }
    }
}

/// One entry of recent-action history, as pulled from the persistence layer
/// by ContextBuilder. Mirrors the shape of a `steps` row closely enough for
/// the detector's purposes.
#[derive(Debug, Clone)]
pub struct ActionHistoryEntry {
    pub from_screen_id: Option<i64>,
    pub to_screen_id: Option<i64>,
    pub execution_success: bool,
}

pub struct StuckDetector {
    config: StuckConfig,
}

impl StuckDetector {
    pub fn new(config: StuckConfig) -> Self {
        Self { config }
    }

    /// `recent_action_history` is the full recent-step window (most-recent
    /// last); `current_screen_actions` is the subset of those steps whose
    /// `from_screen_id` equals `current_screen_id`.
    pub fn check_if_stuck(
        &self,
        current_screen_id: Option<i64>,
        visit_count_on_current_screen: u32,
        recent_action_history: &[ActionHistoryEntry],
        current_screen_actions: &[ActionHistoryEntry],
    ) -> (bool, String) {
        // If the most recent action succeeded and navigated away, we are not
        // stuck — this prevents false positives right after a navigation.
        if let Some(last) = recent_action_history.last() {
            if last.execution_success {
                if let (Some(from), Some(to)) = (last.from_screen_id, last.to_screen_id) {
                    if to != from {
                        return (false, String::new());
                    }
                }
            }
        }

        let Some(from_screen_id) = current_screen_id else {
            return (false, String::new());
        };
        if current_screen_actions.is_empty() {
            return (false, String::new());
        }

        let same_screen_actions: Vec<&ActionHistoryEntry> = current_screen_actions
            .iter()
            .filter(|a| {
                a.execution_success
                    && (a.to_screen_id == Some(from_screen_id) || a.to_screen_id.is_none())
            })
            .collect();

        if visit_count_on_current_screen > self.config.high_visit_count_threshold {
            return (
                true,
                format!("high visit count ({})", visit_count_on_current_screen),
            );
        }
        if same_screen_actions.len() >= self.config.no_op_success_threshold {
            return (
                true,
                format!("multiple no-op successes ({})", same_screen_actions.len()),
            );
        }
        if current_screen_actions.len() >= self.config.recent_window {
            let recent =
                &current_screen_actions[current_screen_actions.len() - self.config.recent_window..];
            let all_stayed = recent.iter().filter(|a| a.execution_success).all(|a| {
                a.to_screen_id == Some(from_screen_id) || a.to_screen_id.is_none()
            });
            if all_stayed {
                return (true, "all recent actions stayed".to_string());
            }
        }

        (false, String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stayed(from: i64) -> ActionHistoryEntry {
        ActionHistoryEntry {
            from_screen_id: Some(from),
            to_screen_id: Some(from),
            execution_success: true,
        }
    }

    fn navigated(from: i64, to: i64) -> ActionHistoryEntry {
        ActionHistoryEntry {
            from_screen_id: Some(from),
            to_screen_id: Some(to),
            execution_success: true,
        }
    }

    #[test]
    fn not_stuck_right_after_navigation() {
        let det = StuckDetector::new(StuckConfig::default());
        let history = vec![stayed(1), stayed(1), navigated(1, 2)];
        let (stuck, _) = det.check_if_stuck(Some(2), 1, &history, &[]);
        assert!(!stuck);
    }

    #[test]
    fn visit_count_exactly_5_not_stuck_6_is() {
        let det = StuckDetector::new(StuckConfig::default());
        let history = vec![stayed(1)];
        let current = vec![stayed(1)];
        let (stuck, _) = det.check_if_stuck(Some(1), 5, &history, &current);
        assert!(!stuck);
        let (stuck, reason) = det.check_if_stuck(Some(1), 6, &history, &current);
        assert!(stuck);
        assert!(reason.contains("high visit count"));
    }

    #[test]
    fn three_no_op_successes_trigger() {
        let det = StuckDetector::new(StuckConfig::default());
        let current = vec![stayed(1), stayed(1), stayed(1)];
        let (stuck, reason) = det.check_if_stuck(Some(1), 1, &current, &current);
        assert!(stuck);
        assert!(reason.contains("multiple no-op successes"));
    }

    #[test]
    fn last_five_all_stayed_triggers() {
        let det = StuckDetector::new(StuckConfig::default());
        // Two no-op successes (< 3 threshold), but 5 in the window, all stayed.
        let current = vec![
            stayed(1),
            ActionHistoryEntry {
                from_screen_id: Some(1),
                to_screen_id: Some(1),
                execution_success: false,
            },
            stayed(1),
            ActionHistoryEntry {
                from_screen_id: Some(1),
                to_screen_id: Some(1),
                execution_success: false,
            },
            stayed(1),
        ];
        let (stuck, reason) = det.check_if_stuck(Some(1), 1, &current, &current);
        assert!(stuck);
        assert!(reason.contains("all recent actions stayed"));
    }

    #[test]
    fn mixed_actions_no_false_positive() {
        let det = StuckDetector::new(StuckConfig::default());
        let current = vec![stayed(1), stayed(1)];
        let (stuck, _) = det.check_if_stuck(Some(1), 2, &current, &current);
        assert!(!stuck);
    }
}

//! CrawlLoop (§4.12): the central orchestrator. Wires every subsystem
//! together and drives the step sequence: capture screen, build context,
//! check for stuck loops, prompt the model, parse and execute its response,
//! re-capture, persist, repeat until a termination condition or the file-flag
//! control plane asks it to stop.

use crate::action::ActionExecutor;
use crate::config::{Config, CrawlMode};
use crate::context_builder::ContextBuilder;
use crate::device::DeviceClient;
use crate::events::{CrawlEvent, EventBus};
use crate::flags::{FlagConfig, FlagController};
use crate::hooks::LifecycleHooks;
use crate::model::parser::ActionBatchParser;
use crate::model::ModelAdapter;
use crate::ocr::{NullOcrProvider, OcrProvider};
use crate::persistence::store::{RunStatus, StepRecord, StepToInsert};
use crate::persistence::{CredentialStore, PersistenceStore};
use crate::prompt::{AuthStrategy, PromptBuilder, PromptContext, ScreenActionSummary};
use crate::screen_state::ScreenStateManager;
use crate::stuck::{ActionHistoryEntry, StuckConfig, StuckDetector};
use crate::types::ActionOutcome;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Run-level counters named in the Run entity's runtime statistics, rolled
/// up once at run finish via `PersistenceStore::update_run_meta`.
#[derive(Debug, Clone, Default, Serialize)]
struct RunStats {
    stuck_detection_count: u32,
    llm_retries: u32,
    element_not_found_count: u32,
    app_crash_count: u32,
    context_loss_count: u32,
    provider: String,
    model: String,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed,
    Interrupted,
    Failed(String),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Interrupted => 130,
            RunOutcome::Failed(_) => 1,
        }
    }
}

pub struct CrawlLoop {
    config: Config,
    device: Arc<dyn DeviceClient>,
    model: Arc<dyn ModelAdapter>,
    store: PersistenceStore,
    credentials: CredentialStore,
    flags: FlagController,
    stuck_detector: StuckDetector,
    prompt_builder: PromptBuilder,
    hooks: LifecycleHooks,
    events: EventBus,
    session_dir: PathBuf,
    ocr: Arc<dyn OcrProvider>,
}

impl CrawlLoop {
    pub fn new(config: Config, device: Arc<dyn DeviceClient>, model: Arc<dyn ModelAdapter>, events: EventBus) -> anyhow::Result<Self> {
        Self::with_ocr(config, device, model, events, Arc::new(NullOcrProvider))
    }

    pub fn with_ocr(
        config: Config,
        device: Arc<dyn DeviceClient>,
        model: Arc<dyn ModelAdapter>,
        events: EventBus,
        ocr: Arc<dyn OcrProvider>,
    ) -> anyhow::Result<Self> {
        let store = PersistenceStore::open(&config.agent.persistence_path)?;
        let credentials = CredentialStore::open(&config.credentials.db_path)?;
        let flags = FlagController::new(&FlagConfig { dir: config.flags.dir.clone() });
        let stuck_detector = StuckDetector::new(StuckConfig {
            high_visit_count_threshold: config.crawl.stuck_visit_threshold,
            no_op_success_threshold: config.crawl.stuck_same_screen_threshold as usize,
            recent_window: config.crawl.stuck_history_window,
        });
        let hooks = LifecycleHooks::new(config.hooks.clone());
        let session_dir = PathBuf::from(&config.agent.session_dir);
        Ok(Self {
            config,
            device,
            model,
            store,
            credentials,
            flags,
            stuck_detector,
            prompt_builder: PromptBuilder::new(),
            hooks,
            events,
            session_dir,
            ocr,
        })
    }

    pub async fn run(&self) -> anyhow::Result<RunOutcome> {
        self.device
            .initialize_session(&self.config.agent.target_package, self.config.device.adb_device.as_deref())
            .await?;
        self.device.launch_app(&self.config.agent.target_package).await;
        if let Some(activity) = &self.config.agent.entry_activity {
            self.device.start_activity(&self.config.agent.target_package, activity, true).await;
        }

        let run_id = self
            .store
            .get_or_create_run(&self.config.agent.target_package, self.config.agent.entry_activity.as_deref())
            .await?;
        info!("run {run_id} started for {}", self.config.agent.target_package);
        self.hooks.on_run_start(run_id, &self.config.agent.target_package).await;
        self.events.publish(CrawlEvent::RunStarted { run_id, target_package: self.config.agent.target_package.clone() });

        let context_builder = ContextBuilder::with_allowed_external_packages(
            &self.store,
            self.config.agent.target_package.clone(),
            self.config.crawl.allowed_external_packages.clone(),
        );
        let screen_manager = ScreenStateManager::with_ocr(
            &self.store,
            self.session_dir.clone(),
            self.config.crawl.max_elements,
            self.ocr.clone(),
            self.config.crawl.ocr_enabled,
        );

        let (outcome, stats) = self.drive_steps(run_id, &context_builder, &screen_manager).await;

        let status = match &outcome {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Interrupted => RunStatus::Interrupted,
            RunOutcome::Failed(_) => RunStatus::Failed,
        };
        if let Ok(stats_json) = serde_json::to_string(&stats) {
            self.store.update_run_meta(run_id, &stats_json).await.ok();
        }
        self.store.update_run_status(run_id, status, true).await.ok();
        self.hooks.on_run_finish(run_id, run_status_label(status)).await;
        self.events.publish(CrawlEvent::RunFinished { run_id, status: run_status_label(status).to_string() });
        self.device.terminate_app(&self.config.agent.target_package).await;

        Ok(outcome)
    }

    async fn drive_steps(
        &self,
        run_id: i64,
        context_builder: &ContextBuilder<'_>,
        screen_manager: &ScreenStateManager<'_>,
    ) -> (RunOutcome, RunStats) {
        let start = Instant::now();
        let mut step: i64 = 0;
        let mut from_screen_id: Option<i64> = None;
        let mut last_action_feedback: Option<String> = None;
        let mut login_recorded = false;
        let mut stats = RunStats {
            provider: self.config.model.backend.clone(),
            model: self.config.model.model.clone(),
            ..Default::default()
        };

        loop {
            if self.flags.shutdown_requested() {
                return (RunOutcome::Interrupted, stats);
            }
            self.flags.wait_while_paused().await;
            if self.flags.shutdown_requested() {
                return (RunOutcome::Interrupted, stats);
            }
            match self.config.crawl.mode {
                CrawlMode::Steps => {
                    if step >= self.config.crawl.max_steps as i64 {
                        return (RunOutcome::Completed, stats);
                    }
                }
                CrawlMode::Time => {
                    if start.elapsed().as_secs() >= self.config.crawl.max_duration_seconds {
                        return (RunOutcome::Completed, stats);
                    }
                }
            }

            step += 1;
            self.events.publish(CrawlEvent::StepStarted { step, screen_id: from_screen_id });

            if !self.device.validate_session().await {
                stats.app_crash_count += 1;
                return (RunOutcome::Failed("device session lost".into()), stats);
            }

            if let Some(current_package) = self.device.get_current_package().await {
                if !self.package_in_scope(&current_package) {
                    stats.context_loss_count += 1;
                    warn!("app context check failed at step {step}: foreground package is {current_package}");
                    last_action_feedback = Some("App context check failed: foreground app left the target package.".into());
                    continue;
                }
            }

            let candidate = match screen_manager.get_current_screen_representation(self.device.as_ref(), step).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("screen capture failed at step {step}: {e}");
                    if e.is_fatal() {
                        return (RunOutcome::Failed(e.to_string()), stats);
                    }
                    last_action_feedback = Some(format!("Screen capture failed: {e}"));
                    continue;
                }
            };

            let current_screen = match screen_manager.process_and_record_state(&candidate, run_id, step, false).await {
                Ok(f) => f,
                Err(e) => {
                    warn!("failed to record screen state at step {step}: {e}");
                    if e.is_fatal() {
                        return (RunOutcome::Failed(e.to_string()), stats);
                    }
                    last_action_feedback = Some(format!("Failed to record screen state: {e}"));
                    continue;
                }
            };

            if let Some(_bytes) = &candidate.screenshot_png {
                self.events.publish(CrawlEvent::ScreenshotReady {
                    step,
                    path: candidate.proposed_screenshot_path.to_string_lossy().to_string(),
                });
            }

            let crawl_context = match context_builder.get_crawl_context(run_id, from_screen_id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("failed to build context at step {step}: {e}");
                    continue;
                }
            };
            let journal = self.store.get_exploration_journal(run_id).await.unwrap_or_default();

            let recent_history: Vec<ActionHistoryEntry> = crawl_context.action_history.iter().map(to_history_entry).collect();
            let current_screen_actions: Vec<ActionHistoryEntry> =
                crawl_context.current_screen_actions.iter().map(to_history_entry).collect();
            let (is_stuck, stuck_reason) = self.stuck_detector.check_if_stuck(
                Some(current_screen.screen_id),
                current_screen.visit_count_this_run as u32,
                &recent_history,
                &current_screen_actions,
            );
            if is_stuck {
                stats.stuck_detection_count += 1;
                self.hooks.on_stuck(run_id, step, &stuck_reason).await;
                self.events.publish(CrawlEvent::StuckDetected { step, reason: stuck_reason.clone() });
            }

            let credentials_strategy = self.resolve_auth_strategy().await;
            if !login_recorded {
                if let AuthStrategy::Login { .. } = &credentials_strategy {
                    self.credentials.increment_login_count(&self.config.agent.target_package).await.ok();
                    login_recorded = true;
                }
            }
            let ui_elements_json = serde_json::to_string_pretty(&candidate.sanitized.elements).unwrap_or_default();
            let screen_action_summaries: Vec<ScreenActionSummary> = crawl_context
                .current_screen_actions
                .iter()
                .map(|s| ScreenActionSummary {
                    action_desc: s.action_desc.clone(),
                    execution_success: s.execution_success,
                    to_screen_id: s.to_screen_id,
                })
                .collect();

            let prompt_context = PromptContext {
                is_synthetic_screenshot: candidate.screenshot_blocked,
                current_screen_visit_count: current_screen.visit_count_this_run,
                last_action_feedback: last_action_feedback.clone(),
                ui_elements_json,
                ocr_results: &candidate.ocr_results,
                is_stuck,
                stuck_reason: stuck_reason.clone(),
                exploration_journal: journal,
                journal_max_chars: self.config.crawl.journal_max_chars,
                current_screen_id: Some(current_screen.screen_id),
                current_screen_actions: screen_action_summaries,
                credentials: credentials_strategy,
                task: self.config.crawl.task.clone(),
            };
            let prompt = self.prompt_builder.format(&prompt_context);

            if self.flags.shutdown_requested() {
                return (RunOutcome::Interrupted, stats);
            }
            self.flags.wait_while_paused().await;
            if self.flags.shutdown_requested() {
                return (RunOutcome::Interrupted, stats);
            }

            let gen_start = Instant::now();
            let generation = match self.model.generate_response(&prompt, candidate.screenshot_png.as_deref()).await {
                Ok(g) => g,
                Err(e) => {
                    warn!("model call failed at step {step}: {e}");
                    stats.llm_retries += 1;
                    last_action_feedback = Some(format!("Previous step's model call failed: {e}"));
                    self.record_step_failure(run_id, step, from_screen_id, &prompt, &format!("model error: {e}")).await;
                    continue;
                }
            };
            let llm_response_ms = gen_start.elapsed().as_millis() as i64;

            let batch = match ActionBatchParser::parse(&generation.text, &candidate.ocr_results) {
                Ok(b) => b,
                Err(e) => {
                    warn!("failed to parse model response at step {step}: {e}");
                    stats.llm_retries += 1;
                    last_action_feedback = Some(format!("Previous response could not be parsed: {e}"));
                    self.record_step_failure(run_id, step, from_screen_id, &prompt, &format!("parse error: {e}")).await;
                    continue;
                }
            };

            if batch.signup_completed == Some(true) {
                self.persist_signup_credentials().await;
            }
            self.store.update_exploration_journal(run_id, &batch.exploration_journal).await.ok();

            if self.flags.shutdown_requested() {
                return (RunOutcome::Interrupted, stats);
            }
            self.flags.wait_while_paused().await;
            if self.flags.shutdown_requested() {
                return (RunOutcome::Interrupted, stats);
            }

            let (executed_count, outcomes, batch_error) = ActionExecutor::execute_batch(
                self.device.as_ref(),
                &batch.actions,
                Duration::from_millis(self.config.crawl.wait_between_actions_ms),
                self.config.crawl.stop_on_action_error,
            )
            .await;

            let batch_success = batch_error.is_none() && outcomes.iter().all(|o| o.success);
            stats.element_not_found_count += outcomes.iter().filter(|o| !o.success).count() as u32;

            let next_candidate = match screen_manager.get_current_screen_representation(self.device.as_ref(), step).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("failed to re-capture screen after actions at step {step}: {e}");
                    continue;
                }
            };
            let next_screen = match screen_manager.process_and_record_state(&next_candidate, run_id, step, batch_success).await {
                Ok(f) => f,
                Err(e) => {
                    warn!("failed to record post-action screen state at step {step}: {e}");
                    continue;
                }
            };

            let action_desc = describe_batch(&batch.actions);

            self.store
                .insert_step(StepToInsert {
                    run_id,
                    step_number: step,
                    from_screen_id: Some(current_screen.screen_id),
                    to_screen_id: batch_success.then_some(next_screen.screen_id),
                    action_desc: action_desc.clone(),
                    raw_suggestion: Some(generation.text.clone()),
                    normalized_action: serde_json::to_string(&batch.actions).ok(),
                    execution_success: batch_success,
                    error_message: batch_error.clone(),
                    llm_response_ms: Some(llm_response_ms),
                    total_tokens: Some(generation.usage.total_tokens as i64),
                    llm_prompt: Some(prompt),
                    element_find_ms: None,
                })
                .await
                .ok();

            self.events.publish(CrawlEvent::ActionExecuted { step, action_desc: action_desc.clone(), success: batch_success });

            let screen_changed = next_screen.screen_id != current_screen.screen_id;
            last_action_feedback = Some(compose_feedback(executed_count, &outcomes, &batch_error, screen_changed));
            if batch_success {
                from_screen_id = Some(next_screen.screen_id);
            }

            self.flags.honor_step_gate().await;
        }
    }

    /// True when `package` is the target app or an explicitly allow-listed
    /// external package (share sheets, file pickers the app itself launched).
    fn package_in_scope(&self, package: &str) -> bool {
        if package.is_empty() || package.contains(&self.config.agent.target_package) {
            return true;
        }
        self.config.crawl.allowed_external_packages.iter().any(|p| package.contains(p.as_str()))
    }

    async fn resolve_auth_strategy(&self) -> AuthStrategy {
        if let Ok(Some(record)) = self.credentials.get(&self.config.agent.target_package).await {
            return AuthStrategy::Login { email: record.email, password: record.password, name: record.name };
        }
        AuthStrategy::signup_with_defaults(
            self.config.crawl.signup_test_email.clone(),
            self.config.crawl.signup_test_password.clone(),
            self.config.crawl.signup_test_name.clone(),
        )
    }

    async fn persist_signup_credentials(&self) {
        let email = self.config.crawl.signup_test_email.clone().unwrap_or_else(|| "test@email.com".into());
        let password = self.config.crawl.signup_test_password.clone().unwrap_or_else(|| "Test123!".into());
        let name = self.config.crawl.signup_test_name.clone();
        if let Err(e) = self
            .credentials
            .store(&self.config.agent.target_package, &email, &password, name.as_deref(), None, true)
            .await
        {
            warn!("failed to persist signup credentials: {e}");
        }
    }

    async fn record_step_failure(&self, run_id: i64, step: i64, from_screen_id: Option<i64>, prompt: &str, error: &str) {
        let _ = self
            .store
            .insert_step(StepToInsert {
                run_id,
                step_number: step,
                from_screen_id,
                to_screen_id: from_screen_id,
                action_desc: "(no action: model/parse failure)".into(),
                execution_success: false,
                error_message: Some(error.to_string()),
                llm_prompt: Some(prompt.to_string()),
                ..Default::default()
            })
            .await;
    }
}

fn run_status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Interrupted => "INTERRUPTED",
        RunStatus::Failed => "FAILED",
    }
}

fn to_history_entry(step: &StepRecord) -> ActionHistoryEntry {
    ActionHistoryEntry {
        from_screen_id: step.from_screen_id,
        to_screen_id: step.to_screen_id,
        execution_success: step.execution_success,
    }
}

fn describe_batch(actions: &[crate::types::Action]) -> String {
    let joined = actions
        .iter()
        .filter_map(|a| a.action_desc.clone())
        .collect::<Vec<_>>()
        .join("; ");
    if joined.is_empty() {
        actions.iter().map(|a| a.action.as_str()).collect::<Vec<_>>().join(", ")
    } else {
        joined
    }
}

/// Composes the feedback line fed back into next step's prompt, covering the
/// four outcome shapes: clean abort, all-succeeded-and-moved,
/// all-succeeded-but-stayed, and partial failure.
fn compose_feedback(executed_count: usize, outcomes: &[ActionOutcome], batch_error: &Option<String>, screen_changed: bool) -> String {
    let total = outcomes.len();
    let succeeded = outcomes.iter().filter(|o| o.success).count();

    if let Some(reason) = batch_error {
        return format!("Batch aborted after {executed_count} of {total} actions: {reason}");
    }
    if succeeded == total && total > 0 {
        return if screen_changed {
            format!("All {total} actions succeeded; the screen changed.")
        } else {
            format!("All {total} actions succeeded but the screen did not change.")
        };
    }
    let first_failure = outcomes.iter().find(|o| !o.success).and_then(|o| o.error.clone()).unwrap_or_default();
    format!("{succeeded} of {total} actions succeeded; first failure: {first_failure}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionOutcome;

    #[test]
    fn compose_feedback_reports_clean_navigation() {
        let outcomes = vec![ActionOutcome::ok(), ActionOutcome::ok()];
        let msg = compose_feedback(2, &outcomes, &None, true);
        assert!(msg.contains("the screen changed"));
    }

    #[test]
    fn compose_feedback_reports_no_op_success() {
        let outcomes = vec![ActionOutcome::ok()];
        let msg = compose_feedback(1, &outcomes, &None, false);
        assert!(msg.contains("did not change"));
    }

    #[test]
    fn compose_feedback_reports_batch_abort() {
        let outcomes = vec![ActionOutcome::fail("tap failed")];
        let msg = compose_feedback(1, &outcomes, &Some("batch aborted after action 1 of 3 failed".into()), false);
        assert!(msg.contains("Batch aborted"));
    }

    #[test]
    fn compose_feedback_reports_partial_failure() {
        let outcomes = vec![ActionOutcome::ok(), ActionOutcome::fail("element not found")];
        let msg = compose_feedback(2, &outcomes, &None, false);
        assert!(msg.contains("1 of 2"));
        assert!(msg.contains("element not found"));
    }

    #[test]
    fn exit_codes_match_outcome() {
        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(RunOutcome::Interrupted.exit_code(), 130);
        assert_eq!(RunOutcome::Failed("x".into()).exit_code(), 1);
    }
}

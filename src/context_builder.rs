//! ContextBuilder (§4.7): assembles the three lists PromptBuilder needs from
//! the persisted history, filtering screens that would only confuse the LLM
//! (system dialogs, file pickers, screens outside the target app).

use crate::persistence::store::{PersistenceStore, StepRecord, StoreResult, VisitedScreenSummary};

const RECENT_STEPS_LIMIT: i64 = 20;

/// Non-target activities that are nonetheless useful to see (share sheets,
/// camera/file pickers the app itself launched).
const ALLOWED_EXTERNAL_PACKAGES: &[&str] = &[
    "com.google.android.documentsui",
    "com.android.chrome",
    "com.google.android.gms",
];

const SYSTEM_ACTIVITY_PATTERNS: &[&str] = &[
    "documentsui",
    "picker",
    "permissioncontroller",
    "packageinstaller",
    "systemui",
];

pub struct CrawlContext {
    pub action_history: Vec<StepRecord>,
    pub visited_screens: Vec<VisitedScreenSummary>,
    pub current_screen_actions: Vec<StepRecord>,
}

pub struct ContextBuilder<'a> {
    store: &'a PersistenceStore,
    target_package: String,
    allowed_external_packages: Vec<String>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(store: &'a PersistenceStore, target_package: impl Into<String>) -> Self {
        Self::with_allowed_external_packages(store, target_package, Vec::new())
    }

    /// `allowed_external` overrides the built-in share-sheet/file-picker list
    /// when non-empty, so deployments can recognize their own app's pickers.
    pub fn with_allowed_external_packages(
        store: &'a PersistenceStore,
        target_package: impl Into<String>,
        allowed_external: Vec<String>,
    ) -> Self {
        let allowed_external_packages = if allowed_external.is_empty() {
            ALLOWED_EXTERNAL_PACKAGES.iter().map(|s| s.to_string()).collect()
        } else {
            allowed_external
        };
        Self { store, target_package: target_package.into(), allowed_external_packages }
    }

    pub async fn get_crawl_context(&self, run_id: i64, from_screen_id: Option<i64>) -> StoreResult<CrawlContext> {
        let action_history = self.store.get_recent_steps_with_details(run_id, RECENT_STEPS_LIMIT).await?;
        let visited_raw = self.store.get_visited_screens_summary(run_id).await?;
        let visited_screens = self.filter_visited_screens(visited_raw);

        let current_screen_actions = match from_screen_id {
            Some(id) => self.store.get_actions_for_screen_with_details(id, run_id).await?,
            None => Vec::new(),
        };

        Ok(CrawlContext { action_history, visited_screens, current_screen_actions })
    }

    /// Strips screens whose activity looks like a system dialog/picker, and
    /// screens outside the target package unless explicitly allow-listed.
    /// This never changes step numbering — it only shapes what the prompt sees.
    fn filter_visited_screens(&self, screens: Vec<VisitedScreenSummary>) -> Vec<VisitedScreenSummary> {
        screens
            .into_iter()
            .filter(|s| {
                let activity_lower = s.activity.to_lowercase();
                if SYSTEM_ACTIVITY_PATTERNS.iter().any(|p| activity_lower.contains(p)) {
                    return false;
                }
                if activity_lower.contains(&self.target_package.to_lowercase()) {
                    return true;
                }
                self.allowed_external_packages.iter().any(|p| activity_lower.contains(p.as_str()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store::StepToInsert;

    #[tokio::test]
    async fn filters_out_system_picker_activities() {
        let store = PersistenceStore::open_in_memory().unwrap();
        let run_id = store.get_or_create_run("com.example.app", None).await.unwrap();
        let (_s1, _) = store.upsert_screen(run_id, "h1", "com.example.app/.MainActivity", None, None, None, 1).await.unwrap();
        let (_s2, _) = store
            .upsert_screen(run_id, "h2", "com.google.android.documentsui/.FilePickerActivity", None, None, None, 2)
            .await
            .unwrap();
        store.increment_visit(run_id, _s1).await.unwrap();
        store.increment_visit(run_id, _s2).await.unwrap();

        let builder = ContextBuilder::new(&store, "com.example.app");
        let ctx = builder.get_crawl_context(run_id, None).await.unwrap();
        assert_eq!(ctx.visited_screens.len(), 1);
        assert!(ctx.visited_screens[0].activity.contains("MainActivity"));
    }

    #[tokio::test]
    async fn current_screen_actions_empty_without_from_screen() {
        let store = PersistenceStore::open_in_memory().unwrap();
        let run_id = store.get_or_create_run("com.example.app", None).await.unwrap();
        let builder = ContextBuilder::new(&store, "com.example.app");
        let ctx = builder.get_crawl_context(run_id, None).await.unwrap();
        assert!(ctx.current_screen_actions.is_empty());
        assert!(ctx.action_history.is_empty());
    }

    #[tokio::test]
    async fn current_screen_actions_scoped_to_from_screen() {
        let store = PersistenceStore::open_in_memory().unwrap();
        let run_id = store.get_or_create_run("com.example.app", None).await.unwrap();
        let (screen_id, _) = store.upsert_screen(run_id, "h1", "com.example.app/.MainActivity", None, None, None, 1).await.unwrap();
        store
            .insert_step(StepToInsert {
                run_id,
                step_number: 1,
                from_screen_id: Some(screen_id),
                action_desc: "tap login".into(),
                execution_success: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let builder = ContextBuilder::new(&store, "com.example.app");
        let ctx = builder.get_crawl_context(run_id, Some(screen_id)).await.unwrap();
        assert_eq!(ctx.current_screen_actions.len(), 1);
    }
}

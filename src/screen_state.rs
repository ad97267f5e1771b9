//! ScreenStateManager (§4.6): captures the current screen, computes its
//! composite hash, and upserts it into the PersistenceStore.

use crate::device::fingerprint::{self, SanitizedScreen};
use crate::device::{DeviceClient, ScreenshotResult};
use crate::errors::CrawlError;
use crate::model::parser::OcrResult;
use crate::ocr::OcrProvider;
use crate::persistence::PersistenceStore;
use base64::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// An in-memory record of the current screen, not yet written to disk.
pub struct CandidateScreen {
    pub composite_hash: String,
    pub activity: String,
    pub sanitized: SanitizedScreen,
    pub screenshot_png: Option<Vec<u8>>,
    pub screenshot_blocked: bool,
    pub proposed_screenshot_path: PathBuf,
    pub proposed_xml_path: PathBuf,
    pub proposed_ocr_path: PathBuf,
    pub ocr_results: Vec<OcrResult>,
}

pub struct FinalScreen {
    pub screen_id: i64,
    pub is_new: bool,
    pub visit_count_this_run: i64,
}

pub struct ScreenStateManager<'a> {
    store: &'a PersistenceStore,
    session_dir: PathBuf,
    max_elements: usize,
    ocr: Arc<dyn OcrProvider>,
    ocr_enabled: bool,
}

impl<'a> ScreenStateManager<'a> {
    pub fn new(store: &'a PersistenceStore, session_dir: impl Into<PathBuf>, max_elements: usize) -> Self {
        Self::with_ocr(store, session_dir, max_elements, Arc::new(crate::ocr::NullOcrProvider), false)
    }

    pub fn with_ocr(
        store: &'a PersistenceStore,
        session_dir: impl Into<PathBuf>,
        max_elements: usize,
        ocr: Arc<dyn OcrProvider>,
        ocr_enabled: bool,
    ) -> Self {
        Self { store, session_dir: session_dir.into(), max_elements, ocr, ocr_enabled }
    }

    pub async fn get_current_screen_representation(
        &self,
        device: &dyn DeviceClient,
        step: i64,
    ) -> Result<CandidateScreen, CrawlError> {
        let activity = device.get_current_activity().await.unwrap_or_else(|| "unknown".into());
        let ui_xml = device.get_ui_tree().await.unwrap_or_default();
        let sanitized = fingerprint::parse_accessibility_xml(&ui_xml, self.max_elements);

        let (screenshot_png, blocked) = match device.get_screenshot_bytes().await {
            Ok(ScreenshotResult::Bytes(bytes)) => (Some(bytes), false),
            Ok(ScreenshotResult::Blocked) => (None, true),
            Err(e) => {
                warn!("screenshot capture failed, continuing with UI tree only: {e}");
                (None, true)
            }
        };

        if blocked {
            warn!("screen at step {step} produced a BLOCKED screenshot; hashing from UI tree alone");
        }

        let composite_hash = fingerprint::composite_hash(&sanitized.elements, &activity);

        let ocr_results = if self.ocr_enabled {
            match &screenshot_png {
                Some(bytes) => self.ocr.recognize(bytes).await.unwrap_or_else(|e| {
                    warn!("OCR pass failed at step {step}, continuing without it: {e}");
                    Vec::new()
                }),
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        Ok(CandidateScreen {
            proposed_screenshot_path: self.session_dir.join(format!("screens/{composite_hash}.png")),
            proposed_xml_path: self.session_dir.join(format!("screens/{composite_hash}.xml")),
            proposed_ocr_path: self.session_dir.join(format!("screens/{composite_hash}.ocr.json")),
            composite_hash,
            activity,
            sanitized,
            screenshot_png,
            screenshot_blocked: blocked,
            ocr_results,
        })
    }

    pub async fn process_and_record_state(
        &self,
        candidate: &CandidateScreen,
        run_id: i64,
        step: i64,
        increment_visit: bool,
    ) -> Result<FinalScreen, CrawlError> {
        let screenshot_path = candidate.screenshot_png.as_ref().map(|_| candidate.proposed_screenshot_path.to_string_lossy().to_string());
        let xml_path = Some(candidate.proposed_xml_path.to_string_lossy().to_string());
        let ocr_path = (!candidate.ocr_results.is_empty())
            .then(|| candidate.proposed_ocr_path.to_string_lossy().to_string());

        let (screen_id, is_new) = self
            .store
            .upsert_screen(
                run_id,
                &candidate.composite_hash,
                &candidate.activity,
                screenshot_path.as_deref(),
                xml_path.as_deref(),
                ocr_path.as_deref(),
                step,
            )
            .await
            .map_err(|e| CrawlError::Persistence(e.to_string()))?;

        if !candidate.ocr_results.is_empty() {
            if let Ok(json) = serde_json::to_vec_pretty(&candidate.ocr_results) {
                self.write_if_new(&candidate.proposed_ocr_path, &json, is_new).await;
            }
        }

        if let Some(bytes) = &candidate.screenshot_png {
            self.write_if_new(&candidate.proposed_screenshot_path, bytes, is_new).await;
        } else if candidate.screenshot_blocked {
            // Synthetic placeholder so downstream consumers always find a file.
            let placeholder = base64::engine::general_purpose::STANDARD
                .decode(TRANSPARENT_PIXEL_PNG_BASE64)
                .unwrap_or_default();
            self.write_if_new(&candidate.proposed_screenshot_path, &placeholder, is_new).await;
        }

        let visit_count_this_run = if increment_visit {
            self.store
                .increment_visit(run_id, screen_id)
                .await
                .map_err(|e| CrawlError::Persistence(e.to_string()))?
        } else {
            self.store
                .get_visit_count(run_id, screen_id)
                .await
                .map_err(|e| CrawlError::Persistence(e.to_string()))?
        };

        Ok(FinalScreen { screen_id, is_new, visit_count_this_run })
    }

    async fn write_if_new(&self, path: &std::path::Path, bytes: &[u8], is_new: bool) {
        if !is_new && path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("failed to create screen directory {}: {e}", parent.display());
                return;
            }
        }
        if let Err(e) = tokio::fs::write(path, bytes).await {
            warn!("failed to persist screen artifact {}: {e}", path.display());
        }
    }
}

const TRANSPARENT_PIXEL_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNk+A8AAQUBAScY42YAAAAASUVORK5CYII=";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AdbDeviceClient, DeviceClient};

    // AdbDeviceClient requires a live device; these tests exercise the pure
    // state-management logic through the trait object only where possible.

    #[test]
    fn placeholder_png_decodes() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(TRANSPARENT_PIXEL_PNG_BASE64)
            .unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[tokio::test]
    async fn process_and_record_state_assigns_new_screen_id() {
        let store = PersistenceStore::open_in_memory().unwrap();
        let run_id = store.get_or_create_run("com.example.app", None).await.unwrap();
        let manager = ScreenStateManager::new(&store, "/tmp/hermitcrawl-test-session", 50);

        let candidate = CandidateScreen {
            composite_hash: "deadbeef".into(),
            activity: "com.example.app/.MainActivity".into(),
            sanitized: fingerprint::parse_accessibility_xml("", 50),
            screenshot_png: None,
            screenshot_blocked: true,
            proposed_screenshot_path: "/tmp/hermitcrawl-test-session/screens/deadbeef.png".into(),
            proposed_xml_path: "/tmp/hermitcrawl-test-session/screens/deadbeef.xml".into(),
            proposed_ocr_path: "/tmp/hermitcrawl-test-session/screens/deadbeef.ocr.json".into(),
            ocr_results: Vec::new(),
        };

        let result = manager.process_and_record_state(&candidate, run_id, 1, true).await.unwrap();
        assert!(result.is_new);
        assert_eq!(result.visit_count_this_run, 1);

        let result2 = manager.process_and_record_state(&candidate, run_id, 2, true).await.unwrap();
        assert_eq!(result2.screen_id, result.screen_id);
        assert_eq!(result2.visit_count_this_run, 2);
        let _ = std::fs::remove_dir_all("/tmp/hermitcrawl-test-session");
    }

    // Silence unused-import warning for AdbDeviceClient in non-device test builds.
    #[allow(dead_code)]
    fn _type_check(_c: &dyn DeviceClient) {}
    #[allow(dead_code)]
    fn _concrete() -> AdbDeviceClient { AdbDeviceClient::new(None, 1) }
}

//! OCR (§4.6's optional visual-text pass): a narrow interface deliberately
//! kept out of this crate's scope, the same way image preprocessing is
//! consumed through `DeviceClient` rather than implemented inline. Any text
//! recognizer can be plugged in by implementing `OcrProvider`; the default
//! wired by `main` is a no-op so `ocr_enabled = true` without a real backend
//! degrades to "no OCR block in the prompt" rather than a hard error.

use crate::model::parser::OcrResult;
use async_trait::async_trait;

#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Recognizes text regions in a PNG screenshot. Errors are treated as
    /// "no OCR this step" by callers, never as a fatal crawl error.
    async fn recognize(&self, screenshot_png: &[u8]) -> anyhow::Result<Vec<OcrResult>>;
}

/// Always returns no hits. Used when `ocr_enabled` is false or no provider
/// is configured; keeps the OCR code path exercised without a dependency on
/// an actual recognition backend.
pub struct NullOcrProvider;

#[async_trait]
impl OcrProvider for NullOcrProvider {
    async fn recognize(&self, _screenshot_png: &[u8]) -> anyhow::Result<Vec<OcrResult>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_provider_returns_no_hits() {
        let provider = NullOcrProvider;
        let hits = provider.recognize(&[1, 2, 3]).await.unwrap();
        assert!(hits.is_empty());
    }
}

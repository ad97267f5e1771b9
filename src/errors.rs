//! Error taxonomy for the crawl loop.
//!
//! Most subsystems return `anyhow::Result` for day-to-day I/O failures; this
//! enum exists only where the loop needs to distinguish *fatal* errors
//! (terminate the run) from *recoverable* ones (record, feed back to the
//! LLM, keep going).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("device session error: {0}")]
    Session(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("gesture failed: {0}")]
    GestureFailed(String),

    #[error("AI error: {0}")]
    Ai(String),

    #[error("app context mismatch: {0}")]
    ContextMismatch(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<crate::persistence::store::StoreError> for CrawlError {
    fn from(e: crate::persistence::store::StoreError) -> Self {
        CrawlError::Persistence(e.to_string())
    }
}

impl CrawlError {
    /// Session and configuration errors terminate the loop; everything else
    /// is recoverable and should be folded into step feedback.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CrawlError::Config(_) | CrawlError::Session(_))
    }
}

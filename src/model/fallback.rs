//! Provider fallback chain: classifies LLM transport errors and walks an
//! ordered list of backup providers, matching §4.9's "transient errors are
//! retried per adapter policy; persistent errors surface to the loop."

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub backend: String,
    pub model: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub vision_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub fallback_on_rate_limit: bool,
    #[serde(default = "default_true")]
    pub fallback_on_auth_error: bool,
    #[serde(default = "default_true")]
    pub fallback_on_timeout: bool,
    #[serde(default = "default_cooldown")]
    pub fallback_cooldown_secs: u64,
    #[serde(default)]
    pub fallbacks: Vec<ProviderConfig>,
}

fn default_true() -> bool { true }
fn default_cooldown() -> u64 { 60 }

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            fallback_on_rate_limit: true,
            fallback_on_auth_error: true,
            fallback_on_timeout: true,
            fallback_cooldown_secs: 60,
            fallbacks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    RateLimit,
    AuthError,
    Timeout,
    ServerError,
    ClientError,
    NetworkError,
    Unknown,
}

impl ErrorClass {
    pub fn classify(error: &str) -> Self {
        let lower = error.to_lowercase();
        if lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("rate_limit")
            || lower.contains("too many requests")
            || lower.contains("quota exceeded")
        {
            return Self::RateLimit;
        }
        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("invalid api key")
            || lower.contains("authentication")
        {
            return Self::AuthError;
        }
        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline exceeded") {
            return Self::Timeout;
        }
        if lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
            || lower.contains("internal server error")
            || lower.contains("bad gateway")
            || lower.contains("overloaded")
        {
            return Self::ServerError;
        }
        if lower.contains("400") || lower.contains("invalid request") || lower.contains("model not found") {
            return Self::ClientError;
        }
        if lower.contains("connection refused") || lower.contains("dns") || lower.contains("unreachable") {
            return Self::NetworkError;
        }
        Self::Unknown
    }

    pub fn should_fallback(&self, config: &FallbackConfig) -> bool {
        match self {
            Self::RateLimit => config.fallback_on_rate_limit,
            Self::AuthError => config.fallback_on_auth_error,
            Self::Timeout => config.fallback_on_timeout,
            Self::ServerError | Self::NetworkError => true,
            Self::ClientError | Self::Unknown => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FallbackManager {
    config: FallbackConfig,
    primary: ProviderConfig,
    cooldowns: Vec<(String, Instant)>,
    current_index: i32,
    total_fallbacks: u32,
}

impl FallbackManager {
    pub fn new(primary: ProviderConfig, config: FallbackConfig) -> Self {
        Self { config, primary, cooldowns: Vec::new(), current_index: -1, total_fallbacks: 0 }
    }

    pub fn active_model(&self) -> &ProviderConfig {
        if self.current_index < 0 {
            &self.primary
        } else {
            self.config.fallbacks.get(self.current_index as usize).unwrap_or(&self.primary)
        }
    }

    pub fn report_success(&mut self) {
        let active = self.active_model();
        tracing::debug!("model success: {}/{}", active.backend, active.model);
    }

    pub fn report_failure(&mut self, error: &str) -> Option<ProviderConfig> {
        let error_class = ErrorClass::classify(error);
        if !error_class.should_fallback(&self.config) {
            warn!("error class {:?} not eligible for fallback", error_class);
            return None;
        }
        let current = self.active_model().clone();
        let key = format!("{}/{}", current.backend, current.model);
        info!("model {}/{} failed ({:?}), cooling down {}s", current.backend, current.model, error_class, self.config.fallback_cooldown_secs);
        self.cooldowns.push((key, Instant::now()));
        self.advance_to_next()
    }

    pub fn check_primary_recovery(&mut self) {
        if self.current_index < 0 {
            return;
        }
        let primary_key = format!("{}/{}", self.primary.backend, self.primary.model);
        let cooldown = Duration::from_secs(self.config.fallback_cooldown_secs);
        let ready = self
            .cooldowns
            .iter()
            .find(|(k, _)| k == &primary_key)
            .map(|(_, when)| when.elapsed() >= cooldown)
            .unwrap_or(true);
        if ready {
            info!("primary {}/{} cooldown expired, switching back", self.primary.backend, self.primary.model);
            self.current_index = -1;
            self.cooldowns.retain(|(k, _)| k != &primary_key);
        }
    }

    pub fn has_fallbacks(&self) -> bool {
        !self.config.fallbacks.is_empty()
    }

    fn advance_to_next(&mut self) -> Option<ProviderConfig> {
        let cooldown = Duration::from_secs(self.config.fallback_cooldown_secs);
        let start = if self.current_index < 0 { 0 } else { (self.current_index + 1) as usize };
        for i in start..self.config.fallbacks.len() {
            let candidate = &self.config.fallbacks[i];
            let key = format!("{}/{}", candidate.backend, candidate.model);
            let on_cooldown = self
                .cooldowns
                .iter()
                .find(|(k, _)| k == &key)
                .map(|(_, when)| when.elapsed() < cooldown)
                .unwrap_or(false);
            if !on_cooldown {
                self.current_index = i as i32;
                self.total_fallbacks += 1;
                info!("falling back to {}/{} (#{})", candidate.backend, candidate.model, i + 1);
                return Some(candidate.clone());
            }
        }
        let primary_key = format!("{}/{}", self.primary.backend, self.primary.model);
        let primary_ready = self
            .cooldowns
            .iter()
            .find(|(k, _)| k == &primary_key)
            .map(|(_, when)| when.elapsed() >= cooldown)
            .unwrap_or(true);
        if primary_ready && self.current_index >= 0 {
            self.current_index = -1;
            info!("all fallbacks exhausted or cooling down, retrying primary");
            return Some(self.primary.clone());
        }
        error!("all providers exhausted (primary + {} fallbacks)", self.config.fallbacks.len());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_primary() -> ProviderConfig {
        ProviderConfig { backend: "openai".into(), model: "gpt-4o".into(), endpoint: "https://api.openai.com/v1".into(), api_key: "sk-test".into(), vision_enabled: true }
    }

    fn test_fallbacks() -> Vec<ProviderConfig> {
        vec![
            ProviderConfig { backend: "groq".into(), model: "llama-3.3-70b-versatile".into(), endpoint: "https://api.groq.com/openai/v1".into(), api_key: "gsk-test".into(), vision_enabled: false },
            ProviderConfig { backend: "ollama".into(), model: "llama3.2".into(), endpoint: "http://localhost:11434/v1".into(), api_key: String::new(), vision_enabled: false },
        ]
    }

    #[test]
    fn classifies_common_errors() {
        assert_eq!(ErrorClass::classify("HTTP 429 Too Many Requests"), ErrorClass::RateLimit);
        assert_eq!(ErrorClass::classify("HTTP 401 Unauthorized"), ErrorClass::AuthError);
        assert_eq!(ErrorClass::classify("request timed out after 30s"), ErrorClass::Timeout);
        assert_eq!(ErrorClass::classify("HTTP 500 Internal Server Error"), ErrorClass::ServerError);
        assert_eq!(ErrorClass::classify("HTTP 400 model not found"), ErrorClass::ClientError);
        assert_eq!(ErrorClass::classify("something weird happened"), ErrorClass::Unknown);
    }

    #[test]
    fn walks_fallback_chain_in_order() {
        let config = FallbackConfig { fallbacks: test_fallbacks(), fallback_cooldown_secs: 1, ..Default::default() };
        let mut mgr = FallbackManager::new(test_primary(), config);
        assert_eq!(mgr.active_model().backend, "openai");
        let next = mgr.report_failure("HTTP 429 rate limit").unwrap();
        assert_eq!(next.backend, "groq");
        let next = mgr.report_failure("HTTP 429 too many requests").unwrap();
        assert_eq!(next.backend, "ollama");
    }

    #[test]
    fn client_errors_never_fallback() {
        let config = FallbackConfig { fallbacks: test_fallbacks(), ..Default::default() };
        let mut mgr = FallbackManager::new(test_primary(), config);
        assert!(mgr.report_failure("HTTP 400 model not found").is_none());
        assert_eq!(mgr.active_model().backend, "openai");
    }
}

//! ModelAdapter (§4.9): a common contract across LLM providers. Each
//! provider declares capabilities so the core can decide whether to include
//! a screenshot at all, and silently drops images that would exceed the
//! provider's payload budget.

pub mod fallback;
pub mod parser;

use crate::config::ModelConfig as ModelSettings;
use async_trait::async_trait;
use fallback::{FallbackConfig, FallbackManager, ProviderConfig};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supports_image: bool,
    pub max_payload_bytes: usize,
    pub max_input_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub usage: Usage,
    /// Set when the adapter dropped a supplied image due to payload limits.
    pub image_dropped: bool,
}

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn capabilities(&self) -> Capabilities;
    async fn generate_response(&self, prompt: &str, image_png: Option<&[u8]>) -> anyhow::Result<GenerationResult>;
}

/// Decides, given provider capabilities and an optional captured screenshot,
/// whether to actually attach the image to the request.
pub fn should_attach_image(caps: &Capabilities, image_png: Option<&[u8]>) -> Option<&[u8]> {
    let bytes = image_png?;
    if !caps.supports_image {
        return None;
    }
    if bytes.len() > caps.max_payload_bytes {
        warn!(
            "screenshot ({} bytes) exceeds provider payload limit ({} bytes), sending text-only",
            bytes.len(),
            caps.max_payload_bytes
        );
        return None;
    }
    Some(bytes)
}

const DEFAULT_MAX_PAYLOAD_BYTES: usize = 20 * 1024 * 1024;

/// HTTP adapter covering the two wire shapes the corpus actually speaks:
/// Ollama's `/api/generate` and the OpenAI-compatible `/chat/completions`
/// shape shared by most cloud and local-server backends.
pub struct HttpModelAdapter {
    client: reqwest::Client,
    settings: ModelSettings,
    fallback_mgr: tokio::sync::Mutex<Option<FallbackManager>>,
}

impl HttpModelAdapter {
    pub fn new(settings: ModelSettings, fallbacks: Vec<ProviderConfig>, fallback_config: FallbackConfig) -> Self {
        let fallback_mgr = if fallbacks.is_empty() {
            None
        } else {
            let primary = ProviderConfig {
                backend: settings.backend.clone(),
                model: settings.model.clone(),
                endpoint: settings.endpoint.clone(),
                api_key: settings.api_key.clone().unwrap_or_default(),
                vision_enabled: settings.vision_enabled,
            };
            Some(FallbackManager::new(primary, FallbackConfig { fallbacks, ..fallback_config }))
        };
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(settings.request_timeout_secs))
                .build()
                .unwrap_or_default(),
            settings,
            fallback_mgr: tokio::sync::Mutex::new(fallback_mgr),
        }
    }

    async fn active_provider(&self) -> ProviderConfig {
        let mut guard = self.fallback_mgr.lock().await;
        if let Some(mgr) = guard.as_mut() {
            mgr.check_primary_recovery();
            mgr.active_model().clone()
        } else {
            ProviderConfig {
                backend: self.settings.backend.clone(),
                model: self.settings.model.clone(),
                endpoint: self.settings.endpoint.clone(),
                api_key: self.settings.api_key.clone().unwrap_or_default(),
                vision_enabled: self.settings.vision_enabled,
            }
        }
    }

    async fn report_failure(&self, error: &str) {
        let mut guard = self.fallback_mgr.lock().await;
        if let Some(mgr) = guard.as_mut() {
            mgr.report_failure(error);
        }
    }

    async fn report_success(&self) {
        let mut guard = self.fallback_mgr.lock().await;
        if let Some(mgr) = guard.as_mut() {
            mgr.report_success();
        }
    }

    async fn call_ollama(&self, provider: &ProviderConfig, prompt: &str, image_b64: Option<&str>) -> anyhow::Result<String> {
        let url = format!("{}/api/generate", provider.endpoint);
        let mut body = serde_json::json!({
            "model": provider.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": self.settings.temperature, "num_predict": self.settings.max_tokens },
        });
        if let Some(img) = image_b64 {
            body["images"] = serde_json::json!([img]);
        }
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("ollama error {}: {}", resp.status(), resp.text().await.unwrap_or_default());
        }
        let result: serde_json::Value = resp.json().await?;
        Ok(result["response"].as_str().unwrap_or("").to_string())
    }

    async fn call_openai_compat(&self, provider: &ProviderConfig, prompt: &str, image_b64: Option<&str>) -> anyhow::Result<(String, u32)> {
        let url = format!("{}/chat/completions", provider.endpoint);
        let user_content = if let Some(img) = image_b64 {
            serde_json::json!([
                {"type": "text", "text": prompt},
                {"type": "image_url", "image_url": {"url": format!("data:image/png;base64,{}", img)}},
            ])
        } else {
            serde_json::json!(prompt)
        };
        let body = serde_json::json!({
            "model": provider.model,
            "messages": [{"role": "user", "content": user_content}],
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
        });
        let mut req = self.client.post(&url).json(&body);
        if !provider.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", provider.api_key));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("LLM API error {}: {}", resp.status(), resp.text().await.unwrap_or_default());
        }
        let result: serde_json::Value = resp.json().await?;
        let text = result["choices"][0]["message"]["content"].as_str().unwrap_or("").to_string();
        let tokens = result["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32;
        Ok((text, tokens))
    }
}

#[async_trait]
impl ModelAdapter for HttpModelAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_image: self.settings.vision_enabled && self.settings.backend != "cloud_text",
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_input_tokens: 128_000,
        }
    }

    async fn generate_response(&self, prompt: &str, image_png: Option<&[u8]>) -> anyhow::Result<GenerationResult> {
        let caps = self.capabilities();
        let attached = should_attach_image(&caps, image_png);
        let image_dropped = image_png.is_some() && attached.is_none();
        let image_b64 = attached.map(|bytes| base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes));

        let provider = self.active_provider().await;
        debug!("generating via {}/{}", provider.backend, provider.model);

        let result = if provider.backend == "ollama" {
            self.call_ollama(&provider, prompt, image_b64.as_deref()).await.map(|text| (text, 0))
        } else {
            self.call_openai_compat(&provider, prompt, image_b64.as_deref()).await
        };

        match result {
            Ok((text, tokens)) => {
                self.report_success().await;
                Ok(GenerationResult { text, usage: Usage { total_tokens: tokens }, image_dropped })
            }
            Err(e) => {
                self.report_failure(&e.to_string()).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_dropped_when_provider_lacks_vision() {
        let caps = Capabilities { supports_image: false, max_payload_bytes: 1024, max_input_tokens: 1000 };
        assert!(should_attach_image(&caps, Some(&[0u8; 10])).is_none());
    }

    #[test]
    fn image_dropped_when_over_payload_limit() {
        let caps = Capabilities { supports_image: true, max_payload_bytes: 4, max_input_tokens: 1000 };
        assert!(should_attach_image(&caps, Some(&[0u8; 10])).is_none());
    }

    #[test]
    fn image_attached_when_within_limits() {
        let caps = Capabilities { supports_image: true, max_payload_bytes: 1024, max_input_tokens: 1000 };
        assert!(should_attach_image(&caps, Some(&[0u8; 10])).is_some());
    }
}

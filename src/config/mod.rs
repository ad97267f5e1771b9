use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub model: ModelConfig,
    pub device: DeviceConfig,
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub flags: FlagsConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub target_package: String,
    #[serde(default)]
    pub entry_activity: Option<String>,
    #[serde(default = "default_persistence_path")]
    pub persistence_path: String,
    #[serde(default = "default_session_dir")]
    pub session_dir: String,
}

fn default_persistence_path() -> String { "./crawl_runs.db".into() }
fn default_session_dir() -> String { "./sessions".into() }

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// "cloud_multimodal", "cloud_text", "local"
    pub backend: String,
    pub model: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub vision_enabled: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
}

fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.4 }
fn default_request_timeout() -> u64 { 60 }
fn default_llm_retries() -> u32 { 3 }

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// "adb" or "webdriver"
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub adb_device: Option<String>,
    #[serde(default = "default_max_session_retries")]
    pub max_session_retries: u32,
    #[serde(default = "default_implicit_wait_ms")]
    pub implicit_wait_ms: u64,
    /// Off, Fallback, Always — mirrors ScreenFingerprinter's vision strategy
    #[serde(default = "default_vision_mode")]
    pub vision_mode: String,
}

fn default_transport() -> String { "adb".into() }
fn default_max_session_retries() -> u32 { 3 }
fn default_implicit_wait_ms() -> u64 { 5000 }
fn default_vision_mode() -> String { "fallback".into() }

/// Which termination cap governs the run: a fixed step budget or a wall-clock
/// budget. Both fields are still parsed so switching modes needs no other edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlMode {
    Steps,
    Time,
}

impl Default for CrawlMode {
    fn default() -> Self {
        CrawlMode::Steps
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlConfig {
    #[serde(default)]
    pub mode: CrawlMode,
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: u64,
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
    #[serde(default = "default_wait_between_actions")]
    pub wait_between_actions_ms: u64,
    #[serde(default)]
    pub stop_on_action_error: bool,
    #[serde(default = "default_true")]
    pub ocr_enabled: bool,
    /// Stuck-detector thresholds (§4.2 Open Question: preserve original defaults)
    #[serde(default = "default_stuck_visit_threshold")]
    pub stuck_visit_threshold: u32,
    #[serde(default = "default_stuck_same_screen_threshold")]
    pub stuck_same_screen_threshold: u32,
    #[serde(default = "default_stuck_history_window")]
    pub stuck_history_window: usize,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub signup_test_email: Option<String>,
    #[serde(default)]
    pub signup_test_password: Option<String>,
    #[serde(default)]
    pub signup_test_name: Option<String>,
    /// Extra packages (beyond the target) that are expected to take the
    /// foreground legitimately — share sheets, file pickers the app itself
    /// launched. Empty means ContextBuilder falls back to its built-in list.
    #[serde(default)]
    pub allowed_external_packages: Vec<String>,
    /// Soft character budget communicated to the model for exploration_journal;
    /// the model is responsible for self-compressing, the loop never truncates.
    #[serde(default = "default_journal_max_chars")]
    pub journal_max_chars: usize,
    /// Reserved for a future perceptual-similarity screen match; composite_hash
    /// is an exact digest today, so this threshold is unused by any comparison.
    #[serde(default = "default_visual_similarity_threshold")]
    pub visual_similarity_threshold: f32,
}

fn default_max_steps() -> u64 { 200 }
fn default_max_duration() -> u64 { 3600 }
fn default_max_elements() -> usize { 50 }
fn default_wait_between_actions() -> u64 { 300 }
fn default_stuck_visit_threshold() -> u32 { 5 }
fn default_stuck_same_screen_threshold() -> u32 { 3 }
fn default_stuck_history_window() -> usize { 5 }
fn default_journal_max_chars() -> usize { 4000 }
fn default_visual_similarity_threshold() -> f32 { 0.9 }

fn default_true() -> bool { true }

#[derive(Debug, Clone, Deserialize)]
pub struct FlagsConfig {
    #[serde(default = "crate::flags::flag_dir_default")]
    pub dir: std::path::PathBuf,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self { dir: crate::flags::flag_dir_default() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    #[serde(default = "default_credentials_path")]
    pub db_path: String,
}

fn default_credentials_path() -> String { "./credentials.db".into() }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: "local".into(),
            model: String::new(),
            endpoint: String::new(),
            api_key: None,
            vision_enabled: true,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_llm_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 8420 }

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_run_start: Option<String>,
    #[serde(default)]
    pub on_run_finish: Option<String>,
    #[serde(default)]
    pub on_stuck: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let toml = r#"
[agent]
name = "crawler"
target_package = "com.example.app"

[model]
backend = "cloud_multimodal"
model = "gpt-4o"
endpoint = "https://api.example.com/v1"

[device]

[crawl]
"#;
        let parsed: Config = toml::from_str(toml).unwrap();
        assert_eq!(parsed.agent.target_package, "com.example.app");
        assert_eq!(parsed.crawl.max_steps, default_max_steps());
        assert_eq!(parsed.crawl.stuck_visit_threshold, 5);
        assert_eq!(parsed.device.vision_mode, "fallback");
    }
}

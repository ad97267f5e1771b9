//! LifecycleHooks: optional shell commands fired at run start/finish and on
//! stuck-detection, for traffic capture, screen recording, or any other
//! side-channel tooling the crawl loop itself has no opinion about.
//!
//! Each hook is a single configured command line; arguments are passed via
//! environment variables rather than interpolated into the command string,
//! so a stray value can never break shell quoting.

use crate::config::HooksConfig;
use tokio::process::Command;
use tracing::warn;

pub struct LifecycleHooks {
    config: HooksConfig,
}

impl LifecycleHooks {
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }

    pub async fn on_run_start(&self, run_id: i64, target_package: &str) {
        if let Some(cmd) = &self.config.on_run_start {
            run_hook(cmd, &[("HERMITCRAWL_RUN_ID", run_id.to_string()), ("HERMITCRAWL_TARGET_PACKAGE", target_package.to_string())]).await;
        }
    }

    pub async fn on_run_finish(&self, run_id: i64, status: &str) {
        if let Some(cmd) = &self.config.on_run_finish {
            run_hook(cmd, &[("HERMITCRAWL_RUN_ID", run_id.to_string()), ("HERMITCRAWL_STATUS", status.to_string())]).await;
        }
    }

    pub async fn on_stuck(&self, run_id: i64, step: i64, reason: &str) {
        if let Some(cmd) = &self.config.on_stuck {
            run_hook(
                cmd,
                &[
                    ("HERMITCRAWL_RUN_ID", run_id.to_string()),
                    ("HERMITCRAWL_STEP", step.to_string()),
                    ("HERMITCRAWL_STUCK_REASON", reason.to_string()),
                ],
            )
            .await;
        }
    }
}

async fn run_hook(command_line: &str, env: &[(&str, String)]) {
    let mut parts = command_line.split_whitespace();
    let Some(program) = parts.next() else { return };
    let mut cmd = Command::new(program);
    cmd.args(parts);
    for (key, value) in env {
        cmd.env(key, value);
    }
    match cmd.status().await {
        Ok(status) if !status.success() => warn!("hook `{command_line}` exited with {status}"),
        Err(e) => warn!("failed to spawn hook `{command_line}`: {e}"),
        Ok(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_hooks_do_nothing() {
        let hooks = LifecycleHooks::new(HooksConfig::default());
        hooks.on_run_start(1, "com.example").await;
        hooks.on_run_finish(1, "COMPLETED").await;
        hooks.on_stuck(1, 3, "high visit count").await;
    }

    #[tokio::test]
    async fn runs_configured_command() {
        let hooks = LifecycleHooks::new(HooksConfig {
            on_run_start: Some("true".to_string()),
            on_run_finish: None,
            on_stuck: None,
        });
        hooks.on_run_start(1, "com.example").await;
    }
}

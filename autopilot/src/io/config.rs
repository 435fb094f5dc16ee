//! Control-plane configuration stored at `<state root>/config.toml`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::BudgetLimits;
use crate::core::loops::LoopLimits;
use crate::core::trust::TrustPolicy;
use crate::io::atomic::write_atomic;

pub const STATE_ROOT_ENV: &str = "AUTOPILOT_HOME";
pub const CONFIG_FILE: &str = "config.toml";

/// Autopilot configuration (TOML).
///
/// Every section defaults independently, so a partial file only overrides
/// what it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutopilotConfig {
    pub budget: BudgetLimits,
    pub trust: TrustPolicy,
    pub loops: LoopLimits,
    pub harness: HarnessConfig,
    pub learning: LearningConfig,
    pub idle: IdleConfig,
    pub router: RouterConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Failed implement attempts before a feature is blocked.
    pub max_feature_attempts: u32,
    /// Failed batch test runs before every implemented feature is blocked.
    pub max_test_attempts: u32,
    pub precedent_limit: usize,
    /// Rendered prompts are cut to this many bytes.
    pub prompt_budget_bytes: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_feature_attempts: 3,
            max_test_attempts: 3,
            precedent_limit: 3,
            prompt_budget_bytes: 40_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LearningConfig {
    pub initial_confidence: f64,
    /// Occurrences at which a learning also becomes a skill candidate.
    pub skill_threshold: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            initial_confidence: 0.7,
            skill_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdleConfig {
    pub inactivity_timeout_secs: u64,
    pub tick_secs: u64,
    pub decay_factor: f64,
    pub decay_floor: f64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 600,
            tick_secs: 10,
            decay_factor: 0.8,
            decay_floor: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    pub cloud_model: String,
    pub local_model: String,
    pub classifier_model: String,
    pub cloud_usd_per_1k_tokens: f64,
    pub local_usd_per_1k_tokens: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cloud_model: "cloud-large".to_string(),
            local_model: "local-small".to_string(),
            classifier_model: "on-device-classifier".to_string(),
            cloud_usd_per_1k_tokens: 0.015,
            local_usd_per_1k_tokens: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI argv; the prompt is written to its stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            timeout_secs: 30 * 60,
            output_limit_bytes: 200_000,
        }
    }
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<()> {
        let budget = &self.budget;
        if !(budget.session_cap_usd > 0.0) || !(budget.daily_cap_usd > 0.0) {
            return Err(anyhow!("budget caps must be > 0"));
        }
        if budget.max_turns_per_task == 0 {
            return Err(anyhow!("budget.max_turns_per_task must be > 0"));
        }
        if self.trust.promotion_streak == 0 || self.trust.demotion_rollbacks == 0 {
            return Err(anyhow!("trust thresholds must be > 0"));
        }
        if self.loops.max_iterations == 0 || self.loops.repeat_window < 2 {
            return Err(anyhow!(
                "loops.max_iterations must be > 0 and loops.repeat_window >= 2"
            ));
        }
        if self.harness.max_feature_attempts == 0 || self.harness.max_test_attempts == 0 {
            return Err(anyhow!("harness attempt limits must be > 0"));
        }
        if self.harness.prompt_budget_bytes == 0 {
            return Err(anyhow!("harness.prompt_budget_bytes must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.learning.initial_confidence) {
            return Err(anyhow!("learning.initial_confidence must be within [0, 1]"));
        }
        if self.learning.skill_threshold == 0 {
            return Err(anyhow!("learning.skill_threshold must be > 0"));
        }
        if self.idle.tick_secs == 0 {
            return Err(anyhow!("idle.tick_secs must be > 0"));
        }
        if !(self.idle.decay_factor > 0.0 && self.idle.decay_factor < 1.0) {
            return Err(anyhow!("idle.decay_factor must be within (0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.idle.decay_floor) {
            return Err(anyhow!("idle.decay_floor must be within [0, 1]"));
        }
        if self.router.cloud_usd_per_1k_tokens < 0.0 || self.router.local_usd_per_1k_tokens < 0.0 {
            return Err(anyhow!("router prices must be >= 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 || self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.timeout_secs and agent.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// `$AUTOPILOT_HOME`, else `~/.autopilot`, else `./.autopilot`.
pub fn default_state_root() -> PathBuf {
    if let Some(root) = env::var_os(STATE_ROOT_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(root);
    }
    match env::var_os("HOME").filter(|v| !v.is_empty()) {
        Some(home) => PathBuf::from(home).join(".autopilot"),
        None => PathBuf::from(".autopilot"),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutopilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutopilotConfig> {
    if !path.exists() {
        let cfg = AutopilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutopilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutopilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Per-tier overrides. Any field left unset by the environment falls back
/// to the shared defaults on `Config` (allowed tools, disallowed tools).
#[derive(Debug, Clone)]
pub struct TierConfig {
    pub model: String,
    pub prompt_path: PathBuf,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
}

/// Process-wide configuration, resolved once at startup from the
/// environment (optionally seeded by a `.env` file via `dotenvy`).
#[derive(Debug, Clone)]
pub struct Config {
    pub interval: Duration,
    pub max_tier: u32,
    pub tier1: TierConfig,
    pub tier2: TierConfig,
    pub tier3: TierConfig,
    pub results_dir: PathBuf,
    pub state_dir: PathBuf,
    pub repos_dir: PathBuf,
    pub dry_run: bool,
    pub notify_url: Option<String>,
    pub summarizer_model: String,
    pub memory_budget_chars: usize,
    pub memory_grace_days: i64,
    pub memory_decay_rate: f64,
    pub chat_bearer_token: Option<String>,
    pub webhook_model: Option<String>,
    pub browser_allowlist: Vec<String>,
    pub port: u16,
    pub shutdown_grace: Duration,
    pub tier_timeout: Duration,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_string(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_string(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_string(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_string(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    env_string(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn tier_config(n: u32, default_model: &str, shared_allowed: &[String], shared_disallowed: &[String]) -> TierConfig {
    let prefix = format!("CLAUDE_OPS_TIER{n}");
    TierConfig {
        model: env_string(&format!("{prefix}_MODEL")).unwrap_or_else(|| default_model.to_string()),
        prompt_path: env_string(&format!("{prefix}_PROMPT"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("prompts/tier{n}.md"))),
        allowed_tools: {
            let v = env_list(&format!("{prefix}_ALLOWED_TOOLS"));
            if v.is_empty() { shared_allowed.to_vec() } else { v }
        },
        disallowed_tools: {
            let v = env_list(&format!("{prefix}_DISALLOWED_TOOLS"));
            if v.is_empty() { shared_disallowed.to_vec() } else { v }
        },
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let shared_allowed = env_list("CLAUDE_OPS_ALLOWED_TOOLS");
        let shared_disallowed = env_list("CLAUDE_OPS_DISALLOWED_TOOLS");

        let state_dir = env_string("CLAUDE_OPS_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_base_dir().join("state"));
        let results_dir = env_string("CLAUDE_OPS_RESULTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_base_dir().join("results"));
        let repos_dir = env_string("CLAUDE_OPS_REPOS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_base_dir().join("repos"));

        for dir in [&state_dir, &results_dir, &repos_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }

        let max_tier = env_u32("CLAUDE_OPS_MAX_TIER", 3).clamp(1, 3);

        Ok(Config {
            interval: Duration::from_secs(env_u64("CLAUDE_OPS_INTERVAL_SECS", 300)),
            max_tier,
            tier1: tier_config(1, "claude-haiku-4-5", &shared_allowed, &shared_disallowed),
            tier2: tier_config(2, "claude-sonnet-4-5", &shared_allowed, &shared_disallowed),
            tier3: tier_config(3, "claude-opus-4-1", &shared_allowed, &shared_disallowed),
            results_dir,
            state_dir,
            repos_dir,
            dry_run: env_bool("CLAUDE_OPS_DRY_RUN", false),
            notify_url: env_string("CLAUDE_OPS_NOTIFY_URL"),
            summarizer_model: env_string("CLAUDE_OPS_SUMMARIZER_MODEL")
                .unwrap_or_else(|| "claude-haiku-4-5".to_string()),
            memory_budget_chars: env_u32("CLAUDE_OPS_MEMORY_BUDGET_CHARS", 8000) as usize,
            memory_grace_days: env_u32("CLAUDE_OPS_MEMORY_GRACE_DAYS", 30) as i64,
            memory_decay_rate: env_f64("CLAUDE_OPS_MEMORY_DECAY_RATE", 0.1),
            chat_bearer_token: env_string("CLAUDE_OPS_CHAT_BEARER_TOKEN"),
            webhook_model: env_string("CLAUDE_OPS_WEBHOOK_MODEL"),
            browser_allowlist: env_list("CLAUDE_OPS_BROWSER_ALLOWLIST"),
            port: env_u32("CLAUDE_OPS_PORT", 8081) as u16,
            shutdown_grace: Duration::from_secs(env_u64("CLAUDE_OPS_SHUTDOWN_GRACE_SECS", 30)),
            tier_timeout: Duration::from_secs(env_u64("CLAUDE_OPS_TIER_TIMEOUT_SECS", 15 * 60)),
        })
    }

    pub fn tier(&self, n: u32) -> &TierConfig {
        match n {
            1 => &self.tier1,
            2 => &self.tier2,
            _ => &self.tier3,
        }
    }

    pub fn handoff_path(&self) -> PathBuf {
        self.state_dir.join("handoff.json")
    }

    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join("claude-ops.sqlite3")
    }
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-ops")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests mutate process-global state, so serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "CLAUDE_OPS_INTERVAL_SECS",
            "CLAUDE_OPS_MAX_TIER",
            "CLAUDE_OPS_STATE_DIR",
            "CLAUDE_OPS_RESULTS_DIR",
            "CLAUDE_OPS_REPOS_DIR",
            "CLAUDE_OPS_DRY_RUN",
            "CLAUDE_OPS_TIER1_MODEL",
            "CLAUDE_OPS_TIER1_ALLOWED_TOOLS",
            "CLAUDE_OPS_ALLOWED_TOOLS",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("CLAUDE_OPS_STATE_DIR", dir.path().join("state")) };
        unsafe { std::env::set_var("CLAUDE_OPS_RESULTS_DIR", dir.path().join("results")) };
        unsafe { std::env::set_var("CLAUDE_OPS_REPOS_DIR", dir.path().join("repos")) };

        let config = Config::from_env().unwrap();
        assert_eq!(config.max_tier, 3);
        assert_eq!(config.interval, Duration::from_secs(300));
        assert!(!config.dry_run);
        clear_all();
    }

    #[test]
    fn max_tier_is_clamped() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("CLAUDE_OPS_STATE_DIR", dir.path().join("state")) };
        unsafe { std::env::set_var("CLAUDE_OPS_RESULTS_DIR", dir.path().join("results")) };
        unsafe { std::env::set_var("CLAUDE_OPS_REPOS_DIR", dir.path().join("repos")) };
        unsafe { std::env::set_var("CLAUDE_OPS_MAX_TIER", "7") };

        let config = Config::from_env().unwrap();
        assert_eq!(config.max_tier, 3);
        clear_all();
    }

    #[test]
    fn per_tier_tools_fall_back_to_shared() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("CLAUDE_OPS_STATE_DIR", dir.path().join("state")) };
        unsafe { std::env::set_var("CLAUDE_OPS_RESULTS_DIR", dir.path().join("results")) };
        unsafe { std::env::set_var("CLAUDE_OPS_REPOS_DIR", dir.path().join("repos")) };
        unsafe { std::env::set_var("CLAUDE_OPS_ALLOWED_TOOLS", "Read,Bash") };

        let config = Config::from_env().unwrap();
        assert_eq!(config.tier1.allowed_tools, vec!["Read", "Bash"]);
        assert_eq!(config.tier2.allowed_tools, vec!["Read", "Bash"]);
        clear_all();
    }
}

//! Spawns a single LLM subprocess for one escalation tier, drives its
//! stream through the Redactor and Stream Parser, fans output to the
//! Hub, and finalizes the session row.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::handoff::ValidatedHandoff;
use crate::hub::SharedHub;
use crate::memory::MemoryEngine;
use crate::redact::Redactor;
use crate::store::{
    EventLevel, NewCooldownAction, NewEvent, NewSession, SessionStatus, Store, Trigger,
};
use crate::stream_parser::{self, Marker, ParsedRecord};
use crate::summarizer::Summarizer;

const TERMINATE_GRACE: Duration = Duration::from_secs(10);

pub struct TierInvocation {
    pub tier: u32,
    pub trigger: Trigger,
    pub parent_session_id: Option<i64>,
    pub custom_prompt: Option<String>,
    pub inbound_handoff: Option<ValidatedHandoff>,
}

pub struct TierOutcome {
    pub session_id: i64,
    pub status: SessionStatus,
}

pub struct TierRunner {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    hub: SharedHub,
    memory: Arc<MemoryEngine>,
    summarizer: Arc<Summarizer>,
}

impl TierRunner {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        hub: SharedHub,
        memory: Arc<MemoryEngine>,
        summarizer: Arc<Summarizer>,
    ) -> Self {
        Self { config, store, hub, memory, summarizer }
    }

    pub async fn run_tier(&self, invocation: TierInvocation, cancel: CancellationToken) -> Result<TierOutcome> {
        let tier_cfg = self.config.tier(invocation.tier);

        let mut system_prompt_extension = String::new();

        let memory_context = self.memory.build_context(200).await.unwrap_or_default();
        if !memory_context.is_empty() {
            system_prompt_extension.push_str(&memory_context);
            system_prompt_extension.push('\n');
        }

        if let Some(handoff) = &invocation.inbound_handoff {
            system_prompt_extension.push_str(&handoff.to_markdown_context());
            system_prompt_extension.push('\n');
        }

        let prompt_file = if invocation.custom_prompt.is_none() {
            Some(tier_cfg.prompt_path.display().to_string())
        } else {
            None
        };

        let session_id = self
            .store
            .insert_session(NewSession {
                tier: invocation.tier,
                model: tier_cfg.model.clone(),
                prompt_file: prompt_file.clone(),
                custom_prompt: invocation.custom_prompt.clone(),
                trigger: invocation.trigger,
                parent_session_id: invocation.parent_session_id,
            })
            .await
            .context("failed to insert session row")?;

        if !system_prompt_extension.is_empty() {
            self.store
                .set_session_escalation_context(session_id, system_prompt_extension.clone())
                .await
                .ok();
        }

        let outcome = self
            .execute(session_id, &invocation, &system_prompt_extension, cancel)
            .await;

        match outcome {
            Ok(status) => Ok(TierOutcome { session_id, status }),
            Err(e) => {
                tracing::error!(session_id, error = %e, "tier execution failed before a terminal status could be recorded");
                let _ = self.store.update_session_status(session_id, SessionStatus::Failed).await;
                self.hub.finish(session_id).await;
                Ok(TierOutcome { session_id, status: SessionStatus::Failed })
            }
        }
    }

    async fn execute(
        &self,
        session_id: i64,
        invocation: &TierInvocation,
        system_prompt_extension: &str,
        cancel: CancellationToken,
    ) -> Result<SessionStatus> {
        let tier_cfg = self.config.tier(invocation.tier);
        let started = Instant::now();

        let prompt_text = match &invocation.custom_prompt {
            Some(p) => p.clone(),
            None => std::fs::read_to_string(&tier_cfg.prompt_path)
                .with_context(|| format!("failed to read prompt file {}", tier_cfg.prompt_path.display()))?,
        };

        let mcp_config_path = self.write_merged_mcp_config(session_id)?;

        let args = build_args(
            &tier_cfg.model,
            system_prompt_extension,
            &tier_cfg.allowed_tools,
            &tier_cfg.disallowed_tools,
            mcp_config_path.as_deref(),
        );

        if self.config.dry_run {
            tracing::info!(session_id, tier = invocation.tier, "dry-run: skipping subprocess spawn");
            self.store.update_session_status(session_id, SessionStatus::Completed).await?;
            self.hub.finish(session_id).await;
            return Ok(SessionStatus::Completed);
        }

        let mut child = Command::new("claude")
            .args(&args)
            .current_dir(&self.config.repos_dir)
            .env_remove("CLAUDECODE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn claude subprocess")?;

        {
            let mut stdin = child.stdin.take().expect("stdin piped");
            if let Err(e) = stdin.write_all(prompt_text.as_bytes()).await {
                let _ = child.kill().await;
                return Err(e).context("failed to write prompt to subprocess stdin");
            }
            drop(stdin);
        }

        let stderr = child.stderr.take().expect("stderr piped");
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    tracing::debug!(source = "claude-stderr", "{line}");
                }
            }
        });

        let redactor = Redactor::from_env();
        let log_path = self.open_log_path(session_id);
        let log_path_clone = log_path.clone();

        let stdout = child.stdout.take().expect("stdout piped");
        let store = self.store.clone();
        let hub = self.hub.clone();
        let memory = self.memory.clone();
        let tier = invocation.tier;

        let stdout_handle = tokio::spawn(async move {
            drive_stdout(stdout, session_id, tier, redactor, store, hub, memory, log_path_clone).await
        });

        let wait_result = tokio::select! {
            res = timeout(self.config.tier_timeout, child.wait()) => res,
            _ = cancel.cancelled() => {
                tracing::info!(session_id, "cancellation requested, terminating subprocess");
                terminate_then_kill(&mut child).await;
                stderr_handle.abort();
                stdout_handle.abort();
                let _ = self.store.update_session_status(session_id, SessionStatus::Failed).await;
                self.hub.finish(session_id).await;
                return Ok(SessionStatus::Failed);
            }
        };

        let status = match wait_result {
            Ok(status_result) => status_result.context("failed to wait on claude subprocess")?,
            Err(_elapsed) => {
                tracing::warn!(session_id, secs = self.config.tier_timeout.as_secs(), "tier timed out, terminating");
                terminate_then_kill(&mut child).await;
                stderr_handle.abort();
                stdout_handle.abort();
                self.store.update_session_status(session_id, SessionStatus::TimedOut).await?;
                self.hub.finish(session_id).await;
                return Ok(SessionStatus::TimedOut);
            }
        };

        let _ = stderr_handle.await;
        let parsed = stdout_handle.await.unwrap_or_default();

        let duration_ms = started.elapsed().as_millis() as i64;

        if !status.success() || parsed.saw_error {
            self.store
                .update_session_result(
                    session_id,
                    Some(parsed.response_text.clone()),
                    parsed.cost_usd,
                    parsed.turns,
                    duration_ms,
                    status.code(),
                    Some(log_path.display().to_string()),
                )
                .await?;
            self.store.update_session_status(session_id, SessionStatus::Failed).await?;
            self.hub.finish(session_id).await;
            return Ok(SessionStatus::Failed);
        }

        self.store
            .update_session_result(
                session_id,
                Some(parsed.response_text.clone()),
                parsed.cost_usd,
                parsed.turns,
                duration_ms,
                status.code(),
                Some(log_path.display().to_string()),
            )
            .await?;
        self.store.update_session_status(session_id, SessionStatus::Completed).await?;
        self.hub.finish(session_id).await;

        if let Some(summary) = self.summarizer.summarize(&parsed.response_text).await {
            let _ = self.store.update_session_summary(session_id, summary).await;
        }

        Ok(SessionStatus::Completed)
    }

    fn open_log_path(&self, session_id: i64) -> PathBuf {
        let name = format!("run-{}-session-{session_id}.log", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
        self.config.results_dir.join(name)
    }

    /// Merges `<repo>/.claude-ops/mcp.json` across every immediate
    /// subdirectory of the repos dir, sorted by name, later repos
    /// overriding earlier ones on key collision. Malformed per-repo
    /// files are skipped, never fatal.
    fn write_merged_mcp_config(&self, session_id: i64) -> Result<Option<PathBuf>> {
        let mut merged = serde_json::Map::new();

        let mut entries: Vec<PathBuf> = match std::fs::read_dir(&self.config.repos_dir) {
            Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).filter(|p| p.is_dir()).collect(),
            Err(_) => return Ok(None),
        };
        entries.sort();

        for repo_dir in entries {
            let candidate = repo_dir.join(".claude-ops").join("mcp.json");
            if !candidate.exists() {
                continue;
            }
            let contents = match std::fs::read_to_string(&candidate) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "failed to read per-repo mcp config");
                    continue;
                }
            };
            let parsed: serde_json::Value = match serde_json::from_str(&contents) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "malformed per-repo mcp config, skipping");
                    continue;
                }
            };
            let Some(obj) = parsed.as_object() else {
                tracing::warn!(path = %candidate.display(), "per-repo mcp config is not a JSON object, skipping");
                continue;
            };
            for (k, v) in obj {
                merged.insert(k.clone(), v.clone());
            }
        }

        if merged.is_empty() {
            return Ok(None);
        }

        let path = self.config.state_dir.join(format!("mcp-session-{session_id}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(&serde_json::Value::Object(merged))?)?;
        Ok(Some(path))
    }
}

/// Builds the `claude` CLI argv for one tier invocation. Kept as a pure
/// function, separate from spawning, so the flag wiring is testable without
/// a subprocess.
fn build_args(
    model: &str,
    system_prompt_extension: &str,
    allowed_tools: &[String],
    disallowed_tools: &[String],
    mcp_config_path: Option<&std::path::Path>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--print".into(),
        "--verbose".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--model".into(),
        model.to_string(),
    ];

    if !system_prompt_extension.is_empty() {
        args.push("--append-system-prompt".into());
        args.push(system_prompt_extension.to_string());
    }

    if allowed_tools.is_empty() {
        args.push("--dangerously-skip-permissions".into());
    } else {
        args.push("--allowedTools".into());
        args.push(allowed_tools.join(","));
    }
    if !disallowed_tools.is_empty() {
        args.push("--disallowedTools".into());
        args.push(disallowed_tools.join(","));
    }

    if let Some(path) = mcp_config_path {
        args.push("--mcp-config".into());
        args.push(path.display().to_string());
    }

    args.push("-".into());
    args
}

async fn terminate_then_kill(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            unsafe {
                libc_kill(pid as i32, 15); // SIGTERM
            }
        }
        let _ = timeout(TERMINATE_GRACE, child.wait()).await;
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    unsafe extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    unsafe { kill(pid, sig) };
}

#[derive(Default)]
struct ParsedOutput {
    response_text: String,
    cost_usd: f64,
    turns: i64,
    saw_error: bool,
}

#[allow(clippy::too_many_arguments)]
async fn drive_stdout(
    stdout: tokio::process::ChildStdout,
    session_id: i64,
    tier: u32,
    redactor: Redactor,
    store: Arc<dyn Store>,
    hub: SharedHub,
    memory: Arc<MemoryEngine>,
    log_path: PathBuf,
) -> ParsedOutput {
    let mut out = ParsedOutput::default();
    let mut log_file = tokio::fs::File::create(&log_path).await.ok();

    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }

        if let Some(f) = log_file.as_mut() {
            let _ = f.write_all(line.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        }

        for record in stream_parser::parse_line(&line) {
            match record {
                ParsedRecord::System => {}
                ParsedRecord::AssistantText(text) => {
                    let redacted = redactor.redact(&text);
                    hub.publish(session_id, redacted.clone()).await;
                    out.response_text.push_str(&redacted);
                    out.response_text.push('\n');

                    for marker in stream_parser::scan_markers(&redacted) {
                        apply_marker(&marker, session_id, tier, &store, &memory).await;
                    }
                }
                ParsedRecord::ToolUse { name, args } => {
                    let redacted_args = redactor.redact(&args.to_string());
                    hub.publish(session_id, format!("[tool_use:{name}] {redacted_args}")).await;
                }
                ParsedRecord::Result { cost_usd, turns, result_text } => {
                    out.cost_usd = cost_usd;
                    out.turns = turns;
                    if let Some(text) = result_text {
                        if out.response_text.is_empty() {
                            out.response_text = redactor.redact(&text);
                        }
                    }
                }
                ParsedRecord::Error(message) => {
                    out.saw_error = true;
                    let redacted = redactor.redact(&message);
                    hub.publish(session_id, format!("[error] {redacted}")).await;
                    let _ = store
                        .insert_event(NewEvent {
                            session_id,
                            level: EventLevel::Critical,
                            service: None,
                            message: redacted,
                        })
                        .await;
                }
            }
        }
    }

    out
}

async fn apply_marker(marker: &Marker, session_id: i64, tier: u32, store: &Arc<dyn Store>, memory: &Arc<MemoryEngine>) {
    match marker {
        Marker::Event { level, service, message } => {
            let _ = store
                .insert_event(NewEvent {
                    session_id,
                    level: *level,
                    service: service.clone(),
                    message: message.clone(),
                })
                .await;
        }
        Marker::Memory { .. } => {
            if let Err(e) = memory.observe(marker, session_id, tier).await {
                tracing::warn!(session_id, error = %e, "failed to apply memory marker");
            }
        }
        Marker::Cooldown { action_type, service, success, message } => {
            let _ = store
                .insert_cooldown_action(NewCooldownAction {
                    service: service.clone(),
                    action_type: action_type.clone(),
                    success: *success,
                    tier,
                    error: if *success { None } else { Some(message.clone()) },
                    session_id,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn build_args_with_allowed_tools_sets_allowed_tools_flag() {
        let args = build_args("sonnet", "", &tools(&["Bash", "Read"]), &[], None);
        assert!(args.contains(&"--allowedTools".to_string()));
        assert!(args.contains(&"Bash,Read".to_string()));
        assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn build_args_no_allowed_tools_uses_dangerous_skip() {
        let args = build_args("sonnet", "", &[], &[], None);
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn build_args_includes_disallowed_tools_when_present() {
        let args = build_args("sonnet", "", &tools(&["Bash"]), &tools(&["WebSearch"]), None);
        let idx = args.iter().position(|a| a == "--disallowedTools").unwrap();
        assert_eq!(args[idx + 1], "WebSearch");
    }

    #[test]
    fn build_args_omits_disallowed_tools_when_empty() {
        let args = build_args("sonnet", "", &tools(&["Bash"]), &[], None);
        assert!(!args.contains(&"--disallowedTools".to_string()));
    }

    #[test]
    fn build_args_always_ends_with_stdin_marker() {
        let args = build_args("sonnet", "", &[], &[], None);
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn build_args_includes_output_format_stream_json() {
        let args = build_args("sonnet", "", &[], &[], None);
        let idx = args.iter().position(|a| a == "--output-format").unwrap();
        assert_eq!(args[idx + 1], "stream-json");
    }

    #[test]
    fn build_args_sets_model_flag() {
        let args = build_args("opus", "", &[], &[], None);
        let idx = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[idx + 1], "opus");
    }

    #[test]
    fn build_args_appends_system_prompt_when_present() {
        let args = build_args("sonnet", "stay focused on tier 1", &[], &[], None);
        let idx = args.iter().position(|a| a == "--append-system-prompt").unwrap();
        assert_eq!(args[idx + 1], "stay focused on tier 1");
    }

    #[test]
    fn build_args_omits_system_prompt_when_empty() {
        let args = build_args("sonnet", "", &[], &[], None);
        assert!(!args.contains(&"--append-system-prompt".to_string()));
    }

    #[test]
    fn build_args_includes_mcp_config_when_present() {
        let path = PathBuf::from("/tmp/mcp-session-1.json");
        let args = build_args("sonnet", "", &[], &[], Some(&path));
        let idx = args.iter().position(|a| a == "--mcp-config").unwrap();
        assert_eq!(args[idx + 1], "/tmp/mcp-session-1.json");
    }

    #[test]
    fn build_args_omits_mcp_config_when_absent() {
        let args = build_args("sonnet", "", &[], &[], None);
        assert!(!args.contains(&"--mcp-config".to_string()));
    }

    #[test]
    fn write_merged_mcp_config_merges_in_sorted_order_with_later_override() {
        let (runner, repos_dir, _dir) = test_runner();

        for (name, contents) in [
            ("a-repo", r#"{"serverA": {"command": "one"}, "shared": {"command": "from-a"}}"#),
            ("b-repo", r#"{"serverB": {"command": "two"}, "shared": {"command": "from-b"}}"#),
        ] {
            let dir = repos_dir.join(name).join(".claude-ops");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("mcp.json"), contents).unwrap();
        }

        let path = runner.write_merged_mcp_config(1).unwrap().expect("expected a merged config path");
        let merged: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(merged["serverA"]["command"], "one");
        assert_eq!(merged["serverB"]["command"], "two");
        assert_eq!(merged["shared"]["command"], "from-b");
    }

    #[test]
    fn write_merged_mcp_config_skips_malformed_file_without_failing() {
        let (runner, repos_dir, _dir) = test_runner();

        let good_dir = repos_dir.join("good-repo").join(".claude-ops");
        std::fs::create_dir_all(&good_dir).unwrap();
        std::fs::write(good_dir.join("mcp.json"), r#"{"serverA": {"command": "one"}}"#).unwrap();

        let bad_dir = repos_dir.join("bad-repo").join(".claude-ops");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join("mcp.json"), "not json at all").unwrap();

        let path = runner.write_merged_mcp_config(1).unwrap().expect("malformed sibling must not block the good one");
        let merged: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(merged["serverA"]["command"], "one");
    }

    #[test]
    fn write_merged_mcp_config_returns_none_when_no_repos_have_config() {
        let (runner, repos_dir, _dir) = test_runner();
        std::fs::create_dir_all(repos_dir.join("empty-repo")).unwrap();

        assert!(runner.write_merged_mcp_config(1).unwrap().is_none());
    }

    /// Builds a `TierRunner` over a scratch directory, following the same
    /// struct-literal `Config` construction used by the escalation driver's
    /// test harness.
    fn test_runner() -> (TierRunner, PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repos_dir = dir.path().join("repos");
        let state_dir = dir.path().join("state");
        let results_dir = dir.path().join("results");
        std::fs::create_dir_all(&repos_dir).unwrap();
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::create_dir_all(&results_dir).unwrap();
        std::fs::write(dir.path().join("tier1.md"), "tier1 prompt").unwrap();

        let config = Arc::new(Config {
            interval: Duration::from_secs(300),
            max_tier: 3,
            tier1: crate::config::TierConfig {
                model: "m1".into(),
                prompt_path: dir.path().join("tier1.md"),
                allowed_tools: vec![],
                disallowed_tools: vec![],
            },
            tier2: crate::config::TierConfig {
                model: "m2".into(),
                prompt_path: dir.path().join("tier1.md"),
                allowed_tools: vec![],
                disallowed_tools: vec![],
            },
            tier3: crate::config::TierConfig {
                model: "m3".into(),
                prompt_path: dir.path().join("tier1.md"),
                allowed_tools: vec![],
                disallowed_tools: vec![],
            },
            results_dir,
            state_dir,
            repos_dir: repos_dir.clone(),
            dry_run: true,
            notify_url: None,
            summarizer_model: "s".into(),
            memory_budget_chars: 8000,
            memory_grace_days: 30,
            memory_decay_rate: 0.1,
            chat_bearer_token: None,
            webhook_model: None,
            browser_allowlist: vec![],
            port: 0,
            shutdown_grace: Duration::from_secs(1),
            tier_timeout: Duration::from_secs(1),
        });

        let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::open(&config.store_path()).unwrap());
        let hub = Arc::new(crate::hub::Hub::default());
        let memory = Arc::new(MemoryEngine::new(store.clone(), config.memory_budget_chars));
        let summarizer = Arc::new(Summarizer::new(reqwest::Client::new(), config.summarizer_model.clone()));
        (TierRunner::new(config, store, hub, memory, summarizer), repos_dir, dir)
    }
}

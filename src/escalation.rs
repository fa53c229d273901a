//! Drives a single escalation chain from trigger to terminal tier.
//!
//! Expressed as a flattened async function rather than an explicit state
//! enum: each step either returns or falls through to the next, mirroring
//! how the S0-S5 transitions are described in terms of what happens next
//! rather than a state object callers inspect.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::HandoffError;
use crate::handoff::Handoff;
use crate::memory::MemoryEngine;
use crate::notify::{NotificationKind, Notifier};
use crate::store::{EventLevel, NewEvent, SessionStatus, Store, Trigger};
use crate::tier_runner::{TierInvocation, TierOutcome, TierRunner};

/// What started this cycle. Ad-hoc and webhook/chat triggers may pin a
/// starting tier and substitute a custom prompt; scheduled cycles always
/// start at tier 1 with the configured prompt file.
pub struct CycleRequest {
    pub trigger: Trigger,
    pub start_tier: u32,
    pub custom_prompt: Option<String>,
}

impl CycleRequest {
    pub fn scheduled() -> Self {
        Self { trigger: Trigger::Scheduled, start_tier: 1, custom_prompt: None }
    }
}

pub struct EscalationDriver {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    memory: Arc<MemoryEngine>,
    tier_runner: Arc<TierRunner>,
    notifier: Arc<Notifier>,
}

impl EscalationDriver {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        memory: Arc<MemoryEngine>,
        tier_runner: Arc<TierRunner>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self { config, store, memory, tier_runner, notifier }
    }

    /// Runs one full chain: tier1 (or the pinned starting tier) through
    /// however far the handoffs escalate, capped at `max_tier`. Tier 3 is
    /// always terminal regardless of what it emits.
    pub async fn run_cycle(&self, request: CycleRequest, cancel: CancellationToken) -> Result<()> {
        if request.trigger == Trigger::Scheduled {
            if let Err(e) = self.memory.decay(self.config.memory_grace_days, self.config.memory_decay_rate).await {
                tracing::warn!(error = %e, "memory decay pass failed, continuing with cycle");
            }
        }

        let start_tier = request.start_tier.clamp(1, self.config.max_tier);

        let first = self
            .tier_runner
            .run_tier(
                TierInvocation {
                    tier: start_tier,
                    trigger: request.trigger,
                    parent_session_id: None,
                    custom_prompt: request.custom_prompt,
                    inbound_handoff: None,
                },
                cancel.clone(),
            )
            .await?;

        let mut current_tier = start_tier;
        let mut current_outcome = first;

        while current_tier < 3 {
            if current_outcome.status != SessionStatus::Completed {
                // §4.6: a non-zero exit or timeout means any handoff file
                // for this tier is ignored, not inspected or validated.
                let path = self.config.handoff_path();
                if path.exists() {
                    tracing::warn!(session_id = current_outcome.session_id, "handoff present after a non-completed tier, ignoring");
                    Handoff::delete(&path).ok();
                }
                break;
            }

            let Some(handoff) = self.take_handoff(current_outcome.session_id, current_tier, &current_outcome).await? else {
                break;
            };

            let next_tier = handoff.0.recommended_tier;

            // The session that produced this handoff escalated rather than
            // simply completing; TierRunner already marked it Completed, so
            // flip it here once we know a downstream session exists.
            self.store
                .update_session_status(current_outcome.session_id, SessionStatus::Escalated)
                .await
                .ok();

            let outcome = self
                .tier_runner
                .run_tier(
                    TierInvocation {
                        tier: next_tier,
                        trigger: Trigger::Escalation,
                        parent_session_id: Some(current_outcome.session_id),
                        custom_prompt: None,
                        inbound_handoff: Some(handoff),
                    },
                    cancel.clone(),
                )
                .await?;

            current_tier = next_tier;
            current_outcome = outcome;
        }

        if current_tier == 3 && current_outcome.status == SessionStatus::Completed {
            // Tier 3 is terminal: any handoff it writes is logged and
            // discarded rather than acted on.
            if let Some(_trailing) = self.take_handoff(current_outcome.session_id, 3, &current_outcome).await? {
                tracing::warn!(
                    session_id = current_outcome.session_id,
                    "tier 3 emitted a handoff; escalation chain is terminal, discarding it"
                );
            }

            // §8 scenario 3: the chain ran out of tiers to escalate to,
            // whether or not tier 3 left a (discarded) handoff behind.
            self.notifier
                .notify(
                    NotificationKind::Terminal,
                    &format!("session {} reached tier 3 with no further escalation available", current_outcome.session_id),
                )
                .await;
        }

        Ok(())
    }

    /// Reads, validates, and deletes the handoff file left by the tier
    /// that just finished. Absence is the common case (most tiers resolve
    /// without escalating) and is not logged. Malformed/unknown-schema/
    /// oversized handoffs are a critical event; a handoff recommending a
    /// tier beyond policy (exceeds max tier, non-increasing, or dry-run)
    /// is a human-attention notification instead, with no event.
    async fn take_handoff(&self, session_id: i64, tier: u32, _outcome: &TierOutcome) -> Result<Option<crate::handoff::ValidatedHandoff>> {
        let path = self.config.handoff_path();
        let raw = match Handoff::read_from(&path) {
            Ok(Some(h)) => h,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::error!(session_id, error = %e, "failed to read handoff file, treating as absent");
                Handoff::delete(&path).ok();
                self.store
                    .insert_event(NewEvent {
                        session_id,
                        level: EventLevel::Critical,
                        service: None,
                        message: format!("escalation handoff rejected: {e}"),
                    })
                    .await
                    .ok();
                return Ok(None);
            }
        };

        match raw.validate(self.config.max_tier) {
            Ok(validated) => {
                Handoff::delete(&path)?;
                self.update_health_streaks(&validated.0.check_results).await;
                if validated.0.recommended_tier <= tier || self.config.dry_run {
                    tracing::warn!(
                        session_id,
                        tier,
                        recommended = validated.0.recommended_tier,
                        "handoff does not escalate past the current tier, dropping"
                    );
                    self.notifier.notify(NotificationKind::HumanAttention, "escalation handoff rejected: non-increasing tier").await;
                    return Ok(None);
                }
                Ok(Some(validated))
            }
            // §7 splits handoff validation failures into two categories:
            // "Handoff" (malformed/unknown-schema/size) gets a critical
            // event; "Policy" (exceeds max tier, like the dry-run/
            // non-increasing-tier case handled above) gets a
            // human-attention notification instead, with no event.
            Err(e @ HandoffError::ExceedsMaxTier { .. }) => {
                tracing::warn!(session_id, tier, error = %e, "handoff requests a tier beyond policy, dropping");
                Handoff::delete(&path).ok();
                self.notifier
                    .notify(NotificationKind::HumanAttention, &format!("escalation handoff rejected: {e}"))
                    .await;
                Ok(None)
            }
            Err(e) => {
                tracing::error!(session_id, tier, error = %e, "handoff failed validation, dropping");
                Handoff::delete(&path).ok();
                self.store
                    .insert_event(NewEvent {
                        session_id,
                        level: EventLevel::Critical,
                        service: None,
                        message: format!("escalation handoff rejected: {e}"),
                    })
                    .await
                    .ok();
                self.notifier
                    .notify(NotificationKind::HumanAttention, &format!("escalation handoff rejected: {e}"))
                    .await;
                Ok(None)
            }
        }
    }

    /// Upserts the per-service consecutive-healthy-check streak (§3) from
    /// a validated handoff's check results: a healthy row extends the
    /// streak, anything else resets it to zero. This is the only point a
    /// check's status is visible to the supervisor at all, since check
    /// results only exist inside a handoff the LLM chose to write.
    async fn update_health_streaks(&self, check_results: &[crate::handoff::CheckResult]) {
        for check in check_results {
            let result = if check.status.eq_ignore_ascii_case("healthy") {
                self.store.record_healthy_streak(&check.service).await.map(|_| ())
            } else {
                self.store.reset_healthy_streak(&check.service).await
            };
            if let Err(e) = result {
                tracing::warn!(service = %check.service, error = %e, "failed to update service health streak");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::memory::MemoryEngine;
    use crate::store::SqliteStore;
    use crate::summarizer::Summarizer;
    use std::time::Duration;

    async fn test_driver() -> (EscalationDriver, tempfile::TempDir) {
        test_driver_with_max_tier(3).await
    }

    async fn test_driver_with_max_tier(max_tier: u32) -> (EscalationDriver, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("repos")).unwrap();
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::create_dir_all(dir.path().join("results")).unwrap();
        std::fs::write(dir.path().join("tier1.md"), "tier1 prompt").unwrap();

        let config = Arc::new(Config {
            interval: Duration::from_secs(300),
            max_tier,
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
            results_dir: dir.path().join("results"),
            state_dir: dir.path().join("state"),
            repos_dir: dir.path().join("repos"),
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

        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.store_path()).unwrap());
        let hub = Arc::new(Hub::default());
        let memory = Arc::new(MemoryEngine::new(store.clone(), config.memory_budget_chars));
        let summarizer = Arc::new(Summarizer::new(reqwest::Client::new(), config.summarizer_model.clone()));
        let tier_runner = Arc::new(TierRunner::new(config.clone(), store.clone(), hub, memory.clone(), summarizer));
        let notifier = Arc::new(Notifier::new(reqwest::Client::new(), config.notify_url.clone()));

        (EscalationDriver::new(config, store, memory, tier_runner, notifier), dir)
    }

    #[tokio::test]
    async fn dry_run_cycle_completes_without_escalating() {
        let (driver, _dir) = test_driver().await;
        let result = driver.run_cycle(CycleRequest::scheduled(), CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn malformed_handoff_records_a_critical_event_and_does_not_escalate() {
        let (driver, _dir) = test_driver().await;
        let session_id = driver
            .store
            .insert_session(crate::store::NewSession {
                tier: 1,
                model: "m1".into(),
                prompt_file: None,
                custom_prompt: None,
                trigger: Trigger::Scheduled,
                parent_session_id: None,
            })
            .await
            .unwrap();

        std::fs::write(
            driver.config.handoff_path(),
            r#"{
                "schema_version": 99,
                "recommended_tier": 2,
                "services_affected": ["web"],
                "check_results": [{"service": "web", "check_type": "http", "status": "degraded"}]
            }"#,
        )
        .unwrap();

        let outcome = TierOutcome { session_id, status: SessionStatus::Completed };
        let result = driver.take_handoff(session_id, 1, &outcome).await.unwrap();
        assert!(result.is_none());
        assert!(!driver.config.handoff_path().exists());

        let events = driver.store.list_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, crate::store::EventLevel::Critical);
        assert!(events[0].message.contains("unknown schema version"));
    }

    #[tokio::test]
    async fn a_validated_handoff_extends_healthy_streaks_and_resets_unhealthy_ones() {
        let (driver, _dir) = test_driver().await;

        let checks = vec![
            crate::handoff::CheckResult {
                service: "web".into(),
                check_type: "http".into(),
                status: "healthy".into(),
                error: None,
                response_time_ms: Some(50),
            },
            crate::handoff::CheckResult {
                service: "db".into(),
                check_type: "tcp".into(),
                status: "degraded".into(),
                error: Some("timeout".into()),
                response_time_ms: None,
            },
        ];

        driver.update_health_streaks(&checks).await;

        // "web" stayed healthy: a second increment continues the streak past 1.
        assert_eq!(driver.store.record_healthy_streak("web").await.unwrap(), 2);
        // "db" was unhealthy: its streak was reset to zero, so the next
        // healthy check starts back at 1.
        assert_eq!(driver.store.record_healthy_streak("db").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ad_hoc_request_respects_pinned_start_tier() {
        let (driver, _dir) = test_driver().await;
        let request = CycleRequest {
            trigger: Trigger::Manual,
            start_tier: 2,
            custom_prompt: Some("check the payments service".into()),
        };
        let result = driver.run_cycle(request, CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn handoff_exceeding_max_tier_notifies_without_recording_an_event() {
        let (driver, _dir) = test_driver_with_max_tier(2).await;
        let session_id = driver
            .store
            .insert_session(crate::store::NewSession {
                tier: 1,
                model: "m1".into(),
                prompt_file: None,
                custom_prompt: None,
                trigger: Trigger::Scheduled,
                parent_session_id: None,
            })
            .await
            .unwrap();

        std::fs::write(
            driver.config.handoff_path(),
            r#"{
                "schema_version": 1,
                "recommended_tier": 3,
                "services_affected": ["web"],
                "check_results": [{"service": "web", "check_type": "http", "status": "degraded"}]
            }"#,
        )
        .unwrap();

        let outcome = TierOutcome { session_id, status: SessionStatus::Completed };
        let result = driver.take_handoff(session_id, 1, &outcome).await.unwrap();
        assert!(result.is_none());
        assert!(!driver.config.handoff_path().exists());

        // §7: exceeding the configured max tier is a policy rejection, not
        // a handoff-validation failure, so no critical event is recorded.
        let events = driver.store.list_events(10).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn tier_three_completing_with_no_handoff_still_runs_to_completion() {
        // §8 scenario 3: tier 3 produces no fix and no further handoff.
        // The terminal notification is best-effort and unobservable
        // without a mock endpoint, but the cycle must still complete
        // cleanly rather than erroring out on the missing handoff.
        let (driver, _dir) = test_driver_with_max_tier(3).await;
        let request = CycleRequest { trigger: Trigger::Manual, start_tier: 3, custom_prompt: Some("investigate".into()) };
        let result = driver.run_cycle(request, CancellationToken::new()).await;
        assert!(result.is_ok());
    }
}

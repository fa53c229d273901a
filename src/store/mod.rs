pub mod migrations;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sqlite::SqliteStore;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Escalated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::TimedOut => "timed_out",
            SessionStatus::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => SessionStatus::Running,
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            "timed_out" => SessionStatus::TimedOut,
            "escalated" => SessionStatus::Escalated,
            _ => return None,
        })
    }

    /// `running -> terminal` covers normal finalization. The one
    /// exception is `completed -> escalated`: the Escalation Driver only
    /// learns a tier produced a downstream session after Tier Runner has
    /// already finalized it as `completed`, so it retroactively flips
    /// that row once the handoff is confirmed.
    pub fn valid_transition(&self, to: SessionStatus) -> bool {
        match self {
            SessionStatus::Running => matches!(
                to,
                SessionStatus::Completed
                    | SessionStatus::Failed
                    | SessionStatus::TimedOut
                    | SessionStatus::Escalated
            ),
            SessionStatus::Completed => matches!(to, SessionStatus::Escalated),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
    Alert,
    Escalation,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
            Trigger::Alert => "alert",
            Trigger::Escalation => "escalation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => Trigger::Scheduled,
            "manual" => Trigger::Manual,
            "alert" => Trigger::Alert,
            "escalation" => Trigger::Escalation,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Critical,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warning => "warning",
            EventLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "info" => EventLevel::Info,
            "warning" => EventLevel::Warning,
            "critical" => EventLevel::Critical,
            _ => return None,
        })
    }
}

/// A new session about to be inserted. `id` is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub tier: u32,
    pub model: String,
    pub prompt_file: Option<String>,
    pub custom_prompt: Option<String>,
    pub trigger: Trigger,
    pub parent_session_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub tier: u32,
    pub model: String,
    pub prompt_file: Option<String>,
    pub custom_prompt: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub log_file: Option<String>,
    pub trigger: Trigger,
    pub parent_session_id: Option<i64>,
    pub response: Option<String>,
    pub cost_usd: Option<f64>,
    pub turns: Option<i64>,
    pub duration_ms: Option<i64>,
    pub summary: Option<String>,
    pub escalation_context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub session_id: i64,
    pub level: EventLevel,
    pub service: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub session_id: i64,
    pub level: EventLevel,
    pub service: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub service: Option<String>,
    pub category: String,
    pub observation: String,
    pub confidence: f64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub originating_session_id: i64,
    pub tier: u32,
}

#[derive(Debug, Clone)]
pub struct NewMemory {
    pub service: Option<String>,
    pub category: String,
    pub observation: String,
    pub confidence: f64,
    pub originating_session_id: i64,
    pub tier: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownAction {
    pub id: i64,
    pub service: String,
    pub action_type: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub tier: u32,
    pub error: Option<String>,
    pub session_id: i64,
}

#[derive(Debug, Clone)]
pub struct NewCooldownAction {
    pub service: String,
    pub action_type: String,
    pub success: bool,
    pub tier: u32,
    pub error: Option<String>,
    pub session_id: i64,
}

pub fn clamp_confidence(c: f64) -> f64 {
    c.clamp(0.0, 1.0)
}


/// The relational store. Exposes typed operations only — no caller ever
/// builds a query. Implementations must serialize writes through a single
/// logical writer while allowing concurrent reads.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_session(&self, row: NewSession) -> Result<i64, StoreError>;
    async fn update_session_status(&self, id: i64, status: SessionStatus) -> Result<(), StoreError>;
    async fn update_session_result(
        &self,
        id: i64,
        response: Option<String>,
        cost_usd: f64,
        turns: i64,
        duration_ms: i64,
        exit_code: Option<i32>,
        log_file: Option<String>,
    ) -> Result<(), StoreError>;
    async fn update_session_summary(&self, id: i64, summary: String) -> Result<(), StoreError>;
    async fn set_session_escalation_context(&self, id: i64, context: String) -> Result<(), StoreError>;
    async fn get_session(&self, id: i64) -> Result<Session, StoreError>;
    async fn list_sessions(&self, limit: i64) -> Result<Vec<Session>, StoreError>;
    async fn get_escalation_chain(&self, id: i64) -> Result<Vec<Session>, StoreError>;

    async fn insert_event(&self, row: NewEvent) -> Result<i64, StoreError>;
    async fn list_events(&self, limit: i64) -> Result<Vec<Event>, StoreError>;

    async fn insert_cooldown_action(&self, row: NewCooldownAction) -> Result<i64, StoreError>;
    async fn check_cooldown(&self, service: &str, action_type: &str, window_secs: i64) -> Result<i64, StoreError>;
    async fn list_cooldown_actions(&self, limit: i64) -> Result<Vec<CooldownAction>, StoreError>;

    async fn insert_memory(&self, row: NewMemory) -> Result<i64, StoreError>;
    async fn update_memory(&self, id: i64, observation: String, confidence: f64, active: bool) -> Result<(), StoreError>;
    async fn delete_memory(&self, id: i64) -> Result<(), StoreError>;
    async fn find_similar_memory(&self, service: Option<&str>, category: &str) -> Result<Option<Memory>, StoreError>;
    async fn get_active_memories(&self, limit: i64) -> Result<Vec<Memory>, StoreError>;
    async fn list_memories(&self, limit: i64) -> Result<Vec<Memory>, StoreError>;
    async fn decay_stale_memories(&self, grace_days: i64, decay_rate: f64) -> Result<(), StoreError>;

    async fn record_healthy_streak(&self, service: &str) -> Result<i64, StoreError>;
    async fn reset_healthy_streak(&self, service: &str) -> Result<(), StoreError>;

    async fn get_config(&self, key: &str, fallback: &str) -> Result<String, StoreError>;
    async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

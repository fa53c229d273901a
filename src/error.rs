use thiserror::Error;

/// Errors surfaced by the relational store. Most call sites only need
/// `anyhow::Error` context, but the scheduler and HTTP layer branch on
/// `Busy` specifically, so it gets its own type.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store worker channel closed")]
    WorkerGone,
    #[error("row not found")]
    NotFound,
    #[error("invalid session status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Failure reasons when validating a handoff file. The Escalation Driver
/// matches on these to decide which critical event text to log.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("handoff file not present")]
    Absent,
    #[error("failed to read handoff file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse handoff json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown schema version: {0}")]
    UnknownSchemaVersion(u32),
    #[error("recommended_tier {0} out of range (must be 2 or 3)")]
    TierOutOfRange(u32),
    #[error("recommended_tier {tier} exceeds configured max tier {max}")]
    ExceedsMaxTier { tier: u32, max: u32 },
    #[error("services_affected is empty")]
    EmptyServices,
    #[error("check_results is empty")]
    EmptyCheckResults,
    #[error("tier 3 handoff missing investigation_findings or remediation_attempted")]
    MissingTier3Fields,
}

/// Errors from the scheduler's ad-hoc trigger channel.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("a session is already running")]
    Busy,
    #[error("prompt must not be empty")]
    EmptyPrompt,
}

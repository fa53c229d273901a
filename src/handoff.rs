//! The typed handoff file one tier writes to request escalation, and the
//! supervisor reads/validates/deletes to drive the next tier.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HandoffError;

const MAX_CONTEXT_CHARS: usize = 50_000;
const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub service: String,
    pub check_type: String,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub schema_version: u32,
    pub recommended_tier: u32,
    pub services_affected: Vec<String>,
    pub check_results: Vec<CheckResult>,
    #[serde(default)]
    pub investigation_findings: Option<String>,
    #[serde(default)]
    pub remediation_attempted: Option<String>,
    #[serde(default)]
    pub cooldown_state: serde_json::Value,
}

/// A handoff that has passed `validate()`. Keeping this as a distinct
/// type means callers can't accidentally serialize an unvalidated
/// handoff into escalation context.
pub struct ValidatedHandoff(pub Handoff);

impl Handoff {
    pub fn read_from(path: &Path) -> Result<Option<Handoff>, HandoffError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let handoff: Handoff = serde_json::from_str(&contents)?;
        Ok(Some(handoff))
    }

    pub fn delete(path: &Path) -> std::io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).expect("handoff is always serializable");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }

    pub fn validate(self, max_tier: u32) -> Result<ValidatedHandoff, HandoffError> {
        if self.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(HandoffError::UnknownSchemaVersion(self.schema_version));
        }
        if !(2..=3).contains(&self.recommended_tier) {
            return Err(HandoffError::TierOutOfRange(self.recommended_tier));
        }
        if self.recommended_tier > max_tier {
            return Err(HandoffError::ExceedsMaxTier { tier: self.recommended_tier, max: max_tier });
        }
        if self.services_affected.is_empty() {
            return Err(HandoffError::EmptyServices);
        }
        if self.check_results.is_empty() {
            return Err(HandoffError::EmptyCheckResults);
        }
        if self.recommended_tier == 3 {
            let findings_ok = self.investigation_findings.as_deref().is_some_and(|s| !s.trim().is_empty());
            let attempted_ok = self.remediation_attempted.as_deref().is_some_and(|s| !s.trim().is_empty());
            if !findings_ok || !attempted_ok {
                return Err(HandoffError::MissingTier3Fields);
            }
        }
        Ok(ValidatedHandoff(self))
    }
}

impl ValidatedHandoff {
    /// Renders the handoff as a markdown "Escalation Context" section for
    /// injection into the next tier's system prompt. When the rendered
    /// text exceeds `MAX_CONTEXT_CHARS`, healthy check rows are dropped
    /// first (they carry the least signal) and a truncation note is
    /// appended.
    pub fn to_markdown_context(&self) -> String {
        let h = &self.0;
        let full = render(h, false);
        if full.len() <= MAX_CONTEXT_CHARS {
            return full;
        }

        let trimmed = render(h, true);
        if trimmed.len() <= MAX_CONTEXT_CHARS {
            tracing::warn!(
                original_len = full.len(),
                trimmed_len = trimmed.len(),
                "escalation context exceeded size cap, dropped healthy check rows"
            );
            trimmed
        } else {
            tracing::warn!(len = trimmed.len(), "escalation context still exceeds size cap after dropping healthy rows, truncating hard");
            let mut s = trimmed;
            s.truncate(MAX_CONTEXT_CHARS);
            s
        }
    }
}

fn render(h: &Handoff, drop_healthy: bool) -> String {
    let mut out = String::new();
    out.push_str("## Escalation Context\n\n");
    out.push_str("### Affected Services\n");
    for s in &h.services_affected {
        out.push_str(&format!("- {s}\n"));
    }

    out.push_str("\n### Check Results\n");
    out.push_str("| Service | Check | Status | Error | Response Time (ms) |\n");
    out.push_str("|---|---|---|---|---|\n");
    for c in &h.check_results {
        if drop_healthy && c.status.eq_ignore_ascii_case("healthy") {
            continue;
        }
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            c.service,
            c.check_type,
            c.status,
            c.error.as_deref().unwrap_or(""),
            c.response_time_ms.map(|v| v.to_string()).unwrap_or_default(),
        ));
    }

    if let Some(findings) = &h.investigation_findings {
        out.push_str("\n### Investigation Findings\n");
        out.push_str(findings);
        out.push('\n');
    }
    if let Some(attempted) = &h.remediation_attempted {
        out.push_str("\n### Remediation Attempted\n");
        out.push_str(attempted);
        out.push('\n');
    }

    out.push_str("\n### Cooldown State\n```json\n");
    out.push_str(&serde_json::to_string_pretty(&h.cooldown_state).unwrap_or_else(|_| "{}".to_string()));
    out.push_str("\n```\n");

    out
}

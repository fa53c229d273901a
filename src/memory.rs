//! Reinforcement/decay engine over the `memories` table.

use std::collections::HashSet;
use std::sync::Arc;

use crate::store::{Memory, NewMemory, Store, clamp_confidence};
use crate::stream_parser::Marker;

const AGREEMENT_THRESHOLD: f64 = 0.4;
const REINFORCE_DELTA: f64 = 0.1;
const CONTRADICT_DELTA: f64 = 0.2;
const INSERT_CONFIDENCE: f64 = 0.7;

const NEGATION_CUES: &[&str] = &["no longer", "not ", "isn't", "resolved", "fixed", "false positive"];

pub struct MemoryEngine {
    store: Arc<dyn Store>,
    budget_chars: usize,
}

impl MemoryEngine {
    pub fn new(store: Arc<dyn Store>, budget_chars: usize) -> Self {
        Self { store, budget_chars }
    }

    /// Builds the "Active Memories" system-prompt section: active
    /// memories ordered by confidence, unscoped memories first, grouped
    /// by service, truncated to the character budget.
    pub async fn build_context(&self, limit: i64) -> anyhow::Result<String> {
        let memories = self.store.get_active_memories(limit).await?;
        if memories.is_empty() {
            return Ok(String::new());
        }

        let mut unscoped: Vec<&Memory> = memories.iter().filter(|m| m.service.is_none()).collect();
        let mut scoped: Vec<&Memory> = memories.iter().filter(|m| m.service.is_some()).collect();
        unscoped.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
        scoped.sort_by(|a, b| {
            a.service
                .cmp(&b.service)
                .then(b.confidence.partial_cmp(&a.confidence).unwrap())
        });

        let mut out = String::from("## Active Memories\n\n");
        for m in unscoped.iter().chain(scoped.iter()) {
            let line = match &m.service {
                Some(service) => format!("- [{service}] ({}, {:.2}) {}\n", m.category, m.confidence, m.observation),
                None => format!("- ({}, {:.2}) {}\n", m.category, m.confidence, m.observation),
            };
            if out.len() + line.len() > self.budget_chars {
                break;
            }
            out.push_str(&line);
        }

        Ok(out)
    }

    /// Applies a single `[MEMORY:...]` marker: reinforce, contradict, or
    /// insert depending on whether a similar memory already exists.
    pub async fn observe(&self, marker: &Marker, session_id: i64, tier: u32) -> anyhow::Result<()> {
        let Marker::Memory { category, service, observation } = marker else {
            anyhow::bail!("observe() called with a non-memory marker");
        };

        let existing = self.store.find_similar_memory(service.as_deref(), category).await?;

        match existing {
            None => {
                self.store
                    .insert_memory(NewMemory {
                        service: service.clone(),
                        category: category.clone(),
                        observation: observation.clone(),
                        confidence: INSERT_CONFIDENCE,
                        originating_session_id: session_id,
                        tier,
                    })
                    .await?;
            }
            Some(existing) => {
                if is_contradiction(observation) {
                    let confidence = clamp_confidence(existing.confidence - CONTRADICT_DELTA);
                    let active = confidence >= 0.3;
                    self.store
                        .update_memory(existing.id, observation.clone(), confidence, active)
                        .await?;
                } else if word_overlap(&existing.observation, observation) >= AGREEMENT_THRESHOLD {
                    let confidence = clamp_confidence(existing.confidence + REINFORCE_DELTA);
                    self.store.update_memory(existing.id, observation.clone(), confidence, true).await?;
                } else {
                    // Neither a clear agreement nor a negation cue: record
                    // the newer observation without moving confidence.
                    self.store
                        .update_memory(existing.id, observation.clone(), existing.confidence, existing.active)
                        .await?;
                }
            }
        }

        Ok(())
    }

    pub async fn decay(&self, grace_days: i64, decay_rate: f64) -> anyhow::Result<()> {
        self.store.decay_stale_memories(grace_days, decay_rate).await?;
        Ok(())
    }
}

fn is_contradiction(observation: &str) -> bool {
    let lower = observation.to_lowercase();
    NEGATION_CUES.iter().any(|cue| lower.contains(cue))
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Loose word-overlap ratio used as the "agreement" heuristic: intersection
/// over the smaller token set, so a short confirming phrase embedded in a
/// longer observation still counts as agreement.
fn word_overlap(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let smaller = ta.len().min(tb.len());
    intersection as f64 / smaller as f64
}

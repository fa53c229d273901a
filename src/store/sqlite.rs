//! `rusqlite`-backed implementation of [`Store`].
//!
//! A single write connection is held behind a `std::sync::Mutex` and
//! reached only from `spawn_blocking` tasks, giving the "single logical
//! writer" guarantee the design calls for. Reads go through a small pool
//! of read-only connections so lookups never queue behind a write. Both
//! connection kinds are opened with WAL journaling and a 5 s busy
//! timeout.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::error::StoreError;

use super::{
    CooldownAction, Event, EventLevel, Memory, NewCooldownAction, NewEvent, NewMemory, NewSession,
    Session, SessionStatus, Store, Trigger, clamp_confidence, migrations,
};

const BUSY_TIMEOUT_MS: u32 = 5_000;
const READ_POOL_MAX: usize = 4;

pub struct SqliteStore {
    writer: Arc<Mutex<Connection>>,
    read_pool: Arc<Mutex<Vec<Connection>>>,
    db_path: PathBuf,
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
    Ok(())
}

fn open_read_conn(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    configure(&conn)?;
    Ok(conn)
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut conn = Connection::open(path)?;
        configure(&conn)?;
        migrations::apply_all(&mut conn)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            read_pool: Arc::new(Mutex::new(Vec::new())),
            db_path: path.to_path_buf(),
        })
    }

    async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = writer.lock().expect("sqlite writer mutex poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|_| StoreError::WorkerGone)?
    }

    async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.read_pool.clone();
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let checked_out = pool.lock().expect("sqlite read pool poisoned").pop();
            let conn = match checked_out {
                Some(c) => c,
                None => open_read_conn(&path)?,
            };
            let result = f(&conn);
            let mut guard = pool.lock().expect("sqlite read pool poisoned");
            if guard.len() < READ_POOL_MAX {
                guard.push(conn);
            }
            result
        })
        .await
        .map_err(|_| StoreError::WorkerGone)?
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let status: String = row.get("status")?;
    let trigger: String = row.get("trigger_kind")?;
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;

    Ok(Session {
        id: row.get("id")?,
        tier: row.get::<_, i64>("tier")? as u32,
        model: row.get("model")?,
        prompt_file: row.get("prompt_file")?,
        custom_prompt: row.get("custom_prompt")?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
        started_at: parse_ts(&started_at),
        ended_at: ended_at.map(|s| parse_ts(&s)),
        exit_code: row.get("exit_code")?,
        log_file: row.get("log_file")?,
        trigger: Trigger::parse(&trigger).unwrap_or(Trigger::Scheduled),
        parent_session_id: row.get("parent_session_id")?,
        response: row.get("response")?,
        cost_usd: row.get("cost_usd")?,
        turns: row.get("turns")?,
        duration_ms: row.get("duration_ms")?,
        summary: row.get("summary")?,
        escalation_context: row.get("escalation_context")?,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_session(&self, row: NewSession) -> Result<i64, StoreError> {
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO sessions (tier, model, prompt_file, custom_prompt, status, started_at, trigger_kind, parent_session_id)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6, ?7)",
                params![
                    row.tier,
                    row.model,
                    row.prompt_file,
                    row.custom_prompt,
                    Utc::now().to_rfc3339(),
                    row.trigger.as_str(),
                    row.parent_session_id,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn update_session_status(&self, id: i64, status: SessionStatus) -> Result<(), StoreError> {
        self.write(move |conn| {
            let current: String = conn.query_row(
                "SELECT status FROM sessions WHERE id = ?1",
                [id],
                |r| r.get(0),
            ).map_err(|_| StoreError::NotFound)?;
            let current = SessionStatus::parse(&current).unwrap_or(SessionStatus::Failed);
            if !current.valid_transition(status) {
                return Err(StoreError::InvalidTransition {
                    from: current.as_str().to_string(),
                    to: status.as_str().to_string(),
                });
            }
            conn.execute(
                "UPDATE sessions SET status = ?1, ended_at = COALESCE(ended_at, ?2) WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_session_result(
        &self,
        id: i64,
        response: Option<String>,
        cost_usd: f64,
        turns: i64,
        duration_ms: i64,
        exit_code: Option<i32>,
        log_file: Option<String>,
    ) -> Result<(), StoreError> {
        self.write(move |conn| {
            conn.execute(
                "UPDATE sessions SET response = ?1, cost_usd = ?2, turns = ?3, duration_ms = ?4,
                 exit_code = ?5, log_file = ?6, ended_at = COALESCE(ended_at, ?7) WHERE id = ?8",
                params![
                    response,
                    cost_usd,
                    turns,
                    duration_ms,
                    exit_code,
                    log_file,
                    Utc::now().to_rfc3339(),
                    id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_session_summary(&self, id: i64, summary: String) -> Result<(), StoreError> {
        self.write(move |conn| {
            conn.execute("UPDATE sessions SET summary = ?1 WHERE id = ?2", params![summary, id])?;
            Ok(())
        })
        .await
    }

    async fn set_session_escalation_context(&self, id: i64, context: String) -> Result<(), StoreError> {
        self.write(move |conn| {
            conn.execute(
                "UPDATE sessions SET escalation_context = ?1 WHERE id = ?2",
                params![context, id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, id: i64) -> Result<Session, StoreError> {
        self.read(move |conn| {
            conn.query_row("SELECT * FROM sessions WHERE id = ?1", [id], row_to_session)
                .optional()?
                .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn list_sessions(&self, limit: i64) -> Result<Vec<Session>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM sessions ORDER BY id DESC LIMIT ?1")?;
            let rows = stmt.query_map([limit], row_to_session)?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }

    async fn get_escalation_chain(&self, id: i64) -> Result<Vec<Session>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "WITH RECURSIVE chain(id) AS (
                    SELECT id FROM sessions WHERE id = ?1
                    UNION
                    SELECT s.id FROM sessions s JOIN chain c ON s.parent_session_id = c.id
                 )
                 SELECT sessions.* FROM sessions JOIN chain ON sessions.id = chain.id ORDER BY sessions.id ASC",
            )?;
            let rows = stmt.query_map([id], row_to_session)?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }

    async fn insert_event(&self, row: NewEvent) -> Result<i64, StoreError> {
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO events (session_id, level, service, message, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![row.session_id, row.level.as_str(), row.service, row.message, Utc::now().to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list_events(&self, limit: i64) -> Result<Vec<Event>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM events ORDER BY id DESC LIMIT ?1")?;
            let rows = stmt.query_map([limit], |row| {
                let level: String = row.get("level")?;
                let created_at: String = row.get("created_at")?;
                Ok(Event {
                    id: row.get("id")?,
                    session_id: row.get("session_id")?,
                    level: EventLevel::parse(&level).unwrap_or(EventLevel::Info),
                    service: row.get("service")?,
                    message: row.get("message")?,
                    created_at: parse_ts(&created_at),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }

    async fn insert_cooldown_action(&self, row: NewCooldownAction) -> Result<i64, StoreError> {
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO cooldown_actions (service, action_type, timestamp, success, tier, error, session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.service,
                    row.action_type,
                    Utc::now().to_rfc3339(),
                    row.success,
                    row.tier,
                    row.error,
                    row.session_id,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn check_cooldown(&self, service: &str, action_type: &str, window_secs: i64) -> Result<i64, StoreError> {
        let service = service.to_string();
        let action_type = action_type.to_string();
        self.read(move |conn| {
            let cutoff = (Utc::now() - chrono::Duration::seconds(window_secs)).to_rfc3339();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM cooldown_actions WHERE service = ?1 AND action_type = ?2 AND timestamp >= ?3",
                params![service, action_type, cutoff],
                |r| r.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    async fn list_cooldown_actions(&self, limit: i64) -> Result<Vec<CooldownAction>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM cooldown_actions ORDER BY id DESC LIMIT ?1")?;
            let rows = stmt.query_map([limit], |row| {
                let timestamp: String = row.get("timestamp")?;
                Ok(CooldownAction {
                    id: row.get("id")?,
                    service: row.get("service")?,
                    action_type: row.get("action_type")?,
                    timestamp: parse_ts(&timestamp),
                    success: row.get("success")?,
                    tier: row.get::<_, i64>("tier")? as u32,
                    error: row.get("error")?,
                    session_id: row.get("session_id")?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }

    async fn insert_memory(&self, row: NewMemory) -> Result<i64, StoreError> {
        self.write(move |conn| {
            let now = Utc::now().to_rfc3339();
            let confidence = clamp_confidence(row.confidence);
            conn.execute(
                "INSERT INTO memories (service, category, observation, confidence, active, created_at, updated_at, originating_session_id, tier)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5, ?6, ?7)",
                params![row.service, row.category, row.observation, confidence, now, row.originating_session_id, row.tier],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn update_memory(&self, id: i64, observation: String, confidence: f64, active: bool) -> Result<(), StoreError> {
        self.write(move |conn| {
            let confidence = clamp_confidence(confidence);
            conn.execute(
                "UPDATE memories SET observation = ?1, confidence = ?2, active = ?3, updated_at = ?4 WHERE id = ?5",
                params![observation, confidence, active, Utc::now().to_rfc3339(), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_memory(&self, id: i64) -> Result<(), StoreError> {
        self.write(move |conn| {
            conn.execute("DELETE FROM memories WHERE id = ?1", [id])?;
            Ok(())
        })
        .await
    }

    async fn find_similar_memory(&self, service: Option<&str>, category: &str) -> Result<Option<Memory>, StoreError> {
        let service = service.map(str::to_string);
        let category = category.to_string();
        self.read(move |conn| {
            let result = conn
                .query_row(
                    "SELECT * FROM memories WHERE category = ?1 AND service IS ?2",
                    params![category, service],
                    row_to_memory,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    async fn get_active_memories(&self, limit: i64) -> Result<Vec<Memory>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM memories WHERE active = 1 AND confidence >= 0.3 ORDER BY confidence DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], row_to_memory)?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }

    async fn list_memories(&self, limit: i64) -> Result<Vec<Memory>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM memories ORDER BY id DESC LIMIT ?1")?;
            let rows = stmt.query_map([limit], row_to_memory)?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }

    async fn decay_stale_memories(&self, grace_days: i64, decay_rate: f64) -> Result<(), StoreError> {
        self.write(move |conn| {
            let cutoff = (Utc::now() - chrono::Duration::days(grace_days)).to_rfc3339();
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE memories SET confidence = MAX(0.0, confidence - ?1), updated_at = ?2
                 WHERE active = 1 AND updated_at < ?3",
                params![decay_rate, Utc::now().to_rfc3339(), cutoff],
            )?;
            tx.execute("UPDATE memories SET active = 0 WHERE active = 1 AND confidence < 0.3", [])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn record_healthy_streak(&self, service: &str) -> Result<i64, StoreError> {
        let service = service.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO service_health_streaks (service, consecutive_healthy, updated_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(service) DO UPDATE SET consecutive_healthy = consecutive_healthy + 1, updated_at = ?2",
                params![service, Utc::now().to_rfc3339()],
            )?;
            let count: i64 = conn.query_row(
                "SELECT consecutive_healthy FROM service_health_streaks WHERE service = ?1",
                [service],
                |r| r.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    async fn reset_healthy_streak(&self, service: &str) -> Result<(), StoreError> {
        let service = service.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO service_health_streaks (service, consecutive_healthy, updated_at) VALUES (?1, 0, ?2)
                 ON CONFLICT(service) DO UPDATE SET consecutive_healthy = 0, updated_at = ?2",
                params![service, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_config(&self, key: &str, fallback: &str) -> Result<String, StoreError> {
        let key = key.to_string();
        let fallback = fallback.to_string();
        self.read(move |conn| {
            let value: Option<String> = conn
                .query_row("SELECT value FROM config WHERE key = ?1", [&key], |r| r.get(0))
                .optional()?;
            Ok(value.unwrap_or(fallback))
        })
        .await
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}

fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Memory {
        id: row.get("id")?,
        service: row.get("service")?,
        category: row.get("category")?,
        observation: row.get("observation")?,
        confidence: row.get("confidence")?,
        active: row.get("active")?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        originating_session_id: row.get("originating_session_id")?,
        tier: row.get::<_, i64>("tier")? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        let dir = tempfile::tempdir().unwrap();
        SqliteStore::open(&dir.path().join("test.sqlite3")).unwrap()
    }

    #[tokio::test]
    async fn insert_and_fetch_session() {
        let store = test_store().await;
        let id = store
            .insert_session(NewSession {
                tier: 1,
                model: "claude-haiku-4-5".into(),
                prompt_file: Some("prompts/tier1.md".into()),
                custom_prompt: None,
                trigger: Trigger::Scheduled,
                parent_session_id: None,
            })
            .await
            .unwrap();

        let session = store.get_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.tier, 1);
    }

    #[tokio::test]
    async fn invalid_status_transition_is_rejected() {
        let store = test_store().await;
        let id = store
            .insert_session(NewSession {
                tier: 1,
                model: "m".into(),
                prompt_file: None,
                custom_prompt: None,
                trigger: Trigger::Manual,
                parent_session_id: None,
            })
            .await
            .unwrap();

        store.update_session_status(id, SessionStatus::Completed).await.unwrap();
        let err = store.update_session_status(id, SessionStatus::Failed).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn escalation_chain_is_root_first() {
        let store = test_store().await;
        let t1 = store
            .insert_session(NewSession {
                tier: 1,
                model: "m".into(),
                prompt_file: None,
                custom_prompt: None,
                trigger: Trigger::Scheduled,
                parent_session_id: None,
            })
            .await
            .unwrap();
        let t2 = store
            .insert_session(NewSession {
                tier: 2,
                model: "m".into(),
                prompt_file: None,
                custom_prompt: None,
                trigger: Trigger::Escalation,
                parent_session_id: Some(t1),
            })
            .await
            .unwrap();
        let t3 = store
            .insert_session(NewSession {
                tier: 3,
                model: "m".into(),
                prompt_file: None,
                custom_prompt: None,
                trigger: Trigger::Escalation,
                parent_session_id: Some(t2),
            })
            .await
            .unwrap();

        let chain = store.get_escalation_chain(t3).await.unwrap();
        assert_eq!(chain.iter().map(|s| s.id).collect::<Vec<_>>(), vec![t1, t2, t3]);
    }

    #[tokio::test]
    async fn memory_reinforcement_increments_confidence() {
        let store = test_store().await;
        let sid = store
            .insert_session(NewSession {
                tier: 1,
                model: "m".into(),
                prompt_file: None,
                custom_prompt: None,
                trigger: Trigger::Scheduled,
                parent_session_id: None,
            })
            .await
            .unwrap();
        let id = store
            .insert_memory(NewMemory {
                service: Some("api".into()),
                category: "latency".into(),
                observation: "p99 elevated".into(),
                confidence: 0.7,
                originating_session_id: sid,
                tier: 1,
            })
            .await
            .unwrap();

        store.update_memory(id, "p99 elevated again".into(), 0.8, true).await.unwrap();
        let found = store.find_similar_memory(Some("api"), "latency").await.unwrap().unwrap();
        assert_eq!(found.confidence, 0.8);
    }

    #[tokio::test]
    async fn decay_deactivates_below_threshold() {
        let store = test_store().await;
        let sid = store
            .insert_session(NewSession {
                tier: 1,
                model: "m".into(),
                prompt_file: None,
                custom_prompt: None,
                trigger: Trigger::Scheduled,
                parent_session_id: None,
            })
            .await
            .unwrap();
        let id = store
            .insert_memory(NewMemory {
                service: None,
                category: "flaky-test".into(),
                observation: "obs".into(),
                confidence: 0.35,
                originating_session_id: sid,
                tier: 1,
            })
            .await
            .unwrap();

        // Force updated_at far enough in the past to cross the grace window.
        store
            .write(move |conn| {
                conn.execute(
                    "UPDATE memories SET updated_at = ?1 WHERE id = ?2",
                    params![(Utc::now() - chrono::Duration::days(60)).to_rfc3339(), id],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        store.decay_stale_memories(30, 0.1).await.unwrap();
        let active = store.get_active_memories(10).await.unwrap();
        assert!(active.iter().all(|m| m.id != id));
    }

    #[tokio::test]
    async fn check_cooldown_counts_within_window() {
        let store = test_store().await;
        let sid = store
            .insert_session(NewSession {
                tier: 2,
                model: "m".into(),
                prompt_file: None,
                custom_prompt: None,
                trigger: Trigger::Escalation,
                parent_session_id: None,
            })
            .await
            .unwrap();
        store
            .insert_cooldown_action(NewCooldownAction {
                service: "web".into(),
                action_type: "restart".into(),
                success: true,
                tier: 2,
                error: None,
                session_id: sid,
            })
            .await
            .unwrap();

        let count = store.check_cooldown("web", "restart", 4 * 3600).await.unwrap();
        assert_eq!(count, 1);
        let count = store.check_cooldown("web", "redeploy", 4 * 3600).await.unwrap();
        assert_eq!(count, 0);
    }
}

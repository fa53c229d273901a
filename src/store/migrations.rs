//! Versioned schema migrations. Each entry is a transactional, idempotent
//! step applied once in ascending order; `schema_migrations` tracks what
//! has already run so re-applying the full list is a no-op.

use rusqlite::{Connection, Transaction};

pub const MIGRATIONS: &[(u32, &str)] = &[
    (1, MIGRATION_1),
    (2, MIGRATION_2),
];

const MIGRATION_1: &str = r#"
CREATE TABLE sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tier INTEGER NOT NULL,
    model TEXT NOT NULL,
    prompt_file TEXT,
    custom_prompt TEXT,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    exit_code INTEGER,
    log_file TEXT,
    trigger_kind TEXT NOT NULL,
    parent_session_id INTEGER REFERENCES sessions(id),
    response TEXT,
    cost_usd REAL,
    turns INTEGER,
    duration_ms INTEGER,
    summary TEXT,
    escalation_context TEXT
);

CREATE INDEX idx_sessions_parent ON sessions(parent_session_id);
CREATE INDEX idx_sessions_status ON sessions(status);

CREATE TABLE events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    level TEXT NOT NULL,
    service TEXT,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_events_session ON events(session_id);

CREATE TABLE memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT,
    category TEXT NOT NULL,
    observation TEXT NOT NULL,
    confidence REAL NOT NULL,
    active INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    originating_session_id INTEGER NOT NULL REFERENCES sessions(id),
    tier INTEGER NOT NULL
);

CREATE INDEX idx_memories_active ON memories(active, confidence);
CREATE INDEX idx_memories_identity ON memories(service, category);

CREATE TABLE cooldown_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT NOT NULL,
    action_type TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    success INTEGER NOT NULL,
    tier INTEGER NOT NULL,
    error TEXT,
    session_id INTEGER NOT NULL REFERENCES sessions(id)
);

CREATE INDEX idx_cooldown_service_action ON cooldown_actions(service, action_type, timestamp);

CREATE TABLE config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const MIGRATION_2: &str = r#"
CREATE TABLE service_health_streaks (
    service TEXT PRIMARY KEY,
    consecutive_healthy INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
"#;

pub fn apply_all(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)",
    )?;

    let applied: std::collections::HashSet<u32> = {
        let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
        let rows = stmt.query_map([], |row| row.get::<_, u32>(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    for (version, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }
        let tx: Transaction = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        tracing::info!(version, "applied schema migration");
    }

    Ok(())
}

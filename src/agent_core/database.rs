//! SQLite persistence for sessions, conversation turns, query records, and
//! extracted facts.
//!
//! Uses `rusqlite` in synchronous mode; callers hold the connection behind a
//! mutex. Every row is keyed by `(session_id, position)` and written with
//! `INSERT OR IGNORE`, so persisting the same delta twice is harmless.

use rusqlite::{params, Connection, OptionalExtension};

use super::errors::AgentError;
use super::query_cache::QueryCache;
use super::types::{
    AppliedDelta, ConversationTurn, ExtractedFact, QueryRecord, QueryStatus, SessionState,
    SessionSummary,
};
use crate::inference::types::Role;

/// Bytes of the first user message shown in session lists.
const PREVIEW_BYTES: usize = 80;

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite database handle for session state.
pub struct AgentDatabase {
    conn: Connection,
}

impl AgentDatabase {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        // WAL is ignored (and harmless) for in-memory databases
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                last_activity TEXT NOT NULL,
                executed_queries INTEGER NOT NULL DEFAULT 0,
                last_verdict TEXT
            );

            CREATE TABLE IF NOT EXISTS conversation_turns (
                session_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (session_id, position),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE TABLE IF NOT EXISTS query_records (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                tool TEXT NOT NULL,
                query TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT,
                turn INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (session_id, seq),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE TABLE IF NOT EXISTS extracted_facts (
                session_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                subject TEXT NOT NULL,
                relation TEXT NOT NULL,
                object TEXT NOT NULL,
                turn INTEGER NOT NULL,
                PRIMARY KEY (session_id, ordinal),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );
            ",
        )?;
        Ok(())
    }

    // ─── Writes ─────────────────────────────────────────────────────────

    /// Persist what a delta added to `state`, plus the session counters.
    ///
    /// `state` must already have the delta applied; fact ordinals are derived
    /// from its length.
    pub fn persist(&self, state: &SessionState, applied: &AppliedDelta) -> Result<(), AgentError> {
        let now = chrono::Utc::now().to_rfc3339();
        let verdict = state
            .last_verdict
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO sessions (id, created_at, last_activity) VALUES (?1, ?2, ?3)",
            params![state.session_id, state.created_at, now],
        )?;
        tx.execute(
            "UPDATE sessions SET last_activity = ?2, executed_queries = ?3, last_verdict = ?4
             WHERE id = ?1",
            params![state.session_id, now, state.executed_queries, verdict],
        )?;

        for turn in &applied.turns {
            tx.execute(
                "INSERT OR IGNORE INTO conversation_turns
                 (session_id, position, role, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    state.session_id,
                    turn.position as i64,
                    turn.role.as_str(),
                    turn.content,
                    turn.timestamp
                ],
            )?;
        }

        for record in &applied.records {
            let result = record
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT OR IGNORE INTO query_records
                 (session_id, seq, tool, query, status, result, error, turn, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    state.session_id,
                    record.seq as i64,
                    record.tool,
                    record.query,
                    record.status.as_str(),
                    result,
                    record.error,
                    record.turn as i64,
                    record.recorded_at
                ],
            )?;
        }

        let first_ordinal = state.facts.len().saturating_sub(applied.facts.len());
        for (i, fact) in applied.facts.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO extracted_facts
                 (session_id, ordinal, subject, relation, object, turn)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    state.session_id,
                    (first_ordinal + i) as i64,
                    fact.subject,
                    fact.relation,
                    fact.object,
                    fact.turn as i64
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete a session and all its turns, records, and facts.
    pub fn delete_session(&self, session_id: &str) -> Result<(), AgentError> {
        let tx = self.conn.unchecked_transaction()?;
        for table in ["extracted_facts", "query_records", "conversation_turns"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE session_id = ?1"),
                params![session_id],
            )?;
        }
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        tx.commit()?;
        Ok(())
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    /// Load a full session, or `None` if it was never persisted.
    pub fn load_session(&self, session_id: &str) -> Result<Option<SessionState>, AgentError> {
        let header = self
            .conn
            .query_row(
                "SELECT created_at, executed_queries, last_verdict FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((created_at, executed_queries, verdict)) = header else {
            return Ok(None);
        };

        Ok(Some(SessionState {
            session_id: session_id.to_string(),
            created_at,
            turns: self.load_turns(session_id)?,
            cache: QueryCache::from_records(self.load_records(session_id)?),
            facts: self.load_facts(session_id)?,
            executed_queries,
            last_verdict: verdict.map(|v| serde_json::from_str(&v)).transpose()?,
        }))
    }

    fn load_turns(&self, session_id: &str) -> Result<Vec<ConversationTurn>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT position, role, content, timestamp FROM conversation_turns
             WHERE session_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            let (position, role, content, timestamp) = row?;
            let role = Role::parse(&role).ok_or_else(|| AgentError::SerializationError {
                reason: format!("unknown role '{role}' at position {position}"),
            })?;
            turns.push(ConversationTurn {
                position: position as usize,
                role,
                content,
                timestamp,
            });
        }
        Ok(turns)
    }

    fn load_records(&self, session_id: &str) -> Result<Vec<QueryRecord>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, tool, query, status, result, error, turn, recorded_at
             FROM query_records WHERE session_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (seq, tool, query, status, result, error, turn, recorded_at) = row?;
            let status = QueryStatus::parse(&status).ok_or_else(|| AgentError::SerializationError {
                reason: format!("unknown query status '{status}' at seq {seq}"),
            })?;
            records.push(QueryRecord {
                seq: seq as usize,
                tool,
                query,
                status,
                result: result.map(|r| serde_json::from_str(&r)).transpose()?,
                error,
                turn: turn as usize,
                recorded_at,
            });
        }
        Ok(records)
    }

    fn load_facts(&self, session_id: &str) -> Result<Vec<ExtractedFact>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT subject, relation, object, turn FROM extracted_facts
             WHERE session_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(ExtractedFact {
                subject: row.get(0)?,
                relation: row.get(1)?,
                object: row.get(2)?,
                turn: row.get::<_, i64>(3)? as usize,
            })
        })?;

        let mut facts = Vec::new();
        for row in rows {
            facts.push(row?);
        }
        Ok(facts)
    }

    /// List all sessions, ordered by most recent activity first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.created_at, s.last_activity,
                    (SELECT COUNT(*) FROM conversation_turns t WHERE t.session_id = s.id),
                    (SELECT COUNT(*) FROM query_records q WHERE q.session_id = s.id),
                    (SELECT content FROM conversation_turns t
                      WHERE t.session_id = s.id AND t.role = 'user'
                      ORDER BY t.position LIMIT 1)
             FROM sessions s
             ORDER BY s.last_activity DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                created_at: row.get(1)?,
                last_activity: row.get(2)?,
                turn_count: row.get::<_, i64>(3)? as usize,
                query_count: row.get::<_, i64>(4)? as usize,
                preview: row
                    .get::<_, Option<String>>(5)?
                    .map(|p| super::tokens::preview(&p, PREVIEW_BYTES)),
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::types::{
    Episode, EpisodeOutcome, ExecutionStatus, PolicyEntry, SequenceStats, ToolExecution,
    ToolMetrics,
};

/// SQLite-backed persistence for the execution ledger, the Q-table, and
/// episode history.
///
/// One connection, opened once and shared behind a mutex; every write path
/// in the crate funnels through here, which is what makes the per-key
/// Q-value read-modify-write in [`q_learning_step`](Self::q_learning_step)
/// atomic.
pub struct LearnStorage {
    conn: Mutex<Connection>,
}

/// Result of one Q-learning step applied to a policy cell.
#[derive(Debug, Clone, Copy)]
pub struct QStep {
    pub q_value: f64,
    pub td_error: f64,
    pub visit_count: u32,
}

impl LearnStorage {
    /// Open (or create) the database at the given file path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (useful for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tool_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                arguments TEXT NOT NULL DEFAULT '{}',
                context_hash TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                execution_time_ms INTEGER,
                user_rating INTEGER,
                user_comment TEXT,
                reward REAL
            );
            CREATE INDEX IF NOT EXISTS idx_executions_tool
                ON tool_executions(tool_name);
            CREATE INDEX IF NOT EXISTS idx_executions_session
                ON tool_executions(session_id);

            CREATE TABLE IF NOT EXISTS policy_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tool_name TEXT NOT NULL,
                context_hash TEXT NOT NULL,
                q_value REAL NOT NULL DEFAULT 0.0,
                visit_count INTEGER NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL,
                UNIQUE(tool_name, context_hash)
            );

            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                tool_sequence TEXT NOT NULL DEFAULT '[]',
                episode_reward REAL NOT NULL DEFAULT 0.0,
                outcome TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_episodes_session
                ON episodes(session_id);

            CREATE TABLE IF NOT EXISTS tool_sequences (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sequence_key TEXT NOT NULL UNIQUE,
                count INTEGER NOT NULL DEFAULT 1,
                avg_reward REAL NOT NULL DEFAULT 0.0,
                success_rate REAL NOT NULL DEFAULT 0.0,
                last_seen TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── execution ledger ─────────────────────────────────────────────

    /// Insert a freshly started execution row (status pending).
    pub fn insert_execution(&self, row: &ToolExecution) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tool_executions
                (execution_id, session_id, tool_name, arguments, context_hash,
                 status, started_at, completed_at, execution_time_ms,
                 user_rating, user_comment, reward)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.execution_id,
                row.session_id,
                row.tool_name,
                row.arguments,
                row.context_hash,
                row.status.as_str(),
                row.started_at,
                row.completed_at,
                row.execution_time_ms.map(|ms| ms as i64),
                row.user_rating,
                row.user_comment,
                row.reward,
            ],
        )?;
        Ok(())
    }

    /// Record the terminal status, latency and reward for an execution.
    /// Returns false if no row with that execution id exists.
    pub fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        execution_time_ms: u64,
        completed_at: &str,
        reward: f64,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE tool_executions
             SET status = ?1, execution_time_ms = ?2, completed_at = ?3, reward = ?4
             WHERE execution_id = ?5 AND status = 'pending'",
            params![
                status.as_str(),
                execution_time_ms as i64,
                completed_at,
                reward,
                execution_id,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Attach a user rating (and the recomputed reward) to a completed
    /// execution. Returns false if no matching row exists.
    pub fn set_user_rating(
        &self,
        execution_id: &str,
        rating: u8,
        comment: Option<&str>,
        reward: f64,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE tool_executions
             SET user_rating = ?1, user_comment = ?2, reward = ?3
             WHERE execution_id = ?4",
            params![rating, comment, reward, execution_id],
        )?;
        Ok(affected > 0)
    }

    /// Fetch a single execution by its id.
    pub fn get_execution(&self, execution_id: &str) -> Result<Option<ToolExecution>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM tool_executions WHERE execution_id = ?1"),
                params![execution_id],
                execution_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Most-recent-first executions, optionally filtered by tool name.
    pub fn recent_executions(
        &self,
        tool_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ToolExecution>> {
        let conn = self.conn.lock();
        let mut results = Vec::new();
        match tool_name {
            Some(tool) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM tool_executions
                     WHERE tool_name = ?1
                     ORDER BY started_at DESC, id DESC
                     LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![tool, limit as i64], execution_from_row)?;
                for row in rows {
                    results.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM tool_executions
                     ORDER BY started_at DESC, id DESC
                     LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], execution_from_row)?;
                for row in rows {
                    results.push(row?);
                }
            }
        }
        Ok(results)
    }

    /// Per-tool aggregates over the whole ledger. Success rate counts only
    /// completed rows; pending attempts are excluded from the denominator.
    pub fn tool_metrics(&self) -> Result<Vec<ToolMetrics>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tool_name,
                    COUNT(*),
                    AVG(CASE WHEN status = 'success' THEN 1.0
                             WHEN status = 'error' THEN 0.0 END),
                    AVG(execution_time_ms),
                    AVG(user_rating)
             FROM tool_executions
             GROUP BY tool_name
             ORDER BY tool_name",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(ToolMetrics {
                tool_name: row.get(0)?,
                total_calls: row.get::<_, i64>(1)? as u64,
                success_rate: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                avg_execution_time_ms: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                avg_user_rating: row.get(4)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Average latency of completed calls for one tool, if any were recorded.
    pub fn avg_execution_time_ms(&self, tool_name: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(execution_time_ms) FROM tool_executions WHERE tool_name = ?1",
            params![tool_name],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    /// Total number of ledger rows.
    pub fn execution_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM tool_executions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ── policy entries ───────────────────────────────────────────────

    /// Load a single Q-table cell.
    pub fn load_policy_entry(
        &self,
        tool_name: &str,
        context_hash: &str,
    ) -> Result<Option<PolicyEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT tool_name, context_hash, q_value, visit_count, last_updated
                 FROM policy_entries
                 WHERE tool_name = ?1 AND context_hash = ?2",
                params![tool_name, context_hash],
                policy_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Load the full Q-table (used to prime the in-memory cache).
    pub fn all_policy_entries(&self) -> Result<Vec<PolicyEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tool_name, context_hash, q_value, visit_count, last_updated
             FROM policy_entries",
        )?;
        let rows = stmt.query_map([], policy_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Apply one Q-learning step to a cell, creating it at q=0 if absent.
    ///
    /// The read of the old value and the write of the new one happen under a
    /// single acquisition of the connection lock, so concurrent updates to
    /// the same (tool, context) key serialize rather than losing writes.
    pub fn q_learning_step(
        &self,
        tool_name: &str,
        context_hash: &str,
        td_target: f64,
        learning_rate: f64,
        now: &str,
    ) -> Result<QStep> {
        let conn = self.conn.lock();
        let existing: Option<(f64, u32)> = conn
            .query_row(
                "SELECT q_value, visit_count FROM policy_entries
                 WHERE tool_name = ?1 AND context_hash = ?2",
                params![tool_name, context_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (old_q, old_visits) = existing.unwrap_or((0.0, 0));
        let td_error = td_target - old_q;
        let new_q = old_q + learning_rate * td_error;
        let visit_count = old_visits + 1;

        conn.execute(
            "INSERT INTO policy_entries
                (tool_name, context_hash, q_value, visit_count, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tool_name, context_hash) DO UPDATE SET
                q_value = excluded.q_value,
                visit_count = excluded.visit_count,
                last_updated = excluded.last_updated",
            params![tool_name, context_hash, new_q, visit_count, now],
        )?;

        Ok(QStep {
            q_value: new_q,
            td_error,
            visit_count,
        })
    }

    /// Number of distinct Q-table cells.
    pub fn policy_entry_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM policy_entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ── episodes ─────────────────────────────────────────────────────

    /// Append a finished episode.
    pub fn insert_episode(&self, episode: &Episode) -> Result<i64> {
        let sequence_json = serde_json::to_string(&episode.tool_sequence)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO episodes
                (session_id, tool_sequence, episode_reward, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                episode.session_id,
                sequence_json,
                episode.episode_reward,
                episode.outcome.as_str(),
                episode.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Success-outcome episodes ordered by reward descending, optionally
    /// filtered to those whose tool sequence contains `tool_name`.
    ///
    /// The tool filter is applied in Rust after fetching a wider window,
    /// since the sequence is stored as a JSON array.
    pub fn successful_episodes(
        &self,
        tool_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        let fetch = if tool_name.is_some() { limit * 2 } else { limit };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, tool_sequence, episode_reward, outcome, created_at
             FROM episodes
             WHERE outcome = 'success'
             ORDER BY episode_reward DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![fetch as i64], episode_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        if let Some(tool) = tool_name {
            results.retain(|e| e.tool_sequence.iter().any(|t| t == tool));
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Total number of recorded episodes.
    pub fn episode_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ── tool sequences (n-grams) ─────────────────────────────────────

    /// Upsert an n-gram observation, maintaining running averages for
    /// reward and success rate. Returns the stats after the update.
    pub fn upsert_sequence(
        &self,
        sequence_key: &str,
        reward: f64,
        success: bool,
        now: &str,
    ) -> Result<SequenceStats> {
        let conn = self.conn.lock();
        let existing: Option<(u32, f64, f64)> = conn
            .query_row(
                "SELECT count, avg_reward, success_rate FROM tool_sequences
                 WHERE sequence_key = ?1",
                params![sequence_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let success_val = if success { 1.0 } else { 0.0 };
        let (count, avg_reward, success_rate) = match existing {
            Some((old_count, old_avg, old_rate)) => {
                let count = old_count + 1;
                let avg_reward = (old_avg * f64::from(old_count) + reward) / f64::from(count);
                let success_rate =
                    (old_rate * f64::from(old_count) + success_val) / f64::from(count);
                (count, avg_reward, success_rate)
            }
            None => (1, reward, success_val),
        };

        conn.execute(
            "INSERT INTO tool_sequences
                (sequence_key, count, avg_reward, success_rate, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(sequence_key) DO UPDATE SET
                count = excluded.count,
                avg_reward = excluded.avg_reward,
                success_rate = excluded.success_rate,
                last_seen = excluded.last_seen",
            params![sequence_key, count, avg_reward, success_rate, now],
        )?;

        Ok(SequenceStats {
            sequence_key: sequence_key.to_string(),
            count,
            avg_reward,
            success_rate,
            last_seen: now.to_string(),
        })
    }

    /// Fetch stats for one n-gram key.
    pub fn get_sequence(&self, sequence_key: &str) -> Result<Option<SequenceStats>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT sequence_key, count, avg_reward, success_rate, last_seen
                 FROM tool_sequences
                 WHERE sequence_key = ?1",
                params![sequence_key],
                |row| {
                    Ok(SequenceStats {
                        sequence_key: row.get(0)?,
                        count: row.get(1)?,
                        avg_reward: row.get(2)?,
                        success_rate: row.get(3)?,
                        last_seen: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

const EXECUTION_COLUMNS: &str = "execution_id, session_id, tool_name, arguments, context_hash, \
     status, started_at, completed_at, execution_time_ms, user_rating, user_comment, reward";

fn execution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolExecution> {
    let status: String = row.get(5)?;
    Ok(ToolExecution {
        execution_id: row.get(0)?,
        session_id: row.get(1)?,
        tool_name: row.get(2)?,
        arguments: row.get(3)?,
        context_hash: row.get(4)?,
        status: ExecutionStatus::from_db(&status),
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        execution_time_ms: row.get::<_, Option<i64>>(8)?.map(|ms| ms as u64),
        user_rating: row.get(9)?,
        user_comment: row.get(10)?,
        reward: row.get(11)?,
    })
}

fn policy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PolicyEntry> {
    Ok(PolicyEntry {
        tool_name: row.get(0)?,
        context_hash: row.get(1)?,
        q_value: row.get(2)?,
        visit_count: row.get(3)?,
        last_updated: row.get(4)?,
    })
}

fn episode_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let sequence_json: String = row.get(1)?;
    let outcome: String = row.get(3)?;
    Ok(Episode {
        session_id: row.get(0)?,
        tool_sequence: serde_json::from_str(&sequence_json).unwrap_or_default(),
        episode_reward: row.get(2)?,
        outcome: EpisodeOutcome::from_db(&outcome),
        created_at: row.get(4)?,
    })
}

//! Document store over SQLite. Each collection is a table of indexed columns
//! plus the full record as a JSON doc; range queries go through the columns,
//! reads decode the doc. `with_tx` is the only write path for multi-document
//! mutations: one mutex plus one SQL transaction serializes every
//! read-modify-write cycle, which is what keeps vault totals and room counters
//! consistent under concurrent callers.

use std::ops::Deref;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CoreError, CoreResult};
use crate::types::{
    Application, KeyLock, MotionEvent, MotionScore, Room, RoomStatus, Vault,
};

pub struct Store {
    conn: Mutex<Connection>,
}

/// Transaction scope handed to `with_tx` closures. Derefs to `Connection`, so
/// every read helper works identically inside and outside a transaction.
pub struct Tx<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl<'a> Deref for Tx<'a> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

impl Store {
    pub fn open(path: &str) -> CoreResult<Self> {
        let store = Self { conn: Mutex::new(Connection::open(path)?) };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> CoreResult<()> {
        let conn = self.lock_conn();
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                end_time_ms INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rooms_status ON rooms(status, end_time_ms);
            CREATE TABLE IF NOT EXISTS applications (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                priority_score REAL NOT NULL,
                applied_at_ms INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_apps_room ON applications(room_id, status);
            CREATE INDEX IF NOT EXISTS idx_apps_user ON applications(user_id);
            CREATE TABLE IF NOT EXISTS key_locks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                room_id TEXT NOT NULL,
                status TEXT NOT NULL,
                amount INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_locks_user ON key_locks(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_locks_pair ON key_locks(user_id, room_id, status);
            CREATE TABLE IF NOT EXISTS vaults (
                user_id TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS motion_scores (
                user_id TEXT PRIMARY KEY,
                current_score INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS motion_events (
                id TEXT PRIMARY KEY,
                actor_id TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_actor ON motion_events(actor_id, ts_ms);
            COMMIT;",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex still holds a usable connection; recover it.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside a single serialized transaction. Commit on Ok, roll back
    /// on Err. Nested calls are not supported; compose inside one closure.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Tx) -> CoreResult<T>) -> CoreResult<T> {
        let mut conn = self.lock_conn();
        let tx = Tx { tx: conn.transaction()? };
        match f(&tx) {
            Ok(value) => {
                tx.tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.tx.rollback();
                Err(err)
            }
        }
    }

    /// Read-only access outside any transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let conn = self.lock_conn();
        f(&conn)
    }
}

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

// ---------------------------------------------------------------------------
// rooms
// ---------------------------------------------------------------------------

pub fn put_room(conn: &Connection, room: &Room) -> CoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO rooms (id, status, end_time_ms, created_at_ms, doc)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            room.id,
            room.status.as_str(),
            ms(room.end_time),
            ms(room.created_at),
            serde_json::to_string(room)?
        ],
    )?;
    Ok(())
}

pub fn get_room(conn: &Connection, id: &str) -> CoreResult<Option<Room>> {
    let doc: Option<String> = conn
        .query_row("SELECT doc FROM rooms WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    decode_opt(doc)
}

pub fn require_room(conn: &Connection, id: &str) -> CoreResult<Room> {
    get_room(conn, id)?.ok_or_else(|| CoreError::not_found("room", id))
}

pub fn delete_room(conn: &Connection, id: &str) -> CoreResult<bool> {
    let n = conn.execute("DELETE FROM rooms WHERE id = ?1", params![id])?;
    Ok(n > 0)
}

pub fn list_rooms_by_status(conn: &Connection, statuses: &[RoomStatus]) -> CoreResult<Vec<Room>> {
    let mut out = Vec::new();
    for status in statuses {
        let mut stmt = conn.prepare(
            "SELECT doc FROM rooms WHERE status = ?1 ORDER BY created_at_ms DESC",
        )?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, String>(0))?;
        for doc in rows {
            out.push(serde_json::from_str(&doc?)?);
        }
    }
    Ok(out)
}

/// Rooms the status sweep still owns: everything not closed or archived.
pub fn list_live_rooms(conn: &Connection) -> CoreResult<Vec<Room>> {
    list_rooms_by_status(conn, &[RoomStatus::Open, RoomStatus::Hot, RoomStatus::Closing])
}

pub fn list_closed_since(conn: &Connection, since: DateTime<Utc>) -> CoreResult<Vec<Room>> {
    let mut stmt = conn.prepare(
        "SELECT doc FROM rooms WHERE status = 'closed' AND end_time_ms >= ?1",
    )?;
    let rows = stmt.query_map(params![ms(since)], |row| row.get::<_, String>(0))?;
    collect_docs(rows)
}

pub fn count_rooms_by_status(conn: &Connection, status: RoomStatus) -> CoreResult<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM rooms WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Live rooms whose end time falls inside (now, now + window].
pub fn count_rooms_expiring_within(
    conn: &Connection,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> CoreResult<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM rooms
         WHERE status IN ('open', 'hot', 'closing')
           AND end_time_ms > ?1 AND end_time_ms <= ?2",
        params![ms(now), ms(now + window)],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Live rooms already past their end time, waiting on the next sweep.
pub fn count_rooms_overdue(conn: &Connection, now: DateTime<Utc>) -> CoreResult<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM rooms
         WHERE status IN ('open', 'hot', 'closing') AND end_time_ms <= ?1",
        params![ms(now)],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

// ---------------------------------------------------------------------------
// applications
// ---------------------------------------------------------------------------

pub fn put_application(conn: &Connection, app: &Application) -> CoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO applications
         (id, room_id, user_id, status, priority_score, applied_at_ms, doc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            app.id,
            app.room_id,
            app.user_id,
            app.status.as_str(),
            app.priority_score,
            ms(app.applied_at),
            serde_json::to_string(app)?
        ],
    )?;
    Ok(())
}

pub fn get_application(conn: &Connection, id: &str) -> CoreResult<Option<Application>> {
    let doc: Option<String> = conn
        .query_row("SELECT doc FROM applications WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    decode_opt(doc)
}

pub fn require_application(conn: &Connection, id: &str) -> CoreResult<Application> {
    get_application(conn, id)?.ok_or_else(|| CoreError::not_found("application", id))
}

/// The at-most-one non-withdrawn application for a (user, room) pair.
pub fn find_active_application(
    conn: &Connection,
    room_id: &str,
    user_id: &str,
) -> CoreResult<Option<Application>> {
    let doc: Option<String> = conn
        .query_row(
            "SELECT doc FROM applications
             WHERE room_id = ?1 AND user_id = ?2 AND status != 'withdrawn'
             LIMIT 1",
            params![room_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    decode_opt(doc)
}

/// Priority queue read: score descending, insertion order breaks ties.
pub fn list_applications_for_room(conn: &Connection, room_id: &str) -> CoreResult<Vec<Application>> {
    let mut stmt = conn.prepare(
        "SELECT doc FROM applications WHERE room_id = ?1
         ORDER BY priority_score DESC, applied_at_ms ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![room_id], |row| row.get::<_, String>(0))?;
    collect_docs(rows)
}

pub fn list_pending_for_room(conn: &Connection, room_id: &str) -> CoreResult<Vec<Application>> {
    let mut stmt = conn.prepare(
        "SELECT doc FROM applications WHERE room_id = ?1 AND status = 'pending'
         ORDER BY priority_score DESC, applied_at_ms ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![room_id], |row| row.get::<_, String>(0))?;
    collect_docs(rows)
}

/// Applications settlement may still owe a release or forfeit: pending ones,
/// plus accepted ones whose lock was withheld at accept time. Rejected and
/// withdrawn applications released their lock when they went terminal.
pub fn list_settleable_for_room(conn: &Connection, room_id: &str) -> CoreResult<Vec<Application>> {
    let mut stmt = conn.prepare(
        "SELECT doc FROM applications WHERE room_id = ?1 AND status IN ('pending', 'accepted')
         ORDER BY priority_score DESC, applied_at_ms ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![room_id], |row| row.get::<_, String>(0))?;
    collect_docs(rows)
}

pub fn list_applications_by_user(conn: &Connection, user_id: &str) -> CoreResult<Vec<Application>> {
    let mut stmt = conn.prepare(
        "SELECT doc FROM applications WHERE user_id = ?1 ORDER BY applied_at_ms DESC",
    )?;
    let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
    collect_docs(rows)
}

// ---------------------------------------------------------------------------
// key locks
// ---------------------------------------------------------------------------

pub fn put_lock(conn: &Connection, lock: &KeyLock) -> CoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO key_locks (id, user_id, room_id, status, amount, doc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            lock.id,
            lock.user_id,
            lock.room_id,
            lock.status.as_str(),
            lock.amount as i64,
            serde_json::to_string(lock)?
        ],
    )?;
    Ok(())
}

pub fn get_lock(conn: &Connection, id: &str) -> CoreResult<Option<KeyLock>> {
    let doc: Option<String> = conn
        .query_row("SELECT doc FROM key_locks WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    decode_opt(doc)
}

pub fn require_lock(conn: &Connection, id: &str) -> CoreResult<KeyLock> {
    get_lock(conn, id)?.ok_or_else(|| CoreError::not_found("key_lock", id))
}

pub fn find_active_lock(
    conn: &Connection,
    user_id: &str,
    room_id: &str,
) -> CoreResult<Option<KeyLock>> {
    let doc: Option<String> = conn
        .query_row(
            "SELECT doc FROM key_locks
             WHERE user_id = ?1 AND room_id = ?2 AND status = 'locked'
             LIMIT 1",
            params![user_id, room_id],
            |row| row.get(0),
        )
        .optional()?;
    decode_opt(doc)
}

/// Ledger reconciliation read: sum of this user's locked-status amounts.
pub fn sum_locked_for_user(conn: &Connection, user_id: &str) -> CoreResult<u64> {
    let n: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM key_locks
         WHERE user_id = ?1 AND status = 'locked'",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(n.max(0) as u64)
}

// ---------------------------------------------------------------------------
// vaults
// ---------------------------------------------------------------------------

pub fn put_vault(conn: &Connection, vault: &Vault) -> CoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO vaults (user_id, doc) VALUES (?1, ?2)",
        params![vault.user_id, serde_json::to_string(vault)?],
    )?;
    Ok(())
}

pub fn get_vault(conn: &Connection, user_id: &str) -> CoreResult<Option<Vault>> {
    let doc: Option<String> = conn
        .query_row("SELECT doc FROM vaults WHERE user_id = ?1", params![user_id], |row| row.get(0))
        .optional()?;
    decode_opt(doc)
}

// ---------------------------------------------------------------------------
// motion scores + events
// ---------------------------------------------------------------------------

pub fn put_score(conn: &Connection, score: &MotionScore) -> CoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO motion_scores (user_id, current_score, doc)
         VALUES (?1, ?2, ?3)",
        params![score.user_id, score.current_score as i64, serde_json::to_string(score)?],
    )?;
    Ok(())
}

pub fn get_score(conn: &Connection, user_id: &str) -> CoreResult<Option<MotionScore>> {
    let doc: Option<String> = conn
        .query_row(
            "SELECT doc FROM motion_scores WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    decode_opt(doc)
}

pub fn list_score_user_ids(conn: &Connection) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT user_id FROM motion_scores")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for id in rows {
        out.push(id?);
    }
    Ok(out)
}

pub fn leaderboard(conn: &Connection, limit: u32) -> CoreResult<Vec<MotionScore>> {
    let mut stmt = conn.prepare(
        "SELECT doc FROM motion_scores ORDER BY current_score DESC, user_id ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
    collect_docs(rows)
}

/// 1-based rank by current score; None for users with no score record.
pub fn score_rank(conn: &Connection, user_id: &str) -> CoreResult<Option<u64>> {
    let current: Option<i64> = conn
        .query_row(
            "SELECT current_score FROM motion_scores WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(current) = current else { return Ok(None) };
    let higher: i64 = conn.query_row(
        "SELECT COUNT(*) FROM motion_scores WHERE current_score > ?1",
        params![current],
        |row| row.get(0),
    )?;
    Ok(Some(higher as u64 + 1))
}

pub fn insert_event(conn: &Connection, event: &MotionEvent) -> CoreResult<()> {
    // Append-only: plain INSERT so an id collision surfaces instead of
    // silently rewriting history.
    conn.execute(
        "INSERT INTO motion_events (id, actor_id, ts_ms, doc) VALUES (?1, ?2, ?3, ?4)",
        params![event.id, event.actor_id, ms(event.ts), serde_json::to_string(event)?],
    )?;
    Ok(())
}

pub fn list_events_for_actor_since(
    conn: &Connection,
    actor_id: &str,
    since: DateTime<Utc>,
) -> CoreResult<Vec<MotionEvent>> {
    let mut stmt = conn.prepare(
        "SELECT doc FROM motion_events WHERE actor_id = ?1 AND ts_ms >= ?2 ORDER BY ts_ms ASC",
    )?;
    let rows = stmt.query_map(params![actor_id, ms(since)], |row| row.get::<_, String>(0))?;
    collect_docs(rows)
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn decode_opt<T: serde::de::DeserializeOwned>(doc: Option<String>) -> CoreResult<Option<T>> {
    match doc {
        Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
        None => Ok(None),
    }
}

fn collect_docs<T: serde::de::DeserializeOwned>(
    rows: impl Iterator<Item = Result<String, rusqlite::Error>>,
) -> CoreResult<Vec<T>> {
    let mut out = Vec::new();
    for doc in rows {
        out.push(serde_json::from_str(&doc?)?);
    }
    Ok(out)
}

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::errors::AppResult;
use crate::place::{PlaceRecord, Provenance};

pub const DEFAULT_COMMIT_EVERY: usize = 50;

struct CacheState {
    conn: Connection,
    pending_writes: usize,
}

/// On-disk store for raw search responses, canonical places and travel durations.
///
/// Writes are grouped into one transaction that commits every `commit_every`
/// writes; `flush` (and drop) commits whatever is pending.
pub struct Cache {
    state: Mutex<CacheState>,
    commit_every: usize,
    path: Option<PathBuf>,
}

impl Cache {
    pub fn open<P: AsRef<Path>>(path: P, commit_every: usize) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let cache = Self::from_connection(conn, commit_every, Some(path.to_path_buf()))?;
        info!(target: "cache", path = %path.display(), "response cache opened");
        Ok(cache)
    }

    pub fn in_memory() -> AppResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, DEFAULT_COMMIT_EVERY, None)
    }

    fn from_connection(
        conn: Connection,
        commit_every: usize,
        path: Option<PathBuf>,
    ) -> AppResult<Self> {
        apply_pragmas(&conn);
        run_migrations(&conn)?;
        Ok(Self {
            state: Mutex::new(CacheState {
                conn,
                pending_writes: 0,
            }),
            commit_every: commit_every.max(1),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get_search_response(&self, key: &str) -> AppResult<Option<Value>> {
        let state = self.state.lock();
        let raw: Option<String> = state
            .conn
            .query_row(
                "SELECT response_json FROM search_cache WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => match serde_json::from_str(&text) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    warn!(target: "cache", ?err, key, "discarding unreadable cached response");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn set_search_response(&self, key: &str, response: &Value) -> AppResult<()> {
        let payload = serde_json::to_string(response)?;
        self.write(|conn| {
            conn.execute(
                "INSERT INTO search_cache (key, response_json, created_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    response_json = excluded.response_json,
                    created_at = excluded.created_at",
                (key, payload.as_str(), Utc::now().to_rfc3339()),
            )?;
            Ok(())
        })
    }

    pub fn upsert_place(&self, place: &PlaceRecord) -> AppResult<()> {
        let types_json = serde_json::to_string(&place.types)?;
        let found_by_json = serde_json::to_string(&place.found_by)?;
        let user_rating_count = place.user_rating_count.map(|v| v as i64);
        self.write(|conn| {
            conn.execute(
                "INSERT INTO places (place_id, name, rating, user_rating_count, lat, lon,
                    business_status, types_json, found_by_json, last_seen_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(place_id) DO UPDATE SET
                    name = excluded.name,
                    rating = excluded.rating,
                    user_rating_count = excluded.user_rating_count,
                    lat = excluded.lat,
                    lon = excluded.lon,
                    business_status = excluded.business_status,
                    types_json = excluded.types_json,
                    found_by_json = excluded.found_by_json,
                    last_seen_at = excluded.last_seen_at",
                rusqlite::params![
                    place.place_id,
                    place.name,
                    place.rating,
                    user_rating_count,
                    place.lat,
                    place.lon,
                    place.business_status,
                    types_json,
                    found_by_json,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_place(&self, place_id: &str) -> AppResult<Option<PlaceRecord>> {
        let state = self.state.lock();
        state
            .conn
            .query_row(
                "SELECT place_id, name, rating, user_rating_count, lat, lon, business_status,
                    types_json, found_by_json
                FROM places WHERE place_id = ?1",
                [place_id],
                parse_place_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn place_count(&self) -> AppResult<u64> {
        let state = self.state.lock();
        let count: i64 = state
            .conn
            .query_row("SELECT COUNT(*) FROM places", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// `Some(None)` is a cached "no route" answer, `None` a miss.
    pub fn get_travel_duration(&self, key: &str) -> AppResult<Option<Option<u64>>> {
        let state = self.state.lock();
        let row: Option<Option<i64>> = state
            .conn
            .query_row(
                "SELECT duration_seconds FROM travel_cache WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.map(|duration| duration.map(|secs| secs.max(0) as u64)))
    }

    pub fn set_travel_duration(
        &self,
        key: &str,
        origin_id: &str,
        place_id: &str,
        mode: &str,
        duration_seconds: Option<u64>,
    ) -> AppResult<()> {
        let duration = duration_seconds.map(|secs| secs as i64);
        self.write(|conn| {
            conn.execute(
                "INSERT INTO travel_cache (key, origin_id, place_id, mode, duration_seconds, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(key) DO UPDATE SET
                    duration_seconds = excluded.duration_seconds,
                    created_at = excluded.created_at",
                rusqlite::params![key, origin_id, place_id, mode, duration, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn pending_writes(&self) -> usize {
        self.state.lock().pending_writes
    }

    /// Commits any open write batch.
    pub fn flush(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        commit_locked(&mut state)
    }

    fn write<F>(&self, op: F) -> AppResult<()>
    where
        F: FnOnce(&Connection) -> AppResult<()>,
    {
        let mut state = self.state.lock();
        if state.pending_writes == 0 && state.conn.is_autocommit() {
            state.conn.execute_batch("BEGIN")?;
        }
        op(&state.conn)?;
        state.pending_writes += 1;
        if state.pending_writes >= self.commit_every {
            commit_locked(&mut state)?;
        }
        Ok(())
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(err) = commit_locked(&mut state) {
            warn!(target: "cache", ?err, "failed to flush cache on close");
        }
    }
}

fn commit_locked(state: &mut CacheState) -> AppResult<()> {
    if !state.conn.is_autocommit() {
        state.conn.execute_batch("COMMIT")?;
        debug!(target: "cache", writes = state.pending_writes, "cache batch committed");
    }
    state.pending_writes = 0;
    Ok(())
}

fn apply_pragmas(conn: &Connection) {
    // In-memory databases refuse WAL; that is not worth failing over.
    if let Err(err) = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;") {
        debug!(target: "cache", ?err, "cache pragmas not applied");
    }
}

fn run_migrations(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS search_cache (
            key TEXT PRIMARY KEY,
            response_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS places (
            place_id TEXT PRIMARY KEY,
            name TEXT,
            rating REAL,
            user_rating_count INTEGER,
            lat REAL,
            lon REAL,
            business_status TEXT,
            types_json TEXT,
            found_by_json TEXT,
            last_seen_at TEXT
        );

        CREATE TABLE IF NOT EXISTS travel_cache (
            key TEXT PRIMARY KEY,
            origin_id TEXT NOT NULL,
            place_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            duration_seconds INTEGER,
            created_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn parse_place_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlaceRecord> {
    let types_json: Option<String> = row.get(7)?;
    let found_by_json: Option<String> = row.get(8)?;
    let user_rating_count: Option<i64> = row.get(3)?;
    Ok(PlaceRecord {
        place_id: row.get(0)?,
        name: row.get(1)?,
        rating: row.get(2)?,
        user_rating_count: user_rating_count.map(|v| v.max(0) as u64),
        lat: row.get(4)?,
        lon: row.get(5)?,
        business_status: row.get(6)?,
        types: types_json
            .and_then(|text| serde_json::from_str::<Vec<String>>(&text).ok())
            .unwrap_or_default(),
        found_by: found_by_json
            .and_then(|text| serde_json::from_str::<Vec<Provenance>>(&text).ok())
            .unwrap_or_default(),
        ..PlaceRecord::default()
    })
}

/// Per-call cache switches: `no_cache` disables reads and writes, `refresh`
/// only skips reads so fresh answers still land in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    pub no_cache: bool,
    pub refresh: bool,
}

impl CachePolicy {
    pub fn reads(&self) -> bool {
        !self.no_cache && !self.refresh
    }

    pub fn writes(&self) -> bool {
        !self.no_cache
    }
}

/// Run-scoped record of requests already issued, with their payloads when kept.
#[derive(Debug)]
pub struct RequestMemo<V> {
    seen: HashSet<String>,
    payloads: HashMap<String, V>,
}

impl<V> Default for RequestMemo<V> {
    fn default() -> Self {
        Self {
            seen: HashSet::new(),
            payloads: HashMap::new(),
        }
    }
}

impl<V: Clone> RequestMemo<V> {
    /// `Some(payload)` when the key was already issued this run.
    pub fn lookup(&self, key: &str) -> Option<Option<V>> {
        if self.seen.contains(key) {
            Some(self.payloads.get(key).cloned())
        } else {
            None
        }
    }

    pub fn remember(&mut self, key: &str, payload: Option<V>) {
        self.seen.insert(key.to_string());
        if let Some(payload) = payload {
            self.payloads.insert(key.to_string(), payload);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Content hash of a request; logically equal bodies collide regardless of key order.
pub fn make_request_cache_key(url: &str, field_mask: &str, body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"|");
    hasher.update(field_mask.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(body).as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

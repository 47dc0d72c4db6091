//! SQLite persistence: WAL mode, 5 tables, append-only history.
//!
//! Schema: planes, callsigns, squawks, locations, messages. Scalars live on
//! the `planes` row and are overwritten on every save; everything else is
//! only ever inserted. Timestamps are unix seconds stored as REAL.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row, Transaction};
use serde::Serialize;

use sbs_core::plane::PlaneAggregate;
use sbs_core::store::{PlaneStore, StoreError, StoreResult};
use sbs_core::types::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS planes (
    icao TEXT PRIMARY KEY,
    callsign TEXT,
    squawk TEXT,
    altitude_ft INTEGER NOT NULL DEFAULT 0,
    track_deg REAL NOT NULL DEFAULT 0,
    speed_kts REAL NOT NULL DEFAULT 0,
    vertical_rate_fpm INTEGER NOT NULL DEFAULT 0,
    squawk_change INTEGER NOT NULL DEFAULT 0,
    emergency INTEGER NOT NULL DEFAULT 0,
    ident INTEGER NOT NULL DEFAULT 0,
    on_ground INTEGER NOT NULL DEFAULT 0,
    last_seen REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS callsigns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    icao TEXT NOT NULL REFERENCES planes(icao),
    callsign TEXT NOT NULL,
    UNIQUE(icao, callsign)
);

CREATE TABLE IF NOT EXISTS squawks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    icao TEXT NOT NULL REFERENCES planes(icao),
    squawk TEXT NOT NULL,
    UNIQUE(icao, squawk)
);

CREATE TABLE IF NOT EXISTS locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    icao TEXT NOT NULL REFERENCES planes(icao),
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    timestamp REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    icao TEXT NOT NULL REFERENCES planes(icao),
    subtype INTEGER NOT NULL,
    generated REAL NOT NULL,
    received REAL NOT NULL,
    callsign TEXT,
    altitude_ft INTEGER,
    ground_speed_kts REAL,
    track_deg REAL,
    lat REAL,
    lon REAL,
    vertical_rate_fpm INTEGER,
    squawk TEXT,
    squawk_change INTEGER,
    emergency INTEGER,
    ident INTEGER,
    on_ground INTEGER
);

CREATE INDEX IF NOT EXISTS idx_planes_last_seen ON planes(last_seen);
CREATE INDEX IF NOT EXISTS idx_callsigns_icao ON callsigns(icao);
CREATE INDEX IF NOT EXISTS idx_squawks_icao ON squawks(icao);
CREATE INDEX IF NOT EXISTS idx_locations_icao ON locations(icao);
CREATE INDEX IF NOT EXISTS idx_locations_timestamp ON locations(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_icao ON messages(icao);
"#;

const PLANE_COLUMNS: &str = "icao, callsign, squawk, altitude_ft, track_deg, speed_kts, \
     vertical_rate_fpm, squawk_change, emergency, ident, on_ground, last_seen";

/// SQLite store for aircraft aggregates.
///
/// The connection sits behind a mutex so detached eviction saves and query
/// reads can share one `Arc<Database>`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &str) -> SqlResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            // Ensure parent directory exists
            if let Some(parent) = Path::new(path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Connection::open(path)?
        };

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    fn save_plane(tx: &Transaction<'_>, plane: &PlaneAggregate) -> SqlResult<()> {
        let Some(last_seen) = plane.last_seen else {
            return Ok(());
        };
        let icao = icao_to_string(&plane.icao());

        tx.execute(
            "INSERT INTO planes (icao, callsign, squawk, altitude_ft, track_deg, speed_kts,
                                 vertical_rate_fpm, squawk_change, emergency, ident, on_ground, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(icao) DO UPDATE SET
                 callsign = COALESCE(excluded.callsign, callsign),
                 squawk = COALESCE(excluded.squawk, squawk),
                 altitude_ft = excluded.altitude_ft,
                 track_deg = excluded.track_deg,
                 speed_kts = excluded.speed_kts,
                 vertical_rate_fpm = excluded.vertical_rate_fpm,
                 squawk_change = excluded.squawk_change,
                 emergency = excluded.emergency,
                 ident = excluded.ident,
                 on_ground = excluded.on_ground,
                 last_seen = MAX(last_seen, excluded.last_seen)",
            params![
                icao,
                plane.callsign,
                plane.squawk,
                plane.altitude_ft,
                plane.track_deg,
                plane.speed_kts,
                plane.vertical_rate_fpm,
                plane.squawk_change,
                plane.emergency,
                plane.ident,
                plane.on_ground,
                to_unix_secs(last_seen),
            ],
        )?;

        let mut stmt =
            tx.prepare_cached("INSERT OR IGNORE INTO callsigns (icao, callsign) VALUES (?1, ?2)")?;
        for cs in &plane.callsigns {
            stmt.execute(params![icao, cs])?;
        }

        let mut stmt =
            tx.prepare_cached("INSERT OR IGNORE INTO squawks (icao, squawk) VALUES (?1, ?2)")?;
        for sq in &plane.squawks {
            stmt.execute(params![icao, sq])?;
        }

        let mut stmt = tx.prepare_cached(
            "INSERT INTO locations (icao, lat, lon, timestamp) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for loc in plane.unsaved_locations() {
            stmt.execute(params![icao, loc.lat, loc.lon, to_unix_secs(loc.time)])?;
        }

        let mut stmt = tx.prepare_cached(
            "INSERT INTO messages (icao, subtype, generated, received, callsign, altitude_ft,
                                   ground_speed_kts, track_deg, lat, lon, vertical_rate_fpm,
                                   squawk, squawk_change, emergency, ident, on_ground)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )?;
        for r in plane.unsaved_history() {
            stmt.execute(params![
                icao,
                r.subtype,
                to_unix_secs(r.generated),
                to_unix_secs(r.received),
                r.callsign,
                r.altitude_ft,
                r.ground_speed_kts,
                r.track_deg,
                r.lat,
                r.lon,
                r.vertical_rate_fpm,
                r.squawk,
                r.squawk_change,
                r.emergency,
                r.ident,
                r.on_ground,
            ])?;
        }

        Ok(())
    }

    fn save_batch(conn: &mut Connection, planes: &[PlaneAggregate]) -> SqlResult<()> {
        let tx = conn.transaction()?;
        for plane in planes {
            Self::save_plane(&tx, plane)?;
        }
        tx.commit()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn plane_from_row(r: &Row<'_>) -> SqlResult<Option<PlaneAggregate>> {
        let hex: String = r.get(0)?;
        let Some(icao) = icao_from_hex(&hex) else {
            return Ok(None);
        };
        let mut plane = PlaneAggregate::new(icao);
        plane.callsign = r.get(1)?;
        plane.squawk = r.get(2)?;
        plane.altitude_ft = r.get(3)?;
        plane.track_deg = r.get(4)?;
        plane.speed_kts = r.get(5)?;
        plane.vertical_rate_fpm = r.get(6)?;
        plane.squawk_change = r.get(7)?;
        plane.emergency = r.get(8)?;
        plane.ident = r.get(9)?;
        plane.on_ground = r.get(10)?;
        plane.last_seen = from_unix_secs(r.get(11)?);
        Ok(Some(plane))
    }

    fn report_from_row(icao: Icao, r: &Row<'_>) -> SqlResult<TrackingReport> {
        let generated = from_unix_secs(r.get(1)?).unwrap_or_default();
        let mut report = TrackingReport::new(icao, r.get(0)?, generated);
        report.received = from_unix_secs(r.get(2)?).unwrap_or(generated);
        report.callsign = r.get(3)?;
        report.altitude_ft = r.get(4)?;
        report.ground_speed_kts = r.get(5)?;
        report.track_deg = r.get(6)?;
        report.lat = r.get(7)?;
        report.lon = r.get(8)?;
        report.vertical_rate_fpm = r.get(9)?;
        report.squawk = r.get(10)?;
        report.squawk_change = r.get(11)?;
        report.emergency = r.get(12)?;
        report.ident = r.get(13)?;
        report.on_ground = r.get(14)?;
        Ok(report)
    }

    fn strings_for(conn: &Connection, sql: &str, icao: &str) -> SqlResult<Vec<String>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![icao], |r| r.get(0))?;
        rows.collect()
    }

    fn locations_for(conn: &Connection, icao: &str, since: Option<f64>) -> SqlResult<Vec<Location>> {
        let mut stmt = conn.prepare_cached(
            "SELECT lat, lon, timestamp FROM locations
             WHERE icao = ?1 AND (?2 IS NULL OR timestamp > ?2)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![icao, since], |r| {
            Ok(Location {
                lat: r.get(0)?,
                lon: r.get(1)?,
                time: from_unix_secs(r.get(2)?).unwrap_or_default(),
            })
        })?;
        rows.collect()
    }

    fn history_for(conn: &Connection, icao: Icao) -> SqlResult<Vec<TrackingReport>> {
        let mut stmt = conn.prepare_cached(
            "SELECT subtype, generated, received, callsign, altitude_ft, ground_speed_kts,
                    track_deg, lat, lon, vertical_rate_fpm, squawk, squawk_change,
                    emergency, ident, on_ground
             FROM messages WHERE icao = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![icao_to_string(&icao)], |r| Self::report_from_row(icao, r))?;
        rows.collect()
    }

    /// Fill callsigns and squawks, plus either the full trail and history or
    /// only the latest fix.
    fn hydrate(conn: &Connection, plane: &mut PlaneAggregate, full: bool) -> SqlResult<()> {
        let hex = icao_to_string(&plane.icao());
        plane.callsigns = Self::strings_for(
            conn,
            "SELECT callsign FROM callsigns WHERE icao = ?1 ORDER BY id",
            &hex,
        )?;
        plane.squawks = Self::strings_for(
            conn,
            "SELECT squawk FROM squawks WHERE icao = ?1 ORDER BY id",
            &hex,
        )?;

        if full {
            plane.locations = Self::locations_for(conn, &hex, None)?;
            plane.history = Self::history_for(conn, plane.icao())?;
        } else {
            plane.locations = conn
                .query_row(
                    "SELECT lat, lon, timestamp FROM locations WHERE icao = ?1
                     ORDER BY id DESC LIMIT 1",
                    params![hex],
                    |r| {
                        Ok(Location {
                            lat: r.get(0)?,
                            lon: r.get(1)?,
                            time: from_unix_secs(r.get(2)?).unwrap_or_default(),
                        })
                    },
                )
                .optional()?
                .into_iter()
                .collect();
        }

        plane.mark_persisted();
        Ok(())
    }

    fn load_plane(conn: &Connection, icao: &Icao) -> SqlResult<Option<PlaneAggregate>> {
        let sql = format!("SELECT {PLANE_COLUMNS} FROM planes WHERE icao = ?1");
        let plane = conn
            .query_row(&sql, params![icao_to_string(icao)], Self::plane_from_row)
            .optional()?
            .flatten();

        let Some(mut plane) = plane else {
            return Ok(None);
        };
        Self::hydrate(conn, &mut plane, true)?;
        Ok(Some(plane))
    }

    fn load_planes_since(conn: &Connection, since: Option<f64>) -> SqlResult<Vec<PlaneAggregate>> {
        let sql = format!(
            "SELECT {PLANE_COLUMNS} FROM planes
             WHERE ?1 IS NULL OR last_seen > ?1
             ORDER BY last_seen DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![since], Self::plane_from_row)?;

        let mut planes = Vec::new();
        for row in rows {
            if let Some(mut plane) = row? {
                Self::hydrate(conn, &mut plane, false)?;
                planes.push(plane);
            }
        }
        Ok(planes)
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> StoreResult<DbStats> {
        let conn = self.conn()?;
        let (oldest, newest): (Option<f64>, Option<f64>) = conn
            .query_row("SELECT MIN(last_seen), MAX(last_seen) FROM planes", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .map_err(StoreError::backend)?;

        Ok(DbStats {
            planes: Self::count(&conn, "planes"),
            callsigns: Self::count(&conn, "callsigns"),
            squawks: Self::count(&conn, "squawks"),
            locations: Self::count(&conn, "locations"),
            messages: Self::count(&conn, "messages"),
            oldest_seen: oldest.and_then(from_unix_secs),
            newest_seen: newest.and_then(from_unix_secs),
        })
    }
}

impl PlaneStore for Database {
    fn load(&self, icao: &Icao) -> StoreResult<Option<PlaneAggregate>> {
        let conn = self.conn()?;
        Self::load_plane(&conn, icao).map_err(StoreError::backend)
    }

    fn save(&self, planes: &[PlaneAggregate]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        Self::save_batch(&mut conn, planes).map_err(StoreError::backend)
    }

    fn load_all_since(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<PlaneAggregate>> {
        let conn = self.conn()?;
        Self::load_planes_since(&conn, since.map(to_unix_secs)).map_err(StoreError::backend)
    }

    fn load_locations_since(
        &self,
        icao: &Icao,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Location>> {
        let conn = self.conn()?;
        Self::locations_for(&conn, &icao_to_string(icao), since.map(to_unix_secs))
            .map_err(StoreError::backend)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DbStats {
    pub planes: i64,
    pub callsigns: i64,
    pub squawks: i64,
    pub locations: i64,
    pub messages: i64,
    pub oldest_seen: Option<DateTime<Utc>>,
    pub newest_seen: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn test_db() -> Database {
        Database::open_memory().unwrap()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn report(icao: Icao, subtype: u8, at: i64) -> TrackingReport {
        TrackingReport::new(icao, subtype, t(at))
    }

    /// BAW123 at 3000ft with two fixes.
    fn sample_plane() -> PlaneAggregate {
        let icao = icao_from_hex("40621D").unwrap();
        let mut plane = PlaneAggregate::new(icao);

        let mut r = report(icao, 1, 0);
        r.callsign = Some("BAW123".into());
        plane.apply(&r);

        let mut r = report(icao, 3, 1);
        r.altitude_ft = Some(3000);
        r.lat = Some(51.47);
        r.lon = Some(-0.45);
        r.on_ground = Some(false);
        plane.apply(&r);

        let mut r = report(icao, 3, 2);
        r.altitude_ft = Some(3100);
        r.lat = Some(51.48);
        r.lon = Some(-0.44);
        plane.apply(&r);

        let mut r = report(icao, 6, 3);
        r.squawk = Some("7000".into());
        plane.apply(&r);
        plane
    }

    #[test]
    fn test_open_memory() {
        let db = test_db();
        let stats = db.stats().unwrap();
        assert_eq!(stats.planes, 0);
        assert!(stats.newest_seen.is_none());
    }

    #[test]
    fn test_open_file_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sbs.db");
        let db = Database::open(path.to_str().unwrap()).unwrap();
        db.save(&[sample_plane()]).unwrap();
        drop(db);

        let db = Database::open(path.to_str().unwrap()).unwrap();
        assert_eq!(db.stats().unwrap().planes, 1);
    }

    #[test]
    fn test_roundtrip() {
        let db = test_db();
        let plane = sample_plane();
        db.save(std::slice::from_ref(&plane)).unwrap();

        let loaded = db.load(&plane.icao()).unwrap().unwrap();
        assert_eq!(loaded.callsign.as_deref(), Some("BAW123"));
        assert_eq!(loaded.callsigns, vec!["BAW123"]);
        assert_eq!(loaded.squawk.as_deref(), Some("7000"));
        assert_eq!(loaded.squawks, vec!["7000"]);
        assert_eq!(loaded.altitude_ft, 3100);
        assert!(!loaded.on_ground);
        assert_eq!(loaded.last_seen, Some(t(3)));
        assert_eq!(loaded.locations, plane.locations);
        assert_eq!(loaded.history, plane.history);
        assert!(loaded.unsaved_locations().is_empty());
        assert!(loaded.unsaved_history().is_empty());
    }

    #[test]
    fn test_load_missing() {
        let db = test_db();
        assert!(db.load(&[1, 2, 3]).unwrap().is_none());
    }

    #[test]
    fn test_never_seen_plane_not_written() {
        let db = test_db();
        db.save(&[PlaneAggregate::new([1, 2, 3])]).unwrap();
        assert_eq!(db.stats().unwrap().planes, 0);
    }

    #[test]
    fn test_resave_is_append_only() {
        let db = test_db();
        let plane = sample_plane();
        db.save(std::slice::from_ref(&plane)).unwrap();

        // Reload, extend, save again: only the new fix and report are added.
        let mut reloaded = db.load(&plane.icao()).unwrap().unwrap();
        let mut r = report(plane.icao(), 2, 10);
        r.lat = Some(51.50);
        r.lon = Some(-0.40);
        r.altitude_ft = Some(3500);
        r.ground_speed_kts = Some(180.0);
        reloaded.apply(&r);
        db.save(std::slice::from_ref(&reloaded)).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.planes, 1);
        assert_eq!(stats.callsigns, 1);
        assert_eq!(stats.locations, 3);
        assert_eq!(stats.messages, plane.history.len() as i64 + 1);

        let loaded = db.load(&plane.icao()).unwrap().unwrap();
        assert_eq!(loaded.altitude_ft, 3500);
        assert_eq!(loaded.speed_kts, 180.0);
        assert_eq!(loaded.last_seen, Some(t(10)));
    }

    #[test]
    fn test_stale_save_keeps_newer_last_seen() {
        let db = test_db();
        let plane = sample_plane();
        db.save(std::slice::from_ref(&plane)).unwrap();

        let mut older = PlaneAggregate::new(plane.icao());
        older.apply(&report(plane.icao(), 8, -100));
        db.save(&[older]).unwrap();

        let loaded = db.load(&plane.icao()).unwrap().unwrap();
        assert_eq!(loaded.last_seen, Some(t(3)));
        assert_eq!(loaded.callsign.as_deref(), Some("BAW123"));
    }

    #[test]
    fn test_load_all_since() {
        let db = test_db();
        let plane = sample_plane();
        let mut other = PlaneAggregate::new([0xAB, 0xCD, 0xEF]);
        other.apply(&report([0xAB, 0xCD, 0xEF], 8, 100));
        db.save(&[plane.clone(), other]).unwrap();

        let all = db.load_all_since(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].icao(), [0xAB, 0xCD, 0xEF]);

        // List loads carry only the latest fix.
        assert_eq!(all[1].locations.len(), 1);
        assert_eq!(all[1].locations[0].lat, 51.48);
        assert_eq!(all[1].callsigns, vec!["BAW123"]);

        let recent = db.load_all_since(Some(t(50))).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].icao(), [0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn test_load_locations_since() {
        let db = test_db();
        let plane = sample_plane();
        db.save(std::slice::from_ref(&plane)).unwrap();

        let all = db.load_locations_since(&plane.icao(), None).unwrap();
        assert_eq!(all, plane.locations);

        let later = db.load_locations_since(&plane.icao(), Some(t(1))).unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].time, t(2));

        assert!(db.load_locations_since(&[9, 9, 9], None).unwrap().is_empty());
    }

    #[test]
    fn test_stats() {
        let db = test_db();
        db.save(&[sample_plane()]).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.planes, 1);
        assert_eq!(stats.squawks, 1);
        assert_eq!(stats.locations, 2);
        assert_eq!(stats.newest_seen, Some(t(3)));
    }
}

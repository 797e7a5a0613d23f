mod error;
mod models;

pub use error::{DbError, Result};
pub use models::{
  Activity, ActivityKind, Dialect, Endpoint, EndpointSample, EndpointStatus, Player, PlayerName,
  Session, TableCounts, Title,
};

use std::path::Path;
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, params, params_from_iter};
use tracing::{debug, info};

/// Observation fields recorded for a successful probe.
#[derive(Debug, Clone, Default)]
pub struct ProbeObservation {
  pub roster_online: i64,
  pub max_roster: i64,
  pub latency_ms: i64,
  pub version: String,
  pub motd: String,
  pub anonymous_count: i64,
}

/// Database wrapper for all Spyglass operations.
#[derive(Clone)]
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create a database at the given path.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = Connection::open(path).await.map_err(DbError::Sqlite)?;
    let db = Self { conn };
    db.initialize().await?;
    Ok(db)
  }

  /// Create an in-memory database (useful for testing).
  pub async fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .await
      .map_err(DbError::Sqlite)?;
    let db = Self { conn };
    db.initialize().await?;
    Ok(db)
  }

  /// Initialize the database schema.
  async fn initialize(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        // Enable WAL mode for better concurrent read/write performance
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // Enable foreign key constraints (must be set per-connection)
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
          r#"
          -- Monitored endpoints; mutable fields are written by the probe engine
          CREATE TABLE IF NOT EXISTS endpoints (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              display_name TEXT NOT NULL,
              host TEXT NOT NULL,
              port INTEGER NOT NULL,
              dialect TEXT NOT NULL DEFAULT 'auto',
              last_status TEXT NOT NULL DEFAULT 'checking',
              last_roster_size INTEGER NOT NULL DEFAULT 0,
              max_roster INTEGER NOT NULL DEFAULT 0,
              last_latency_ms INTEGER NOT NULL DEFAULT 0,
              last_version TEXT NOT NULL DEFAULT '',
              last_motd TEXT NOT NULL DEFAULT '',
              last_checked_at INTEGER,
              anonymous_count INTEGER NOT NULL DEFAULT 0
          );

          -- Append-only probe history, pruned by the retention engine
          CREATE TABLE IF NOT EXISTS endpoint_samples (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              endpoint_id INTEGER NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
              roster_online INTEGER NOT NULL DEFAULT 0,
              max_roster INTEGER NOT NULL DEFAULT 0,
              latency_ms INTEGER NOT NULL DEFAULT -1,
              version TEXT NOT NULL DEFAULT '',
              motd TEXT NOT NULL DEFAULT '',
              timestamp INTEGER NOT NULL
          );

          CREATE TABLE IF NOT EXISTS players (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL UNIQUE,
              uuid TEXT UNIQUE,
              first_seen INTEGER NOT NULL,
              last_seen INTEGER NOT NULL,
              total_playtime_seconds INTEGER NOT NULL DEFAULT 0,
              rank TEXT NOT NULL DEFAULT 'Newcomer'
          );

          -- Open sessions have leave_time NULL; at most one open row
          -- per (player_id, endpoint_id)
          CREATE TABLE IF NOT EXISTS sessions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              player_id INTEGER NOT NULL REFERENCES players(id),
              endpoint_id INTEGER NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
              join_time INTEGER NOT NULL,
              leave_time INTEGER,
              duration_seconds INTEGER NOT NULL DEFAULT 0
          );

          CREATE TABLE IF NOT EXISTS activities (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              player_id INTEGER NOT NULL REFERENCES players(id),
              endpoint_id INTEGER NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
              kind TEXT NOT NULL,
              timestamp INTEGER NOT NULL,
              session_duration_seconds INTEGER NOT NULL DEFAULT 0
          );

          CREATE TABLE IF NOT EXISTS titles (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              player_id INTEGER NOT NULL REFERENCES players(id),
              label TEXT NOT NULL,
              earned_at INTEGER NOT NULL,
              UNIQUE(player_id, label)
          );

          CREATE INDEX IF NOT EXISTS idx_samples_endpoint_time
              ON endpoint_samples(endpoint_id, timestamp);
          CREATE INDEX IF NOT EXISTS idx_sessions_pair
              ON sessions(player_id, endpoint_id);
          CREATE INDEX IF NOT EXISTS idx_activities_time
              ON activities(timestamp);
          "#,
        )?;
        Ok(())
      })
      .await?;

    info!("database initialized");
    Ok(())
  }

  // ========================================================================
  // Endpoints
  // ========================================================================

  /// Register a new endpoint. Starts out in `checking` state with dialect
  /// as given (usually `auto`).
  pub async fn create_endpoint(
    &self,
    display_name: String,
    host: String,
    port: u16,
    dialect: Dialect,
  ) -> Result<Endpoint> {
    let endpoint = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(
            "INSERT INTO endpoints (display_name, host, port, dialect) VALUES (?1, ?2, ?3, ?4)",
          )?
          .execute(params![&display_name, &host, port, dialect.as_str()])?;
        let id = conn.last_insert_rowid();

        Ok(Endpoint {
          id,
          display_name,
          host,
          port,
          dialect,
          last_status: EndpointStatus::Checking,
          last_roster_size: 0,
          max_roster: 0,
          last_latency_ms: 0,
          last_version: String::new(),
          last_motd: String::new(),
          last_checked_at: None,
          anonymous_count: 0,
        })
      })
      .await?;

    debug!(%endpoint.display_name, endpoint.id, "created endpoint");
    Ok(endpoint)
  }

  /// Get an endpoint by id.
  pub async fn get_endpoint(&self, id: i64) -> Result<Option<Endpoint>> {
    let endpoint = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(&format!("{ENDPOINT_SELECT} WHERE id = ?1"))?
          .query_row(params![id], endpoint_from_row)
          .optional()
      })
      .await?;

    Ok(endpoint)
  }

  /// Get all registered endpoints.
  pub async fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
    let endpoints = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare_cached(&format!("{ENDPOINT_SELECT} ORDER BY id"))?;
        let endpoints = stmt
          .query_map([], endpoint_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(endpoints)
      })
      .await?;

    Ok(endpoints)
  }

  /// Delete an endpoint and (via cascade) its samples, sessions and activities.
  pub async fn delete_endpoint(&self, id: i64) -> Result<()> {
    let result = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached("DELETE FROM endpoints WHERE id = ?1")?
          .execute(params![id])?;

        if deleted == 0 {
          return Ok(Err(DbError::EndpointNotFound));
        }

        Ok(Ok(()))
      })
      .await??;

    debug!(id, "deleted endpoint");
    Ok(result)
  }

  /// Persist the dialect detected by the first successful probe. Only an
  /// endpoint still marked `auto` is updated, so a detected dialect never
  /// flips back.
  pub async fn lock_in_dialect(&self, id: i64, dialect: Dialect) -> Result<()> {
    let updated = self
      .conn
      .call(move |conn| {
        let updated = conn
          .prepare_cached("UPDATE endpoints SET dialect = ?2 WHERE id = ?1 AND dialect = 'auto'")?
          .execute(params![id, dialect.as_str()])?;
        Ok(updated)
      })
      .await?;

    if updated > 0 {
      info!(id, dialect = dialect.as_str(), "locked in detected dialect");
    }
    Ok(())
  }

  /// Record a successful probe: append a sample row and update the
  /// endpoint's live fields in one transaction.
  pub async fn record_probe_online(
    &self,
    endpoint_id: i64,
    obs: ProbeObservation,
    now: i64,
  ) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        tx.prepare_cached(
          "INSERT INTO endpoint_samples \
           (endpoint_id, roster_online, max_roster, latency_ms, version, motd, timestamp) \
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?
        .execute(params![
          endpoint_id,
          obs.roster_online,
          obs.max_roster,
          obs.latency_ms,
          &obs.version,
          &obs.motd,
          now
        ])?;

        tx.prepare_cached(
          "UPDATE endpoints SET last_status = 'online', last_roster_size = ?2, \
           max_roster = ?3, last_latency_ms = ?4, last_version = ?5, last_motd = ?6, \
           anonymous_count = ?7, last_checked_at = ?8 WHERE id = ?1",
        )?
        .execute(params![
          endpoint_id,
          obs.roster_online,
          obs.max_roster,
          obs.latency_ms,
          &obs.version,
          &obs.motd,
          obs.anonymous_count,
          now
        ])?;

        tx.commit()?;
        Ok(())
      })
      .await?;

    Ok(())
  }

  /// Record a failed probe: append an offline sample row and zero the
  /// endpoint's live fields, with latency pinned to -1.
  pub async fn record_probe_offline(&self, endpoint_id: i64, now: i64) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        tx.prepare_cached(
          "INSERT INTO endpoint_samples \
           (endpoint_id, roster_online, max_roster, latency_ms, timestamp) \
           VALUES (?1, 0, 0, -1, ?2)",
        )?
        .execute(params![endpoint_id, now])?;

        tx.prepare_cached(
          "UPDATE endpoints SET last_status = 'offline', last_roster_size = 0, \
           max_roster = 0, last_latency_ms = -1, anonymous_count = 0, \
           last_checked_at = ?2 WHERE id = ?1",
        )?
        .execute(params![endpoint_id, now])?;

        tx.commit()?;
        Ok(())
      })
      .await?;

    Ok(())
  }

  // ========================================================================
  // Players
  // ========================================================================

  pub async fn get_player(&self, id: i64) -> Result<Option<Player>> {
    let player = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(&format!("{PLAYER_SELECT} WHERE id = ?1"))?
          .query_row(params![id], player_from_row)
          .optional()
      })
      .await?;

    Ok(player)
  }

  pub async fn find_player_by_uuid(&self, uuid: String) -> Result<Option<Player>> {
    let player = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(&format!("{PLAYER_SELECT} WHERE uuid = ?1"))?
          .query_row(params![&uuid], player_from_row)
          .optional()
      })
      .await?;

    Ok(player)
  }

  pub async fn find_player_by_username(&self, username: String) -> Result<Option<Player>> {
    let player = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(&format!("{PLAYER_SELECT} WHERE username = ?1"))?
          .query_row(params![&username], player_from_row)
          .optional()
      })
      .await?;

    Ok(player)
  }

  /// Create a new player record with the `Newcomer` rank.
  pub async fn create_player(
    &self,
    username: String,
    uuid: Option<String>,
    now: i64,
  ) -> Result<Player> {
    let player = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(
            "INSERT INTO players (username, uuid, first_seen, last_seen) VALUES (?1, ?2, ?3, ?3)",
          )?
          .execute(params![&username, &uuid, now])?;

        Ok(Player {
          id: conn.last_insert_rowid(),
          username,
          uuid,
          first_seen: now,
          last_seen: now,
          total_playtime_seconds: 0,
          rank: "Newcomer".to_string(),
        })
      })
      .await?;

    debug!(%player.username, player.id, "created player");
    Ok(player)
  }

  /// Update the username for a fixed uuid (rename).
  pub async fn rename_player(&self, id: i64, username: String) -> Result<()> {
    let name = username.clone();
    self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached("UPDATE players SET username = ?2 WHERE id = ?1")?
          .execute(params![id, &username])?;
        Ok(())
      })
      .await?;

    debug!(id, username = %name, "renamed player");
    Ok(())
  }

  /// Backfill a uuid first observed after the player was created by name.
  pub async fn set_player_uuid(&self, id: i64, uuid: String) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached("UPDATE players SET uuid = ?2 WHERE id = ?1 AND uuid IS NULL")?
          .execute(params![id, &uuid])?;
        Ok(())
      })
      .await?;

    Ok(())
  }

  pub async fn touch_player(&self, id: i64, now: i64) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached("UPDATE players SET last_seen = ?2 WHERE id = ?1")?
          .execute(params![id, now])?;
        Ok(())
      })
      .await?;

    Ok(())
  }

  /// Credit a closed session to the player's lifetime playtime and return
  /// the new total.
  pub async fn add_playtime(&self, id: i64, seconds: i64, now: i64) -> Result<i64> {
    let total = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        tx.prepare_cached(
          "UPDATE players SET total_playtime_seconds = total_playtime_seconds + ?2, \
           last_seen = ?3 WHERE id = ?1",
        )?
        .execute(params![id, seconds, now])?;

        let total: i64 = tx
          .prepare_cached("SELECT total_playtime_seconds FROM players WHERE id = ?1")?
          .query_row(params![id], |row| row.get(0))?;

        tx.commit()?;
        Ok(total)
      })
      .await?;

    Ok(total)
  }

  pub async fn set_player_rank(&self, id: i64, rank: String) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached("UPDATE players SET rank = ?2 WHERE id = ?1")?
          .execute(params![id, &rank])?;
        Ok(())
      })
      .await?;

    Ok(())
  }

  // ========================================================================
  // Sessions
  // ========================================================================

  /// Insert a new open session.
  pub async fn open_session(
    &self,
    player_id: i64,
    endpoint_id: i64,
    join_time: i64,
  ) -> Result<Session> {
    let session = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(
            "INSERT INTO sessions (player_id, endpoint_id, join_time) VALUES (?1, ?2, ?3)",
          )?
          .execute(params![player_id, endpoint_id, join_time])?;

        Ok(Session {
          id: conn.last_insert_rowid(),
          player_id,
          endpoint_id,
          join_time,
          leave_time: None,
          duration_seconds: 0,
        })
      })
      .await?;

    Ok(session)
  }

  /// All open sessions for a (player, endpoint) pair, newest join first.
  /// Normally zero or one row; more than one is an invariant violation the
  /// session tracker reconciles.
  pub async fn open_sessions_for(&self, player_id: i64, endpoint_id: i64) -> Result<Vec<Session>> {
    let sessions = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&format!(
          "{SESSION_SELECT} WHERE player_id = ?1 AND endpoint_id = ?2 \
           AND leave_time IS NULL ORDER BY join_time DESC, id DESC"
        ))?;
        let sessions = stmt
          .query_map(params![player_id, endpoint_id], session_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
      })
      .await?;

    Ok(sessions)
  }

  /// Close an open session and return its computed duration in seconds.
  pub async fn close_session(&self, id: i64, leave_time: i64) -> Result<i64> {
    let duration = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let join_time: Option<i64> = tx
          .prepare_cached("SELECT join_time FROM sessions WHERE id = ?1 AND leave_time IS NULL")?
          .query_row(params![id], |row| row.get(0))
          .optional()?;

        let Some(join_time) = join_time else {
          return Ok(Err(DbError::SessionNotFound));
        };

        let duration = leave_time - join_time;
        tx.prepare_cached(
          "UPDATE sessions SET leave_time = ?2, duration_seconds = ?3 WHERE id = ?1",
        )?
        .execute(params![id, leave_time, duration])?;

        tx.commit()?;
        Ok(Ok(duration))
      })
      .await??;

    Ok(duration)
  }

  /// Open sessions whose join predates the cutoff (used by the startup sweep).
  pub async fn stale_open_sessions(&self, cutoff: i64) -> Result<Vec<Session>> {
    let sessions = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&format!(
          "{SESSION_SELECT} WHERE leave_time IS NULL AND join_time < ?1 ORDER BY id"
        ))?;
        let sessions = stmt
          .query_map(params![cutoff], session_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
      })
      .await?;

    Ok(sessions)
  }

  /// All closed sessions for one player (drives title derivation).
  pub async fn closed_sessions_for_player(&self, player_id: i64) -> Result<Vec<Session>> {
    let sessions = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&format!(
          "{SESSION_SELECT} WHERE player_id = ?1 AND leave_time IS NOT NULL ORDER BY join_time"
        ))?;
        let sessions = stmt
          .query_map(params![player_id], session_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
      })
      .await?;

    Ok(sessions)
  }

  /// Delete up to `limit` closed sessions that ended before the cutoff.
  /// Open sessions are never touched.
  pub async fn delete_closed_sessions_before(&self, cutoff: i64, limit: u32) -> Result<u64> {
    let deleted = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached(
            "DELETE FROM sessions WHERE id IN \
             (SELECT id FROM sessions WHERE leave_time IS NOT NULL AND leave_time < ?1 LIMIT ?2)",
          )?
          .execute(params![cutoff, limit])?;
        Ok(deleted as u64)
      })
      .await?;

    Ok(deleted)
  }

  // ========================================================================
  // Activities
  // ========================================================================

  pub async fn append_activity(
    &self,
    player_id: i64,
    endpoint_id: i64,
    kind: ActivityKind,
    timestamp: i64,
    session_duration_seconds: i64,
  ) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(
            "INSERT INTO activities \
             (player_id, endpoint_id, kind, timestamp, session_duration_seconds) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
          )?
          .execute(params![
            player_id,
            endpoint_id,
            kind.as_str(),
            timestamp,
            session_duration_seconds
          ])?;
        Ok(())
      })
      .await?;

    Ok(())
  }

  pub async fn activities_for_player(&self, player_id: i64) -> Result<Vec<Activity>> {
    let activities = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT id, player_id, endpoint_id, kind, timestamp, session_duration_seconds \
           FROM activities WHERE player_id = ?1 ORDER BY timestamp, id",
        )?;
        let activities = stmt
          .query_map(params![player_id], activity_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(activities)
      })
      .await?;

    Ok(activities)
  }

  pub async fn delete_activities_before(&self, cutoff: i64, limit: u32) -> Result<u64> {
    let deleted = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached(
            "DELETE FROM activities WHERE id IN \
             (SELECT id FROM activities WHERE timestamp < ?1 LIMIT ?2)",
          )?
          .execute(params![cutoff, limit])?;
        Ok(deleted as u64)
      })
      .await?;

    Ok(deleted)
  }

  // ========================================================================
  // Titles
  // ========================================================================

  /// Grant a title if the player does not already hold it. Returns true
  /// when a new row was inserted.
  pub async fn award_title(&self, player_id: i64, label: String, now: i64) -> Result<bool> {
    let lbl = label.clone();
    let inserted = self
      .conn
      .call(move |conn| {
        let inserted = conn
          .prepare_cached(
            "INSERT OR IGNORE INTO titles (player_id, label, earned_at) VALUES (?1, ?2, ?3)",
          )?
          .execute(params![player_id, &label, now])?;
        Ok(inserted > 0)
      })
      .await?;

    if inserted {
      info!(player_id, label = %lbl, "awarded title");
    }
    Ok(inserted)
  }

  pub async fn titles_for_player(&self, player_id: i64) -> Result<Vec<Title>> {
    let titles = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT id, player_id, label, earned_at FROM titles WHERE player_id = ?1 ORDER BY id",
        )?;
        let titles = stmt
          .query_map(params![player_id], |row| {
            Ok(Title {
              id: row.get(0)?,
              player_id: row.get(1)?,
              label: row.get(2)?,
              earned_at: row.get(3)?,
            })
          })?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(titles)
      })
      .await?;

    Ok(titles)
  }

  // ========================================================================
  // Samples (time series)
  // ========================================================================

  pub async fn count_samples_in_range(&self, endpoint_id: i64, from: i64, to: i64) -> Result<i64> {
    let count = self
      .conn
      .call(move |conn| {
        let count: i64 = conn
          .prepare_cached(
            "SELECT COUNT(*) FROM endpoint_samples \
             WHERE endpoint_id = ?1 AND timestamp >= ?2 AND timestamp < ?3",
          )?
          .query_row(params![endpoint_id, from, to], |row| row.get(0))?;
        Ok(count)
      })
      .await?;

    Ok(count)
  }

  /// Samples for one endpoint in `[from, to)`, oldest first.
  pub async fn samples_in_range(
    &self,
    endpoint_id: i64,
    from: i64,
    to: i64,
  ) -> Result<Vec<EndpointSample>> {
    self.samples_page(endpoint_id, from, to, -1, 0).await
  }

  /// Paged variant of [`samples_in_range`](Self::samples_in_range); a
  /// negative limit returns everything.
  pub async fn samples_page(
    &self,
    endpoint_id: i64,
    from: i64,
    to: i64,
    limit: i64,
    offset: i64,
  ) -> Result<Vec<EndpointSample>> {
    let samples = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT id, endpoint_id, roster_online, max_roster, latency_ms, version, motd, timestamp \
           FROM endpoint_samples \
           WHERE endpoint_id = ?1 AND timestamp >= ?2 AND timestamp < ?3 \
           ORDER BY timestamp, id LIMIT ?4 OFFSET ?5",
        )?;
        let samples = stmt
          .query_map(params![endpoint_id, from, to, limit, offset], sample_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(samples)
      })
      .await?;

    Ok(samples)
  }

  /// Delete up to `limit` samples older than the cutoff, across all
  /// endpoints (light pruning).
  pub async fn delete_samples_before(&self, cutoff: i64, limit: u32) -> Result<u64> {
    let deleted = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached(
            "DELETE FROM endpoint_samples WHERE id IN \
             (SELECT id FROM endpoint_samples WHERE timestamp < ?1 LIMIT ?2)",
          )?
          .execute(params![cutoff, limit])?;
        Ok(deleted as u64)
      })
      .await?;

    Ok(deleted)
  }

  /// Per-endpoint variant used by the oldest age band of full optimization.
  pub async fn delete_samples_before_for(
    &self,
    endpoint_id: i64,
    cutoff: i64,
    limit: u32,
  ) -> Result<u64> {
    let deleted = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached(
            "DELETE FROM endpoint_samples WHERE id IN \
             (SELECT id FROM endpoint_samples \
              WHERE endpoint_id = ?1 AND timestamp < ?2 LIMIT ?3)",
          )?
          .execute(params![endpoint_id, cutoff, limit])?;
        Ok(deleted as u64)
      })
      .await?;

    Ok(deleted)
  }

  /// Delete specific sample rows by id.
  pub async fn delete_samples_by_ids(&self, ids: Vec<i64>) -> Result<u64> {
    if ids.is_empty() {
      return Ok(0);
    }

    let deleted = self
      .conn
      .call(move |conn| {
        let placeholders = vec!["?"; ids.len()].join(", ");
        let deleted = conn
          .prepare(&format!(
            "DELETE FROM endpoint_samples WHERE id IN ({placeholders})"
          ))?
          .execute(params_from_iter(ids.iter()))?;
        Ok(deleted as u64)
      })
      .await?;

    Ok(deleted)
  }

  // ========================================================================
  // Maintenance
  // ========================================================================

  pub async fn endpoint_ids(&self) -> Result<Vec<i64>> {
    let ids = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare_cached("SELECT id FROM endpoints ORDER BY id")?;
        let ids = stmt
          .query_map([], |row| row.get(0))?
          .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
      })
      .await?;

    Ok(ids)
  }

  pub async fn table_counts(&self) -> Result<TableCounts> {
    let counts = self
      .conn
      .call(|conn| {
        let count = |table: &str| -> rusqlite::Result<i64> {
          conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
          })
        };
        Ok(TableCounts {
          endpoints: count("endpoints")?,
          samples: count("endpoint_samples")?,
          players: count("players")?,
          sessions: count("sessions")?,
          activities: count("activities")?,
          titles: count("titles")?,
        })
      })
      .await?;

    Ok(counts)
  }

  /// Reclaim file space after bulk deletion.
  pub async fn vacuum(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch("VACUUM")?;
        Ok(())
      })
      .await?;

    info!("vacuum completed");
    Ok(())
  }
}

const ENDPOINT_SELECT: &str = "SELECT id, display_name, host, port, dialect, last_status, \
   last_roster_size, max_roster, last_latency_ms, last_version, last_motd, last_checked_at, \
   anonymous_count FROM endpoints";

const PLAYER_SELECT: &str = "SELECT id, username, uuid, first_seen, last_seen, \
   total_playtime_seconds, rank FROM players";

const SESSION_SELECT: &str =
  "SELECT id, player_id, endpoint_id, join_time, leave_time, duration_seconds FROM sessions";

fn endpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Endpoint> {
  let dialect: String = row.get(4)?;
  let status: String = row.get(5)?;
  Ok(Endpoint {
    id: row.get(0)?,
    display_name: row.get(1)?,
    host: row.get(2)?,
    port: row.get(3)?,
    dialect: Dialect::parse(&dialect).unwrap_or(Dialect::Auto),
    last_status: EndpointStatus::parse(&status).unwrap_or(EndpointStatus::Checking),
    last_roster_size: row.get(6)?,
    max_roster: row.get(7)?,
    last_latency_ms: row.get(8)?,
    last_version: row.get(9)?,
    last_motd: row.get(10)?,
    last_checked_at: row.get(11)?,
    anonymous_count: row.get(12)?,
  })
}

fn player_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Player> {
  Ok(Player {
    id: row.get(0)?,
    username: row.get(1)?,
    uuid: row.get(2)?,
    first_seen: row.get(3)?,
    last_seen: row.get(4)?,
    total_playtime_seconds: row.get(5)?,
    rank: row.get(6)?,
  })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
  Ok(Session {
    id: row.get(0)?,
    player_id: row.get(1)?,
    endpoint_id: row.get(2)?,
    join_time: row.get(3)?,
    leave_time: row.get(4)?,
    duration_seconds: row.get(5)?,
  })
}

fn sample_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EndpointSample> {
  Ok(EndpointSample {
    id: row.get(0)?,
    endpoint_id: row.get(1)?,
    roster_online: row.get(2)?,
    max_roster: row.get(3)?,
    latency_ms: row.get(4)?,
    version: row.get(5)?,
    motd: row.get(6)?,
    timestamp: row.get(7)?,
  })
}

fn activity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Activity> {
  let kind: String = row.get(3)?;
  Ok(Activity {
    id: row.get(0)?,
    player_id: row.get(1)?,
    endpoint_id: row.get(2)?,
    kind: ActivityKind::parse(&kind).unwrap_or(ActivityKind::Join),
    timestamp: row.get(4)?,
    session_duration_seconds: row.get(5)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn now() -> i64 {
    1700000000 // Fixed timestamp for testing
  }

  async fn endpoint(db: &Database) -> Endpoint {
    db.create_endpoint(
      "Survival SMP".to_string(),
      "mc.example.org".to_string(),
      25565,
      Dialect::Auto,
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn test_endpoint_lifecycle() {
    let db = Database::open_in_memory().await.unwrap();

    let ep = endpoint(&db).await;
    assert_eq!(ep.dialect, Dialect::Auto);
    assert_eq!(ep.last_status, EndpointStatus::Checking);

    let fetched = db.get_endpoint(ep.id).await.unwrap().unwrap();
    assert_eq!(fetched.display_name, "Survival SMP");
    assert_eq!(fetched.port, 25565);

    let all = db.list_endpoints().await.unwrap();
    assert_eq!(all.len(), 1);

    db.delete_endpoint(ep.id).await.unwrap();
    assert!(db.get_endpoint(ep.id).await.unwrap().is_none());
    assert!(matches!(
      db.delete_endpoint(ep.id).await,
      Err(DbError::EndpointNotFound)
    ));
  }

  #[tokio::test]
  async fn test_dialect_lock_in_is_single_shot() {
    let db = Database::open_in_memory().await.unwrap();
    let ep = endpoint(&db).await;

    db.lock_in_dialect(ep.id, Dialect::Java).await.unwrap();
    let ep2 = db.get_endpoint(ep.id).await.unwrap().unwrap();
    assert_eq!(ep2.dialect, Dialect::Java);

    // A second detection must not flip the dialect again
    db.lock_in_dialect(ep.id, Dialect::Bedrock).await.unwrap();
    let ep3 = db.get_endpoint(ep.id).await.unwrap().unwrap();
    assert_eq!(ep3.dialect, Dialect::Java);
  }

  #[tokio::test]
  async fn test_probe_records_update_endpoint_and_append_samples() {
    let db = Database::open_in_memory().await.unwrap();
    let ep = endpoint(&db).await;

    db.record_probe_online(
      ep.id,
      ProbeObservation {
        roster_online: 7,
        max_roster: 100,
        latency_ms: 42,
        version: "1.21".to_string(),
        motd: "Welcome".to_string(),
        anonymous_count: 2,
      },
      now(),
    )
    .await
    .unwrap();

    let online = db.get_endpoint(ep.id).await.unwrap().unwrap();
    assert_eq!(online.last_status, EndpointStatus::Online);
    assert_eq!(online.last_roster_size, 7);
    assert_eq!(online.last_latency_ms, 42);
    assert_eq!(online.anonymous_count, 2);
    assert_eq!(online.last_checked_at, Some(now()));

    db.record_probe_offline(ep.id, now() + 10).await.unwrap();

    let offline = db.get_endpoint(ep.id).await.unwrap().unwrap();
    assert_eq!(offline.last_status, EndpointStatus::Offline);
    assert_eq!(offline.last_latency_ms, -1);
    assert_eq!(offline.last_roster_size, 0);
    assert_eq!(offline.max_roster, 0);
    assert_eq!(offline.anonymous_count, 0);

    let samples = db
      .samples_in_range(ep.id, 0, i64::MAX)
      .await
      .unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].roster_online, 7);
    assert_eq!(samples[1].latency_ms, -1);
  }

  #[tokio::test]
  async fn test_player_create_rename_and_uuid_backfill() {
    let db = Database::open_in_memory().await.unwrap();

    let p = db
      .create_player("old_name".to_string(), None, now())
      .await
      .unwrap();
    assert_eq!(p.rank, "Newcomer");

    db.set_player_uuid(p.id, "uuid-1".to_string()).await.unwrap();
    db.rename_player(p.id, "new_name".to_string()).await.unwrap();

    let found = db
      .find_player_by_uuid("uuid-1".to_string())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(found.id, p.id);
    assert_eq!(found.username, "new_name");

    // Backfill never overwrites an existing uuid
    db.set_player_uuid(p.id, "uuid-2".to_string()).await.unwrap();
    let unchanged = db.get_player(p.id).await.unwrap().unwrap();
    assert_eq!(unchanged.uuid.as_deref(), Some("uuid-1"));
  }

  #[tokio::test]
  async fn test_session_close_computes_duration() {
    let db = Database::open_in_memory().await.unwrap();
    let ep = endpoint(&db).await;
    let p = db
      .create_player("alice".to_string(), None, now())
      .await
      .unwrap();

    let session = db.open_session(p.id, ep.id, now()).await.unwrap();
    assert!(session.is_open());

    let open = db.open_sessions_for(p.id, ep.id).await.unwrap();
    assert_eq!(open.len(), 1);

    let duration = db.close_session(session.id, now() + 120).await.unwrap();
    assert_eq!(duration, 120);

    assert!(db.open_sessions_for(p.id, ep.id).await.unwrap().is_empty());
    let closed = db.closed_sessions_for_player(p.id).await.unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].duration_seconds, 120);
    assert_eq!(closed[0].leave_time, Some(now() + 120));

    // Closing an already-closed session is an error, not a silent rewrite
    assert!(matches!(
      db.close_session(session.id, now() + 300).await,
      Err(DbError::SessionNotFound)
    ));
  }

  #[tokio::test]
  async fn test_stale_open_sessions() {
    let db = Database::open_in_memory().await.unwrap();
    let ep = endpoint(&db).await;
    let p = db
      .create_player("bob".to_string(), None, now())
      .await
      .unwrap();

    db.open_session(p.id, ep.id, now() - 3600).await.unwrap();
    db.open_session(p.id, ep.id, now() - 30).await.unwrap();

    let stale = db.stale_open_sessions(now() - 600).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].join_time, now() - 3600);
  }

  #[tokio::test]
  async fn test_playtime_accumulates() {
    let db = Database::open_in_memory().await.unwrap();
    let p = db
      .create_player("carol".to_string(), None, now())
      .await
      .unwrap();

    assert_eq!(db.add_playtime(p.id, 120, now()).await.unwrap(), 120);
    assert_eq!(db.add_playtime(p.id, 80, now()).await.unwrap(), 200);

    let player = db.get_player(p.id).await.unwrap().unwrap();
    assert_eq!(player.total_playtime_seconds, 200);
  }

  #[tokio::test]
  async fn test_title_award_is_idempotent() {
    let db = Database::open_in_memory().await.unwrap();
    let p = db
      .create_player("dave".to_string(), None, now())
      .await
      .unwrap();

    assert!(db
      .award_title(p.id, "Night Owl".to_string(), now())
      .await
      .unwrap());
    assert!(!db
      .award_title(p.id, "Night Owl".to_string(), now() + 5)
      .await
      .unwrap());

    let titles = db.titles_for_player(p.id).await.unwrap();
    assert_eq!(titles.len(), 1);
    assert_eq!(titles[0].earned_at, now());
  }

  #[tokio::test]
  async fn test_batched_deletes_respect_limit() {
    let db = Database::open_in_memory().await.unwrap();
    let ep = endpoint(&db).await;

    for i in 0..10 {
      db.record_probe_offline(ep.id, now() + i).await.unwrap();
    }

    let deleted = db.delete_samples_before(now() + 100, 4).await.unwrap();
    assert_eq!(deleted, 4);
    let deleted = db.delete_samples_before(now() + 100, 100).await.unwrap();
    assert_eq!(deleted, 6);
  }

  #[tokio::test]
  async fn test_delete_samples_by_ids() {
    let db = Database::open_in_memory().await.unwrap();
    let ep = endpoint(&db).await;

    for i in 0..5 {
      db.record_probe_offline(ep.id, now() + i).await.unwrap();
    }

    let samples = db.samples_in_range(ep.id, 0, i64::MAX).await.unwrap();
    let ids: Vec<i64> = samples.iter().take(3).map(|s| s.id).collect();
    assert_eq!(db.delete_samples_by_ids(ids).await.unwrap(), 3);
    assert_eq!(db.delete_samples_by_ids(Vec::new()).await.unwrap(), 0);

    let left = db.samples_in_range(ep.id, 0, i64::MAX).await.unwrap();
    assert_eq!(left.len(), 2);
  }

  #[tokio::test]
  async fn test_closed_session_pruning_never_touches_open() {
    let db = Database::open_in_memory().await.unwrap();
    let ep = endpoint(&db).await;
    let p = db
      .create_player("erin".to_string(), None, now())
      .await
      .unwrap();

    let old = db.open_session(p.id, ep.id, now() - 400).await.unwrap();
    db.close_session(old.id, now() - 300).await.unwrap();
    db.open_session(p.id, ep.id, now() - 500_000).await.unwrap();

    // Cutoff far in the future: every *closed* session qualifies
    let deleted = db
      .delete_closed_sessions_before(now() + 1_000_000, 100)
      .await
      .unwrap();
    assert_eq!(deleted, 1);

    let open = db.open_sessions_for(p.id, ep.id).await.unwrap();
    assert_eq!(open.len(), 1);
  }

  #[tokio::test]
  async fn test_table_counts() {
    let db = Database::open_in_memory().await.unwrap();
    let ep = endpoint(&db).await;
    db.record_probe_offline(ep.id, now()).await.unwrap();
    db.create_player("frank".to_string(), None, now())
      .await
      .unwrap();

    let counts = db.table_counts().await.unwrap();
    assert_eq!(counts.endpoints, 1);
    assert_eq!(counts.samples, 1);
    assert_eq!(counts.players, 1);
    assert_eq!(counts.sessions, 0);
  }
}

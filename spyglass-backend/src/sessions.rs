//! Diff-based session tracking.
//!
//! Each probe roster is compared against the previous observation for that
//! endpoint; the differences become join/leave session records, playtime,
//! rank and title updates. Persistence is the ground truth - the in-memory
//! roster map is only the diff baseline and is rebuilt empty on startup.

use crate::helpers;
use crate::hub::Hub;
use crate::protocol::RosterEntry;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde_json::json;
use spyglass_db::{ActivityKind, Database, DbError, Player, PlayerName, Session};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Grace period before the startup sweep force-closes sessions left open
/// by a previous run.
const STALE_SESSION_GRACE_SECS: i64 = 600;

pub struct SessionTracker {
    db: Database,
    hub: Hub,
    /// Most recent roster observation per endpoint id.
    last_roster: RwLock<HashMap<i64, HashSet<PlayerName>>>,
}

impl SessionTracker {
    pub fn new(db: Database, hub: Hub) -> Arc<Self> {
        Arc::new(Self {
            db,
            hub,
            last_roster: RwLock::new(HashMap::new()),
        })
    }

    /// Startup sweep: sessions left open longer than the grace period are
    /// closed as of `now`, credited to their players, and recorded as leave
    /// activities. The roster baseline starts empty afterwards.
    pub async fn initialize(&self, now: i64) -> Result<(), DbError> {
        let stale = self
            .db
            .stale_open_sessions(now - STALE_SESSION_GRACE_SECS)
            .await?;
        let count = stale.len();

        for session in stale {
            let duration = self.db.close_session(session.id, now).await?;
            self.db
                .add_playtime(session.player_id, duration, now)
                .await?;
            self.db
                .append_activity(
                    session.player_id,
                    session.endpoint_id,
                    ActivityKind::Leave,
                    now,
                    duration,
                )
                .await?;
            info!(
                player_id = session.player_id,
                endpoint_id = session.endpoint_id,
                duration,
                "closed stale session"
            );
        }

        self.last_roster.write().await.clear();
        if count > 0 {
            info!(count, "startup sweep closed stale sessions");
        }
        Ok(())
    }

    /// Fold one probe roster into session state. The baseline is replaced
    /// only when every store write succeeded, so a failed tick gets
    /// re-attempted by the next diff.
    pub async fn apply_sample(
        &self,
        endpoint_id: i64,
        endpoint_name: &str,
        roster: &[RosterEntry],
        now: i64,
    ) {
        let current: HashMap<PlayerName, Option<String>> = roster
            .iter()
            .filter_map(|entry| match PlayerName::from(&entry.name) {
                Ok(name) => Some((name, entry.uuid.clone())),
                Err(_) => {
                    warn!(name = %entry.name, "ignoring invalid player name in roster");
                    None
                }
            })
            .collect();

        let previous = self
            .last_roster
            .read()
            .await
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_default();

        let mut all_ok = true;

        for (name, uuid) in &current {
            if previous.contains(name) {
                continue;
            }
            if let Err(e) = self
                .handle_join(endpoint_id, endpoint_name, name, uuid.as_deref(), now)
                .await
            {
                warn!(player = %name, endpoint = endpoint_name, "join not recorded: {e}");
                all_ok = false;
            }
        }

        for name in &previous {
            if current.contains_key(name) {
                continue;
            }
            if let Err(e) = self.handle_leave(endpoint_id, endpoint_name, name, now).await {
                warn!(player = %name, endpoint = endpoint_name, "leave not recorded: {e}");
                all_ok = false;
            }
        }

        if all_ok {
            let names: HashSet<PlayerName> = current.keys().copied().collect();
            self.last_roster.write().await.insert(endpoint_id, names);
        } else {
            warn!(
                endpoint = endpoint_name,
                "keeping previous roster baseline after store errors"
            );
        }
    }

    async fn handle_join(
        &self,
        endpoint_id: i64,
        endpoint_name: &str,
        name: &PlayerName,
        uuid: Option<&str>,
        now: i64,
    ) -> Result<(), DbError> {
        let player = self.resolve_player(name.as_str(), uuid, now).await?;

        let open = retry(|| self.db.open_sessions_for(player.id, endpoint_id)).await?;
        if let Some((_, duplicates)) = open.split_first() {
            self.reconcile_duplicates(duplicates).await?;
            // already online here; nothing to create
            return Ok(());
        }

        retry(|| self.db.open_session(player.id, endpoint_id, now)).await?;
        retry(|| self.db.touch_player(player.id, now)).await?;
        retry(|| {
            self.db
                .append_activity(player.id, endpoint_id, ActivityKind::Join, now, 0)
        })
        .await?;

        info!(player = %name, endpoint = endpoint_name, "player joined");
        self.hub.player_join(
            endpoint_id,
            json!({
                "username": player.username,
                "uuid": player.uuid,
                "server_name": endpoint_name,
                "rank": player.rank,
            }),
        );
        Ok(())
    }

    async fn handle_leave(
        &self,
        endpoint_id: i64,
        endpoint_name: &str,
        name: &PlayerName,
        now: i64,
    ) -> Result<(), DbError> {
        let Some(player) = retry(|| self.db.find_player_by_username(name.to_string())).await?
        else {
            warn!(player = %name, "leave observed for unknown player");
            return Ok(());
        };

        let open = retry(|| self.db.open_sessions_for(player.id, endpoint_id)).await?;
        let Some((newest, duplicates)) = open.split_first() else {
            warn!(player = %name, endpoint = endpoint_name, "no open session to close");
            return Ok(());
        };
        self.reconcile_duplicates(duplicates).await?;

        let duration = retry(|| self.db.close_session(newest.id, now)).await?;
        let total_playtime = retry(|| self.db.add_playtime(player.id, duration, now)).await?;
        let rank = self.update_rank(&player, total_playtime).await?;
        self.check_titles(player.id, total_playtime, now).await?;
        retry(|| {
            self.db
                .append_activity(player.id, endpoint_id, ActivityKind::Leave, now, duration)
        })
        .await?;

        info!(
            player = %name,
            endpoint = endpoint_name,
            duration = %helpers::format_duration(duration),
            "player left"
        );
        self.hub.player_leave(
            endpoint_id,
            json!({
                "username": player.username,
                "uuid": player.uuid,
                "server_name": endpoint_name,
                "rank": rank,
                "session_duration": duration,
            }),
        );
        Ok(())
    }

    /// Resolve a roster identity to a player row, preferring the uuid so a
    /// rename maps onto the same player. First sightings create the row.
    async fn resolve_player(
        &self,
        username: &str,
        uuid: Option<&str>,
        now: i64,
    ) -> Result<Player, DbError> {
        if let Some(uuid) = uuid {
            if let Some(mut player) =
                retry(|| self.db.find_player_by_uuid(uuid.to_string())).await?
            {
                if player.username != username {
                    retry(|| self.db.rename_player(player.id, username.to_string())).await?;
                    info!(from = %player.username, to = %username, "player renamed");
                    player.username = username.to_string();
                }
                return Ok(player);
            }
        }

        if let Some(player) =
            retry(|| self.db.find_player_by_username(username.to_string())).await?
        {
            if let (Some(uuid), None) = (uuid, &player.uuid) {
                retry(|| self.db.set_player_uuid(player.id, uuid.to_string())).await?;
            }
            return Ok(player);
        }

        retry(|| {
            self.db
                .create_player(username.to_string(), uuid.map(str::to_string), now)
        })
        .await
    }

    /// Two open sessions for the same pair violate the session invariant;
    /// close everything but the newest. Duplicates close at their own join
    /// time (zero duration) so lifetime playtime never double-counts the
    /// overlap.
    async fn reconcile_duplicates(&self, duplicates: &[Session]) -> Result<(), DbError> {
        for session in duplicates {
            warn!(
                session_id = session.id,
                player_id = session.player_id,
                "closing duplicate open session"
            );
            retry(|| self.db.close_session(session.id, session.join_time)).await?;
        }
        Ok(())
    }

    async fn update_rank(&self, player: &Player, total_playtime: i64) -> Result<String, DbError> {
        let new_rank = rank_for_playtime(total_playtime);
        if player.rank != new_rank {
            retry(|| self.db.set_player_rank(player.id, new_rank.to_string())).await?;
            info!(
                player = %player.username,
                from = %player.rank,
                to = new_rank,
                playtime = %helpers::format_duration(total_playtime),
                "rank changed"
            );
        }
        Ok(new_rank.to_string())
    }

    /// Grant any titles the player's closed-session history now qualifies
    /// for. Titles are never revoked.
    async fn check_titles(
        &self,
        player_id: i64,
        total_playtime: i64,
        now: i64,
    ) -> Result<(), DbError> {
        let sessions = retry(|| self.db.closed_sessions_for_player(player_id)).await?;

        if !sessions.is_empty() {
            let mut night_owl = 0usize;
            let mut early_bird = 0usize;
            let mut weekend = 0usize;

            for session in &sessions {
                let Some(joined) = DateTime::<Utc>::from_timestamp(session.join_time, 0) else {
                    continue;
                };
                let hour = joined.hour();
                if !(6..22).contains(&hour) {
                    night_owl += 1;
                }
                if (6..10).contains(&hour) {
                    early_bird += 1;
                }
                if matches!(joined.weekday(), Weekday::Sat | Weekday::Sun) {
                    weekend += 1;
                }
            }

            let total = sessions.len() as f64;
            if night_owl as f64 / total >= 0.3 {
                retry(|| self.db.award_title(player_id, "Night Owl".to_string(), now)).await?;
            }
            if early_bird as f64 / total >= 0.2 {
                retry(|| self.db.award_title(player_id, "Early Bird".to_string(), now)).await?;
            }
            if weekend as f64 / total >= 0.4 {
                retry(|| {
                    self.db
                        .award_title(player_id, "Weekend Warrior".to_string(), now)
                })
                .await?;
            }
        }

        let hours = total_playtime as f64 / 3600.0;
        if hours >= 100.0 {
            retry(|| self.db.award_title(player_id, "Time Master".to_string(), now)).await?;
        }
        if hours >= 1000.0 {
            retry(|| self.db.award_title(player_id, "Legendary".to_string(), now)).await?;
        }
        Ok(())
    }
}

/// Rank ladder over lifetime playtime. Monotone: thresholds only compare
/// against a total that never decreases.
pub fn rank_for_playtime(seconds: i64) -> &'static str {
    let hours = seconds as f64 / 3600.0;
    if hours >= 500.0 {
        "Legend"
    } else if hours >= 200.0 {
        "Master"
    } else if hours >= 100.0 {
        "Expert"
    } else if hours >= 50.0 {
        "Veteran"
    } else if hours >= 20.0 {
        "Regular"
    } else if hours >= 5.0 {
        "Member"
    } else {
        "Newcomer"
    }
}

/// Retry a store operation once before giving up; transient conflicts on
/// the shared store usually clear immediately.
async fn retry<T, F, Fut>(op: F) -> Result<T, DbError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!("store write failed, retrying once: {first}");
            op().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spyglass_db::Dialect;

    fn entry(name: &str) -> RosterEntry {
        RosterEntry {
            name: name.to_string(),
            uuid: None,
        }
    }

    fn entry_with_uuid(name: &str, uuid: &str) -> RosterEntry {
        RosterEntry {
            name: name.to_string(),
            uuid: Some(uuid.to_string()),
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap().timestamp()
    }

    async fn setup() -> (Database, Arc<SessionTracker>, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let endpoint = db
            .create_endpoint(
                "Survival SMP".to_string(),
                "mc.example.org".to_string(),
                25565,
                Dialect::Java,
            )
            .await
            .unwrap();
        let tracker = SessionTracker::new(db.clone(), Hub::null());
        (db, tracker, endpoint.id)
    }

    #[test]
    fn test_rank_ladder() {
        let hour = 3600;
        assert_eq!(rank_for_playtime(0), "Newcomer");
        assert_eq!(rank_for_playtime(5 * hour - 1), "Newcomer");
        assert_eq!(rank_for_playtime(5 * hour), "Member");
        assert_eq!(rank_for_playtime(20 * hour), "Regular");
        assert_eq!(rank_for_playtime(50 * hour), "Veteran");
        assert_eq!(rank_for_playtime(100 * hour), "Expert");
        assert_eq!(rank_for_playtime(200 * hour), "Master");
        assert_eq!(rank_for_playtime(500 * hour), "Legend");
        assert_eq!(rank_for_playtime(9999 * hour), "Legend");
    }

    #[tokio::test]
    async fn test_join_then_leave_basic() {
        let (db, tracker, ep) = setup().await;
        let t0 = at(2024, 3, 4, 12);

        tracker.apply_sample(ep, "Survival SMP", &[entry("alice")], t0).await;
        tracker
            .apply_sample(ep, "Survival SMP", &[entry("alice"), entry("bob")], t0 + 60)
            .await;
        tracker
            .apply_sample(ep, "Survival SMP", &[entry("bob")], t0 + 120)
            .await;

        let alice = db
            .find_player_by_username("alice".to_string())
            .await
            .unwrap()
            .unwrap();
        let bob = db
            .find_player_by_username("bob".to_string())
            .await
            .unwrap()
            .unwrap();

        // alice: closed [t0, t0+120), duration 120
        let closed = db.closed_sessions_for_player(alice.id).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].join_time, t0);
        assert_eq!(closed[0].leave_time, Some(t0 + 120));
        assert_eq!(closed[0].duration_seconds, 120);
        assert_eq!(
            db.get_player(alice.id)
                .await
                .unwrap()
                .unwrap()
                .total_playtime_seconds,
            120
        );

        // bob: still open since t0+60
        let open = db.open_sessions_for(bob.id, ep).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].join_time, t0 + 60);

        // activity order: join(alice), join(bob), leave(alice, 120)
        let alice_acts = db.activities_for_player(alice.id).await.unwrap();
        assert_eq!(alice_acts.len(), 2);
        assert_eq!(alice_acts[0].kind, ActivityKind::Join);
        assert_eq!(alice_acts[0].timestamp, t0);
        assert_eq!(alice_acts[1].kind, ActivityKind::Leave);
        assert_eq!(alice_acts[1].session_duration_seconds, 120);
        let bob_acts = db.activities_for_player(bob.id).await.unwrap();
        assert_eq!(bob_acts.len(), 1);
        assert_eq!(bob_acts[0].kind, ActivityKind::Join);
    }

    #[tokio::test]
    async fn test_replaying_same_roster_is_idempotent() {
        let (db, tracker, ep) = setup().await;
        let t0 = at(2024, 3, 4, 12);

        tracker.apply_sample(ep, "s", &[entry("alice")], t0).await;
        tracker.apply_sample(ep, "s", &[entry("alice")], t0 + 10).await;
        tracker.apply_sample(ep, "s", &[entry("alice")], t0 + 20).await;

        let alice = db
            .find_player_by_username("alice".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(db.open_sessions_for(alice.id, ep).await.unwrap().len(), 1);
        assert_eq!(db.activities_for_player(alice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rename_keeps_player_and_session() {
        let (db, tracker, ep) = setup().await;
        let t0 = at(2024, 3, 4, 12);

        tracker
            .apply_sample(ep, "s", &[entry_with_uuid("old_name", "U")], t0)
            .await;
        tracker
            .apply_sample(ep, "s", &[entry_with_uuid("new_name", "U")], t0 + 60)
            .await;

        let player = db
            .find_player_by_uuid("U".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(player.username, "new_name");
        assert!(db
            .find_player_by_username("old_name".to_string())
            .await
            .unwrap()
            .is_none());

        // no duplicate player row
        let counts = db.table_counts().await.unwrap();
        assert_eq!(counts.players, 1);

        // the rename itself must not fabricate a second session for the
        // same endpoint
        let open = db.open_sessions_for(player.id, ep).await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_transition_closes_every_session() {
        let (db, tracker, ep) = setup().await;
        let t0 = at(2024, 3, 4, 12);

        tracker
            .apply_sample(ep, "s", &[entry("x"), entry("y")], t0)
            .await;
        // probe failure: the engine hands an empty roster
        tracker.apply_sample(ep, "s", &[], t0 + 30).await;

        for name in ["x", "y"] {
            let player = db
                .find_player_by_username(name.to_string())
                .await
                .unwrap()
                .unwrap();
            assert!(db.open_sessions_for(player.id, ep).await.unwrap().is_empty());
            let closed = db.closed_sessions_for_player(player.id).await.unwrap();
            assert_eq!(closed.len(), 1);
            assert_eq!(closed[0].duration_seconds, 30);
        }
    }

    #[tokio::test]
    async fn test_startup_sweep_closes_stale_sessions() {
        let (db, tracker, ep) = setup().await;
        let t0 = at(2024, 3, 4, 12);

        let p1 = db.create_player("p1".to_string(), None, t0 - 5000).await.unwrap();
        let p2 = db.create_player("p2".to_string(), None, t0 - 5000).await.unwrap();
        db.open_session(p1.id, ep, t0 - 5000).await.unwrap();
        db.open_session(p2.id, ep, t0 - 4000).await.unwrap();
        // a young open session survives the sweep
        let p3 = db.create_player("p3".to_string(), None, t0 - 100).await.unwrap();
        db.open_session(p3.id, ep, t0 - 100).await.unwrap();

        tracker.initialize(t0).await.unwrap();

        for (player, expected) in [(&p1, 5000), (&p2, 4000)] {
            let closed = db.closed_sessions_for_player(player.id).await.unwrap();
            assert_eq!(closed.len(), 1);
            assert_eq!(closed[0].duration_seconds, expected);
            let acts = db.activities_for_player(player.id).await.unwrap();
            assert_eq!(acts.len(), 1);
            assert_eq!(acts[0].kind, ActivityKind::Leave);
            assert_eq!(acts[0].session_duration_seconds, expected);
            assert_eq!(
                db.get_player(player.id)
                    .await
                    .unwrap()
                    .unwrap()
                    .total_playtime_seconds,
                expected
            );
        }
        assert_eq!(db.open_sessions_for(p3.id, ep).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rank_updates_on_leave() {
        let (db, tracker, ep) = setup().await;
        let t0 = at(2024, 3, 4, 12);

        // six hours in one sitting crosses the Member threshold
        tracker.apply_sample(ep, "s", &[entry("grinder")], t0).await;
        tracker
            .apply_sample(ep, "s", &[], t0 + 6 * 3600)
            .await;

        let player = db
            .find_player_by_username("grinder".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(player.rank, "Member");
    }

    #[tokio::test]
    async fn test_night_owl_boundary_hours() {
        let (db, tracker, ep) = setup().await;

        // ten closed sessions; joins at hour 22 count, hour 21 does not
        for day in 1..=10 {
            let join = at(2024, 3, day, 22);
            tracker.apply_sample(ep, "s", &[entry("nightly")], join).await;
            tracker.apply_sample(ep, "s", &[], join + 600).await;
        }
        let player = db
            .find_player_by_username("nightly".to_string())
            .await
            .unwrap()
            .unwrap();
        let titles = db.titles_for_player(player.id).await.unwrap();
        assert!(titles.iter().any(|t| t.label == "Night Owl"));

        // a different player joining only at 21:00 never qualifies
        for day in 1..=10 {
            let join = at(2024, 3, day, 21);
            tracker.apply_sample(ep, "s", &[entry("evening")], join).await;
            tracker.apply_sample(ep, "s", &[], join + 600).await;
        }
        let player = db
            .find_player_by_username("evening".to_string())
            .await
            .unwrap()
            .unwrap();
        let titles = db.titles_for_player(player.id).await.unwrap();
        assert!(!titles.iter().any(|t| t.label == "Night Owl"));
    }

    #[tokio::test]
    async fn test_weekend_warrior_title() {
        let (db, tracker, ep) = setup().await;

        // 2024-03-02 and 2024-03-03 are a Saturday and Sunday
        for day in [2, 3, 9, 10] {
            let join = at(2024, 3, day, 14);
            tracker.apply_sample(ep, "s", &[entry("casual")], join).await;
            tracker.apply_sample(ep, "s", &[], join + 1800).await;
        }
        // one weekday session keeps the ratio at 4/5 = 80%
        let join = at(2024, 3, 5, 14);
        tracker.apply_sample(ep, "s", &[entry("casual")], join).await;
        tracker.apply_sample(ep, "s", &[], join + 1800).await;

        let player = db
            .find_player_by_username("casual".to_string())
            .await
            .unwrap()
            .unwrap();
        let titles = db.titles_for_player(player.id).await.unwrap();
        assert!(titles.iter().any(|t| t.label == "Weekend Warrior"));
    }

    #[tokio::test]
    async fn test_duplicate_open_sessions_are_reconciled() {
        let (db, tracker, ep) = setup().await;
        let t0 = at(2024, 3, 4, 12);

        let p = db.create_player("dup".to_string(), None, t0).await.unwrap();
        db.open_session(p.id, ep, t0 - 300).await.unwrap();
        db.open_session(p.id, ep, t0 - 100).await.unwrap();

        // the tracker saw this player before the duplicate appeared
        tracker.apply_sample(ep, "s", &[entry("dup")], t0).await;
        tracker.apply_sample(ep, "s", &[], t0 + 50).await;

        // everything closed, and only the newest session was credited
        assert!(db.open_sessions_for(p.id, ep).await.unwrap().is_empty());
        let player = db.get_player(p.id).await.unwrap().unwrap();
        assert_eq!(player.total_playtime_seconds, 150);
    }

    #[tokio::test]
    async fn test_names_longer_than_sixteen_chars_are_skipped() {
        let (db, tracker, ep) = setup().await;
        let t0 = at(2024, 3, 4, 12);

        tracker
            .apply_sample(
                ep,
                "s",
                &[entry("ok_name"), entry("way_too_long_player_name")],
                t0,
            )
            .await;

        assert_eq!(db.table_counts().await.unwrap().players, 1);
    }
}

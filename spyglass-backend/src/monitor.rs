//! Periodic probe engine.
//!
//! A single driver task ticks on the configured interval; every tick reads
//! the endpoint table and spawns one probe task per endpoint, gated by a
//! semaphore so at most `max_concurrent` probes run at once. Probe tasks
//! share nothing mutable; results flow into the store, the session tracker
//! and the push hub. No probe failure ever stops the loop.

use crate::helpers;
use crate::hub::Hub;
use crate::protocol::{self, ProbeReport};
use crate::sessions::SessionTracker;
use serde_json::json;
use spyglass_db::{Database, Dialect, Endpoint, EndpointStatus, ProbeObservation};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub ping_timeout: Duration,
    pub max_concurrent: usize,
}

pub struct Monitor {
    db: Database,
    hub: Hub,
    tracker: Arc<SessionTracker>,
    semaphore: Arc<Semaphore>,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(
        db: Database,
        hub: Hub,
        tracker: Arc<SessionTracker>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            hub,
            tracker,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
        })
    }

    /// Drive probe cycles until the shutdown flag flips, then drain
    /// whatever is still in flight before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles: JoinSet<()> = JoinSet::new();

        info!(interval = ?self.config.interval, "endpoint monitoring started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let monitor = Arc::clone(&self);
                    cycles.spawn(monitor.run_cycle());
                }
                Some(finished) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = finished {
                        error!("probe cycle task failed: {e}");
                    }
                }
            }
        }

        info!("waiting for in-flight probes to finish...");
        while let Some(finished) = cycles.join_next().await {
            if let Err(e) = finished {
                error!("probe cycle task failed: {e}");
            }
        }
        info!("endpoint monitoring stopped");
    }

    /// Probe every registered endpoint once, then publish fleet totals.
    async fn run_cycle(self: Arc<Self>) {
        let endpoints = match self.db.list_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!("failed to fetch endpoints: {e}");
                return;
            }
        };
        debug!("checking {} endpoints", endpoints.len());

        let mut probes: JoinSet<()> = JoinSet::new();
        for endpoint in endpoints {
            let monitor = Arc::clone(&self);
            probes.spawn(async move {
                let Ok(_permit) = monitor.semaphore.clone().acquire_owned().await else {
                    return;
                };
                monitor.probe_endpoint(endpoint).await;
            });
        }
        while let Some(finished) = probes.join_next().await {
            if let Err(e) = finished {
                // a panicking probe must never take the engine down
                error!("probe task panicked: {e}");
            }
        }

        self.publish_fleet_stats().await;
    }

    /// Probe a single endpoint and persist/broadcast the outcome. The probe
    /// is bounded by the wall-clock budget on top of the codec's own
    /// deadlines.
    pub async fn probe_endpoint(&self, endpoint: Endpoint) {
        let outcome = timeout(
            self.config.ping_timeout,
            protocol::probe(&endpoint.host, endpoint.port, endpoint.dialect),
        )
        .await;
        let now = helpers::now();

        match outcome {
            Ok(Ok(report)) => self.handle_online(&endpoint, report, now).await,
            Ok(Err(e)) => {
                warn!(endpoint = %endpoint.display_name, "probe failed: {e}");
                self.handle_offline(&endpoint, now).await;
            }
            Err(_) => {
                warn!(endpoint = %endpoint.display_name, "probe exceeded wall-clock budget");
                self.handle_offline(&endpoint, now).await;
            }
        }
    }

    async fn handle_online(&self, endpoint: &Endpoint, report: ProbeReport, now: i64) {
        // players the server reports but does not name in the sample
        let anonymous_count = (report.roster_online - report.roster.len() as i64).max(0);

        let observation = ProbeObservation {
            roster_online: report.roster_online,
            max_roster: report.max_roster,
            latency_ms: report.latency_ms,
            version: report.version.clone(),
            motd: report.motd.clone(),
            anonymous_count,
        };
        if let Err(e) = self.db.record_probe_online(endpoint.id, observation, now).await {
            error!(endpoint = %endpoint.display_name, "failed to persist probe result: {e}");
        }

        if endpoint.dialect == Dialect::Auto {
            if let Err(e) = self.db.lock_in_dialect(endpoint.id, report.dialect).await {
                error!(endpoint = %endpoint.display_name, "failed to persist detected dialect: {e}");
            }
        }

        self.tracker
            .apply_sample(endpoint.id, &endpoint.display_name, &report.roster, now)
            .await;

        self.hub.server_status(
            endpoint.id,
            json!({
                "id": endpoint.id,
                "name": endpoint.display_name,
                "status": "online",
                "players_online": report.roster_online,
                "max_players": report.max_roster,
                "anonymous_count": anonymous_count,
                "ping": report.latency_ms,
                "version": report.version,
                "motd": report.motd,
            }),
        );
    }

    async fn handle_offline(&self, endpoint: &Endpoint, now: i64) {
        // close open sessions before the endpoint fields are zeroed
        if endpoint.last_status == EndpointStatus::Online {
            self.tracker
                .apply_sample(endpoint.id, &endpoint.display_name, &[], now)
                .await;
        }

        if let Err(e) = self.db.record_probe_offline(endpoint.id, now).await {
            error!(endpoint = %endpoint.display_name, "failed to persist offline state: {e}");
        }

        self.hub.server_status(
            endpoint.id,
            json!({
                "id": endpoint.id,
                "name": endpoint.display_name,
                "status": "offline",
                "anonymous_count": 0,
            }),
        );
    }

    async fn publish_fleet_stats(&self) {
        match self.db.list_endpoints().await {
            Ok(endpoints) => {
                let online = endpoints
                    .iter()
                    .filter(|e| e.last_status == EndpointStatus::Online)
                    .count();
                let players_online: i64 = endpoints.iter().map(|e| e.last_roster_size).sum();
                self.hub.stats_update(json!({
                    "endpoints_total": endpoints.len(),
                    "endpoints_online": online,
                    "players_online": players_online,
                }));
            }
            Err(e) => error!("failed to aggregate fleet stats: {e}"),
        }
    }
}

//! Single-writer event loop owning the aggregate cache.
//!
//! Reports, queries, eviction ticks and shutdown all funnel through one task,
//! so the cache needs no locking. Other tasks talk to it through a
//! [`DispatcherHandle`] and the report sender returned by [`Dispatcher::new`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use sbs_core::cache::{persist, AggregateCache};
use sbs_core::plane::{PlaneDetail, PlaneSummary};
use sbs_core::store::PlaneStore;
use sbs_core::types::*;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Aircraft in the cache plus stored aircraft that are no longer live.
#[derive(Debug, Default, Serialize)]
pub struct PlanesView {
    pub current: Vec<PlaneSummary>,
    pub past: Vec<PlaneSummary>,
}

/// Query sent to the dispatcher. Each carries its own reply channel.
#[derive(Debug)]
pub enum Command {
    Active {
        since: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Vec<PlaneSummary>>,
    },
    Planes {
        since: Option<DateTime<Utc>>,
        reply: oneshot::Sender<PlanesView>,
    },
    Plane {
        icao: Icao,
        reply: oneshot::Sender<PlaneDetail>,
    },
    Locations {
        icao: Icao,
        since: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Vec<Location>>,
    },
}

#[derive(Debug, Error)]
#[error("dispatcher is not running")]
pub struct DispatcherClosed;

/// Cloneable client side of the command queue.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    commands: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, DispatcherClosed> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| DispatcherClosed)?;
        rx.await.map_err(|_| DispatcherClosed)
    }

    pub async fn active(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlaneSummary>, DispatcherClosed> {
        self.request(|reply| Command::Active { since, reply }).await
    }

    pub async fn planes(&self, since: Option<DateTime<Utc>>) -> Result<PlanesView, DispatcherClosed> {
        self.request(|reply| Command::Planes { since, reply }).await
    }

    pub async fn plane(&self, icao: Icao) -> Result<PlaneDetail, DispatcherClosed> {
        self.request(|reply| Command::Plane { icao, reply }).await
    }

    pub async fn locations(
        &self,
        icao: Icao,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Location>, DispatcherClosed> {
        self.request(|reply| Command::Locations { icao, since, reply })
            .await
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub evict_interval: Duration,
    pub evict_window: TimeDelta,
    /// Capacity of both the report and the command queue.
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            evict_interval: Duration::from_secs(60),
            evict_window: TimeDelta::seconds(60),
            queue_capacity: 50,
        }
    }
}

pub struct Dispatcher {
    cache: AggregateCache,
    store: Arc<dyn PlaneStore>,
    reports: mpsc::Receiver<TrackingReport>,
    commands: mpsc::Receiver<Command>,
    config: DispatcherConfig,
    /// Detached eviction saves still running.
    persisting: JoinSet<usize>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PlaneStore>,
        config: DispatcherConfig,
    ) -> (Dispatcher, DispatcherHandle, mpsc::Sender<TrackingReport>) {
        let capacity = config.queue_capacity.max(1);
        let (report_tx, reports) = mpsc::channel(capacity);
        let (command_tx, commands) = mpsc::channel(capacity);

        let dispatcher = Dispatcher {
            cache: AggregateCache::new(),
            store,
            reports,
            commands,
            config,
            persisting: JoinSet::new(),
        };
        let handle = DispatcherHandle {
            commands: command_tx,
        };
        (dispatcher, handle, report_tx)
    }

    /// Run until `shutdown` resolves or both input queues close, then flush
    /// the whole cache to the store.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        let mut tick = tokio::time::interval(self.config.evict_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        tick.tick().await;

        let mut reports_open = true;
        let mut commands_open = true;

        loop {
            tokio::select! {
                report = self.reports.recv(), if reports_open => match report {
                    Some(report) => self.handle_report(report),
                    None => {
                        debug!("report queue closed");
                        reports_open = false;
                    }
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("command queue closed");
                        commands_open = false;
                    }
                },
                _ = tick.tick() => {
                    self.handle_tick(Utc::now());
                }
                Some(done) = self.persisting.join_next(), if !self.persisting.is_empty() => {
                    if let Err(e) = done {
                        error!("persist task failed: {e}");
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }

            if !reports_open && !commands_open {
                info!("all inputs closed");
                break;
            }
        }

        let flushed = self.flush().await;
        info!("flushed {flushed} aircraft on shutdown");
    }

    /// Merge one report into its aggregate, loading it from the store on first sight.
    pub fn handle_report(&mut self, report: TrackingReport) {
        let plane = self.cache.get_or_create(report.icao, self.store.as_ref());
        if plane.apply(&report) {
            trace!(icao = %icao_to_string(&report.icao), subtype = report.subtype, "recorded");
        }
    }

    /// Evict aircraft idle at `now` and save them in the background.
    /// Returns how many were evicted.
    pub fn handle_tick(&mut self, now: DateTime<Utc>) -> usize {
        let evicted = self.cache.evict_due(Some(now), self.config.evict_window);
        let count = evicted.len();
        debug!("evicted {count} idle aircraft, {} still live", self.cache.len());
        if count > 0 {
            let store = Arc::clone(&self.store);
            self.persisting
                .spawn_blocking(move || persist(store.as_ref(), evicted));
        }
        count
    }

    pub fn handle_command(&mut self, command: Command) {
        // A dropped receiver just means the caller went away.
        match command {
            Command::Active { since, reply } => {
                let _ = reply.send(self.active(since));
            }
            Command::Planes { since, reply } => {
                let _ = reply.send(self.planes(since));
            }
            Command::Plane { icao, reply } => {
                let detail = self.cache.get_or_create(icao, self.store.as_ref()).detail();
                let _ = reply.send(detail);
            }
            Command::Locations { icao, since, reply } => {
                let _ = reply.send(self.locations(&icao, since));
            }
        }
    }

    fn active(&self, since: Option<DateTime<Utc>>) -> Vec<PlaneSummary> {
        self.cache
            .active_since(since)
            .into_iter()
            .map(|p| p.summary())
            .collect()
    }

    fn planes(&self, since: Option<DateTime<Utc>>) -> PlanesView {
        let past = match self.store.load_all_since(since) {
            Ok(planes) => planes
                .iter()
                .filter(|p| !self.cache.contains(&p.icao()))
                .map(|p| p.summary())
                .collect(),
            Err(e) => {
                warn!("loading stored aircraft failed: {e}");
                Vec::new()
            }
        };
        PlanesView {
            current: self.active(since),
            past,
        }
    }

    /// Stored fixes followed by the cached ones the store does not hold yet.
    fn locations(&self, icao: &Icao, since: Option<DateTime<Utc>>) -> Vec<Location> {
        let mut locations = self
            .store
            .load_locations_since(icao, since)
            .unwrap_or_else(|e| {
                warn!(icao = %icao_to_string(icao), "loading stored locations failed: {e}");
                Vec::new()
            });

        if let Some(plane) = self.cache.get(icao) {
            locations.extend(
                plane
                    .unsaved_locations()
                    .iter()
                    .filter(|l| since.map_or(true, |s| l.time > s))
                    .copied(),
            );
        }
        locations
    }

    /// Wait for background saves, then drain and save the whole cache.
    async fn flush(&mut self) -> usize {
        while let Some(done) = self.persisting.join_next().await {
            if let Err(e) = done {
                error!("persist task failed: {e}");
            }
        }

        let staged = self.cache.evict_due(None, self.config.evict_window);
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || persist(store.as_ref(), staged)).await {
            Ok(n) => n,
            Err(e) => {
                error!("shutdown persist failed: {e}");
                0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Persistence gateway consumed by the cache and dispatcher.
//!
//! The SQLite implementation lives in `sbs-server`; [`MemoryStore`] backs
//! file replays and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::plane::PlaneAggregate;
use crate::types::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store unavailable")]
    Unavailable,
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable load/save of aggregates.
///
/// `save` upserts scalar fields and appends only the callsigns, squawks,
/// locations and history entries the store does not hold yet. Aggregates
/// returned by `load` are marked persisted so a later save stays append-only.
pub trait PlaneStore: Send + Sync {
    fn load(&self, icao: &Icao) -> StoreResult<Option<PlaneAggregate>>;

    /// Write one batch, atomically where the backend allows.
    fn save(&self, planes: &[PlaneAggregate]) -> StoreResult<()>;

    /// Aggregates last seen after `since` (all when `None`), newest first.
    fn load_all_since(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<PlaneAggregate>>;

    /// Stored fixes for one aircraft after `since`, in insertion order.
    fn load_locations_since(
        &self,
        icao: &Icao,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Location>>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// HashMap-backed store. Optionally fails every call.
#[derive(Default)]
pub struct MemoryStore {
    planes: Mutex<HashMap<Icao, PlaneAggregate>>,
    failing: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every operation returns [`StoreError::Unavailable`].
    pub fn failing() -> Self {
        MemoryStore {
            planes: Mutex::new(HashMap::new()),
            failing: true,
        }
    }

    pub fn len(&self) -> usize {
        self.planes.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn planes(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<Icao, PlaneAggregate>>> {
        if self.failing {
            return Err(StoreError::Unavailable);
        }
        self.planes.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl PlaneStore for MemoryStore {
    fn load(&self, icao: &Icao) -> StoreResult<Option<PlaneAggregate>> {
        Ok(self.planes()?.get(icao).cloned())
    }

    fn save(&self, planes: &[PlaneAggregate]) -> StoreResult<()> {
        let mut stored = self.planes()?;
        for plane in planes {
            let mut plane = plane.clone();
            plane.mark_persisted();
            stored.insert(plane.icao(), plane);
        }
        Ok(())
    }

    fn load_all_since(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<PlaneAggregate>> {
        let mut planes: Vec<PlaneAggregate> = self
            .planes()?
            .values()
            .filter(|p| p.seen_after(since))
            .cloned()
            .collect();
        planes.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(planes)
    }

    fn load_locations_since(
        &self,
        icao: &Icao,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Location>> {
        Ok(self
            .planes()?
            .get(icao)
            .map(|p| {
                p.locations
                    .iter()
                    .filter(|l| since.map_or(true, |s| l.time > s))
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Per-aircraft aggregate and its merge rules.
//!
//! Pure logic, no I/O. The dispatcher owns every live `PlaneAggregate` and
//! feeds it `TrackingReport`s through [`PlaneAggregate::apply`]; the store
//! turns aggregates into rows and back.
//!
//! Which fields a report touches is decided by [`SUBTYPE_FIELDS`], a table
//! from transmission subtype to an ordered list of (field, setter) pairs.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::types::*;

/// A report is kept in history even without a field change once this much
/// time has passed since the aircraft was last seen.
pub const FRESHNESS_WINDOW_SECS: i64 = 600;

pub fn freshness_window() -> TimeDelta {
    TimeDelta::seconds(FRESHNESS_WINDOW_SECS)
}

// ---------------------------------------------------------------------------
// Subtype table
// ---------------------------------------------------------------------------

/// A tracked field a report can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Callsign,
    Altitude,
    Speed,
    Track,
    Location,
    VerticalRate,
    Squawk,
    SquawkChange,
    Emergency,
    Ident,
    OnGround,
}

/// Applies one field of a report; returns whether the visible value changed.
pub type Setter = fn(&mut PlaneAggregate, &TrackingReport) -> bool;

const CALLSIGN: (Field, Setter) = (Field::Callsign, |p, r| {
    r.callsign.as_deref().is_some_and(|cs| p.set_callsign(cs))
});
const ALTITUDE: (Field, Setter) = (Field::Altitude, |p, r| {
    r.altitude_ft.is_some_and(|a| p.set_altitude(a))
});
const SPEED: (Field, Setter) = (Field::Speed, |p, r| {
    r.ground_speed_kts.is_some_and(|s| p.set_speed(s))
});
const TRACK: (Field, Setter) = (Field::Track, |p, r| {
    r.track_deg.is_some_and(|t| p.set_track(t))
});
const LOCATION: (Field, Setter) = (Field::Location, |p, r| {
    p.set_location(r.lat, r.lon, r.generated)
});
const VERTICAL_RATE: (Field, Setter) = (Field::VerticalRate, |p, r| {
    r.vertical_rate_fpm.is_some_and(|v| p.set_vertical_rate(v))
});
const SQUAWK: (Field, Setter) = (Field::Squawk, |p, r| {
    r.squawk.as_deref().is_some_and(|s| p.set_squawk(s))
});
const SQUAWK_CHANGE: (Field, Setter) = (Field::SquawkChange, |p, r| {
    r.squawk_change.is_some_and(|f| p.set_squawk_change(f))
});
const EMERGENCY: (Field, Setter) = (Field::Emergency, |p, r| {
    r.emergency.is_some_and(|f| p.set_emergency(f))
});
const IDENT: (Field, Setter) = (Field::Ident, |p, r| {
    r.ident.is_some_and(|f| p.set_ident(f))
});
const ON_GROUND: (Field, Setter) = (Field::OnGround, |p, r| {
    r.on_ground.is_some_and(|f| p.set_on_ground(f))
});

/// Fields carried by each BaseStation transmission subtype, in apply order.
pub const SUBTYPE_FIELDS: &[(u8, &[(Field, Setter)])] = &[
    (1, &[CALLSIGN]),
    (2, &[ALTITUDE, SPEED, TRACK, LOCATION, ON_GROUND]),
    (3, &[ALTITUDE, LOCATION, SQUAWK_CHANGE, EMERGENCY, IDENT, ON_GROUND]),
    (4, &[SPEED, TRACK, VERTICAL_RATE]),
    (5, &[ALTITUDE, SQUAWK_CHANGE, IDENT, ON_GROUND]),
    (6, &[ALTITUDE, SQUAWK, SQUAWK_CHANGE, EMERGENCY, IDENT, ON_GROUND]),
    (7, &[ALTITUDE, ON_GROUND]),
    (8, &[ON_GROUND]),
];

/// Look up the (field, setter) list for a subtype. Unknown subtypes carry nothing.
pub fn subtype_fields(subtype: u8) -> &'static [(Field, Setter)] {
    SUBTYPE_FIELDS
        .iter()
        .find(|(st, _)| *st == subtype)
        .map(|(_, fields)| *fields)
        .unwrap_or(&[])
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// Accumulated state for one aircraft.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneAggregate {
    icao: Icao,
    pub callsign: Option<String>,
    /// Distinct callsigns in first-seen order.
    pub callsigns: Vec<String>,
    pub squawk: Option<String>,
    /// Distinct squawk codes in first-seen order.
    pub squawks: Vec<String>,
    pub locations: Vec<Location>,

    pub altitude_ft: i32,
    pub track_deg: f64,
    pub speed_kts: f64,
    pub vertical_rate_fpm: i32,

    // Flags
    pub squawk_change: bool,
    pub emergency: bool,
    pub ident: bool,
    pub on_ground: bool,

    pub last_seen: Option<DateTime<Utc>>,
    /// Reports that changed a field or broke a long silence.
    pub history: Vec<TrackingReport>,

    // How many locations / history entries the store already holds.
    saved_locations: usize,
    saved_history: usize,
}

impl PlaneAggregate {
    /// Fresh aggregate seeded only with its key.
    pub fn new(icao: Icao) -> Self {
        PlaneAggregate {
            icao,
            callsign: None,
            callsigns: Vec::new(),
            squawk: None,
            squawks: Vec::new(),
            locations: Vec::new(),
            altitude_ft: 0,
            track_deg: 0.0,
            speed_kts: 0.0,
            vertical_rate_fpm: 0,
            squawk_change: false,
            emergency: false,
            ident: false,
            on_ground: false,
            last_seen: None,
            history: Vec::new(),
            saved_locations: 0,
            saved_history: 0,
        }
    }

    pub fn icao(&self) -> Icao {
        self.icao
    }

    /// True when the aircraft has not been seen at or after `cutoff`.
    /// An aggregate that never received a report is always idle.
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_seen.map_or(true, |seen| seen < cutoff)
    }

    pub fn seen_after(&self, since: Option<DateTime<Utc>>) -> bool {
        match (since, self.last_seen) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(since), Some(seen)) => seen > since,
        }
    }

    // -----------------------------------------------------------------------
    // Setters
    // -----------------------------------------------------------------------

    /// Make `cs` the current callsign. Returns true only if the current callsign moved.
    pub fn set_callsign(&mut self, cs: &str) -> bool {
        set_current(&mut self.callsign, &mut self.callsigns, cs)
    }

    /// Make `squawk` the current squawk. Returns true only if the current squawk moved.
    pub fn set_squawk(&mut self, squawk: &str) -> bool {
        set_current(&mut self.squawk, &mut self.squawks, squawk)
    }

    /// Append a fix when both coordinates are present. No dedup.
    pub fn set_location(&mut self, lat: Option<f64>, lon: Option<f64>, time: DateTime<Utc>) -> bool {
        match (lat, lon) {
            (Some(lat), Some(lon)) => {
                self.locations.push(Location { time, lat, lon });
                true
            }
            _ => false,
        }
    }

    pub fn set_altitude(&mut self, altitude_ft: i32) -> bool {
        replace(&mut self.altitude_ft, altitude_ft)
    }

    pub fn set_track(&mut self, track_deg: f64) -> bool {
        replace(&mut self.track_deg, track_deg)
    }

    /// Zero speed means "no data" on the wire and is ignored.
    pub fn set_speed(&mut self, speed_kts: f64) -> bool {
        speed_kts != 0.0 && replace(&mut self.speed_kts, speed_kts)
    }

    pub fn set_vertical_rate(&mut self, vertical_rate_fpm: i32) -> bool {
        replace(&mut self.vertical_rate_fpm, vertical_rate_fpm)
    }

    pub fn set_squawk_change(&mut self, flag: bool) -> bool {
        replace(&mut self.squawk_change, flag)
    }

    pub fn set_emergency(&mut self, flag: bool) -> bool {
        replace(&mut self.emergency, flag)
    }

    pub fn set_ident(&mut self, flag: bool) -> bool {
        replace(&mut self.ident, flag)
    }

    pub fn set_on_ground(&mut self, flag: bool) -> bool {
        replace(&mut self.on_ground, flag)
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Merge one report. Returns whether the report was recorded in history.
    ///
    /// `last_seen` always advances to the newest `generated` time, even when
    /// the report changes nothing or arrives out of order.
    pub fn apply(&mut self, report: &TrackingReport) -> bool {
        let changed = subtype_fields(report.subtype)
            .iter()
            .fold(false, |changed, (_, setter)| setter(self, report) | changed);

        let silent_too_long = match self.last_seen {
            Some(seen) => report.generated - seen > freshness_window(),
            None => true,
        };

        let recorded = changed || silent_too_long;
        if recorded {
            self.history.push(report.clone());
        }

        self.last_seen = Some(match self.last_seen {
            Some(seen) => seen.max(report.generated),
            None => report.generated,
        });

        recorded
    }

    // -----------------------------------------------------------------------
    // Persistence bookkeeping
    // -----------------------------------------------------------------------

    /// Record that everything currently held is already in the store.
    pub fn mark_persisted(&mut self) {
        self.saved_locations = self.locations.len();
        self.saved_history = self.history.len();
    }

    /// Locations not yet written to the store.
    pub fn unsaved_locations(&self) -> &[Location] {
        &self.locations[self.saved_locations.min(self.locations.len())..]
    }

    /// History entries not yet written to the store.
    pub fn unsaved_history(&self) -> &[TrackingReport] {
        &self.history[self.saved_history.min(self.history.len())..]
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    pub fn summary(&self) -> PlaneSummary {
        PlaneSummary {
            icao: icao_to_string(&self.icao),
            callsign: self.callsign.clone(),
            callsigns: self.callsigns.clone(),
            squawk: self.squawk.clone(),
            squawks: self.squawks.clone(),
            location: self.locations.last().copied(),
            altitude_ft: self.altitude_ft,
            track_deg: self.track_deg,
            speed_kts: self.speed_kts,
            vertical_rate_fpm: self.vertical_rate_fpm,
            squawk_change: self.squawk_change,
            emergency: self.emergency,
            ident: self.ident,
            on_ground: self.on_ground,
            last_seen: self.last_seen,
        }
    }

    pub fn detail(&self) -> PlaneDetail {
        PlaneDetail {
            summary: self.summary(),
            locations: self.locations.clone(),
            history: self.history.clone(),
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot != value {
        *slot = value;
        true
    } else {
        false
    }
}

fn set_current(current: &mut Option<String>, seen: &mut Vec<String>, candidate: &str) -> bool {
    let candidate = candidate.trim();
    if candidate.is_empty() || current.as_deref() == Some(candidate) {
        return false;
    }
    // Recent values are the likeliest match.
    if !seen.iter().rev().any(|s| s == candidate) {
        seen.push(candidate.to_string());
    }
    *current = Some(candidate.to_string());
    true
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Stable JSON view of an aggregate for list endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaneSummary {
    pub icao: String,
    pub callsign: Option<String>,
    pub callsigns: Vec<String>,
    pub squawk: Option<String>,
    pub squawks: Vec<String>,
    pub location: Option<Location>,
    pub altitude_ft: i32,
    pub track_deg: f64,
    pub speed_kts: f64,
    pub vertical_rate_fpm: i32,
    pub squawk_change: bool,
    pub emergency: bool,
    pub ident: bool,
    pub on_ground: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Summary plus the full location trail and history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaneDetail {
    #[serde(flatten)]
    pub summary: PlaneSummary,
    pub locations: Vec<Location>,
    pub history: Vec<TrackingReport>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

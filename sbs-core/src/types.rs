//! Shared types, error enum, aircraft key helpers and the tracking report.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Errors produced by sbs-core outside of decoding and storage.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// ICAO address helpers
// ---------------------------------------------------------------------------

/// 3-byte ICAO address. Stored as raw bytes to avoid per-report String allocation.
pub type Icao = [u8; 3];

/// Format ICAO address as 6-char uppercase hex string.
pub fn icao_to_string(icao: &Icao) -> String {
    format!("{:02X}{:02X}{:02X}", icao[0], icao[1], icao[2])
}

/// Parse a 6-char hex string into an ICAO address.
pub fn icao_from_hex(hex: &str) -> Option<Icao> {
    if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let val = u32::from_str_radix(hex, 16).ok()?;
    Some(icao_from_u32(val))
}

/// Build ICAO from a 24-bit integer.
pub fn icao_from_u32(val: u32) -> Icao {
    [
        ((val >> 16) & 0xFF) as u8,
        ((val >> 8) & 0xFF) as u8,
        (val & 0xFF) as u8,
    ]
}

/// Serialize an [`Icao`] as its hex string instead of a byte array.
pub fn serialize_icao<S: Serializer>(icao: &Icao, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&icao_to_string(icao))
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Unix seconds (fractional) as stored in the database.
pub fn to_unix_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

/// Inverse of [`to_unix_secs`], rounded to the millisecond.
pub fn from_unix_secs(secs: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
}

// ---------------------------------------------------------------------------
// Reports and locations
// ---------------------------------------------------------------------------

/// One position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub time: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
}

/// A decoded BaseStation `MSG` record.
///
/// Which optional fields are populated depends on `subtype`; `None` means the
/// record did not carry the field (or it was empty on the wire).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingReport {
    #[serde(serialize_with = "serialize_icao")]
    pub icao: Icao,
    pub subtype: u8,
    pub generated: DateTime<Utc>,
    pub received: DateTime<Utc>,
    pub callsign: Option<String>,
    pub altitude_ft: Option<i32>,
    pub ground_speed_kts: Option<f64>,
    pub track_deg: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub vertical_rate_fpm: Option<i32>,
    pub squawk: Option<String>,
    pub squawk_change: Option<bool>,
    pub emergency: Option<bool>,
    pub ident: Option<bool>,
    pub on_ground: Option<bool>,
}

impl TrackingReport {
    /// Report with no payload fields. `received` defaults to `generated`.
    pub fn new(icao: Icao, subtype: u8, generated: DateTime<Utc>) -> Self {
        TrackingReport {
            icao,
            subtype,
            generated,
            received: generated,
            callsign: None,
            altitude_ft: None,
            ground_speed_kts: None,
            track_deg: None,
            lat: None,
            lon: None,
            vertical_rate_fpm: None,
            squawk: None,
            squawk_change: None,
            emergency: None,
            ident: None,
            on_ground: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

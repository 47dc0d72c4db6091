//! BaseStation (SBS-1) CSV decoding.
//!
//! One line in, one [`TrackingReport`] out. Stateless, so the feed can decode
//! lines on as many tasks as it likes.
//!
//! Record layout (22 comma-separated fields):
//!
//! | idx | field | idx | field |
//! |-----|-------|-----|-------|
//! | 0 | message type (`MSG`) | 11 | altitude |
//! | 1 | transmission subtype | 12 | ground speed |
//! | 2 | session id | 13 | track |
//! | 3 | aircraft id | 14 | latitude |
//! | 4 | hex ident (ICAO) | 15 | longitude |
//! | 5 | flight id | 16 | vertical rate |
//! | 6 | date generated | 17 | squawk |
//! | 7 | time generated | 18 | squawk change flag |
//! | 8 | date logged | 19 | emergency flag |
//! | 9 | time logged | 20 | ident flag |
//! | 10 | callsign | 21 | on-ground flag |

use chrono::offset::LocalResult;
use chrono::{
    DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, TimeZone, Utc,
};
use thiserror::Error;

use crate::plane::{subtype_fields, Field};
use crate::types::*;

pub const FIELD_COUNT: usize = 22;

const MSG_TYPE: usize = 0;
const SUBTYPE: usize = 1;
const HEX_IDENT: usize = 4;
const DATE_GENERATED: usize = 6;
const TIME_GENERATED: usize = 7;
const DATE_LOGGED: usize = 8;
const TIME_LOGGED: usize = 9;
const CALLSIGN: usize = 10;
const ALTITUDE: usize = 11;
const GROUND_SPEED: usize = 12;
const TRACK: usize = 13;
const LATITUDE: usize = 14;
const LONGITUDE: usize = 15;
const VERTICAL_RATE: usize = 16;
const SQUAWK: usize = 17;
const SQUAWK_CHANGE: usize = 18;
const EMERGENCY: usize = 19;
const IDENT: usize = 20;
const ON_GROUND: usize = 21;

/// Why a line was discarded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("wrong field count: expected {FIELD_COUNT}, got {0}")]
    FieldCount(usize),
    #[error("unsupported record type {0:?}")]
    NotMsg(String),
    #[error("empty aircraft address 000000")]
    EmptyIcao,
    #[error("invalid aircraft address {0:?}")]
    InvalidIcao(String),
    #[error("invalid transmission subtype {0:?}")]
    InvalidSubtype(String),
    #[error("invalid {which} timestamp {date:?} {time:?}")]
    InvalidTimestamp {
        which: &'static str,
        date: String,
        time: String,
    },
}

impl DecodeError {
    /// Routine discards (non-MSG records, blank address) that are not worth a warning.
    pub fn is_routine(&self) -> bool {
        matches!(self, DecodeError::NotMsg(_) | DecodeError::EmptyIcao)
    }
}

/// Decode one SBS line. Trailing CR/LF is ignored.
pub fn decode_line(line: &str) -> Result<TrackingReport, DecodeError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != FIELD_COUNT {
        return Err(DecodeError::FieldCount(parts.len()));
    }

    if parts[MSG_TYPE] != "MSG" {
        return Err(DecodeError::NotMsg(parts[MSG_TYPE].to_string()));
    }

    let hex = parts[HEX_IDENT].trim();
    if hex == "000000" {
        return Err(DecodeError::EmptyIcao);
    }
    let icao = icao_from_hex(hex).ok_or_else(|| DecodeError::InvalidIcao(hex.to_string()))?;

    let subtype = parts[SUBTYPE]
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|st| (1..=8).contains(st))
        .ok_or_else(|| DecodeError::InvalidSubtype(parts[SUBTYPE].to_string()))?;

    let generated = parse_timestamp("generated", parts[DATE_GENERATED], parts[TIME_GENERATED])?;
    let received = parse_timestamp("logged", parts[DATE_LOGGED], parts[TIME_LOGGED])?;

    let mut report = TrackingReport::new(icao, subtype, generated);
    report.received = received;

    for (field, _) in subtype_fields(subtype) {
        match field {
            Field::Callsign => report.callsign = parse_text(parts[CALLSIGN]),
            Field::Altitude => report.altitude_ft = parse_num(parts[ALTITUDE]),
            Field::Speed => report.ground_speed_kts = parse_num(parts[GROUND_SPEED]),
            Field::Track => report.track_deg = parse_num(parts[TRACK]),
            Field::Location => {
                report.lat = parse_num(parts[LATITUDE]);
                report.lon = parse_num(parts[LONGITUDE]);
            }
            Field::VerticalRate => report.vertical_rate_fpm = parse_num(parts[VERTICAL_RATE]),
            Field::Squawk => report.squawk = parse_text(parts[SQUAWK]),
            Field::SquawkChange => report.squawk_change = parse_flag(parts[SQUAWK_CHANGE]),
            Field::Emergency => report.emergency = parse_flag(parts[EMERGENCY]),
            Field::Ident => report.ident = parse_flag(parts[IDENT]),
            Field::OnGround => report.on_ground = parse_flag(parts[ON_GROUND]),
        }
    }

    Ok(report)
}

/// SBS timestamps carry no zone; receivers write them in local time.
fn parse_timestamp(which: &'static str, date: &str, time: &str) -> Result<DateTime<Utc>, DecodeError> {
    let invalid = || DecodeError::InvalidTimestamp {
        which,
        date: date.to_string(),
        time: time.to_string(),
    };
    let d = NaiveDate::parse_from_str(date.trim(), "%Y/%m/%d").map_err(|_| invalid())?;
    let t = NaiveTime::parse_from_str(time.trim(), "%H:%M:%S%.f").map_err(|_| invalid())?;
    local_to_utc(&Local, NaiveDateTime::new(d, t)).ok_or_else(invalid)
}

/// Convert a wall-clock time in `tz` to UTC.
///
/// Ambiguous times (clocks going back) take the earlier instant. Times inside
/// a spring-forward gap are read with the offset in force before the gap.
fn local_to_utc<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => Some(dt.with_timezone(&Utc)),
        LocalResult::None => {
            let before = naive.checked_sub_signed(TimeDelta::hours(3))?;
            let offset = tz.offset_from_local_datetime(&before).earliest()?.fix();
            naive
                .checked_sub_signed(TimeDelta::seconds(offset.local_minus_utc().into()))
                .map(|utc| utc.and_utc())
        }
    }
}

fn parse_text(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Option<T> {
    s.trim().parse().ok()
}

/// dump1090 writes `-1` for set flags; some feeders write `1` or `true`.
fn parse_flag(s: &str) -> Option<bool> {
    match s.trim() {
        "-1" | "1" | "true" | "TRUE" | "True" => Some(true),
        "0" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

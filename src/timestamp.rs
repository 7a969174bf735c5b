//! Resolution of beat-based timestamps into measure-relative offsets.
//!
//! MEI positions floating elements by musical beat (`@tstamp`), counted
//! from 1 in the unit of the active meter's denominator. Ranges may end
//! in a later measure: `@tstamp2` optionally carries a
//! `<measures-to-skip>m+` prefix.

use crate::model::{MeterSig, Ql, ql};
use num_traits::Zero;

/// Parse a decimal beat value (`"1"`, `"2.5"`) into an exact rational.
fn parse_beat(s: &str) -> Option<Ql> {
    let s = s.trim();
    match s.split_once('.') {
        None => {
            let whole: i64 = s.parse().ok()?;
            Some(ql(whole, 1))
        }
        Some((whole, frac)) => {
            if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let whole: i64 = whole.parse().ok()?;
            let numer: i64 = frac.parse().ok()?;
            let denom = 10i64.pow(frac.len() as u32);
            Some(ql(whole, 1) + ql(numer, denom))
        }
    }
}

/// Convert a `@tstamp` beat value to a quarter-note offset from the
/// start of the measure, under the given meter. Beat 1 is offset 0.
/// Out-of-vocabulary values are warned about and treated as absent.
pub fn tstamp_to_offset(tstamp: &str, meter: &MeterSig) -> Option<Ql> {
    let beat = match parse_beat(tstamp) {
        Some(b) => b,
        None => {
            log::warn!("Unexpected value for \"tstamp\" attribute: {tstamp}, ignoring.");
            return None;
        }
    };
    let beat_length = ql(4, meter.unit as i64);
    let offset = (beat - ql(1, 1)) * beat_length;
    if offset < Ql::zero() {
        log::warn!("Negative offset from tstamp {tstamp}, ignoring.");
        return None;
    }
    Some(offset)
}

/// Convert a `@tstamp2` value to (measures to skip, quarter-note offset
/// within the target measure). `"1m+2.0"` means "one measure later, at
/// beat 2"; a bare beat value targets the same measure.
pub fn tstamp2_to_meas_skip_and_offset(tstamp2: &str, meter: &MeterSig) -> Option<(u32, Ql)> {
    let tstamp2 = tstamp2.trim();
    let (skip, beat_str) = match tstamp2.split_once("m+") {
        Some((skip_str, rest)) => {
            let skip: u32 = match skip_str.parse() {
                Ok(n) => n,
                Err(_) => {
                    log::warn!("Unexpected value for \"tstamp2\" attribute: {tstamp2}, ignoring.");
                    return None;
                }
            };
            (skip, rest)
        }
        None => (0, tstamp2),
    };
    let offset = tstamp_to_offset(beat_str, meter)?;
    Some((skip, offset))
}

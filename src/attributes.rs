//! One-to-one translators from MEI controlled-vocabulary attribute
//! values to model enumerations.
//!
//! These are deliberately fail-soft: a value outside the known
//! vocabulary is warned about and treated as absent, so a single stray
//! attribute never aborts an import. Elements whose *required*
//! attributes are missing are handled by the callers, not here.

use crate::model::{
    ArpeggioStyle, Articulation, BarStyle, Barline, NoteheadShape, Ql, RepeatDirection,
    StemDirection, ql,
};

/// Warn about an attribute value outside its known vocabulary.
fn warn_unexpected(name: &str, value: &str) {
    log::warn!("Unexpected value for \"{name}\" attribute: {value}, ignoring.");
}

/// Translate an `@accid` (written accidental) value into a semitone
/// alteration. Quarter-tone values map to half-integer alterations.
pub fn accidental_from_attr(attr: Option<&str>) -> Option<f64> {
    let attr = attr?;
    let alter = match attr {
        "s" => 1.0,
        "f" => -1.0,
        "ss" | "x" => 2.0,
        "ff" => -2.0,
        "xs" | "ts" => 3.0,
        "tf" => -3.0,
        "n" => 0.0,
        "nf" => -1.0,
        "ns" => 1.0,
        "su" => 1.5,
        "sd" => 0.5,
        "fu" => -0.5,
        "fd" => -1.5,
        "nu" => 0.5,
        "nd" => -0.5,
        other => {
            warn_unexpected("accid", other);
            return None;
        }
    };
    Some(alter)
}

/// Translate an `@accid.ges` (gestural accidental) value. The gestural
/// vocabulary is a subset of the written one.
pub fn accid_ges_from_attr(attr: Option<&str>) -> Option<f64> {
    let attr = attr?;
    let alter = match attr {
        "s" => 1.0,
        "f" => -1.0,
        "ss" => 2.0,
        "ff" => -2.0,
        "n" => 0.0,
        "su" => 1.5,
        "sd" => 0.5,
        "fu" => -0.5,
        "fd" => -1.5,
        other => {
            warn_unexpected("accid.ges", other);
            return None;
        }
    };
    Some(alter)
}

/// Placeholder duration used when `@dur` is absent — deliberately a
/// value too small to occur in real music, so the measure assembler can
/// recognize an un-corrected full-measure rest.
pub fn placeholder_duration() -> Ql {
    ql(1, 256)
}

/// Translate an `@dur` value into an undotted quarter-note length.
/// Mensural spellings are accepted as aliases of their common-notation
/// equivalents. Absent or unrecognized values yield the placeholder.
pub fn duration_from_attr(attr: Option<&str>) -> Ql {
    let Some(attr) = attr else {
        return placeholder_duration();
    };
    match attr {
        "maxima" => ql(32, 1),
        "long" | "longa" => ql(16, 1),
        "breve" | "brevis" => ql(8, 1),
        "1" | "semibrevis" => ql(4, 1),
        "2" | "minima" => ql(2, 1),
        "4" | "semiminima" => ql(1, 1),
        "8" | "fusa" => ql(1, 2),
        "16" | "semifusa" => ql(1, 4),
        "32" => ql(1, 8),
        "64" => ql(1, 16),
        "128" => ql(1, 32),
        "256" => ql(1, 64),
        "512" => ql(1, 128),
        "1024" => ql(1, 256),
        "2048" => ql(1, 512),
        other => {
            warn_unexpected("dur", other);
            placeholder_duration()
        }
    }
}

/// Translate one token of an `@artic` value. The compound values
/// `marc-stacc` and `ten-stacc` yield two marks.
pub fn articulation_from_attr(attr: &str) -> Vec<Articulation> {
    match attr {
        "marc-stacc" => return vec![Articulation::Marcato, Articulation::Staccato],
        "ten-stacc" => return vec![Articulation::Tenuto, Articulation::Staccato],
        _ => {}
    }
    let single = match attr {
        "acc" => Articulation::Accent,
        "stacc" => Articulation::Staccato,
        "ten" => Articulation::Tenuto,
        "stacciss" => Articulation::Staccatissimo,
        "marc" => Articulation::Marcato,
        "spicc" => Articulation::Spiccato,
        "doit" => Articulation::Doit,
        "plop" => Articulation::Plop,
        "fall" => Articulation::Falloff,
        "dnbow" => Articulation::DownBow,
        "upbow" => Articulation::UpBow,
        "harm" => Articulation::Harmonic,
        "snap" => Articulation::SnapPizzicato,
        "stop" => Articulation::Stopped,
        "open" => Articulation::Open,
        "dbltongue" => Articulation::DoubleTongue,
        "trpltongue" => Articulation::TripleTongue,
        "toe" => Articulation::OrganToe,
        "heel" => Articulation::OrganHeel,
        other => {
            warn_unexpected("artic", other);
            return Vec::new();
        }
    };
    vec![single]
}

/// Translate a whole `@artic` attribute (space-separated tokens) into a
/// list of articulation marks.
pub fn articulation_list_from_attr(attr: &str) -> Vec<Articulation> {
    attr.split_whitespace()
        .flat_map(articulation_from_attr)
        .collect()
}

/// Result of translating a measure's `@left`/`@right` attribute. The
/// `rptboth` value does double duty: it ends a repeat on this measure
/// and starts one on the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarlineResult {
    Single(Barline),
    /// End-repeat for this measure plus a start-repeat the caller must
    /// hand to the following measure as its left barline
    Both(Barline, Barline),
}

/// Translate a barline rendition value (`@left`, `@right`, or
/// `<barLine @rend>`).
pub fn barline_from_attr(attr: Option<&str>) -> BarlineResult {
    if let Some(attr) = attr {
        if attr.starts_with("rpt") {
            return match attr {
                "rptboth" => BarlineResult::Both(
                    Barline::repeat(RepeatDirection::Backward),
                    Barline::repeat(RepeatDirection::Forward),
                ),
                "rptend" => BarlineResult::Single(Barline::repeat(RepeatDirection::Backward)),
                _ => BarlineResult::Single(Barline::repeat(RepeatDirection::Forward)),
            };
        }
    }
    let style = match attr {
        None => BarStyle::Regular,
        Some("dashed") => BarStyle::Dashed,
        Some("dotted") => BarStyle::Dotted,
        Some("dbl") => BarStyle::Double,
        Some("end") => BarStyle::Final,
        Some("invis") => BarStyle::Invisible,
        Some("single") => BarStyle::Regular,
        Some(other) => {
            warn_unexpected("barline", other);
            BarStyle::Regular
        }
    };
    BarlineResult::Single(Barline::plain(style))
}

/// Translate `@stem.dir`.
pub fn stem_direction_from_attr(attr: Option<&str>) -> Option<StemDirection> {
    match attr? {
        "up" => Some(StemDirection::Up),
        "down" => Some(StemDirection::Down),
        other => {
            warn_unexpected("stem.dir", other);
            None
        }
    }
}

/// Translate `@head.shape`.
pub fn notehead_from_attr(attr: Option<&str>) -> Option<NoteheadShape> {
    match attr? {
        "diamond" => Some(NoteheadShape::Diamond),
        "x" => Some(NoteheadShape::X),
        "slash" => Some(NoteheadShape::Slash),
        "square" => Some(NoteheadShape::Square),
        "plus" => Some(NoteheadShape::Plus),
        other => {
            warn_unexpected("head.shape", other);
            None
        }
    }
}

/// Calculate the octave displacement encoded by `@dis` and
/// `@dis.place` on clefs and octave-shift ranges. `@dis` values other
/// than 8, 15, and 22 displace by nothing.
pub fn octave_shift_from_attrs(dis: Option<&str>, dis_place: Option<&str>) -> i8 {
    let octaves = match dis {
        None => 0,
        Some("8") => 1,
        Some("15") => 2,
        Some("22") => 3,
        Some(_) => 0,
    };
    if dis_place == Some("below") {
        -octaves
    } else {
        octaves
    }
}

/// Convert a key-signature value (`@sig` / `@key.sig`, e.g. `"3s"`,
/// `"4f"`, `"0"`, `"mixed"`) to a count of sharps (negative = flats).
pub fn sharps_from_attr(signature: Option<&str>) -> i8 {
    let Some(signature) = signature else {
        return 0;
    };
    if signature.is_empty() || signature.starts_with('0') {
        return 0;
    }
    let count: i8 = match signature[..1].parse() {
        Ok(n) => n,
        Err(_) => {
            warn_unexpected("key.sig", signature);
            return 0;
        }
    };
    if signature.ends_with('s') {
        count
    } else if signature.ends_with('f') {
        -count
    } else {
        warn_unexpected("key.sig", signature);
        0
    }
}

/// Normalize an arpeggio's `@arrow`/`@order` pair into one style.
pub fn arpeggio_style_from_attrs(arrow: Option<&str>, order: Option<&str>) -> ArpeggioStyle {
    match order {
        Some("nonarp") => return ArpeggioStyle::NonArpeggio,
        Some("down") => return ArpeggioStyle::Down,
        Some("up") => return ArpeggioStyle::Up,
        Some(other) => warn_unexpected("order", other),
        None => {}
    }
    match arrow {
        Some("true") => ArpeggioStyle::Up,
        _ => ArpeggioStyle::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accidentals_map_to_alterations() {
        assert_eq!(accidental_from_attr(Some("s")), Some(1.0));
        assert_eq!(accidental_from_attr(Some("ff")), Some(-2.0));
        assert_eq!(accidental_from_attr(Some("n")), Some(0.0));
        assert_eq!(accidental_from_attr(Some("su")), Some(1.5));
        assert_eq!(accidental_from_attr(Some("fd")), Some(-1.5));
        assert_eq!(accidental_from_attr(None), None);
        // out-of-vocabulary value degrades to absent
        assert_eq!(accidental_from_attr(Some("zz")), None);
    }

    #[test]
    fn durations_map_to_quarter_lengths() {
        assert_eq!(duration_from_attr(Some("1")), ql(4, 1));
        assert_eq!(duration_from_attr(Some("4")), ql(1, 1));
        assert_eq!(duration_from_attr(Some("8")), ql(1, 2));
        assert_eq!(duration_from_attr(Some("2048")), ql(1, 512));
        assert_eq!(duration_from_attr(Some("breve")), ql(8, 1));
        // absent and unrecognized both yield the placeholder
        assert_eq!(duration_from_attr(None), placeholder_duration());
        assert_eq!(duration_from_attr(Some("9")), placeholder_duration());
    }

    #[test]
    fn compound_articulations_expand() {
        assert_eq!(
            articulation_from_attr("marc-stacc"),
            vec![Articulation::Marcato, Articulation::Staccato]
        );
        assert_eq!(
            articulation_list_from_attr("acc ten"),
            vec![Articulation::Accent, Articulation::Tenuto]
        );
        assert!(articulation_from_attr("nonsense").is_empty());
    }

    #[test]
    fn rptboth_produces_two_barlines() {
        match barline_from_attr(Some("rptboth")) {
            BarlineResult::Both(end, start) => {
                assert_eq!(end.repeat, Some(RepeatDirection::Backward));
                assert_eq!(start.repeat, Some(RepeatDirection::Forward));
            }
            other => panic!("expected Both, got {other:?}"),
        }
    }

    #[test]
    fn sharps_from_signature_values() {
        assert_eq!(sharps_from_attr(Some("3s")), 3);
        assert_eq!(sharps_from_attr(Some("4f")), -4);
        assert_eq!(sharps_from_attr(Some("0")), 0);
        assert_eq!(sharps_from_attr(None), 0);
    }

    #[test]
    fn octave_shift_magnitudes() {
        assert_eq!(octave_shift_from_attrs(Some("8"), Some("above")), 1);
        assert_eq!(octave_shift_from_attrs(Some("15"), Some("below")), -2);
        assert_eq!(octave_shift_from_attrs(Some("22"), None), 3);
        assert_eq!(octave_shift_from_attrs(None, Some("below")), 0);
    }
}

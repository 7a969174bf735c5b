//! Data model for the score produced by MEI conversion.
//!
//! These structures are the narrow boundary between the conversion engine
//! and downstream consumers: events, voices, measures, parts, spanners.
//! Nothing in here knows about MEI vocabulary — the engine translates
//! into these types and never leaks format-specific names past them.
//!
//! All durations and offsets are exact rational quarter-note values;
//! tuplet and dot arithmetic compounds across many events, so
//! floating-point drift is not acceptable here.

use num_rational::Rational64;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

/// An exact quarter-note length or offset.
pub type Ql = Rational64;

/// Convenience constructor for a rational quarter-note value.
pub fn ql(numer: i64, denom: i64) -> Ql {
    Rational64::new(numer, denom)
}

/// Identifier of an event, unique within one converted score.
pub type EventId = u32;

/// A complete musical score converted from an MEI document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    /// Musical parts, one per staff, in document order
    pub parts: Vec<Part>,
    /// All spanners (slurs, octave shifts, wedges, brackets, ...) that
    /// link events across the score
    pub spanners: Vec<Spanner>,
}

impl Score {
    pub fn new() -> Self {
        Self {
            parts: Vec::new(),
            spanners: Vec::new(),
        }
    }

    /// Number of measures in the longest part.
    pub fn measure_count(&self) -> usize {
        self.parts.iter().map(|p| p.measures.len()).max().unwrap_or(0)
    }

    /// Look up an event anywhere in the score by its id.
    pub fn find_event(&self, id: EventId) -> Option<&Event> {
        for part in &self.parts {
            for measure in &part.measures {
                for voice in &measure.voices {
                    if let Some(e) = voice.events.iter().find(|e| e.id == id) {
                        return Some(e);
                    }
                }
            }
        }
        None
    }
}

impl Default for Score {
    fn default() -> Self {
        Self::new()
    }
}

/// A musical part: one staff's ordered measure sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    /// Stable staff label carried from the document's staff definitions
    pub n: String,
    /// Part name (e.g. "Clarinet")
    pub name: Option<String>,
    /// Abbreviated name (e.g. "Cl.")
    pub abbreviation: Option<String>,
    /// MIDI program number, when declared
    pub midi_program: Option<i32>,
    /// Written-to-sounding transposition, when declared
    pub transposition: Option<Transposition>,
    /// Ordered list of measures
    pub measures: Vec<Measure>,
}

impl Part {
    pub fn new(n: impl Into<String>) -> Self {
        Self {
            n: n.into(),
            name: None,
            abbreviation: None,
            midi_program: None,
            transposition: None,
            measures: Vec::new(),
        }
    }
}

/// Interval of transposition from written to concert pitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transposition {
    /// Diatonic steps (zero-based, negative = down)
    pub diatonic: i32,
    /// Chromatic semitones
    pub semitones: i32,
}

/// A single measure of one part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measure {
    /// Measure number
    pub number: i32,
    /// Voices (independent rhythmic streams) on this staff
    pub voices: Vec<Voice>,
    /// Left barline, only present when it differs from a plain barline
    pub left_barline: Option<Barline>,
    /// Right barline
    pub right_barline: Option<Barline>,
    /// Length of the bar in quarter notes
    pub bar_duration: Ql,
    /// Clef/key/meter in effect from the start of this measure, only
    /// present when they change here
    pub attributes: Option<MeasureAttributes>,
    /// Floating expressions (dynamics, directives, tempo marks) anchored
    /// by beat position within this measure
    pub directions: Vec<Direction>,
}

impl Measure {
    pub fn new(number: i32) -> Self {
        Self {
            number,
            voices: Vec::new(),
            left_barline: None,
            right_barline: None,
            bar_duration: Ql::zero(),
            attributes: None,
            directions: Vec::new(),
        }
    }
}

/// Signature changes that take effect at the start of a measure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasureAttributes {
    pub clef: Option<Clef>,
    pub key: Option<KeySig>,
    pub meter: Option<MeterSig>,
}

impl MeasureAttributes {
    pub fn is_empty(&self) -> bool {
        self.clef.is_none() && self.key.is_none() && self.meter.is_none()
    }
}

/// An independent rhythmic stream within one staff. The `id` must be
/// stable across measures for voice continuity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    /// Voice identifier, unique within its staff
    pub id: String,
    /// Ordered event sequence
    pub events: Vec<Event>,
    /// Mid-voice clef/key/meter changes, positioned by offset
    pub inserts: Vec<(Ql, StaffItem)>,
}

impl Voice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            events: Vec::new(),
            inserts: Vec::new(),
        }
    }
}

/// A clef, key, or meter change, or a drawn barline, occurring inside a
/// voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StaffItem {
    Clef(Clef),
    Key(KeySig),
    Meter(MeterSig),
    Barline(Barline),
}

// ─── Signatures ──────────────────────────────────────────────────────

/// Clef definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clef {
    pub shape: ClefShape,
    /// Staff line the clef sits on; irrelevant for percussion/tab clefs
    pub line: Option<u8>,
    /// Octave displacement in octaves (negative = down), e.g. -1 for the
    /// vocal-tenor treble clef
    pub octave_shift: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClefShape {
    G,
    F,
    C,
    Percussion,
    Tab,
}

/// Key signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySig {
    /// Number of sharps (positive) or flats (negative)
    pub fifths: i8,
    /// Mode (e.g. "major", "minor"), when declared
    pub mode: Option<String>,
}

/// Time signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterSig {
    /// Numerator (e.g. 3 in 3/4)
    pub count: u32,
    /// Denominator (e.g. 4 in 3/4)
    pub unit: u32,
    /// Symbolic rendering (common/cut time), when declared
    pub symbol: Option<MeterSymbol>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeterSymbol {
    Common,
    Cut,
}

impl MeterSig {
    pub fn new(count: u32, unit: u32) -> Self {
        Self {
            count,
            unit,
            symbol: None,
        }
    }

    /// Length of one bar of this meter, in quarter notes.
    pub fn bar_length(&self) -> Ql {
        ql(4 * self.count as i64, self.unit as i64)
    }
}

// ─── Events ──────────────────────────────────────────────────────────

/// A single durational event in a voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Identifier unique within the converted score
    pub id: EventId,
    pub kind: EventKind,
    /// Offset from the start of the enclosing measure, in quarter notes
    pub offset: Ql,
    pub duration: DurationInfo,
    pub tie: Option<Tie>,
    pub articulations: Vec<Articulation>,
    pub expressions: Vec<Expression>,
    /// Beam descriptor, one entry per beam level
    pub beams: Vec<Beam>,
    pub tuplet: Option<TupletInfo>,
    pub lyrics: Vec<Lyric>,
    /// Grace note: takes no time from the measure
    pub grace: bool,
    /// Slashed (acciaccatura-style) grace note
    pub grace_slash: bool,
    pub visual: Visual,

    /// Deferred tuplet-membership search marker; consumed by the import
    /// engine before the score is returned.
    #[serde(skip)]
    pub(crate) tuplet_search: Option<crate::durations::TupletSearch>,
    /// Marks a full-measure rest whose duration is a placeholder until
    /// the real bar length is known.
    #[serde(skip)]
    pub(crate) placeholder_full_rest: bool,
    /// Secondary-beam break: beams above this count end here and resume
    /// on the next event. Consumed by the beam grouping engine.
    #[serde(skip)]
    pub(crate) breaksec: Option<u8>,
}

/// What an event is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    Note(Pitch),
    Chord(Vec<Pitch>),
    Rest {
        /// Whole-measure rest
        measure_rest: bool,
        /// Non-printing placeholder rest
        hidden: bool,
    },
    /// Zero-duration placeholder synthesized as a spanner anchor when no
    /// real event coincides with a range boundary.
    Anchor,
}

impl Event {
    pub fn note(id: EventId, pitch: Pitch, duration: DurationInfo) -> Self {
        Self::with_kind(id, EventKind::Note(pitch), duration)
    }

    pub fn chord(id: EventId, pitches: Vec<Pitch>, duration: DurationInfo) -> Self {
        Self::with_kind(id, EventKind::Chord(pitches), duration)
    }

    pub fn rest(id: EventId, duration: DurationInfo) -> Self {
        Self::with_kind(
            id,
            EventKind::Rest {
                measure_rest: false,
                hidden: false,
            },
            duration,
        )
    }

    pub fn anchor(id: EventId) -> Self {
        Self::with_kind(id, EventKind::Anchor, DurationInfo::zero())
    }

    fn with_kind(id: EventId, kind: EventKind, duration: DurationInfo) -> Self {
        Self {
            id,
            kind,
            offset: Ql::zero(),
            duration,
            tie: None,
            articulations: Vec::new(),
            expressions: Vec::new(),
            beams: Vec::new(),
            tuplet: None,
            lyrics: Vec::new(),
            grace: false,
            grace_slash: false,
            visual: Visual::default(),
            tuplet_search: None,
            placeholder_full_rest: false,
            breaksec: None,
        }
    }

    /// True for notes and chords.
    pub fn is_pitched(&self) -> bool {
        matches!(self.kind, EventKind::Note(_) | EventKind::Chord(_))
    }

    /// True for anything that occupies time: notes, chords, rests.
    pub fn is_durational(&self) -> bool {
        !matches!(self.kind, EventKind::Anchor)
    }

    /// The time this event occupies in its voice. Grace notes and
    /// anchors take none.
    pub fn time_length(&self) -> Ql {
        if self.grace || matches!(self.kind, EventKind::Anchor) {
            Ql::zero()
        } else {
            self.duration.ql
        }
    }
}

/// Resolved duration of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationInfo {
    /// Effective notated length in quarter notes, dots and tuplet ratio
    /// applied
    pub ql: Ql,
    /// Undotted notated base value (drives beam counts)
    pub base: Ql,
    /// Number of augmentation dots
    pub dots: u32,
    /// Distinct performed length, when the document declares one
    pub gestural: Option<Ql>,
}

impl DurationInfo {
    pub fn zero() -> Self {
        Self {
            ql: Ql::zero(),
            base: Ql::zero(),
            dots: 0,
            gestural: None,
        }
    }
}

/// Pitch of a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pitch {
    /// Diatonic step letter
    pub step: Step,
    /// Octave number (middle C = C4)
    pub octave: i32,
    /// Alteration, when one applies to this note
    pub accidental: Option<Accidental>,
}

impl Pitch {
    pub fn new(step: Step, octave: i32) -> Self {
        Self {
            step,
            octave,
            accidental: None,
        }
    }

    /// Chromatic alteration in semitones (0.0 when no accidental).
    pub fn alter(&self) -> f64 {
        self.accidental.map(|a| a.alter).unwrap_or(0.0)
    }

    /// Index into a 7-steps-by-10-octaves table: step class + 7 × octave.
    pub fn diatonic_index(&self) -> usize {
        let octave = self.octave.clamp(0, 9) as usize;
        self.step.class() + 7 * octave
    }

    /// MIDI note number; middle C (C4) = 60. Quarter-tone alterations
    /// round toward the nearest semitone.
    pub fn to_midi(&self) -> i32 {
        (self.octave + 1) * 12 + self.step.semitones() + self.alter().round() as i32
    }
}

/// Diatonic step letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    C,
    D,
    E,
    F,
    G,
    A,
    B,
}

impl Step {
    /// Step class 0..7, C = 0.
    pub fn class(self) -> usize {
        match self {
            Step::C => 0,
            Step::D => 1,
            Step::E => 2,
            Step::F => 3,
            Step::G => 4,
            Step::A => 5,
            Step::B => 6,
        }
    }

    pub fn semitones(self) -> i32 {
        match self {
            Step::C => 0,
            Step::D => 2,
            Step::E => 4,
            Step::F => 5,
            Step::G => 7,
            Step::A => 9,
            Step::B => 11,
        }
    }

    /// The step `n` diatonic degrees above (or below, negative) this
    /// one, with the octave carry.
    pub fn transpose(self, n: i32) -> (Step, i32) {
        const STEPS: [Step; 7] = [
            Step::C,
            Step::D,
            Step::E,
            Step::F,
            Step::G,
            Step::A,
            Step::B,
        ];
        let idx = self.class() as i32 + n;
        let carry = idx.div_euclid(7);
        (STEPS[idx.rem_euclid(7) as usize], carry)
    }
}

/// An alteration attached to a pitch. Quarter-tone values use
/// half-integer semitone counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Accidental {
    /// Semitones up (positive) or down (negative)
    pub alter: f64,
    /// Whether the accidental is printed (written accidentals are,
    /// key-implied gestural ones are not)
    pub visible: bool,
}

impl Accidental {
    pub fn written(alter: f64) -> Self {
        Self {
            alter,
            visible: true,
        }
    }

    pub fn gestural(alter: f64) -> Self {
        Self {
            alter,
            visible: false,
        }
    }
}

/// Tie state of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tie {
    Start,
    Stop,
    /// Ends one tie and starts another
    Continue,
}

/// Articulation marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Articulation {
    Accent,
    Staccato,
    Tenuto,
    Staccatissimo,
    Marcato,
    Spiccato,
    Doit,
    Plop,
    Falloff,
    DownBow,
    UpBow,
    Harmonic,
    SnapPizzicato,
    Stopped,
    Open,
    DoubleTongue,
    TripleTongue,
    OrganToe,
    OrganHeel,
}

/// Ornaments and other event-attached expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Fermata {
        shape: FermataShape,
        place: Place,
    },
    Trill {
        /// Auxiliary (upper-neighbor) pitch, when it could be resolved
        aux: Option<Pitch>,
    },
    Mordent {
        form: MordentForm,
        aux: Option<Pitch>,
    },
    Turn {
        form: TurnForm,
        /// Sounds after the anchor note instead of on it
        delayed: bool,
        upper: Option<Pitch>,
        lower: Option<Pitch>,
    },
    /// Rolled-chord mark on a single event
    Arpeggio {
        style: ArpeggioStyle,
    },
    /// Unmeasured/measured tremolo strokes on a single event
    Tremolo {
        strokes: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FermataShape {
    Curved,
    Square,
    Angular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MordentForm {
    Upper,
    Lower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnForm {
    Normal,
    Inverted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArpeggioStyle {
    Normal,
    Up,
    Down,
    NonArpeggio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Place {
    Above,
    Below,
}

/// One beam level on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beam {
    /// Beam level (1 = eighth-note beam, 2 = sixteenth-note beam, ...)
    pub number: u8,
    pub kind: BeamKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeamKind {
    Start,
    Continue,
    Stop,
    /// Partial beam pointing at the following event
    ForwardHook,
    /// Partial beam pointing at the preceding event
    BackwardHook,
}

/// Tuplet membership of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupletInfo {
    /// Notes sounding in the time of `numbase`
    pub num: u32,
    pub numbase: u32,
    /// Bracket position within the run, when this event is an endpoint
    pub position: Option<TupletPosition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TupletPosition {
    Start,
    Stop,
    /// A single-member run is both endpoints at once
    StartStop,
}

/// A lyric syllable attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lyric {
    /// Verse number
    pub number: u32,
    pub text: String,
    pub syllabic: Option<Syllabic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Syllabic {
    Begin,
    Middle,
    End,
}

/// Visual properties of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visual {
    pub stem_direction: Option<StemDirection>,
    /// Stem length in staff-space units
    pub stem_length: Option<f64>,
    pub stem_visible: bool,
    pub notehead: Option<NoteheadShape>,
    /// Color token, kept verbatim from the document
    pub color: Option<String>,
    /// Cue-sized notation
    pub cue_size: bool,
}

impl Default for Visual {
    fn default() -> Self {
        Self {
            stem_direction: None,
            stem_length: None,
            stem_visible: true,
            notehead: None,
            color: None,
            cue_size: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StemDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteheadShape {
    Diamond,
    X,
    Slash,
    Square,
    Plus,
}

// ─── Barlines ────────────────────────────────────────────────────────

/// A barline, possibly carrying a repeat sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barline {
    pub style: BarStyle,
    pub repeat: Option<RepeatDirection>,
    /// A fermata resolved onto this barline rather than onto an event
    pub fermata: bool,
}

impl Barline {
    pub fn plain(style: BarStyle) -> Self {
        Self {
            style,
            repeat: None,
            fermata: false,
        }
    }

    pub fn repeat(direction: RepeatDirection) -> Self {
        Self {
            style: BarStyle::Final,
            repeat: Some(direction),
            fermata: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarStyle {
    Regular,
    Dashed,
    Dotted,
    Double,
    Final,
    Invisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatDirection {
    Forward,
    Backward,
}

// ─── Floating expressions ────────────────────────────────────────────

/// A floating expression positioned by beat rather than by structure,
/// resolved by the measure assembler onto the nearest matching event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Direction {
    /// Offset from the start of the measure, in quarter notes
    pub offset: Ql,
    /// Staff label this direction belongs to
    pub staff: String,
    pub kind: DirectionKind,
    /// Event this direction resolved onto, when one coincides
    pub target: Option<EventId>,
    pub placement: Option<Place>,
    /// The owning staff, when this instance is only a presentation
    /// mirror of a direction spanning several staves
    pub mirror_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DirectionKind {
    /// Dynamic mark (e.g. "p", "ff")
    Dynamic(String),
    /// Textual directive
    Words(String),
    /// Tempo indication
    Tempo {
        text: Option<String>,
        bpm: Option<f64>,
    },
}

// ─── Spanners ────────────────────────────────────────────────────────

/// An annotation linking two or more events regardless of their
/// structural position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spanner {
    /// Local identifier, unique within one conversion
    pub id: String,
    pub kind: SpannerKind,
    /// Ordered spanned events; a fully resolved spanner has at least one
    pub events: Vec<EventId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpannerKind {
    Slur,
    /// Run of tied events
    TieRun,
    /// Beamed run declared by range rather than nesting
    BeamRun,
    /// Tuplet run declared by range rather than nesting
    TupletRun,
    OctaveShift {
        /// Displacement in octaves, negative = down
        octaves: i8,
    },
    TrillExtension,
    ArpeggioGroup {
        style: ArpeggioStyle,
    },
    /// Crescendo/diminuendo wedge
    Wedge {
        crescendo: bool,
    },
    /// The two halves of a fingered tremolo
    TremoloPair {
        strokes: u8,
    },
    /// Volta bracket over an ending's measures
    RepeatBracket {
        number: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_midi_and_index() {
        let c4 = Pitch::new(Step::C, 4);
        assert_eq!(c4.to_midi(), 60);
        assert_eq!(c4.diatonic_index(), 7 * 4);

        let mut fs5 = Pitch::new(Step::F, 5);
        fs5.accidental = Some(Accidental::written(1.0));
        assert_eq!(fs5.to_midi(), 78);
        assert_eq!(fs5.diatonic_index(), 3 + 7 * 5);
    }

    #[test]
    fn step_transpose_carries_octave() {
        assert_eq!(Step::B.transpose(1), (Step::C, 1));
        assert_eq!(Step::C.transpose(-1), (Step::B, -1));
        assert_eq!(Step::D.transpose(1), (Step::E, 0));
    }

    #[test]
    fn meter_bar_length() {
        assert_eq!(MeterSig::new(4, 4).bar_length(), ql(4, 1));
        assert_eq!(MeterSig::new(3, 4).bar_length(), ql(3, 1));
        assert_eq!(MeterSig::new(6, 8).bar_length(), ql(3, 1));
    }

    #[test]
    fn grace_takes_no_time() {
        let mut e = Event::note(
            1,
            Pitch::new(Step::G, 4),
            DurationInfo {
                ql: ql(1, 2),
                base: ql(1, 2),
                dots: 0,
                gestural: None,
            },
        );
        e.grace = true;
        assert_eq!(e.time_length(), Ql::zero());
    }
}

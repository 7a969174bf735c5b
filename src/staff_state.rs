//! Per-staff harmonic context: the active key signature and the
//! alterations currently implied for each written pitch position.
//!
//! The table has one slot per diatonic step per octave (7 × 10). It is
//! reset whenever a new key is declared on the staff and updated from
//! every real note or chord as it is translated, so that an ornament's
//! unstated auxiliary pitch can consult the alteration a neighboring
//! step currently carries.

use crate::model::Pitch;

const SLOTS: usize = 70;

/// Sharp order on the circle of fifths: F C G D A E B.
const SHARP_ORDER: [usize; 7] = [3, 0, 4, 1, 5, 2, 6];
/// Flat order: B E A D G C F.
const FLAT_ORDER: [usize; 7] = [6, 2, 5, 1, 4, 0, 3];

/// Mutable per-staff state, persisted across measures within a part.
#[derive(Debug, Clone)]
pub struct StaffState {
    /// Sharps (positive) or flats (negative) of the active key
    key_fifths: i8,
    /// Implied alteration per diatonic slot (step class + 7 × octave)
    alters: [f64; SLOTS],
}

impl StaffState {
    pub fn new() -> Self {
        Self {
            key_fifths: 0,
            alters: [0.0; SLOTS],
        }
    }

    /// Declare a new key: the implied-accidental table is reset to the
    /// key's own accidentals in every octave.
    pub fn set_key(&mut self, fifths: i8) {
        self.key_fifths = fifths;
        self.alters = [0.0; SLOTS];
        let (order, alter): (&[usize], f64) = if fifths >= 0 {
            (&SHARP_ORDER, 1.0)
        } else {
            (&FLAT_ORDER, -1.0)
        };
        let count = (fifths.unsigned_abs() as usize).min(7);
        for &step_class in &order[..count] {
            for octave in 0..10 {
                self.alters[step_class + 7 * octave] = alter;
            }
        }
    }

    /// Record the alterations actually carried by sounded pitches.
    /// Called exactly once per real note/chord, after its accidental has
    /// been resolved.
    pub fn observe_pitches<'a>(&mut self, pitches: impl IntoIterator<Item = &'a Pitch>) {
        for pitch in pitches {
            self.alters[pitch.diatonic_index()] = pitch.alter();
        }
    }

    /// The alteration currently implied at a diatonic table slot.
    pub fn implied_alter(&self, diatonic_index: usize) -> f64 {
        if diatonic_index < SLOTS {
            self.alters[diatonic_index]
        } else {
            0.0
        }
    }
}

impl Default for StaffState {
    fn default() -> Self {
        Self::new()
    }
}

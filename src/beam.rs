//! Beam grouping.
//!
//! Given an ordered run of sibling events sharing one beam context,
//! assign each event its beam levels: start/continue/stop, with partial
//! hooks where a neighbor carries fewer beams. Grace and non-grace
//! events beam independently even when interleaved, and a break-section
//! marker reduces the carried beam count mid-run.

use crate::model::{Beam, BeamKind, Event, Ql, ql};

/// Number of beams an event's notated value calls for: eighth = 1,
/// sixteenth = 2, and so on. Values of a quarter note or longer take
/// none.
pub fn beam_count(event: &Event) -> u8 {
    let quarter: Ql = ql(1, 1);
    let mut value = event.duration.base;
    let mut beams = 0u8;
    while value < quarter && value > ql(0, 1) && beams < 8 {
        value *= 2;
        beams += 1;
    }
    beams
}

/// True when this event participates in beaming: a note or chord with a
/// notated value shorter than a quarter note, not already beamed by an
/// explicit nested grouping.
fn eligible(event: &Event) -> bool {
    event.is_pitched() && event.beams.is_empty() && beam_count(event) > 0
}

/// Beam a run of events together. Mixed grace/non-grace runs are split
/// into their two sub-runs, each beamed independently of the other.
pub fn beam_together(events: &mut [&mut Event]) {
    let grace: Vec<usize> = indices(events, true);
    let normal: Vec<usize> = indices(events, false);
    beam_run(events, &grace);
    beam_run(events, &normal);
}

fn indices(events: &[&mut Event], grace: bool) -> Vec<usize> {
    events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.grace == grace && eligible(e))
        .map(|(i, _)| i)
        .collect()
}

/// Beam one homogeneous sub-run, given by indices into `events`.
fn beam_run(events: &mut [&mut Event], run: &[usize]) {
    if run.is_empty() {
        return;
    }

    // first sweep: fill — start on the first eligible event, continue on
    // interior ones, and force the last one to stop
    for (pos, &i) in run.iter().enumerate() {
        let kind = if pos == 0 {
            BeamKind::Start
        } else {
            BeamKind::Continue
        };
        let count = beam_count(&events[i]);
        events[i].beams = (1..=count).map(|n| Beam { number: n, kind }).collect();
    }
    let last = *run.last().unwrap();
    for beam in &mut events[last].beams {
        beam.kind = BeamKind::Stop;
    }

    // second sweep: trailing reduction — where the following event needs
    // fewer beams, this event's excess levels stop here, or hook forward
    // if they never continued from anywhere
    for pair in run.windows(2) {
        let (cur, next) = (pair[0], pair[1]);
        let n_next = beam_count(&events[next]);
        for beam in &mut events[cur].beams {
            if beam.number > n_next {
                beam.kind = match beam.kind {
                    BeamKind::Continue => BeamKind::Stop,
                    BeamKind::Start => BeamKind::ForwardHook,
                    other => other,
                };
            }
        }
    }

    // third sweep: the mirror case at the leading edge
    for pair in run.windows(2) {
        let (prev, cur) = (pair[0], pair[1]);
        let n_prev = beam_count(&events[prev]);
        for beam in &mut events[cur].beams {
            if beam.number > n_prev {
                beam.kind = match beam.kind {
                    BeamKind::Continue => BeamKind::Start,
                    BeamKind::Stop => BeamKind::BackwardHook,
                    other => other,
                };
            }
        }
    }
}

/// Apply mid-run beam-count reductions: where an event carries a
/// break-section count, its beams above that count stop locally and the
/// following eligible event restarts them.
pub fn apply_break_sections(events: &mut [&mut Event]) {
    let beamed: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| !e.beams.is_empty())
        .map(|(i, _)| i)
        .collect();

    for (pos, &i) in beamed.iter().enumerate() {
        let Some(keep) = events[i].breaksec.take() else {
            continue;
        };
        for beam in &mut events[i].beams {
            if beam.number > keep && beam.kind == BeamKind::Continue {
                beam.kind = BeamKind::Stop;
            }
        }
        if let Some(&next) = beamed.get(pos + 1) {
            for beam in &mut events[next].beams {
                if beam.number > keep {
                    beam.kind = match beam.kind {
                        BeamKind::Continue => BeamKind::Start,
                        BeamKind::Stop => BeamKind::BackwardHook,
                        other => other,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durations::resolve_duration;
    use crate::model::{Pitch, Step};

    fn note(id: u32, dur: &str) -> Event {
        Event::note(
            id,
            Pitch::new(Step::C, 4),
            resolve_duration(Some(dur), 0, None, None),
        )
    }

    fn kinds(event: &Event) -> Vec<BeamKind> {
        event.beams.iter().map(|b| b.kind).collect()
    }

    fn beam(events: &mut [Event]) {
        let mut refs: Vec<&mut Event> = events.iter_mut().collect();
        beam_together(&mut refs);
    }

    fn break_sections(events: &mut [Event]) {
        let mut refs: Vec<&mut Event> = events.iter_mut().collect();
        apply_break_sections(&mut refs);
    }

    #[test]
    fn four_eighths_beam_start_continue_continue_stop() {
        let mut events: Vec<Event> = (1..=4).map(|i| note(i, "8")).collect();
        beam(&mut events);
        assert_eq!(kinds(&events[0]), vec![BeamKind::Start]);
        assert_eq!(kinds(&events[1]), vec![BeamKind::Continue]);
        assert_eq!(kinds(&events[2]), vec![BeamKind::Continue]);
        assert_eq!(kinds(&events[3]), vec![BeamKind::Stop]);
    }

    #[test]
    fn quarter_notes_are_not_beamed() {
        let mut events = vec![note(1, "4"), note(2, "8"), note(3, "8")];
        beam(&mut events);
        assert!(events[0].beams.is_empty());
        assert_eq!(kinds(&events[1]), vec![BeamKind::Start]);
        assert_eq!(kinds(&events[2]), vec![BeamKind::Stop]);
    }

    #[test]
    fn sixteenth_after_dotted_eighth_hooks_backward() {
        let mut events = vec![note(1, "8"), note(2, "16")];
        events[0].duration = resolve_duration(Some("8"), 1, None, None);
        beam(&mut events);
        assert_eq!(kinds(&events[0]), vec![BeamKind::Start]);
        assert_eq!(
            kinds(&events[1]),
            vec![BeamKind::Stop, BeamKind::BackwardHook]
        );
    }

    #[test]
    fn sixteenth_before_eighth_hooks_forward() {
        let mut events = vec![note(1, "16"), note(2, "8")];
        beam(&mut events);
        assert_eq!(
            kinds(&events[0]),
            vec![BeamKind::Start, BeamKind::ForwardHook]
        );
        assert_eq!(kinds(&events[1]), vec![BeamKind::Stop]);
    }

    #[test]
    fn interior_sixteenth_between_eighths() {
        let mut events = vec![note(1, "8"), note(2, "16"), note(3, "8")];
        beam(&mut events);
        assert_eq!(kinds(&events[0]), vec![BeamKind::Start]);
        assert_eq!(
            kinds(&events[1]),
            vec![BeamKind::Continue, BeamKind::BackwardHook]
        );
        assert_eq!(kinds(&events[2]), vec![BeamKind::Stop]);
    }

    #[test]
    fn grace_and_normal_runs_beam_independently() {
        let mut events = vec![note(1, "8"), note(2, "8"), note(3, "8"), note(4, "8")];
        events[1].grace = true;
        events[2].grace = true;
        beam(&mut events);
        // the two grace notes form their own two-note beam
        assert_eq!(kinds(&events[1]), vec![BeamKind::Start]);
        assert_eq!(kinds(&events[2]), vec![BeamKind::Stop]);
        // the surrounding normal notes form another
        assert_eq!(kinds(&events[0]), vec![BeamKind::Start]);
        assert_eq!(kinds(&events[3]), vec![BeamKind::Stop]);
    }

    #[test]
    fn break_section_splits_secondary_beams() {
        let mut events: Vec<Event> = (1..=4).map(|i| note(i, "16")).collect();
        events[1].breaksec = Some(1);
        beam(&mut events);
        break_sections(&mut events);
        // level 1 runs through; level 2 stops at the break and restarts
        assert_eq!(
            kinds(&events[1]),
            vec![BeamKind::Continue, BeamKind::Stop]
        );
        assert_eq!(
            kinds(&events[2]),
            vec![BeamKind::Continue, BeamKind::Start]
        );
    }

    #[test]
    fn explicit_beams_are_not_clobbered() {
        let mut events = vec![note(1, "8"), note(2, "8")];
        events[0].beams = vec![Beam {
            number: 1,
            kind: BeamKind::Stop,
        }];
        beam(&mut events);
        // pre-beamed event is skipped, the rest form their own run
        assert_eq!(kinds(&events[0]), vec![BeamKind::Stop]);
        assert_eq!(kinds(&events[1]), vec![BeamKind::Stop]);
    }
}

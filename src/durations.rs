//! Duration resolution and tuplet scaling.
//!
//! A notated duration is a base code plus a dot count, optionally with a
//! distinct gestural (performed) pair. Tuplets rescale a run of already
//! built events by a ratio; when a range was declared without an
//! enumerated member list, a deferred "search" pass scales everything
//! between the tagged endpoints instead.

use num_traits::Zero;

use crate::attributes::duration_from_attr;
use crate::model::{DurationInfo, Event, Ql, TupletInfo, TupletPosition, ql};

/// Deferred tuplet-membership marker left on an event when a range was
/// given only by name, with no member list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupletSearch {
    pub position: SearchPosition,
    pub num: u32,
    pub numbase: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPosition {
    Start,
    End,
}

/// Augment a base value with dots: each dot adds half of the remaining
/// undotted value, so `base × (2 − 2^−dots)` overall.
pub fn apply_dots(base: Ql, dots: u32) -> Ql {
    let mut total = base;
    let mut extra = base;
    for _ in 0..dots {
        extra /= 2;
        total += extra;
    }
    total
}

/// Resolve a notated duration. `dur`/`dots` give the visual value;
/// `dur_ges`/`dots_ges`, when present, yield a distinct performed
/// length. An absent or unrecognized base code resolves to the
/// placeholder value, recognizable later by the measure assembler.
pub fn resolve_duration(
    dur: Option<&str>,
    dots: u32,
    dur_ges: Option<&str>,
    dots_ges: Option<u32>,
) -> DurationInfo {
    let base = duration_from_attr(dur);
    let visual = apply_dots(base, dots);

    let gestural = match (dur_ges, dots_ges) {
        (None, None) => None,
        _ => {
            let ges_base = match dur_ges {
                Some(_) => duration_from_attr(dur_ges),
                None => base,
            };
            Some(apply_dots(ges_base, dots_ges.unwrap_or(dots)))
        }
    };

    DurationInfo {
        ql: visual,
        base,
        dots,
        gestural,
    }
}

/// Scale every durational event in `events` by `numbase/num`, recording
/// the ratio on each. The first and last durational members are marked
/// start/stop; a single-member run is both at once.
pub fn scale_by_tuplet(events: &mut [&mut Event], num: u32, numbase: u32) {
    if num == 0 || numbase == 0 {
        log::warn!("Ignoring tuplet with a zero ratio member ({num}:{numbase}).");
        return;
    }
    let ratio = ql(numbase as i64, num as i64);

    let mut first: Option<usize> = None;
    let mut last: Option<usize> = None;
    for (i, event) in events.iter_mut().enumerate() {
        if !event.is_durational() {
            continue;
        }
        event.duration.ql *= ratio;
        if let Some(ges) = event.duration.gestural.as_mut() {
            *ges *= ratio;
        }
        // an inner nested tuplet keeps its own bracket metadata
        if event.tuplet.is_none() {
            event.tuplet = Some(TupletInfo {
                num,
                numbase,
                position: None,
            });
            if first.is_none() {
                first = Some(i);
            }
            last = Some(i);
        }
    }

    match (first, last) {
        (Some(f), Some(l)) if f == l => {
            set_position(&mut *events[f], TupletPosition::StartStop);
        }
        (Some(f), Some(l)) => {
            set_position(&mut *events[f], TupletPosition::Start);
            set_position(&mut *events[l], TupletPosition::Stop);
        }
        _ => {}
    }
}

fn set_position(event: &mut Event, position: TupletPosition) {
    if let Some(info) = event.tuplet.as_mut() {
        info.position = Some(position);
    }
}

/// Finish tuplets declared by a name-only range: scale every durational
/// event from a search-start marker through the matching search-end,
/// inclusive, then clear the markers. Searches do not cross measures
/// and do not nest.
pub fn guess_tuplet_membership(events: &mut [&mut Event]) {
    let mut active: Option<(u32, u32, usize)> = None; // (num, numbase, first index)

    let mut i = 0;
    while i < events.len() {
        if !events[i].is_durational() {
            i += 1;
            continue;
        }

        if let Some(search) = events[i].tuplet_search {
            match search.position {
                SearchPosition::Start => {
                    active = Some((search.num, search.numbase, i));
                    events[i].tuplet_search = None;
                }
                SearchPosition::End if active.is_none() => {
                    log::warn!("Tuplet range end with no preceding start; ignoring.");
                    events[i].tuplet_search = None;
                }
                SearchPosition::End => {}
            }
        }

        if let Some((num, numbase, _)) = active {
            scale_single(&mut *events[i], num, numbase);

            if let Some(search) = events[i].tuplet_search {
                if search.position == SearchPosition::End {
                    events[i].tuplet_search = None;
                    if let Some((_, _, start)) = active.take() {
                        if start == i {
                            set_position(&mut *events[i], TupletPosition::StartStop);
                        } else {
                            set_position(&mut *events[start], TupletPosition::Start);
                            set_position(&mut *events[i], TupletPosition::Stop);
                        }
                    }
                }
            }
        }

        i += 1;
    }

    // an unmatched start leaves its scaled events marked as best we can
    if let Some((_, _, start)) = active {
        set_position(&mut *events[start], TupletPosition::Start);
        log::warn!("Tuplet range end never found; run left open.");
    }
}

fn scale_single(event: &mut Event, num: u32, numbase: u32) {
    if num == 0 || numbase == 0 {
        return;
    }
    let ratio = ql(numbase as i64, num as i64);
    if event.duration.ql.is_zero() {
        return;
    }
    event.duration.ql *= ratio;
    if let Some(ges) = event.duration.gestural.as_mut() {
        *ges *= ratio;
    }
    if event.tuplet.is_none() {
        event.tuplet = Some(TupletInfo {
            num,
            numbase,
            position: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Pitch, Step};

    fn eighth_note(id: u32) -> Event {
        Event::note(
            id,
            Pitch::new(Step::C, 4),
            resolve_duration(Some("8"), 0, None, None),
        )
    }

    fn scale(events: &mut [Event], num: u32, numbase: u32) {
        let mut refs: Vec<&mut Event> = events.iter_mut().collect();
        scale_by_tuplet(&mut refs, num, numbase);
    }

    fn guess(events: &mut [Event]) {
        let mut refs: Vec<&mut Event> = events.iter_mut().collect();
        guess_tuplet_membership(&mut refs);
    }

    #[test]
    fn dots_are_geometric() {
        assert_eq!(apply_dots(ql(2, 1), 0), ql(2, 1));
        assert_eq!(apply_dots(ql(2, 1), 1), ql(3, 1));
        assert_eq!(apply_dots(ql(2, 1), 2), ql(7, 2)); // 3.5
        assert_eq!(apply_dots(ql(1, 2), 1), ql(3, 4));
    }

    #[test]
    fn gestural_duration_is_independent() {
        let d = resolve_duration(Some("4"), 0, Some("2"), None);
        assert_eq!(d.ql, ql(1, 1));
        assert_eq!(d.gestural, Some(ql(2, 1)));

        let d = resolve_duration(Some("4"), 1, None, Some(0));
        assert_eq!(d.ql, ql(3, 2));
        assert_eq!(d.gestural, Some(ql(1, 1)));

        let d = resolve_duration(Some("4"), 0, None, None);
        assert_eq!(d.gestural, None);
    }

    #[test]
    fn triplet_scaling_marks_endpoints() {
        let mut events = vec![eighth_note(1), eighth_note(2), eighth_note(3)];
        scale(&mut events, 3, 2);
        for e in &events {
            assert_eq!(e.duration.ql, ql(1, 3));
        }
        assert_eq!(
            events[0].tuplet.unwrap().position,
            Some(TupletPosition::Start)
        );
        assert_eq!(events[1].tuplet.unwrap().position, None);
        assert_eq!(
            events[2].tuplet.unwrap().position,
            Some(TupletPosition::Stop)
        );
    }

    #[test]
    fn tuplet_scaling_round_trips() {
        let mut events = vec![eighth_note(1), eighth_note(2)];
        scale(&mut events, 3, 2);
        // inverse ratio restores the lengths (metadata bookkeeping aside)
        for e in &mut events {
            e.duration.ql *= ql(3, 2);
            assert_eq!(e.duration.ql, ql(1, 2));
        }
    }

    #[test]
    fn single_member_run_is_both_endpoints() {
        let mut events = vec![eighth_note(1)];
        scale(&mut events, 3, 2);
        assert_eq!(
            events[0].tuplet.unwrap().position,
            Some(TupletPosition::StartStop)
        );
    }

    #[test]
    fn search_scales_between_markers_inclusive() {
        let mut events = vec![
            eighth_note(1),
            eighth_note(2),
            eighth_note(3),
            eighth_note(4),
        ];
        events[0].tuplet_search = Some(TupletSearch {
            position: SearchPosition::Start,
            num: 3,
            numbase: 2,
        });
        events[2].tuplet_search = Some(TupletSearch {
            position: SearchPosition::End,
            num: 3,
            numbase: 2,
        });

        guess(&mut events);

        assert_eq!(events[0].duration.ql, ql(1, 3));
        assert_eq!(events[1].duration.ql, ql(1, 3));
        assert_eq!(events[2].duration.ql, ql(1, 3));
        // past the end marker nothing is touched
        assert_eq!(events[3].duration.ql, ql(1, 2));
        assert_eq!(
            events[0].tuplet.unwrap().position,
            Some(TupletPosition::Start)
        );
        assert_eq!(
            events[2].tuplet.unwrap().position,
            Some(TupletPosition::Stop)
        );
        assert!(events.iter().all(|e| e.tuplet_search.is_none()));
    }
}

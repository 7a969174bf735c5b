//! Measure assembly.
//!
//! A `<measure>` is translated staff by staff, then normalized: staves
//! the document leaves out are synthesized as full rests, full-measure
//! rests without an explicit duration are corrected to the true bar
//! length, barlines are applied (including the repeat barline that does
//! double duty as the next measure's left barline), and floating
//! timestamp-anchored expressions are resolved onto the nearest
//! matching event or barline.

use std::collections::HashMap;

use num_traits::Zero;
use roxmltree::Node;

use crate::attributes::{
    arpeggio_style_from_attrs, barline_from_attr, octave_shift_from_attrs, placeholder_duration,
    BarlineResult,
};
use crate::context::{Context, PendingSpanner};
use crate::error::{MeiError, Result};
use crate::model::{
    Barline, BarStyle, Direction, DirectionKind, DurationInfo, Event, EventId, EventKind,
    Expression, FermataShape, Measure, MeterSig, Place, Ql, SpannerKind, TurnForm, Voice,
};
use crate::preprocess::{Annotations, MEI_NS};
use crate::timestamp::{tstamp2_to_meas_skip_and_offset, tstamp_to_offset};
use crate::translate::{neighbor_pitch, staff_def_from_element, staff_from_element};

const STAFF_MUST_HAVE_N: &str = "Found a <staff> tag with no @n attribute";

/// Control-event tags resolved positionally by the measure assembler.
const CONTROL_TAGS: &[&str] = &[
    "fermata", "dynam", "dir", "tempo", "hairpin", "octave", "trill", "mordent", "turn", "arpeg",
];

/// Tags handled entirely during preprocessing.
const PREPROCESSED_TAGS: &[&str] = &["slur", "tie", "beamSpan", "tupletSpan", "annot"];

/// The result of assembling one `<measure>`: per-staff measures, plus
/// the left barline the *next* measure must take when the right barline
/// was a both-ways repeat.
pub(crate) struct MeasureResult {
    pub staves: HashMap<String, Measure>,
    pub next_left: Option<Barline>,
}

/// Assemble a `<measure>` for every expected staff.
pub(crate) fn measure_from_element(
    node: &Node,
    backup_num: i32,
    expected_ns: &[String],
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<MeasureResult> {
    let number = node
        .attribute("n")
        .and_then(|n| n.parse::<i32>().ok())
        .unwrap_or(backup_num);

    let mut staves: HashMap<String, Measure> = HashMap::new();
    let mut waiting: HashMap<String, crate::translate::StaffDefInfo> = HashMap::new();
    let mut controls: Vec<Node> = Vec::new();

    for child in node.children().filter(|c| c.is_element()) {
        let tag = match child.tag_name().namespace() {
            Some(MEI_NS) => child.tag_name().name(),
            _ => continue,
        };
        match tag {
            "staff" => {
                let n = child
                    .attribute("n")
                    .ok_or_else(|| MeiError::Attribute(STAFF_MUST_HAVE_N.to_string()))?;
                ctx.staff = n.to_string();
                let voices = staff_from_element(&child, ann, ctx)?;
                let mut measure = Measure::new(number);
                measure.voices = voices;
                staves.insert(n.to_string(), measure);
            }
            "staffDef" => match child.attribute("n") {
                Some(n) => {
                    let info = staff_def_from_element(&child)?;
                    // signature changes take effect at measure start, so
                    // they must influence translation state right away
                    if let Some(key) = &info.key {
                        ctx.staff_state(n).set_key(key.fifths);
                    }
                    if let Some(meter) = info.meter {
                        ctx.active_meter = Some(meter);
                    }
                    waiting.insert(n.to_string(), info);
                }
                None => {
                    log::warn!("Importing <staffDef> without @n is not yet supported.");
                }
            },
            t if CONTROL_TAGS.contains(&t) => {
                if !ann.is_handled(&child) {
                    controls.push(child);
                }
            }
            t if PREPROCESSED_TAGS.contains(&t) => {}
            other => {
                log::warn!("Found an unprocessed <{other}> element in a <measure>.");
            }
        }
    }

    // the longest staff content defines the bar, before any correction
    let max_len = staves
        .values()
        .flat_map(|m| m.voices.iter())
        .map(voice_length)
        .max();

    // expected staves with no content in this measure become full rests
    for n in expected_ns {
        if !staves.contains_key(n) {
            let mut rest = Event::rest(
                ctx.next_event_id(),
                DurationInfo {
                    ql: max_len.unwrap_or_else(placeholder_duration),
                    base: max_len.unwrap_or_else(placeholder_duration),
                    dots: 0,
                    gestural: None,
                },
            );
            if let EventKind::Rest { measure_rest, .. } = &mut rest.kind {
                *measure_rest = true;
            }
            rest.placeholder_full_rest = true;
            let mut voice = Voice::new("1");
            voice.events.push(rest);
            let mut measure = Measure::new(number);
            measure.voices.push(voice);
            staves.insert(n.clone(), measure);
        }
    }

    // late staff definitions land as measure attributes
    for (n, info) in waiting {
        if let Some(measure) = staves.get_mut(&n) {
            let mut attrs = measure.attributes.take().unwrap_or_default();
            attrs.clef = info.clef.or(attrs.clef);
            attrs.key = info.key.clone().or(attrs.key);
            attrs.meter = info.meter.or(attrs.meter);
            if !attrs.is_empty() {
                measure.attributes = Some(attrs);
            }
        }
    }

    // correct placeholder full-measure rests to the real bar length
    let target = correction_target(max_len, ctx);
    for measure in staves.values_mut() {
        correct_full_rest_durations(measure, target);
        measure.bar_duration = target;
    }

    // left and right barlines
    let mut next_left = None;
    if let Some(left) = node.attribute("left") {
        let barline = match barline_from_attr(Some(left)) {
            BarlineResult::Single(b) => b,
            BarlineResult::Both(_, start) => start,
        };
        for measure in staves.values_mut() {
            measure.left_barline = Some(barline.clone());
        }
    }
    if let Some(right) = node.attribute("right") {
        let barline = match barline_from_attr(Some(right)) {
            BarlineResult::Single(b) => b,
            BarlineResult::Both(end, start) => {
                next_left = Some(start);
                end
            }
        };
        for measure in staves.values_mut() {
            measure.right_barline = Some(barline.clone());
        }
    }

    // floating, timestamp-anchored expressions
    for control in &controls {
        resolve_control(control, &mut staves, expected_ns, ann, ctx);
    }

    Ok(MeasureResult { staves, next_left })
}

/// Total sounding length of a voice.
fn voice_length(voice: &Voice) -> Ql {
    voice.events.iter().map(Event::time_length).sum()
}

/// The duration a placeholder full-measure rest should take: the active
/// meter's bar when every staff is a placeholder, otherwise the longest
/// real content.
fn correction_target(max_len: Option<Ql>, ctx: &Context) -> Ql {
    let placeholder = placeholder_duration();
    match max_len {
        Some(max) if max == placeholder => match ctx.active_bar_length() {
            Some(bar) if bar != max => bar,
            _ => max,
        },
        Some(max) => max,
        None => ctx.active_bar_length().unwrap_or(placeholder),
    }
}

/// Set every placeholder full rest to `target`, shifting whatever
/// follows it in the same voice by the same delta.
fn correct_full_rest_durations(measure: &mut Measure, target: Ql) {
    for voice in &mut measure.voices {
        let mut shift = Ql::zero();
        let mut corrections: Vec<(Ql, Ql)> = Vec::new();
        for event in &mut voice.events {
            event.offset += shift;
            if event.placeholder_full_rest {
                let delta = target - event.duration.ql;
                corrections.push((event.offset, delta));
                event.duration.ql = target;
                event.duration.base = target;
                event.placeholder_full_rest = false;
                shift += delta;
            }
        }
        for (at, delta) in corrections {
            for (pos, _) in &mut voice.inserts {
                if *pos > at {
                    *pos += delta;
                }
            }
        }
    }
}

// ─── Floating expression resolution ──────────────────────────────────

fn find_event_at(measure: &Measure, offset: Ql) -> Option<EventId> {
    for voice in &measure.voices {
        for event in &voice.events {
            if !event.grace && event.is_durational() && event.offset == offset {
                return Some(event.id);
            }
        }
    }
    None
}

/// The nearest event strictly before `offset`, for delayed ornaments.
fn find_preceding(measure: &Measure, offset: Ql) -> Option<EventId> {
    let mut best: Option<(Ql, EventId)> = None;
    for voice in &measure.voices {
        for event in &voice.events {
            if !event.grace && event.is_durational() && event.offset < offset {
                if best.map(|(o, _)| event.offset > o).unwrap_or(true) {
                    best = Some((event.offset, event.id));
                }
            }
        }
    }
    best.map(|(_, id)| id)
}

fn attach_expression(measure: &mut Measure, id: EventId, expression: Expression) {
    for voice in &mut measure.voices {
        if let Some(event) = voice.events.iter_mut().find(|e| e.id == id) {
            event.expressions.push(expression);
            return;
        }
    }
}

fn event_pitch(measure: &Measure, id: EventId) -> Option<crate::model::Pitch> {
    for voice in &measure.voices {
        if let Some(event) = voice.events.iter().find(|e| e.id == id) {
            return match &event.kind {
                EventKind::Note(p) => Some(p.clone()),
                EventKind::Chord(ps) => ps.first().cloned(),
                _ => None,
            };
        }
    }
    None
}

/// The event at `offset`, or a freshly inserted zero-duration anchor
/// when no real event coincides with the boundary.
pub(crate) fn anchor_at(measure: &mut Measure, offset: Ql, ctx: &mut Context) -> EventId {
    if let Some(id) = find_event_at(measure, offset) {
        return id;
    }
    let mut anchor = Event::anchor(ctx.next_event_id());
    anchor.offset = offset;
    let id = anchor.id;
    if let Some(voice) = measure.voices.first_mut() {
        let at = voice
            .events
            .iter()
            .position(|e| e.offset > offset)
            .unwrap_or(voice.events.len());
        voice.events.insert(at, anchor);
    } else {
        let mut voice = Voice::new("1");
        voice.events.push(anchor);
        measure.voices.push(voice);
    }
    id
}

fn staff_list_for(control: &Node, expected_ns: &[String]) -> Vec<String> {
    match control.attribute("staff") {
        Some(staff) => staff.split_whitespace().map(str::to_string).collect(),
        None => expected_ns.first().cloned().into_iter().collect(),
    }
}

fn fermata_from_attrs(control: &Node) -> Expression {
    let shape = match control.attribute("shape") {
        Some("square") => FermataShape::Square,
        Some("angular") => FermataShape::Angular,
        _ => FermataShape::Curved,
    };
    let place = if control.attribute("form") == Some("inv") {
        Place::Below
    } else {
        match control.attribute("place") {
            Some("below") => Place::Below,
            _ => Place::Above,
        }
    };
    Expression::Fermata { shape, place }
}

/// Close a range at `tstamp2`: in this measure when it carries no
/// measure prefix, otherwise queued for the score assembler.
fn close_range(
    spanner_id: &str,
    tstamp2: &str,
    staff: &str,
    meter: &MeterSig,
    measure: &mut Measure,
    ctx: &mut Context,
) {
    match tstamp2_to_meas_skip_and_offset(tstamp2, meter) {
        Some((0, offset)) => {
            let end = anchor_at(measure, offset, ctx);
            ctx.registry.add_member(spanner_id, end);
        }
        Some((skip, offset)) => ctx.pending.push(PendingSpanner {
            spanner_id: spanner_id.to_string(),
            staff: staff.to_string(),
            measures_remaining: skip,
            target_offset: offset,
        }),
        None => {}
    }
}

/// Resolve one floating control event onto the assembled staves. The
/// first listed staff owns the expression; any further staves receive
/// presentation mirrors.
fn resolve_control(
    control: &Node,
    staves: &mut HashMap<String, Measure>,
    expected_ns: &[String],
    ann: &Annotations,
    ctx: &mut Context,
) {
    let tag = control.tag_name().name();
    let meter = ctx.active_meter.unwrap_or_else(|| MeterSig::new(4, 4));
    let staff_list = staff_list_for(control, expected_ns);
    let Some(owner) = staff_list.first().cloned() else {
        return;
    };

    // a preprocessed range element may only need its far end closed here
    if let Some(closure) = ann.closure_for(control) {
        let staff = closure.staff.clone().unwrap_or_else(|| owner.clone());
        let spanner_id = closure.spanner_id.clone();
        let tstamp2 = closure.tstamp2.clone();
        if let Some(measure) = staves.get_mut(&staff) {
            close_range(&spanner_id, &tstamp2, &staff, &meter, measure, ctx);
        }
        return;
    }

    let offset = match control.attribute("tstamp") {
        Some(tstamp) => match tstamp_to_offset(tstamp, &meter) {
            Some(offset) => offset,
            None => return,
        },
        None => match tag {
            // a directive without a beat applies from the measure start
            "dynam" | "dir" | "tempo" => Ql::zero(),
            _ => {
                log::warn!("Dropping <{tag}> without @tstamp or @startid.");
                return;
            }
        },
    };

    match tag {
        "fermata" => {
            let expression = fermata_from_attrs(control);
            for staff in &staff_list {
                let Some(measure) = staves.get_mut(staff) else {
                    continue;
                };
                if offset >= measure.bar_duration && !measure.bar_duration.is_zero() {
                    // a fermata at or past the bar's end sits on the barline
                    let barline = measure
                        .right_barline
                        .get_or_insert_with(|| Barline::plain(BarStyle::Regular));
                    barline.fermata = true;
                } else if let Some(id) = find_event_at(measure, offset) {
                    attach_expression(measure, id, expression.clone());
                } else {
                    log::warn!("No event at beat for <fermata>; dropped.");
                }
            }
        }
        "trill" => {
            let Some(measure) = staves.get_mut(&owner) else {
                return;
            };
            match find_event_at(measure, offset) {
                Some(id) => {
                    let aux = event_pitch(measure, id).map(|p| {
                        neighbor_pitch(
                            &p,
                            1,
                            control.attribute("accidupper"),
                            ctx.staff_state(&owner),
                        )
                    });
                    attach_expression(measure, id, Expression::Trill { aux });
                    if let Some(tstamp2) = control.attribute("tstamp2") {
                        let spanner_id = ctx.registry.create(SpannerKind::TrillExtension);
                        ctx.registry.add_member(&spanner_id, id);
                        close_range(&spanner_id, tstamp2, &owner, &meter, measure, ctx);
                    }
                }
                None => log::warn!("No event at beat for <trill>; dropped."),
            }
        }
        "mordent" => {
            let Some(measure) = staves.get_mut(&owner) else {
                return;
            };
            match find_event_at(measure, offset) {
                Some(id) => {
                    let form = match control.attribute("form") {
                        Some("lower") => crate::model::MordentForm::Lower,
                        _ => crate::model::MordentForm::Upper,
                    };
                    let direction = if form == crate::model::MordentForm::Lower {
                        -1
                    } else {
                        1
                    };
                    let accid = if direction > 0 {
                        control.attribute("accidupper")
                    } else {
                        control.attribute("accidlower")
                    };
                    let aux = event_pitch(measure, id)
                        .map(|p| neighbor_pitch(&p, direction, accid, ctx.staff_state(&owner)));
                    attach_expression(measure, id, Expression::Mordent { form, aux });
                }
                None => log::warn!("No event at beat for <mordent>; dropped."),
            }
        }
        "turn" => {
            let Some(measure) = staves.get_mut(&owner) else {
                return;
            };
            let delayed = control.attribute("delayed") == Some("true");
            // a delayed turn sounds between notes: it anchors on the
            // nearest preceding event instead of an exact hit
            let found = match find_event_at(measure, offset) {
                Some(id) => Some(id),
                None if delayed => find_preceding(measure, offset),
                None => None,
            };
            match found {
                Some(id) => {
                    let form = match control.attribute("form") {
                        Some("inv") | Some("inverted") => TurnForm::Inverted,
                        _ => TurnForm::Normal,
                    };
                    let base = event_pitch(measure, id);
                    let upper = base.as_ref().map(|p| {
                        neighbor_pitch(
                            p,
                            1,
                            control.attribute("accidupper"),
                            ctx.staff_state(&owner),
                        )
                    });
                    let lower = base.as_ref().map(|p| {
                        neighbor_pitch(
                            p,
                            -1,
                            control.attribute("accidlower"),
                            ctx.staff_state(&owner),
                        )
                    });
                    attach_expression(
                        measure,
                        id,
                        Expression::Turn {
                            form,
                            delayed,
                            upper,
                            lower,
                        },
                    );
                }
                None => log::warn!("No event at beat for <turn>; dropped."),
            }
        }
        "arpeg" => {
            let Some(measure) = staves.get_mut(&owner) else {
                return;
            };
            let style = arpeggio_style_from_attrs(
                control.attribute("arrow"),
                control.attribute("order"),
            );
            match find_event_at(measure, offset) {
                Some(id) => attach_expression(measure, id, Expression::Arpeggio { style }),
                None => log::warn!("No event at beat for <arpeg>; dropped."),
            }
        }
        "octave" => {
            let octaves = octave_shift_from_attrs(
                control.attribute("dis"),
                control.attribute("dis.place"),
            );
            if octaves == 0 {
                log::warn!("Dropping <octave> with unsupported @dis/@dis.place.");
                return;
            }
            let Some(measure) = staves.get_mut(&owner) else {
                return;
            };
            let spanner_id = ctx.registry.create(SpannerKind::OctaveShift { octaves });
            let start = anchor_at(measure, offset, ctx);
            ctx.registry.add_member(&spanner_id, start);
            if let Some(tstamp2) = control.attribute("tstamp2") {
                close_range(&spanner_id, tstamp2, &owner, &meter, measure, ctx);
            }
        }
        "hairpin" => {
            let crescendo = match control.attribute("form") {
                Some("cres") => true,
                Some("dim") => false,
                other => {
                    log::warn!("Unexpected value for \"form\" attribute: {other:?}, ignoring.");
                    return;
                }
            };
            let Some(measure) = staves.get_mut(&owner) else {
                return;
            };
            let spanner_id = ctx.registry.create(SpannerKind::Wedge { crescendo });
            let start = anchor_at(measure, offset, ctx);
            ctx.registry.add_member(&spanner_id, start);
            if let Some(tstamp2) = control.attribute("tstamp2") {
                close_range(&spanner_id, tstamp2, &owner, &meter, measure, ctx);
            }
        }
        "dynam" | "dir" | "tempo" => {
            let text = control.text().map(|t| t.trim().to_string());
            let kind = match tag {
                "dynam" => DirectionKind::Dynamic(text.unwrap_or_default()),
                "dir" => DirectionKind::Words(text.unwrap_or_default()),
                _ => DirectionKind::Tempo {
                    text,
                    bpm: control.attribute("mm").and_then(|v| v.parse().ok()),
                },
            };
            let placement = match control.attribute("place") {
                Some("below") => Some(Place::Below),
                Some("above") => Some(Place::Above),
                _ => None,
            };
            for (i, staff) in staff_list.iter().enumerate() {
                let Some(measure) = staves.get_mut(staff) else {
                    continue;
                };
                let target = find_event_at(measure, offset);
                measure.directions.push(Direction {
                    offset,
                    staff: staff.clone(),
                    kind: kind.clone(),
                    target,
                    placement,
                    mirror_of: (i > 0).then(|| owner.clone()),
                });
            }
        }
        _ => {}
    }
}

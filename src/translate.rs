//! Element translation — the tag-dispatched core of the conversion.
//!
//! Each handler consumes one MEI element (plus the preprocessor's
//! annotations and the shared conversion context) and produces model
//! objects. Containers dispatch over their children through an explicit
//! per-context table, since the legal child set differs between a layer,
//! a beam, a tuplet, and a tremolo.

use std::collections::HashMap;

use roxmltree::Node;

use crate::attributes::{
    accid_ges_from_attr, accidental_from_attr, articulation_list_from_attr, barline_from_attr,
    notehead_from_attr, octave_shift_from_attrs, sharps_from_attr, stem_direction_from_attr,
    BarlineResult,
};
use crate::beam::{apply_break_sections, beam_count, beam_together};
use crate::context::Context;
use crate::durations::{
    guess_tuplet_membership, resolve_duration, scale_by_tuplet, SearchPosition, TupletSearch,
};
use crate::error::{MeiError, Result};
use crate::model::{
    Accidental, ArpeggioStyle, Beam, BeamKind, Clef, ClefShape, Event, EventKind, Expression,
    FermataShape, KeySig, Lyric, MeterSig, MeterSymbol, MordentForm, Pitch, Place, SpannerKind,
    StaffItem, Step, Syllabic, Tie, Transposition, TupletInfo, TupletPosition, TurnForm, Voice,
};
use crate::preprocess::{self as pp, Annotations, MEI_NS};
use crate::staff_state::StaffState;

const MISSING_TUPLET_DATA: &str = "Both @num and @numbase attributes are required on <tuplet> tags.";
const MISSING_VOICE_ID: &str = "Found a <layer> without @n attribute and no override.";

/// Which container is dispatching. The legal child set differs per
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Container {
    Layer,
    Beam,
    Tuplet,
    /// `<bTrem>` / `<fTrem>` wrap only notes and chords
    Tremolo,
}

/// One translated item inside a layer-like container.
#[derive(Debug)]
pub(crate) enum LayerItem {
    Event(Event),
    Item(StaffItem),
}

// ─── Small helpers ───────────────────────────────────────────────────

fn mei_tag<'a>(node: &Node<'a, '_>) -> Option<&'a str> {
    if node.tag_name().namespace() == Some(MEI_NS) {
        Some(node.tag_name().name())
    } else {
        None
    }
}

fn parse_u32(node: &Node, name: &str) -> Option<u32> {
    node.attribute(name).and_then(|v| v.trim().parse().ok())
}

fn parse_i32(node: &Node, name: &str) -> Option<i32> {
    node.attribute(name).and_then(|v| v.trim().parse().ok())
}

fn step_from_pname(pname: Option<&str>) -> Step {
    match pname {
        Some("c") | Some("C") => Step::C,
        Some("d") | Some("D") => Step::D,
        Some("e") | Some("E") => Step::E,
        Some("f") | Some("F") => Step::F,
        Some("g") | Some("G") => Step::G,
        Some("a") | Some("A") => Step::A,
        Some("b") | Some("B") => Step::B,
        Some(other) => {
            log::warn!("Unexpected value for \"pname\" attribute: {other}, ignoring.");
            Step::C
        }
        None => Step::C,
    }
}

/// Expand editorial wrappers into the children a handler should see.
/// Alternative-reading wrappers choose one child deterministically;
/// transparent wrappers pass everything through; deletions vanish.
/// The choice is fixed per tag, not configurable.
fn expand_editorial<'a, 'd>(parent: &Node<'a, 'd>, out: &mut Vec<Node<'a, 'd>>) {
    for child in parent.children().filter(|c| c.is_element()) {
        let Some(tag) = mei_tag(&child) else {
            out.push(child);
            continue;
        };
        match tag {
            "app" => {
                let chosen = child
                    .children()
                    .find(|c| c.has_tag_name((MEI_NS, "lem")))
                    .or_else(|| {
                        child
                            .children()
                            .find(|c| c.has_tag_name((MEI_NS, "rdg")))
                    });
                if let Some(reading) = chosen {
                    expand_editorial(&reading, out);
                }
            }
            "choice" => {
                let chosen = child
                    .children()
                    .find(|c| c.has_tag_name((MEI_NS, "corr")))
                    .or_else(|| {
                        child
                            .children()
                            .find(|c| c.has_tag_name((MEI_NS, "reg")))
                    })
                    .or_else(|| child.children().find(|c| c.is_element()));
                if let Some(reading) = chosen {
                    expand_editorial(&reading, out);
                }
            }
            "subst" => {
                if let Some(first) = child.children().find(|c| c.is_element()) {
                    expand_editorial(&first, out);
                }
            }
            "supplied" | "add" | "corr" | "reg" | "unclear" | "sic" | "orig" | "expan" => {
                expand_editorial(&child, out);
            }
            "del" => {}
            _ => out.push(child),
        }
    }
}

fn element_children<'a, 'd>(parent: &Node<'a, 'd>) -> Vec<Node<'a, 'd>> {
    let mut out = Vec::new();
    expand_editorial(parent, &mut out);
    out
}

// Child tags that are handled elsewhere and never warrant an
// "unprocessed" warning.
const IGNORED_CHILDREN: &[&str] = &[
    "annot", "slur", "tie", "tupletSpan", "beamSpan", "verse", "syl", "dot", "artic", "accid",
];

// ─── Container dispatch ──────────────────────────────────────────────

fn allowed_in(container: Container, tag: &str) -> bool {
    match container {
        Container::Layer => matches!(
            tag,
            "clef"
                | "chord"
                | "note"
                | "rest"
                | "mRest"
                | "beam"
                | "tuplet"
                | "space"
                | "mSpace"
                | "barLine"
                | "meterSig"
                | "keySig"
                | "bTrem"
                | "fTrem"
        ),
        Container::Beam | Container::Tuplet => matches!(
            tag,
            "clef"
                | "chord"
                | "note"
                | "rest"
                | "beam"
                | "tuplet"
                | "space"
                | "barLine"
                | "bTrem"
                | "fTrem"
        ),
        Container::Tremolo => matches!(tag, "note" | "chord"),
    }
}

/// Translate the children of a container element, in document order.
pub(crate) fn dispatch_children(
    parent: &Node,
    container: Container,
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<Vec<LayerItem>> {
    let mut items: Vec<LayerItem> = Vec::new();

    for child in element_children(parent) {
        let Some(tag) = mei_tag(&child) else {
            continue;
        };
        if !allowed_in(container, tag) {
            if !IGNORED_CHILDREN.contains(&tag) {
                log::warn!(
                    "Found an unprocessed <{tag}> element in a <{}>.",
                    parent.tag_name().name()
                );
            }
            continue;
        }
        match tag {
            "note" => {
                let event = note_from_element(&child, ann, ctx)?;
                observe_event(&event, ctx);
                items.push(LayerItem::Event(event));
            }
            "chord" => {
                let event = chord_from_element(&child, ann, ctx)?;
                items.push(LayerItem::Event(event));
            }
            "rest" => items.push(LayerItem::Event(rest_from_element(&child, ann, ctx))),
            "mRest" => items.push(LayerItem::Event(mrest_from_element(&child, ann, ctx))),
            "space" => items.push(LayerItem::Event(space_from_element(&child, ctx))),
            "mSpace" => items.push(LayerItem::Event(mspace_from_element(&child, ctx))),
            "beam" => items.extend(beam_from_element(&child, ann, ctx)?),
            "tuplet" => items.extend(tuplet_from_element(&child, ann, ctx)?),
            "bTrem" => {
                let event = btrem_from_element(&child, ann, ctx)?;
                items.push(LayerItem::Event(event));
            }
            "fTrem" => items.extend(
                ftrem_from_element(&child, ann, ctx)?
                    .into_iter()
                    .map(LayerItem::Event),
            ),
            "clef" => items.push(LayerItem::Item(StaffItem::Clef(clef_from_element(&child)))),
            "keySig" => {
                let key = key_sig_from_element(&child);
                // a mid-layer key change retunes the staff immediately
                let staff = ctx.staff.clone();
                ctx.staff_state(&staff).set_key(key.fifths);
                items.push(LayerItem::Item(StaffItem::Key(key)));
            }
            "meterSig" => {
                let meter = time_sig_from_element(&child)?;
                ctx.active_meter = Some(meter);
                items.push(LayerItem::Item(StaffItem::Meter(meter)));
            }
            "barLine" => {
                let result = barline_from_attr(child.attribute("rend"));
                let barline = match result {
                    BarlineResult::Single(b) => b,
                    BarlineResult::Both(end, _) => end,
                };
                items.push(LayerItem::Item(StaffItem::Barline(barline)));
            }
            _ => unreachable!("allowed_in covers every dispatched tag"),
        }
    }

    Ok(items)
}

fn observe_event(event: &Event, ctx: &mut Context) {
    let staff = ctx.staff.clone();
    match &event.kind {
        EventKind::Note(pitch) => ctx.staff_state(&staff).observe_pitches([pitch]),
        EventKind::Chord(pitches) => ctx.staff_state(&staff).observe_pitches(pitches.iter()),
        _ => {}
    }
}

// ─── Signatures ──────────────────────────────────────────────────────

/// Build a clef from `@shape`, `@line`, `@dis`, and `@dis.place`. The
/// `GG` shape is a treble clef sounding an octave lower.
pub(crate) fn clef_from_element(node: &Node) -> Clef {
    clef_from_parts(
        node.attribute("shape"),
        node.attribute("line"),
        node.attribute("dis"),
        node.attribute("dis.place"),
    )
}

pub(crate) fn clef_from_parts(
    shape: Option<&str>,
    line: Option<&str>,
    dis: Option<&str>,
    dis_place: Option<&str>,
) -> Clef {
    let shape_str = shape.unwrap_or("G");
    let line = line.and_then(|l| l.parse().ok());
    match shape_str {
        "perc" => Clef {
            shape: ClefShape::Percussion,
            line: None,
            octave_shift: 0,
        },
        "TAB" => Clef {
            shape: ClefShape::Tab,
            line: None,
            octave_shift: 0,
        },
        _ => {
            let (shape, extra_shift) = match shape_str {
                "G" => (ClefShape::G, 0),
                "GG" => (ClefShape::G, -1),
                "F" => (ClefShape::F, 0),
                "C" => (ClefShape::C, 0),
                other => {
                    log::warn!("Unexpected value for \"shape\" attribute: {other}, ignoring.");
                    (ClefShape::G, 0)
                }
            };
            let shift = if extra_shift != 0 {
                extra_shift
            } else {
                octave_shift_from_attrs(dis, dis_place)
            };
            let default_line = match shape {
                ClefShape::G => 2,
                ClefShape::F => 4,
                ClefShape::C => 3,
                _ => 2,
            };
            Clef {
                shape,
                line: Some(line.unwrap_or(default_line)),
                octave_shift: shift,
            }
        }
    }
}

/// Circle-of-fifths position of a tonic step in major.
fn fifths_of_step(step: Step) -> i32 {
    match step {
        Step::C => 0,
        Step::G => 1,
        Step::D => 2,
        Step::A => 3,
        Step::E => 4,
        Step::B => 5,
        Step::F => -1,
    }
}

/// Build a key signature from a prefixed attribute family: either a
/// tonic (`pname`/`accid`/`mode`) or a signature count (`sig`).
pub(crate) fn key_sig_from_attrs(node: &Node, prefix: &str) -> Option<KeySig> {
    let attr = |name: &str| {
        let full = format!("{prefix}{name}");
        node.attribute(full.as_str())
    };

    if let Some(pname) = attr("pname") {
        let step = step_from_pname(Some(pname));
        let alter = accidental_from_attr(attr("accid")).unwrap_or(0.0) as i32;
        let mode = attr("mode").map(str::to_string);
        let mut fifths = fifths_of_step(step) + 7 * alter;
        if mode.as_deref() == Some("minor") {
            fifths -= 3;
        }
        return Some(KeySig {
            fifths: fifths.clamp(-7, 7) as i8,
            mode,
        });
    }

    attr("sig").map(|sig| KeySig {
        fifths: sharps_from_attr(Some(sig)),
        mode: attr("mode").map(str::to_string),
    })
}

pub(crate) fn key_sig_from_element(node: &Node) -> KeySig {
    key_sig_from_attrs(node, "").unwrap_or(KeySig {
        fifths: 0,
        mode: None,
    })
}

/// Build a time signature from a prefixed attribute family
/// (`count`/`unit`/`sym`).
pub(crate) fn time_sig_from_attrs(node: &Node, prefix: &str) -> Result<MeterSig> {
    let attr = |name: &str| {
        let full = format!("{prefix}{name}");
        node.attribute(full.as_str())
    };

    let count = attr("count").and_then(|v| v.parse::<u32>().ok());
    let unit = attr("unit").and_then(|v| v.parse::<u32>().ok());
    match attr("sym") {
        Some("cut") if count.unwrap_or(2) == 2 && unit.unwrap_or(2) == 2 => {
            return Ok(MeterSig {
                count: 2,
                unit: 2,
                symbol: Some(MeterSymbol::Cut),
            });
        }
        Some("common") if count.unwrap_or(4) == 4 && unit.unwrap_or(4) == 4 => {
            return Ok(MeterSig {
                count: 4,
                unit: 4,
                symbol: Some(MeterSymbol::Common),
            });
        }
        _ => {}
    }
    match (count, unit) {
        (Some(count), Some(unit)) if unit > 0 => Ok(MeterSig {
            count,
            unit,
            symbol: None,
        }),
        _ => Err(MeiError::Element(
            "Could not parse time signature attributes".to_string(),
        )),
    }
}

pub(crate) fn time_sig_from_element(node: &Node) -> Result<MeterSig> {
    time_sig_from_attrs(node, "")
}

// ─── Lyrics ──────────────────────────────────────────────────────────

/// One lyric syllable, with its word-position connector composed into
/// the text.
pub(crate) fn syl_from_element(node: &Node) -> Lyric {
    let con = match node.attribute("con") {
        Some("s") => ' ',
        Some("t") => '~',
        Some("u") => '_',
        _ => '-',
    };
    let raw = node.text().unwrap_or("").trim();
    let (text, syllabic) = match node.attribute("wordpos") {
        Some("i") => (format!("{raw}{con}"), Some(Syllabic::Begin)),
        Some("m") => (format!("{con}{raw}{con}"), Some(Syllabic::Middle)),
        Some("t") => (format!("{con}{raw}"), Some(Syllabic::End)),
        _ => (raw.to_string(), None),
    };
    Lyric {
        number: 1,
        text,
        syllabic,
    }
}

/// A lyric verse: its `<syl>` children, numbered from `@n` with a
/// positional fallback.
pub(crate) fn verse_from_element(node: &Node, backup_n: u32) -> Vec<Lyric> {
    let number = match node.attribute("n") {
        Some(n) => match n.parse() {
            Ok(n) => n,
            Err(_) => {
                log::warn!("Verse number must be an int (got \"{n}\")");
                backup_n
            }
        },
        None => backup_n,
    };
    node.children()
        .filter(|c| c.has_tag_name((MEI_NS, "syl")))
        .map(|syl| {
            let mut lyric = syl_from_element(&syl);
            lyric.number = number;
            lyric
        })
        .collect()
}

fn lyrics_from_children(node: &Node) -> Vec<Lyric> {
    let mut lyrics: Vec<Lyric> = Vec::new();
    let mut verse_count = 0;
    for child in node.children().filter(|c| c.is_element()) {
        match mei_tag(&child) {
            Some("verse") => {
                verse_count += 1;
                lyrics.extend(verse_from_element(&child, verse_count));
            }
            _ => {}
        }
    }
    if lyrics.is_empty() {
        // bare <syl> children, only honored when no <verse> is present
        for child in node.children().filter(|c| c.has_tag_name((MEI_NS, "syl"))) {
            lyrics.push(syl_from_element(&child));
        }
    }
    lyrics
}

// ─── Events ──────────────────────────────────────────────────────────

fn tie_from_letters(letters: &str) -> Tie {
    if letters.contains('m') || (letters.contains('i') && letters.contains('t')) {
        Tie::Continue
    } else if letters.contains('i') {
        Tie::Start
    } else {
        Tie::Stop
    }
}

fn duration_from_node(node: &Node, extra_dots: u32) -> crate::model::DurationInfo {
    let dots = if extra_dots > 0 {
        extra_dots
    } else {
        parse_u32(node, "dots").unwrap_or(0)
    };
    let dots_ges = parse_u32(node, "dots.ges");
    resolve_duration(
        node.attribute("dur"),
        dots,
        node.attribute("dur.ges"),
        dots_ges,
    )
}

fn visual_from_node(node: &Node) -> crate::model::Visual {
    crate::model::Visual {
        stem_direction: stem_direction_from_attr(node.attribute("stem.dir")),
        stem_length: node.attribute("stem.len").and_then(|v| v.parse().ok()),
        stem_visible: node.attribute("stem.visible") != Some("false"),
        notehead: notehead_from_attr(node.attribute("head.shape")),
        color: node.attribute("color").map(str::to_string),
        cue_size: node.attribute("cue") == Some("true"),
    }
}

fn grace_from_node(node: &Node, event: &mut Event) {
    if node.attribute("grace").is_some() {
        event.grace = true;
        if node
            .attribute("stem.mod")
            .map(|m| m.contains("slash"))
            .unwrap_or(false)
        {
            event.grace_slash = true;
        }
    }
}

/// The auxiliary pitch of an ornament: the diatonic neighbor of the
/// anchor, altered by an explicit ornament accidental when given, or by
/// whatever the staff currently implies for that written position.
pub(crate) fn neighbor_pitch(
    base: &Pitch,
    direction: i32,
    explicit_accid: Option<&str>,
    state: &StaffState,
) -> Pitch {
    let (step, carry) = base.step.transpose(direction);
    let mut aux = Pitch::new(step, base.octave + carry);
    aux.accidental = match explicit_accid.and_then(|a| accidental_from_attr(Some(a))) {
        Some(alter) => Some(Accidental::written(alter)),
        None => {
            let implied = state.implied_alter(aux.diatonic_index());
            if implied != 0.0 {
                Some(Accidental::gestural(implied))
            } else {
                None
            }
        }
    };
    aux
}

fn parse_fermata_value(value: &str) -> Expression {
    let mut parts = value.split_whitespace();
    let shape = match parts.next() {
        Some("square") => FermataShape::Square,
        Some("angular") => FermataShape::Angular,
        _ => FermataShape::Curved,
    };
    let place = match parts.next() {
        Some("below") => Place::Below,
        _ => Place::Above,
    };
    Expression::Fermata { shape, place }
}

/// Attach everything the preprocessor recorded for this element:
/// slur/tie/beam/tuplet state, ornament annotations, and registry
/// spanner memberships.
fn apply_annotations(node: &Node, event: &mut Event, ann: &Annotations, ctx: &mut Context) {
    let staff = ctx.staff.clone();

    // slurs from preprocessed <slur> elements
    for key in [pp::SLUR_START, pp::SLUR_END] {
        if let Some(ids) = ann.get(node, key) {
            for id in ids.split_whitespace() {
                ctx.registry.add_member(id, event.id);
            }
        }
    }
    // slurs from the @slur shorthand attribute
    if let Some(slur_attr) = node.attribute("slur") {
        for token in slur_attr.split_whitespace() {
            let (kind, label) = token.split_at(1);
            match kind {
                "i" => {
                    let id = ctx.registry.create(SpannerKind::Slur);
                    ctx.slur_labels.insert(label.to_string(), id.clone());
                    ctx.registry.add_member(&id, event.id);
                }
                "t" => match ctx.slur_labels.get(label).cloned() {
                    Some(id) => ctx.registry.add_member(&id, event.id),
                    None => log::warn!("Slur \"{label}\" ends without having started; dropped."),
                },
                // medial slur letters carry no information we keep
                _ => {}
            }
        }
    }

    // ties compose: the attribute and the annotation may both be present
    let mut tie_letters = String::new();
    if let Some(t) = node.attribute("tie") {
        tie_letters.push_str(t);
    }
    if let Some(t) = ann.get(node, pp::TIE) {
        tie_letters.push_str(t);
    }
    if !tie_letters.is_empty() {
        event.tie = Some(tie_from_letters(&tie_letters));
    }

    // beams declared by a <beamSpan>
    if let Some(beam_state) = ann.get(node, pp::BEAM) {
        let kind = match beam_state {
            "start" => Some(BeamKind::Start),
            "continue" => Some(BeamKind::Continue),
            "stop" => Some(BeamKind::Stop),
            _ => None,
        };
        if let Some(kind) = kind {
            let count = beam_count(event);
            if count > 0 {
                event.beams = (1..=count).map(|n| Beam { number: n, kind }).collect();
            }
        }
    }

    // tuplets declared by a <tupletSpan>
    if let Some(position) = ann.get(node, pp::TUPLET_SEARCH) {
        let num = ann
            .get(node, pp::TUPLET_NUM)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let numbase = ann
            .get(node, pp::TUPLET_NUMBASE)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        event.tuplet_search = Some(TupletSearch {
            position: if position == "start" {
                SearchPosition::Start
            } else {
                SearchPosition::End
            },
            num,
            numbase,
        });
    } else if let (Some(num), Some(numbase)) = (
        ann.get(node, pp::TUPLET_NUM),
        ann.get(node, pp::TUPLET_NUMBASE),
    ) {
        if let (Ok(num), Ok(numbase)) = (num.parse::<u32>(), numbase.parse::<u32>()) {
            let ratio = crate::model::ql(numbase as i64, num as i64);
            event.duration.ql *= ratio;
            if let Some(ges) = event.duration.gestural.as_mut() {
                *ges *= ratio;
            }
            let position = match ann.get(node, pp::TUPLET_TYPE) {
                Some("start") => Some(TupletPosition::Start),
                Some("stop") => Some(TupletPosition::Stop),
                Some("startStop") => Some(TupletPosition::StartStop),
                _ => None,
            };
            event.tuplet = Some(TupletInfo {
                num,
                numbase,
                position,
            });
        }
    }

    // ornaments the preprocessor resolved onto this element
    if let Some(value) = ann.get(node, pp::FERMATA) {
        event.expressions.push(parse_fermata_value(value));
    }

    let base_pitch = match &event.kind {
        EventKind::Note(p) => Some(p.clone()),
        EventKind::Chord(ps) => ps.first().cloned(),
        _ => None,
    };

    if ann.get(node, pp::TRILL).is_some() {
        let aux = base_pitch.as_ref().map(|p| {
            neighbor_pitch(p, 1, ann.get(node, pp::TRILL_ACCID), ctx.staff_state(&staff))
        });
        event.expressions.push(Expression::Trill { aux });
    }
    if let Some(form) = ann.get(node, pp::MORDENT) {
        let form = if form == "lower" {
            MordentForm::Lower
        } else {
            MordentForm::Upper
        };
        let direction = if form == MordentForm::Lower { -1 } else { 1 };
        let aux = base_pitch.as_ref().map(|p| {
            neighbor_pitch(
                p,
                direction,
                ann.get(node, pp::MORDENT_ACCID),
                ctx.staff_state(&staff),
            )
        });
        event.expressions.push(Expression::Mordent { form, aux });
    }
    if let Some(form) = ann.get(node, pp::TURN) {
        let form = if form == "inverted" {
            TurnForm::Inverted
        } else {
            TurnForm::Normal
        };
        let delayed = ann.get(node, pp::TURN_DELAYED) == Some("true");
        let upper = base_pitch.as_ref().map(|p| {
            neighbor_pitch(
                p,
                1,
                ann.get(node, pp::TURN_ACCID_UPPER),
                ctx.staff_state(&staff),
            )
        });
        let lower = base_pitch.as_ref().map(|p| {
            neighbor_pitch(
                p,
                -1,
                ann.get(node, pp::TURN_ACCID_LOWER),
                ctx.staff_state(&staff),
            )
        });
        event.expressions.push(Expression::Turn {
            form,
            delayed,
            upper,
            lower,
        });
    }
    if let Some(style) = ann.get(node, pp::ARPEG) {
        let style = match style {
            "up" => ArpeggioStyle::Up,
            "down" => ArpeggioStyle::Down,
            "nonarp" => ArpeggioStyle::NonArpeggio,
            _ => ArpeggioStyle::Normal,
        };
        event.expressions.push(Expression::Arpeggio { style });
    }

    // remaining registry memberships
    for key in [
        pp::TIE_SPAN,
        pp::BEAM_SPAN,
        pp::TUPLET_SPAN,
        pp::ARPEG_SPAN,
        pp::OTTAVA_START,
        pp::OTTAVA_END,
        pp::TRILL_SPAN_START,
        pp::TRILL_SPAN_END,
    ] {
        if let Some(ids) = ann.get(node, key) {
            for id in ids.split_whitespace() {
                ctx.registry.add_member(id, event.id);
            }
        }
    }
}

/// `<note>` — a single pitched event. The caller is responsible for
/// feeding the finished pitch back into the staff state, so that a
/// chord's notes are observed together, once.
pub(crate) fn note_from_element(
    node: &Node,
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<Event> {
    // children first: dots, articulations, accidentals
    let mut dot_children = 0u32;
    let mut child_accid: Option<Accidental> = None;
    let mut child_artics = Vec::new();
    for child in node.children().filter(|c| c.is_element()) {
        match mei_tag(&child) {
            Some("dot") => dot_children += 1,
            Some("accid") => {
                // a child <accid> carries the same written/gestural split
                if let Some(alter) = accid_ges_from_attr(child.attribute("accid.ges")) {
                    child_accid = Some(Accidental::gestural(alter));
                } else if let Some(alter) = accidental_from_attr(child.attribute("accid")) {
                    child_accid = Some(Accidental::written(alter));
                }
            }
            Some("artic") => {
                if let Some(artic) = child.attribute("artic") {
                    child_artics.extend(articulation_list_from_attr(artic));
                }
            }
            Some("verse") | Some("syl") => {}
            Some(other) => {
                log::warn!("Found an unprocessed <{other}> element in a <note>.");
            }
            None => {}
        }
    }

    let mut pitch = Pitch::new(
        step_from_pname(node.attribute("pname")),
        parse_i32(node, "oct").unwrap_or(4),
    );
    // precedence: @accid.ges, then a child <accid>, then @accid
    if let Some(alter) = accid_ges_from_attr(node.attribute("accid.ges")) {
        pitch.accidental = Some(Accidental::gestural(alter));
    } else if let Some(accid) = child_accid {
        pitch.accidental = Some(accid);
    } else if let Some(alter) = accidental_from_attr(node.attribute("accid")) {
        pitch.accidental = Some(Accidental::written(alter));
    }

    let duration = duration_from_node(node, dot_children);
    let mut event = Event::note(ctx.next_event_id(), pitch, duration);

    event.articulations = child_artics;
    if let Some(artic) = node.attribute("artic") {
        event
            .articulations
            .extend(articulation_list_from_attr(artic));
    }
    grace_from_node(node, &mut event);
    event.visual = visual_from_node(node);
    event.lyrics = lyrics_from_children(node);
    event.breaksec = node.attribute("breaksec").and_then(|v| v.parse().ok());

    apply_annotations(node, &mut event, ann, ctx);

    Ok(event)
}

/// `<rest>` — a non-sounding event.
pub(crate) fn rest_from_element(node: &Node, ann: &Annotations, ctx: &mut Context) -> Event {
    let duration = duration_from_node(node, 0);
    let mut event = Event::rest(ctx.next_event_id(), duration);
    event.breaksec = node.attribute("breaksec").and_then(|v| v.parse().ok());
    apply_annotations(node, &mut event, ann, ctx);
    event
}

/// `<mRest>` — a complete-measure rest. Without `@dur` its duration is
/// a placeholder, corrected once the true bar length is known.
pub(crate) fn mrest_from_element(node: &Node, ann: &Annotations, ctx: &mut Context) -> Event {
    let mut event = rest_from_element(node, ann, ctx);
    if let EventKind::Rest { measure_rest, .. } = &mut event.kind {
        *measure_rest = true;
    }
    if node.attribute("dur").is_none() {
        event.placeholder_full_rest = true;
    }
    event
}

/// `<space>` — a non-printing placeholder filling part of a measure.
pub(crate) fn space_from_element(node: &Node, ctx: &mut Context) -> Event {
    let duration = duration_from_node(node, 0);
    let mut event = Event::rest(ctx.next_event_id(), duration);
    if let EventKind::Rest { hidden, .. } = &mut event.kind {
        *hidden = true;
    }
    event
}

/// `<mSpace>` — a whole measure of empty space.
pub(crate) fn mspace_from_element(node: &Node, ctx: &mut Context) -> Event {
    let mut event = space_from_element(node, ctx);
    if let EventKind::Rest { measure_rest, .. } = &mut event.kind {
        *measure_rest = true;
    }
    if node.attribute("dur").is_none() {
        event.placeholder_full_rest = true;
    }
    event
}

/// `<chord>` — simultaneous notes sharing one duration. Spanners that
/// attached to a contained note are re-homed onto the chord, and a
/// single ornament found on a contained note is promoted up to it.
pub(crate) fn chord_from_element(
    node: &Node,
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<Event> {
    let mut pitches = Vec::new();
    let mut note_expressions = Vec::new();
    let mut note_tie: Option<Tie> = None;
    let mut note_lyrics = Vec::new();
    let mut note_ids = Vec::new();

    for child in element_children(node) {
        match mei_tag(&child) {
            Some("note") => {
                let note_event = note_from_element(&child, ann, ctx)?;
                note_ids.push(note_event.id);
                if let EventKind::Note(pitch) = note_event.kind {
                    pitches.push(pitch);
                }
                note_expressions.extend(note_event.expressions);
                if note_tie.is_none() {
                    note_tie = note_event.tie;
                }
                note_lyrics.extend(note_event.lyrics);
            }
            Some("artic") => {}
            Some("verse") | Some("syl") => {}
            Some(other) => {
                log::warn!("Found an unprocessed <{other}> element in a <chord>.");
            }
            None => {}
        }
    }

    let duration = duration_from_node(node, 0);
    let mut event = Event::chord(ctx.next_event_id(), pitches, duration);

    // notes inside a chord cannot carry spanners of their own
    for note_id in note_ids {
        ctx.registry.replace_member(note_id, event.id);
    }
    // a single contained-note ornament belongs to the whole chord
    if note_expressions.len() == 1 {
        event.expressions.extend(note_expressions);
    }
    event.tie = note_tie;
    event.lyrics = note_lyrics;

    if let Some(artic) = node.attribute("artic") {
        event
            .articulations
            .extend(articulation_list_from_attr(artic));
    }
    for child in node.children().filter(|c| c.has_tag_name((MEI_NS, "artic"))) {
        if let Some(artic) = child.attribute("artic") {
            event
                .articulations
                .extend(articulation_list_from_attr(artic));
        }
    }
    grace_from_node(node, &mut event);
    event.visual = visual_from_node(node);
    event.breaksec = node.attribute("breaksec").and_then(|v| v.parse().ok());

    apply_annotations(node, &mut event, ann, ctx);
    observe_event(&event, ctx);

    Ok(event)
}

// ─── Containers ──────────────────────────────────────────────────────

/// `<beam>` — events beamed together within a measure.
pub(crate) fn beam_from_element(
    node: &Node,
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<Vec<LayerItem>> {
    let mut items = dispatch_children(node, Container::Beam, ann, ctx)?;
    let mut events: Vec<&mut Event> = items
        .iter_mut()
        .filter_map(|item| match item {
            LayerItem::Event(e) => Some(e),
            _ => None,
        })
        .collect();
    beam_together(&mut events);
    apply_break_sections(&mut events);
    Ok(items)
}

/// `<tuplet>` — events whose notated durations are scaled by
/// `@numbase`/`@num`. Both ratio attributes are required.
pub(crate) fn tuplet_from_element(
    node: &Node,
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<Vec<LayerItem>> {
    let (Some(num), Some(numbase)) = (parse_u32(node, "num"), parse_u32(node, "numbase")) else {
        return Err(MeiError::Attribute(MISSING_TUPLET_DATA.to_string()));
    };

    let mut items = dispatch_children(node, Container::Tuplet, ann, ctx)?;
    let mut events: Vec<&mut Event> = items
        .iter_mut()
        .filter_map(|item| match item {
            LayerItem::Event(e) => Some(e),
            _ => None,
        })
        .collect();
    scale_by_tuplet(&mut events, num, numbase);
    beam_together(&mut events);
    Ok(items)
}

/// `<bTrem>` — a bowed/measured tremolo wrapping exactly one note or
/// chord.
pub(crate) fn btrem_from_element(
    node: &Node,
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<Event> {
    let mut items = dispatch_children(node, Container::Tremolo, ann, ctx)?;
    let events: Vec<&mut Event> = items
        .iter_mut()
        .filter_map(|item| match item {
            LayerItem::Event(e) => Some(e),
            _ => None,
        })
        .collect();
    if events.len() != 1 {
        return Err(MeiError::Element(format!(
            "<bTrem> must contain exactly one note or chord, found {}.",
            events.len()
        )));
    }

    let strokes = node
        .attribute("unitdur")
        .map(|unit| match unit {
            "8" => 1,
            "16" => 2,
            "32" => 3,
            "64" => 4,
            _ => 3,
        })
        .unwrap_or(3);

    let mut event = match items.pop() {
        Some(LayerItem::Event(e)) => e,
        _ => {
            return Err(MeiError::Internal(
                "tremolo arity check passed but no event was produced".to_string(),
            ))
        }
    };
    event.expressions.push(Expression::Tremolo { strokes });
    Ok(event)
}

/// `<fTrem>` — a fingered tremolo alternating between exactly two notes
/// or chords; the pair is linked by a spanner.
pub(crate) fn ftrem_from_element(
    node: &Node,
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<Vec<Event>> {
    let items = dispatch_children(node, Container::Tremolo, ann, ctx)?;
    let mut events: Vec<Event> = items
        .into_iter()
        .filter_map(|item| match item {
            LayerItem::Event(e) => Some(e),
            _ => None,
        })
        .collect();
    if events.len() != 2 {
        return Err(MeiError::Element(format!(
            "<fTrem> must contain exactly two notes or chords, found {}.",
            events.len()
        )));
    }

    let strokes = parse_u32(node, "beams").unwrap_or(2).min(8) as u8;
    let spanner_id = ctx.registry.create(SpannerKind::TremoloPair { strokes });
    for event in &events {
        ctx.registry.add_member(&spanner_id, event.id);
    }
    for event in &mut events {
        event.expressions.push(Expression::Tremolo { strokes });
    }
    Ok(events)
}

// ─── Layer and staff ─────────────────────────────────────────────────

/// `<layer>` — one voice of a staff. The resulting voice id comes from
/// `@n` or the caller's override; without either the voice cannot be
/// kept continuous across measures, which is an error.
pub(crate) fn layer_from_element(
    node: &Node,
    override_n: Option<&str>,
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<Voice> {
    let id = match override_n.or_else(|| node.attribute("n")) {
        Some(n) => n.to_string(),
        None => return Err(MeiError::Attribute(MISSING_VOICE_ID.to_string())),
    };

    let mut items = dispatch_children(node, Container::Layer, ann, ctx)?;

    // finish tuplets that were declared by a name-only range
    let mut events: Vec<&mut Event> = items
        .iter_mut()
        .filter_map(|item| match item {
            LayerItem::Event(e) => Some(e),
            _ => None,
        })
        .collect();
    guess_tuplet_membership(&mut events);

    let mut voice = Voice::new(id);
    let mut offset = crate::model::ql(0, 1);
    for item in items {
        match item {
            LayerItem::Event(mut event) => {
                event.offset = offset;
                offset += event.time_length();
                voice.events.push(event);
            }
            LayerItem::Item(staff_item) => {
                voice.inserts.push((offset, staff_item));
            }
        }
    }
    Ok(voice)
}

/// `<staff>` — all of one staff's voices in a measure. Layers are
/// numbered positionally when they carry no `@n`.
pub(crate) fn staff_from_element(
    node: &Node,
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<Vec<Voice>> {
    let mut voices = Vec::new();
    let mut next_n = 1;
    for child in element_children(node) {
        match mei_tag(&child) {
            Some("layer") => {
                let fallback = next_n.to_string();
                let override_n = if child.attribute("n").is_some() {
                    None
                } else {
                    Some(fallback.as_str())
                };
                voices.push(layer_from_element(&child, override_n, ann, ctx)?);
                next_n += 1;
            }
            Some(other) => {
                log::warn!("Found an unprocessed <{other}> element in a <staff>.");
            }
            None => {}
        }
    }
    Ok(voices)
}

// ─── Staff and score definitions ─────────────────────────────────────

/// Everything a `<staffDef>` can declare for its staff.
#[derive(Debug, Default, Clone)]
pub(crate) struct StaffDefInfo {
    pub clef: Option<Clef>,
    pub key: Option<KeySig>,
    pub meter: Option<MeterSig>,
    pub label: Option<String>,
    pub label_abbr: Option<String>,
    pub midi_program: Option<i32>,
    pub transposition: Option<Transposition>,
}

/// `<staffDef>` — staff meta-information: clef, key, meter, the part
/// label, an optional MIDI instrument, and a transposition.
pub(crate) fn staff_def_from_element(node: &Node) -> Result<StaffDefInfo> {
    let mut info = StaffDefInfo {
        label: node.attribute("label").map(str::to_string),
        label_abbr: node.attribute("label.abbr").map(str::to_string),
        ..StaffDefInfo::default()
    };

    if node.attribute("trans.semi").is_some() || node.attribute("trans.diat").is_some() {
        info.transposition = Some(Transposition {
            diatonic: node
                .attribute("trans.diat")
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v as i32)
                .unwrap_or(0),
            semitones: node
                .attribute("trans.semi")
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v as i32)
                .unwrap_or(0),
        });
    }

    if node.attribute("meter.count").is_some() || node.attribute("meter.sym").is_some() {
        info.meter = Some(time_sig_from_attrs(node, "meter.")?);
    }
    info.key = key_sig_from_attrs(node, "key.");
    if node.attribute("clef.shape").is_some() {
        info.clef = Some(clef_from_parts(
            node.attribute("clef.shape"),
            node.attribute("clef.line"),
            node.attribute("clef.dis"),
            node.attribute("clef.dis.place"),
        ));
    }

    for child in node.children().filter(|c| c.is_element()) {
        match mei_tag(&child) {
            Some("clef") => {
                let clef = clef_from_element(&child);
                if let Some(old) = info.clef.replace(clef) {
                    log::warn!(
                        "Multiple clefs specified in <staffDef>, ignoring {old:?} in favor of {clef:?}"
                    );
                }
            }
            Some("keySig") => {
                let key = key_sig_from_element(&child);
                if let Some(old) = info.key.replace(key.clone()) {
                    log::warn!(
                        "Multiple keys specified in <staffDef>, ignoring {old:?} in favor of {key:?}"
                    );
                }
            }
            Some("meterSig") => {
                let meter = time_sig_from_element(&child)?;
                if let Some(old) = info.meter.replace(meter) {
                    log::warn!(
                        "Multiple meters specified in <staffDef>, ignoring {old:?} in favor of {meter:?}"
                    );
                }
            }
            Some("instrDef") => {
                info.midi_program = child
                    .attribute("midi.instrnum")
                    .and_then(|v| v.parse().ok());
            }
            Some("label") => {
                if info.label.is_none() {
                    info.label = child.text().map(|t| t.trim().to_string());
                }
            }
            Some(other) => {
                log::warn!("Found an unprocessed <{other}> element in a <staffDef>.");
            }
            None => {}
        }
    }

    Ok(info)
}

/// What a `<scoreDef>` contributes: objects for every part at this
/// moment, plus per-staff definitions from its contained `<staffGrp>`.
#[derive(Debug, Default)]
pub(crate) struct ScoreDefInfo {
    pub key: Option<KeySig>,
    pub meter: Option<MeterSig>,
    pub staff_defs: HashMap<String, StaffDefInfo>,
}

/// `<scoreDef>` — score meta-information: all-part key and meter plus
/// the `<staffGrp>`/`<staffDef>` tree.
pub(crate) fn score_def_from_element(node: &Node) -> Result<ScoreDefInfo> {
    let mut info = ScoreDefInfo::default();

    if node.attribute("meter.count").is_some() || node.attribute("meter.sym").is_some() {
        info.meter = Some(time_sig_from_attrs(node, "meter.")?);
    }
    info.key = key_sig_from_attrs(node, "key.");

    for child in node.children().filter(|c| c.is_element()) {
        match mei_tag(&child) {
            Some("meterSig") => info.meter = Some(time_sig_from_element(&child)?),
            Some("keySig") => info.key = Some(key_sig_from_element(&child)),
            Some("staffGrp") => staff_grp_from_element(&child, &mut info.staff_defs)?,
            Some("pgHead") | Some("pgFoot") => {}
            Some(other) => {
                log::warn!("Found an unprocessed <{other}> element in a <scoreDef>.");
            }
            None => {}
        }
    }

    Ok(info)
}

/// `<staffGrp>` — collects `<staffDef>` children, recursing through
/// nested groups.
pub(crate) fn staff_grp_from_element(
    node: &Node,
    out: &mut HashMap<String, StaffDefInfo>,
) -> Result<()> {
    for child in node.children().filter(|c| c.is_element()) {
        match mei_tag(&child) {
            Some("staffDef") => {
                if let Some(n) = child.attribute("n") {
                    out.insert(n.to_string(), staff_def_from_element(&child)?);
                }
            }
            Some("staffGrp") => staff_grp_from_element(&child, out)?,
            Some("grpSym") | Some("label") => {}
            Some(other) => {
                log::warn!("Found an unprocessed <{other}> element in a <staffGrp>.");
            }
            None => {}
        }
    }
    Ok(())
}

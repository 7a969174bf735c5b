//! Score assembly.
//!
//! The top of the conversion: discover the staves, flatten nested
//! sections and endings into per-part measure sequences, carry
//! cross-measure spanner state between measures, and finish range
//! spanners that logically cover every event between their endpoints.

use std::collections::HashMap;

use roxmltree::{Document, Node};

use crate::context::{Context, PendingSpanner};
use crate::error::{MeiError, Result};
use crate::measure::{anchor_at, measure_from_element, MeasureResult};
use crate::model::{Barline, MeasureAttributes, Part, Ql, Score, SpannerKind};
use crate::preprocess::{self, Annotations, MEI_NS};
use crate::spanner::SpannerRegistry;
use crate::translate::{
    score_def_from_element, staff_def_from_element, ScoreDefInfo, StaffDefInfo,
};

const WRONG_ROOT: &str = "Root element must be <mei> in the MEI namespace";
const NO_SCORE: &str = "Document has no <music>/<score> element";
const NO_STAFF_DEFS: &str = "No staff definitions found anywhere in the score";

fn mei_tag<'a>(node: &Node<'a, '_>) -> Option<&'a str> {
    if node.tag_name().namespace() == Some(MEI_NS) {
        Some(node.tag_name().name())
    } else {
        None
    }
}

/// Convert a parsed MEI document into a score.
pub(crate) fn convert(doc: &Document) -> Result<Score> {
    let root = doc.root_element();
    if root.tag_name().name() != "mei" || root.tag_name().namespace() != Some(MEI_NS) {
        return Err(MeiError::Validity(format!(
            "{WRONG_ROOT}, found <{}>.",
            root.tag_name().name()
        )));
    }

    let mut registry = SpannerRegistry::new();
    let ann = preprocess::preprocess(doc, &mut registry);
    let mut ctx = Context::new();
    ctx.registry = registry;

    let score_node =
        preprocess::find_score(doc).ok_or_else(|| MeiError::Validity(NO_SCORE.to_string()))?;
    score_from_element(&score_node, &ann, &mut ctx)
}

/// `<score>` — the whole piece: staff discovery, then the recursive
/// section walk, then spanner handoff and fill.
pub(crate) fn score_from_element(
    node: &Node,
    ann: &Annotations,
    ctx: &mut Context,
) -> Result<Score> {
    let staff_ns = discover_staves(node);
    if staff_ns.is_empty() {
        return Err(MeiError::Validity(NO_STAFF_DEFS.to_string()));
    }

    let mut assembler = ScoreAssembler::new(staff_ns);
    section_core(node, ann, ctx, &mut assembler)?;

    for pending in ctx.pending.drain(..) {
        log::warn!(
            "Spanner \"{}\" never reached its closing measure; left open.",
            pending.spanner_id
        );
    }

    let mut score = Score::new();
    for n in &assembler.staff_ns {
        if let Some(part) = assembler.parts.remove(n) {
            score.parts.push(part);
        }
    }
    score.spanners = std::mem::take(&mut ctx.registry).into_spanners();
    fill_range_spanners(&mut score);
    Ok(score)
}

/// Every staff number declared by a `<staffDef>` anywhere under the
/// score, in document order.
fn discover_staves(score: &Node) -> Vec<String> {
    let mut ns: Vec<String> = Vec::new();
    for staff_def in score
        .descendants()
        .filter(|n| n.has_tag_name((MEI_NS, "staffDef")))
    {
        if let Some(n) = staff_def.attribute("n") {
            if !ns.iter().any(|seen| seen == n) {
                ns.push(n.to_string());
            }
        }
    }
    ns
}

/// Accumulates per-part measures while the section walk runs.
struct ScoreAssembler {
    staff_ns: Vec<String>,
    parts: HashMap<String, Part>,
    /// Left barline the next measure must take, produced by a both-ways
    /// repeat on the previous measure's right side
    pending_left: Option<Barline>,
    /// Signature changes declared between measures, inserted at the
    /// start of the next one
    pending_attrs: HashMap<String, MeasureAttributes>,
    measure_count: i32,
}

impl ScoreAssembler {
    fn new(staff_ns: Vec<String>) -> Self {
        let parts = staff_ns
            .iter()
            .map(|n| (n.clone(), Part::new(n.clone())))
            .collect();
        Self {
            staff_ns,
            parts,
            pending_left: None,
            pending_attrs: HashMap::new(),
            measure_count: 0,
        }
    }

    /// Fold a `<scoreDef>`'s products in: the all-part key and meter
    /// apply to every staff, then each contained staff definition.
    fn apply_score_def(&mut self, info: ScoreDefInfo, ctx: &mut Context) {
        if let Some(meter) = info.meter {
            ctx.active_meter = Some(meter);
            for n in &self.staff_ns {
                self.pending_attrs.entry(n.clone()).or_default().meter = Some(meter);
            }
        }
        if let Some(key) = info.key {
            for n in &self.staff_ns {
                ctx.staff_state(n).set_key(key.fifths);
                self.pending_attrs.entry(n.clone()).or_default().key = Some(key.clone());
            }
        }
        for (n, staff_def) in info.staff_defs {
            self.apply_staff_def(&n, staff_def, ctx);
        }
    }

    fn apply_staff_def(&mut self, n: &str, info: StaffDefInfo, ctx: &mut Context) {
        if let Some(part) = self.parts.get_mut(n) {
            if info.label.is_some() {
                part.name = info.label.clone();
            }
            if info.label_abbr.is_some() {
                part.abbreviation = info.label_abbr.clone();
            }
            if info.midi_program.is_some() {
                part.midi_program = info.midi_program;
            }
            if info.transposition.is_some() {
                part.transposition = info.transposition;
            }
        }
        if let Some(key) = &info.key {
            ctx.staff_state(n).set_key(key.fifths);
        }
        if let Some(meter) = info.meter {
            ctx.active_meter = Some(meter);
        }
        let attrs = self.pending_attrs.entry(n.to_string()).or_default();
        attrs.clef = info.clef.or(attrs.clef);
        attrs.key = info.key.or(attrs.key.take());
        attrs.meter = info.meter.or(attrs.meter);
    }

    /// Append one assembled measure to every part, closing carried
    /// cross-measure spanners whose countdown ends here.
    fn push_measure(
        &mut self,
        mut result: MeasureResult,
        carried: Vec<PendingSpanner>,
        ctx: &mut Context,
    ) {
        for mut pending in carried {
            pending.measures_remaining -= 1;
            if pending.measures_remaining == 0 {
                match result.staves.get_mut(&pending.staff) {
                    Some(measure) => {
                        let end = anchor_at(measure, pending.target_offset, ctx);
                        ctx.registry.add_member(&pending.spanner_id, end);
                    }
                    None => log::warn!(
                        "Spanner \"{}\" ends on unknown staff {}; left open.",
                        pending.spanner_id,
                        pending.staff
                    ),
                }
            } else {
                ctx.pending.push(pending);
            }
        }

        let queued = std::mem::take(&mut self.pending_attrs);
        for n in &self.staff_ns {
            let Some(mut measure) = result.staves.remove(n) else {
                continue;
            };
            if measure.left_barline.is_none() {
                measure.left_barline = self.pending_left.clone();
            }
            if let Some(queued) = queued.get(n) {
                // the measure's own declarations win over queued ones
                let mut attrs = measure.attributes.take().unwrap_or_default();
                attrs.clef = attrs.clef.or(queued.clef);
                attrs.key = attrs.key.or_else(|| queued.key.clone());
                attrs.meter = attrs.meter.or(queued.meter);
                if !attrs.is_empty() {
                    measure.attributes = Some(attrs);
                }
            }
            if let Some(part) = self.parts.get_mut(n) {
                part.measures.push(measure);
            }
        }
        self.pending_left = result.next_left;
    }
}

/// Walk the children of a `<score>`, `<section>`, or `<ending>`:
/// signature definitions update shared state, nested sections recurse,
/// measures are assembled and appended.
fn section_core(
    node: &Node,
    ann: &Annotations,
    ctx: &mut Context,
    assembler: &mut ScoreAssembler,
) -> Result<()> {
    for child in node.children().filter(|c| c.is_element()) {
        let Some(tag) = mei_tag(&child) else {
            continue;
        };
        match tag {
            "scoreDef" => {
                let info = score_def_from_element(&child)?;
                assembler.apply_score_def(info, ctx);
            }
            "staffDef" => match child.attribute("n") {
                Some(n) => {
                    let info = staff_def_from_element(&child)?;
                    assembler.apply_staff_def(n, info, ctx);
                }
                None => {
                    log::warn!("Importing <staffDef> without @n is not yet supported.");
                }
            },
            "section" => section_core(&child, ann, ctx, assembler)?,
            "ending" => ending_from_element(&child, ann, ctx, assembler)?,
            "measure" => {
                assembler.measure_count += 1;
                let expected = assembler.staff_ns.clone();
                let carried = std::mem::take(&mut ctx.pending);
                let result =
                    measure_from_element(&child, assembler.measure_count, &expected, ann, ctx)?;
                assembler.push_measure(result, carried, ctx);
            }
            // breaks are presentation only
            "pb" | "sb" | "lb" => {}
            other => {
                log::warn!(
                    "Found an unprocessed <{other}> element in a <{}>.",
                    node.tag_name().name()
                );
            }
        }
    }
    Ok(())
}

/// `<ending>` — a volta: its measures import like a plain section, then
/// the top staff's events are wrapped in a repeat bracket keyed by the
/// ending's numeric label.
fn ending_from_element(
    node: &Node,
    ann: &Annotations,
    ctx: &mut Context,
    assembler: &mut ScoreAssembler,
) -> Result<()> {
    let top_staff = assembler.staff_ns.first().cloned();
    let before = top_staff
        .as_ref()
        .and_then(|n| assembler.parts.get(n))
        .map(|p| p.measures.len())
        .unwrap_or(0);

    section_core(node, ann, ctx, assembler)?;

    let number = node.attribute("n").unwrap_or("1").to_string();
    let bracket = ctx.registry.create(SpannerKind::RepeatBracket { number });
    if let Some(part) = top_staff.and_then(|n| assembler.parts.get(&n)) {
        for measure in &part.measures[before..] {
            for voice in &measure.voices {
                for event in &voice.events {
                    ctx.registry.add_member(&bracket, event.id);
                }
            }
        }
    }
    Ok(())
}

// ─── Spanner fill ────────────────────────────────────────────────────

/// Every event of a part in playing order: measure by measure, merged
/// across voices by offset.
fn ordered_events(part: &Part) -> Vec<(u32, bool)> {
    let mut out = Vec::new();
    for measure in &part.measures {
        let mut in_measure: Vec<(Ql, u32, bool)> = Vec::new();
        for voice in &measure.voices {
            for event in &voice.events {
                in_measure.push((event.offset, event.id, event.is_durational()));
            }
        }
        in_measure.sort_by_key(|(offset, _, _)| *offset);
        out.extend(in_measure.into_iter().map(|(_, id, d)| (id, d)));
    }
    out
}

/// Range spanners that logically cover everything between their two
/// anchors (octave shifts) receive every intervening durational event
/// of the owning part.
fn fill_range_spanners(score: &mut Score) {
    let parts = &score.parts;
    for spanner in &mut score.spanners {
        if !matches!(spanner.kind, SpannerKind::OctaveShift { .. }) {
            continue;
        }
        let (Some(&first), Some(&last)) = (spanner.events.first(), spanner.events.last()) else {
            continue;
        };
        if first == last {
            continue;
        }
        let Some(part) = parts
            .iter()
            .find(|p| ordered_events(p).iter().any(|(id, _)| *id == first))
        else {
            continue;
        };
        let ordered = ordered_events(part);
        let Some(a) = ordered.iter().position(|(id, _)| *id == first) else {
            continue;
        };
        let Some(b) = ordered.iter().position(|(id, _)| *id == last) else {
            continue;
        };
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        spanner.events = ordered[a..=b]
            .iter()
            .filter(|(id, durational)| *durational || *id == first || *id == last)
            .map(|(id, _)| *id)
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BarStyle, RepeatDirection};
    use roxmltree::Document;

    fn mei(body: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <mei xmlns=\"http://www.music-encoding.org/ns/mei\" meiversion=\"4.0.1\">\
             <music><body><mdiv><score>{body}</score></mdiv></body></music></mei>"
        )
    }

    fn import(body: &str) -> Score {
        let xml = mei(body);
        let doc = Document::parse(&xml).unwrap();
        convert(&doc).unwrap()
    }

    const ONE_STAFF: &str =
        "<scoreDef meter.count=\"4\" meter.unit=\"4\"><staffGrp>\
         <staffDef n=\"1\" lines=\"5\" clef.shape=\"G\" clef.line=\"2\"/>\
         </staffGrp></scoreDef>";

    #[test]
    fn wrong_root_is_a_validity_error() {
        let doc = Document::parse("<notMei/>").unwrap();
        assert!(matches!(convert(&doc), Err(MeiError::Validity(_))));
    }

    #[test]
    fn missing_staff_defs_are_a_validity_error() {
        let xml = mei("<section><measure/></section>");
        let doc = Document::parse(&xml).unwrap();
        assert!(matches!(convert(&doc), Err(MeiError::Validity(_))));
    }

    #[test]
    fn staves_are_discovered_in_document_order() {
        let xml = mei(
            "<scoreDef><staffGrp>\
             <staffDef n=\"2\"/><staffDef n=\"1\"/><staffDef n=\"2\"/>\
             </staffGrp></scoreDef>",
        );
        let doc = Document::parse(&xml).unwrap();
        let score = preprocess::find_score(&doc).unwrap();
        assert_eq!(discover_staves(&score), vec!["2", "1"]);
    }

    #[test]
    fn repeat_barline_carries_to_the_next_measure() {
        let score = import(&format!(
            "{ONE_STAFF}<section>\
             <measure n=\"1\" right=\"rptboth\"><staff n=\"1\"><layer n=\"1\">\
             <note pname=\"c\" oct=\"4\" dur=\"1\"/></layer></staff></measure>\
             <measure n=\"2\"><staff n=\"1\"><layer n=\"1\">\
             <note pname=\"d\" oct=\"4\" dur=\"1\"/></layer></staff></measure>\
             </section>"
        ));
        let part = &score.parts[0];
        let first_right = part.measures[0].right_barline.as_ref().unwrap();
        assert_eq!(first_right.repeat, Some(RepeatDirection::Backward));
        let second_left = part.measures[1].left_barline.as_ref().unwrap();
        assert_eq!(second_left.repeat, Some(RepeatDirection::Forward));
        assert_eq!(second_left.style, BarStyle::Final);
    }

    #[test]
    fn ending_wraps_its_events_in_a_repeat_bracket() {
        let score = import(&format!(
            "{ONE_STAFF}<section>\
             <measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
             <note pname=\"c\" oct=\"4\" dur=\"1\"/></layer></staff></measure>\
             <ending n=\"1\"><measure n=\"2\" right=\"rptend\">\
             <staff n=\"1\"><layer n=\"1\">\
             <note pname=\"d\" oct=\"4\" dur=\"2\"/>\
             <note pname=\"e\" oct=\"4\" dur=\"2\"/>\
             </layer></staff></measure></ending>\
             </section>"
        ));
        let bracket = score
            .spanners
            .iter()
            .find(|s| matches!(&s.kind, SpannerKind::RepeatBracket { number } if number == "1"))
            .expect("ending should produce a repeat bracket");
        // both notes of the ending's measure, not the one before it
        assert_eq!(bracket.events.len(), 2);
        let part = &score.parts[0];
        let outside_id = part.measures[0].voices[0].events[0].id;
        assert!(!bracket.events.contains(&outside_id));
    }

    #[test]
    fn section_level_score_def_lands_on_the_next_measure() {
        let score = import(&format!(
            "{ONE_STAFF}<section>\
             <measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
             <note pname=\"c\" oct=\"4\" dur=\"1\"/></layer></staff></measure>\
             <scoreDef key.sig=\"2s\" meter.count=\"3\" meter.unit=\"4\"/>\
             <measure n=\"2\"><staff n=\"1\"><layer n=\"1\">\
             <note pname=\"d\" oct=\"4\" dur=\"2\"/>\
             <note pname=\"e\" oct=\"4\" dur=\"4\"/></layer></staff></measure>\
             </section>"
        ));
        let part = &score.parts[0];
        let attrs = part.measures[1].attributes.as_ref().unwrap();
        assert_eq!(attrs.key.as_ref().unwrap().fifths, 2);
        assert_eq!(attrs.meter.unwrap().count, 3);
        assert_eq!(part.measures[1].bar_duration, crate::model::ql(3, 1));
    }
}

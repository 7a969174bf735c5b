//! Document-wide preprocessing of range-indicating elements.
//!
//! MEI expresses slurs, ties, spanned beams and tuplets, ornaments with
//! extensions, arpeggios, and octave shifts as elements that reference
//! other elements by identifier, member list, or musical timestamp.
//! Before translation, a fixed sequence of passes resolves each category
//! into (a) registry spanners and (b) synthetic per-identifier
//! annotations, so that the per-element handlers can read everything
//! they need locally.
//!
//! The input tree stays immutable: annotations live in a side table
//! keyed by each node's declared identifier and are "flattened" at the
//! end by discarding entries whose identifier matches nothing in the
//! document. Keeping the writes in a side table makes the passes
//! order-insensitive and idempotent; elements already processed once are
//! remembered and skipped on a second visit.

use std::collections::{HashMap, HashSet};

use roxmltree::{Document, Node, NodeId};

use crate::attributes::{arpeggio_style_from_attrs, octave_shift_from_attrs};
use crate::model::SpannerKind;
use crate::spanner::SpannerRegistry;

pub const MEI_NS: &str = "http://www.music-encoding.org/ns/mei";
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

// Synthetic annotation names. These are private vocabulary between the
// preprocessor and the translator.
pub const SLUR_START: &str = "slurStart";
pub const SLUR_END: &str = "slurEnd";
pub const TIE: &str = "tie";
pub const TIE_SPAN: &str = "tieSpan";
pub const BEAM: &str = "beam";
pub const BEAM_SPAN: &str = "beamSpan";
pub const TUPLET_NUM: &str = "tupletNum";
pub const TUPLET_NUMBASE: &str = "tupletNumbase";
pub const TUPLET_TYPE: &str = "tupletType";
pub const TUPLET_SEARCH: &str = "tupletSearch";
pub const TUPLET_SPAN: &str = "tupletSpan";
pub const FERMATA: &str = "fermata";
pub const MORDENT: &str = "mordent";
pub const MORDENT_ACCID: &str = "mordentAccid";
pub const TURN: &str = "turn";
pub const TURN_DELAYED: &str = "turnDelayed";
pub const TURN_ACCID_UPPER: &str = "turnAccidUpper";
pub const TURN_ACCID_LOWER: &str = "turnAccidLower";
pub const TRILL: &str = "trill";
pub const TRILL_ACCID: &str = "trillAccid";
pub const TRILL_SPAN_START: &str = "trillSpanStart";
pub const TRILL_SPAN_END: &str = "trillSpanEnd";
pub const ARPEG: &str = "arpeg";
pub const ARPEG_SPAN: &str = "arpegSpan";
pub const OTTAVA_START: &str = "ottavaStart";
pub const OTTAVA_END: &str = "ottavaEnd";

/// A range spanner whose closing endpoint was given as a `@tstamp2`
/// rather than an identifier; the measure assembler finishes it.
#[derive(Debug, Clone)]
pub struct RangeClosure {
    pub spanner_id: String,
    pub tstamp2: String,
    pub staff: Option<String>,
}

/// The preprocessor's output: synthetic annotations keyed by element
/// identifier, the set of control elements already consumed, and the
/// deferred range closures.
#[derive(Debug, Default)]
pub struct Annotations {
    attrs: HashMap<String, HashMap<&'static str, String>>,
    /// Control elements fully consumed by preprocessing; positional
    /// handlers skip these.
    handled: HashSet<NodeId>,
    /// Control elements a pass has already visited; guards against
    /// double-processing when a pass runs twice.
    processed: HashSet<NodeId>,
    closures: HashMap<NodeId, RangeClosure>,
}

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, id: &str, key: &'static str) -> &mut String {
        self.attrs
            .entry(id.to_string())
            .or_default()
            .entry(key)
            .or_default()
    }

    /// Overwrite an annotation.
    fn set(&mut self, id: &str, key: &'static str, value: &str) {
        *self.entry(id, key) = value.to_string();
    }

    /// Concatenate onto an annotation; used for values whose letters
    /// compose, like tie states ("t" + "i" reads as both).
    fn append_str(&mut self, id: &str, key: &'static str, value: &str) {
        self.entry(id, key).push_str(value);
    }

    /// Append an id token, space-separated.
    fn append_id(&mut self, id: &str, key: &'static str, value: &str) {
        let slot = self.entry(id, key);
        if !slot.is_empty() {
            slot.push(' ');
        }
        slot.push_str(value);
    }

    fn set_if_absent(&mut self, id: &str, key: &'static str, value: &str) {
        let slot = self.entry(id, key);
        if slot.is_empty() {
            *slot = value.to_string();
        }
    }

    /// Read an annotation for a node, by its declared identifier.
    pub fn get<'a>(&'a self, node: &Node, key: &str) -> Option<&'a str> {
        let id = xml_id(node)?;
        self.get_by_id(id, key)
    }

    pub fn get_by_id<'a>(&'a self, id: &str, key: &str) -> Option<&'a str> {
        self.attrs.get(id)?.get(key).map(String::as_str)
    }

    /// Whether a control element was fully consumed by preprocessing,
    /// so positional handlers must not re-process it.
    pub fn is_handled(&self, node: &Node) -> bool {
        self.handled.contains(&node.id())
    }

    fn mark_handled(&mut self, node: &Node) {
        self.handled.insert(node.id());
        self.processed.insert(node.id());
    }

    fn is_processed(&self, node: &Node) -> bool {
        self.processed.contains(&node.id())
    }

    fn mark_processed(&mut self, node: &Node) {
        self.processed.insert(node.id());
    }

    pub fn closure_for(&self, node: &Node) -> Option<&RangeClosure> {
        self.closures.get(&node.id())
    }

    /// Final pass: keep only annotations whose identifier names a node
    /// that actually exists under the score.
    fn flatten(&mut self, score: &Node) {
        let present: HashSet<&str> = score
            .descendants()
            .filter_map(|n| xml_id(&n))
            .collect();
        self.attrs.retain(|id, _| present.contains(id.as_str()));
    }
}

/// The identifier declared on a node.
pub fn xml_id<'a>(node: &Node<'a, '_>) -> Option<&'a str> {
    node.attribute((XML_NS, "id"))
}

/// Strip the leading `#` from an identifier reference.
pub fn strip_octothorpe(reference: &str) -> &str {
    reference.strip_prefix('#').unwrap_or(reference)
}

/// Split a `@plist` into its identifier references.
fn plist_refs(plist: &str) -> Vec<&str> {
    plist
        .split_whitespace()
        .map(strip_octothorpe)
        .filter(|s| !s.is_empty())
        .collect()
}

/// The `<score>` element under `<music>`, when the document has one.
pub fn find_score<'a, 'd>(doc: &'a Document<'d>) -> Option<Node<'a, 'd>> {
    let music = doc
        .root_element()
        .descendants()
        .find(|n| n.has_tag_name((MEI_NS, "music")))?;
    music
        .descendants()
        .find(|n| n.has_tag_name((MEI_NS, "score")))
}

fn warn_without(tag: &str, what: &str) {
    log::warn!("Importing <{tag}> without {what} is not yet supported.");
}

/// Run every preprocessing pass over the document, then flatten.
pub fn preprocess(doc: &Document, registry: &mut SpannerRegistry) -> Annotations {
    let mut ann = Annotations::new();
    let Some(score) = find_score(doc) else {
        return ann;
    };

    log::debug!("pre-processing slurs");
    pp_slurs(&score, &mut ann, registry);
    log::debug!("pre-processing ties");
    pp_ties(&score, &mut ann, registry);
    log::debug!("pre-processing beam spans");
    pp_beams(&score, &mut ann, registry);
    log::debug!("pre-processing tuplet spans");
    pp_tuplets(&score, &mut ann, registry);
    log::debug!("pre-processing fermatas");
    pp_fermatas(&score, &mut ann);
    log::debug!("pre-processing arpeggios and octave shifts");
    pp_arpeggios_and_octaves(&score, &mut ann, registry);
    log::debug!("pre-processing trills, mordents, turns");
    pp_ornaments(&score, &mut ann, registry);
    log::debug!("concluding pre-processing");
    ann.flatten(&score);

    ann
}

fn mei_elements<'a, 'd>(score: &Node<'a, 'd>, tag: &'static str) -> Vec<Node<'a, 'd>> {
    score
        .descendants()
        .filter(|n| n.has_tag_name((MEI_NS, tag)))
        .collect()
}

/// Both endpoint references of a range element, when present.
fn endpoint_ids<'a>(node: &Node<'a, '_>) -> Option<(&'a str, &'a str)> {
    let start = node.attribute("startid")?;
    let end = node.attribute("endid")?;
    Some((strip_octothorpe(start), strip_octothorpe(end)))
}

pub fn pp_slurs(score: &Node, ann: &mut Annotations, registry: &mut SpannerRegistry) {
    for slur in mei_elements(score, "slur") {
        if ann.is_processed(&slur) {
            continue;
        }
        match endpoint_ids(&slur) {
            Some((start, end)) => {
                let id = registry.create(SpannerKind::Slur);
                ann.append_id(start, SLUR_START, &id);
                ann.append_id(end, SLUR_END, &id);
                ann.mark_handled(&slur);
            }
            None => warn_without("slur", "@startid and @endid"),
        }
    }
}

pub fn pp_ties(score: &Node, ann: &mut Annotations, registry: &mut SpannerRegistry) {
    for tie in mei_elements(score, "tie") {
        if ann.is_processed(&tie) {
            continue;
        }
        match endpoint_ids(&tie) {
            Some((start, end)) => {
                ann.append_str(start, TIE, "i");
                ann.append_str(end, TIE, "t");
                let id = registry.create(SpannerKind::TieRun);
                ann.append_id(start, TIE_SPAN, &id);
                ann.append_id(end, TIE_SPAN, &id);
                ann.mark_handled(&tie);
            }
            None => warn_without("tie", "@startid and @endid"),
        }
    }
}

pub fn pp_beams(score: &Node, ann: &mut Annotations, registry: &mut SpannerRegistry) {
    for beam_span in mei_elements(score, "beamSpan") {
        if ann.is_processed(&beam_span) {
            continue;
        }
        let Some((start, end)) = endpoint_ids(&beam_span) else {
            warn_without("beamSpan", "@startid and @endid");
            continue;
        };

        let id = registry.create(SpannerKind::BeamRun);
        ann.set(start, BEAM, "start");
        ann.set(end, BEAM, "stop");
        ann.append_id(start, BEAM_SPAN, &id);
        ann.append_id(end, BEAM_SPAN, &id);

        // interior members of the enumerated list carry the beam through
        if let Some(plist) = beam_span.attribute("plist") {
            for member in plist_refs(plist) {
                ann.set_if_absent(member, BEAM, "continue");
                if member != start && member != end {
                    ann.append_id(member, BEAM_SPAN, &id);
                }
            }
        }
        ann.mark_handled(&beam_span);
    }
}

pub fn pp_tuplets(score: &Node, ann: &mut Annotations, registry: &mut SpannerRegistry) {
    for tuplet_span in mei_elements(score, "tupletSpan") {
        if ann.is_processed(&tuplet_span) {
            continue;
        }
        let (Some(num), Some(numbase)) = (
            tuplet_span.attribute("num"),
            tuplet_span.attribute("numbase"),
        ) else {
            warn_without("tupletSpan", "@num and @numbase");
            continue;
        };

        if let Some(plist) = tuplet_span.attribute("plist") {
            // the member list names every affected element directly
            let id = registry.create(SpannerKind::TupletRun);
            let members = plist_refs(plist);
            for (i, member) in members.iter().enumerate() {
                ann.set(member, TUPLET_NUM, num);
                ann.set(member, TUPLET_NUMBASE, numbase);
                ann.append_id(member, TUPLET_SPAN, &id);
                let bracket = match (i, members.len()) {
                    (_, 1) => Some("startStop"),
                    (0, _) => Some("start"),
                    (i, len) if i + 1 == len => Some("stop"),
                    _ => None,
                };
                if let Some(bracket) = bracket {
                    ann.set(member, TUPLET_TYPE, bracket);
                }
            }
            ann.mark_handled(&tuplet_span);
        } else if let Some((start, end)) = endpoint_ids(&tuplet_span) {
            // name-only range: defer to the membership search
            let id = registry.create(SpannerKind::TupletRun);
            for (endpoint, position) in [(start, "start"), (end, "end")] {
                ann.set(endpoint, TUPLET_SEARCH, position);
                ann.set(endpoint, TUPLET_NUM, num);
                ann.set(endpoint, TUPLET_NUMBASE, numbase);
                ann.append_id(endpoint, TUPLET_SPAN, &id);
            }
            ann.mark_handled(&tuplet_span);
        } else {
            warn_without("tupletSpan", "@startid and @endid or @plist");
        }
    }
}

pub fn pp_fermatas(score: &Node, ann: &mut Annotations) {
    for fermata in mei_elements(score, "fermata") {
        if ann.is_processed(&fermata) {
            continue;
        }
        let Some(startid) = fermata.attribute("startid") else {
            // timestamp-anchored; the measure assembler places it
            continue;
        };
        let shape = fermata.attribute("shape").unwrap_or("curved");
        let place = if fermata.attribute("form") == Some("inv") {
            "below"
        } else {
            fermata.attribute("place").unwrap_or("above")
        };
        ann.set(
            strip_octothorpe(startid),
            FERMATA,
            &format!("{shape} {place}"),
        );
        ann.mark_handled(&fermata);
    }
}

pub fn pp_arpeggios_and_octaves(
    score: &Node,
    ann: &mut Annotations,
    registry: &mut SpannerRegistry,
) {
    for arpeg in mei_elements(score, "arpeg") {
        if ann.is_processed(&arpeg) {
            continue;
        }
        let style = arpeggio_style_from_attrs(arpeg.attribute("arrow"), arpeg.attribute("order"));
        let style_token = match style {
            crate::model::ArpeggioStyle::Normal => "normal",
            crate::model::ArpeggioStyle::Up => "up",
            crate::model::ArpeggioStyle::Down => "down",
            crate::model::ArpeggioStyle::NonArpeggio => "nonarp",
        };

        if let Some(plist) = arpeg.attribute("plist") {
            let members = plist_refs(plist);
            match members.as_slice() {
                [] => warn_without("arpeg", "a non-empty @plist"),
                [only] => {
                    // a single-member group is just a mark on that event
                    ann.set(only, ARPEG, style_token);
                    ann.mark_handled(&arpeg);
                }
                many => {
                    let id = registry.create(SpannerKind::ArpeggioGroup { style });
                    for member in many {
                        ann.set(member, ARPEG, style_token);
                        ann.append_id(member, ARPEG_SPAN, &id);
                    }
                    ann.mark_handled(&arpeg);
                }
            }
        } else if let Some(startid) = arpeg.attribute("startid") {
            ann.set(strip_octothorpe(startid), ARPEG, style_token);
            ann.mark_handled(&arpeg);
        }
        // timestamp-only arpeggios fall through to the measure assembler
    }

    for octave in mei_elements(score, "octave") {
        if ann.is_processed(&octave) {
            continue;
        }
        let shift =
            octave_shift_from_attrs(octave.attribute("dis"), octave.attribute("dis.place"));
        if shift == 0 {
            log::warn!(
                "Dropping <octave> with unsupported @dis/@dis.place ({:?}/{:?}).",
                octave.attribute("dis"),
                octave.attribute("dis.place")
            );
            ann.mark_handled(&octave);
            continue;
        }
        let Some(startid) = octave.attribute("startid") else {
            // timestamp-anchored; the measure assembler places it
            continue;
        };

        let id = registry.create(SpannerKind::OctaveShift { octaves: shift });
        ann.append_id(strip_octothorpe(startid), OTTAVA_START, &id);
        if let Some(endid) = octave.attribute("endid") {
            ann.append_id(strip_octothorpe(endid), OTTAVA_END, &id);
        } else if let Some(tstamp2) = octave.attribute("tstamp2") {
            ann.closures.insert(
                octave.id(),
                RangeClosure {
                    spanner_id: id,
                    tstamp2: tstamp2.to_string(),
                    staff: octave.attribute("staff").map(str::to_string),
                },
            );
            // the measure assembler must still see this element
            continue;
        }
        // with neither @endid nor @tstamp2 the spanner is repaired with
        // a synthetic anchor during score assembly
        ann.mark_handled(&octave);
    }
}

pub fn pp_ornaments(score: &Node, ann: &mut Annotations, registry: &mut SpannerRegistry) {
    for trill in mei_elements(score, "trill") {
        if ann.is_processed(&trill) {
            continue;
        }
        let Some(startid) = trill.attribute("startid") else {
            continue;
        };
        let start = strip_octothorpe(startid);
        ann.set(start, TRILL, "true");
        if let Some(accid) = trill.attribute("accidupper") {
            ann.set(start, TRILL_ACCID, accid);
        }

        // an extension range becomes a registry spanner as well
        let has_end = trill.attribute("endid").is_some();
        let has_tstamp2 = trill.attribute("tstamp2").is_some();
        if has_end || has_tstamp2 {
            let id = registry.create(SpannerKind::TrillExtension);
            ann.append_id(start, TRILL_SPAN_START, &id);
            if let Some(endid) = trill.attribute("endid") {
                ann.append_id(strip_octothorpe(endid), TRILL_SPAN_END, &id);
            } else if let Some(tstamp2) = trill.attribute("tstamp2") {
                ann.closures.insert(
                    trill.id(),
                    RangeClosure {
                        spanner_id: id,
                        tstamp2: tstamp2.to_string(),
                        staff: trill.attribute("staff").map(str::to_string),
                    },
                );
                continue;
            }
        }
        ann.mark_handled(&trill);
    }

    for mordent in mei_elements(score, "mordent") {
        if ann.is_processed(&mordent) {
            continue;
        }
        let Some(startid) = mordent.attribute("startid") else {
            continue;
        };
        let start = strip_octothorpe(startid);
        let form = match mordent.attribute("form") {
            Some("lower") => "lower",
            _ => "upper",
        };
        ann.set(start, MORDENT, form);
        let accid = if form == "upper" {
            mordent.attribute("accidupper")
        } else {
            mordent.attribute("accidlower")
        };
        if let Some(accid) = accid {
            ann.set(start, MORDENT_ACCID, accid);
        }
        ann.mark_handled(&mordent);
    }

    for turn in mei_elements(score, "turn") {
        if ann.is_processed(&turn) {
            continue;
        }
        let Some(startid) = turn.attribute("startid") else {
            continue;
        };
        let start = strip_octothorpe(startid);
        let form = match turn.attribute("form") {
            Some("inv") | Some("inverted") => "inverted",
            _ => "normal",
        };
        ann.set(start, TURN, form);
        if turn.attribute("delayed") == Some("true") {
            ann.set(start, TURN_DELAYED, "true");
        }
        if let Some(accid) = turn.attribute("accidupper") {
            ann.set(start, TURN_ACCID_UPPER, accid);
        }
        if let Some(accid) = turn.attribute("accidlower") {
            ann.set(start, TURN_ACCID_LOWER, accid);
        }
        ann.mark_handled(&turn);
    }
}

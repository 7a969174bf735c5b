//! Integration tests — spanners, ornaments, and floating expressions
//! that cross the structural tree.

use meiscore::{
    parse_mei, BeamKind, DirectionKind, Expression, Place, Score, SpannerKind, TurnForm, ql,
};

fn mei(body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <mei xmlns=\"http://www.music-encoding.org/ns/mei\" meiversion=\"4.0.1\">\
         <music><body><mdiv><score>{body}</score></mdiv></body></music></mei>"
    )
}

fn import(body: &str) -> Score {
    parse_mei(&mei(body)).expect("document should import")
}

const ONE_STAFF_44: &str = "<scoreDef meter.count=\"4\" meter.unit=\"4\"><staffGrp>\
     <staffDef n=\"1\" lines=\"5\" clef.shape=\"G\" clef.line=\"2\"/>\
     </staffGrp></scoreDef>";

const TWO_STAVES_44: &str = "<scoreDef meter.count=\"4\" meter.unit=\"4\"><staffGrp>\
     <staffDef n=\"1\" lines=\"5\" clef.shape=\"G\" clef.line=\"2\"/>\
     <staffDef n=\"2\" lines=\"5\" clef.shape=\"F\" clef.line=\"4\"/>\
     </staffGrp></scoreDef>";

fn find_spanner<'a>(score: &'a Score, pred: impl Fn(&SpannerKind) -> bool) -> &'a meiscore::Spanner {
    score
        .spanners
        .iter()
        .find(|s| pred(&s.kind))
        .expect("expected spanner is missing")
}

// ─── Slurs ──────────────────────────────────────────────────────────

#[test]
fn slur_element_links_both_notes() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note xml:id=\"n1\" pname=\"c\" oct=\"4\" dur=\"2\"/>\
         <note xml:id=\"n2\" pname=\"d\" oct=\"4\" dur=\"2\"/>\
         </layer></staff>\
         <slur startid=\"#n1\" endid=\"#n2\"/>\
         </measure></section>"
    ));
    let voice = &score.parts[0].measures[0].voices[0];
    let slur = find_spanner(&score, |k| matches!(k, SpannerKind::Slur));
    assert_eq!(slur.events, vec![voice.events[0].id, voice.events[1].id]);
}

#[test]
fn slur_shorthand_attribute_links_both_notes() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note pname=\"c\" oct=\"4\" dur=\"2\" slur=\"i1\"/>\
         <note pname=\"d\" oct=\"4\" dur=\"2\" slur=\"t1\"/>\
         </layer></staff></measure></section>"
    ));
    let voice = &score.parts[0].measures[0].voices[0];
    let slur = find_spanner(&score, |k| matches!(k, SpannerKind::Slur));
    assert_eq!(slur.events, vec![voice.events[0].id, voice.events[1].id]);
}

// ─── Beam spans ─────────────────────────────────────────────────────

#[test]
fn beam_span_with_plist_beams_the_run() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note xml:id=\"b1\" pname=\"c\" oct=\"4\" dur=\"8\"/>\
         <note xml:id=\"b2\" pname=\"d\" oct=\"4\" dur=\"8\"/>\
         <note xml:id=\"b3\" pname=\"e\" oct=\"4\" dur=\"8\"/>\
         </layer></staff>\
         <beamSpan startid=\"#b1\" endid=\"#b3\" plist=\"#b1 #b2 #b3\"/>\
         </measure></section>"
    ));
    let voice = &score.parts[0].measures[0].voices[0];
    assert_eq!(voice.events[0].beams[0].kind, BeamKind::Start);
    assert_eq!(voice.events[1].beams[0].kind, BeamKind::Continue);
    assert_eq!(voice.events[2].beams[0].kind, BeamKind::Stop);

    let run = find_spanner(&score, |k| matches!(k, SpannerKind::BeamRun));
    assert_eq!(run.events.len(), 3);
}

// ─── Cross-measure ranges ───────────────────────────────────────────

#[test]
fn hairpin_closes_in_the_next_measure() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section>\
         <measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note pname=\"c\" oct=\"4\" dur=\"1\"/></layer></staff>\
         <hairpin form=\"cres\" tstamp=\"1\" tstamp2=\"1m+1.0\" staff=\"1\"/>\
         </measure>\
         <measure n=\"2\"><staff n=\"1\"><layer n=\"1\">\
         <note pname=\"g\" oct=\"4\" dur=\"1\"/></layer></staff></measure>\
         </section>"
    ));
    let part = &score.parts[0];
    let first = part.measures[0].voices[0].events[0].id;
    let second = part.measures[1].voices[0].events[0].id;
    let wedge = find_spanner(&score, |k| matches!(k, SpannerKind::Wedge { crescendo: true }));
    assert_eq!(wedge.events, vec![first, second]);
}

#[test]
fn trill_extension_spans_into_the_next_measure() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section>\
         <measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note xml:id=\"n1\" pname=\"c\" oct=\"5\" dur=\"1\"/></layer></staff>\
         <trill startid=\"#n1\" tstamp2=\"1m+1.0\" staff=\"1\"/>\
         </measure>\
         <measure n=\"2\"><staff n=\"1\"><layer n=\"1\">\
         <note pname=\"c\" oct=\"5\" dur=\"1\"/></layer></staff></measure>\
         </section>"
    ));
    let part = &score.parts[0];
    let anchor = &part.measures[0].voices[0].events[0];
    assert!(anchor
        .expressions
        .iter()
        .any(|e| matches!(e, Expression::Trill { .. })));

    let extension = find_spanner(&score, |k| matches!(k, SpannerKind::TrillExtension));
    assert_eq!(extension.events[0], anchor.id);
    assert_eq!(extension.events[1], part.measures[1].voices[0].events[0].id);
}

// ─── Octave shifts ──────────────────────────────────────────────────

#[test]
fn octave_shift_fills_intervening_events() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note xml:id=\"o1\" pname=\"c\" oct=\"5\" dur=\"4\"/>\
         <note pname=\"d\" oct=\"5\" dur=\"4\"/>\
         <note pname=\"e\" oct=\"5\" dur=\"4\"/>\
         <note xml:id=\"o4\" pname=\"f\" oct=\"5\" dur=\"4\"/>\
         </layer></staff>\
         <octave dis=\"8\" dis.place=\"above\" startid=\"#o1\" endid=\"#o4\"/>\
         </measure></section>"
    ));
    let voice = &score.parts[0].measures[0].voices[0];
    let shift = find_spanner(&score, |k| matches!(k, SpannerKind::OctaveShift { octaves: 1 }));
    let all_ids: Vec<u32> = voice.events.iter().map(|e| e.id).collect();
    assert_eq!(shift.events, all_ids);
}

#[test]
fn unsupported_octave_displacement_is_dropped() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note xml:id=\"o1\" pname=\"c\" oct=\"5\" dur=\"1\"/>\
         </layer></staff>\
         <octave dis=\"9\" dis.place=\"above\" startid=\"#o1\"/>\
         </measure></section>"
    ));
    assert!(score
        .spanners
        .iter()
        .all(|s| !matches!(s.kind, SpannerKind::OctaveShift { .. })));
}

// ─── Ornaments and the implied-accidental table ─────────────────────

#[test]
fn turn_consults_the_implied_accidental_table() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note pname=\"f\" oct=\"4\" dur=\"4\" accid=\"s\"/>\
         <note xml:id=\"n2\" pname=\"e\" oct=\"4\" dur=\"4\"/>\
         </layer></staff>\
         <turn startid=\"#n2\"/>\
         </measure></section>"
    ));
    let voice = &score.parts[0].measures[0].voices[0];
    let turn = voice.events[1]
        .expressions
        .iter()
        .find_map(|e| match e {
            Expression::Turn { form, upper, lower, .. } => Some((form, upper, lower)),
            _ => None,
        })
        .expect("second note should carry the turn");

    assert_eq!(*turn.0, TurnForm::Normal);
    // the upper neighbor is F, sharpened by the F# sounded just before
    let upper = turn.1.as_ref().unwrap();
    let accidental = upper.accidental.unwrap();
    assert_eq!(accidental.alter, 1.0);
    assert!(!accidental.visible);
    // the lower neighbor D carries nothing
    assert!(turn.2.as_ref().unwrap().accidental.is_none());
}

#[test]
fn delayed_turn_anchors_on_the_preceding_note() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note pname=\"c\" oct=\"4\" dur=\"4\"/>\
         <note pname=\"d\" oct=\"4\" dur=\"4\"/>\
         <note pname=\"e\" oct=\"4\" dur=\"2\"/>\
         </layer></staff>\
         <turn tstamp=\"1.75\" delayed=\"true\" staff=\"1\"/>\
         </measure></section>"
    ));
    let voice = &score.parts[0].measures[0].voices[0];
    // beat 1.75 hits no event, so the turn lands on the note before it
    assert!(voice.events[0]
        .expressions
        .iter()
        .any(|e| matches!(e, Expression::Turn { delayed: true, .. })));
    assert!(voice.events[1].expressions.is_empty());
}

#[test]
fn fermata_past_the_bar_sits_on_the_barline() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note pname=\"c\" oct=\"4\" dur=\"1\"/>\
         </layer></staff>\
         <fermata tstamp=\"5\" staff=\"1\"/>\
         </measure></section>"
    ));
    let measure = &score.parts[0].measures[0];
    assert!(measure.right_barline.as_ref().unwrap().fermata);
}

// ─── Arpeggios ──────────────────────────────────────────────────────

#[test]
fn multi_member_arpeggio_becomes_a_group_spanner() {
    let score = import(&format!(
        "{TWO_STAVES_44}<section><measure n=\"1\">\
         <staff n=\"1\"><layer n=\"1\">\
         <chord xml:id=\"c1\" dur=\"1\">\
         <note pname=\"c\" oct=\"5\"/><note pname=\"e\" oct=\"5\"/>\
         </chord></layer></staff>\
         <staff n=\"2\"><layer n=\"1\">\
         <chord xml:id=\"c2\" dur=\"1\">\
         <note pname=\"c\" oct=\"3\"/><note pname=\"g\" oct=\"3\"/>\
         </chord></layer></staff>\
         <arpeg plist=\"#c1 #c2\" order=\"up\"/>\
         </measure></section>"
    ));
    let group = find_spanner(&score, |k| matches!(k, SpannerKind::ArpeggioGroup { .. }));
    assert_eq!(group.events.len(), 2);
    for part in &score.parts {
        let chord = &part.measures[0].voices[0].events[0];
        assert!(chord
            .expressions
            .iter()
            .any(|e| matches!(e, Expression::Arpeggio { .. })));
    }
}

// ─── Tremolos ───────────────────────────────────────────────────────

#[test]
fn fingered_tremolo_links_its_pair() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <fTrem beams=\"3\">\
         <note pname=\"c\" oct=\"4\" dur=\"2\"/>\
         <note pname=\"e\" oct=\"4\" dur=\"2\"/>\
         </fTrem>\
         </layer></staff></measure></section>"
    ));
    let voice = &score.parts[0].measures[0].voices[0];
    assert_eq!(voice.events.len(), 2);
    let pair = find_spanner(&score, |k| matches!(k, SpannerKind::TremoloPair { strokes: 3 }));
    assert_eq!(pair.events, vec![voice.events[0].id, voice.events[1].id]);
    for event in &voice.events {
        assert!(event
            .expressions
            .iter()
            .any(|e| matches!(e, Expression::Tremolo { strokes: 3 })));
    }
}

#[test]
fn bowed_tremolo_marks_its_event() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <bTrem unitdur=\"16\"><note pname=\"c\" oct=\"4\" dur=\"2\"/></bTrem>\
         <note pname=\"d\" oct=\"4\" dur=\"2\"/>\
         </layer></staff></measure></section>"
    ));
    let voice = &score.parts[0].measures[0].voices[0];
    assert!(voice.events[0]
        .expressions
        .iter()
        .any(|e| matches!(e, Expression::Tremolo { strokes: 2 })));
}

// ─── Floating directions ────────────────────────────────────────────

#[test]
fn dynamics_resolve_to_the_event_at_their_beat() {
    let score = import(&format!(
        "{ONE_STAFF_44}<section><measure n=\"1\"><staff n=\"1\"><layer n=\"1\">\
         <note pname=\"c\" oct=\"4\" dur=\"4\"/>\
         <note pname=\"d\" oct=\"4\" dur=\"4\"/>\
         <note pname=\"e\" oct=\"4\" dur=\"2\"/>\
         </layer></staff>\
         <dynam tstamp=\"2\" staff=\"1\" place=\"below\">p</dynam>\
         </measure></section>"
    ));
    let measure = &score.parts[0].measures[0];
    assert_eq!(measure.directions.len(), 1);
    let direction = &measure.directions[0];
    assert_eq!(direction.offset, ql(1, 1));
    assert_eq!(direction.kind, DirectionKind::Dynamic("p".to_string()));
    assert_eq!(direction.placement, Some(Place::Below));
    assert_eq!(direction.target, Some(measure.voices[0].events[1].id));
    assert!(direction.mirror_of.is_none());
}

#[test]
fn directions_on_several_staves_mirror_the_owner() {
    let score = import(&format!(
        "{TWO_STAVES_44}<section><measure n=\"1\">\
         <staff n=\"1\"><layer n=\"1\"><note pname=\"c\" oct=\"5\" dur=\"1\"/></layer></staff>\
         <staff n=\"2\"><layer n=\"1\"><note pname=\"c\" oct=\"3\" dur=\"1\"/></layer></staff>\
         <dir tstamp=\"1\" staff=\"1 2\">dolce</dir>\
         </measure></section>"
    ));
    let owned = &score.parts[0].measures[0].directions[0];
    assert!(owned.mirror_of.is_none());
    let mirrored = &score.parts[1].measures[0].directions[0];
    assert_eq!(mirrored.mirror_of.as_deref(), Some("1"));
    assert_eq!(mirrored.kind, DirectionKind::Words("dolce".to_string()));
}

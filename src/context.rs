//! Shared conversion state threaded through the recursive translation.
//!
//! One instance exists per conversion and is owned exclusively by it:
//! the spanner registry, the per-staff harmonic state, the event-id
//! allocator, and the queue of spanners whose endpoints lie in a later
//! measure. Everything in here is mutable history, which is why a
//! converter instance is single-use.

use std::collections::HashMap;

use crate::model::{EventId, MeterSig, Ql};
use crate::spanner::SpannerRegistry;
use crate::staff_state::StaffState;

/// A range spanner whose end lies in a later measure, carried forward
/// until its countdown reaches zero.
#[derive(Debug, Clone)]
pub struct PendingSpanner {
    pub spanner_id: String,
    /// Staff the closing anchor belongs to
    pub staff: String,
    /// Measures still to cross before the target measure
    pub measures_remaining: u32,
    /// Offset of the closing anchor within the target measure
    pub target_offset: Ql,
}

/// Mutable shared context for one conversion.
pub struct Context {
    /// Staff label currently being translated
    pub staff: String,
    /// Meter currently in effect
    pub active_meter: Option<MeterSig>,
    pub registry: SpannerRegistry,
    /// Spanners waiting for a closing anchor in a later measure
    pub pending: Vec<PendingSpanner>,
    /// Slur labels from shorthand attributes, mapped to registry ids
    pub slur_labels: HashMap<String, String>,
    staff_states: HashMap<String, StaffState>,
    next_event_id: EventId,
}

impl Context {
    pub fn new() -> Self {
        Self {
            staff: String::from("1"),
            active_meter: None,
            registry: SpannerRegistry::new(),
            pending: Vec::new(),
            slur_labels: HashMap::new(),
            staff_states: HashMap::new(),
            next_event_id: 0,
        }
    }

    /// Allocate the next event identifier.
    pub fn next_event_id(&mut self) -> EventId {
        self.next_event_id += 1;
        self.next_event_id
    }

    /// The harmonic state of a staff, created lazily on first use.
    pub fn staff_state(&mut self, staff: &str) -> &mut StaffState {
        self.staff_states.entry(staff.to_string()).or_default()
    }

    /// Bar length of the active meter, when one is known.
    pub fn active_bar_length(&self) -> Option<Ql> {
        self.active_meter.map(|m| m.bar_length())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

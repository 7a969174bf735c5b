//! Registry of in-progress spanners.
//!
//! Range-indicating elements are resolved into spanners addressable by a
//! synthetic local identifier, independent of document order: the
//! preprocessor (or a measure handler) creates the spanner, and event
//! handlers attach themselves to it as the referenced elements are
//! reached during translation.

use std::collections::HashMap;

use crate::model::{EventId, Spanner, SpannerKind};

/// Side table from local spanner ids to in-progress spanners.
#[derive(Debug, Default)]
pub struct SpannerRegistry {
    spanners: Vec<Spanner>,
    by_id: HashMap<String, usize>,
    next_id: u32,
}

impl SpannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new spanner and return its local id. Ids come from a
    /// per-conversion counter, so they are deterministic.
    pub fn create(&mut self, kind: SpannerKind) -> String {
        self.next_id += 1;
        let id = format!("sp{}", self.next_id);
        self.by_id.insert(id.clone(), self.spanners.len());
        self.spanners.push(Spanner {
            id: id.clone(),
            kind,
            events: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<&Spanner> {
        self.by_id.get(id).map(|&i| &self.spanners[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Spanner> {
        let i = *self.by_id.get(id)?;
        Some(&mut self.spanners[i])
    }

    /// Attach an event to a spanner. A dangling id is dropped with a
    /// warning rather than failing the import.
    pub fn add_member(&mut self, id: &str, event: EventId) {
        match self.get_mut(id) {
            Some(spanner) => {
                if !spanner.events.contains(&event) {
                    spanner.events.push(event);
                }
            }
            None => log::warn!("Could not find spanner \"{id}\", dropping its attachment."),
        }
    }

    /// Re-home all memberships of `old` onto `new`. Used when a chord
    /// takes over the spanners of its contained notes.
    pub fn replace_member(&mut self, old: EventId, new: EventId) {
        for spanner in &mut self.spanners {
            for member in &mut spanner.events {
                if *member == old {
                    *member = new;
                }
            }
            spanner.events.dedup();
        }
    }

    pub fn len(&self) -> usize {
        self.spanners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spanners.is_empty()
    }

    /// Hand the finished spanners over, dropping any that never gained a
    /// member (a fully resolved spanner has at least one).
    pub fn into_spanners(self) -> Vec<Spanner> {
        self.spanners
            .into_iter()
            .filter(|s| {
                if s.events.is_empty() {
                    log::warn!("Dropping spanner \"{}\" with no spanned elements.", s.id);
                    false
                } else {
                    true
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_deterministic() {
        let mut registry = SpannerRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.create(SpannerKind::Slur), "sp1");
        assert_eq!(registry.create(SpannerKind::TrillExtension), "sp2");
    }

    #[test]
    fn membership_and_rehoming() {
        let mut registry = SpannerRegistry::new();
        let id = registry.create(SpannerKind::Slur);
        registry.add_member(&id, 10);
        registry.add_member(&id, 11);
        registry.add_member(&id, 10); // duplicate attach is a no-op
        assert_eq!(registry.get(&id).unwrap().events, vec![10, 11]);

        registry.replace_member(10, 42);
        assert_eq!(registry.get(&id).unwrap().events, vec![42, 11]);
    }

    #[test]
    fn empty_spanners_are_dropped_on_handoff() {
        let mut registry = SpannerRegistry::new();
        let keep = registry.create(SpannerKind::Slur);
        registry.create(SpannerKind::TrillExtension);
        registry.add_member(&keep, 1);
        let spanners = registry.into_spanners();
        assert_eq!(spanners.len(), 1);
        assert_eq!(spanners[0].id, keep);
    }
}

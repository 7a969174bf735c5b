//! meiscore — MEI importer and score conversion library.
//!
//! Converts documents in the Music Encoding Initiative (MEI) XML format
//! into a structured, time-ordered score model: parts, measures, voices,
//! events, and the spanners (slurs, octave shifts, wedges, brackets)
//! that link events across the piece. The importer resolves MEI's
//! cross-referencing mechanisms — by identifier, by member list, by
//! musical timestamp — before translation, so complex notation such as
//! ties, tuplets, ornaments, and cross-measure ranges imports faithfully.
//!
//! # Example
//! ```no_run
//! use meiscore::parse_mei;
//!
//! let xml = std::fs::read_to_string("path/to/score.mei").unwrap();
//! let score = parse_mei(&xml).unwrap();
//! println!("Parts: {}", score.parts.len());
//! println!("Measures: {}", score.measure_count());
//! println!("Spanners: {}", score.spanners.len());
//! ```

mod attributes;
mod beam;
mod context;
mod durations;
pub mod error;
mod measure;
pub mod model;
mod preprocess;
mod score;
mod spanner;
mod staff_state;
mod timestamp;
mod translate;

pub use error::MeiError;
pub use model::*;

use roxmltree::Document;

/// Parse an MEI document into a [`Score`].
pub fn parse_mei(xml: &str) -> error::Result<Score> {
    MeiImporter::new(xml).run()
}

/// A single-use converter for one MEI document.
///
/// Conversion accumulates mutable history — per-staff harmonic state and
/// in-progress spanners — so one importer converts one document, once:
/// [`run`](MeiImporter::run) consumes the instance.
pub struct MeiImporter<'a> {
    xml: &'a str,
}

impl<'a> MeiImporter<'a> {
    pub fn new(xml: &'a str) -> Self {
        Self { xml }
    }

    /// Run the conversion, consuming the importer.
    pub fn run(self) -> error::Result<Score> {
        // MEI files may carry a DOCTYPE declaration, so DTDs must be allowed
        let options = roxmltree::ParsingOptions {
            allow_dtd: true,
            ..Default::default()
        };
        let doc = Document::parse_with_options(self.xml, options)
            .map_err(|e| MeiError::Validity(format!("XML parse error: {e}")))?;
        score::convert(&doc)
    }
}

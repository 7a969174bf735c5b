//! Error taxonomy for MEI conversion.
//!
//! Only conditions that abort the conversion of a whole document are
//! errors. An attribute value outside its known vocabulary is *not* an
//! error: translators warn through the `log` facade and fall back to a
//! default, so a single bad value never sinks the import.

use thiserror::Error;

/// A fatal condition encountered while converting an MEI document.
#[derive(Debug, Error)]
pub enum MeiError {
    /// The input is not well-formed XML, has the wrong root element, or
    /// lacks the structure needed to even begin (e.g. no staff
    /// definitions anywhere in the score).
    #[error("invalid MEI document: {0}")]
    Validity(String),

    /// A required attribute combination is absent on an element that
    /// cannot be defaulted (tuplet without both ratio numbers, staff
    /// without a number, layer without a number or override).
    #[error("invalid attribute usage: {0}")]
    Attribute(String),

    /// A container element's structural contract is violated (e.g. a
    /// tremolo wrapping the wrong number of notes).
    #[error("invalid element structure: {0}")]
    Element(String),

    /// An invariant the engine itself guarantees was violated. This
    /// signals a defect in the converter, not in the input.
    #[error("internal converter error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MeiError>;

//! RIFF/WAVE container handling
//!
//! Format description and the incremental extractor that separates
//! container headers from PCM payload across arbitrary fragment boundaries.

pub mod extractor;
pub mod format;

pub use extractor::{ContainerExtractor, Extracted, ExtractionSummary, ExtractorState};
pub use format::{ContainerFormat, WAVE_FORMAT_PCM};

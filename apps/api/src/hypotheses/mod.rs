//! Hypothesis extraction from assistant text.

pub mod extractor;

pub use extractor::{extract_hypotheses, parse_hypothesis_id, MAX_ID_LEN};

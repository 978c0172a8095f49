//! Output formatting module
//!
//! Renders session summaries, status records, batch plans and pool usage.

mod formatter;

pub use formatter::{OutputFormat, ResultFormatter};

//! In-memory records: building them for output and parsing them on input.

mod input;
mod output;

pub use input::{uncompress_record, RecordInput};
pub use output::{dictionary_record, RecordOutput};

//! # hipo-evio
//!
//! Record container engine for the evio version 6 / HIPO event format.
//!
//! Events are opaque byte sequences packed into records, which are
//! optionally compressed (LZ4 or gzip) and framed by a file header and
//! trailer. [`Writer`] and [`WriterMT`] produce files or buffers,
//! [`Reader`] indexes them and serves events by ordinal. In buffer mode the
//! reader also exposes each event as an [`EvioNode`] tree that can be
//! inspected and edited in place.
//!
//! Version 4 data can be read; versions 2 and 3 cannot.

pub mod buffer;
pub mod compress;
pub mod config;
pub mod error;
pub mod header;
pub mod index;
pub mod node;
pub mod order;
pub mod reader;
pub mod record;
mod sink;
pub mod swap;
pub mod writer;
pub mod writer_mt;

pub use buffer::{buffered_reader, buffered_writer, SharedBuffer};
pub use compress::CompressionType;
pub use config::{Flavor, ReaderOptions, WriterOptions};
pub use error::{EvioError, Result};
pub use header::{FileHeader, HeaderType, RecordHeader};
pub use index::{FileEventIndex, RecordPosition};
pub use node::{DataType, EvioNode, StructureHeader, StructureType};
pub use order::ByteOrder;
pub use reader::{Reader, ReaderState};
pub use record::{RecordInput, RecordOutput};
pub use sink::WriteTarget;
pub use swap::{swap_event, swap_event_in_place, swap_event_into};
pub use writer::Writer;
pub use writer_mt::WriterMT;

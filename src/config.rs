//! Writer and reader options
//!
//! Both option structs derive serde with `#[serde(default)]`, so a partial
//! JSON document fills in the rest from [`Default`]:
//!
//! ```rust
//! use hipo_evio::{CompressionType, WriterOptions};
//!
//! let opts: WriterOptions = serde_json::from_str(r#"{"compression": "gzip"}"#).unwrap();
//! assert_eq!(opts.compression, CompressionType::Gzip);
//! assert_eq!(opts.max_event_count, 1_000_000);
//! ```

use serde::{Deserialize, Serialize};

use crate::compress::CompressionType;
use crate::error::{EvioError, Result};
use crate::header::HeaderType;
use crate::order::ByteOrder;

/// Default maximum number of events per record
pub const DEFAULT_MAX_EVENT_COUNT: u32 = 1_000_000;
/// Default maximum uncompressed record size (8 MiB)
pub const DEFAULT_MAX_RECORD_BYTES: usize = 8 * 1024 * 1024;
/// Default number of record slots in the concurrent writer's ring
pub const DEFAULT_RING_SIZE: usize = 16;

/// Which family of header type codes to write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    Evio,
    Hipo,
}

impl Flavor {
    pub fn record_type(self) -> HeaderType {
        match self {
            Flavor::Evio => HeaderType::EvioRecord,
            Flavor::Hipo => HeaderType::HipoRecord,
        }
    }
}

/// Options shared by [`Writer`](crate::Writer) and [`WriterMT`](crate::WriterMT)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    /// Byte order of everything written
    pub byte_order: ByteOrder,
    /// Evio or hipo header type codes
    pub flavor: Flavor,
    /// Rotate the record after this many events
    pub max_event_count: u32,
    /// Rotate the record before its uncompressed size passes this
    pub max_record_bytes: usize,
    /// Codec applied to each record body
    pub compression: CompressionType,
    /// Compression worker threads (concurrent writer only)
    pub compression_threads: usize,
    /// Record slots in flight (concurrent writer only)
    pub ring_size: usize,
    /// XML dictionary stored ahead of the first data record
    pub dictionary: Option<String>,
    /// Event stored ahead of the first data record
    pub first_event: Option<Vec<u8>>,
    /// Write a record length/count index after the trailer
    pub add_trailer_index: bool,
    /// Split file number written into the file header
    pub file_number: u32,
    /// File header user register
    pub file_user_register: u64,
    /// First user register of every data record
    pub record_user_register1: u64,
    /// Second user register of every data record
    pub record_user_register2: u64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::native(),
            flavor: Flavor::Evio,
            max_event_count: DEFAULT_MAX_EVENT_COUNT,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            compression: CompressionType::None,
            compression_threads: 1,
            ring_size: DEFAULT_RING_SIZE,
            dictionary: None,
            first_event: None,
            add_trailer_index: true,
            file_number: 1,
            file_user_register: 0,
            record_user_register1: 0,
            record_user_register2: 0,
        }
    }
}

impl WriterOptions {
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_max_event_count(mut self, count: u32) -> Self {
        self.max_event_count = count;
        self
    }

    pub fn with_max_record_bytes(mut self, bytes: usize) -> Self {
        self.max_record_bytes = bytes;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.compression_threads = threads;
        self
    }

    pub fn with_ring_size(mut self, slots: usize) -> Self {
        self.ring_size = slots;
        self
    }

    pub fn with_dictionary(mut self, xml: impl Into<String>) -> Self {
        self.dictionary = Some(xml.into());
        self
    }

    pub fn with_first_event(mut self, event: Vec<u8>) -> Self {
        self.first_event = Some(event);
        self
    }

    pub fn with_flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Reject settings no writer can honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_event_count == 0 {
            return Err(EvioError::unsupported("max_event_count must be at least 1"));
        }
        if self.ring_size == 0 || self.compression_threads == 0 {
            return Err(EvioError::unsupported("ring size and thread count must be at least 1"));
        }
        if !self.compression.is_available() {
            return Err(EvioError::unsupported(format!(
                "{} support is not compiled in",
                self.compression
            )));
        }
        if let Some(first) = &self.first_event {
            if first.len() % 4 != 0 {
                return Err(EvioError::InvalidEvent("first event is not word aligned".into()));
            }
        }
        Ok(())
    }

    pub fn has_dictionary_record(&self) -> bool {
        self.dictionary.is_some() || self.first_event.is_some()
    }
}

/// Options for [`Reader`](crate::Reader)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    /// Walk every record header even when an index is available
    pub force_scan: bool,
    /// Fail with `OutOfSequence` when record numbers are not consecutive
    pub check_record_number_sequence: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_format_limits() {
        let opts = WriterOptions::default();
        assert_eq!(opts.max_event_count, 1_000_000);
        assert_eq!(opts.max_record_bytes, 8 * 1024 * 1024);
        assert_eq!(opts.ring_size, 16);
        assert_eq!(opts.compression_threads, 1);
        opts.validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let opts: ReaderOptions = serde_json::from_str(r#"{"force_scan": true}"#).unwrap();
        assert!(opts.force_scan);
        assert!(!opts.check_record_number_sequence);

        let w: WriterOptions = serde_json::from_str(r#"{"flavor": "hipo", "byte_order": "big"}"#).unwrap();
        assert_eq!(w.flavor.record_type(), HeaderType::HipoRecord);
        assert_eq!(w.byte_order, ByteOrder::Big);
    }

    #[test]
    fn rejects_empty_ring() {
        assert!(WriterOptions::default().with_ring_size(0).validate().is_err());
        let odd = WriterOptions::default().with_first_event(vec![1, 2, 3]);
        assert!(matches!(odd.validate(), Err(EvioError::InvalidEvent(_))));
    }
}

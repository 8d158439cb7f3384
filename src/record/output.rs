//! Building records for writing.

use crate::compress::{compress, CompressionType};
use crate::config::WriterOptions;
use crate::error::{EvioError, Result};
use crate::header::{padded, padding, HeaderType, RecordHeader, HEADER_SIZE_BYTES};
use crate::order::ByteOrder;

/// One record being filled with events.
///
/// Events are kept in insertion order together with their length index.
/// [`RecordOutput::build`] seals the record into an internal byte buffer that
/// survives [`RecordOutput::reset`], so a ring of these can be reused
/// without reallocating.
#[derive(Debug, Clone)]
pub struct RecordOutput {
    header: RecordHeader,
    compression: CompressionType,
    max_event_count: u32,
    max_record_bytes: usize,
    index: Vec<u8>,
    events: Vec<u8>,
    user_header: Vec<u8>,
    body: Vec<u8>,
    binary: Vec<u8>,
}

impl RecordOutput {
    pub fn new(order: ByteOrder, compression: CompressionType, header_type: HeaderType) -> Self {
        Self {
            header: RecordHeader::new(header_type.record(), order),
            compression,
            max_event_count: crate::config::DEFAULT_MAX_EVENT_COUNT,
            max_record_bytes: crate::config::DEFAULT_MAX_RECORD_BYTES,
            index: Vec::new(),
            events: Vec::new(),
            user_header: Vec::new(),
            body: Vec::new(),
            binary: Vec::new(),
        }
    }

    pub fn with_limits(mut self, max_event_count: u32, max_record_bytes: usize) -> Self {
        self.max_event_count = max_event_count.max(1);
        self.max_record_bytes = max_record_bytes;
        self
    }

    pub fn from_options(opts: &WriterOptions) -> Self {
        let mut out = Self::new(opts.byte_order, opts.compression, opts.flavor.record_type())
            .with_limits(opts.max_event_count, opts.max_record_bytes);
        out.header.user_register1 = opts.record_user_register1;
        out.header.user_register2 = opts.record_user_register2;
        out
    }

    pub fn order(&self) -> ByteOrder {
        self.header.order
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut RecordHeader {
        &mut self.header
    }

    pub fn event_count(&self) -> u32 {
        (self.index.len() / 4) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.event_count() >= self.max_event_count
    }

    /// Size of the record if built uncompressed right now.
    pub fn uncompressed_size(&self) -> usize {
        HEADER_SIZE_BYTES + self.index.len() + padded(self.user_header.len()) + self.events.len()
    }

    /// Would an event of `len` bytes be accepted?
    ///
    /// An empty record takes any one event, whatever its size.
    pub fn has_room_for(&self, len: usize) -> bool {
        if self.is_empty() {
            return true;
        }
        !self.is_full() && self.uncompressed_size() + 4 + len <= self.max_record_bytes
    }

    pub fn add_event(&mut self, event: &[u8]) -> Result<()> {
        if event.is_empty() || event.len() % 4 != 0 {
            return Err(EvioError::InvalidEvent(format!(
                "event length {} is not a positive multiple of 4",
                event.len()
            )));
        }
        if self.is_full() {
            return Err(EvioError::InvalidEvent(format!(
                "record already holds {} events",
                self.max_event_count
            )));
        }
        if !self.has_room_for(event.len()) {
            return Err(EvioError::InvalidEvent(format!(
                "event of {} bytes does not fit a record limited to {} bytes",
                event.len(),
                self.max_record_bytes
            )));
        }
        self.header.order.put_u32(&mut self.index, event.len() as u32);
        self.events.extend_from_slice(event);
        Ok(())
    }

    pub fn set_user_header(&mut self, bytes: &[u8]) {
        self.user_header.clear();
        self.user_header.extend_from_slice(bytes);
    }

    pub fn set_record_number(&mut self, number: u32) {
        self.header.record_number = number;
        self.header.record_number_valid = true;
    }

    pub fn index_bytes(&self) -> &[u8] {
        &self.index
    }

    pub fn user_header(&self) -> &[u8] {
        &self.user_header
    }

    pub fn event_bytes(&self) -> &[u8] {
        &self.events
    }

    /// Seal the record: fill in the header, compress the body if asked to
    /// and return the finished bytes.
    pub fn build(&mut self) -> Result<&[u8]> {
        let h = &mut self.header;
        h.entries = (self.index.len() / 4) as u32;
        h.index_length = self.index.len() as u32;
        h.user_header_length = self.user_header.len() as u32;
        h.data_length = self.events.len() as u32;
        h.compression = self.compression;

        self.body.clear();
        self.body.extend_from_slice(&self.index);
        self.body.extend_from_slice(&self.user_header);
        self.body.resize(self.body.len() + padding(self.user_header.len()), 0);
        self.body.extend_from_slice(&self.events);

        self.binary.clear();
        self.binary.resize(HEADER_SIZE_BYTES, 0);
        if self.compression.is_compressed() {
            let packed = compress(self.compression, &self.body)?;
            h.compressed_data_length = packed.len() as u32;
            self.binary.extend_from_slice(&packed);
            self.binary.resize(self.binary.len() + padding(packed.len()), 0);
        } else {
            h.compressed_data_length = 0;
            self.binary.extend_from_slice(&self.body);
        }
        h.record_length = self.binary.len() as u32;
        h.write(&mut self.binary[..HEADER_SIZE_BYTES])?;
        Ok(&self.binary)
    }

    /// Bytes produced by the last [`build`](Self::build).
    pub fn binary(&self) -> &[u8] {
        &self.binary
    }

    /// Empty the record for reuse, keeping its settings and allocations.
    pub fn reset(&mut self) {
        let (r1, r2) = (self.header.user_register1, self.header.user_register2);
        self.header.reset();
        self.header.user_register1 = r1;
        self.header.user_register2 = r2;
        self.index.clear();
        self.events.clear();
        self.user_header.clear();
        self.binary.clear();
    }
}

/// Build the uncompressed record that carries a dictionary and/or first
/// event: the dictionary (NUL padded to a word boundary) is event 0, the
/// first event follows it.
pub fn dictionary_record(
    order: ByteOrder,
    header_type: HeaderType,
    dictionary: Option<&str>,
    first_event: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let mut record = RecordOutput::new(order, CompressionType::None, header_type).with_limits(2, usize::MAX);
    if let Some(xml) = dictionary {
        let mut bytes = xml.as_bytes().to_vec();
        bytes.resize(padded(bytes.len().max(1)), 0);
        record.add_event(&bytes)?;
        record.header.has_dictionary = true;
    }
    if let Some(event) = first_event {
        record.add_event(event)?;
        record.header.has_first_event = true;
    }
    Ok(record.build()?.to_vec())
}

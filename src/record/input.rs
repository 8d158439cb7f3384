//! Parsing records read back from a file or buffer.

use std::io::{Read, Seek};
use std::ops::Range;

use crate::buffer::{read_at, read_up_to};
use crate::compress::{decompress, decompress_into, CompressionType};
use crate::error::{EvioError, Result};
use crate::header::{RecordHeader, HEADER_SIZE_BYTES};

/// One record, decompressed, with its event boundaries resolved.
///
/// Parsing is all-or-nothing: on error the previous contents of a reused
/// `RecordInput` are left as they were.
#[derive(Debug, Clone, Default)]
pub struct RecordInput {
    header: RecordHeader,
    /// Uncompressed body: index, padded user header, events.
    data: Vec<u8>,
    user_header: Range<usize>,
    events: Vec<Range<usize>>,
}

impl RecordInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the record starting at `offset` in `bytes`.
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self> {
        let header = RecordHeader::read(bytes, offset)?;
        let available = bytes.len() - offset;
        if (header.record_length as usize) > available {
            return Err(EvioError::format(format!(
                "record at {offset} claims {} bytes, only {available} available",
                header.record_length
            )));
        }
        let record = &bytes[offset..offset + header.record_length as usize];
        Self::from_record_bytes(header, record)
    }

    /// Parse in place of the current contents.
    pub fn read_record(&mut self, bytes: &[u8], offset: usize) -> Result<()> {
        *self = Self::parse(bytes, offset)?;
        Ok(())
    }

    /// Read and parse the record at file position `pos`.
    pub fn read_from<R: Read + Seek>(src: &mut R, pos: u64) -> Result<Self> {
        let head = read_up_to(src, pos, HEADER_SIZE_BYTES)?;
        let header = RecordHeader::read(&head, 0)?;
        let record = read_at(src, pos, header.record_length as usize).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => EvioError::format(format!(
                "record at {pos} claims {} bytes past end of file",
                header.record_length
            )),
            _ => EvioError::Io(e),
        })?;
        let mut header = header;
        header.position = pos;
        Self::from_record_bytes(header, &record)
    }

    fn from_record_bytes(header: RecordHeader, record: &[u8]) -> Result<Self> {
        let hl = header.header_length as usize;
        if hl > record.len() {
            return Err(EvioError::format("record shorter than its header"));
        }
        let payload = &record[hl..];
        match header.version {
            6 => Self::parse_v6(header, payload),
            4 | 5 => Self::parse_v4(header, payload),
            v => Err(EvioError::unsupported(format!("reading version {v} records"))),
        }
    }

    fn parse_v6(header: RecordHeader, payload: &[u8]) -> Result<Self> {
        header.check_lengths()?;
        let data = if header.is_compressed() {
            let packed = payload
                .get(..header.compressed_data_length as usize)
                .ok_or_else(|| EvioError::format("compressed payload truncated"))?;
            decompress(header.compression, packed, header.body_length())?
        } else {
            payload.to_vec()
        };

        let index_len = header.index_length as usize;
        let user_start = index_len;
        let events_start = index_len + header.padded_user_header_length();
        let events = if index_len == 0 {
            bank_ranges(&data, events_start, header.entries, header.order)?
        } else {
            if index_len != header.entries as usize * 4 {
                return Err(EvioError::format(format!(
                    "index of {index_len} bytes for {} events",
                    header.entries
                )));
            }
            let mut ranges = Vec::with_capacity(header.entries as usize);
            let mut pos = events_start;
            for entry in data[..index_len].chunks_exact(4) {
                let len = header.order.read_u32(entry) as usize;
                ranges.push(pos..pos + len);
                pos += len;
            }
            if pos != data.len() {
                return Err(EvioError::format(format!(
                    "event index sums to {} bytes, record holds {}",
                    pos - events_start,
                    data.len() - events_start
                )));
            }
            ranges
        };

        Ok(Self {
            user_header: user_start..user_start + header.user_header_length as usize,
            header,
            data,
            events,
        })
    }

    fn parse_v4(header: RecordHeader, payload: &[u8]) -> Result<Self> {
        let data = payload
            .get(..header.data_length as usize)
            .ok_or_else(|| EvioError::format("block truncated"))?
            .to_vec();
        let events = bank_ranges(&data, 0, header.entries, header.order)?;
        Ok(Self {
            header,
            data,
            user_header: 0..0,
            events,
        })
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    pub fn entries(&self) -> u32 {
        self.events.len() as u32
    }

    /// Event `i`, or `None` past the end.
    pub fn event(&self, i: usize) -> Option<&[u8]> {
        self.events.get(i).map(|r| &self.data[r.clone()])
    }

    pub fn event_len(&self, i: usize) -> Option<usize> {
        self.events.get(i).map(|r| r.len())
    }

    /// Offset of event `i` within the uncompressed body.
    pub fn event_offset(&self, i: usize) -> Option<usize> {
        self.events.get(i).map(|r| r.start)
    }

    pub fn events(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.events.iter().map(|r| &self.data[r.clone()])
    }

    pub fn user_header(&self) -> &[u8] {
        &self.data[self.user_header.clone()]
    }

    /// The record nested in the user header (dictionary/first event), if any.
    pub fn user_header_record(&self) -> Result<Option<RecordInput>> {
        let user = self.user_header();
        if user.len() < HEADER_SIZE_BYTES {
            return Ok(None);
        }
        Self::parse(user, 0).map(Some)
    }

    /// Index, padded user header and events, decompressed.
    pub fn uncompressed_data(&self) -> &[u8] {
        &self.data
    }
}

/// Append the record at `offset` in `src` to `dst` in uncompressed form,
/// with a header rewritten to match. Returns the header as found in `src`.
/// On error `dst` is left unchanged.
pub fn uncompress_record(src: &[u8], offset: usize, dst: &mut Vec<u8>) -> Result<RecordHeader> {
    let header = RecordHeader::read(src, offset)?;
    let len = header.record_length as usize;
    let record = src
        .get(offset..offset + len)
        .ok_or_else(|| EvioError::format(format!("record at {offset} claims {len} bytes past end of buffer")))?;

    if header.version != 6 {
        dst.extend_from_slice(record);
        return Ok(header);
    }
    header.check_lengths()?;

    let hl = header.header_length as usize;
    let start = dst.len();
    dst.extend_from_slice(&record[..hl]);
    let payload = &record[hl..];
    if header.is_compressed() {
        let packed = &payload[..header.compressed_data_length as usize];
        if let Err(e) = decompress_into(header.compression, packed, header.body_length(), dst) {
            dst.truncate(start);
            return Err(e);
        }
    } else {
        dst.extend_from_slice(payload);
    }

    let mut plain = header.clone();
    plain.compression = CompressionType::None;
    plain.compressed_data_length = 0;
    plain.record_length = (dst.len() - start) as u32;
    if let Err(e) = plain.write(&mut dst[start..start + HEADER_SIZE_BYTES]) {
        dst.truncate(start);
        return Err(e);
    }
    Ok(header)
}

/// Event boundaries found by walking bank lengths, for records without an index.
fn bank_ranges(data: &[u8], start: usize, count: u32, order: crate::order::ByteOrder) -> Result<Vec<Range<usize>>> {
    let mut ranges = Vec::with_capacity(count as usize);
    let mut pos = start;
    for i in 0..count {
        let words = order
            .word_at(data, pos)
            .ok_or_else(|| EvioError::format(format!("event {i} starts past end of record")))?;
        let len = (words as usize + 1) * 4;
        if pos + len > data.len() {
            return Err(EvioError::format("bad bank length"));
        }
        ranges.push(pos..pos + len);
        pos += len;
    }
    Ok(ranges)
}

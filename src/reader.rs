//! Reading evio files and buffers.
//!
//! A [`Reader`] locates every record once when opened and then serves
//! events by global ordinal, either randomly or through a sequential cursor.
//!
//! Files are indexed from the trailer's record index when there is one,
//! then from the file header's index, and otherwise by walking every record
//! header. Only the record holding the requested event is kept in memory.
//!
//! Buffers are always walked. Compressed buffers are expanded first, and
//! every event is scanned into an [`EvioNode`] tree. In buffer mode
//! uncompressed data can also be edited in place with
//! [`Reader::remove_structure`] and [`Reader::add_structure`]. Each edit
//! poisons every node issued before it and rescans the buffer.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::{debug, trace, warn};

use crate::buffer::{buffered_reader, read_at, read_up_to, SharedBuffer};
use crate::config::ReaderOptions;
use crate::error::{EvioError, Result};
use crate::header::{
    padded, FileHeader, RecordHeader, EVENT_COUNT_OFFSET, HEADER_LENGTH_OFFSET, HEADER_SIZE_BYTES,
    INDEX_ARRAY_OFFSET, RECORD_LENGTH_OFFSET, UNCOMPRESSED_LENGTH_OFFSET, V4_HEADER_SIZE_BYTES,
};
use crate::index::{FileEventIndex, RecordPosition};
use crate::node::EvioNode;
use crate::order::ByteOrder;
use crate::record::{uncompress_record, RecordInput};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    Unopened,
    Scanning,
    Ready,
    Closed,
}

enum Source {
    None,
    File {
        file: BufReader<File>,
        header: Option<FileHeader>,
    },
    Buffer {
        buffer: SharedBuffer,
        offset: usize,
    },
}

/// Everything one scan produces, committed to the reader only on success.
struct Scan {
    positions: Vec<RecordPosition>,
    index: FileEventIndex,
    nodes: Vec<EvioNode>,
    first_header: Option<RecordHeader>,
    /// A version 4 dictionary event found ahead of the data events.
    v4_dictionary: Option<Vec<u8>>,
}

impl Scan {
    fn new() -> Self {
        Self {
            positions: Vec::new(),
            index: FileEventIndex::new(),
            nodes: Vec::new(),
            first_header: None,
            v4_dictionary: None,
        }
    }
}

pub struct Reader {
    opts: ReaderOptions,
    state: ReaderState,
    source: Source,
    positions: Vec<RecordPosition>,
    event_index: FileEventIndex,
    event_nodes: Vec<EvioNode>,
    first_header: Option<RecordHeader>,
    byte_order: ByteOrder,
    version: u32,
    compressed: bool,
    /// Events to skip at the start of record 0 (a version 4 dictionary).
    skip_first: usize,
    v4_dictionary: Option<Vec<u8>>,
    record: RecordInput,
    loaded: Option<usize>,
    scratch: Vec<u8>,
    /// Sequential cursor, a copy of `event_index` stepped by next/prev.
    cursor: FileEventIndex,
    cursor_started: bool,
    last_random: Option<usize>,
    extracted: bool,
    dictionary: Option<String>,
    first_event: Option<Vec<u8>>,
}

impl Reader {
    /// An unopened reader; call [`open_file`](Self::open_file) or
    /// [`set_buffer`](Self::set_buffer) next.
    pub fn new(opts: ReaderOptions) -> Self {
        Self {
            opts,
            state: ReaderState::Unopened,
            source: Source::None,
            positions: Vec::new(),
            event_index: FileEventIndex::new(),
            event_nodes: Vec::new(),
            first_header: None,
            byte_order: ByteOrder::default(),
            version: 0,
            compressed: false,
            skip_first: 0,
            v4_dictionary: None,
            record: RecordInput::new(),
            loaded: None,
            scratch: Vec::new(),
            cursor: FileEventIndex::new(),
            cursor_started: false,
            last_random: None,
            extracted: false,
            dictionary: None,
            first_event: None,
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ReaderOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, opts: ReaderOptions) -> Result<Self> {
        let mut reader = Self::new(opts);
        reader.open_file(path)?;
        Ok(reader)
    }

    pub fn from_buffer(bytes: Vec<u8>) -> Result<Self> {
        Self::from_buffer_with(bytes, 0, ReaderOptions::default())
    }

    /// Read the records starting at `offset` in `bytes`.
    pub fn from_buffer_with(bytes: Vec<u8>, offset: usize, opts: ReaderOptions) -> Result<Self> {
        let mut reader = Self::new(opts);
        reader.set_buffer(bytes, offset)?;
        Ok(reader)
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.opts
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            ReaderState::Ready => Ok(()),
            _ => Err(EvioError::Closed),
        }
    }

    /// Forget the current source and everything derived from it.
    fn reset(&mut self) {
        for ev in &self.event_nodes {
            ev.mark_obsolete();
        }
        self.source = Source::None;
        self.positions.clear();
        self.event_index.clear();
        self.event_nodes.clear();
        self.first_header = None;
        self.compressed = false;
        self.skip_first = 0;
        self.v4_dictionary = None;
        self.record = RecordInput::new();
        self.loaded = None;
        self.cursor.clear();
        self.cursor_started = false;
        self.last_random = None;
        self.extracted = false;
        self.dictionary = None;
        self.first_event = None;
    }

    fn commit(&mut self, scan: Scan) {
        if let Some(h) = &scan.first_header {
            self.byte_order = h.order;
            self.version = h.version;
        }
        self.positions = scan.positions;
        let resume = self.cursor_started.then(|| self.cursor.event_number());
        self.cursor = scan.index.clone();
        self.event_index = scan.index;
        self.last_random = self.last_random.filter(|&r| r < self.event_index.max_events());
        // a rescan keeps the cursor on the same ordinal where it still exists
        match resume {
            Some(at) if self.cursor.max_events() > 0 => {
                self.cursor.set_event(at.min(self.cursor.max_events() - 1));
            }
            _ => self.cursor_started = false,
        }
        self.event_nodes = scan.nodes;
        self.first_header = scan.first_header;
        self.skip_first = usize::from(scan.v4_dictionary.is_some());
        self.v4_dictionary = scan.v4_dictionary;
        self.record = RecordInput::new();
        self.loaded = None;
        self.state = ReaderState::Ready;
    }

    // ---------------------------------------------------------------- files

    /// Open and index a file.
    pub fn open_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.reset();
        self.state = ReaderState::Scanning;
        let result = self.scan_file(path.as_ref());
        if result.is_err() {
            self.source = Source::None;
            self.state = ReaderState::Closed;
        }
        result
    }

    fn scan_file(&mut self, path: &Path) -> Result<()> {
        let mut file = buffered_reader(path)?;
        let size = file.get_ref().metadata()?.len();
        let head = read_up_to(&mut file, 0, HEADER_SIZE_BYTES)?;
        if head.len() < V4_HEADER_SIZE_BYTES {
            return Err(EvioError::format(format!("{} is too small to hold evio data", path.display())));
        }

        let (scan, header) = if FileHeader::is_file_header(&head) {
            let fh = FileHeader::read(&head)?;
            self.byte_order = fh.order;
            self.version = fh.version;
            let scan = self.index_file(&mut file, size, &fh)?;
            (scan, Some(fh))
        } else {
            let first = RecordHeader::read(&head, 0)?;
            if first.version < 4 {
                return Err(EvioError::unsupported(format!("reading version {} files", first.version)));
            }
            debug!(version = first.version, "no file header, walking records");
            (self.force_scan_file(&mut file, size, 0)?, None)
        };

        debug!(
            path = %path.display(),
            records = scan.positions.len(),
            events = scan.index.max_events(),
            "opened file"
        );
        self.compressed = scan.first_header.as_ref().is_some_and(RecordHeader::is_compressed);
        self.source = Source::File { file, header };
        self.commit(scan);
        Ok(())
    }

    fn index_file(&self, file: &mut BufReader<File>, size: u64, fh: &FileHeader) -> Result<Scan> {
        let first = fh.length();
        if !self.opts.force_scan {
            if fh.has_trailer_with_index && fh.trailer_position > 0 {
                match self.scan_trailer_index(file, fh) {
                    Ok(scan) => {
                        debug!(records = scan.positions.len(), "indexed from trailer");
                        return Ok(scan);
                    }
                    Err(e) => warn!(error = %e, "unusable trailer index, trying next strategy"),
                }
            }
            if fh.has_index() {
                let index = read_at(file, fh.header_length as u64, fh.index_length as usize)?;
                match self.positions_from_index(file, &index, first, size, fh.order) {
                    Ok(scan) => {
                        debug!(records = scan.positions.len(), "indexed from file header");
                        return Ok(scan);
                    }
                    Err(e) => warn!(error = %e, "unusable file header index, walking records"),
                }
            }
        }
        self.force_scan_file(file, size, first)
    }

    fn scan_trailer_index(&self, file: &mut BufReader<File>, fh: &FileHeader) -> Result<Scan> {
        let head = read_at(file, fh.trailer_position, HEADER_SIZE_BYTES)?;
        let trailer = RecordHeader::read(&head, 0)?;
        if !trailer.is_trailer() {
            return Err(EvioError::format("trailer position does not point at a trailer"));
        }
        let index = read_at(
            file,
            fh.trailer_position + trailer.header_length as u64,
            trailer.index_length as usize,
        )?;
        self.positions_from_index(file, &index, fh.length(), fh.trailer_position, fh.order)
    }

    /// Turn (record length, event count) pairs into record positions.
    fn positions_from_index(
        &self,
        file: &mut BufReader<File>,
        index: &[u8],
        first: u64,
        end: u64,
        order: ByteOrder,
    ) -> Result<Scan> {
        if index.len() % 8 != 0 {
            return Err(EvioError::format(format!("record index of {} bytes", index.len())));
        }
        let mut scan = Scan::new();
        let mut pos = first;
        for pair in index.chunks_exact(8) {
            let len = order.read_u32(&pair[..4]);
            let count = order.read_u32(&pair[4..]);
            if len == 0 || pos + len as u64 > end {
                return Err(EvioError::format(format!("indexed record at {pos} of {len} bytes runs past {end}")));
            }
            scan.positions.push(RecordPosition::new(pos, len, count));
            scan.index.add_event_size(count);
            pos += len as u64;
        }
        if let Some(p) = scan.positions.first() {
            let head = read_at(file, p.position, HEADER_SIZE_BYTES)?;
            scan.first_header = Some(RecordHeader::read(&head, 0)?);
        }
        Ok(scan)
    }

    fn force_scan_file(&self, file: &mut BufReader<File>, size: u64, start: u64) -> Result<Scan> {
        let mut scan = Scan::new();
        let mut pos = start;
        let mut expected = 1;
        while size - pos >= V4_HEADER_SIZE_BYTES as u64 {
            let head = read_up_to(file, pos, HEADER_SIZE_BYTES)?;
            let h = RecordHeader::read(&head, 0)?;
            if self.opts.check_record_number_sequence {
                if h.record_number != expected {
                    return Err(EvioError::OutOfSequence {
                        expected,
                        found: h.record_number,
                    });
                }
                expected += 1;
            }
            if h.record_length == 0 || pos + h.record_length as u64 > size {
                return Err(EvioError::format(format!(
                    "record at {pos} claims {} bytes, file has {} left",
                    h.record_length,
                    size - pos
                )));
            }
            if !h.is_trailer() {
                if scan.positions.is_empty() && h.version == 4 && h.has_dictionary {
                    let block = RecordInput::read_from(file, pos)?;
                    scan.v4_dictionary = block.event(0).map(<[u8]>::to_vec);
                }
                let skip = u32::from(scan.positions.is_empty() && scan.v4_dictionary.is_some());
                scan.positions.push(RecordPosition::new(pos, h.record_length, h.entries));
                scan.index.add_event_size(h.entries.saturating_sub(skip));
                if scan.first_header.is_none() {
                    scan.first_header = Some(h.clone());
                }
            }
            pos += h.record_length as u64;
            if h.is_last_record {
                break;
            }
        }
        debug!(records = scan.positions.len(), "walked record headers");
        Ok(scan)
    }

    // -------------------------------------------------------------- buffers

    /// Read a new buffer, replacing whatever this reader was reading.
    pub fn set_buffer(&mut self, bytes: Vec<u8>, offset: usize) -> Result<()> {
        self.set_compressed_buffer(bytes, offset).map(|_| ())
    }

    /// Like [`set_buffer`](Self::set_buffer) but returns the buffer the
    /// reader ends up using. When compressed data does not fit the
    /// allocation it arrived in, that is a new, larger buffer.
    pub fn set_compressed_buffer(&mut self, bytes: Vec<u8>, offset: usize) -> Result<SharedBuffer> {
        self.reset();
        self.state = ReaderState::Scanning;
        match self.scan_buffer(bytes, offset) {
            Ok(buffer) => Ok(buffer),
            Err(e) => {
                self.state = ReaderState::Closed;
                Err(e)
            }
        }
    }

    /// Current buffer in buffer mode.
    pub fn buffer(&self) -> Option<SharedBuffer> {
        match &self.source {
            Source::Buffer { buffer, .. } => Some(buffer.clone()),
            _ => None,
        }
    }

    fn scan_buffer(&mut self, mut bytes: Vec<u8>, offset: usize) -> Result<SharedBuffer> {
        if offset > bytes.len() {
            return Err(EvioError::format("buffer offset past end of data"));
        }
        let first = RecordHeader::read(&bytes, offset)?;
        if first.version < 4 {
            return Err(EvioError::unsupported(format!("reading version {} buffers", first.version)));
        }
        let (stored, expanded, compressed) = hop_records(&bytes, offset)?;
        let order = first.order;

        if !compressed {
            bytes.truncate(offset + stored);
            let buffer = SharedBuffer::new(bytes, order);
            let scan = self.index_buffer(&buffer, offset)?;
            return Ok(self.commit_buffer(scan, buffer, offset, false, first));
        }

        if bytes.capacity() - offset >= expanded {
            return self.expand_in_place(bytes, offset, expanded, first);
        }
        let mut bigger = Vec::with_capacity(offset + expanded + 4096);
        bigger.extend_from_slice(&bytes[..offset]);
        expand_records(&bytes, offset, &mut bigger)?;
        debug!(bytes = expanded, "expanded compressed buffer into a new allocation");
        let buffer = SharedBuffer::new(bigger, order);
        let scan = self.index_buffer(&buffer, offset)?;
        Ok(self.commit_buffer(scan, buffer, offset, true, first))
    }

    /// Expand through scratch space, then copy back over the allocation the
    /// data arrived in. Nodes are scanned against the scratch copy and
    /// shifted into place afterwards.
    fn expand_in_place(
        &mut self,
        mut bytes: Vec<u8>,
        offset: usize,
        expanded: usize,
        first: RecordHeader,
    ) -> Result<SharedBuffer> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let expanded_ok = expand_records(&bytes, offset, &mut scratch);
        let temp = SharedBuffer::new(scratch, first.order);
        let scan = expanded_ok.and_then(|_| self.index_buffer(&temp, 0));
        let mut scan = match scan {
            Ok(scan) => scan,
            Err(e) => {
                self.scratch = temp.replace(Vec::new());
                return Err(e);
            }
        };
        bytes.truncate(offset);
        bytes.extend_from_slice(&temp.bytes());
        self.scratch = temp.replace(Vec::new());

        let buffer = SharedBuffer::new(bytes, first.order);
        for n in &scan.nodes {
            n.shift(offset as isize).set_buffer(&buffer);
        }
        for p in &mut scan.positions {
            p.position += offset as u64;
        }
        debug!(bytes = expanded, "expanded compressed buffer in place");
        Ok(self.commit_buffer(scan, buffer, offset, true, first))
    }

    fn commit_buffer(
        &mut self,
        mut scan: Scan,
        buffer: SharedBuffer,
        offset: usize,
        compressed: bool,
        first: RecordHeader,
    ) -> SharedBuffer {
        // the header as it arrived, not as expanded
        scan.first_header = Some(first);
        self.compressed = compressed;
        self.source = Source::Buffer {
            buffer: buffer.clone(),
            offset,
        };
        debug!(
            records = scan.positions.len(),
            events = scan.index.max_events(),
            compressed,
            "scanned buffer"
        );
        self.commit(scan);
        buffer
    }

    /// Walk uncompressed records from `start`, extracting every event.
    fn index_buffer(&self, buffer: &SharedBuffer, start: usize) -> Result<Scan> {
        let mut scan = Scan::new();
        let limit = buffer.limit();
        let mut pos = start;
        let mut expected = 1;
        let mut event_count = 0;

        while limit - pos >= V4_HEADER_SIZE_BYTES {
            let h = RecordHeader::read(&buffer.bytes(), pos)?;
            if self.opts.check_record_number_sequence {
                if h.record_number != expected {
                    return Err(EvioError::OutOfSequence {
                        expected,
                        found: h.record_number,
                    });
                }
                expected += 1;
            }
            let len = h.record_length as usize;
            if len == 0 || len > limit - pos {
                return Err(EvioError::format(format!(
                    "not enough data to read record at {pos}: needs {len} bytes, {} left",
                    limit - pos
                )));
            }

            if !h.is_trailer() {
                let mut event_pos = pos + h.header_length as usize;
                if h.version == 6 {
                    event_pos += h.index_length as usize + padded(h.user_header_length as usize);
                }
                let mut skip = 0;
                for i in 0..h.entries as usize {
                    let node = EvioNode::extract_event(buffer, pos, event_pos, pos + len, event_count + i - skip)
                        .map_err(|e| match e {
                            EvioError::Format(m) => EvioError::format(format!("event {i} of record at {pos}: {m}")),
                            other => other,
                        })?;
                    if node.total_bytes() < 8 || event_pos + node.total_bytes() > pos + len {
                        return Err(EvioError::format("bad bank length"));
                    }
                    event_pos += node.total_bytes();
                    if scan.positions.is_empty() && i == 0 && h.version == 4 && h.has_dictionary {
                        scan.v4_dictionary = Some(node.structure_bytes()?);
                        skip = 1;
                        continue;
                    }
                    scan.nodes.push(node);
                }
                scan.positions.push(RecordPosition::new(pos as u64, h.record_length, h.entries));
                scan.index.add_event_size(h.entries - skip as u32);
                event_count += h.entries as usize - skip;
                if scan.first_header.is_none() {
                    scan.first_header = Some(h.clone());
                }
            }

            pos += len;
            if h.is_last_record {
                break;
            }
        }
        Ok(scan)
    }

    // ---------------------------------------------------------- inspection

    pub fn event_count(&self) -> usize {
        self.event_index.max_events()
    }

    pub fn record_count(&self) -> usize {
        self.positions.len()
    }

    pub fn record_positions(&self) -> &[RecordPosition] {
        &self.positions
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Was the data compressed when it was read?
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_file(&self) -> bool {
        matches!(self.source, Source::File { .. })
    }

    pub fn file_header(&self) -> Option<&FileHeader> {
        match &self.source {
            Source::File { header, .. } => header.as_ref(),
            _ => None,
        }
    }

    pub fn first_record_header(&self) -> Option<&RecordHeader> {
        self.first_header.as_ref()
    }

    /// Index of the record currently held in memory.
    pub fn current_record(&self) -> Option<usize> {
        self.loaded
    }

    /// Events in the record currently held in memory.
    pub fn record_event_count(&self) -> usize {
        self.loaded.map_or(0, |_| self.record.entries() as usize)
    }

    pub fn has_dictionary(&self) -> bool {
        match self.file_header() {
            Some(fh) => fh.has_dictionary,
            None => self.v4_dictionary.is_some() || self.first_header.as_ref().is_some_and(|h| h.has_dictionary),
        }
    }

    pub fn has_first_event(&self) -> bool {
        match self.file_header() {
            Some(fh) => fh.has_first_event,
            None => self.first_header.as_ref().is_some_and(|h| h.version == 6 && h.has_first_event),
        }
    }

    /// User header of the file header, or of the first record for buffers.
    pub fn read_user_header(&mut self) -> Result<Vec<u8>> {
        self.ensure_ready()?;
        match &mut self.source {
            Source::File {
                file,
                header: Some(fh),
                ..
            } => {
                let pos = fh.header_length as u64 + fh.index_length as u64;
                Ok(read_at(file, pos, fh.user_header_length as usize)?)
            }
            _ => {
                let Some(h) = self.first_header.clone() else {
                    return Ok(Vec::new());
                };
                if h.version != 6 {
                    return Ok(Vec::new());
                }
                let first = self.positions.first().map_or(0, |p| p.position);
                let record = self.load_record_at(first)?;
                Ok(record.user_header().to_vec())
            }
        }
    }

    /// The XML dictionary, if one was stored.
    pub fn dictionary(&mut self) -> Result<Option<String>> {
        self.extract_dictionary()?;
        Ok(self.dictionary.clone())
    }

    /// The first event stored with the dictionary, if any.
    pub fn first_event(&mut self) -> Result<Option<Vec<u8>>> {
        self.extract_dictionary()?;
        Ok(self.first_event.clone())
    }

    fn extract_dictionary(&mut self) -> Result<()> {
        self.ensure_ready()?;
        if self.extracted {
            return Ok(());
        }
        if let Some(bank) = &self.v4_dictionary {
            // string data follows the two bank header words
            self.dictionary = Some(decode_dictionary(bank.get(8..).unwrap_or_default()));
        } else if self.has_dictionary() || self.has_first_event() {
            let has_dict = self.has_dictionary();
            let user = self.read_user_header()?;
            if user.len() >= HEADER_SIZE_BYTES {
                let record = RecordInput::parse(&user, 0)?;
                let mut i = 0;
                if has_dict {
                    self.dictionary = record.event(0).map(decode_dictionary);
                    i = 1;
                }
                if self.has_first_event() {
                    self.first_event = record.event(i).map(<[u8]>::to_vec);
                }
            }
        }
        self.extracted = true;
        Ok(())
    }

    // -------------------------------------------------------------- access

    /// Parse record `index` (0-based) and keep it as the current record.
    pub fn read_record(&mut self, index: usize) -> Result<&RecordInput> {
        self.ensure_ready()?;
        let pos = self
            .positions
            .get(index)
            .ok_or_else(|| EvioError::NotFound(format!("record {index} of {}", self.positions.len())))?
            .position;
        if self.loaded != Some(index) {
            self.record = self.load_record_at(pos)?;
            self.loaded = Some(index);
        }
        Ok(&self.record)
    }

    fn load_record_at(&mut self, pos: u64) -> Result<RecordInput> {
        match &mut self.source {
            Source::File { file, .. } => RecordInput::read_from(file, pos),
            Source::Buffer { buffer, .. } => RecordInput::parse(&buffer.bytes(), pos as usize),
            Source::None => Err(EvioError::Closed),
        }
    }

    fn event_at(&mut self, index: usize) -> Result<Option<Vec<u8>>> {
        let Some((record, in_record)) = self.event_index.locate(index) else {
            return Ok(None);
        };
        if let Source::Buffer { .. } = self.source {
            return self.event_nodes[index].structure_bytes().map(Some);
        }
        let skip = if record == 0 { self.skip_first } else { 0 };
        let rec = self.read_record(record)?;
        Ok(rec.event(in_record + skip).map(<[u8]>::to_vec))
    }

    /// Event `index` (0-based over the whole file or buffer), or `None`
    /// past the end.
    pub fn get_event(&mut self, index: usize) -> Result<Option<Vec<u8>>> {
        self.ensure_ready()?;
        let event = self.event_at(index)?;
        if event.is_some() {
            self.last_random = Some(index);
        }
        Ok(event)
    }

    /// Put the cursor on the last randomly read event if no sequential call
    /// has happened yet. Returns false when there is nothing to start from.
    fn start_cursor(&mut self) -> bool {
        if self.cursor_started {
            return true;
        }
        match self.last_random {
            Some(r) => {
                self.cursor.set_event(r);
                self.cursor_started = true;
                true
            }
            None => false,
        }
    }

    /// Advance the cursor and return the event it now stands on.
    fn step_next(&mut self) -> Option<usize> {
        if !self.start_cursor() {
            if self.cursor.max_events() == 0 {
                return None;
            }
            self.cursor.set_event(0);
            self.cursor_started = true;
            return Some(0);
        }
        if !self.cursor.can_advance() {
            return None;
        }
        if self.cursor.advance() {
            trace!(record = self.cursor.record_number(), "cursor entered record");
        }
        Some(self.cursor.event_number())
    }

    fn step_prev(&mut self) -> Option<usize> {
        if !self.start_cursor() || !self.cursor.can_retreat() {
            return None;
        }
        if self.cursor.retreat() {
            trace!(record = self.cursor.record_number(), "cursor entered record");
        }
        Some(self.cursor.event_number())
    }

    /// Index [`get_next_event`](Self::get_next_event) would return.
    fn peek_next(&self) -> usize {
        if self.cursor_started {
            self.cursor.event_number() + 1
        } else {
            self.last_random.map_or(0, |r| r + 1)
        }
    }

    /// Next event of the sequential cursor.
    ///
    /// Before the first sequential call the cursor starts just after the
    /// last randomly read event. After that, random reads leave it alone.
    pub fn get_next_event(&mut self) -> Result<Option<Vec<u8>>> {
        self.ensure_ready()?;
        match self.step_next() {
            Some(idx) => self.event_at(idx),
            None => Ok(None),
        }
    }

    /// Event before the one last returned by the sequential cursor.
    pub fn get_prev_event(&mut self) -> Result<Option<Vec<u8>>> {
        self.ensure_ready()?;
        match self.step_prev() {
            Some(idx) => self.event_at(idx),
            None => Ok(None),
        }
    }

    pub fn has_next(&self) -> bool {
        self.peek_next() < self.event_count()
    }

    pub fn has_prev(&self) -> bool {
        if self.cursor_started {
            self.cursor.can_retreat()
        } else {
            self.last_random.is_some_and(|r| r > 0)
        }
    }

    pub fn num_events_remaining(&self) -> usize {
        self.event_count().saturating_sub(self.peek_next())
    }

    /// Node of event `index`. Buffer mode only.
    pub fn event_node(&self, index: usize) -> Result<Option<EvioNode>> {
        self.ensure_ready()?;
        if self.is_file() {
            return Err(EvioError::unsupported("event nodes are only available for buffers"));
        }
        Ok(self.event_nodes.get(index).cloned())
    }

    /// Node of the next event, advancing the same cursor as
    /// [`get_next_event`](Self::get_next_event). `None` when reading a file.
    pub fn next_event_node(&mut self) -> Result<Option<EvioNode>> {
        self.ensure_ready()?;
        if self.is_file() {
            return Ok(None);
        }
        Ok(self.step_next().and_then(|idx| self.event_nodes.get(idx).cloned()))
    }

    pub fn event_nodes(&self) -> &[EvioNode] {
        &self.event_nodes
    }

    // ---------------------------------------------------------------- edits

    fn edit_preconditions(&self) -> Result<(SharedBuffer, usize)> {
        self.ensure_ready()?;
        let Source::Buffer { buffer, offset } = &self.source else {
            return Err(EvioError::unsupported("structures can only be edited in buffers"));
        };
        if self.compressed {
            return Err(EvioError::unsupported("cannot edit a buffer of compressed data"));
        }
        if self.version != 6 {
            return Err(EvioError::unsupported(format!("cannot edit version {} data", self.version)));
        }
        Ok((buffer.clone(), *offset))
    }

    /// Remove `node` (and everything in it) from the buffer.
    ///
    /// Every node issued before the call is obsolete afterwards. Removing an
    /// already obsolete node does nothing.
    pub fn remove_structure(&mut self, node: &EvioNode) -> Result<SharedBuffer> {
        let (buffer, offset) = self.edit_preconditions()?;
        if node.is_obsolete() {
            return Ok(buffer);
        }
        let mut found = false;
        for ev in &self.event_nodes {
            if ev.all_nodes()?.contains(node) {
                found = true;
                break;
            }
        }
        if !found {
            return Err(EvioError::NotFound("node is not part of any event in this buffer".into()));
        }

        let len = node.total_bytes();
        let pos = node.position();
        let record_pos = node.record_position();
        let parent = node.parent()?;
        let (_, in_record) = self
            .event_index
            .locate(node.place())
            .ok_or_else(|| EvioError::NotFound(format!("event {}", node.place())))?;
        let entry_pos = index_entry(&buffer, record_pos, in_record);

        node.mark_obsolete();
        buffer.bytes_mut().drain(pos..pos + len);
        if let Some(parent) = &parent {
            parent.update_lengths(-((len / 4) as i32))?;
        }

        let mut record_shrink = len;
        match (entry_pos, &parent) {
            (Some(entry_pos), Some(_)) => {
                let entry = buffer.word(entry_pos).unwrap_or(0);
                buffer.put_word(entry_pos, entry.saturating_sub(len as u32));
            }
            (Some(entry_pos), None) => {
                // a whole event goes, and its index entry with it
                buffer.bytes_mut().drain(entry_pos..entry_pos + 4);
                record_shrink += 4;
                let index_len = buffer.word(record_pos + INDEX_ARRAY_OFFSET).unwrap_or(4);
                buffer.put_word(record_pos + INDEX_ARRAY_OFFSET, index_len - 4);
            }
            (None, _) => {}
        }
        if parent.is_none() {
            let entries = buffer.word(record_pos + EVENT_COUNT_OFFSET).unwrap_or(1);
            buffer.put_word(record_pos + EVENT_COUNT_OFFSET, entries - 1);
        }
        let words = buffer.word(record_pos + RECORD_LENGTH_OFFSET).unwrap_or(0);
        buffer.put_word(record_pos + RECORD_LENGTH_OFFSET, words - (record_shrink / 4) as u32);
        let data_len = buffer.word(record_pos + UNCOMPRESSED_LENGTH_OFFSET).unwrap_or(0);
        buffer.put_word(record_pos + UNCOMPRESSED_LENGTH_OFFSET, data_len - len as u32);

        debug!(bytes = len, position = pos, "removed structure");
        self.rescan(buffer, offset)
    }

    /// Append `structure` (evio bank, segment or tagsegment bytes in
    /// `order`) as the last child of event `event_index`.
    ///
    /// The data moves into a new, larger buffer, which is returned. Every
    /// node issued before the call is obsolete afterwards.
    pub fn add_structure(&mut self, event_index: usize, structure: &[u8], order: ByteOrder) -> Result<SharedBuffer> {
        let (buffer, offset) = self.edit_preconditions()?;
        if structure.len() < 8 || structure.len() % 4 != 0 {
            return Err(EvioError::InvalidEvent(format!(
                "structure of {} bytes is not evio data",
                structure.len()
            )));
        }
        if order != self.byte_order {
            return Err(EvioError::InvalidEvent(format!(
                "structure is {order:?} endian, buffer is {:?}",
                self.byte_order
            )));
        }
        let event = self
            .event_nodes
            .get(event_index)
            .cloned()
            .ok_or_else(|| EvioError::NotFound(format!("event {event_index} of {}", self.event_nodes.len())))?;
        let (_, in_record) = self
            .event_index
            .locate(event_index)
            .ok_or_else(|| EvioError::NotFound(format!("event {event_index}")))?;

        let add = structure.len();
        let end = event.data_position() + 4 * event.data_length() as usize;
        let record_pos = event.record_position();

        let grown = {
            let old = buffer.bytes();
            let mut grown = Vec::with_capacity(old.len() + add);
            grown.extend_from_slice(&old[..end]);
            grown.extend_from_slice(structure);
            grown.extend_from_slice(&old[end..]);
            grown
        };
        let grown = SharedBuffer::new(grown, buffer.order());
        event.set_buffer(&grown);
        if let Err(e) = event.update_lengths((add / 4) as i32) {
            // the reader still serves the old buffer
            event.set_buffer(&buffer);
            return Err(e);
        }

        if let Some(entry_pos) = index_entry(&grown, record_pos, in_record) {
            let entry = grown.word(entry_pos).unwrap_or(0);
            grown.put_word(entry_pos, entry + add as u32);
        }
        let words = grown.word(record_pos + RECORD_LENGTH_OFFSET).unwrap_or(0);
        grown.put_word(record_pos + RECORD_LENGTH_OFFSET, words + (add / 4) as u32);
        let data_len = grown.word(record_pos + UNCOMPRESSED_LENGTH_OFFSET).unwrap_or(0);
        grown.put_word(record_pos + UNCOMPRESSED_LENGTH_OFFSET, data_len + add as u32);

        debug!(bytes = add, event = event_index, "added structure");
        self.rescan(grown, offset)
    }

    /// Poison every issued node and index the (edited) buffer again.
    fn rescan(&mut self, buffer: SharedBuffer, offset: usize) -> Result<SharedBuffer> {
        for ev in &self.event_nodes {
            ev.mark_obsolete();
        }
        match self.index_buffer(&buffer, offset) {
            Ok(scan) => {
                self.source = Source::Buffer {
                    buffer: buffer.clone(),
                    offset,
                };
                self.commit(scan);
                self.extracted = false;
                Ok(buffer)
            }
            Err(e) => {
                self.state = ReaderState::Closed;
                Err(e)
            }
        }
    }

    /// Release the source. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.state == ReaderState::Closed {
            return;
        }
        self.source = Source::None;
        self.state = ReaderState::Closed;
        debug!("reader closed");
    }
}

/// Sum stored and expanded lengths of the records from `offset`, and note
/// whether any is compressed.
fn hop_records(bytes: &[u8], offset: usize) -> Result<(usize, usize, bool)> {
    let mut pos = offset;
    let (mut stored, mut expanded, mut compressed) = (0, 0, false);
    while bytes.len() - pos >= V4_HEADER_SIZE_BYTES {
        let h = RecordHeader::read(bytes, pos)?;
        let len = h.record_length as usize;
        if len == 0 || len > bytes.len() - pos {
            return Err(EvioError::format(format!(
                "not enough data to read record at {pos}: needs {len} bytes, {} left",
                bytes.len() - pos
            )));
        }
        stored += len;
        if h.version == 6 {
            h.check_lengths()?;
            expanded += h.uncompressed_record_length();
            compressed |= h.is_compressed();
        } else {
            expanded += len;
        }
        pos += len;
        if h.is_last_record {
            break;
        }
    }
    Ok((stored, expanded, compressed))
}

/// Position of the index entry for event `in_record` of the record at
/// `record_pos`, if the record carries an index.
fn index_entry(buffer: &SharedBuffer, record_pos: usize, in_record: usize) -> Option<usize> {
    let index_len = buffer.word(record_pos + INDEX_ARRAY_OFFSET)?;
    if index_len == 0 {
        return None;
    }
    let header_len = buffer.word(record_pos + HEADER_LENGTH_OFFSET)? as usize * 4;
    Some(record_pos + header_len + 4 * in_record)
}

/// Append every record from `offset` to `dst`, uncompressed.
fn expand_records(src: &[u8], offset: usize, dst: &mut Vec<u8>) -> Result<()> {
    let mut pos = offset;
    while src.len() - pos >= V4_HEADER_SIZE_BYTES {
        let h = uncompress_record(src, pos, dst)?;
        pos += h.record_length as usize;
        if h.is_last_record {
            break;
        }
    }
    Ok(())
}

fn decode_dictionary(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0 && b != 4)
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("state", &self.state)
            .field("records", &self.positions.len())
            .field("events", &self.event_count())
            .field("order", &self.byte_order)
            .field("version", &self.version)
            .field("compressed", &self.compressed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterOptions;
    use crate::writer::Writer;

    fn bank(order: ByteOrder, tag: u16, ints: &[u32]) -> Vec<u8> {
        let mut e = Vec::new();
        order.put_u32(&mut e, ints.len() as u32 + 1);
        order.put_u32(&mut e, (tag as u32) << 16 | 0x0100);
        for &i in ints {
            order.put_u32(&mut e, i);
        }
        e
    }

    fn buffer_of(n: u32, opts: WriterOptions) -> Vec<u8> {
        let order = opts.byte_order;
        let mut w = Writer::to_buffer(opts).unwrap();
        for i in 0..n {
            w.add_event(&bank(order, i as u16, &[i, i * 10])).unwrap();
        }
        w.into_buffer().unwrap()
    }

    #[test]
    fn cursor_follows_random_access_until_started() {
        let mut r = Reader::from_buffer(buffer_of(10, WriterOptions::default())).unwrap();
        let order = r.byte_order();
        r.get_event(5).unwrap();
        let next = r.get_next_event().unwrap().unwrap();
        assert_eq!(order.read_u32(&next[8..]), 6);

        // once started, random reads no longer move the cursor
        r.get_event(1).unwrap();
        let next = r.get_next_event().unwrap().unwrap();
        assert_eq!(order.read_u32(&next[8..]), 7);
    }

    #[test]
    fn prev_after_three_nexts() {
        let mut r = Reader::from_buffer(buffer_of(5, WriterOptions::default())).unwrap();
        let _first = r.get_next_event().unwrap();
        let second = r.get_next_event().unwrap();
        let _third = r.get_next_event().unwrap();
        assert_eq!(r.get_prev_event().unwrap(), second);
        assert!(r.has_prev());
    }

    #[test]
    fn cursor_limits() {
        let mut r = Reader::from_buffer(buffer_of(2, WriterOptions::default())).unwrap();
        assert!(r.get_prev_event().unwrap().is_none());
        assert_eq!(r.num_events_remaining(), 2);
        assert!(r.get_next_event().unwrap().is_some());
        assert!(r.get_next_event().unwrap().is_some());
        assert!(!r.has_next());
        assert!(r.get_next_event().unwrap().is_none());
        assert_eq!(r.num_events_remaining(), 0);
        assert!(r.get_prev_event().unwrap().is_some());
    }

    #[test]
    fn cursor_steps_across_records() {
        let opts = WriterOptions::default().with_max_event_count(2);
        let mut r = Reader::from_buffer(buffer_of(5, opts)).unwrap();
        let order = r.byte_order();
        let value = |ev: Option<Vec<u8>>| order.read_u32(&ev.unwrap()[8..]);
        assert_eq!(r.record_count(), 3);

        for i in 0..5 {
            assert_eq!(value(r.get_next_event().unwrap()), i);
        }
        assert!(!r.has_next());
        for i in (0..4).rev() {
            assert_eq!(value(r.get_prev_event().unwrap()), i);
        }
        assert!(!r.has_prev());
        assert!(r.get_prev_event().unwrap().is_none());
        assert_eq!(r.num_events_remaining(), 4);
    }

    #[test]
    fn event_overrunning_its_record_is_rejected() {
        use crate::node::{DataType, StructureHeader};

        let order = ByteOrder::Big;
        let inner = bank(order, 2, &[7, 8]);
        let mut outer = Vec::new();
        StructureHeader::bank(1, 0, DataType::Bank, (inner.len() / 4) as u32)
            .write(&mut outer, order)
            .unwrap();
        outer.extend_from_slice(&inner);

        let opts = WriterOptions::default().with_byte_order(order).with_max_event_count(1);
        let mut w = Writer::to_buffer(opts).unwrap();
        w.add_event(&outer).unwrap();
        w.add_event(&outer).unwrap();
        let mut bytes = w.into_buffer().unwrap();

        // claim two more words for the first event; they belong to record 2
        let h = RecordHeader::read(&bytes, 0).unwrap();
        let event_pos = h.header_length as usize + h.index_length as usize;
        let words = order.read_u32(&bytes[event_pos..]);
        order.write_u32(&mut bytes[event_pos..], words + 2);

        let err = Reader::from_buffer(bytes).unwrap_err();
        assert!(matches!(&err, EvioError::Format(m) if m.contains("bad bank length")), "{err}");
    }

    #[test]
    fn failed_add_keeps_event_on_current_buffer() {
        let order = ByteOrder::native();
        let mut r = Reader::from_buffer(buffer_of(2, WriterOptions::default())).unwrap();
        let before = r.buffer().unwrap();
        let snapshot = before.to_vec();

        r.event_nodes[0].mark_obsolete();
        let err = r.add_structure(0, &bank(order, 9, &[1]), order).unwrap_err();
        assert!(matches!(err, EvioError::Obsolete));
        assert!(SharedBuffer::ptr_eq(&r.event_nodes[0].buffer(), &before));
        assert!(SharedBuffer::ptr_eq(&r.buffer().unwrap(), &before));
        assert_eq!(before.to_vec(), snapshot);
    }

    #[test]
    fn sequence_check() {
        let bytes = buffer_of(3, WriterOptions::default().with_max_event_count(1));
        let opts = ReaderOptions {
            check_record_number_sequence: true,
            ..Default::default()
        };
        let r = Reader::from_buffer_with(bytes.clone(), 0, opts.clone()).unwrap();
        assert_eq!(r.record_count(), 3);

        // renumber the second record
        let second = RecordHeader::read(&bytes, 0).unwrap().record_length as usize;
        let mut bad = bytes;
        let order = RecordHeader::read(&bad, 0).unwrap().order;
        order.write_u32(&mut bad[second + 4..], 5);
        let err = Reader::from_buffer_with(bad, 0, opts).unwrap_err();
        assert!(matches!(err, EvioError::OutOfSequence { expected: 2, found: 5 }));
    }

    #[test]
    fn closed_reader_refuses_access() {
        let mut r = Reader::from_buffer(buffer_of(1, WriterOptions::default())).unwrap();
        r.close();
        r.close();
        assert_eq!(r.state(), ReaderState::Closed);
        assert!(matches!(r.get_event(0), Err(EvioError::Closed)));
    }

    #[test]
    fn buffer_offset_is_respected() {
        let mut bytes = vec![0xaa; 12];
        bytes.extend_from_slice(&buffer_of(3, WriterOptions::default()));
        let mut r = Reader::from_buffer_with(bytes, 12, ReaderOptions::default()).unwrap();
        assert_eq!(r.event_count(), 3);
        assert_eq!(r.record_positions()[0].position, 12);
        assert!(r.get_event(2).unwrap().is_some());
        assert_eq!(r.buffer().unwrap().bytes()[0], 0xaa);
    }

    #[cfg(feature = "compression-lz4")]
    #[test]
    fn compressed_buffer_expanded_in_place_or_reallocated() {
        use crate::compress::CompressionType;
        let opts = WriterOptions::default().with_compression(CompressionType::Lz4);
        let order = opts.byte_order;
        let packed = buffer_of(50, opts);

        // tight allocation: must move to a new buffer
        let mut r = Reader::new(ReaderOptions::default());
        let buf = r.set_compressed_buffer(packed.clone(), 0).unwrap();
        assert!(r.is_compressed());
        assert!(buf.limit() > packed.len());
        let ev = r.get_event(49).unwrap().unwrap();
        assert_eq!(order.read_u32(&ev[8..]), 49);

        // roomy allocation: expanded through scratch space
        let mut roomy = Vec::with_capacity(1 << 16);
        roomy.extend_from_slice(&[1, 2, 3, 4]);
        roomy.extend_from_slice(&packed);
        let buf = r.set_compressed_buffer(roomy, 4).unwrap();
        assert_eq!(buf.bytes()[..4], [1, 2, 3, 4]);
        let node = r.event_node(10).unwrap().unwrap();
        assert!(SharedBuffer::ptr_eq(&node.buffer(), &buf));
        assert_eq!(node.int_data().unwrap(), vec![10, 100]);
        assert!(matches!(r.remove_structure(&node), Err(EvioError::Unsupported(_))));
    }
}

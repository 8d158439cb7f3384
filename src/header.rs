//! Record, trailer and file header codec.
//!
//! Every header carries the magic word `0xc0da0100` in word 7, which doubles
//! as the byte order sentinel: the order is always discovered from the data,
//! never trusted from the caller. Headers of evio versions 2 through 6 decode
//! into the same version-neutral [`RecordHeader`]; only version 6 is written.

use crate::compress::CompressionType;
use crate::error::{EvioError, Result};
use crate::order::ByteOrder;

pub const HEADER_SIZE_WORDS: usize = 14;
pub const HEADER_SIZE_BYTES: usize = 56;
/// Version 1-4 block headers are 8 words.
pub const V4_HEADER_SIZE_BYTES: usize = 32;
pub const HEADER_MAGIC: u32 = 0xc0da_0100;
pub const CURRENT_VERSION: u32 = 6;

/// "EVIO" file type id.
pub const EVIO_FILE_ID: u32 = 0x4556_494F;
/// "HIPO" file type id.
pub const HIPO_FILE_ID: u32 = 0x4345_5248;

// Byte offsets of record header words.
pub const RECORD_LENGTH_OFFSET: usize = 0;
pub const RECORD_NUMBER_OFFSET: usize = 4;
pub const HEADER_LENGTH_OFFSET: usize = 8;
pub const EVENT_COUNT_OFFSET: usize = 12;
pub const INDEX_ARRAY_OFFSET: usize = 16;
pub const BIT_INFO_OFFSET: usize = 20;
pub const USER_LENGTH_OFFSET: usize = 24;
pub const MAGIC_OFFSET: usize = 28;
pub const UNCOMPRESSED_LENGTH_OFFSET: usize = 32;
pub const COMPRESSION_TYPE_OFFSET: usize = 36;
pub const REGISTER1_OFFSET: usize = 40;
pub const REGISTER2_OFFSET: usize = 48;

// Byte offsets of file header words that differ from the record layout.
pub const FILE_ID_OFFSET: usize = 0;
pub const FILE_NUMBER_OFFSET: usize = 4;
pub const FILE_RECORD_COUNT_OFFSET: usize = 12;
pub const FILE_USER_REGISTER_OFFSET: usize = 32;
pub const FILE_TRAILER_POSITION_OFFSET: usize = 40;
pub const FILE_USER_INT1_OFFSET: usize = 48;
pub const FILE_USER_INT2_OFFSET: usize = 52;

// Bit-info word.
const VERSION_MASK: u32 = 0xff;
const DICTIONARY_BIT: u32 = 1 << 8;
const LAST_RECORD_BIT: u32 = 1 << 9;
const EVENT_TYPE_SHIFT: u32 = 10;
const EVENT_TYPE_MASK: u32 = 0xf;
const FIRST_EVENT_BIT: u32 = 1 << 14;
const RECORD_NUMBER_VALID_BIT: u32 = 1 << 16;
const USER_PAD_SHIFT: u32 = 20;
const DATA_PAD_SHIFT: u32 = 22;
const COMPRESSED_PAD_SHIFT: u32 = 24;
const HEADER_TYPE_SHIFT: u32 = 28;

const FILE_FIRST_EVENT_BIT: u32 = 1 << 9;
const FILE_TRAILER_WITH_INDEX_BIT: u32 = 1 << 10;

const COMPRESSED_LENGTH_MASK: u32 = 0x0fff_ffff;

/// Bytes needed to pad `len` to a 4-byte boundary.
#[inline]
pub const fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// `len` rounded up to a 4-byte boundary.
#[inline]
pub const fn padded(len: usize) -> usize {
    len + padding(len)
}

/// General header type, top nibble of the bit-info word.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum HeaderType {
    #[default]
    EvioRecord = 0,
    EvioFile = 1,
    EvioFileExtended = 2,
    EvioTrailer = 3,
    HipoRecord = 4,
    HipoFile = 5,
    HipoFileExtended = 6,
    HipoTrailer = 7,
}

impl HeaderType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::EvioRecord),
            1 => Some(Self::EvioFile),
            2 => Some(Self::EvioFileExtended),
            3 => Some(Self::EvioTrailer),
            4 => Some(Self::HipoRecord),
            5 => Some(Self::HipoFile),
            6 => Some(Self::HipoFileExtended),
            7 => Some(Self::HipoTrailer),
            _ => None,
        }
    }

    pub fn is_trailer(self) -> bool {
        matches!(self, Self::EvioTrailer | Self::HipoTrailer)
    }

    pub fn is_file(self) -> bool {
        matches!(
            self,
            Self::EvioFile | Self::EvioFileExtended | Self::HipoFile | Self::HipoFileExtended
        )
    }

    pub fn is_hipo(self) -> bool {
        matches!(
            self,
            Self::HipoRecord | Self::HipoFile | Self::HipoFileExtended | Self::HipoTrailer
        )
    }

    /// Trailer type of the same family.
    pub fn trailer(self) -> Self {
        if self.is_hipo() {
            Self::HipoTrailer
        } else {
            Self::EvioTrailer
        }
    }

    /// Record type of the same family.
    pub fn record(self) -> Self {
        if self.is_hipo() {
            Self::HipoRecord
        } else {
            Self::EvioRecord
        }
    }

    /// File type of the same family.
    pub fn file(self) -> Self {
        if self.is_hipo() {
            Self::HipoFile
        } else {
            Self::EvioFile
        }
    }
}

/// A length field in words, as bytes. Fails instead of wrapping.
fn word_bytes(words: u32, field: &str) -> Result<u32> {
    words
        .checked_mul(4)
        .ok_or_else(|| EvioError::format(format!("{field} of {words} words overflows")))
}

/// Find the byte order of the header at `offset` from its magic word.
pub fn detect_order(buf: &[u8], offset: usize) -> Result<ByteOrder> {
    let magic_at = offset + MAGIC_OFFSET;
    let word = buf
        .get(magic_at..magic_at + 4)
        .ok_or_else(|| EvioError::format("buffer too small to hold a header"))?;
    if ByteOrder::Big.read_u32(word) == HEADER_MAGIC {
        Ok(ByteOrder::Big)
    } else if ByteOrder::Little.read_u32(word) == HEADER_MAGIC {
        Ok(ByteOrder::Little)
    } else {
        Err(EvioError::format(format!(
            "bad magic number {:#010x} at offset {offset}",
            ByteOrder::Big.read_u32(word)
        )))
    }
}

/// Version-neutral record header (also used for trailers and v2-v4 blocks).
///
/// All lengths are in bytes. `user_header_length` and
/// `compressed_data_length` are unpadded; the padding travels in the
/// bit-info word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u32,
    pub header_type: HeaderType,
    pub order: ByteOrder,
    /// Where the header was read from (file or buffer offset).
    pub position: u64,
    pub record_length: u32,
    pub record_number: u32,
    pub header_length: u32,
    pub entries: u32,
    pub index_length: u32,
    pub user_header_length: u32,
    /// Uncompressed length of the event data alone.
    pub data_length: u32,
    pub compressed_data_length: u32,
    pub compression: CompressionType,
    pub event_type: u32,
    pub has_dictionary: bool,
    pub has_first_event: bool,
    pub is_last_record: bool,
    pub record_number_valid: bool,
    pub user_register1: u64,
    pub user_register2: u64,
}

impl Default for RecordHeader {
    fn default() -> Self {
        Self::new(HeaderType::EvioRecord, ByteOrder::default())
    }
}

impl RecordHeader {
    pub fn new(header_type: HeaderType, order: ByteOrder) -> Self {
        Self {
            version: CURRENT_VERSION,
            header_type,
            order,
            position: 0,
            record_length: HEADER_SIZE_BYTES as u32,
            record_number: 0,
            header_length: HEADER_SIZE_BYTES as u32,
            entries: 0,
            index_length: 0,
            user_header_length: 0,
            data_length: 0,
            compressed_data_length: 0,
            compression: CompressionType::None,
            event_type: 0,
            has_dictionary: false,
            has_first_event: false,
            is_last_record: false,
            record_number_valid: false,
            user_register1: 0,
            user_register2: 0,
        }
    }

    /// A trailer: last-record bit set, no events, optional record index.
    pub fn trailer(header_type: HeaderType, order: ByteOrder, record_number: u32, index_length: u32) -> Self {
        let mut h = Self::new(header_type.trailer(), order);
        h.record_number = record_number;
        h.record_number_valid = true;
        h.is_last_record = true;
        h.index_length = index_length;
        h.record_length = HEADER_SIZE_BYTES as u32 + index_length;
        h
    }

    /// Clear all per-record values, keeping type and order.
    pub fn reset(&mut self) {
        *self = Self::new(self.header_type, self.order);
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_compressed()
    }

    pub fn is_trailer(&self) -> bool {
        self.header_type.is_trailer()
    }

    pub fn padded_user_header_length(&self) -> usize {
        padded(self.user_header_length as usize)
    }

    /// Index + padded user header + events, i.e. what gets compressed.
    pub fn body_length(&self) -> usize {
        self.index_length as usize + self.padded_user_header_length() + self.data_length as usize
    }

    /// Length of the record once decompressed.
    pub fn uncompressed_record_length(&self) -> usize {
        self.header_length as usize + self.body_length()
    }

    /// Length following the header in the record's declared form.
    pub fn payload_length(&self) -> usize {
        if self.is_compressed() {
            padded(self.compressed_data_length as usize)
        } else {
            self.body_length()
        }
    }

    /// Check that the declared pieces add up to the declared record length.
    pub fn check_lengths(&self) -> Result<()> {
        let sum = self.header_length as usize + self.payload_length();
        if sum != self.record_length as usize {
            return Err(EvioError::format(format!(
                "inconsistent record lengths: header {} + payload {} != record {}",
                self.header_length,
                self.payload_length(),
                self.record_length
            )));
        }
        Ok(())
    }

    pub fn bit_info(&self) -> u32 {
        let mut word = self.version & VERSION_MASK;
        if self.has_dictionary {
            word |= DICTIONARY_BIT;
        }
        if self.is_last_record {
            word |= LAST_RECORD_BIT;
        }
        word |= (self.event_type & EVENT_TYPE_MASK) << EVENT_TYPE_SHIFT;
        if self.has_first_event {
            word |= FIRST_EVENT_BIT;
        }
        if self.record_number_valid {
            word |= RECORD_NUMBER_VALID_BIT;
        }
        word |= (padding(self.user_header_length as usize) as u32) << USER_PAD_SHIFT;
        word |= (padding(self.data_length as usize) as u32) << DATA_PAD_SHIFT;
        word |= (padding(self.compressed_data_length as usize) as u32) << COMPRESSED_PAD_SHIFT;
        word | ((self.header_type as u32) << HEADER_TYPE_SHIFT)
    }

    /// Serialize as a version 6 header into the first 56 bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if self.version != CURRENT_VERSION {
            return Err(EvioError::unsupported(format!(
                "cannot write version {} headers",
                self.version
            )));
        }
        if buf.len() < HEADER_SIZE_BYTES {
            return Err(EvioError::format("buffer too small to hold a record header"));
        }
        let o = self.order;
        let compressed_words = padded(self.compressed_data_length as usize) as u32 / 4;
        o.write_u32(&mut buf[RECORD_LENGTH_OFFSET..], self.record_length / 4);
        o.write_u32(&mut buf[RECORD_NUMBER_OFFSET..], self.record_number);
        o.write_u32(&mut buf[HEADER_LENGTH_OFFSET..], self.header_length / 4);
        o.write_u32(&mut buf[EVENT_COUNT_OFFSET..], self.entries);
        o.write_u32(&mut buf[INDEX_ARRAY_OFFSET..], self.index_length);
        o.write_u32(&mut buf[BIT_INFO_OFFSET..], self.bit_info());
        o.write_u32(&mut buf[USER_LENGTH_OFFSET..], self.user_header_length);
        o.write_u32(&mut buf[MAGIC_OFFSET..], HEADER_MAGIC);
        o.write_u32(&mut buf[UNCOMPRESSED_LENGTH_OFFSET..], self.data_length);
        o.write_u32(
            &mut buf[COMPRESSION_TYPE_OFFSET..],
            (compressed_words & COMPRESSED_LENGTH_MASK) | ((self.compression as u32) << 28),
        );
        o.write_u64(&mut buf[REGISTER1_OFFSET..], self.user_register1);
        o.write_u64(&mut buf[REGISTER2_OFFSET..], self.user_register2);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE_BYTES]> {
        let mut out = [0u8; HEADER_SIZE_BYTES];
        self.write(&mut out)?;
        Ok(out)
    }

    /// Decode the header at `offset`, whatever its version.
    pub fn read(buf: &[u8], offset: usize) -> Result<Self> {
        let order = detect_order(buf, offset)?;
        let word = |i: usize| -> Result<u32> {
            order
                .word_at(buf, offset + 4 * i)
                .ok_or_else(|| EvioError::format("truncated record header"))
        };

        let version = word(5)? & VERSION_MASK;
        let mut header = match version {
            6 => Self::decode_v6(buf, offset, order)?,
            4 | 5 => Self::decode_v4(&word, order, version)?,
            1..=3 => Self::decode_v2(&word, order, version)?,
            v => return Err(EvioError::format(format!("unknown evio version {v}"))),
        };
        header.position = offset as u64;
        Ok(header)
    }

    fn decode_v6(buf: &[u8], offset: usize, order: ByteOrder) -> Result<Self> {
        let h = buf
            .get(offset..offset + HEADER_SIZE_BYTES)
            .ok_or_else(|| EvioError::format("truncated record header"))?;
        let w = |off: usize| order.read_u32(&h[off..off + 4]);

        let bit_info = w(BIT_INFO_OFFSET);
        let header_type = HeaderType::from_u32(bit_info >> HEADER_TYPE_SHIFT)
            .ok_or_else(|| EvioError::format(format!("bad header type {}", bit_info >> HEADER_TYPE_SHIFT)))?;
        if header_type.is_file() {
            return Err(EvioError::format("expected a record header, found a file header"));
        }

        let compression_word = w(COMPRESSION_TYPE_OFFSET);
        let compression = CompressionType::from_u8((compression_word >> 28) as u8)
            .ok_or_else(|| EvioError::format(format!("bad compression type {}", compression_word >> 28)))?;
        let compressed_pad = (bit_info >> COMPRESSED_PAD_SHIFT) & 0x3;
        let compressed_bytes = ((compression_word & COMPRESSED_LENGTH_MASK) * 4)
            .checked_sub(compressed_pad)
            .ok_or_else(|| EvioError::format("bad compressed length padding"))?;

        let header_length = word_bytes(w(HEADER_LENGTH_OFFSET), "header length")?;
        if (header_length as usize) < HEADER_SIZE_BYTES {
            return Err(EvioError::format(format!("header length {header_length} too small")));
        }

        Ok(Self {
            version: CURRENT_VERSION,
            header_type,
            order,
            position: 0,
            record_length: word_bytes(w(RECORD_LENGTH_OFFSET), "record length")?,
            record_number: w(RECORD_NUMBER_OFFSET),
            header_length,
            entries: w(EVENT_COUNT_OFFSET),
            index_length: w(INDEX_ARRAY_OFFSET),
            user_header_length: w(USER_LENGTH_OFFSET),
            data_length: w(UNCOMPRESSED_LENGTH_OFFSET),
            compressed_data_length: if compression.is_compressed() { compressed_bytes } else { 0 },
            compression,
            event_type: (bit_info >> EVENT_TYPE_SHIFT) & EVENT_TYPE_MASK,
            has_dictionary: bit_info & DICTIONARY_BIT != 0,
            has_first_event: bit_info & FIRST_EVENT_BIT != 0,
            is_last_record: bit_info & LAST_RECORD_BIT != 0,
            record_number_valid: bit_info & RECORD_NUMBER_VALID_BIT != 0,
            user_register1: order.read_u64(&h[REGISTER1_OFFSET..REGISTER1_OFFSET + 8]),
            user_register2: order.read_u64(&h[REGISTER2_OFFSET..REGISTER2_OFFSET + 8]),
        })
    }

    fn decode_v4(word: &dyn Fn(usize) -> Result<u32>, order: ByteOrder, version: u32) -> Result<Self> {
        let bit_info = word(5)?;
        let record_length = word_bytes(word(0)?, "block length")?;
        let header_length = word_bytes(word(2)?, "header length")?;
        let data_length = record_length
            .checked_sub(header_length)
            .ok_or_else(|| EvioError::format("block length smaller than its header"))?;
        Ok(Self {
            version,
            record_length,
            record_number: word(1)?,
            header_length,
            entries: word(3)?,
            data_length,
            has_dictionary: bit_info & DICTIONARY_BIT != 0,
            is_last_record: bit_info & LAST_RECORD_BIT != 0,
            record_number_valid: true,
            ..Self::new(HeaderType::EvioRecord, order)
        })
    }

    // Versions 1-3 use fixed size blocks whose events may span blocks. Only
    // the block geometry is decoded; events are not counted per block.
    fn decode_v2(word: &dyn Fn(usize) -> Result<u32>, order: ByteOrder, version: u32) -> Result<Self> {
        let record_length = word_bytes(word(0)?, "block size")?;
        let header_length = word_bytes(word(2)?, "header length")?;
        let used = word_bytes(word(4)?, "used words")?;
        Ok(Self {
            version,
            record_length,
            record_number: word(1)?,
            header_length,
            data_length: used.saturating_sub(header_length),
            record_number_valid: true,
            ..Self::new(HeaderType::EvioRecord, order)
        })
    }
}

/// Version 6 file header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub file_id: u32,
    pub version: u32,
    pub header_type: HeaderType,
    pub order: ByteOrder,
    pub file_number: u32,
    pub header_length: u32,
    pub record_count: u32,
    pub index_length: u32,
    pub user_header_length: u32,
    pub has_dictionary: bool,
    pub has_first_event: bool,
    pub has_trailer_with_index: bool,
    pub user_register: u64,
    pub trailer_position: u64,
    pub user_int1: u32,
    pub user_int2: u32,
}

impl FileHeader {
    pub fn new(header_type: HeaderType, order: ByteOrder) -> Self {
        let header_type = header_type.file();
        Self {
            file_id: if header_type.is_hipo() { HIPO_FILE_ID } else { EVIO_FILE_ID },
            version: CURRENT_VERSION,
            header_type,
            order,
            file_number: 1,
            header_length: HEADER_SIZE_BYTES as u32,
            record_count: 0,
            index_length: 0,
            user_header_length: 0,
            has_dictionary: false,
            has_first_event: false,
            has_trailer_with_index: false,
            user_register: 0,
            trailer_position: 0,
            user_int1: 0,
            user_int2: 0,
        }
    }

    /// Header + index + padded user header: where the first record starts.
    pub fn length(&self) -> u64 {
        self.header_length as u64 + self.index_length as u64 + padded(self.user_header_length as usize) as u64
    }

    pub fn has_index(&self) -> bool {
        self.index_length > 0
    }

    pub fn bit_info(&self) -> u32 {
        let mut word = self.version & VERSION_MASK;
        if self.has_dictionary {
            word |= DICTIONARY_BIT;
        }
        if self.has_first_event {
            word |= FILE_FIRST_EVENT_BIT;
        }
        if self.has_trailer_with_index {
            word |= FILE_TRAILER_WITH_INDEX_BIT;
        }
        word |= (padding(self.user_header_length as usize) as u32) << USER_PAD_SHIFT;
        word | ((self.header_type as u32) << HEADER_TYPE_SHIFT)
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < HEADER_SIZE_BYTES {
            return Err(EvioError::format("buffer too small to hold a file header"));
        }
        let o = self.order;
        o.write_u32(&mut buf[FILE_ID_OFFSET..], self.file_id);
        o.write_u32(&mut buf[FILE_NUMBER_OFFSET..], self.file_number);
        o.write_u32(&mut buf[HEADER_LENGTH_OFFSET..], self.header_length / 4);
        o.write_u32(&mut buf[FILE_RECORD_COUNT_OFFSET..], self.record_count);
        o.write_u32(&mut buf[INDEX_ARRAY_OFFSET..], self.index_length);
        o.write_u32(&mut buf[BIT_INFO_OFFSET..], self.bit_info());
        o.write_u32(&mut buf[USER_LENGTH_OFFSET..], self.user_header_length);
        o.write_u32(&mut buf[MAGIC_OFFSET..], HEADER_MAGIC);
        o.write_u64(&mut buf[FILE_USER_REGISTER_OFFSET..], self.user_register);
        o.write_u64(&mut buf[FILE_TRAILER_POSITION_OFFSET..], self.trailer_position);
        o.write_u32(&mut buf[FILE_USER_INT1_OFFSET..], self.user_int1);
        o.write_u32(&mut buf[FILE_USER_INT2_OFFSET..], self.user_int2);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE_BYTES]> {
        let mut out = [0u8; HEADER_SIZE_BYTES];
        self.write(&mut out)?;
        Ok(out)
    }

    /// Does `buf` start with a file header (as opposed to a record or block)?
    pub fn is_file_header(buf: &[u8]) -> bool {
        let Ok(order) = detect_order(buf, 0) else {
            return false;
        };
        matches!(order.word_at(buf, FILE_ID_OFFSET), Some(EVIO_FILE_ID | HIPO_FILE_ID))
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let order = detect_order(buf, 0)?;
        let h = buf
            .get(..HEADER_SIZE_BYTES)
            .ok_or_else(|| EvioError::format("truncated file header"))?;
        let w = |off: usize| order.read_u32(&h[off..off + 4]);

        let file_id = w(FILE_ID_OFFSET);
        if file_id != EVIO_FILE_ID && file_id != HIPO_FILE_ID {
            return Err(EvioError::format(format!("bad file type id {file_id:#010x}")));
        }
        let bit_info = w(BIT_INFO_OFFSET);
        let version = bit_info & VERSION_MASK;
        if version != CURRENT_VERSION {
            return Err(EvioError::format(format!("file header version {version}, expected 6")));
        }
        let header_type = HeaderType::from_u32(bit_info >> HEADER_TYPE_SHIFT)
            .filter(|t| t.is_file())
            .ok_or_else(|| EvioError::format("bad file header type"))?;
        let header_length = word_bytes(w(HEADER_LENGTH_OFFSET), "file header length")?;
        if (header_length as usize) < HEADER_SIZE_BYTES {
            return Err(EvioError::format(format!("file header length {header_length} too small")));
        }

        Ok(Self {
            file_id,
            version,
            header_type,
            order,
            file_number: w(FILE_NUMBER_OFFSET),
            header_length,
            record_count: w(FILE_RECORD_COUNT_OFFSET),
            index_length: w(INDEX_ARRAY_OFFSET),
            user_header_length: w(USER_LENGTH_OFFSET),
            has_dictionary: bit_info & DICTIONARY_BIT != 0,
            has_first_event: bit_info & FILE_FIRST_EVENT_BIT != 0,
            has_trailer_with_index: bit_info & FILE_TRAILER_WITH_INDEX_BIT != 0,
            user_register: order.read_u64(&h[FILE_USER_REGISTER_OFFSET..FILE_USER_REGISTER_OFFSET + 8]),
            trailer_position: order.read_u64(&h[FILE_TRAILER_POSITION_OFFSET..FILE_TRAILER_POSITION_OFFSET + 8]),
            user_int1: w(FILE_USER_INT1_OFFSET),
            user_int2: w(FILE_USER_INT2_OFFSET),
        })
    }
}

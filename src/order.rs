//! Byte order of evio data.
//!
//! Evio data carries its own byte order (discovered from the magic word of a
//! header), so order is a runtime value rather than a type parameter.

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Big,
    #[default]
    Little,
}

impl ByteOrder {
    /// Order of the host this code runs on.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub const fn opposite(self) -> Self {
        match self {
            ByteOrder::Big => ByteOrder::Little,
            ByteOrder::Little => ByteOrder::Big,
        }
    }

    #[inline]
    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            ByteOrder::Big => BigEndian::read_u16(buf),
            ByteOrder::Little => LittleEndian::read_u16(buf),
        }
    }

    #[inline]
    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            ByteOrder::Big => BigEndian::read_u32(buf),
            ByteOrder::Little => LittleEndian::read_u32(buf),
        }
    }

    #[inline]
    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            ByteOrder::Big => BigEndian::read_u64(buf),
            ByteOrder::Little => LittleEndian::read_u64(buf),
        }
    }

    #[inline]
    pub fn write_u16(self, buf: &mut [u8], v: u16) {
        match self {
            ByteOrder::Big => BigEndian::write_u16(buf, v),
            ByteOrder::Little => LittleEndian::write_u16(buf, v),
        }
    }

    #[inline]
    pub fn write_u32(self, buf: &mut [u8], v: u32) {
        match self {
            ByteOrder::Big => BigEndian::write_u32(buf, v),
            ByteOrder::Little => LittleEndian::write_u32(buf, v),
        }
    }

    /// 64-bit values are stored as two 32-bit words; writing the whole value
    /// in the declared order puts the high word first for big endian.
    #[inline]
    pub fn write_u64(self, buf: &mut [u8], v: u64) {
        match self {
            ByteOrder::Big => BigEndian::write_u64(buf, v),
            ByteOrder::Little => LittleEndian::write_u64(buf, v),
        }
    }

    /// Read the 32-bit word at `offset`, or `None` if it runs past the slice.
    #[inline]
    pub fn word_at(self, buf: &[u8], offset: usize) -> Option<u32> {
        buf.get(offset..offset.checked_add(4)?).map(|w| self.read_u32(w))
    }

    /// Decode a whole slice of 32-bit words.
    pub fn words(self, buf: &[u8]) -> Vec<u32> {
        buf.chunks_exact(4).map(|w| self.read_u32(w)).collect()
    }

    /// Append one 32-bit word to a byte vector.
    #[inline]
    pub fn put_u32(self, out: &mut Vec<u8>, v: u32) {
        let mut w = [0u8; 4];
        self.write_u32(&mut w, v);
        out.extend_from_slice(&w);
    }
}

//! Evio data types and the three structure header layouts.

use crate::error::{EvioError, Result};
use crate::order::ByteOrder;

/// Content type code carried in every structure header.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Unknown32 = 0x0,
    Uint32 = 0x1,
    Float32 = 0x2,
    CharStar8 = 0x3,
    Short16 = 0x4,
    Ushort16 = 0x5,
    Char8 = 0x6,
    Uchar8 = 0x7,
    Double64 = 0x8,
    Long64 = 0x9,
    Ulong64 = 0xa,
    Int32 = 0xb,
    TagSegment = 0xc,
    AlsoSegment = 0xd,
    AlsoBank = 0xe,
    Composite = 0xf,
    Bank = 0x10,
    Segment = 0x20,
}

impl DataType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use DataType::*;
        Some(match v {
            0x0 => Unknown32,
            0x1 => Uint32,
            0x2 => Float32,
            0x3 => CharStar8,
            0x4 => Short16,
            0x5 => Ushort16,
            0x6 => Char8,
            0x7 => Uchar8,
            0x8 => Double64,
            0x9 => Long64,
            0xa => Ulong64,
            0xb => Int32,
            0xc => TagSegment,
            0xd => AlsoSegment,
            0xe => AlsoBank,
            0xf => Composite,
            0x10 => Bank,
            0x20 => Segment,
            _ => return None,
        })
    }

    /// Kind of children held by a container of this type.
    pub fn child_kind(self) -> Option<StructureType> {
        match self {
            DataType::Bank | DataType::AlsoBank => Some(StructureType::Bank),
            DataType::Segment | DataType::AlsoSegment => Some(StructureType::Segment),
            DataType::TagSegment => Some(StructureType::TagSegment),
            _ => None,
        }
    }

    pub fn is_container(self) -> bool {
        self.child_kind().is_some()
    }

    /// Width in bytes of one element for byte swapping, 1 if nothing to swap.
    pub fn element_size(self) -> usize {
        use DataType::*;
        match self {
            Short16 | Ushort16 => 2,
            Unknown32 | Uint32 | Float32 | Int32 => 4,
            Double64 | Long64 | Ulong64 => 8,
            _ => 1,
        }
    }
}

/// Which header layout a structure uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StructureType {
    /// Two header words: length, then tag(16) / pad(2) type(6) / num(8).
    Bank,
    /// One header word: tag(8) / pad(2) type(6) / length(16).
    Segment,
    /// One header word: tag(12) / type(4) / length(16).
    TagSegment,
}

impl StructureType {
    pub fn header_words(self) -> usize {
        match self {
            StructureType::Bank => 2,
            StructureType::Segment | StructureType::TagSegment => 1,
        }
    }

    /// Largest value the length field can hold.
    pub fn max_length(self) -> u32 {
        match self {
            StructureType::Bank => u32::MAX,
            StructureType::Segment | StructureType::TagSegment => 0xffff,
        }
    }
}

/// A decoded structure header.
///
/// `length` is the header's own length field: words following the first
/// header word, so the structure spans `4 * (length + 1)` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructureHeader {
    pub kind: StructureType,
    pub length: u32,
    pub tag: u16,
    pub num: u8,
    pub pad: u8,
    pub data_type: u8,
}

impl StructureHeader {
    pub fn bank(tag: u16, num: u8, data_type: DataType, data_words: u32) -> Self {
        Self {
            kind: StructureType::Bank,
            length: data_words + 1,
            tag,
            num,
            pad: 0,
            data_type: data_type as u8,
        }
    }

    pub fn segment(tag: u8, data_type: DataType, data_words: u32) -> Self {
        Self {
            kind: StructureType::Segment,
            length: data_words,
            tag: tag as u16,
            num: 0,
            pad: 0,
            data_type: data_type as u8,
        }
    }

    pub fn tag_segment(tag: u16, data_type: DataType, data_words: u32) -> Self {
        Self {
            kind: StructureType::TagSegment,
            length: data_words,
            tag,
            num: 0,
            pad: 0,
            data_type: data_type as u8,
        }
    }

    pub fn total_bytes(&self) -> usize {
        4 * (self.length as usize + 1)
    }

    pub fn header_bytes(&self) -> usize {
        4 * self.kind.header_words()
    }

    /// Words of data after the header.
    pub fn data_words(&self) -> u32 {
        match self.kind {
            StructureType::Bank => self.length.saturating_sub(1),
            _ => self.length,
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        DataType::from_u8(self.data_type)
    }

    pub fn decode(kind: StructureType, buf: &[u8], pos: usize, order: ByteOrder) -> Result<Self> {
        let truncated = || EvioError::format(format!("structure header at {pos} runs past end of buffer"));
        let first = order.word_at(buf, pos).ok_or_else(truncated)?;
        Ok(match kind {
            StructureType::Bank => {
                let second = order.word_at(buf, pos + 4).ok_or_else(truncated)?;
                let type_byte = (second >> 8) as u8;
                Self {
                    kind,
                    length: first,
                    tag: (second >> 16) as u16,
                    num: second as u8,
                    pad: type_byte >> 6,
                    data_type: type_byte & 0x3f,
                }
            }
            StructureType::Segment => {
                let type_byte = (first >> 16) as u8;
                Self {
                    kind,
                    length: first & 0xffff,
                    tag: (first >> 24) as u16,
                    num: 0,
                    pad: type_byte >> 6,
                    data_type: type_byte & 0x3f,
                }
            }
            StructureType::TagSegment => Self {
                kind,
                length: first & 0xffff,
                tag: (first >> 20) as u16,
                num: 0,
                pad: 0,
                data_type: ((first >> 16) & 0xf) as u8,
            },
        })
    }

    /// Header words as they appear on the wire.
    pub fn words(&self) -> Result<Vec<u32>> {
        if self.length > self.kind.max_length() {
            return Err(EvioError::format(format!(
                "length {} overflows a {:?} header",
                self.length, self.kind
            )));
        }
        let type_byte = (self.pad as u32 & 0x3) << 6 | (self.data_type as u32 & 0x3f);
        Ok(match self.kind {
            StructureType::Bank => vec![
                self.length,
                (self.tag as u32) << 16 | type_byte << 8 | self.num as u32,
            ],
            StructureType::Segment => vec![(self.tag as u32 & 0xff) << 24 | type_byte << 16 | self.length],
            StructureType::TagSegment => {
                vec![(self.tag as u32 & 0xfff) << 20 | (self.data_type as u32 & 0xf) << 16 | self.length]
            }
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, order: ByteOrder) -> Result<()> {
        for w in self.words()? {
            order.put_u32(out, w);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_header_fields() {
        let mut h = StructureHeader::bank(0xbeef, 7, DataType::Short16, 3);
        h.pad = 2;
        let mut out = Vec::new();
        h.write(&mut out, ByteOrder::Big).unwrap();
        assert_eq!(ByteOrder::Big.words(&out), vec![4, 0xbeef_8407]);
        assert_eq!(StructureHeader::decode(StructureType::Bank, &out, 0, ByteOrder::Big).unwrap(), h);
        assert_eq!(h.total_bytes(), 20);
        assert_eq!(h.data_words(), 3);
    }

    #[test]
    fn segment_and_tagsegment_headers() {
        let seg = StructureHeader::segment(0x12, DataType::Uint32, 5);
        let tagseg = StructureHeader::tag_segment(0xabc, DataType::Float32, 2);
        for h in [seg, tagseg] {
            let mut out = Vec::new();
            h.write(&mut out, ByteOrder::Little).unwrap();
            assert_eq!(out.len(), 4);
            assert_eq!(StructureHeader::decode(h.kind, &out, 0, ByteOrder::Little).unwrap(), h);
        }
        assert_eq!(ByteOrder::Big.words(&{
            let mut o = Vec::new();
            tagseg.write(&mut o, ByteOrder::Big).unwrap();
            o
        }), vec![0xabc2_0002]);
    }

    #[test]
    fn segment_length_overflow() {
        let seg = StructureHeader::segment(1, DataType::Uint32, 0x1_0000);
        assert!(seg.words().is_err());
    }

    #[test]
    fn container_children() {
        assert_eq!(DataType::AlsoBank.child_kind(), Some(StructureType::Bank));
        assert_eq!(DataType::from_u8(0x20), Some(DataType::Segment));
        assert!(!DataType::Int32.is_container());
        assert_eq!(DataType::from_u8(0x21), None);
    }
}

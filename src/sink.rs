//! Record-writing back end shared by [`Writer`](crate::Writer) and
//! [`WriterMT`](crate::WriterMT).

use std::io::{Seek, SeekFrom, Write};

use tracing::{debug, trace};

use crate::config::WriterOptions;
use crate::error::{EvioError, Result};
use crate::header::{padding, FileHeader, HeaderType, RecordHeader, HEADER_SIZE_BYTES};
use crate::order::ByteOrder;
use crate::record::dictionary_record;

/// What the writer produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteTarget {
    /// File header, records, trailer; the file header is patched at close.
    File,
    /// Records and trailer only. A dictionary rides in the first record.
    Buffer,
}

pub(crate) struct Sink<W: Write + Seek> {
    out: W,
    order: ByteOrder,
    record_type: HeaderType,
    file_header: Option<FileHeader>,
    bytes_written: u64,
    record_index: Vec<(u32, u32)>,
}

impl<W: Write + Seek> Sink<W> {
    pub(crate) fn new(mut out: W, target: WriteTarget, opts: &WriterOptions) -> Result<Self> {
        let record_type = opts.flavor.record_type();
        let mut bytes_written = 0;
        let mut file_header = None;

        if target == WriteTarget::File {
            let mut fh = FileHeader::new(record_type, opts.byte_order);
            fh.file_number = opts.file_number;
            fh.user_register = opts.file_user_register;
            let user = dictionary_user_header(opts)?.unwrap_or_default();
            fh.has_dictionary = opts.dictionary.is_some();
            fh.has_first_event = opts.first_event.is_some();
            fh.user_header_length = user.len() as u32;

            out.write_all(&fh.to_bytes()?)?;
            out.write_all(&user)?;
            out.write_all(&[0u8; 3][..padding(user.len())])?;
            bytes_written = fh.length();
            debug!(user_header = user.len(), "wrote file header");
            file_header = Some(fh);
        }

        Ok(Self {
            out,
            order: opts.byte_order,
            record_type,
            file_header,
            bytes_written,
            record_index: Vec::new(),
        })
    }

    pub(crate) fn records_written(&self) -> u32 {
        self.record_index.len() as u32
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub(crate) fn write_record(&mut self, bytes: &[u8], header: &RecordHeader) -> Result<()> {
        if bytes.len() != header.record_length as usize {
            return Err(EvioError::format(format!(
                "built record is {} bytes, header says {}",
                bytes.len(),
                header.record_length
            )));
        }
        self.out.write_all(bytes)?;
        trace!(
            record = header.record_number,
            events = header.entries,
            bytes = bytes.len(),
            "wrote record"
        );
        self.bytes_written += bytes.len() as u64;
        self.record_index.push((header.record_length, header.entries));
        Ok(())
    }

    /// Write the trailer (with the record index if asked for), patch the
    /// file header and hand back the output.
    pub(crate) fn finish(mut self, add_index: bool) -> Result<W> {
        let trailer_position = self.bytes_written;
        let index_len = if add_index { 8 * self.record_index.len() as u32 } else { 0 };
        let trailer = RecordHeader::trailer(self.record_type, self.order, self.records_written() + 1, index_len);

        let mut bytes = trailer.to_bytes()?.to_vec();
        if add_index {
            for &(len, count) in &self.record_index {
                self.order.put_u32(&mut bytes, len);
                self.order.put_u32(&mut bytes, count);
            }
        }
        self.out.write_all(&bytes)?;
        self.bytes_written += bytes.len() as u64;

        if let Some(fh) = self.file_header.as_mut() {
            fh.record_count = self.record_index.len() as u32;
            fh.trailer_position = trailer_position;
            fh.has_trailer_with_index = add_index;
            let header = fh.to_bytes()?;
            self.out.seek(SeekFrom::Start(0))?;
            self.out.write_all(&header[..HEADER_SIZE_BYTES])?;
            self.out.seek(SeekFrom::End(0))?;
        }
        self.out.flush()?;
        debug!(
            records = self.record_index.len(),
            bytes = self.bytes_written,
            trailer_position,
            "wrote trailer"
        );
        Ok(self.out)
    }
}

/// The nested dictionary record, if the options ask for one. Files carry
/// it in the file header's user header, buffers in the first record's.
pub(crate) fn dictionary_user_header(opts: &WriterOptions) -> Result<Option<Vec<u8>>> {
    if !opts.has_dictionary_record() {
        return Ok(None);
    }
    dictionary_record(
        opts.byte_order,
        opts.flavor.record_type(),
        opts.dictionary.as_deref(),
        opts.first_event.as_deref(),
    )
    .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordOutput;
    use std::io::Cursor;

    #[test]
    fn file_layout_and_patched_header() {
        let opts = WriterOptions::default()
            .with_byte_order(ByteOrder::Big)
            .with_dictionary("<dict/>");
        let mut sink = Sink::new(Cursor::new(Vec::new()), WriteTarget::File, &opts).unwrap();
        let first = sink.bytes_written();

        let mut rec = RecordOutput::from_options(&opts);
        rec.add_event(&[0, 0, 0, 1, 0, 0, 0x01, 0]).unwrap();
        rec.set_record_number(1);
        rec.build().unwrap();
        sink.write_record(rec.binary(), rec.header()).unwrap();
        let bytes = sink.finish(true).unwrap().into_inner();

        let fh = FileHeader::read(&bytes).unwrap();
        assert!(fh.has_dictionary);
        assert_eq!(fh.length(), first);
        assert_eq!(fh.record_count, 1);
        assert!(fh.has_trailer_with_index);

        let trailer = RecordHeader::read(&bytes, fh.trailer_position as usize).unwrap();
        assert!(trailer.is_trailer());
        assert_eq!(trailer.record_number, 2);
        assert_eq!(trailer.index_length, 8);
        assert_eq!(bytes.len() as u64, fh.trailer_position + 64);
    }

    #[test]
    fn buffer_mode_has_no_file_header() {
        let opts = WriterOptions::default();
        let sink = Sink::new(Cursor::new(Vec::new()), WriteTarget::Buffer, &opts).unwrap();
        assert_eq!(sink.bytes_written(), 0);
        let bytes = sink.finish(false).unwrap().into_inner();
        assert_eq!(bytes.len(), HEADER_SIZE_BYTES);
        assert!(RecordHeader::read(&bytes, 0).unwrap().is_last_record);
        assert!(dictionary_user_header(&opts).unwrap().is_none());
    }
}

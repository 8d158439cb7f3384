//! Single-threaded record writer.
//!
//! Events accumulate in one [`RecordOutput`]; when the next event would
//! overflow it, the record is compressed and written synchronously before a
//! fresh one is started.
//!
//! ```rust
//! use hipo_evio::{ByteOrder, Reader, Writer, WriterOptions};
//!
//! let opts = WriterOptions::default().with_byte_order(ByteOrder::Big);
//! let mut writer = Writer::to_buffer(opts).unwrap();
//! // one bank of tag 1 holding a single 32-bit int
//! writer.add_event(&[0, 0, 0, 2, 0, 1, 0x01, 0, 0, 0, 0, 42]).unwrap();
//! let bytes = writer.into_buffer().unwrap();
//!
//! let mut reader = Reader::from_buffer(bytes).unwrap();
//! assert_eq!(reader.event_count(), 1);
//! ```

use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::buffer::buffered_writer;
use crate::config::WriterOptions;
use crate::error::{EvioError, Result};
use crate::record::RecordOutput;
use crate::sink::{dictionary_user_header, Sink, WriteTarget};

pub struct Writer<W: Write + Seek> {
    sink: Option<Sink<W>>,
    record: RecordOutput,
    opts: WriterOptions,
    /// Dictionary record still waiting to ride in the first buffer record.
    pending_dictionary: bool,
    events_written: u64,
    inner: Option<W>,
}

impl Writer<BufWriter<File>> {
    /// Write a file at `path`, replacing anything already there.
    pub fn create<P: AsRef<Path>>(path: P, opts: WriterOptions) -> Result<Self> {
        let out = buffered_writer(path)?;
        Self::new(out, WriteTarget::File, opts)
    }
}

impl Writer<Cursor<Vec<u8>>> {
    /// Write records into memory, without a file header.
    pub fn to_buffer(opts: WriterOptions) -> Result<Self> {
        Self::new(Cursor::new(Vec::new()), WriteTarget::Buffer, opts)
    }

    /// Close and return the written bytes.
    pub fn into_buffer(self) -> Result<Vec<u8>> {
        Ok(self.into_inner()?.into_inner())
    }
}

impl<W: Write + Seek> Writer<W> {
    pub fn new(out: W, target: WriteTarget, opts: WriterOptions) -> Result<Self> {
        opts.validate()?;
        let sink = Sink::new(out, target, &opts)?;
        let mut record = RecordOutput::from_options(&opts);

        let mut pending_dictionary = false;
        if target == WriteTarget::Buffer {
            if let Some(user) = dictionary_user_header(&opts)? {
                record.set_user_header(&user);
                pending_dictionary = true;
            }
        }

        Ok(Self {
            sink: Some(sink),
            record,
            opts,
            pending_dictionary,
            events_written: 0,
            inner: None,
        })
    }

    pub fn options(&self) -> &WriterOptions {
        &self.opts
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    pub fn records_written(&self) -> u32 {
        self.sink.as_ref().map_or(0, Sink::records_written)
    }

    /// Append one event, rotating to a new record first if it does not fit.
    pub fn add_event(&mut self, event: &[u8]) -> Result<()> {
        if self.sink.is_none() {
            return Err(EvioError::Closed);
        }
        if event.is_empty() || event.len() % 4 != 0 {
            return Err(EvioError::InvalidEvent(format!(
                "event length {} is not a positive multiple of 4",
                event.len()
            )));
        }
        if !self.record.has_room_for(event.len()) {
            self.flush_record()?;
        }
        self.record.add_event(event)?;
        self.events_written += 1;
        Ok(())
    }

    /// Compress and write the current record, if it holds anything.
    pub fn flush_record(&mut self) -> Result<()> {
        let sink = self.sink.as_mut().ok_or(EvioError::Closed)?;
        if self.record.is_empty() && !self.pending_dictionary {
            return Ok(());
        }
        if self.pending_dictionary {
            let h = self.record.header_mut();
            h.has_dictionary = self.opts.dictionary.is_some();
            h.has_first_event = self.opts.first_event.is_some();
            self.pending_dictionary = false;
        }

        self.record.set_record_number(sink.records_written() + 1);
        self.record.build()?;
        sink.write_record(self.record.binary(), self.record.header())?;
        debug!(
            record = self.record.header().record_number,
            events = self.record.event_count(),
            "record rotated"
        );
        self.record.reset();
        Ok(())
    }

    /// Write the last record and the trailer. Calling it again does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.sink.is_none() {
            return Ok(());
        }
        let flushed = self.flush_record();
        let sink = self.sink.take().ok_or(EvioError::Closed)?;
        let out = sink.finish(self.opts.add_trailer_index)?;
        self.inner = Some(out);
        flushed
    }

    /// Close and hand back the underlying output.
    pub fn into_inner(mut self) -> Result<W> {
        self.close()?;
        self.inner.take().ok_or(EvioError::Closed)
    }
}

impl<W: Write + Seek> Drop for Writer<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close writer");
        }
    }
}

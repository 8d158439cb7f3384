//! Concurrent record writer.
//!
//! A fixed ring of reusable [`RecordOutput`] slots connects three thread
//! roles: the caller fills one slot at a time, N compression workers build
//! any ready slot in parallel, and one writer thread drains slots strictly
//! in sequence order, so records land in the order their events were
//! submitted however compression finishes.
//!
//! Slot life cycle:
//!
//! ```text
//! Free -> Filling -> ReadyForCompression -> Compressing -> Compressed -> Writing -> Free
//! ```
//!
//! Record sequence `s` always lives in slot `s % ring_size`. The ring state
//! sits behind one mutex with one condition variable; records are built and
//! written outside the lock. When no slot is free the caller blocks, which
//! bounds memory to `ring_size` records.

use std::fs::File;
use std::io::{self, BufWriter, Cursor, Seek, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::buffer::buffered_writer;
use crate::config::WriterOptions;
use crate::error::{EvioError, Result};
use crate::record::RecordOutput;
use crate::sink::{dictionary_user_header, Sink, WriteTarget};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Filling,
    ReadyForCompression,
    Compressing,
    Compressed,
    Writing,
}

struct Slot {
    state: SlotState,
    seq: u64,
    /// Taken out while the caller fills it or a thread works on it.
    record: Option<RecordOutput>,
}

struct Ring {
    slots: Vec<Slot>,
    next_write: u64,
    shutdown: bool,
    error: Option<EvioError>,
    failure: Option<String>,
}

impl Ring {
    fn fail(&mut self, e: EvioError) {
        if self.failure.is_none() {
            self.failure = Some(e.to_string());
            self.error = Some(e);
        }
    }

    /// Surface a pipeline failure to the caller: the original error once,
    /// a description of it afterwards.
    fn check(&mut self) -> Result<()> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        match &self.failure {
            Some(msg) => Err(EvioError::Io(io::Error::other(format!("writer pipeline failed: {msg}")))),
            None => Ok(()),
        }
    }

    fn oldest_ready(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::ReadyForCompression)
            .min_by_key(|(_, s)| s.seq)
            .map(|(i, _)| i)
    }

    fn in_flight(&self) -> bool {
        self.slots.iter().any(|s| s.state != SlotState::Free)
    }
}

struct Shared {
    ring: Mutex<Ring>,
    changed: Condvar,
}

pub struct WriterMT<W: Write + Seek + Send + 'static> {
    shared: Arc<Shared>,
    /// Record of the slot being filled.
    current: Option<RecordOutput>,
    next_seq: u64,
    workers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<Sink<W>>>,
    opts: WriterOptions,
    events_written: u64,
    closed: bool,
    inner: Option<W>,
}

impl WriterMT<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P, opts: WriterOptions) -> Result<Self> {
        let out = buffered_writer(path)?;
        Self::new(out, WriteTarget::File, opts)
    }
}

impl WriterMT<Cursor<Vec<u8>>> {
    pub fn to_buffer(opts: WriterOptions) -> Result<Self> {
        Self::new(Cursor::new(Vec::new()), WriteTarget::Buffer, opts)
    }

    pub fn into_buffer(self) -> Result<Vec<u8>> {
        Ok(self.into_inner()?.into_inner())
    }
}

impl<W: Write + Seek + Send + 'static> WriterMT<W> {
    pub fn new(out: W, target: WriteTarget, opts: WriterOptions) -> Result<Self> {
        opts.validate()?;
        let sink = Sink::new(out, target, &opts)?;

        let mut slots: Vec<Slot> = (0..opts.ring_size)
            .map(|_| Slot {
                state: SlotState::Free,
                seq: 0,
                record: Some(RecordOutput::from_options(&opts)),
            })
            .collect();

        // the caller owns slot 0 from the start
        slots[0].state = SlotState::Filling;
        let mut current = slots[0].record.take();
        if target == WriteTarget::Buffer {
            if let (Some(user), Some(record)) = (dictionary_user_header(&opts)?, current.as_mut()) {
                record.set_user_header(&user);
                record.header_mut().has_dictionary = opts.dictionary.is_some();
                record.header_mut().has_first_event = opts.first_event.is_some();
            }
        }

        let shared = Arc::new(Shared {
            ring: Mutex::new(Ring {
                slots,
                next_write: 0,
                shutdown: false,
                error: None,
                failure: None,
            }),
            changed: Condvar::new(),
        });

        // threads already running must be told to stop if a later spawn fails
        let abort = |e: io::Error| {
            shared.ring.lock().shutdown = true;
            shared.changed.notify_all();
            EvioError::Io(e)
        };
        let mut workers = Vec::with_capacity(opts.compression_threads);
        for n in 0..opts.compression_threads {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("hipo-compress-{n}"))
                .spawn(move || compress_loop(&worker_shared, n))
                .map_err(abort)?;
            workers.push(handle);
        }
        let writer_shared = Arc::clone(&shared);
        let writer = thread::Builder::new()
            .name("hipo-writer".into())
            .spawn(move || write_loop(&writer_shared, sink))
            .map_err(abort)?;

        debug!(
            threads = opts.compression_threads,
            ring = opts.ring_size,
            compression = %opts.compression,
            "started concurrent writer"
        );

        Ok(Self {
            shared,
            current,
            next_seq: 0,
            workers,
            writer: Some(writer),
            opts,
            events_written: 0,
            closed: false,
            inner: None,
        })
    }

    pub fn options(&self) -> &WriterOptions {
        &self.opts
    }

    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    /// Records handed to the pipeline so far.
    pub fn records_published(&self) -> u64 {
        self.next_seq
    }

    /// Append one event. Blocks while every slot is busy.
    pub fn add_event(&mut self, event: &[u8]) -> Result<()> {
        if self.closed {
            return Err(EvioError::Closed);
        }
        if event.is_empty() || event.len() % 4 != 0 {
            return Err(EvioError::InvalidEvent(format!(
                "event length {} is not a positive multiple of 4",
                event.len()
            )));
        }
        self.shared.ring.lock().check()?;

        let fits = self.current.as_ref().is_some_and(|r| r.has_room_for(event.len()));
        if !fits {
            self.publish()?;
            self.claim_next()?;
        }
        let record = self.current.as_mut().ok_or(EvioError::Closed)?;
        record.add_event(event)?;
        self.events_written += 1;
        Ok(())
    }

    /// Hand the record being filled to the compression workers.
    fn publish(&mut self) -> Result<()> {
        let mut record = self.current.take().ok_or(EvioError::Closed)?;
        let seq = self.next_seq;
        record.set_record_number(seq as u32 + 1);

        let mut ring = self.shared.ring.lock();
        let n = ring.slots.len();
        let slot = &mut ring.slots[(seq % n as u64) as usize];
        slot.state = SlotState::ReadyForCompression;
        slot.seq = seq;
        slot.record = Some(record);
        self.next_seq += 1;
        self.shared.changed.notify_all();
        trace!(seq, "published record");
        Ok(())
    }

    /// Wait for the slot of the next sequence number to come free.
    fn claim_next(&mut self) -> Result<()> {
        let seq = self.next_seq;
        let mut ring = self.shared.ring.lock();
        let i = (seq % ring.slots.len() as u64) as usize;
        while ring.slots[i].state != SlotState::Free {
            ring.check()?;
            self.shared.changed.wait(&mut ring);
        }
        ring.check()?;
        let slot = &mut ring.slots[i];
        slot.state = SlotState::Filling;
        slot.seq = seq;
        self.current = slot.record.take();
        Ok(())
    }

    /// Flush everything, write the trailer and stop all threads.
    /// Calling it again does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let pending = self
            .current
            .as_ref()
            .is_some_and(|r| !r.is_empty() || r.header().has_dictionary || r.header().has_first_event);
        if pending {
            self.publish()?;
        } else if let Some(record) = self.current.take() {
            let mut ring = self.shared.ring.lock();
            let n = ring.slots.len();
            let slot = &mut ring.slots[(self.next_seq % n as u64) as usize];
            slot.state = SlotState::Free;
            slot.record = Some(record);
        }

        {
            let mut ring = self.shared.ring.lock();
            ring.shutdown = true;
            self.shared.changed.notify_all();
        }

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                self.shared.ring.lock().fail(EvioError::Io(io::Error::other("compression thread panicked")));
            }
        }
        let sink = self
            .writer
            .take()
            .ok_or(EvioError::Closed)?
            .join()
            .map_err(|_| EvioError::Io(io::Error::other("writer thread panicked")))?;

        // the trailer always reflects the records actually written
        let finished = sink.finish(self.opts.add_trailer_index);
        let failed = self.shared.ring.lock().check();
        self.inner = Some(finished?);
        failed?;
        debug!(records = self.next_seq, events = self.events_written, "closed concurrent writer");
        Ok(())
    }

    pub fn into_inner(mut self) -> Result<W> {
        self.close()?;
        self.inner.take().ok_or(EvioError::Closed)
    }
}

impl<W: Write + Seek + Send + 'static> Drop for WriterMT<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close concurrent writer");
        }
    }
}

fn compress_loop(shared: &Shared, n: usize) {
    trace!(worker = n, "compression thread started");
    loop {
        let mut ring = shared.ring.lock();
        let job = loop {
            if let Some(i) = ring.oldest_ready() {
                let slot = &mut ring.slots[i];
                slot.state = SlotState::Compressing;
                break slot.record.take().map(|r| (i, r));
            }
            if ring.shutdown || ring.failure.is_some() {
                break None;
            }
            shared.changed.wait(&mut ring);
        };
        drop(ring);

        let Some((i, mut record)) = job else {
            break;
        };
        let built = record.build().map(|_| ());

        let mut ring = shared.ring.lock();
        let slot = &mut ring.slots[i];
        slot.record = Some(record);
        slot.state = SlotState::Compressed;
        if let Err(e) = built {
            ring.fail(e);
        }
        shared.changed.notify_all();
    }
    trace!(worker = n, "compression thread stopped");
}

fn write_loop<W: Write + Seek>(shared: &Shared, mut sink: Sink<W>) -> Sink<W> {
    trace!("writer thread started");
    loop {
        let mut ring = shared.ring.lock();
        let job = loop {
            if ring.failure.is_some() {
                break None;
            }
            let seq = ring.next_write;
            let i = (seq % ring.slots.len() as u64) as usize;
            let slot = &mut ring.slots[i];
            if slot.state == SlotState::Compressed && slot.seq == seq {
                slot.state = SlotState::Writing;
                break slot.record.take().map(|r| (i, r));
            }
            if ring.shutdown && !ring.in_flight() {
                break None;
            }
            shared.changed.wait(&mut ring);
        };
        drop(ring);

        let Some((i, mut record)) = job else {
            break;
        };
        let written = sink.write_record(record.binary(), record.header());
        record.reset();

        let mut ring = shared.ring.lock();
        let slot = &mut ring.slots[i];
        slot.record = Some(record);
        slot.state = SlotState::Free;
        ring.next_write += 1;
        if let Err(e) = written {
            ring.fail(e);
        }
        shared.changed.notify_all();
    }
    trace!(records = sink.records_written(), "writer thread stopped");
    sink
}

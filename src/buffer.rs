//! Buffering utilities and the shared evio buffer
//!
//! File access goes through buffered readers and writers with a 64 KB
//! default capacity. In-memory evio data lives in a [`SharedBuffer`], the
//! single reference-counted byte store that every
//! [`EvioNode`](crate::node::EvioNode) derived from one scan points into.

use std::cell::{Ref, RefCell, RefMut};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::Path;
use std::rc::Rc;

use crate::order::ByteOrder;

/// Default buffer size for I/O operations (64KB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Create a buffered reader with default buffer size
pub fn buffered_reader<P: AsRef<Path>>(path: P) -> io::Result<BufReader<File>> {
    let file = File::open(path)?;
    Ok(BufReader::with_capacity(DEFAULT_BUFFER_SIZE, file))
}

/// Create a buffered writer with default buffer size
///
/// # Examples
/// ```no_run
/// use hipo_evio::buffered_writer;
/// use std::io::Write;
///
/// let mut writer = buffered_writer("output.evio").unwrap();
/// writer.write_all(&[0u8; 56]).unwrap();
/// writer.flush().unwrap();
/// ```
pub fn buffered_writer<P: AsRef<Path>>(path: P) -> io::Result<BufWriter<File>> {
    let file = File::create(path)?;
    Ok(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, file))
}

/// Read exactly `len` bytes starting at `pos`.
pub fn read_at<R: Read + Seek>(src: &mut R, pos: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    src.seek(SeekFrom::Start(pos))?;
    src.read_exact(&mut out)?;
    Ok(out)
}

/// Like [`read_at`] but stops early at end of input, returning what exists.
pub fn read_up_to<R: Read + Seek>(src: &mut R, pos: u64, len: usize) -> io::Result<Vec<u8>> {
    src.seek(SeekFrom::Start(pos))?;
    let mut out = Vec::with_capacity(len);
    src.take(len as u64).read_to_end(&mut out)?;
    Ok(out)
}

struct Inner {
    bytes: Vec<u8>,
    order: ByteOrder,
}

/// Reference-counted evio buffer.
///
/// The vector's length is the buffer limit. Clones share the same bytes;
/// [`SharedBuffer::ptr_eq`] tells whether two handles are the same buffer.
/// Not `Send`: a buffer and its nodes belong to one reader on one thread.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Rc<RefCell<Inner>>,
}

impl SharedBuffer {
    pub fn new(bytes: Vec<u8>, order: ByteOrder) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner { bytes, order })),
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.inner.borrow().order
    }

    pub fn set_order(&self, order: ByteOrder) {
        self.inner.borrow_mut().order = order;
    }

    /// Number of valid bytes.
    pub fn limit(&self) -> usize {
        self.inner.borrow().bytes.len()
    }

    pub fn bytes(&self) -> Ref<'_, Vec<u8>> {
        Ref::map(self.inner.borrow(), |i| &i.bytes)
    }

    pub fn bytes_mut(&self) -> RefMut<'_, Vec<u8>> {
        RefMut::map(self.inner.borrow_mut(), |i| &mut i.bytes)
    }

    /// Copy of `len` bytes at `pos`, or `None` if out of range.
    pub fn copy_range(&self, pos: usize, len: usize) -> Option<Vec<u8>> {
        let bytes = self.bytes();
        bytes.get(pos..pos.checked_add(len)?).map(<[u8]>::to_vec)
    }

    /// 32-bit word at `pos` in the buffer's order.
    pub fn word(&self, pos: usize) -> Option<u32> {
        let inner = self.inner.borrow();
        inner.order.word_at(&inner.bytes, pos)
    }

    pub fn put_word(&self, pos: usize, value: u32) {
        let mut inner = self.inner.borrow_mut();
        let order = inner.order;
        order.write_u32(&mut inner.bytes[pos..pos + 4], value);
    }

    /// Swap in new contents, returning the old ones.
    pub fn replace(&self, bytes: Vec<u8>) -> Vec<u8> {
        std::mem::replace(&mut self.inner.borrow_mut().bytes, bytes)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().clone()
    }

    pub fn ptr_eq(a: &SharedBuffer, b: &SharedBuffer) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("limit", &self.limit())
            .field("order", &self.order())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_at() {
        let mut src = Cursor::new(b"0123456789".to_vec());
        assert_eq!(read_at(&mut src, 3, 4).unwrap(), b"3456");
        assert!(read_at(&mut src, 8, 4).is_err());
        assert_eq!(read_up_to(&mut src, 8, 4).unwrap(), b"89");
    }

    #[test]
    fn test_shared_buffer_words() {
        let buf = SharedBuffer::new(vec![0, 0, 0, 7, 0, 0], ByteOrder::Big);
        assert_eq!(buf.word(0), Some(7));
        assert_eq!(buf.word(4), None);
        buf.put_word(0, 9);
        assert_eq!(buf.bytes()[3], 9);

        let alias = buf.clone();
        assert!(SharedBuffer::ptr_eq(&buf, &alias));
        alias.replace(vec![1, 2]);
        assert_eq!(buf.limit(), 2);
        assert_eq!(buf.copy_range(0, 2), Some(vec![1, 2]));
        assert_eq!(buf.copy_range(1, 2), None);
    }
}

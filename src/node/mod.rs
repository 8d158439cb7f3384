//! Zero-copy descriptors of evio structures.
//!
//! Scanning an event produces one [`EventTree`]: a flat arena of
//! [`NodeData`] in depth-first pre-order, with parent links stored as arena
//! indices. An [`EvioNode`] is a cheap handle (tree + index) that reads and
//! patches bytes in the tree's [`SharedBuffer`] on demand; nothing is copied
//! at scan time.
//!
//! Nodes can be poisoned. Once the bytes a node describes are removed, or
//! the buffer is rescanned, the reader marks the node obsolete and every
//! accessor that touches the buffer or the tree fails with
//! [`EvioError::Obsolete`].

mod structure;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

pub use structure::{DataType, StructureHeader, StructureType};

use crate::buffer::SharedBuffer;
use crate::error::{EvioError, Result};

/// Descriptor of one structure, as stored in the arena.
#[derive(Clone, Debug)]
pub struct NodeData {
    pub kind: StructureType,
    /// Header length field (words following the first header word).
    pub length: u32,
    pub tag: u16,
    pub num: u8,
    pub pad: u8,
    pub data_type: u8,
    /// Byte position of the header in the buffer.
    pub position: usize,
    /// Byte position of the data in the buffer.
    pub data_position: usize,
    parent: Option<usize>,
    children: Vec<usize>,
    /// Index one past the last descendant in the arena.
    subtree_end: usize,
    obsolete: bool,
}

impl NodeData {
    pub fn total_bytes(&self) -> usize {
        4 * (self.length as usize + 1)
    }

    pub fn data_words(&self) -> u32 {
        match self.kind {
            StructureType::Bank => self.length.saturating_sub(1),
            _ => self.length,
        }
    }
}

/// Every node of one top-level event.
pub struct EventTree {
    buffer: RefCell<SharedBuffer>,
    record_position: Cell<usize>,
    place: usize,
    nodes: RefCell<Vec<NodeData>>,
}

/// Handle to one structure in a scanned event.
#[derive(Clone)]
pub struct EvioNode {
    tree: Rc<EventTree>,
    id: usize,
}

struct Frame {
    id: usize,
    next: usize,
    end: usize,
    child_kind: StructureType,
}

impl EvioNode {
    /// Scan the event bank at `position` and every structure nested in it.
    ///
    /// `record_position` is where the containing record header starts,
    /// `end` the offset no structure may reach past (usually the end of that
    /// record) and `place` is the event's ordinal in the buffer.
    pub fn extract_event(
        buffer: &SharedBuffer,
        record_position: usize,
        position: usize,
        end: usize,
        place: usize,
    ) -> Result<Self> {
        let nodes = {
            let bytes = buffer.bytes();
            let end = end.min(bytes.len());
            scan(&bytes[..end], buffer.order(), position)?
        };
        Ok(Self {
            tree: Rc::new(EventTree {
                buffer: RefCell::new(buffer.clone()),
                record_position: Cell::new(record_position),
                place,
                nodes: RefCell::new(nodes),
            }),
            id: 0,
        })
    }

    fn with_data<R>(&self, f: impl FnOnce(&NodeData) -> R) -> R {
        f(&self.tree.nodes.borrow()[self.id])
    }

    fn live<R>(&self, f: impl FnOnce(&NodeData) -> R) -> Result<R> {
        let nodes = self.tree.nodes.borrow();
        let node = &nodes[self.id];
        if node.obsolete {
            return Err(EvioError::Obsolete);
        }
        Ok(f(node))
    }

    fn handle(&self, id: usize) -> EvioNode {
        EvioNode {
            tree: Rc::clone(&self.tree),
            id,
        }
    }

    /// Snapshot of this node's descriptor.
    pub fn data(&self) -> NodeData {
        self.with_data(NodeData::clone)
    }

    pub fn is_obsolete(&self) -> bool {
        self.with_data(|n| n.obsolete)
    }

    pub fn is_event(&self) -> bool {
        self.id == 0
    }

    pub fn kind(&self) -> StructureType {
        self.with_data(|n| n.kind)
    }

    pub fn tag(&self) -> u16 {
        self.with_data(|n| n.tag)
    }

    pub fn num(&self) -> u8 {
        self.with_data(|n| n.num)
    }

    pub fn pad(&self) -> u8 {
        self.with_data(|n| n.pad)
    }

    pub fn data_type(&self) -> Option<DataType> {
        self.with_data(|n| DataType::from_u8(n.data_type))
    }

    /// Header length field in words.
    pub fn length(&self) -> u32 {
        self.with_data(|n| n.length)
    }

    /// Data length in words.
    pub fn data_length(&self) -> u32 {
        self.with_data(NodeData::data_words)
    }

    pub fn total_bytes(&self) -> usize {
        self.with_data(NodeData::total_bytes)
    }

    pub fn position(&self) -> usize {
        self.with_data(|n| n.position)
    }

    pub fn data_position(&self) -> usize {
        self.with_data(|n| n.data_position)
    }

    pub fn record_position(&self) -> usize {
        self.tree.record_position.get()
    }

    /// Ordinal of the containing event in its buffer.
    pub fn place(&self) -> usize {
        self.tree.place
    }

    pub fn buffer(&self) -> SharedBuffer {
        self.tree.buffer.borrow().clone()
    }

    /// The top-level event node this node belongs to.
    pub fn event(&self) -> EvioNode {
        self.handle(0)
    }

    pub fn parent(&self) -> Result<Option<EvioNode>> {
        let parent = self.live(|n| n.parent)?;
        Ok(parent.map(|id| self.handle(id)))
    }

    pub fn child_count(&self) -> Result<usize> {
        self.live(|n| n.children.len())
    }

    pub fn children(&self) -> Result<Vec<EvioNode>> {
        let ids = self.live(|n| n.children.clone())?;
        Ok(ids.into_iter().map(|id| self.handle(id)).collect())
    }

    pub fn child_at(&self, index: usize) -> Result<Option<EvioNode>> {
        let id = self.live(|n| n.children.get(index).copied())?;
        Ok(id.map(|id| self.handle(id)))
    }

    /// This node followed by all its descendants, depth-first in buffer order.
    pub fn all_nodes(&self) -> Result<Vec<EvioNode>> {
        let end = self.live(|n| n.subtree_end)?;
        Ok((self.id..end).map(|id| self.handle(id)).collect())
    }

    /// All descendants, depth-first in buffer order.
    pub fn descendants(&self) -> Result<Vec<EvioNode>> {
        let end = self.live(|n| n.subtree_end)?;
        Ok((self.id + 1..end).map(|id| self.handle(id)).collect())
    }

    /// Header and data of this structure.
    pub fn structure_bytes(&self) -> Result<Vec<u8>> {
        let (pos, len) = self.live(|n| (n.position, n.total_bytes()))?;
        self.copy(pos, len)
    }

    /// Data of this structure, without its header.
    pub fn data_bytes(&self) -> Result<Vec<u8>> {
        let (pos, len) = self.live(|n| (n.data_position, 4 * n.data_words() as usize))?;
        self.copy(pos, len)
    }

    /// Data decoded as 32-bit words in the buffer's order.
    pub fn int_data(&self) -> Result<Vec<u32>> {
        let bytes = self.data_bytes()?;
        Ok(self.buffer().order().words(&bytes))
    }

    fn copy(&self, pos: usize, len: usize) -> Result<Vec<u8>> {
        self.tree
            .buffer
            .borrow()
            .copy_range(pos, len)
            .ok_or_else(|| EvioError::format(format!("node at {pos} runs past end of buffer")))
    }

    /// Move this node and its descendants by `delta` bytes. Shifting the
    /// event node also moves the recorded record position.
    pub fn shift(&self, delta: isize) -> &Self {
        let mut nodes = self.tree.nodes.borrow_mut();
        let end = nodes[self.id].subtree_end;
        for n in &mut nodes[self.id..end] {
            n.position = n.position.wrapping_add_signed(delta);
            n.data_position = n.data_position.wrapping_add_signed(delta);
        }
        if self.id == 0 {
            let rp = &self.tree.record_position;
            rp.set(rp.get().wrapping_add_signed(delta));
        }
        self
    }

    /// Point the whole event tree at another buffer.
    pub fn set_buffer(&self, buffer: &SharedBuffer) {
        *self.tree.buffer.borrow_mut() = buffer.clone();
    }

    /// Grow or shrink the length of this node and every ancestor by
    /// `delta_words`, rewriting their headers in the buffer.
    pub fn update_lengths(&self, delta_words: i32) -> Result<()> {
        let buffer = self.buffer();
        let mut nodes = self.tree.nodes.borrow_mut();
        if nodes[self.id].obsolete {
            return Err(EvioError::Obsolete);
        }

        // check everything first so a failure leaves the buffer untouched
        let mut chain = Vec::new();
        let mut cur = Some(self.id);
        while let Some(id) = cur {
            let n = &nodes[id];
            let length = n
                .length
                .checked_add_signed(delta_words)
                .filter(|l| *l <= n.kind.max_length())
                .ok_or_else(|| {
                    EvioError::format(format!("length change of {delta_words} words overflows {:?} header", n.kind))
                })?;
            chain.push((id, length));
            cur = n.parent;
        }

        for (id, length) in chain {
            let n = &mut nodes[id];
            n.length = length;
            match n.kind {
                StructureType::Bank => buffer.put_word(n.position, length),
                StructureType::Segment | StructureType::TagSegment => {
                    let word = buffer.word(n.position).unwrap_or(0);
                    buffer.put_word(n.position, (word & 0xffff_0000) | length);
                }
            }
        }
        Ok(())
    }

    /// Change the tag in the buffer and in this descriptor.
    pub fn update_tag(&self, tag: u16) -> Result<()> {
        let (kind, pos) = self.live(|n| (n.kind, n.position))?;
        let buffer = self.buffer();
        match kind {
            StructureType::Bank => {
                let w = buffer.word(pos + 4).unwrap_or(0);
                buffer.put_word(pos + 4, (w & 0xffff) | (tag as u32) << 16);
            }
            StructureType::Segment => {
                let tag8 = u8::try_from(tag).map_err(|_| EvioError::format(format!("segment tag {tag} exceeds 8 bits")))?;
                let w = buffer.word(pos).unwrap_or(0);
                buffer.put_word(pos, (w & 0x00ff_ffff) | (tag8 as u32) << 24);
            }
            StructureType::TagSegment => {
                if tag > 0xfff {
                    return Err(EvioError::format(format!("tagsegment tag {tag} exceeds 12 bits")));
                }
                let w = buffer.word(pos).unwrap_or(0);
                buffer.put_word(pos, (w & 0x000f_ffff) | (tag as u32) << 20);
            }
        }
        self.tree.nodes.borrow_mut()[self.id].tag = tag;
        Ok(())
    }

    /// Change the num of a bank. Segments have no num.
    pub fn update_num(&self, num: u8) -> Result<()> {
        let (kind, pos) = self.live(|n| (n.kind, n.position))?;
        if kind != StructureType::Bank {
            return Err(EvioError::unsupported("only banks carry a num"));
        }
        let buffer = self.buffer();
        let w = buffer.word(pos + 4).unwrap_or(0);
        buffer.put_word(pos + 4, (w & 0xffff_ff00) | num as u32);
        self.tree.nodes.borrow_mut()[self.id].num = num;
        Ok(())
    }

    /// Poison this node and its descendants.
    pub(crate) fn mark_obsolete(&self) {
        let mut nodes = self.tree.nodes.borrow_mut();
        let end = nodes[self.id].subtree_end;
        for n in &mut nodes[self.id..end] {
            n.obsolete = true;
        }
    }
}

impl PartialEq for EvioNode {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.tree, &other.tree) && self.id == other.id
    }
}

impl Eq for EvioNode {}

impl fmt::Debug for EvioNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.data();
        f.debug_struct("EvioNode")
            .field("kind", &n.kind)
            .field("tag", &n.tag)
            .field("num", &n.num)
            .field("data_type", &format_args!("{:#x}", n.data_type))
            .field("position", &n.position)
            .field("length", &n.length)
            .field("obsolete", &n.obsolete)
            .finish()
    }
}

/// Depth-first pre-order scan of the bank at `position`.
fn scan(buf: &[u8], order: crate::order::ByteOrder, position: usize) -> Result<Vec<NodeData>> {
    let mut nodes = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();

    push_node(&mut nodes, &mut stack, buf, order, StructureType::Bank, position, buf.len(), None)?;
    while let Some(frame) = stack.last_mut() {
        if frame.next >= frame.end {
            let done = frame.id;
            stack.pop();
            nodes[done].subtree_end = nodes.len();
            continue;
        }
        let (pos, end, kind, parent) = (frame.next, frame.end, frame.child_kind, frame.id);
        let child = StructureHeader::decode(kind, buf, pos, order)?;
        frame.next += child.total_bytes();
        push_node(&mut nodes, &mut stack, buf, order, kind, pos, end, Some(parent))?;
    }
    Ok(nodes)
}

#[allow(clippy::too_many_arguments)]
fn push_node(
    nodes: &mut Vec<NodeData>,
    stack: &mut Vec<Frame>,
    buf: &[u8],
    order: crate::order::ByteOrder,
    kind: StructureType,
    pos: usize,
    limit: usize,
    parent: Option<usize>,
) -> Result<()> {
    let h = StructureHeader::decode(kind, buf, pos, order)?;
    let total = h.total_bytes();
    if total < h.header_bytes() || pos + total > limit {
        return Err(EvioError::format("bad bank length"));
    }

    let id = nodes.len();
    nodes.push(NodeData {
        kind,
        length: h.length,
        tag: h.tag,
        num: h.num,
        pad: h.pad,
        data_type: h.data_type,
        position: pos,
        data_position: pos + h.header_bytes(),
        parent,
        children: Vec::new(),
        subtree_end: id + 1,
        obsolete: false,
    });
    if let Some(p) = parent {
        nodes[p].children.push(id);
    }

    match h.data_type().and_then(DataType::child_kind) {
        Some(child_kind) => stack.push(Frame {
            id,
            next: pos + h.header_bytes(),
            end: pos + total,
            child_kind,
        }),
        None => nodes[id].subtree_end = id + 1,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::ByteOrder;

    /// Bank(tag 1, banks)
    ///   Bank(tag 2, segments)
    ///     Segment(tag 3, ints)
    ///     Segment(tag 4, tagsegments)
    ///       TagSegment(tag 5, ints)
    ///   Bank(tag 6, ints)
    fn nested(order: ByteOrder) -> Vec<u8> {
        let mut tagseg = Vec::new();
        StructureHeader::tag_segment(5, DataType::Uint32, 1).write(&mut tagseg, order).unwrap();
        order.put_u32(&mut tagseg, 55);

        let mut seg4 = Vec::new();
        StructureHeader::segment(4, DataType::TagSegment, 2).write(&mut seg4, order).unwrap();
        seg4.extend_from_slice(&tagseg);

        let mut seg3 = Vec::new();
        StructureHeader::segment(3, DataType::Uint32, 2).write(&mut seg3, order).unwrap();
        order.put_u32(&mut seg3, 31);
        order.put_u32(&mut seg3, 32);

        let mut bank2 = Vec::new();
        let inner = (seg3.len() + seg4.len()) as u32 / 4;
        StructureHeader::bank(2, 0, DataType::Segment, inner).write(&mut bank2, order).unwrap();
        bank2.extend_from_slice(&seg3);
        bank2.extend_from_slice(&seg4);

        let mut bank6 = Vec::new();
        StructureHeader::bank(6, 9, DataType::Int32, 1).write(&mut bank6, order).unwrap();
        order.put_u32(&mut bank6, 66);

        let mut event = Vec::new();
        let inner = (bank2.len() + bank6.len()) as u32 / 4;
        StructureHeader::bank(1, 1, DataType::Bank, inner).write(&mut event, order).unwrap();
        event.extend_from_slice(&bank2);
        event.extend_from_slice(&bank6);
        event
    }

    fn preorder(node: &EvioNode, out: &mut Vec<u16>) {
        out.push(node.tag());
        for c in node.children().unwrap() {
            preorder(&c, out);
        }
    }

    #[test]
    fn all_nodes_is_depth_first() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let buf = SharedBuffer::new(nested(order), order);
            let ev = EvioNode::extract_event(&buf, 0, 0, buf.limit(), 0).unwrap();
            let tags: Vec<u16> = ev.all_nodes().unwrap().iter().map(EvioNode::tag).collect();
            let mut manual = Vec::new();
            preorder(&ev, &mut manual);
            assert_eq!(tags, manual);
            assert_eq!(tags, vec![1, 2, 3, 4, 5, 6]);
        }
    }

    #[test]
    fn navigation_and_data() {
        let order = ByteOrder::Big;
        let buf = SharedBuffer::new(nested(order), order);
        let ev = EvioNode::extract_event(&buf, 0, 0, buf.limit(), 3).unwrap();
        assert!(ev.is_event());
        assert_eq!(ev.place(), 3);

        let bank6 = ev.child_at(1).unwrap().unwrap();
        assert_eq!(bank6.num(), 9);
        assert_eq!(bank6.int_data().unwrap(), vec![66]);
        assert_eq!(bank6.parent().unwrap(), Some(ev.clone()));

        let tagseg = ev.all_nodes().unwrap()[4].clone();
        assert_eq!(tagseg.kind(), StructureType::TagSegment);
        assert_eq!(tagseg.int_data().unwrap(), vec![55]);
        assert_eq!(tagseg.event(), ev);
        assert_eq!(ev.descendants().unwrap().len(), 5);
        assert_eq!(ev.structure_bytes().unwrap(), nested(order));
    }

    #[test]
    fn bad_length_is_format_error() {
        let order = ByteOrder::Little;
        let mut bytes = nested(order);
        bytes.truncate(bytes.len() - 4);
        let buf = SharedBuffer::new(bytes, order);
        let err = EvioNode::extract_event(&buf, 0, 0, buf.limit(), 0).unwrap_err();
        assert!(matches!(err, EvioError::Format(m) if m == "bad bank length"));
    }

    #[test]
    fn scan_stops_at_given_end() {
        let order = ByteOrder::Big;
        let mut bytes = nested(order);
        let event_len = bytes.len();
        // bytes that would belong to the next record
        bytes.extend_from_slice(&[0; 64]);
        let buf = SharedBuffer::new(bytes, order);
        assert!(EvioNode::extract_event(&buf, 0, 0, event_len, 0).is_ok());
        let err = EvioNode::extract_event(&buf, 0, 0, event_len - 4, 0).unwrap_err();
        assert!(matches!(err, EvioError::Format(m) if m == "bad bank length"));
    }

    #[test]
    fn update_lengths_walks_ancestors() {
        let order = ByteOrder::Big;
        let buf = SharedBuffer::new(nested(order), order);
        let ev = EvioNode::extract_event(&buf, 0, 0, buf.limit(), 0).unwrap();
        let seg4 = ev.all_nodes().unwrap()[3].clone();
        let before: Vec<u32> = ev.all_nodes().unwrap().iter().map(EvioNode::length).collect();

        seg4.update_lengths(2).unwrap();
        assert_eq!(seg4.length(), before[3] + 2);
        assert_eq!(ev.length(), before[0] + 2);
        assert_eq!(buf.word(0), Some(before[0] + 2));
        // untouched sibling
        assert_eq!(ev.all_nodes().unwrap()[2].length(), before[2]);
    }

    #[test]
    fn shift_moves_subtree() {
        let order = ByteOrder::Little;
        let mut bytes = vec![0u8; 8];
        bytes.extend_from_slice(&nested(order));
        let buf = SharedBuffer::new(nested(order), order);
        let ev = EvioNode::extract_event(&buf, 0, 0, buf.limit(), 0).unwrap();
        ev.shift(8).set_buffer(&SharedBuffer::new(bytes, order));
        assert_eq!(ev.position(), 8);
        assert_eq!(ev.record_position(), 8);
        assert_eq!(ev.all_nodes().unwrap()[5].int_data().unwrap(), vec![66]);
    }

    #[test]
    fn obsolete_nodes_refuse_access() {
        let order = ByteOrder::Big;
        let buf = SharedBuffer::new(nested(order), order);
        let ev = EvioNode::extract_event(&buf, 0, 0, buf.limit(), 0).unwrap();
        let bank2 = ev.child_at(0).unwrap().unwrap();
        bank2.mark_obsolete();
        assert!(matches!(bank2.data_bytes(), Err(EvioError::Obsolete)));
        assert!(matches!(ev.all_nodes().unwrap()[2].children(), Err(EvioError::Obsolete)));
        assert!(ev.child_at(1).unwrap().unwrap().int_data().is_ok());
    }

    #[test]
    fn update_tag_and_num() {
        let order = ByteOrder::Little;
        let buf = SharedBuffer::new(nested(order), order);
        let ev = EvioNode::extract_event(&buf, 0, 0, buf.limit(), 0).unwrap();
        let seg3 = ev.all_nodes().unwrap()[2].clone();
        seg3.update_tag(200).unwrap();
        assert!(seg3.update_tag(300).is_err());
        assert!(matches!(seg3.update_num(1), Err(EvioError::Unsupported(_))));
        ev.update_num(42).unwrap();

        let rescanned = EvioNode::extract_event(&buf, 0, 0, buf.limit(), 0).unwrap();
        assert_eq!(rescanned.num(), 42);
        assert_eq!(rescanned.all_nodes().unwrap()[2].tag(), 200);
    }
}

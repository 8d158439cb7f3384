//! Byte order conversion of evio events.
//!
//! Structure headers are always 32-bit words. Data is swapped according to
//! its declared type: 16, 32 and 64-bit arrays element by element, byte
//! data untouched, containers recursively. Composite data is not handled.

use crate::error::{EvioError, Result};
use crate::node::{DataType, StructureHeader, StructureType};
use crate::order::ByteOrder;

/// Swap a block of typed data in place. Only the first `len - pad` bytes of
/// 8 and 16-bit data are meaningful and the rest is left alone.
pub fn swap_data(data_type: DataType, data: &mut [u8], pad: u8) -> Result<()> {
    if data_type == DataType::Composite {
        return Err(EvioError::unsupported("swapping composite data"));
    }
    if data_type.is_container() {
        return Err(EvioError::unsupported("swap_data called on container data, use swap_event"));
    }
    let width = data_type.element_size();
    if width == 1 {
        return Ok(());
    }
    let used = if width == 2 { data.len().saturating_sub(pad as usize) } else { data.len() };
    if used % width != 0 {
        return Err(EvioError::format(format!(
            "{} bytes of {data_type:?} data is not a whole number of elements",
            used
        )));
    }
    for element in data[..used].chunks_exact_mut(width) {
        element.reverse();
    }
    Ok(())
}

/// Convert one event (a bank and everything in it) from `from` to the
/// opposite byte order, in place.
pub fn swap_event_in_place(event: &mut [u8], from: ByteOrder) -> Result<()> {
    // (kind, position, end of enclosing container)
    let mut pending = vec![(StructureType::Bank, 0usize, event.len())];
    while let Some((kind, pos, end)) = pending.pop() {
        let h = StructureHeader::decode(kind, event, pos, from)?;
        let total = h.total_bytes();
        if total < h.header_bytes() || pos + total > end {
            return Err(EvioError::format("bad bank length"));
        }
        for word in event[pos..pos + h.header_bytes()].chunks_exact_mut(4) {
            word.reverse();
        }

        let data = pos + h.header_bytes()..pos + total;
        let data_type = h
            .data_type()
            .ok_or_else(|| EvioError::unsupported(format!("swapping data type {:#x}", h.data_type)))?;
        match data_type.child_kind() {
            Some(child_kind) => {
                // headers are still in the source order, so walk children
                // before any of them is swapped
                let mut children = Vec::new();
                let mut child = data.start;
                while child < data.end {
                    let ch = StructureHeader::decode(child_kind, event, child, from)?;
                    if ch.total_bytes() == 0 || child + ch.total_bytes() > data.end {
                        return Err(EvioError::format("bad bank length"));
                    }
                    children.push((child_kind, child, data.end));
                    child += ch.total_bytes();
                }
                pending.extend(children);
            }
            None => swap_data(data_type, &mut event[data], h.pad)?,
        }
    }
    Ok(())
}

/// Swapped copy of `event`.
pub fn swap_event(event: &[u8], from: ByteOrder) -> Result<Vec<u8>> {
    let mut out = event.to_vec();
    swap_event_in_place(&mut out, from)?;
    Ok(out)
}

/// Swap `event` into `dest`, which must be at least as long.
pub fn swap_event_into(event: &[u8], from: ByteOrder, dest: &mut [u8]) -> Result<()> {
    let dest = dest
        .get_mut(..event.len())
        .ok_or_else(|| EvioError::format("destination too small for swapped event"))?;
    dest.copy_from_slice(event);
    swap_event_in_place(dest, from)
}

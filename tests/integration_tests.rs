//! Integration tests for hipo-evio
//!
//! End-to-end workflows: writing buffers and files, indexing them back,
//! dictionaries, compression, corrupted input and the multi-threaded writer.

use hipo_evio::*;
use tempfile::tempdir;

fn int_bank(order: ByteOrder, tag: u16, ints: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    StructureHeader::bank(tag, 0, DataType::Uint32, ints.len() as u32)
        .write(&mut out, order)
        .unwrap();
    for &i in ints {
        order.put_u32(&mut out, i);
    }
    out
}

fn write_buffer(opts: WriterOptions, events: &[Vec<u8>]) -> Vec<u8> {
    let mut writer = Writer::to_buffer(opts).unwrap();
    for ev in events {
        writer.add_event(ev).unwrap();
    }
    writer.into_buffer().unwrap()
}

#[test]
fn test_big_endian_uncompressed_buffer() {
    let order = ByteOrder::Big;
    let events: Vec<Vec<u8>> = (0..3)
        .map(|t| int_bank(order, t, &(0..10).collect::<Vec<_>>()))
        .collect();
    let bytes = write_buffer(WriterOptions::default().with_byte_order(order), &events);

    let header = RecordHeader::read(&bytes, 0).unwrap();
    assert_eq!(header.order, ByteOrder::Big);
    assert_eq!(header.entries, 3);
    assert_eq!(header.index_length, 12);
    assert_eq!(header.data_length, 3 * 48);
    assert_eq!(header.record_length, 56 + 12 + 3 * 48);
    assert_eq!(&bytes[28..32], &[0xc0, 0xda, 0x01, 0x00]);

    let mut reader = Reader::from_buffer(bytes).unwrap();
    assert_eq!(reader.event_count(), 3);
    assert_eq!(reader.byte_order(), ByteOrder::Big);
    assert!(!reader.is_compressed());
    for (i, ev) in events.iter().enumerate() {
        assert_eq!(reader.get_event(i).unwrap().as_ref(), Some(ev));
    }
    assert!(reader.get_event(3).unwrap().is_none());
}

#[test]
fn test_record_lengths_add_up() {
    let order = ByteOrder::Little;
    let events: Vec<Vec<u8>> = (0..7).map(|t| int_bank(order, t, &[t as u32; 5])).collect();
    let opts = WriterOptions::default().with_dictionary("<dict/>");
    let bytes = write_buffer(opts, &events);

    let h = RecordHeader::read(&bytes, 0).unwrap();
    h.check_lengths().unwrap();
    assert_eq!(
        h.record_length as usize,
        h.header_length as usize + h.index_length as usize + h.padded_user_header_length() + h.data_length as usize
    );
    assert_eq!(h.record_length % 4, 0);
}

#[cfg(feature = "compression-gzip")]
#[test]
fn test_dictionary_with_gzip_buffer() {
    let order = ByteOrder::native();
    let events = vec![int_bank(order, 1, &[1, 2]), int_bank(order, 2, &[3])];
    let opts = WriterOptions::default()
        .with_compression(CompressionType::Gzip)
        .with_dictionary("ok");
    let bytes = write_buffer(opts, &events);

    let mut reader = Reader::from_buffer(bytes).unwrap();
    assert!(reader.is_compressed());
    assert!(reader.has_dictionary());
    assert_eq!(reader.dictionary().unwrap().as_deref(), Some("ok"));
    assert_eq!(reader.first_event().unwrap(), None);
    assert_eq!(reader.event_count(), 2);
    assert_eq!(reader.get_event(1).unwrap(), Some(events[1].clone()));
}

#[test]
fn test_truncated_record_is_format_error() {
    let order = ByteOrder::native();
    let bytes = write_buffer(WriterOptions::default(), &[int_bank(order, 1, &[0; 20])]);
    let claimed = RecordHeader::read(&bytes, 0).unwrap().record_length;
    assert!(claimed > 60);

    let truncated = bytes[..60].to_vec();
    let err = Reader::from_buffer(truncated).unwrap_err();
    assert!(matches!(err, EvioError::Format(_)), "{err}");
}

#[test]
fn test_file_roundtrip_with_trailer_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.evio");
    let order = ByteOrder::Little;
    let events: Vec<Vec<u8>> = (0..100).map(|i| int_bank(order, i, &[i as u32, 7])).collect();

    let opts = WriterOptions::default()
        .with_byte_order(order)
        .with_max_event_count(10)
        .with_dictionary("<xml>run</xml>")
        .with_first_event(int_bank(order, 999, &[1]));
    let mut writer = Writer::create(&path, opts).unwrap();
    for ev in &events {
        writer.add_event(ev).unwrap();
    }
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let fh = reader.file_header().unwrap().clone();
    assert!(fh.has_trailer_with_index);
    assert_eq!(fh.record_count, 10);
    assert_eq!(reader.record_count(), 10);
    assert_eq!(reader.event_count(), 100);
    assert_eq!(reader.dictionary().unwrap().as_deref(), Some("<xml>run</xml>"));
    assert_eq!(reader.first_event().unwrap(), Some(int_bank(order, 999, &[1])));

    assert_eq!(reader.get_event(57).unwrap(), Some(events[57].clone()));
    assert_eq!(reader.current_record(), Some(5));
    assert_eq!(reader.record_event_count(), 10);

    let indexed = reader.record_positions().to_vec();
    let opts = ReaderOptions {
        force_scan: true,
        ..Default::default()
    };
    let scanned = Reader::open_with(&path, opts).unwrap();
    assert_eq!(scanned.record_positions(), &indexed[..]);
}

#[test]
fn test_file_without_trailer_index_is_scanned() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("plain.hipo");
    let mut opts = WriterOptions::default()
        .with_flavor(Flavor::Hipo)
        .with_max_event_count(3);
    opts.add_trailer_index = false;

    let order = opts.byte_order;
    let mut writer = Writer::create(&path, opts).unwrap();
    for t in 0..8 {
        writer.add_event(&int_bank(order, t, &[t as u32])).unwrap();
    }
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    assert_eq!(reader.file_header().unwrap().file_id, header::HIPO_FILE_ID);
    assert_eq!(reader.record_count(), 3);
    assert_eq!(reader.event_count(), 8);
    let last = reader.get_event(7).unwrap().unwrap();
    assert_eq!(order.read_u32(&last[8..]), 7);
}

#[test]
fn test_out_of_sequence_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seq.evio");
    let opts = WriterOptions::default().with_max_event_count(1);
    let order = opts.byte_order;
    let mut writer = Writer::create(&path, opts).unwrap();
    for t in 0..3 {
        writer.add_event(&int_bank(order, t, &[0])).unwrap();
    }
    writer.close().unwrap();

    // renumber the second record
    let mut bytes = std::fs::read(&path).unwrap();
    let fh = FileHeader::read(&bytes).unwrap();
    let first = fh.length() as usize;
    let second = first + RecordHeader::read(&bytes, first).unwrap().record_length as usize;
    order.write_u32(&mut bytes[second + 4..], 9);
    std::fs::write(&path, &bytes).unwrap();

    let checked = ReaderOptions {
        force_scan: true,
        check_record_number_sequence: true,
    };
    let err = Reader::open_with(&path, checked).unwrap_err();
    assert!(matches!(err, EvioError::OutOfSequence { expected: 2, found: 9 }));

    // without the check the file reads fine
    let reader = Reader::open(&path).unwrap();
    assert_eq!(reader.event_count(), 3);
}

#[test]
fn test_sequential_reads_over_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cursor.evio");
    let opts = WriterOptions::default().with_max_event_count(4);
    let order = opts.byte_order;
    let mut writer = Writer::create(&path, opts).unwrap();
    for t in 0..10 {
        writer.add_event(&int_bank(order, t, &[t as u32])).unwrap();
    }
    writer.close().unwrap();

    let value = |ev: Option<Vec<u8>>| order.read_u32(&ev.unwrap()[8..]);
    let mut reader = Reader::open(&path).unwrap();
    assert_eq!(value(reader.get_event(5).unwrap()), 5);
    assert_eq!(value(reader.get_next_event().unwrap()), 6);
    assert_eq!(value(reader.get_next_event().unwrap()), 7);
    assert_eq!(value(reader.get_prev_event().unwrap()), 6);
    assert_eq!(value(reader.get_prev_event().unwrap()), 5);
    assert_eq!(reader.num_events_remaining(), 4);

    let mut count = 0;
    while reader.get_next_event().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 4);
    reader.close();
    assert!(matches!(reader.get_next_event(), Err(EvioError::Closed)));
}

#[test]
fn test_multithreaded_writer_keeps_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mt.evio");
    let mut opts = WriterOptions::default()
        .with_max_event_count(13)
        .with_threads(3)
        .with_ring_size(4);
    if CompressionType::Gzip.is_available() {
        opts = opts.with_compression(CompressionType::Gzip);
    }
    let order = opts.byte_order;

    let mut writer = WriterMT::create(&path, opts).unwrap();
    for i in 0..1000u32 {
        writer.add_event(&int_bank(order, 1, &[i, i ^ 0xffff])).unwrap();
    }
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    assert_eq!(reader.event_count(), 1000);
    let mut expected = 0;
    while let Some(ev) = reader.get_next_event().unwrap() {
        assert_eq!(order.read_u32(&ev[8..]), expected);
        expected += 1;
    }
    assert_eq!(expected, 1000);

    let numbers: Vec<u32> = (0..reader.record_count())
        .map(|r| reader.read_record(r).unwrap().header().record_number)
        .collect();
    assert_eq!(numbers, (1..=reader.record_count() as u32).collect::<Vec<_>>());
}

#[test]
fn test_unopened_reader() {
    let mut reader = Reader::new(ReaderOptions::default());
    assert_eq!(reader.state(), ReaderState::Unopened);
    assert!(matches!(reader.get_event(0), Err(EvioError::Closed)));
}

fn write_file(path: &std::path::Path, opts: WriterOptions, events: &[Vec<u8>]) {
    let mut writer = Writer::create(path, opts).unwrap();
    for ev in events {
        writer.add_event(ev).unwrap();
    }
    writer.close().unwrap();
}

fn forced_positions(path: &std::path::Path) -> Vec<RecordPosition> {
    let opts = ReaderOptions {
        force_scan: true,
        ..Default::default()
    };
    Reader::open_with(path, opts).unwrap().record_positions().to_vec()
}

#[test]
fn test_file_header_index_is_used() {
    let dir = tempdir().unwrap();
    let plain = dir.path().join("plain.evio");
    let order = ByteOrder::Big;
    let events: Vec<Vec<u8>> = (0..9).map(|i| int_bank(order, i, &[i as u32; 3])).collect();
    let mut opts = WriterOptions::default()
        .with_byte_order(order)
        .with_max_event_count(4);
    opts.add_trailer_index = false;
    write_file(&plain, opts, &events);

    // rebuild the file with the record index stored after the file header
    let original = std::fs::read(&plain).unwrap();
    let fh = FileHeader::read(&original).unwrap();
    let scanned = forced_positions(&plain);
    let mut index = Vec::new();
    for p in &scanned {
        order.put_u32(&mut index, p.length);
        order.put_u32(&mut index, p.count);
    }
    let mut indexed_fh = fh.clone();
    indexed_fh.index_length = index.len() as u32;
    indexed_fh.has_trailer_with_index = false;
    indexed_fh.trailer_position = fh.trailer_position + index.len() as u64;

    let mut bytes = indexed_fh.to_bytes().unwrap().to_vec();
    bytes.extend_from_slice(&index);
    bytes.extend_from_slice(&original[fh.header_length as usize..]);
    let indexed = dir.path().join("indexed.evio");
    std::fs::write(&indexed, &bytes).unwrap();

    let mut reader = Reader::open(&indexed).unwrap();
    assert!(reader.file_header().unwrap().has_index());
    assert_eq!(reader.record_count(), 3);
    assert_eq!(reader.record_positions(), &forced_positions(&indexed)[..]);
    assert_eq!(
        reader.record_positions()[0].position,
        scanned[0].position + index.len() as u64
    );
    for (i, ev) in events.iter().enumerate() {
        assert_eq!(reader.get_event(i).unwrap().as_ref(), Some(ev));
    }
}

#[test]
fn test_bad_trailer_position_falls_back_to_scan() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("moved.evio");
    let order = ByteOrder::Little;
    let events: Vec<Vec<u8>> = (0..6).map(|i| int_bank(order, i, &[i as u32])).collect();
    write_file(
        &path,
        WriterOptions::default().with_byte_order(order).with_max_event_count(2),
        &events,
    );

    // point the trailer position at the first data record
    let mut bytes = std::fs::read(&path).unwrap();
    let mut fh = FileHeader::read(&bytes).unwrap();
    assert!(fh.has_trailer_with_index);
    fh.trailer_position = fh.length();
    bytes[..header::HEADER_SIZE_BYTES].copy_from_slice(&fh.to_bytes().unwrap());
    std::fs::write(&path, &bytes).unwrap();

    let mut reader = Reader::open(&path).unwrap();
    assert_eq!(reader.record_count(), 3);
    assert_eq!(reader.event_count(), 6);
    assert_eq!(reader.record_positions(), &forced_positions(&path)[..]);
    assert_eq!(reader.get_event(5).unwrap(), Some(events[5].clone()));
}

#[test]
fn test_huge_header_length_is_format_error() {
    let order = ByteOrder::Big;
    let mut bytes = write_buffer(
        WriterOptions::default().with_byte_order(order),
        &[int_bank(order, 1, &[1, 2])],
    );
    order.write_u32(&mut bytes[header::HEADER_LENGTH_OFFSET..], 0x4000_0000);
    let err = Reader::from_buffer(bytes).unwrap_err();
    assert!(matches!(err, EvioError::Format(_)), "{err}");
}

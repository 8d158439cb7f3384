//! Property tests: whatever goes through a writer comes back out of a reader.

use hipo_evio::*;
use proptest::prelude::*;

fn codec() -> impl Strategy<Value = CompressionType> {
    prop_oneof![
        Just(CompressionType::None),
        Just(CompressionType::Lz4),
        Just(CompressionType::Lz4Best),
        Just(CompressionType::Gzip),
    ]
    .prop_filter("codec compiled in", |c| c.is_available())
}

fn order() -> impl Strategy<Value = ByteOrder> {
    prop_oneof![Just(ByteOrder::Big), Just(ByteOrder::Little)]
}

fn bank(order: ByteOrder, tag: u16, ints: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    StructureHeader::bank(tag, 0, DataType::Uint32, ints.len() as u32)
        .write(&mut out, order)
        .unwrap();
    for &i in ints {
        order.put_u32(&mut out, i);
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn buffer_roundtrip(
        codec in codec(),
        order in order(),
        per_record in 1u32..8,
        payloads in prop::collection::vec(prop::collection::vec(any::<u32>(), 0..40), 1..40),
    ) {
        let events: Vec<Vec<u8>> = payloads
            .iter()
            .enumerate()
            .map(|(i, ints)| bank(order, i as u16, ints))
            .collect();
        let opts = WriterOptions::default()
            .with_byte_order(order)
            .with_compression(codec)
            .with_max_event_count(per_record);

        let mut writer = Writer::to_buffer(opts).unwrap();
        for ev in &events {
            writer.add_event(ev).unwrap();
        }
        let bytes = writer.into_buffer().unwrap();

        let mut reader = Reader::from_buffer(bytes).unwrap();
        prop_assert_eq!(reader.event_count(), events.len());
        prop_assert_eq!(reader.byte_order(), order);
        let expected_records = events.len().div_ceil(per_record as usize);
        prop_assert_eq!(reader.record_count(), expected_records);
        for (i, ev) in events.iter().enumerate() {
            let got = reader.get_event(i).unwrap();
            prop_assert_eq!(got.as_ref(), Some(ev));
        }
    }
}

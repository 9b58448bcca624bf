//! Protocol encoding/decoding benchmarks.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gea2_protocol::{
    encode_records, DynamicSerializer, Endian, ErdCommand, ErdFrame, ErdRecord, Message, Packet,
    PacketDecoder, PacketEncoder, Serializer, Value, ValueKind, MAX_PACKET_DATA,
};

fn create_test_message(payload_size: usize) -> Message {
    Message::new(0xBB, 0xC0, 0xF0, vec![0x42u8; payload_size])
}

fn create_publish_payload(count: usize) -> Vec<u8> {
    let records: Vec<ErdRecord> = (0..count)
        .map(|i| ErdRecord::new(0x4000 + i as u16, vec![0x01, 0x02, 0x03, 0x04]))
        .collect();
    encode_records(&records).unwrap().to_vec()
}

fn bench_packet_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode");

    for size in [8, 64, MAX_PACKET_DATA] {
        let message = create_test_message(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| black_box(PacketEncoder::encode(message).unwrap()));
        });
    }

    group.finish();
}

fn bench_packet_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_decode");

    for size in [8, 64, MAX_PACKET_DATA] {
        let encoded = Packet::encode(&create_test_message(size)).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                black_box(Packet::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_stream_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decode");

    // Many small packets arriving in one read.
    for count in [1, 16, 128] {
        let mut stream = Vec::new();
        for _ in 0..count {
            stream.extend_from_slice(&PacketEncoder::encode(&create_test_message(5)).unwrap());
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &stream, |b, stream| {
            b.iter(|| {
                let mut decoder = PacketDecoder::new();
                decoder.extend(stream);
                let mut decoded = 0;
                while let Some(message) = decoder.decode().unwrap() {
                    black_box(message);
                    decoded += 1;
                }
                decoded
            });
        });
    }

    group.finish();
}

fn bench_frame_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_classify");

    for count in [1, 8, 24] {
        let payload = create_publish_payload(count);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &payload, |b, payload| {
            b.iter(|| {
                black_box(ErdFrame::classify(ErdCommand::Publish, payload).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_dynamic_serializer(c: &mut Criterion) {
    let mut group = c.benchmark_group("dynamic_serializer");

    let serializer = DynamicSerializer::new(ValueKind::U32, Endian::Big);
    let value = Value::Unsigned(0xDEAD_BEEF);
    let encoded = serializer.serialize(&value).unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("serialize_u32", |b| {
        b.iter(|| black_box(serializer.serialize(&value).unwrap()));
    });
    group.bench_function("deserialize_u32", |b| {
        b.iter(|| black_box(serializer.deserialize(&encoded).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet_encode,
    bench_packet_decode,
    bench_stream_decode,
    bench_frame_classify,
    bench_dynamic_serializer,
);

criterion_main!(benches);

//! Protocol encoding/decoding benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use highway_protocol::{
    assemble_request, split_frame, ContextMap, Decoder, Encoder, FieldType, Invocation,
    MessageType, OperationId, OperationSchema, RequestHeader, Response, Value,
};
use std::collections::BTreeMap;

fn operation() -> OperationId {
    OperationId::new("bench", "codeFirst", "sayHello")
}

fn schema() -> OperationSchema {
    let person = MessageType::new("Person")
        .required_field("name", FieldType::String)
        .field("age", FieldType::int32())
        .field("tags", FieldType::repeated(FieldType::String));
    OperationSchema::builder(operation())
        .required_param("person", FieldType::message(person))
        .param("count", FieldType::int64())
        .returns(FieldType::String)
        .build()
}

fn create_test_invocation(payload_size: usize) -> Invocation {
    let person = BTreeMap::from([
        ("name".to_string(), Value::from("x".repeat(payload_size))),
        ("age".to_string(), Value::Int32(42)),
        (
            "tags".to_string(),
            Value::List(vec![Value::from("a"), Value::from("b")]),
        ),
    ]);
    Invocation::new(operation())
        .with_argument("person", Value::Message(person))
        .with_argument("count", Value::Int64(7))
        .with_context("trace-id", "bench-1")
}

fn create_test_response(payload_size: usize) -> Response {
    Response::ok(Some(Value::from("x".repeat(payload_size))))
}

fn bench_frame_assemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_assemble");
    let header = RequestHeader::default().encode();

    for size in [100, 1000, 10000] {
        let body = vec![0x42u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| black_box(assemble_request(1, &header, body).unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_split");
    let header = RequestHeader::default().encode();

    for size in [100, 1000, 10000] {
        let encoded = assemble_request(1, &header, &vec![0x42u8; size]).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| black_box(split_frame(encoded).unwrap()));
        });
    }

    group.finish();
}

fn bench_request_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_encode");
    let schema = schema();

    for size in [100, 1000, 10000] {
        let invocation = create_test_invocation(size);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(size),
            &invocation,
            |b, invocation| {
                b.iter(|| black_box(Encoder::encode_request(1, invocation, &schema).unwrap()));
            },
        );
    }

    group.finish();
}

fn bench_request_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_decode");
    let schema = schema();

    for size in [100, 1000, 10000] {
        let encoded = Encoder::encode_request(1, &create_test_invocation(size), &schema).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                let frame = decoder.decode_frame().unwrap().unwrap();
                let header = Decoder::read_request_header(&frame).unwrap();
                let mut invocation = Invocation::from_request_header(&header);
                Decoder::decode_request(&mut invocation, &header, &schema, &frame.body).unwrap();
                black_box(invocation)
            });
        });
    }

    group.finish();
}

fn bench_response_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_encode");
    let schema = schema();
    let context = ContextMap::new();

    for size in [100, 1000, 10000] {
        let response = create_test_response(size);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(size),
            &response,
            |b, response| {
                b.iter(|| {
                    black_box(Encoder::encode_response(1, &schema, response, &context).unwrap())
                });
            },
        );
    }

    group.finish();
}

fn bench_response_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_decode");
    let schema = schema();

    for size in [100, 1000, 10000] {
        let encoded =
            Encoder::encode_response(1, &schema, &create_test_response(size), &ContextMap::new())
                .unwrap();
        let frame = split_frame(&encoded).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| {
                let mut invocation = Invocation::new(operation());
                black_box(Decoder::decode_response(&mut invocation, &schema, frame).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_assemble,
    bench_frame_split,
    bench_request_encode,
    bench_request_decode,
    bench_response_encode,
    bench_response_decode,
);

criterion_main!(benches);

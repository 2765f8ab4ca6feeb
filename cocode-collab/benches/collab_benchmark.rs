use criterion::{criterion_group, criterion_main, Criterion};
use cocode_collab::auth::Identity;
use cocode_collab::hub::{ConnectionHandle, Hub};
use cocode_collab::protocol::{EditData, Envelope, Payload};
use cocode_collab::state::SharedState;
use std::hint::black_box;
use std::sync::Arc;

fn sample_code(len: usize) -> String {
    "int x = 0; // filler\n".repeat(len / 21 + 1)
}

fn edit_envelope(len: usize) -> Envelope {
    Envelope::from_identity(
        &Identity::new("alice", "Alice"),
        Payload::Edit(EditData {
            code: sample_code(len),
            version: Some(1),
        }),
    )
}

fn bench_envelope_encode(c: &mut Criterion) {
    let envelope = edit_envelope(4096);

    c.bench_function("edit_encode_4KB", |b| {
        b.iter(|| black_box(black_box(&envelope).encode().unwrap()))
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let encoded = edit_envelope(4096).encode().unwrap();

    c.bench_function("edit_decode_4KB", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_relay_decode(c: &mut Criterion) {
    let frame = r#"{"type":"cursor","data":{"line":12,"col":4,"selection":[1,2,3,4]}}"#;

    c.bench_function("relay_decode", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(frame)).unwrap()))
    });
}

fn bench_apply_edit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let state = SharedState::default();
    let code = sample_code(4096);

    c.bench_function("apply_edit_4KB", |b| {
        b.iter(|| rt.block_on(async { black_box(state.apply_edit(code.as_str()).await) }))
    });
}

fn bench_hub_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let envelope = edit_envelope(1024);

    c.bench_function("hub_1000_msgs_100_conns", |b| {
        b.iter(|| {
            rt.block_on(async {
                let hub = Hub::start(Arc::new(SharedState::default()));

                let mut queues = Vec::new();
                for i in 0..100 {
                    let identity = Identity::new(format!("user{i}"), format!("User {i}"));
                    let (conn, queue) = ConnectionHandle::new(identity, 2048);
                    hub.register(conn);
                    queues.push(queue);
                }

                for _ in 0..1000 {
                    hub.broadcast(black_box(&envelope)).unwrap();
                }

                // Wait until the last connection saw every frame.
                let last = queues.last_mut().unwrap();
                let mut edits = 0;
                while edits < 1000 {
                    let frame = last.recv().await.unwrap();
                    if frame.contains("\"edit\"") {
                        edits += 1;
                    }
                }
                hub.shutdown();
            });
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_relay_decode,
    bench_apply_edit,
    bench_hub_fan_out,
);
criterion_main!(benches);

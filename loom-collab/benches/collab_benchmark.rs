use criterion::{criterion_group, criterion_main, Criterion};
use loom_collab::broadcast::BroadcastGroup;
use loom_collab::protocol::Message;
use loom_collab::registry::RoomRegistry;
use loom_collab::relay::Relay;
use loom_core::awareness::{encode_update, AwarenessEntry};
use loom_core::{Document, StateVector};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;

/// Diff of a typical keystroke burst.
fn small_update() -> Vec<u8> {
    let mut doc = Document::new(1);
    doc.insert(0, "let x = 42;").unwrap();
    doc.diff_since(&StateVector::new())
}

fn bench_frame_encode(c: &mut Criterion) {
    let update = small_update();
    c.bench_function("frame_encode_update", |b| {
        b.iter(|| black_box(Message::update(black_box(update.clone())).encode()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let frame = Message::update(small_update()).encode();
    c.bench_function("frame_decode_update", |b| {
        b.iter(|| black_box(Message::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_awareness_frame(c: &mut Criterion) {
    let entry = AwarenessEntry {
        client: 7,
        clock: 12,
        state: Some(json!({"user": {"name": "Ada", "color": "#30bced"}, "cursor": {"anchor": 10, "head": 14}})),
    };
    c.bench_function("awareness_frame_encode", |b| {
        b.iter(|| black_box(Message::awareness(encode_update(black_box(std::slice::from_ref(&entry)))).encode()))
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let group = BroadcastGroup::new(2048);
    let mut receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let frame = vec![0u8; 64];

    c.bench_function("broadcast_1000_to_100", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                group.publish(None, black_box(frame.clone()));
            }
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_relay_apply_and_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let relay = Relay::new(Arc::new(RoomRegistry::new(4096)));
    let (mut session, _) = rt.block_on(relay.connect("bench"));
    let mut editor = Document::new(1);

    c.bench_function("relay_keystroke", |b| {
        b.iter(|| {
            let before = editor.state_vector().clone();
            let pos = editor.len();
            editor.insert(pos, "a").unwrap();
            let frame = Message::update(editor.diff_since(&before)).encode();
            rt.block_on(relay.handle_frame(&mut session, black_box(&frame)))
                .unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_awareness_frame,
    bench_broadcast_fan_out,
    bench_relay_apply_and_publish,
);

criterion_main!(benches);

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

use scriblepad_collab::protocol::{AwarenessState, PeerInfo, SyncMessage};
use scriblepad_collab::{BroadcastGroup, OfflineQueue, RelayHub};
use scriblepad_core::{DiffStrategy, SharedDocument, TextField};

/// Full state of a document holding `chars` characters of body text.
fn document_state(chars: usize) -> Vec<u8> {
    let doc = SharedDocument::new();
    let origin = doc.new_origin();
    let body = "lorem ipsum ".repeat(chars / 12 + 1);
    doc.set_text(TextField::Body, &body[..chars], DiffStrategy::Minimal, origin)
        .unwrap();
    doc.encode_state()
}

fn bench_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let update = document_state(64);

    c.bench_function("update_encode_64_chars", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(peer), black_box("room"), black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = SyncMessage::update(Uuid::new_v4(), "room", document_state(64));
    let encoded = msg.encode().unwrap();

    c.bench_function("update_decode_64_chars", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let state = AwarenessState::with_user("Swift Fox", "#e06c75");

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(
                black_box(peer),
                black_box("room"),
                black_box(7),
                Some(black_box(&state)),
            )
            .unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let msg = SyncMessage::update(Uuid::new_v4(), "room", document_state(256));

    c.bench_function("broadcast_fan_out_10_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(64);
                let mut receivers = Vec::new();
                for _ in 0..10 {
                    let info = PeerInfo::new(Uuid::new_v4(), "peer", "#98c379");
                    receivers.push(group.add_peer(info).await);
                }
                group.broadcast(black_box(&msg)).unwrap();
                for rx in &mut receivers {
                    black_box(rx.recv().await.unwrap());
                }
            })
        })
    });
}

fn bench_offline_queue_drain(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_drain", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for seq in 0..1000 {
                queue.enqueue(seq, vec![0u8; 48]);
            }
            black_box(queue.drain());
        })
    });
}

fn bench_relay_sync_step1(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let hub = Arc::new(RelayHub::in_memory());
    let peer = Uuid::new_v4();
    let room = rt.block_on(async {
        let joined = hub
            .join("bench", PeerInfo::new(peer, "peer", "#61afef"))
            .await
            .unwrap();
        hub.handle(
            &joined.room,
            &SyncMessage::update(peer, "bench", document_state(4096)),
        );
        joined.room
    });
    let request = SyncMessage::sync_step1(peer, "bench", SharedDocument::new().state_vector());

    c.bench_function("relay_sync_step1_4k_chars", |b| {
        b.iter(|| black_box(hub.handle(&room, black_box(&request))))
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_encode,
    bench_broadcast_fan_out,
    bench_offline_queue_drain,
    bench_relay_sync_step1,
);
criterion_main!(benches);

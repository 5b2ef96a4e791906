//! Throughput benchmarks for the room router and hub.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parley_bench::{connection, drain, router_with_room, typing_event};
use parley_core::{Hub, HubConfig, RoomId, RoomRouter};
use uuid::Uuid;

/// Benchmark room membership changes.
fn bench_router(c: &mut Criterion) {
    let mut group = c.benchmark_group("router");

    group.bench_function("register_join_release", |b| {
        let router = RoomRouter::new();
        let room = RoomId::Chat(Uuid::new_v4());
        let mut i = 0usize;
        b.iter(|| {
            let (handle, _rx) = connection(i, Uuid::new_v4());
            let id = handle.id().clone();
            i += 1;
            router.register(handle).unwrap();
            router.join(&id, room).unwrap();
            black_box(router.release(&id))
        });
    });

    group.bench_function("broadcast_1_member", |b| {
        let chat = Uuid::new_v4();
        let (router, mut rxs) = router_with_room(1, RoomId::Chat(chat));
        let event = typing_event(chat);
        b.iter(|| {
            let report = router.broadcast(RoomId::Chat(chat), black_box(event.clone()), None);
            drain(&mut rxs);
            report
        });
    });

    group.finish();
}

/// Benchmark fan-out to rooms of increasing size.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let chat = Uuid::new_v4();
            let (router, mut rxs) = router_with_room(size, RoomId::Chat(chat));
            let event = typing_event(chat);

            b.iter(|| {
                let report = router.broadcast(RoomId::Chat(chat), black_box(event.clone()), None);
                drain(&mut rxs);
                report
            });
        });
    }

    group.finish();
}

/// Benchmark connection admission, which joins rooms and updates presence.
fn bench_hub(c: &mut Criterion) {
    let mut group = c.benchmark_group("hub");

    for chats in [1, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("admit_release", chats), chats, |b, &chats| {
            let hub = Hub::new(HubConfig::default());
            let chat_ids: Vec<Uuid> = (0..chats).map(|_| Uuid::new_v4()).collect();
            b.iter(|| {
                let session = hub.admit(Uuid::new_v4(), black_box(&chat_ids)).unwrap();
                hub.release(&session.handle)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_router, bench_fanout, bench_hub);
criterion_main!(benches);

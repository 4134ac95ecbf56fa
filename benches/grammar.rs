use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pallas::{
    ArchiveId, AttributeList, Event, EventKind, GlobalArchive, Parameters, Storage, Thread,
    ThreadId, ThreadWriter,
};

/// Builds a thread with `nb_repeats` repetitions of a 3-event loop body,
/// exercising the online loop detector the way a real trace would.
fn build_thread(nb_repeats: usize, params: Parameters) -> Thread {
    let mut writer = ThreadWriter::new(Thread::new(ThreadId(0)), params);
    let mut ts = 0u64;
    for _ in 0..nb_repeats {
        for record in [1u16, 2, 3] {
            ts += 10;
            writer.store_event(
                EventKind::Atomic,
                Event::new(record, vec![]),
                Some(ts),
                AttributeList::default(),
            );
        }
    }
    writer.thread_close()
}

fn bench_grammar_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("grammar_construction");
    for repeats in [10, 100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(repeats), &repeats, |b, &repeats| {
            b.iter(|| black_box(build_thread(repeats, Parameters::default())));
        });
    }
    group.finish();
}

fn bench_storage_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage_roundtrip");
    for repeats in [10, 100, 1_000] {
        let params = Parameters::default();
        group.bench_with_input(BenchmarkId::new("write", repeats), &repeats, |b, &repeats| {
            b.iter(|| {
                let dir = tempfile::tempdir().unwrap();
                let global = GlobalArchive::new(0);
                let archive = global.open_archive(ArchiveId(0));
                archive.add_thread(build_thread(repeats, params.clone()));
                Storage::write(dir.path(), "trace", &global, &params).unwrap();
            });
        });

        let dir = tempfile::tempdir().unwrap();
        let global = GlobalArchive::new(0);
        let archive = global.open_archive(ArchiveId(0));
        archive.add_thread(build_thread(repeats, params.clone()));
        Storage::write(dir.path(), "trace", &global, &params).unwrap();
        group.bench_with_input(BenchmarkId::new("read", repeats), &repeats, |b, _| {
            b.iter(|| black_box(Storage::read(dir.path(), "trace").unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_grammar_construction, bench_storage_roundtrip);
criterion_main!(benches);

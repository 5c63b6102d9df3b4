use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use keepsake_store::{DiskLruStore, StoreOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use tempfile::TempDir;

const KEY_SPACE: usize = 1_000;

fn key(i: usize) -> String {
    format!("key-{i:05}")
}

fn put(store: &DiskLruStore, key: &str, body: &[u8]) {
    if let Some(mut editor) = store.edit(key).unwrap() {
        editor.new_sink(0).unwrap().write_all(b"meta").unwrap();
        editor.new_sink(1).unwrap().write_all(body).unwrap();
        editor.commit().unwrap();
    }
}

fn populated(max_size: u64, body: &[u8]) -> (TempDir, DiskLruStore) {
    let dir = TempDir::new().unwrap();
    let store = DiskLruStore::open(StoreOptions::new(dir.path(), max_size)).unwrap();
    for i in 0..KEY_SPACE {
        put(&store, &key(i), body);
    }
    (dir, store)
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    for size in [256usize, 4096, 65536] {
        let body = vec![b'x'; size];
        let (_dir, store) = populated(u64::MAX, &body);
        let mut rng = StdRng::seed_from_u64(42);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let k = key(rng.gen_range(0..KEY_SPACE));
                let mut snapshot = store.get(&k).unwrap().unwrap();
                black_box(snapshot.read_slot(1).unwrap());
            })
        });
    }
    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    for size in [256usize, 4096] {
        let body = vec![b'y'; size];
        let dir = TempDir::new().unwrap();
        let store = DiskLruStore::open(StoreOptions::new(dir.path(), u64::MAX)).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| put(&store, &key(rng.gen_range(0..KEY_SPACE)), &body))
        });
    }
    group.finish();
}

fn bench_eviction_churn(c: &mut Criterion) {
    // Room for roughly a tenth of the key space, so most commits evict.
    let body = vec![b'z'; 1024];
    let max_size = (KEY_SPACE as u64 / 10) * (body.len() as u64 + 4);
    let (_dir, store) = populated(max_size, &body);
    let mut rng = StdRng::seed_from_u64(99);

    c.bench_function("eviction_churn", |b| {
        b.iter(|| {
            let k = key(rng.gen_range(0..KEY_SPACE));
            match store.get(&k).unwrap() {
                Some(snapshot) => drop(black_box(snapshot)),
                None => put(&store, &k, &body),
            }
        })
    });
}

criterion_group!(benches, bench_get, bench_commit, bench_eviction_churn);
criterion_main!(benches);

use criterion::{criterion_group, criterion_main, Criterion};
use esox_servicepool::{PoolConfiguration, ServicePool, StatefulService};
use std::hint::black_box;

struct Handle(u64);

impl StatefulService for Handle {
    fn close(&self) {}
}

fn bench_hit_path(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    let pool: ServicePool<u64, Handle> =
        ServicePool::new(|id: &u64| Handle(*id), PoolConfiguration::default()).unwrap();
    let warm = pool.get(&1).unwrap();

    c.bench_function("get_put_resident", |b| {
        b.iter(|| {
            let handle = pool.get(black_box(&1)).unwrap();
            pool.put(&1, handle).unwrap();
        })
    });

    c.bench_function("get_put_spread_keys", |b| {
        let mut next = 0u64;
        b.iter(|| {
            let key = next % 64;
            next += 1;
            let handle = pool.get(black_box(&key)).unwrap();
            black_box(handle.0);
            pool.put(&key, handle).unwrap();
        })
    });

    pool.put(&1, warm).unwrap();
}

criterion_group!(benches, bench_hit_path);
criterion_main!(benches);

//! Benchmark: sector pool hot path.
//!
//! Measures the acquire/discard cycle on its own and the full
//! acquire/submit/complete cycle against the in-memory device, which is the
//! per-sector overhead the writer pays on every boundary crossing.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rsp_block::{MemSectorDevice, PoolConfig, SectorDevice, SectorPool};
use rsp_types::{LunNbr, SectorNbr};

fn bench_acquire_discard(c: &mut Criterion) {
    let pool = SectorPool::new(LunNbr(0), PoolConfig::default()).unwrap();

    c.bench_function("pool_acquire_discard", |b| {
        b.iter(|| {
            let req = pool.acquire().unwrap();
            pool.discard(black_box(req));
        });
    });
}

fn bench_submit_cycle(c: &mut Criterion) {
    let pool = SectorPool::new(LunNbr(0), PoolConfig::default()).unwrap();
    let device = MemSectorDevice::new(64);

    c.bench_function("pool_submit_complete", |b| {
        b.iter(|| {
            let mut req = pool.acquire().unwrap();
            req.set_sector_nbr(black_box(SectorNbr(7)));
            req.data_mut()[0] = 0xA5;
            device.submit(req).unwrap();
        });
    });
}

criterion_group!(benches, bench_acquire_discard, bench_submit_cycle);
criterion_main!(benches);

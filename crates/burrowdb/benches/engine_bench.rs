use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::tempdir;

use burrowdb::{Db, Options, PERSISTENT};

const N: usize = 1_000;
const VAL_SIZE: usize = 100;

fn put_1k(c: &mut Criterion) {
    c.bench_function("engine_put_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = Db::open(Options::new(dir.path())).unwrap();
                (dir, db)
            },
            |(_dir, db)| {
                for i in 0..N {
                    let key = format!("k{i:06}").into_bytes();
                    db.update(|tx| tx.put("bench", &key, &[b'x'; VAL_SIZE], PERSISTENT))
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn put_1k_batched_tx(c: &mut Criterion) {
    c.bench_function("engine_put_1k_single_tx", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = Db::open(Options::new(dir.path())).unwrap();
                (dir, db)
            },
            |(_dir, db)| {
                db.update(|tx| {
                    for i in 0..N {
                        let key = format!("k{i:06}").into_bytes();
                        tx.put("bench", &key, &[b'x'; VAL_SIZE], PERSISTENT)?;
                    }
                    Ok(())
                })
                .unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn get_1k(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::new(dir.path())).unwrap();
    db.update(|tx| {
        for i in 0..N {
            let key = format!("k{i:06}").into_bytes();
            tx.put("bench", &key, &[b'x'; VAL_SIZE], PERSISTENT)?;
        }
        Ok(())
    })
    .unwrap();

    c.bench_function("engine_get_1k", |b| {
        b.iter(|| {
            for i in 0..N {
                let key = format!("k{i:06}").into_bytes();
                criterion::black_box(db.view(|tx| tx.get("bench", &key)).unwrap());
            }
        });
    });
}

fn reopen_1k(c: &mut Criterion) {
    c.bench_function("engine_reopen_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = Db::open(Options::new(dir.path())).unwrap();
                db.update(|tx| {
                    for i in 0..N {
                        let key = format!("k{i:06}").into_bytes();
                        tx.put("bench", &key, &[b'x'; VAL_SIZE], PERSISTENT)?;
                    }
                    Ok(())
                })
                .unwrap();
                db.close().unwrap();
                dir
            },
            |dir| {
                let db = Db::open(Options::new(dir.path())).unwrap();
                criterion::black_box(db.key_count().unwrap());
            },
            BatchSize::SmallInput,
        );
    });
}

fn mixed_workload_1k(c: &mut Criterion) {
    c.bench_function("engine_mixed_put_get_delete_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = Db::open(Options::new(dir.path())).unwrap();
                (dir, db)
            },
            |(_dir, db)| {
                for i in 0..N {
                    let key = format!("k{i:06}").into_bytes();
                    db.update(|tx| tx.put("bench", &key, &[b'x'; VAL_SIZE], PERSISTENT))
                        .unwrap();
                    criterion::black_box(db.view(|tx| tx.get("bench", &key)).unwrap());
                    if i % 5 == 0 {
                        db.update(|tx| tx.delete("bench", &key)).unwrap();
                    }
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    put_1k,
    put_1k_batched_tx,
    get_1k,
    reopen_1k,
    mixed_workload_1k,
);

criterion_main!(benches);

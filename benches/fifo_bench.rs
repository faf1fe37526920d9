use criterion::{black_box, criterion_group, criterion_main, Criterion};
use daemonlib::log_source;
use daemonlib::Fifo;

log_source!();

fn bench_fifo_round_trip(c: &mut Criterion) {
    let fifo = Fifo::new(64 * 1024);
    let payload = [0xA5u8; 64];
    let mut scratch = [0u8; 64];

    c.bench_function("fifo_round_trip_64b", |b| {
        b.iter(|| {
            fifo.try_write(black_box(&payload)).unwrap();

            let mut read = 0;

            while read < payload.len() {
                read += fifo.try_read(&mut scratch[read..]).unwrap();
            }

            black_box(&scratch);
        });
    });
}

fn bench_excluded_log_call(c: &mut Criterion) {
    // At the default level, debug calls must return after the inclusion
    // check without formatting or staging anything.
    daemonlib::log::init(&daemonlib::log::Config::default()).unwrap();

    c.bench_function("log_debug_excluded", |b| {
        b.iter(|| {
            daemonlib::log_debug!("suppressed {}", black_box(42));
        });
    });

    daemonlib::log::exit();
}

criterion_group!(benches, bench_fifo_round_trip, bench_excluded_log_call);
criterion_main!(benches);

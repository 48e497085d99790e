//! Concurrency stress harness: several threads hammer one shared `Kmem`
//! with random allocate/free traffic, then check that the accounting
//! invariants and the no-leak-without-shrink property still hold.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use getargs::{Arg, Options};
use kmem::{Kmem, KmemConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

struct Args {
    threads: usize,
    ops_per_thread: usize,
    max_size: usize,
}

fn parse_args() -> Args {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let mut opts = Options::new(raw.iter().map(String::as_str));
    let mut args = Args {
        threads: 8,
        ops_per_thread: 100_000,
        max_size: 2048,
    };

    while let Some(arg) = opts.next_arg().expect("invalid command line") {
        match arg {
            Arg::Long("threads") => args.threads = opts.value().unwrap().parse().expect("--threads must be a number"),
            Arg::Long("ops") => args.ops_per_thread = opts.value().unwrap().parse().expect("--ops must be a number"),
            Arg::Long("max-size") => args.max_size = opts.value().unwrap().parse().expect("--max-size must be a number"),
            _ => {}
        }
    }
    args
}

/// One thread's share of the workload: a random mix of allocations (up to
/// `max_size` bytes) and frees of its own still-live pointers, biased
/// toward allocating while the live set is small so it actually grows.
fn run_worker(kmem: &Kmem, seed: u64, ops: usize, max_size: usize) -> u64 {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<NonNull<u8>> = Vec::new();
    let mut completed = 0u64;

    for _ in 0..ops {
        if live.is_empty() || rng.random_bool(0.6) {
            let size = rng.random_range(1..=max_size);
            if let Some(ptr) = kmem.malloc(size) {
                // SAFETY: `ptr` is `size` freshly allocated bytes this
                // thread owns exclusively until it frees it below.
                unsafe { ptr.as_ptr().write_bytes(0xAA, 1) };
                live.push(ptr);
                completed += 1;
            }
        } else {
            let idx = rng.random_range(0..live.len());
            kmem.free(live.swap_remove(idx));
            completed += 1;
        }
    }

    for ptr in live {
        kmem.free(ptr);
    }
    completed
}

fn main() {
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(log::LevelFilter::Warn);

    let args = parse_args();
    let kmem = Kmem::init(KmemConfig::new()).expect("kmem init failed");
    let (baseline_pages, ..) = kmem.stats_pages();

    let total_ops = AtomicU64::new(0);

    thread::scope(|scope| {
        for t in 0..args.threads {
            let kmem = &kmem;
            let total_ops = &total_ops;
            let seed = 0xC0FFEE_u64 ^ (t as u64);
            scope.spawn(move || {
                let completed = run_worker(kmem, seed, args.ops_per_thread, args.max_size);
                total_ops.fetch_add(completed, Ordering::Relaxed);
            });
        }
    });

    kmem.shrink();
    let (pages_in_use, pages_new, pages_del) = kmem.stats_pages();
    assert_eq!(
        pages_in_use, baseline_pages,
        "pages_in_use should return to its pre-test baseline after every thread freed everything and shrink ran"
    );

    println!(
        "{} threads completed {} operations ({} page faults, {} pages released); pages_in_use back to baseline ({})",
        args.threads,
        total_ops.load(Ordering::Relaxed),
        pages_new,
        pages_del,
        pages_in_use
    );

    kmem.destroy().expect("destroy failed: still busy after every thread freed everything");
}

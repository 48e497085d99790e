//! Smoke-test binary: drives a handful of allocation patterns through
//! `kmem` and prints the stats surface, so a human can eyeball that slab
//! migration, large-alloc passthrough, and reclaim all behave.

use getargs::{Arg, Options};
use kmem::{Kmem, KmemConfig};

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn parse_page_shift() -> u32 {
    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let mut opts = Options::new(raw_args.iter().map(String::as_str));
    let mut page_shift = kmem::page::DEFAULT_PAGE_SHIFT;

    while let Some(arg) = opts.next_arg().expect("invalid command line") {
        if let Arg::Long("page-shift") = arg {
            let value = opts.value().expect("--page-shift requires a value");
            page_shift = value.parse().expect("--page-shift must be a number");
        }
    }
    page_shift
}

fn main() {
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(log::LevelFilter::Debug);

    let page_shift = parse_page_shift();
    let kmem = Kmem::init(KmemConfig::new().page_shift(page_shift)).expect("kmem init failed");
    println!("initialized with page_shift={page_shift}");

    // Pattern 1: a spread of small sizes, allocated then freed.
    let mut ptrs = Vec::new();
    for size in [8usize, 24, 100, 500, 4000] {
        let p = kmem.malloc(size).expect("malloc failed");
        println!("malloc({size}) -> {:p} (ptr_size={})", p, kmem.ptr_size(p).unwrap());
        ptrs.push(p);
    }
    for p in ptrs {
        kmem.free(p);
    }

    // Pattern 2: exactly fill then drain one named cache's first slab.
    let demo = kmem.cache_create("demo", 64).expect("cache_create failed");
    let mut demo_ptrs = Vec::new();
    for _ in 0..256 {
        demo_ptrs.push(kmem.cache_alloc(&demo).expect("cache_alloc failed"));
    }
    for p in demo_ptrs {
        kmem.cache_free(&demo, p);
    }
    kmem.cache_delete(demo).expect("cache_delete failed");

    // Pattern 3: one large, page-spanning allocation.
    let big = kmem.malloc(1 << 20).expect("malloc failed");
    println!("large alloc ptr_size = {}", kmem.ptr_size(big).unwrap());
    kmem.free(big);

    kmem.shrink();

    let (pages_in_use, pages_new, pages_del) = kmem.stats_pages();
    println!("stats_pages: in_use={pages_in_use} new={pages_new} del={pages_del}");

    let mut index = 0;
    while let Some(stats) = kmem.stats_cache(index) {
        println!(
            "stats_cache[{index}]: name={} obj_size={} full={} partial={} free={} pages_new={} pages_del={}",
            stats.name, stats.obj_size, stats.count_full, stats.count_partial, stats.count_free, stats.pages_new, stats.pages_del
        );
        index += 1;
    }

    let (waste_in_use, waste_total) = kmem.stats_waste();
    println!("stats_waste: in_use={waste_in_use} total={waste_total}");

    kmem.destroy().expect("destroy failed: allocations still outstanding");
    println!("destroyed cleanly");
}

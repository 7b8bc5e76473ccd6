use clap::Parser as ClapParser;
use std::process;

use heap::{
    AllocationStub, ClosureKind, HeapResult, HeapSettings, Isolate, ObjectKind, RawObject,
    Space, Value, fields, object_store::ClassDescriptor, verifier,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Drives a synthetic allocation workload", long_about = None)]
struct Cli {
    /// Number of allocations to perform
    #[arg(long, default_value_t = 200_000)]
    iterations: usize,

    /// Keep every n-th allocation alive
    #[arg(long, default_value_t = 8)]
    retain_every: usize,

    /// Number of root slots retained objects rotate through
    #[arg(long, default_value_t = 2048)]
    live_slots: usize,

    /// Total new space in KiB (both halves)
    #[arg(long, default_value_t = 1024)]
    new_space_kb: usize,

    /// Old-generation page size in KiB
    #[arg(long, default_value_t = 256)]
    page_kb: usize,

    /// Old-generation limit in MiB
    #[arg(long, default_value_t = 64)]
    old_space_mb: usize,

    #[arg(long, default_value_t = 2)]
    promotion_age: u8,

    /// Scavenge before every young allocation
    #[arg(long)]
    gc_at_alloc: bool,

    /// Disable the inline allocation fast paths
    #[arg(long)]
    no_inline: bool,

    /// Verify the heap after every scavenge
    #[arg(long)]
    verify: bool,
}

impl Cli {
    fn settings(&self) -> HeapSettings {
        HeapSettings {
            new_space_size: self.new_space_kb * 1024,
            page_size: self.page_kb * 1024,
            old_space_max: self.old_space_mb * 1024 * 1024,
            promotion_age: self.promotion_age,
            gc_at_alloc: self.gc_at_alloc,
            inline_alloc: !self.no_inline,
            verify_after_gc: self.verify,
            ..Default::default()
        }
    }
}

struct Sites {
    array: AllocationStub,
    context: AllocationStub,
    node: AllocationStub,
    closure: AllocationStub,
}

fn run(cli: &Cli) -> HeapResult<()> {
    let mut isolate = Isolate::new(cli.settings())?;
    let node_class = isolate
        .object_store_mut()
        .class_table
        .register(ClassDescriptor::parameterized("Node", 3, 2))?;
    let sites = Sites {
        array: AllocationStub::array(isolate.heap()),
        context: AllocationStub::context(isolate.heap()),
        node: AllocationStub::instance(&isolate, node_class)?,
        closure: AllocationStub::closure(isolate.heap(), ClosureKind::Implicit),
    };

    let live_slots = cli.live_slots.max(1);
    isolate.stack().resize(live_slots, Value::NULL);
    let retain_every = cli.retain_every.max(1);

    for i in 0..cli.iterations {
        let n = Value::from_i64(i as i64);
        let object = match i % 4 {
            0 => sites
                .array
                .invoke(&mut isolate, &[Value::from_i64((i % 16) as i64), Value::NULL])?,
            1 => sites.context.invoke(&mut isolate, &[Value::from_i64(2)])?,
            2 => sites
                .node
                .invoke(&mut isolate, &[Value::from_i64(7), n])?,
            _ => sites.closure.invoke(&mut isolate, &[n, n])?,
        };
        if i % retain_every != 0 {
            continue;
        }
        // chain the new object to whatever previously held its slot
        let slot = (i / retain_every) % live_slots;
        let previous = isolate.stack()[slot];
        // SAFETY: freshly allocated, nothing ran since
        let raw = unsafe { RawObject::from_value(object) };
        match raw.header().kind() {
            ObjectKind::Context => raw.set_field(fields::CONTEXT_PARENT, previous),
            ObjectKind::Instance => raw.set_field(0, previous),
            ObjectKind::Array if raw.header().length() > 0 => {
                raw.set_field(fields::ARRAY_DATA, previous)
            }
            _ => {}
        }
        isolate.stack()[slot] = object;
    }

    report(&isolate, &sites);
    Ok(())
}

fn report(isolate: &Isolate, sites: &Sites) {
    let heap = isolate.heap();
    println!("scavenges:      {}", heap.new_space().collections());
    if let Some(stats) = heap.last_scavenge() {
        println!(
            "last scavenge:  {} survivors, {} copied, {} promoted, {:?}",
            stats.survivors, stats.copied_bytes, stats.promoted_bytes, stats.elapsed
        );
    }
    for space in [Space::New, Space::Old, Space::Code] {
        println!(
            "{:<15} {} / {} bytes",
            format!("{space:?} space:"),
            heap.in_use(space),
            heap.capacity(space)
        );
    }
    let census = verifier::census(heap);
    for kind in [
        ObjectKind::Array,
        ObjectKind::Context,
        ObjectKind::Instance,
        ObjectKind::TypeArguments,
        ObjectKind::Closure,
        ObjectKind::Bytes,
    ] {
        println!("{:<15} {}", format!("{kind:?}:"), census[kind as usize]);
    }
    for (name, stub) in [
        ("array", &sites.array),
        ("context", &sites.context),
        ("node", &sites.node),
        ("closure", &sites.closure),
    ] {
        println!(
            "{:<15} {} inline, {} runtime",
            format!("{name} stub:"),
            stub.fast_hits(),
            stub.slow_calls()
        );
    }
    match verifier::verify(heap) {
        Ok(stats) => println!(
            "verified:       {} objects, {} references",
            stats.objects, stats.references
        ),
        Err(err) => {
            eprintln!("heap verification failed: {err}");
            process::exit(2);
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    log::debug!("{cli:?}");

    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

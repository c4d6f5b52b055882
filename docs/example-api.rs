// Example API Usage
// This file shows how the store is used by an embedding application

use std::sync::Arc;
use std::time::Duration;

use tskv::{
    Error, FamilyOptions, Flusher, Interval, JobScheduler, Merger, MergerConfig, MergerRegistry,
    Store, StoreOptions, StoreRegistry,
};

/// Keeps the maximum of little-endian u64 samples.
struct MaxMerger {
    rollup: bool,
}

impl Merger for MaxMerger {
    fn init(&mut self, config: &MergerConfig) -> tskv::Result<()> {
        self.rollup = config.rollup().is_some();
        Ok(())
    }

    fn merge(&mut self, _key: u32, values: &[&[u8]]) -> tskv::Result<Vec<u8>> {
        let mut max = 0u64;
        for value in values {
            let bytes: [u8; 8] = (*value)
                .try_into()
                .map_err(|_| Error::merge("sample is not 8 bytes"))?;
            max = max.max(u64::from_le_bytes(bytes));
        }
        Ok(max.to_le_bytes().to_vec())
    }
}

fn main() -> Result<(), Error> {
    // ===========================================
    // Mergers
    // ===========================================

    // Compaction never picks a winner; it asks the family's merger.
    let mergers = MergerRegistry::new();
    mergers.register("max", |_flusher| {
        Ok(Box::new(MaxMerger { rollup: false }) as Box<dyn Merger>)
    });
    let mergers = Arc::new(mergers);

    // ===========================================
    // Opening a Store
    // ===========================================

    let options = StoreOptions::builder()
        .levels(2)
        .table_cache_capacity(256)
        .build()?;
    let store = Store::open("./my_data", options, mergers.clone())?;

    // ===========================================
    // Families and Rollup
    // ===========================================

    // Coarse family first; the raw family rolls every flushed file into it.
    store.create_family(
        "cpu_1h",
        FamilyOptions::new("max").interval(Interval::from_hours(1)),
    )?;
    let raw = store.create_family(
        "cpu_1m",
        FamilyOptions::new("max")
            .interval(Interval::from_mins(1))
            .compact_threshold(4)
            .rollup_threshold(8)
            .rollup_into("cpu_1h", Interval::from_hours(1)),
    )?;

    // Creating an existing family returns it unchanged.
    let again = store.create_family("cpu_1m", FamilyOptions::new("max"))?;
    assert!(Arc::ptr_eq(&raw, &again));

    // ===========================================
    // Writing Level-0 Files
    // ===========================================

    // Keys are u32 series ids and must be added in increasing order.
    let mut flusher = raw.new_flusher();
    for series in 0..1000u32 {
        flusher.add(series, &(series as u64 * 3).to_le_bytes())?;
    }
    flusher.commit()?;

    // ===========================================
    // Reading Through Snapshots
    // ===========================================

    let snapshot = raw.get_snapshot();
    let values = snapshot.get(42)?;
    assert_eq!(values.len(), 1);

    // The snapshot keeps its files alive until it is closed or dropped.
    for (level, file) in snapshot.version().all_files() {
        println!("L{} #{} [{}..={}]", level, file.file_number, file.min_key, file.max_key);
    }
    snapshot.close();

    // ===========================================
    // Maintenance Operations
    // ===========================================

    // Run whatever compaction or rollup is due, once.
    store.compact()?;

    for stats in raw.level_stats() {
        println!("L{}: {} files, {} bytes", stats.level, stats.num_files, stats.total_size);
    }

    // ===========================================
    // Background Jobs
    // ===========================================

    let stores = Arc::new(StoreRegistry::new());
    stores.register("metrics", store.clone());

    let scheduler = JobScheduler::new(stores, Duration::from_secs(30));
    scheduler.startup()?;

    // ... the application keeps flushing ...

    scheduler.shutdown();
    if let Some(e) = scheduler.last_error() {
        eprintln!("last background error: {}", e);
    }

    // ===========================================
    // Graceful Shutdown
    // ===========================================

    store.close()?;

    // The lock is released; the store can be opened again.
    let store = Store::open("./my_data", StoreOptions::default(), mergers)?;
    assert!(store.get_family("cpu_1h").is_some());

    Ok(())
}

// ===========================================
// Error Handling
// ===========================================

fn error_handling_example(store: &Store) {
    match store.create_family("x", FamilyOptions::new("unregistered")) {
        Ok(_) => println!("created"),
        Err(Error::UnknownMerger(name)) => {
            eprintln!("no merger registered as {}", name);
        }
        Err(e) => eprintln!("error: {}", e),
    }

    if let Err(e) = store.compact() {
        // Context layers name the family; the root is the failure itself.
        if e.root().is_corruption() {
            eprintln!("corruption: {}", e);
        } else {
            eprintln!("compaction failed: {}", e);
        }
    }
}

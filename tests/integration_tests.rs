//! Integration tests for complete store workflows.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tskv::{
    Error, FamilyOptions, Flusher, Interval, Merger, MergerConfig, MergerRegistry, Result, Store,
    StoreOptions,
};

/// Concatenates values in input order.
struct ConcatMerger;

impl Merger for ConcatMerger {
    fn init(&mut self, _config: &MergerConfig) -> Result<()> {
        Ok(())
    }

    fn merge(&mut self, _key: u32, values: &[&[u8]]) -> Result<Vec<u8>> {
        Ok(values.concat())
    }
}

/// Adds little-endian u64 counters.
struct SumMerger;

impl Merger for SumMerger {
    fn init(&mut self, _config: &MergerConfig) -> Result<()> {
        Ok(())
    }

    fn merge(&mut self, _key: u32, values: &[&[u8]]) -> Result<Vec<u8>> {
        let mut sum = 0u64;
        for value in values {
            let bytes: [u8; 8] = (*value)
                .try_into()
                .map_err(|_| Error::merge("counter is not 8 bytes"))?;
            sum += u64::from_le_bytes(bytes);
        }
        Ok(sum.to_le_bytes().to_vec())
    }
}

fn mergers() -> Arc<MergerRegistry> {
    let registry = MergerRegistry::new();
    registry.register("concat", |_| Ok(Box::new(ConcatMerger) as Box<dyn Merger>));
    registry.register("sum", |_| Ok(Box::new(SumMerger) as Box<dyn Merger>));
    Arc::new(registry)
}

fn open(path: &Path) -> Arc<Store> {
    Store::open(path, StoreOptions::default(), mergers()).unwrap()
}

fn write<F: Flusher, V: AsRef<[u8]>>(flusher: &mut F, records: &[(u32, V)]) {
    for (key, value) in records {
        flusher.add(*key, value.as_ref()).unwrap();
    }
    flusher.commit().unwrap();
}

fn count_files(dir: &Path, suffix: &str) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(suffix))
        .count()
}

fn manifests(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("MANIFEST-"))
        .collect();
    names.sort();
    names
}

/// Name, id and `(level, file number)` list of every family.
fn describe(store: &Store) -> Vec<(String, i32, Vec<(usize, u64)>)> {
    store
        .families()
        .iter()
        .map(|family| {
            let version = family.get_snapshot().version().clone();
            let files = version
                .all_files()
                .map(|(level, file)| (level, file.file_number))
                .collect();
            (family.name().to_string(), family.id(), files)
        })
        .collect()
}

/// Records written through a flusher survive a reopen byte for byte.
#[test]
fn integration_round_trip_reopen() {
    let dir = TempDir::new().unwrap();
    let records: Vec<(u32, Vec<u8>)> = (0..500u32)
        .map(|i| (i * 3 + 1, format!("value-{}", i).repeat((i % 7) as usize + 1).into_bytes()))
        .collect();

    {
        let store = open(dir.path());
        let family = store.create_family("metrics", FamilyOptions::new("concat")).unwrap();
        let mut flusher = family.new_flusher();
        for (key, value) in &records {
            flusher.add(*key, value).unwrap();
        }
        flusher.commit().unwrap();
        store.close().unwrap();
    }

    let store = open(dir.path());
    let family = store.get_family("metrics").unwrap();
    let snapshot = family.get_snapshot();

    for (key, value) in &records {
        assert_eq!(snapshot.get(*key).unwrap(), vec![value.as_slice()]);
    }
    assert!(snapshot.get(0).unwrap().is_empty());
    assert!(snapshot.get(2).unwrap().is_empty());

    let file = *snapshot.version().level(0).unwrap().files().next().unwrap();
    assert_eq!(file.min_key, 1);
    assert_eq!(file.max_key, 499 * 3 + 1);

    let reader = snapshot.get_reader(file.file_number).unwrap();
    let scanned: Vec<(u32, Vec<u8>)> = reader
        .iter()
        .map(|entry| {
            let (key, value) = entry.unwrap();
            (key, value.to_vec())
        })
        .collect();
    assert_eq!(scanned, records);
}

/// A snapshot keeps its view while new files are flushed and compacted.
#[test]
fn integration_snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path());
    let family = store
        .create_family("f", FamilyOptions::new("concat").compact_threshold(2))
        .unwrap();

    write(&mut family.new_flusher(), &[(1, b"a"), (2, b"b")]);
    let before = family.get_snapshot();

    write(&mut family.new_flusher(), &[(1, b"c")]);
    assert_eq!(before.get(1).unwrap(), vec![&b"a"[..]]);
    assert_eq!(family.get_snapshot().get(1).unwrap(), vec![&b"a"[..], &b"c"[..]]);

    family.compact().unwrap().unwrap();
    assert_eq!(before.get(1).unwrap(), vec![&b"a"[..]]);
    assert_eq!(before.get(2).unwrap(), vec![&b"b"[..]]);
    assert_eq!(family.get_snapshot().get(1).unwrap(), vec![&b"ac"[..]]);

    // The old version is still active, and so are its files.
    assert_eq!(family.family_version().active_version_ids().len(), 2);
    before.close();
    assert_eq!(family.family_version().active_version_ids().len(), 1);
}

/// Compaction output and file numbers survive a reopen, and the manifest is
/// rotated instead of growing.
#[test]
fn integration_recovery_after_compaction() {
    let dir = TempDir::new().unwrap();
    let last_number;
    {
        let store = open(dir.path());
        let family = store
            .create_family("f", FamilyOptions::new("sum").compact_threshold(3))
            .unwrap();
        for i in 1..=3u64 {
            write(
                &mut family.new_flusher(),
                &[(10, &i.to_le_bytes()), (20, &(i * 10).to_le_bytes())],
            );
        }
        store.compact().unwrap();
        let version = family.get_snapshot().version().clone();
        assert_eq!(version.num_files(0), 0);
        assert_eq!(version.num_files(1), 1);
        last_number = version.level(1).unwrap().files().next().unwrap().file_number;
    }

    let store = open(dir.path());
    assert_eq!(manifests(dir.path()).len(), 1);
    let family = store.get_family("f").unwrap();
    let snapshot = family.get_snapshot();
    assert_eq!(snapshot.version().num_files(1), 1);
    assert_eq!(snapshot.get(10).unwrap(), vec![&6u64.to_le_bytes()[..]]);
    assert_eq!(snapshot.get(20).unwrap(), vec![&60u64.to_le_bytes()[..]]);

    // New files never reuse a number.
    write(&mut family.new_flusher(), &[(30, &1u64.to_le_bytes())]);
    let version = family.get_snapshot().version().clone();
    let new_file = version.level(0).unwrap().files().next().unwrap();
    assert!(new_file.file_number > last_number);

    // Only live tables are left on disk.
    assert_eq!(count_files(family.path(), ".sst"), 2);
}

/// Reopening twice yields the same metadata.
#[test]
fn integration_recovery_idempotent() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(dir.path());
        let a = store.create_family("a", FamilyOptions::new("concat")).unwrap();
        let b = store.create_family("b", FamilyOptions::new("concat")).unwrap();
        write(&mut a.new_flusher(), &[(1, b"x")]);
        write(&mut b.new_flusher(), &[(2, b"y")]);
        write(&mut b.new_flusher(), &[(3, b"z")]);
    }

    let first = {
        let store = open(dir.path());
        describe(&store)
    };
    let second = {
        let store = open(dir.path());
        describe(&store)
    };
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert_eq!(first[1].2.len(), 2);
    assert_eq!(manifests(dir.path()).len(), 1);
}

/// Pending rollups are journaled and completed after a restart.
#[test]
fn integration_file_numbers_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let next_before;
    {
        let store = open(dir.path());
        let f = store.create_family("f", FamilyOptions::new("concat")).unwrap();
        write(&mut f.new_flusher(), &[(1, "a")]);

        // Numbers handed out after the last commit.
        let g = store.create_family("g", FamilyOptions::new("concat")).unwrap();
        let mut dropped = g.new_flusher();
        dropped.add(1, b"never committed").unwrap();
        drop(dropped);

        next_before = store.version_set().next_file_number();
        store.close().unwrap();
    }

    let store = open(dir.path());
    assert!(store.version_set().next_file_number() >= next_before);

    // New files never collide with anything written before the restart.
    let f = store.get_family("f").unwrap();
    write(&mut f.new_flusher(), &[(2, "b")]);
    let snapshot = f.get_snapshot();
    assert_eq!(snapshot.get(1).unwrap(), vec!["a".as_bytes()]);
    assert_eq!(snapshot.get(2).unwrap(), vec!["b".as_bytes()]);
}

#[test]
fn integration_rollup_across_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(dir.path());
        store.create_family("hourly", FamilyOptions::new("sum")).unwrap();
        let raw = store
            .create_family(
                "raw",
                FamilyOptions::new("sum")
                    .interval(Interval::from_secs(10))
                    .rollup_threshold(3)
                    .rollup_into("hourly", Interval::from_hours(1)),
            )
            .unwrap();
        write(&mut raw.new_flusher(), &[(5, &1u64.to_le_bytes())]);
        write(&mut raw.new_flusher(), &[(5, &2u64.to_le_bytes())]);

        // Below threshold: nothing happens.
        store.compact().unwrap();
        assert_eq!(raw.get_snapshot().version().rollup_files().len(), 2);
    }

    let store = open(dir.path());
    let raw = store.get_family("raw").unwrap();
    let hourly = store.get_family("hourly").unwrap();
    assert_eq!(raw.get_snapshot().version().rollup_files().len(), 2);

    write(&mut raw.new_flusher(), &[(5, &4u64.to_le_bytes()), (6, &8u64.to_le_bytes())]);
    assert!(raw.need_rollup());
    store.compact().unwrap();

    assert!(raw.get_snapshot().version().rollup_files().is_empty());
    let target = hourly.get_snapshot();
    assert_eq!(target.get(5).unwrap(), vec![&7u64.to_le_bytes()[..]]);
    assert_eq!(target.get(6).unwrap(), vec![&8u64.to_le_bytes()[..]]);
    assert!(target.version().all_reference_files().is_empty());

    // Rolled-up state is durable too.
    drop(target);
    drop(hourly);
    drop(raw);
    store.close().unwrap();
    drop(store);

    let store = open(dir.path());
    let hourly = store.get_family("hourly").unwrap();
    assert_eq!(hourly.get_snapshot().get(5).unwrap(), vec![&7u64.to_le_bytes()[..]]);
    assert!(store
        .get_family("raw")
        .unwrap()
        .get_snapshot()
        .version()
        .rollup_files()
        .is_empty());
}

/// Compaction keeps merging into level 1 across rounds.
#[test]
fn integration_repeated_compaction() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path());
    let family = store
        .create_family("counters", FamilyOptions::new("sum").compact_threshold(2))
        .unwrap();

    for round in 0..5u64 {
        for _ in 0..2 {
            write(
                &mut family.new_flusher(),
                &[(1, &1u64.to_le_bytes()), (100 + round as u32, &round.to_le_bytes())],
            );
        }
        store.compact().unwrap();
    }

    let snapshot = family.get_snapshot();
    assert_eq!(snapshot.version().num_files(0), 0);
    assert_eq!(snapshot.get(1).unwrap(), vec![&10u64.to_le_bytes()[..]]);
    for round in 0..5u64 {
        let expected = (round * 2).to_le_bytes();
        assert_eq!(snapshot.get(100 + round as u32).unwrap(), vec![&expected[..]]);
    }
    let stats = family.level_stats();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].num_files, 0);
    assert!(stats[1].num_files >= 1);
    assert!(stats[1].total_size > 0);
}

/// Orphaned tables from an interrupted run are removed on open.
#[test]
fn integration_orphan_cleanup_on_open() {
    let dir = TempDir::new().unwrap();
    let family_path;
    {
        let store = open(dir.path());
        let family = store.create_family("f", FamilyOptions::new("concat")).unwrap();
        write(&mut family.new_flusher(), &[(1, b"kept")]);
        family_path = family.path().to_path_buf();
    }
    std::fs::write(family_path.join("999999.sst"), b"partial").unwrap();
    assert_eq!(count_files(&family_path, ".sst"), 2);

    let store = open(dir.path());
    assert_eq!(count_files(&family_path, ".sst"), 1);
    let family = store.get_family("f").unwrap();
    assert_eq!(family.get_snapshot().get(1).unwrap(), vec![&b"kept"[..]]);
}

/// A second instance cannot open a locked store.
#[test]
fn integration_store_lock() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path());

    let err = Store::open(dir.path(), StoreOptions::default(), mergers()).unwrap_err();
    assert!(matches!(err, Error::LockError(_)));

    drop(store);
    open(dir.path());
}

/// A merger error fails the sweep and leaves the family untouched.
#[test]
fn integration_merge_error_keeps_inputs() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path());
    let family = store
        .create_family("f", FamilyOptions::new("sum").compact_threshold(2))
        .unwrap();
    write(&mut family.new_flusher(), &[(1, b"short")]);
    write(&mut family.new_flusher(), &[(1, &1u64.to_le_bytes())]);

    let err = store.compact().unwrap_err();
    assert!(matches!(err.root(), Error::MergeError(_)));

    let version = family.get_snapshot().version().clone();
    assert_eq!(version.num_files(0), 2);
    assert_eq!(family.pending_outputs(), 0);
    assert_eq!(count_files(family.path(), ".sst"), 2);
}

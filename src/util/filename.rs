//! Store file naming conventions.
//!
//! A store directory holds `LOCK`, `CURRENT`, `OPTIONS` and the
//! `MANIFEST-NNNNNN` journals; each family keeps its tables in its own
//! sub-directory as `NNNNNN.sst`.

use std::path::{Path, PathBuf};

/// File types in a store directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Lock file to prevent concurrent access.
    Lock,
    /// Immutable sorted table.
    Table,
    /// Manifest journal.
    Manifest,
    /// Current file (points to current manifest).
    Current,
    /// Store and family options.
    Options,
    /// Temporary file.
    Temp,
}

/// Generate the lock file path.
pub fn lock_file_path(store_path: &Path) -> PathBuf {
    store_path.join("LOCK")
}

/// Generate the current file path.
pub fn current_file_path(store_path: &Path) -> PathBuf {
    store_path.join("CURRENT")
}

/// Generate the options file path.
pub fn options_file_path(store_path: &Path) -> PathBuf {
    store_path.join("OPTIONS")
}

/// Name of a manifest file.
pub fn manifest_file_name(number: u64) -> String {
    format!("MANIFEST-{:06}", number)
}

/// Generate a manifest file path.
pub fn manifest_file_path(store_path: &Path, number: u64) -> PathBuf {
    store_path.join(manifest_file_name(number))
}

/// Generate a table file path inside a family directory.
pub fn table_file_path(family_path: &Path, number: u64) -> PathBuf {
    family_path.join(format!("{:06}.sst", number))
}

/// Generate a temporary file path.
pub fn temp_file_path(store_path: &Path, number: u64) -> PathBuf {
    store_path.join(format!("{:06}.tmp", number))
}

/// Parse a file name and return its type and number.
///
/// Returns `None` if the file name doesn't match any known pattern.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    match name {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::Lock, 0)),
        "OPTIONS" => return Some((FileType::Options, 0)),
        _ => {}
    }

    if let Some(suffix) = name.strip_prefix("MANIFEST-") {
        return suffix
            .parse::<u64>()
            .ok()
            .map(|number| (FileType::Manifest, number));
    }

    let (num_str, ext) = name.split_once('.')?;
    let number = num_str.parse::<u64>().ok()?;
    let file_type = match ext {
        "sst" => FileType::Table,
        "tmp" => FileType::Temp,
        _ => return None,
    };
    Some((file_type, number))
}

/// Write `data` to `path` atomically through a temp file and rename.
pub fn write_file_atomic(path: &Path, temp_path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(temp_path, data)?;

    let file = std::fs::File::open(temp_path)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(temp_path, path)
}

/// Set the current manifest file.
///
/// This atomically updates the CURRENT file to point to the new manifest.
pub fn set_current_file(store_path: &Path, manifest_number: u64) -> std::io::Result<()> {
    let content = format!("{}\n", manifest_file_name(manifest_number));
    write_file_atomic(
        &current_file_path(store_path),
        &temp_file_path(store_path, manifest_number),
        content.as_bytes(),
    )?;
    sync_dir(store_path)
}

/// Read the current manifest file name.
pub fn read_current_file(store_path: &Path) -> std::io::Result<String> {
    let content = std::fs::read_to_string(current_file_path(store_path))?;
    Ok(content.trim().to_string())
}

/// Get the manifest number from the CURRENT file.
pub fn get_current_manifest_number(store_path: &Path) -> std::io::Result<u64> {
    let name = read_current_file(store_path)?;

    match parse_file_name(&name) {
        Some((FileType::Manifest, number)) => Ok(number),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid manifest name in CURRENT: {}", name),
        )),
    }
}

/// List all files of a given type in a directory, sorted by number.
pub fn list_files_of_type(dir: &Path, file_type: FileType) -> std::io::Result<Vec<u64>> {
    let mut numbers = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if let Some((ft, number)) = parse_file_name(&name) {
            if ft == file_type {
                numbers.push(number);
            }
        }
    }

    numbers.sort_unstable();
    Ok(numbers)
}

/// Delete a file, ignoring "not found" errors.
pub fn delete_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create directory if it doesn't exist.
pub fn create_dir_if_missing(path: &Path) -> std::io::Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sync a directory to ensure file operations are durable.
pub fn sync_dir(path: &Path) -> std::io::Result<()> {
    let dir = std::fs::File::open(path)?;
    dir.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_paths() {
        let store_path = Path::new("/data/store");

        assert_eq!(lock_file_path(store_path), Path::new("/data/store/LOCK"));
        assert_eq!(current_file_path(store_path), Path::new("/data/store/CURRENT"));
        assert_eq!(options_file_path(store_path), Path::new("/data/store/OPTIONS"));
        assert_eq!(
            manifest_file_path(store_path, 5),
            Path::new("/data/store/MANIFEST-000005")
        );
        assert_eq!(
            table_file_path(&store_path.join("metrics"), 456),
            Path::new("/data/store/metrics/000456.sst")
        );
        assert_eq!(
            table_file_path(store_path, 12_345_678),
            Path::new("/data/store/12345678.sst")
        );
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("CURRENT"), Some((FileType::Current, 0)));
        assert_eq!(parse_file_name("LOCK"), Some((FileType::Lock, 0)));
        assert_eq!(parse_file_name("OPTIONS"), Some((FileType::Options, 0)));
        assert_eq!(
            parse_file_name("MANIFEST-000005"),
            Some((FileType::Manifest, 5))
        );
        assert_eq!(parse_file_name("000456.sst"), Some((FileType::Table, 456)));
        assert_eq!(parse_file_name("000789.tmp"), Some((FileType::Temp, 789)));

        assert_eq!(parse_file_name("random.txt"), None);
        assert_eq!(parse_file_name("abc.sst"), None);
        assert_eq!(parse_file_name("MANIFEST-x"), None);
    }

    #[test]
    fn test_set_and_read_current() {
        let temp_dir = tempdir().unwrap();
        let store_path = temp_dir.path();

        set_current_file(store_path, 42).unwrap();

        assert_eq!(read_current_file(store_path).unwrap(), "MANIFEST-000042");
        assert_eq!(get_current_manifest_number(store_path).unwrap(), 42);
        assert!(!temp_file_path(store_path, 42).exists());
    }

    #[test]
    fn test_list_files_of_type() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path();

        std::fs::write(table_file_path(dir, 4), "").unwrap();
        std::fs::write(table_file_path(dir, 2), "").unwrap();
        std::fs::write(manifest_file_path(dir, 1), "").unwrap();
        std::fs::write(dir.join("notes.txt"), "").unwrap();

        assert_eq!(list_files_of_type(dir, FileType::Table).unwrap(), vec![2, 4]);
        assert_eq!(list_files_of_type(dir, FileType::Manifest).unwrap(), vec![1]);
    }

    #[test]
    fn test_delete_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("000001.sst");

        assert!(delete_file(&path).is_ok());

        std::fs::write(&path, "test").unwrap();
        delete_file(&path).unwrap();
        assert!(!path.exists());
    }
}

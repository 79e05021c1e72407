//! Cache Persistence
//!
//! Saves the store to a line-oriented text file and reloads it at startup.
//! The previous file is kept as `<path>.bak` and is used when the primary
//! file cannot be read.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::entry::{entry_from_line, entry_to_line, is_valid_work_value};
use super::store::WorkStore;
use crate::error::Result;

/// File-backed persistence; disabled when no path is configured
#[derive(Debug, Clone, Default)]
pub struct CachePersistence {
    path: Option<PathBuf>,
}

impl CachePersistence {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Sibling file holding the previous save
    pub fn backup_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Write every entry of `store`; returns the number of lines written
    pub fn save(&self, store: &WorkStore) -> Result<usize> {
        let Some(path) = self.path.as_deref() else {
            return Ok(0);
        };
        let start = Instant::now();

        // Best effort: there may be no previous file yet
        let backup = Self::backup_path(path);
        let _ = fs::remove_file(&backup);
        let _ = fs::rename(path, &backup);

        let mut writer = BufWriter::new(File::create(path)?);
        let mut count = 0;
        for entry in store.snapshot() {
            if let Some(line) = entry_to_line(&entry) {
                writeln!(writer, "{}", line)?;
                count += 1;
            }
        }
        writer.flush()?;

        info!(
            path = %path.display(),
            entries = count,
            duration_ms = start.elapsed().as_millis() as u64,
            "Cache saved to file"
        );
        Ok(count)
    }

    /// Merge persisted entries into `store`, falling back to the backup
    /// file once if the primary cannot be read.
    ///
    /// A file is read whole before anything is merged, so the backup is
    /// only consulted when nothing from the primary reached the store.
    pub fn load(&self, store: &WorkStore) -> Result<usize> {
        let Some(path) = self.path.as_deref() else {
            return Ok(0);
        };

        let (source, contents) = match fs::read(path) {
            Ok(contents) => (path.to_path_buf(), contents),
            Err(e) => {
                let backup = Self::backup_path(path);
                warn!(
                    path = %path.display(),
                    "Could not read cache file ({}), trying {}",
                    e,
                    backup.display()
                );
                let contents = fs::read(&backup)?;
                (backup, contents)
            }
        };
        Ok(Self::merge_lines(&source, &contents, store))
    }

    fn merge_lines(path: &Path, contents: &[u8], store: &WorkStore) -> usize {
        let mut count = 0;
        let mut skipped = 0;
        for raw in contents.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            let Some(entry) = entry_from_line(line.trim_end_matches('\r')) else {
                if !line.trim().is_empty() {
                    skipped += 1;
                }
                continue;
            };
            // In-flight placeholders are meaningless after a restart
            if !entry.is_valid() {
                continue;
            }
            if !is_valid_work_value(&entry.work) {
                debug!(hash = %entry.hash, "Skipping persisted entry with invalid work");
                continue;
            }
            if store.put(entry) {
                count += 1;
            }
        }

        info!(
            path = %path.display(),
            loaded = count,
            skipped,
            cache_size = store.len(),
            "Cache loaded from file"
        );
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheEntry;
    use crate::domain::{Difficulty, UpstreamWork};

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("work-cache-{}-{}.dat", tag, uuid::Uuid::new_v4()))
    }

    fn cleanup(path: &Path) {
        let _ = fs::remove_file(path);
        let _ = fs::remove_file(CachePersistence::backup_path(path));
    }

    fn valid_entry(hash: &str) -> CacheEntry {
        CacheEntry::valid(
            UpstreamWork {
                hash: hash.to_string(),
                work: "deadbeef00000001".to_string(),
                difficulty: Difficulty(0xffffffc000000000),
                multiplier: 1.25,
            },
            Some("nano_1acct".to_string()),
            100,
            105,
        )
    }

    #[test]
    fn test_disabled_is_noop() {
        let persistence = CachePersistence::disabled();
        let store = WorkStore::new();
        store.put(valid_entry("A"));
        assert_eq!(persistence.save(&store).unwrap(), 0);
        assert_eq!(persistence.load(&store).unwrap(), 0);
        assert!(!persistence.is_enabled());
    }

    #[test]
    fn test_backup_path() {
        let path = PathBuf::from("/var/lib/cache.dat");
        assert_eq!(
            CachePersistence::backup_path(&path),
            PathBuf::from("/var/lib/cache.dat.bak")
        );
    }

    #[test]
    fn test_save_then_load_skips_computing() {
        let path = temp_path("roundtrip");
        let persistence = CachePersistence::new(Some(path.clone()));

        let store = WorkStore::new();
        store.put(valid_entry("A"));
        store.put(valid_entry("B"));
        store.put(CacheEntry::computing("C", None, 5));
        assert_eq!(persistence.save(&store).unwrap(), 3);

        let restored = WorkStore::new();
        assert_eq!(persistence.load(&restored).unwrap(), 2);
        assert_eq!(restored.get("A").unwrap(), valid_entry("A"));
        assert_eq!(restored.get("B").unwrap(), valid_entry("B"));
        assert!(restored.get("C").is_none());

        cleanup(&path);
    }

    #[test]
    fn test_second_save_rotates_backup() {
        let path = temp_path("rotate");
        let persistence = CachePersistence::new(Some(path.clone()));

        let store = WorkStore::new();
        store.put(valid_entry("A"));
        persistence.save(&store).unwrap();
        store.put(valid_entry("B"));
        persistence.save(&store).unwrap();

        let backup = fs::read_to_string(CachePersistence::backup_path(&path)).unwrap();
        assert_eq!(backup.lines().count(), 1);
        let primary = fs::read_to_string(&path).unwrap();
        assert_eq!(primary.lines().count(), 2);

        cleanup(&path);
    }

    #[test]
    fn test_load_reference_line() {
        let path = temp_path("reference");
        fs::write(
            &path,
            "ABC123 deadbeef00000001 ffffffc000000000 1.0 _ valid 100 105\n",
        )
        .unwrap();

        let store = WorkStore::new();
        CachePersistence::new(Some(path.clone())).load(&store).unwrap();

        let entry = store.get("ABC123").unwrap();
        assert!(entry.is_valid());
        assert_eq!(entry.difficulty, Difficulty(0xffffffc000000000));
        assert_eq!(entry.work, "deadbeef00000001");

        cleanup(&path);
    }

    #[test]
    fn test_load_falls_back_to_backup() {
        let path = temp_path("fallback");
        fs::write(
            CachePersistence::backup_path(&path),
            "BAK1 deadbeef00000002 ffffffc000000000 1 _ valid 1 2\n",
        )
        .unwrap();

        let store = WorkStore::new();
        let loaded = CachePersistence::new(Some(path.clone())).load(&store).unwrap();
        assert_eq!(loaded, 1);
        assert!(store.get("BAK1").unwrap().is_valid());

        cleanup(&path);
    }

    #[test]
    fn test_load_missing_both_files_errors() {
        let path = temp_path("missing");
        let store = WorkStore::new();
        assert!(CachePersistence::new(Some(path)).load(&store).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_undecodable_line_does_not_abort_load() {
        let path = temp_path("bytes");
        let mut primary = b"AAA deadbeef00000001 fffffff800000000 8 _ valid 10 20\n".to_vec();
        primary.extend_from_slice(b"BAD \xff\xfe garbage\n");
        primary.extend_from_slice(b"CCC deadbeef00000003 ffffffc000000000 1 _ valid 10 20\n");
        fs::write(&path, primary).unwrap();
        fs::write(
            CachePersistence::backup_path(&path),
            "AAA 0123456789abcdef ffffffc000000000 1 _ valid 1 2\n",
        )
        .unwrap();

        let store = WorkStore::new();
        let loaded = CachePersistence::new(Some(path.clone())).load(&store).unwrap();

        assert_eq!(loaded, 2);
        assert!(store.get("CCC").unwrap().is_valid());
        let aaa = store.get("AAA").unwrap();
        assert_eq!(aaa.work, "deadbeef00000001");
        assert_eq!(aaa.difficulty, Difficulty(0xfffffff800000000));

        cleanup(&path);
    }

    #[test]
    fn test_load_ignores_malformed_lines() {
        let path = temp_path("malformed");
        fs::write(
            &path,
            "\nlonely\nH1 deadbeef00000001\nH2 short ff 1 _ valid 1 2\nH3 deadbeef00000003 ff 1 _ valid 1 2\n",
        )
        .unwrap();

        let store = WorkStore::new();
        let loaded = CachePersistence::new(Some(path.clone())).load(&store).unwrap();
        assert_eq!(loaded, 1);
        assert!(store.contains("H3"));

        cleanup(&path);
    }
}

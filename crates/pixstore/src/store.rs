//! Store engine implementation
//!
//! Directory layout:
//! - `journal`: append-only record of every edit, commit, read and removal
//! - `<key>`: committed blob for an entry
//! - `<key>.tmp`: blob being written by an open [`Editor`]
//!
//! Readers only ever open `<key>`. A commit renames the finished temp file
//! over it, so a reader sees either the old blob or the new one.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::journal::{create_header, is_valid_key, parse_header, parse_records, Record};

const JOURNAL_FILE: &str = "journal";
const JOURNAL_TMP: &str = "journal.tmp";
const JOURNAL_BACKUP: &str = "journal.bkp";

/// Journal is compacted once this many records no longer describe live state
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

/// Per-entry bookkeeping
#[derive(Debug)]
struct Entry {
    /// Length of the committed blob
    len: u64,
    /// True once the entry has been committed at least once
    readable: bool,
    /// Id of the editor currently writing this entry
    editor: Option<u64>,
    /// Position in the LRU order
    seq: u64,
}

struct Inner {
    /// Journal writer, `None` once the store is closed
    journal: Option<BufWriter<File>>,
    entries: HashMap<String, Entry>,
    /// LRU order: oldest sequence number first
    order: BTreeMap<u64, String>,
    next_seq: u64,
    next_edit_id: u64,
    size: u64,
    max_size: u64,
    redundant_ops: usize,
}

impl Inner {
    fn new(max_size: u64) -> Self {
        Self {
            journal: None,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            next_edit_id: 1,
            size: 0,
            max_size,
            redundant_ops: 0,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.journal.is_none() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Mark `key` most recently used, creating the entry if needed
    fn touch(&mut self, key: &str) -> &mut Entry {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = self.entries.entry(key.to_string()).or_insert(Entry {
            len: 0,
            readable: false,
            editor: None,
            seq,
        });
        if entry.seq != seq {
            self.order.remove(&entry.seq);
            entry.seq = seq;
        }
        self.order.insert(seq, key.to_string());
        entry
    }

    fn forget(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        if entry.readable {
            self.size -= entry.len;
        }
        Some(entry)
    }

    fn append(&mut self, record: &Record) -> Result<()> {
        let journal = self.journal.as_mut().ok_or(Error::Closed)?;
        journal.write_all(record.to_line().as_bytes())?;
        Ok(())
    }

    fn flush_journal(&mut self) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.flush()?;
        }
        Ok(())
    }

    fn needs_compaction(&self) -> bool {
        self.redundant_ops >= REDUNDANT_OP_COMPACT_THRESHOLD
            && self.redundant_ops >= self.entries.len()
    }
}

/// DiskLru is a size-bounded, journaled blob store with LRU eviction
pub struct DiskLru {
    /// Directory holding the journal and blobs
    dir: PathBuf,

    /// Application version stamped into the journal header
    app_version: u32,

    inner: Mutex<Inner>,
}

impl DiskLru {
    /// Open or create a store in the given directory
    ///
    /// A journal written by another app version, or one that fails to
    /// parse, is discarded together with every blob in the directory.
    ///
    /// # Arguments
    /// * `dir` - Directory for the journal and blob files
    /// * `app_version` - Version stamp; a mismatch invalidates existing data
    /// * `max_size` - Upper bound on the total size of committed blobs
    ///
    /// # Returns
    /// * `Result<DiskLru>` - Store handle
    pub fn open<P: AsRef<Path>>(dir: P, app_version: u32, max_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // An interrupted compaction can leave only the backup behind
        let journal_path = dir.join(JOURNAL_FILE);
        let backup_path = dir.join(JOURNAL_BACKUP);
        if backup_path.exists() {
            if journal_path.exists() {
                fs::remove_file(&backup_path)?;
            } else {
                fs::rename(&backup_path, &journal_path)?;
            }
        }

        let store = DiskLru {
            dir,
            app_version,
            inner: Mutex::new(Inner::new(max_size)),
        };

        if journal_path.exists() {
            match store.replay() {
                Ok(torn) => {
                    store.resume_journal(torn)?;
                    return Ok(store);
                }
                Err(e) => {
                    warn!(dir = %store.dir.display(), error = %e, "journal unusable, wiping store");
                    fs::remove_dir_all(&store.dir)?;
                    fs::create_dir_all(&store.dir)?;
                    *store.inner.lock() = Inner::new(max_size);
                }
            }
        }

        {
            let mut inner = store.inner.lock();
            store.compact(&mut inner)?;
        }
        Ok(store)
    }

    /// Reopen the replayed journal for appending, rewriting it if its tail was torn
    fn resume_journal(&self, torn: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if torn {
            self.compact(&mut inner)?;
        } else {
            let file = OpenOptions::new()
                .append(true)
                .open(self.dir.join(JOURNAL_FILE))?;
            inner.journal = Some(BufWriter::new(file));
        }
        debug!(
            dir = %self.dir.display(),
            entries = inner.entries.len(),
            size = inner.size,
            "opened disk store"
        );
        Ok(())
    }

    /// Rebuild the entry table from the journal
    ///
    /// Returns true if the journal ended in a torn record.
    fn replay(&self) -> Result<bool> {
        let bytes = fs::read(self.dir.join(JOURNAL_FILE))?;
        let (header, rest) = parse_header(&bytes)?;
        if header.app_version != self.app_version {
            return Err(Error::Parse(format!(
                "journal app version {} does not match {}",
                header.app_version, self.app_version
            )));
        }
        let (records, torn) = parse_records(rest)?;

        let mut inner = self.inner.lock();
        let record_count = records.len();
        for record in records {
            match record {
                Record::Dirty(key) => {
                    inner.touch(&key).editor = Some(0);
                }
                Record::Clean(key, len) => {
                    let entry = inner.touch(&key);
                    entry.editor = None;
                    entry.readable = true;
                    entry.len = len;
                }
                Record::Read(key) => {
                    if inner.entries.contains_key(&key) {
                        inner.touch(&key);
                    }
                }
                Record::Remove(key) => {
                    if let Some(entry) = inner.entries.remove(&key) {
                        inner.order.remove(&entry.seq);
                    }
                }
            }
        }

        // Entries left mid-edit by a crash are dropped along with their files
        let abandoned: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.editor.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &abandoned {
            if let Some(entry) = inner.entries.remove(key) {
                inner.order.remove(&entry.seq);
            }
            remove_if_exists(&self.clean_path(key))?;
            remove_if_exists(&self.dirty_path(key))?;
        }

        inner.size = inner.entries.values().map(|e| e.len).sum();
        inner.redundant_ops = record_count.saturating_sub(inner.entries.len());
        Ok(torn)
    }

    /// Rewrite the journal with one record per live entry
    fn compact(&self, inner: &mut Inner) -> Result<()> {
        // Drop the old writer before renaming its file
        inner.journal = None;

        let tmp_path = self.dir.join(JOURNAL_TMP);
        let journal_path = self.dir.join(JOURNAL_FILE);
        let backup_path = self.dir.join(JOURNAL_BACKUP);

        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(&create_header(self.app_version))?;
            for key in inner.order.values() {
                let entry = &inner.entries[key];
                let record = match entry.editor {
                    Some(_) => Record::Dirty(key.clone()),
                    None => Record::Clean(key.clone(), entry.len),
                };
                writer.write_all(record.to_line().as_bytes())?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        if journal_path.exists() {
            fs::rename(&journal_path, &backup_path)?;
        }
        fs::rename(&tmp_path, &journal_path)?;
        remove_if_exists(&backup_path)?;

        let file = OpenOptions::new().append(true).open(&journal_path)?;
        inner.journal = Some(BufWriter::new(file));
        inner.redundant_ops = 0;
        Ok(())
    }

    fn clean_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn dirty_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.tmp", key))
    }

    /// Get a snapshot of the committed blob for `key`
    ///
    /// # Returns
    /// * `Result<Option<Snapshot>>` - `None` if the entry does not exist or
    ///   has never been committed
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        validate_key(key)?;

        let mut inner = self.inner.lock();
        inner.check_open()?;

        match inner.entries.get(key) {
            Some(entry) if entry.readable => {}
            _ => return Ok(None),
        }

        let file = match File::open(self.clean_path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(key, "blob missing for committed entry");
                inner.forget(key);
                inner.append(&Record::Remove(key.to_string()))?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let data = SnapshotData::map(&file)?;

        inner.touch(key);
        inner.redundant_ops += 1;
        inner.append(&Record::Read(key.to_string()))?;
        if inner.needs_compaction() {
            self.compact(&mut inner)?;
        }

        Ok(Some(Snapshot {
            key: key.to_string(),
            data,
        }))
    }

    /// Start editing the entry for `key`
    ///
    /// # Returns
    /// * `Result<Option<Editor>>` - `None` if another edit of `key` is in progress
    pub fn edit(&self, key: &str) -> Result<Option<Editor<'_>>> {
        validate_key(key)?;

        let mut inner = self.inner.lock();
        inner.check_open()?;

        if inner.entries.get(key).is_some_and(|e| e.editor.is_some()) {
            return Ok(None);
        }

        let id = inner.next_edit_id;
        inner.next_edit_id += 1;
        inner.touch(key).editor = Some(id);

        // Flushed right away so a crash never leaks the temp file
        inner.append(&Record::Dirty(key.to_string()))?;
        inner.flush_journal()?;

        let file = match File::create(self.dirty_path(key)) {
            Ok(file) => file,
            Err(e) => {
                self.finish_edit(&mut inner, key, id, false)?;
                return Err(e.into());
            }
        };

        Ok(Some(Editor {
            store: self,
            key: key.to_string(),
            id,
            file: Some(BufWriter::new(file)),
        }))
    }

    fn complete_edit(&self, key: &str, id: u64, success: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.journal.is_none() {
            remove_if_exists(&self.dirty_path(key))?;
            return Err(Error::Closed);
        }
        self.finish_edit(&mut inner, key, id, success)
    }

    fn finish_edit(&self, inner: &mut Inner, key: &str, id: u64, success: bool) -> Result<()> {
        let owned = inner.entries.get(key).is_some_and(|e| e.editor == Some(id));
        if !owned {
            remove_if_exists(&self.dirty_path(key))?;
            return Err(Error::EditorFinished);
        }

        let mut committed_len = None;
        if success {
            fs::rename(self.dirty_path(key), self.clean_path(key))?;
            committed_len = Some(fs::metadata(self.clean_path(key))?.len());
        } else {
            remove_if_exists(&self.dirty_path(key))?;
        }

        let readable = {
            let entry = inner.touch(key);
            entry.editor = None;
            entry.readable
        };

        inner.redundant_ops += 1;
        match committed_len {
            Some(len) => {
                let old = if readable { inner.entries[key].len } else { 0 };
                if let Some(entry) = inner.entries.get_mut(key) {
                    entry.len = len;
                    entry.readable = true;
                }
                inner.size = inner.size - old + len;
                inner.append(&Record::Clean(key.to_string(), len))?;
            }
            None if readable => {
                let len = inner.entries[key].len;
                inner.append(&Record::Clean(key.to_string(), len))?;
            }
            None => {
                inner.forget(key);
                inner.append(&Record::Remove(key.to_string()))?;
            }
        }
        inner.flush_journal()?;

        self.trim_to_size(inner)?;
        if inner.needs_compaction() {
            self.compact(inner)?;
        }
        Ok(())
    }

    /// Evict least recently used entries until the size bound holds
    fn trim_to_size(&self, inner: &mut Inner) -> Result<()> {
        while inner.size > inner.max_size {
            let victim = inner
                .order
                .values()
                .find(|k| {
                    inner
                        .entries
                        .get(*k)
                        .is_some_and(|e| e.readable && e.editor.is_none())
                })
                .cloned();
            let Some(key) = victim else { break };

            remove_if_exists(&self.clean_path(&key))?;
            if let Some(entry) = inner.forget(&key) {
                debug!(key = %key, len = entry.len, "evicted blob");
            }
            inner.redundant_ops += 1;
            inner.append(&Record::Remove(key))?;
        }
        Ok(())
    }

    /// Remove the entry for `key`
    ///
    /// # Returns
    /// * `Result<bool>` - false if absent or currently being edited
    pub fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let mut inner = self.inner.lock();
        inner.check_open()?;

        match inner.entries.get(key) {
            Some(entry) if entry.editor.is_none() => {}
            _ => return Ok(false),
        }

        remove_if_exists(&self.clean_path(key))?;
        inner.forget(key);
        inner.redundant_ops += 1;
        inner.append(&Record::Remove(key.to_string()))?;
        if inner.needs_compaction() {
            self.compact(&mut inner)?;
        }
        Ok(true)
    }

    /// Total size of committed blobs in bytes
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Configured size bound in bytes
    pub fn max_size(&self) -> u64 {
        self.inner.lock().max_size
    }

    /// Change the size bound, evicting immediately if it shrank
    pub fn set_max_size(&self, max_size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.max_size = max_size;
        self.trim_to_size(&mut inner)?;
        inner.flush_journal()
    }

    /// Number of committed entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.values().filter(|e| e.readable).count()
    }

    /// Check if the store holds no committed entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Directory the store lives in
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Check if the store has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().journal.is_none()
    }

    /// Enforce the size bound and flush the journal to disk
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        self.trim_to_size(&mut inner)?;
        inner.flush_journal()
    }

    /// Close the store; later operations fail with [`Error::Closed`]
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.journal.is_none() {
            return Ok(());
        }
        self.trim_to_size(&mut inner)?;
        if let Some(mut journal) = inner.journal.take() {
            journal.flush()?;
            journal.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Close the store and delete its directory with every blob in it
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl Drop for DiskLru {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Writer for one entry; the new blob becomes visible only on [`Editor::commit`]
///
/// Dropping an editor without committing aborts the edit.
pub struct Editor<'a> {
    store: &'a DiskLru,
    key: String,
    id: u64,
    file: Option<BufWriter<File>>,
}

impl Editor<'_> {
    /// Key being edited
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the written blob atomically
    pub fn commit(mut self) -> Result<()> {
        let writer = self.file.take().ok_or(Error::EditorFinished)?;
        let synced = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all());
        match synced {
            Ok(()) => self.store.complete_edit(&self.key, self.id, true),
            Err(e) => {
                let _ = self.store.complete_edit(&self.key, self.id, false);
                Err(e.into())
            }
        }
    }

    /// Discard the written data, keeping any previously committed blob
    pub fn abort(mut self) -> Result<()> {
        self.file.take();
        self.store.complete_edit(&self.key, self.id, false)
    }
}

impl Write for Editor<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("editor finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for Editor<'_> {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = self.store.complete_edit(&self.key, self.id, false);
        }
    }
}

enum SnapshotData {
    Mapped(Mmap),
    Empty,
}

impl SnapshotData {
    fn map(file: &File) -> Result<Self> {
        if file.metadata()?.len() == 0 {
            return Ok(SnapshotData::Empty);
        }
        // SAFETY: the store never writes or truncates a committed blob. A
        // commit renames a fresh file over the path and removal unlinks it,
        // so this mapping keeps the old inode. Another process truncating
        // files in the store directory would fault the mapping.
        let map = unsafe { Mmap::map(file)? };
        Ok(SnapshotData::Mapped(map))
    }
}

/// Read-only view of a committed blob at the time of [`DiskLru::get`]
pub struct Snapshot {
    key: String,
    data: SnapshotData,
}

impl Snapshot {
    /// Key of the entry
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Blob contents
    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            SnapshotData::Mapped(map) => map,
            SnapshotData::Empty => &[],
        }
    }

    /// Blob length in bytes
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Check if the blob is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for Snapshot {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.to_string()))
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn put(store: &DiskLru, key: &str, value: &[u8]) {
        let mut editor = store.edit(key).unwrap().unwrap();
        editor.write_all(value).unwrap();
        editor.commit().unwrap();
    }

    /// Blob whose length is derived from its fill byte, so partial or mixed
    /// content is detectable
    fn blob(fill: u8) -> Vec<u8> {
        vec![fill; 64 + fill as usize * 3]
    }

    fn assert_whole(bytes: &[u8]) {
        let fill = bytes[0];
        assert_eq!(bytes.len(), blob(fill).len(), "torn blob {}", fill);
        assert!(bytes.iter().all(|b| *b == fill), "mixed blob {}", fill);
    }

    #[test]
    fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();

        assert_eq!(store.len(), 0);
        assert!(store.is_empty());
        assert!(dir.path().join(JOURNAL_FILE).exists());

        store.close().unwrap();

        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();

        put(&store, "k1", b"hello");

        let snapshot = store.get("k1").unwrap().unwrap();
        assert_eq!(snapshot.as_bytes(), b"hello");
        assert_eq!(snapshot.key(), "k1");
        assert_eq!(store.size(), 5);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_uncommitted_edit_is_invisible() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();

        let mut editor = store.edit("k1").unwrap().unwrap();
        editor.write_all(b"partial").unwrap();
        assert!(store.get("k1").unwrap().is_none());

        editor.abort().unwrap();
        assert!(store.get("k1").unwrap().is_none());
        assert!(!dir.path().join("k1.tmp").exists());
    }

    #[test]
    fn test_single_editor_per_key() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();

        let editor = store.edit("k1").unwrap().unwrap();
        assert!(store.edit("k1").unwrap().is_none());
        drop(editor);
        assert!(store.edit("k1").unwrap().is_some());
    }

    #[test]
    fn test_snapshot_survives_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();

        put(&store, "k1", b"old value");
        let old = store.get("k1").unwrap().unwrap();
        put(&store, "k1", b"new");

        assert_eq!(old.as_bytes(), b"old value");
        assert_eq!(store.get("k1").unwrap().unwrap().as_bytes(), b"new");
        assert_eq!(store.size(), 3);
    }

    #[test]
    fn test_snapshot_survives_removal_and_eviction() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 100).unwrap();

        put(&store, "k1", &[1; 60]);
        put(&store, "k2", &[2; 30]);
        let removed = store.get("k1").unwrap().unwrap();
        let evicted = store.get("k2").unwrap().unwrap();

        store.remove("k1").unwrap();
        put(&store, "k3", &[3; 90]);

        assert!(store.get("k2").unwrap().is_none());
        assert_eq!(removed.as_bytes(), &[1; 60]);
        assert_eq!(evicted.as_bytes(), &[2; 30]);
    }

    #[test]
    fn test_concurrent_edits_and_reads() {
        const KEYS: usize = 6;
        const WRITERS: usize = 4;
        const READERS: usize = 4;
        let max_blob = blob(u8::MAX).len() as u64;
        let max_size = 3 * max_blob;

        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, max_size).unwrap();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let writers: Vec<_> = (0..WRITERS)
                .map(|w| {
                    let store = &store;
                    scope.spawn(move || {
                        for i in 0..150 {
                            let key = format!("k{}", (i + w) % KEYS);
                            let fill = ((i * WRITERS + w) % 256) as u8;
                            if let Some(mut editor) = store.edit(&key).unwrap() {
                                editor.write_all(&blob(fill)).unwrap();
                                editor.commit().unwrap();
                            }
                            // Entries under edit cannot be evicted yet
                            assert!(store.size() <= max_size + WRITERS as u64 * max_blob);
                        }
                    })
                })
                .collect();

            for _ in 0..READERS {
                scope.spawn(|| {
                    while !done.load(Ordering::Acquire) {
                        for k in 0..KEYS {
                            if let Some(snapshot) = store.get(&format!("k{}", k)).unwrap() {
                                assert_whole(snapshot.as_bytes());
                            }
                        }
                    }
                });
            }

            for writer in writers {
                writer.join().unwrap();
            }
            done.store(true, Ordering::Release);
        });

        assert!(store.size() <= max_size);
        let mut total = 0;
        for k in 0..KEYS {
            if let Some(snapshot) = store.get(&format!("k{}", k)).unwrap() {
                assert_whole(snapshot.as_bytes());
                total += snapshot.len() as u64;
            }
        }
        assert_eq!(total, store.size());
        assert!(store.len() > 0);
    }

    #[test]
    fn test_abort_keeps_previous_value() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();

        put(&store, "k1", b"v1");
        let mut editor = store.edit("k1").unwrap().unwrap();
        editor.write_all(b"v2").unwrap();
        editor.abort().unwrap();

        assert_eq!(store.get("k1").unwrap().unwrap().as_bytes(), b"v1");
    }

    #[test]
    fn test_eviction_is_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 10).unwrap();

        put(&store, "a", b"aaaa");
        put(&store, "b", b"bbbb");
        store.get("a").unwrap();
        put(&store, "c", b"cccc");

        assert!(store.size() <= 10);
        assert!(store.get("b").unwrap().is_none());
        assert!(store.get("a").unwrap().is_some());
        assert!(store.get("c").unwrap().is_some());
        assert!(!dir.path().join("b").exists());
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();

        put(&store, "k1", b"data");
        assert!(store.remove("k1").unwrap());
        assert!(!store.remove("k1").unwrap());
        assert!(store.get("k1").unwrap().is_none());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let store = DiskLru::open(dir.path(), 1, 1024).unwrap();
            put(&store, "k1", b"one");
            put(&store, "k2", b"two");
            store.remove("k1").unwrap();
            store.close().unwrap();
        }

        {
            let store = DiskLru::open(dir.path(), 1, 1024).unwrap();
            assert_eq!(store.len(), 1);
            assert_eq!(store.size(), 3);
            assert!(store.get("k1").unwrap().is_none());
            assert_eq!(store.get("k2").unwrap().unwrap().as_bytes(), b"two");
        }
    }

    #[test]
    fn test_lru_order_persists() {
        let dir = TempDir::new().unwrap();

        {
            let store = DiskLru::open(dir.path(), 1, 100).unwrap();
            put(&store, "a", b"1234");
            put(&store, "b", b"1234");
            store.get("a").unwrap();
        }

        let store = DiskLru::open(dir.path(), 1, 100).unwrap();
        store.set_max_size(4).unwrap();
        assert!(store.get("b").unwrap().is_none());
        assert!(store.get("a").unwrap().is_some());
    }

    #[test]
    fn test_app_version_mismatch_wipes() {
        let dir = TempDir::new().unwrap();

        {
            let store = DiskLru::open(dir.path(), 1, 1024).unwrap();
            put(&store, "k1", b"data");
        }

        let store = DiskLru::open(dir.path(), 2, 1024).unwrap();
        assert!(store.is_empty());
        assert!(!dir.path().join("k1").exists());
    }

    #[test]
    fn test_corrupt_journal_wipes() {
        let dir = TempDir::new().unwrap();

        {
            let store = DiskLru::open(dir.path(), 1, 1024).unwrap();
            put(&store, "k1", b"data");
        }
        let mut journal = OpenOptions::new()
            .append(true)
            .open(dir.path().join(JOURNAL_FILE))
            .unwrap();
        journal.write_all(b"BOGUS k1\n").unwrap();

        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_dangling_edit_discarded_on_open() {
        let dir = TempDir::new().unwrap();

        {
            let store = DiskLru::open(dir.path(), 1, 1024).unwrap();
            put(&store, "k1", b"data");
            let mut editor = store.edit("k2").unwrap().unwrap();
            editor.write_all(b"half").unwrap();
            std::mem::forget(editor);
            store.close().unwrap();
        }

        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("k2").unwrap().is_none());
        assert!(!dir.path().join("k2.tmp").exists());
    }

    #[test]
    fn test_journal_compaction() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();

        put(&store, "k1", b"data");
        for _ in 0..(REDUNDANT_OP_COMPACT_THRESHOLD + 10) {
            store.get("k1").unwrap();
        }

        let journal = fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert!(journal.lines().count() < 100);
        assert_eq!(store.get("k1").unwrap().unwrap().as_bytes(), b"data");
    }

    #[test]
    fn test_invalid_key() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();

        assert!(matches!(store.get("../etc"), Err(Error::InvalidKey(_))));
        assert!(matches!(store.edit("UPPER"), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_operations_after_close() {
        let dir = TempDir::new().unwrap();
        let store = DiskLru::open(dir.path(), 1, 1024).unwrap();

        store.close().unwrap();
        store.close().unwrap(); // Should not error

        assert!(matches!(store.get("k1"), Err(Error::Closed)));
        assert!(matches!(store.edit("k1"), Err(Error::Closed)));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");
        let store = DiskLru::open(&path, 1, 1024).unwrap();

        put(&store, "k1", b"data");
        store.delete().unwrap();

        assert!(!path.exists());
    }
}

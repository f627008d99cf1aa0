use std::{
    collections::BTreeMap,
    fs, io,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use fslock::LockFile;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use snafu::{ensure, ResultExt};

use crate::{
    cursor::{CursorInner, LogCursor},
    error::{
        ChangelogError, DeleteFailedSnafu, InvalidFileNameSnafu, InvalidKeyEncodingSnafu, IoSnafu,
        KeyDecodeSnafu, LockAlreadyHeldSnafu, OutOfOrderAppendSnafu, ReopenHeadSnafu, RotationSnafu,
    },
    file::LogFile,
    registry::RegistryShared,
    KeyMatch, Record, RecordParser,
};

/// Name of the single appendable file of a log directory.
pub const HEAD_LOG_FILE_NAME: &str = "head.log";

/// Extension shared by the head and every rotated file.
pub const LOG_FILE_EXTENSION: &str = ".log";

/// Advisory lock file guarding a log directory against other processes.
pub const LOCK_FILE_NAME: &str = "changelog.lock";

const HEAD_INVARIANT: &str = "log inventory always contains a head file";

/// A multi-file append-only keyed log over one directory.
///
/// The directory holds a single writable head file plus zero or more
/// immutable rotated files named by the key range they contain.  Appends go
/// to the head; once the head grows past the configured size limit it is
/// rotated -- closed, renamed to `<lowKey>_<highKey>.log`, and replaced by a
/// fresh empty head.  Readers traverse the whole chain in key order through
/// [`LogCursor`]s, which keep their position through rotations.
///
/// Instances are obtained from a [`LogRegistry`](crate::LogRegistry), which
/// hands out one shared `Log` per directory and reference-counts its
/// openers; [`Log::close`] releases one reference, and the last release
/// performs the real shutdown.
///
/// All mutating operations take the log's exclusive lock; reads and cursor
/// operations take the shared lock.  Once the log is closed, mutating
/// operations become no-ops and cursor requests return the empty cursor.
pub struct Log<P: RecordParser> {
    path: PathBuf,
    parser: Arc<P>,
    size_limit: u64,
    max_key: P::Key,
    registry: Weak<RegistryShared<P>>,
    self_ref: Weak<Log<P>>,
    inner: RwLock<LogInner<P>>,
    /// Live cursors, walked under the exclusive lock during rotation, purge,
    /// and clear.  Kept outside `inner` so that cursor deregistration -- which
    /// runs under the shared lock -- can still mutate the list.
    cursors: Mutex<Vec<Weak<Mutex<CursorInner<P>>>>>,
    dir_lock: Mutex<Option<LockFile>>,
}

pub(crate) struct LogInner<P: RecordParser> {
    /// Inventory: partition key (a rotated file's high key, or the `max_key`
    /// sentinel for the head) to the file.  "The file that should contain
    /// key `k`" is a ceiling lookup; the head is the last entry.
    pub(crate) files: BTreeMap<P::Key, Arc<LogFile<P>>>,
    pub(crate) closed: bool,
}

impl<P: RecordParser> Log<P> {
    /// Opens the log directory, recovering the inventory from the files on
    /// disk.  Rotated file names are the sole source of truth for their key
    /// ranges; the contents are not cross-checked against the name.
    pub(crate) fn open(
        path: PathBuf,
        parser: Arc<P>,
        size_limit: u64,
        registry: Weak<RegistryShared<P>>,
    ) -> Result<Arc<Self>, ChangelogError> {
        fs::create_dir_all(&path).context(IoSnafu { path: path.clone() })?;

        let lock_path = path.join(LOCK_FILE_NAME);
        let mut dir_lock = LockFile::open(&lock_path).context(IoSnafu {
            path: lock_path.clone(),
        })?;
        let locked = dir_lock.try_lock().context(IoSnafu { path: lock_path })?;
        ensure!(locked, LockAlreadyHeldSnafu { path: path.clone() });

        let max_key = parser.max_key();
        let mut files = BTreeMap::new();
        for dir_entry in fs::read_dir(&path).context(IoSnafu { path: path.clone() })? {
            let dir_entry = dir_entry.context(IoSnafu { path: path.clone() })?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(LOG_FILE_EXTENSION) || name == HEAD_LOG_FILE_NAME {
                continue;
            }

            let (low, high) = parse_rotated_name(parser.as_ref(), name)?;
            trace!(file = name, low = ?low, high = ?high, "Found rotated log file.");
            let file = LogFile::open_read_only(dir_entry.path(), Arc::clone(&parser), high.clone())?;
            files.insert(high, Arc::new(file));
        }

        let head = LogFile::open_appendable(
            path.join(HEAD_LOG_FILE_NAME),
            Arc::clone(&parser),
            max_key.clone(),
        )?;
        files.insert(max_key.clone(), Arc::new(head));

        debug!(
            path = %path.display(),
            files = files.len(),
            "Opened changelog directory."
        );

        Ok(Arc::new_cyclic(|self_ref| Log {
            path,
            parser,
            size_limit,
            max_key,
            registry,
            self_ref: self_ref.clone(),
            inner: RwLock::new(LogInner {
                files,
                closed: false,
            }),
            cursors: Mutex::new(Vec::new()),
            dir_lock: Mutex::new(Some(dir_lock)),
        }))
    }

    /// The directory this log lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Appends a record to the head file.
    ///
    /// The record's key must be greater than or equal to the newest appended
    /// key.  If the head already exceeds the size limit, it is rotated first
    /// and the record lands in the fresh head; a single record larger than
    /// the limit is still accepted, so a file may exceed the limit after a
    /// write.  Appending to a closed log is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfOrderAppend`](ChangelogError::OutOfOrderAppend) for a
    /// key below the newest appended key (nothing is written), a rotation
    /// error if the head needed rotating and the rename failed (the old head
    /// stays in place), or an I/O error from the write itself, in which case
    /// the head may hold a partial frame for this record until the next
    /// reopen truncates it.
    pub fn append(&self, record: Record<P::Key, P::Value>) -> Result<(), ChangelogError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }

        if let Some(newest) = Self::newest_locked(&inner) {
            ensure!(
                record.key() >= newest.key(),
                OutOfOrderAppendSnafu {
                    key: format!("{:?}", record.key()),
                    newest: format!("{:?}", newest.key()),
                }
            );
        }

        let mut head = inner.files.get(&self.max_key).cloned().expect(HEAD_INVARIANT);
        if head.size_in_bytes() > self.size_limit {
            self.rotate_locked(&mut inner)?;
            head = inner.files.get(&self.max_key).cloned().expect(HEAD_INVARIANT);
        }
        head.append(&record)
    }

    /// Forces the head to durable storage.
    ///
    /// Only records appended before a successful return are guaranteed to be
    /// durable.
    ///
    /// # Errors
    ///
    /// Any I/O error from the underlying sync.
    pub fn sync_to_file_system(&self) -> Result<(), ChangelogError> {
        let inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        inner
            .files
            .get(&self.max_key)
            .expect(HEAD_INVARIANT)
            .sync_to_file_system()
    }

    /// A cursor over the whole log, positioned before the oldest record.
    ///
    /// # Errors
    ///
    /// Any I/O error from opening a read handle on the oldest file.
    pub fn get_cursor(&self) -> Result<LogCursor<P>, ChangelogError> {
        let inner = self.inner.read();
        if inner.closed {
            return Ok(LogCursor::empty());
        }
        let file = inner
            .files
            .values()
            .next()
            .cloned()
            .expect(HEAD_INVARIANT);
        let file_cursor = file.cursor()?;
        Ok(LogCursor::active(self.self_arc(), file, file_cursor))
    }

    /// A cursor positioned exactly on `key`, or the empty cursor if no
    /// record with that key exists.
    pub fn get_cursor_at(&self, key: &P::Key) -> Result<LogCursor<P>, ChangelogError> {
        self.positioned_cursor(key, KeyMatch::Exact)
    }

    /// A cursor positioned on the first record whose key is at or above
    /// `key`, or the empty cursor if every record sits below it.
    pub fn get_nearest_cursor(&self, key: &P::Key) -> Result<LogCursor<P>, ChangelogError> {
        self.positioned_cursor(key, KeyMatch::Nearest)
    }

    fn positioned_cursor(
        &self,
        key: &P::Key,
        matching: KeyMatch,
    ) -> Result<LogCursor<P>, ChangelogError> {
        let mut cursor = self.get_cursor()?;
        if cursor.position_to(key, matching)? {
            Ok(cursor)
        } else {
            cursor.close();
            Ok(LogCursor::empty())
        }
    }

    /// The first record of the log, or `None` if the log is empty or closed.
    pub fn get_oldest_record(&self) -> Option<Record<P::Key, P::Value>> {
        let inner = self.inner.read();
        if inner.closed {
            return None;
        }
        Self::oldest_locked(&inner)
    }

    /// The last record of the log, or `None` if the log is empty or closed.
    pub fn get_newest_record(&self) -> Option<Record<P::Key, P::Value>> {
        let inner = self.inner.read();
        if inner.closed {
            return None;
        }
        Self::newest_locked(&inner)
    }

    /// Total record count across all files.
    pub fn get_number_of_records(&self) -> u64 {
        let inner = self.inner.read();
        inner.files.values().map(|file| file.number_of_records()).sum()
    }

    /// Deletes every file whose partition key is strictly less than `key`.
    ///
    /// Purging is whole-file only: records inside a surviving file are never
    /// deleted, even when some of their keys sit below `key`, and the head is
    /// never a candidate.  Cursors positioned in a purged file are
    /// invalidated.  Files that cannot be deleted are collected and surfaced
    /// as a single [`DeleteFailed`](ChangelogError::DeleteFailed) error after
    /// the rest have been removed from the inventory.
    ///
    /// Returns the oldest record of the post-purge log.
    pub fn purge_up_to(
        &self,
        key: &P::Key,
    ) -> Result<Option<Record<P::Key, P::Value>>, ChangelogError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(None);
        }

        let purge_keys: Vec<P::Key> = inner
            .files
            .range((Bound::Unbounded, Bound::Excluded(key)))
            .map(|(partition, _)| partition.clone())
            .collect();

        let mut failed = Vec::new();
        for partition in purge_keys {
            let file = inner
                .files
                .get(&partition)
                .cloned()
                .expect("inventory entry for purge candidate");
            self.invalidate_cursors(Some(&file), "purge");
            match file.delete() {
                Ok(()) => {
                    inner.files.remove(&partition);
                    trace!(path = %file.path().display(), "Purged log file.");
                }
                Err(error) => {
                    warn!(
                        path = %file.path().display(),
                        %error,
                        "Failed to delete a log file during purge."
                    );
                    failed.push(file.path().to_path_buf());
                }
            }
        }

        let oldest = Self::oldest_locked(&inner);
        ensure!(failed.is_empty(), DeleteFailedSnafu { paths: failed });
        Ok(oldest)
    }

    /// Deletes every file -- the head included -- and reopens a fresh empty
    /// head.  Open cursors are invalidated.
    ///
    /// Undeletable files are collected like in [`purge_up_to`](Self::purge_up_to);
    /// failing to recreate the head is fatal for the log's usability and is
    /// surfaced as [`ReopenHead`](ChangelogError::ReopenHead).
    pub fn clear(&self) -> Result<(), ChangelogError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }

        self.invalidate_cursors(None, "clear");

        let mut failed = Vec::new();
        let partitions: Vec<P::Key> = inner.files.keys().cloned().collect();
        for partition in partitions {
            let file = inner
                .files
                .get(&partition)
                .cloned()
                .expect("inventory entry for clear candidate");
            match file.delete() {
                Ok(()) => {
                    inner.files.remove(&partition);
                }
                Err(error) => {
                    warn!(
                        path = %file.path().display(),
                        %error,
                        "Failed to delete a log file during clear."
                    );
                    failed.push(file.path().to_path_buf());
                }
            }
        }

        let head = LogFile::open_appendable(
            self.path.join(HEAD_LOG_FILE_NAME),
            Arc::clone(&self.parser),
            self.max_key.clone(),
        )
        .context(ReopenHeadSnafu)?;
        inner.files.insert(self.max_key.clone(), Arc::new(head));

        debug!(path = %self.path.display(), "Cleared changelog.");
        ensure!(failed.is_empty(), DeleteFailedSnafu { paths: failed });
        Ok(())
    }

    /// Releases one reference to this log.
    ///
    /// The last release -- tracked by the registry that handed the instance
    /// out -- performs the real shutdown.  Never fails.
    pub fn close(&self) {
        match self.registry.upgrade() {
            Some(registry) => registry.release(&self.path),
            None => self.do_close(),
        }
    }

    /// The real shutdown: closes every file, clears the inventory, and
    /// releases the directory lock.  Idempotent.
    pub(crate) fn do_close(&self) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        inner.closed = true;

        self.invalidate_cursors(None, "close");
        for file in inner.files.values() {
            file.close();
        }
        inner.files.clear();
        drop(inner);

        *self.dir_lock.lock() = None;
        debug!(path = %self.path.display(), "Closed changelog.");
    }

    pub(crate) fn read_inner(&self) -> RwLockReadGuard<'_, LogInner<P>> {
        self.inner.read()
    }

    pub(crate) fn register_cursor(&self, cursor: Weak<Mutex<CursorInner<P>>>) {
        let mut cursors = self.cursors.lock();
        cursors.retain(|weak| weak.strong_count() > 0);
        cursors.push(cursor);
    }

    pub(crate) fn deregister_cursor(&self, cursor: &Arc<Mutex<CursorInner<P>>>) {
        let mut cursors = self.cursors.lock();
        cursors.retain(|weak| {
            weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), Arc::as_ptr(cursor))
        });
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("log self-reference is valid while the log is reachable")
    }

    /// Rotates the head: renames it to its range-encoded name, inserts the
    /// renamed file into the inventory under its high key, installs a fresh
    /// empty head, and rebinds live cursors that were reading the old head.
    ///
    /// A rename failure leaves the old head as the head; nothing is lost.
    fn rotate_locked(&self, inner: &mut LogInner<P>) -> Result<(), ChangelogError> {
        let head = inner.files.get(&self.max_key).cloned().expect(HEAD_INVARIANT);
        let (size, count, oldest, newest) = head.stats_snapshot();
        let (Some(oldest), Some(newest)) = (oldest, newest) else {
            // An empty head cannot be named by a key range.
            return Ok(());
        };

        let low = self.parser.encode_key_to_string(oldest.key());
        let high = self.parser.encode_key_to_string(newest.key());
        validate_key_encoding(&low)?;
        validate_key_encoding(&high)?;

        let rotated_path = self.path.join(format!("{low}_{high}{LOG_FILE_EXTENSION}"));
        if rotated_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "rotation target already exists",
            ))
            .context(RotationSnafu { to: rotated_path });
        }

        head.close();
        let renamed = fs::rename(head.path(), &rotated_path);
        if renamed.is_err() {
            if let Err(error) = head.reopen_appendable() {
                warn!(%error, "Failed to reopen the head file after a failed rotation.");
            }
        }
        renamed.context(RotationSnafu {
            to: rotated_path.clone(),
        })?;

        let partition_key = newest.key().clone();
        let rotated = Arc::new(LogFile::from_rotation(
            rotated_path,
            Arc::clone(&self.parser),
            partition_key.clone(),
            size,
            count,
            oldest,
            newest,
        ));
        inner.files.insert(partition_key, Arc::clone(&rotated));

        let new_head = LogFile::open_appendable(
            self.path.join(HEAD_LOG_FILE_NAME),
            Arc::clone(&self.parser),
            self.max_key.clone(),
        )?;
        inner.files.insert(self.max_key.clone(), Arc::new(new_head));

        self.reattach_cursors(&head, &rotated)?;

        debug!(
            rotated = %rotated.path().display(),
            records = count,
            "Rotated the head file."
        );
        Ok(())
    }

    /// Rebinds every live cursor that was reading the old head onto the
    /// rotated file, at the same byte offset with the same current record.
    fn reattach_cursors(
        &self,
        old_head: &Arc<LogFile<P>>,
        rotated: &Arc<LogFile<P>>,
    ) -> Result<(), ChangelogError> {
        let mut cursors = self.cursors.lock();
        cursors.retain(|weak| weak.strong_count() > 0);
        for weak in cursors.iter() {
            if let Some(cursor) = weak.upgrade() {
                cursor.lock().handle_rotation(old_head, rotated)?;
            }
        }
        Ok(())
    }

    /// Invalidates live cursors reading `target` (or all of them when
    /// `target` is `None`).  An invalidated cursor behaves like the empty
    /// cursor from then on.
    fn invalidate_cursors(&self, target: Option<&Arc<LogFile<P>>>, cause: &'static str) {
        let mut cursors = self.cursors.lock();
        cursors.retain(|weak| weak.strong_count() > 0);

        let mut invalidated = 0usize;
        for weak in cursors.iter() {
            if let Some(cursor) = weak.upgrade() {
                let mut cursor = cursor.lock();
                let applies = match target {
                    None => !cursor.is_invalidated(),
                    Some(file) => cursor.is_on(file),
                };
                if applies {
                    cursor.invalidate();
                    invalidated += 1;
                }
            }
        }

        if invalidated > 0 {
            warn!(count = invalidated, cause, "Invalidated open cursors.");
        }
    }

    fn oldest_locked(inner: &LogInner<P>) -> Option<Record<P::Key, P::Value>> {
        inner.files.values().find_map(|file| file.oldest_record())
    }

    fn newest_locked(inner: &LogInner<P>) -> Option<Record<P::Key, P::Value>> {
        inner
            .files
            .values()
            .rev()
            .find_map(|file| file.newest_record())
    }
}

fn validate_key_encoding(encoded: &str) -> Result<(), ChangelogError> {
    ensure!(
        !encoded.contains(['_', '.']),
        InvalidKeyEncodingSnafu { encoded }
    );
    Ok(())
}

fn parse_rotated_name<P: RecordParser>(
    parser: &P,
    name: &str,
) -> Result<(P::Key, P::Key), ChangelogError> {
    let Some(stem) = name.strip_suffix(LOG_FILE_EXTENSION) else {
        return InvalidFileNameSnafu { name }.fail();
    };
    let Some((low, high)) = stem.split_once('_') else {
        return InvalidFileNameSnafu { name }.fail();
    };

    let low_key = parser.decode_key_from_string(low).map_err(|source| {
        KeyDecodeSnafu {
            encoded: low,
            name,
            reason: source.to_string(),
        }
        .build()
    })?;
    let high_key = parser.decode_key_from_string(high).map_err(|source| {
        KeyDecodeSnafu {
            encoded: high,
            name,
            reason: source.to_string(),
        }
        .build()
    })?;
    Ok((low_key, high_key))
}

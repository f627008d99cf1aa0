use std::{ops::Bound, sync::Arc};

use parking_lot::Mutex;

use crate::{
    error::ChangelogError,
    file::{FileCursor, LogFile},
    log::{Log, LogInner},
    KeyMatch, Record, RecordParser,
};

/// A cursor's position in a file, captured for hand-off during rotation.
///
/// `position` is the byte offset at which the next read occurs, i.e. just
/// past `record`.  The state stays valid across a head-to-rotated rename
/// because rotation preserves the file's bytes.
pub(crate) struct CursorState<P: RecordParser> {
    pub(crate) record: Option<Record<P::Key, P::Value>>,
    pub(crate) position: u64,
}

/// Forward, repositionable cursor over a changelog.
///
/// The cursor walks the log's files in key order, crossing file boundaries
/// transparently, and keeps its position through a rotation of the head.  A
/// cursor is owned by a single reader; it is not meant to be shared between
/// threads.
///
/// The empty form -- returned when the log is closed at cursor-request time,
/// or when positioning on a key finds nothing -- yields no records: `record()`
/// is `None` and `next()`/`position_to` return `Ok(false)`.
pub struct LogCursor<P: RecordParser> {
    inner: Option<ActiveCursor<P>>,
}

struct ActiveCursor<P: RecordParser> {
    log: Arc<Log<P>>,
    shared: Arc<Mutex<CursorInner<P>>>,
}

/// The mutable state of a live cursor.
///
/// Shared between the owning [`LogCursor`] and the log's registered-cursor
/// list, so that rotation can rebind a cursor that sits on the head, and
/// purge/clear can invalidate cursors whose file is going away.
pub(crate) struct CursorInner<P: RecordParser> {
    file: Arc<LogFile<P>>,
    file_cursor: Option<FileCursor<P>>,
    invalidated: bool,
}

impl<P: RecordParser> LogCursor<P> {
    pub(crate) fn empty() -> Self {
        Self { inner: None }
    }

    pub(crate) fn active(
        log: Arc<Log<P>>,
        file: Arc<LogFile<P>>,
        file_cursor: FileCursor<P>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(CursorInner {
            file,
            file_cursor: Some(file_cursor),
            invalidated: false,
        }));
        log.register_cursor(Arc::downgrade(&shared));
        Self {
            inner: Some(ActiveCursor { log, shared }),
        }
    }

    /// The record the cursor is currently positioned on, if any.
    pub fn record(&self) -> Option<Record<P::Key, P::Value>> {
        let active = self.inner.as_ref()?;
        let state = active.shared.lock();
        if state.invalidated {
            return None;
        }
        state.file_cursor.as_ref().and_then(|c| c.record().cloned())
    }

    /// Advances to the next record in key order, stepping into the next file
    /// of the chain when the current one is exhausted.
    ///
    /// Returns `Ok(false)` when no further record exists yet; a later call
    /// picks up records appended in the meantime.
    ///
    /// # Errors
    ///
    /// I/O errors from reading, and corruption errors if a stored record
    /// fails its checksum or cannot be decoded.
    pub fn next(&mut self) -> Result<bool, ChangelogError> {
        let Some(active) = self.inner.as_ref() else {
            return Ok(false);
        };
        let guard = active.log.read_inner();
        if guard.closed {
            return Ok(false);
        }
        let mut state = active.shared.lock();
        if state.invalidated {
            return Ok(false);
        }
        Self::advance(&guard, &mut state)
    }

    /// Repositions the cursor on `key` according to `matching`.
    ///
    /// The containing file is found by a ceiling lookup on the inventory;
    /// keys below the oldest file naturally land in it.  Returns whether a
    /// record is now available.
    pub fn position_to(
        &mut self,
        key: &P::Key,
        matching: KeyMatch,
    ) -> Result<bool, ChangelogError> {
        let Some(active) = self.inner.as_ref() else {
            return Ok(false);
        };
        let guard = active.log.read_inner();
        if guard.closed {
            return Ok(false);
        }
        let mut state = active.shared.lock();
        if state.invalidated {
            return Ok(false);
        }

        let containing = guard
            .files
            .range((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(_, file)| Arc::clone(file));
        let Some(containing) = containing else {
            return Ok(false);
        };

        if !Arc::ptr_eq(&state.file, &containing) {
            state.file_cursor = Some(containing.cursor()?);
            state.file = containing;
        }

        let cursor = state
            .file_cursor
            .as_mut()
            .expect("live cursor always has a file cursor");
        let found = cursor.position_to(key, matching)?;
        if found && cursor.record().is_none() {
            // The key falls past the end of this file; the matching record
            // lives at the start of the next one.
            return Self::advance(&guard, &mut state);
        }
        Ok(found)
    }

    /// Closes the cursor, releasing its file handle and deregistering it
    /// from the log.  Further operations behave like the empty cursor.
    pub fn close(&mut self) {
        if let Some(active) = self.inner.take() {
            let _guard = active.log.read_inner();
            active.log.deregister_cursor(&active.shared);
            let mut state = active.shared.lock();
            state.file_cursor = None;
            state.invalidated = true;
        }
    }

    fn advance(inner: &LogInner<P>, state: &mut CursorInner<P>) -> Result<bool, ChangelogError> {
        match state.file_cursor.as_mut() {
            Some(cursor) => {
                if cursor.next()? {
                    return Ok(true);
                }
            }
            None => return Ok(false),
        }

        // The current file is exhausted; walk the chain until a file with a
        // record turns up.  Only the head can legitimately be empty, so the
        // walk parks there at worst.
        loop {
            let next = inner
                .files
                .range((
                    Bound::Excluded(state.file.partition_key()),
                    Bound::Unbounded,
                ))
                .next()
                .map(|(_, file)| Arc::clone(file));
            let Some(file) = next else {
                return Ok(false);
            };

            let mut cursor = file.cursor()?;
            let has_record = cursor.next()?;
            state.file = file;
            state.file_cursor = Some(cursor);
            if has_record {
                return Ok(true);
            }
        }
    }
}

impl<P: RecordParser> Drop for LogCursor<P> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<P: RecordParser> CursorInner<P> {
    /// Rebinds a cursor that sits on the old head onto the freshly rotated
    /// file, at the same byte offset with the same current record.
    pub(crate) fn handle_rotation(
        &mut self,
        old_head: &Arc<LogFile<P>>,
        rotated: &Arc<LogFile<P>>,
    ) -> Result<(), ChangelogError> {
        if self.invalidated || !Arc::ptr_eq(&self.file, old_head) {
            return Ok(());
        }
        let Some(cursor) = self.file_cursor.as_ref() else {
            return Ok(());
        };
        self.file_cursor = Some(rotated.cursor_initialised_to(cursor.state())?);
        self.file = Arc::clone(rotated);
        Ok(())
    }

    pub(crate) fn invalidate(&mut self) {
        self.file_cursor = None;
        self.invalidated = true;
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub(crate) fn is_on(&self, file: &Arc<LogFile<P>>) -> bool {
        !self.invalidated && Arc::ptr_eq(&self.file, file)
    }
}

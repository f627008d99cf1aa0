use std::{
    fs::{self, File, OpenOptions},
    io::{BufReader, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::BytesMut;
use parking_lot::Mutex;
use snafu::{ensure, ResultExt};

use crate::{
    cursor::CursorState,
    error::{
        ChangelogError, ChecksumSnafu, DecodeSnafu, IoSnafu, PartialWriteSnafu,
        RecordTooLargeSnafu,
    },
    record::{self, FrameRead, RecordStatus, FRAME_HEADER_LEN},
    KeyMatch, Record, RecordParser,
};

/// A single append-only log file.
///
/// The head file of a log is writable and receives appends; rotated files are
/// read-only.  Record count, byte size, and the oldest/newest records are
/// recovered by a full scan when an existing file is opened, and maintained
/// incrementally afterwards, so the read accessors never touch the disk.
///
/// Readers do not share the append handle: every [`FileCursor`] opens its own
/// read handle on the file's path.
pub(crate) struct LogFile<P: RecordParser> {
    path: PathBuf,
    parser: Arc<P>,
    partition_key: P::Key,
    inner: Mutex<FileInner<P>>,
}

struct FileInner<P: RecordParser> {
    /// Write handle, present only while the file is the appendable head.
    appender: Option<File>,
    size: u64,
    count: u64,
    oldest: Option<Record<P::Key, P::Value>>,
    newest: Option<Record<P::Key, P::Value>>,
}

struct ScanOutcome<P: RecordParser> {
    valid_len: u64,
    file_len: u64,
    count: u64,
    oldest: Option<Record<P::Key, P::Value>>,
    newest: Option<Record<P::Key, P::Value>>,
}

impl<P: RecordParser> LogFile<P> {
    /// Opens (or creates) an appendable log file.
    ///
    /// An existing file is scanned in full to recover its stats.  A trailing
    /// partial frame -- a torn write from a crash -- is truncated away so that
    /// subsequent appends start at a clean frame boundary; corruption
    /// anywhere before the tail is an error.
    pub(crate) fn open_appendable(
        path: PathBuf,
        parser: Arc<P>,
        partition_key: P::Key,
    ) -> Result<Self, ChangelogError> {
        let appender = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(IoSnafu { path: path.clone() })?;

        let scan = scan_records(&path, parser.as_ref())?;
        if scan.valid_len < scan.file_len {
            warn!(
                path = %path.display(),
                dropped_bytes = scan.file_len - scan.valid_len,
                "Discarding partially written record at the end of the file."
            );
            appender
                .set_len(scan.valid_len)
                .context(IoSnafu { path: path.clone() })?;
        }

        Ok(Self {
            path,
            parser,
            partition_key,
            inner: Mutex::new(FileInner {
                appender: Some(appender),
                size: scan.valid_len,
                count: scan.count,
                oldest: scan.oldest,
                newest: scan.newest,
            }),
        })
    }

    /// Opens an existing file read-only, scanning it to recover its stats.
    pub(crate) fn open_read_only(
        path: PathBuf,
        parser: Arc<P>,
        partition_key: P::Key,
    ) -> Result<Self, ChangelogError> {
        let scan = scan_records(&path, parser.as_ref())?;
        ensure!(
            scan.valid_len == scan.file_len,
            PartialWriteSnafu {
                path: path.clone(),
                offset: scan.valid_len,
            }
        );

        Ok(Self {
            path,
            parser,
            partition_key,
            inner: Mutex::new(FileInner {
                appender: None,
                size: scan.valid_len,
                count: scan.count,
                oldest: scan.oldest,
                newest: scan.newest,
            }),
        })
    }

    /// Builds the read-only view of a freshly rotated file.
    ///
    /// Rotation is a rename, so the bytes -- and therefore the stats the head
    /// already tracked -- are unchanged; no rescan is needed.
    pub(crate) fn from_rotation(
        path: PathBuf,
        parser: Arc<P>,
        partition_key: P::Key,
        size: u64,
        count: u64,
        oldest: Record<P::Key, P::Value>,
        newest: Record<P::Key, P::Value>,
    ) -> Self {
        Self {
            path,
            parser,
            partition_key,
            inner: Mutex::new(FileInner {
                appender: None,
                size,
                count,
                oldest: Some(oldest),
                newest: Some(newest),
            }),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// The key this file is indexed under in the log's inventory: the high
    /// key of a rotated file, or the parser's sentinel for the head.
    pub(crate) fn partition_key(&self) -> &P::Key {
        &self.partition_key
    }

    pub(crate) fn append(&self, record: &Record<P::Key, P::Value>) -> Result<(), ChangelogError> {
        let mut payload = BytesMut::new();
        self.parser.encode_record(record, &mut payload);
        ensure!(
            u32::try_from(payload.len()).is_ok(),
            RecordTooLargeSnafu {
                size: payload.len()
            }
        );

        let mut framed = BytesMut::with_capacity(payload.len() + FRAME_HEADER_LEN as usize);
        record::write_frame(&payload, &mut framed);

        let mut inner = self.inner.lock();
        let appender = inner
            .appender
            .as_mut()
            .expect("append is only routed to the head file");
        appender
            .write_all(&framed)
            .context(IoSnafu {
                path: self.path.clone(),
            })?;

        inner.size += framed.len() as u64;
        inner.count += 1;
        if inner.oldest.is_none() {
            inner.oldest = Some(record.clone());
        }
        inner.newest = Some(record.clone());
        Ok(())
    }

    /// Forces everything appended so far to durable storage.
    pub(crate) fn sync_to_file_system(&self) -> Result<(), ChangelogError> {
        let inner = self.inner.lock();
        if let Some(appender) = inner.appender.as_ref() {
            appender.sync_all().context(IoSnafu {
                path: self.path.clone(),
            })?;
        }
        Ok(())
    }

    pub(crate) fn size_in_bytes(&self) -> u64 {
        self.inner.lock().size
    }

    pub(crate) fn number_of_records(&self) -> u64 {
        self.inner.lock().count
    }

    pub(crate) fn oldest_record(&self) -> Option<Record<P::Key, P::Value>> {
        self.inner.lock().oldest.clone()
    }

    pub(crate) fn newest_record(&self) -> Option<Record<P::Key, P::Value>> {
        self.inner.lock().newest.clone()
    }

    /// All cached stats at once, for building the rotated view of this file.
    #[allow(clippy::type_complexity)]
    pub(crate) fn stats_snapshot(
        &self,
    ) -> (
        u64,
        u64,
        Option<Record<P::Key, P::Value>>,
        Option<Record<P::Key, P::Value>>,
    ) {
        let inner = self.inner.lock();
        (
            inner.size,
            inner.count,
            inner.oldest.clone(),
            inner.newest.clone(),
        )
    }

    /// A cursor positioned before the first record.
    pub(crate) fn cursor(&self) -> Result<FileCursor<P>, ChangelogError> {
        FileCursor::open(self.path.clone(), Arc::clone(&self.parser))
    }

    /// A cursor whose current record and next-read offset are supplied rather
    /// than discovered.  This is the rotation hand-off primitive: the bytes
    /// of a rotated file are those of the old head, so a reader's position in
    /// one is valid in the other.
    pub(crate) fn cursor_initialised_to(
        &self,
        state: CursorState<P>,
    ) -> Result<FileCursor<P>, ChangelogError> {
        FileCursor::initialised_to(self.path.clone(), Arc::clone(&self.parser), state)
    }

    /// Drops the write handle.  Read accessors and cursors keep working.
    pub(crate) fn close(&self) {
        self.inner.lock().appender = None;
    }

    /// Reinstates the write handle after a failed rotation rename.
    pub(crate) fn reopen_appendable(&self) -> Result<(), ChangelogError> {
        let appender = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .context(IoSnafu {
                path: self.path.clone(),
            })?;
        self.inner.lock().appender = Some(appender);
        Ok(())
    }

    /// Closes the file and removes it from disk.
    pub(crate) fn delete(&self) -> Result<(), ChangelogError> {
        self.close();
        fs::remove_file(&self.path).context(IoSnafu {
            path: self.path.clone(),
        })
    }
}

/// Forward cursor over a single log file.
///
/// Owns its own read handle; `position` is the byte offset at which the next
/// read occurs, i.e. just past the current record.
pub(crate) struct FileCursor<P: RecordParser> {
    path: PathBuf,
    parser: Arc<P>,
    reader: BufReader<File>,
    position: u64,
    current: Option<Record<P::Key, P::Value>>,
}

impl<P: RecordParser> FileCursor<P> {
    fn open(path: PathBuf, parser: Arc<P>) -> Result<Self, ChangelogError> {
        let file = File::open(&path).context(IoSnafu { path: path.clone() })?;
        Ok(Self {
            path,
            parser,
            reader: BufReader::new(file),
            position: 0,
            current: None,
        })
    }

    fn initialised_to(
        path: PathBuf,
        parser: Arc<P>,
        state: CursorState<P>,
    ) -> Result<Self, ChangelogError> {
        let mut cursor = Self::open(path, parser)?;
        cursor
            .reader
            .seek(SeekFrom::Start(state.position))
            .context(IoSnafu {
                path: cursor.path.clone(),
            })?;
        cursor.position = state.position;
        cursor.current = state.record;
        Ok(cursor)
    }

    pub(crate) fn record(&self) -> Option<&Record<P::Key, P::Value>> {
        self.current.as_ref()
    }

    /// Captures the cursor's position for hand-off to another file.
    pub(crate) fn state(&self) -> CursorState<P> {
        CursorState {
            record: self.current.clone(),
            position: self.position,
        }
    }

    /// Advances to the next record.
    ///
    /// Returns `Ok(false)` at the end of the file, leaving the read offset
    /// where it is: records appended later are picked up by a subsequent
    /// call.
    pub(crate) fn next(&mut self) -> Result<bool, ChangelogError> {
        match record::read_frame(&mut self.reader).context(IoSnafu {
            path: self.path.clone(),
        })? {
            FrameRead::Eof => {
                self.current = None;
                Ok(false)
            }
            FrameRead::Partial => {
                // Restore a clean frame boundary before surfacing the error.
                self.reader
                    .seek(SeekFrom::Start(self.position))
                    .context(IoSnafu {
                        path: self.path.clone(),
                    })?;
                self.current = None;
                PartialWriteSnafu {
                    path: self.path.clone(),
                    offset: self.position,
                }
                .fail()
            }
            FrameRead::Frame {
                payload,
                stored_checksum,
            } => {
                if let RecordStatus::Corrupted { calculated, actual } =
                    record::verify_payload(&payload, stored_checksum)
                {
                    return ChecksumSnafu {
                        calculated,
                        actual,
                        path: self.path.clone(),
                        offset: self.position,
                    }
                    .fail();
                }

                let record = match self.parser.decode_record(&payload) {
                    Ok(record) => record,
                    Err(source) => {
                        return DecodeSnafu {
                            path: self.path.clone(),
                            reason: source.to_string(),
                        }
                        .fail()
                    }
                };

                self.position += FRAME_HEADER_LEN + payload.len() as u64;
                self.current = Some(record);
                Ok(true)
            }
        }
    }

    /// Positions the cursor on `key` according to `matching`.
    ///
    /// Under [`KeyMatch::Nearest`], exhausting the file means every record
    /// here sits below the key: the cursor reports "found" with no current
    /// record, and the caller steps across the file boundary.  Under
    /// [`KeyMatch::Exact`] a miss returns `Ok(false)`, leaving the cursor on
    /// the first record past the requested key if one exists.
    pub(crate) fn position_to(
        &mut self,
        key: &P::Key,
        matching: KeyMatch,
    ) -> Result<bool, ChangelogError> {
        self.rewind()?;
        loop {
            if !self.next()? {
                return match matching {
                    KeyMatch::Exact => Ok(false),
                    KeyMatch::Nearest => Ok(true),
                };
            }

            let record_key = self
                .current
                .as_ref()
                .expect("record is present after a successful advance")
                .key();
            match matching {
                KeyMatch::Exact => {
                    if record_key == key {
                        return Ok(true);
                    }
                    if record_key > key {
                        return Ok(false);
                    }
                }
                KeyMatch::Nearest => {
                    if record_key >= key {
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn rewind(&mut self) -> Result<(), ChangelogError> {
        self.reader
            .seek(SeekFrom::Start(0))
            .context(IoSnafu {
                path: self.path.clone(),
            })?;
        self.position = 0;
        self.current = None;
        Ok(())
    }
}

fn scan_records<P: RecordParser>(
    path: &Path,
    parser: &P,
) -> Result<ScanOutcome<P>, ChangelogError> {
    let file = File::open(path).context(IoSnafu {
        path: path.to_path_buf(),
    })?;
    let file_len = file
        .metadata()
        .context(IoSnafu {
            path: path.to_path_buf(),
        })?
        .len();
    let mut reader = BufReader::new(file);

    let mut offset = 0u64;
    let mut count = 0u64;
    let mut oldest = None;
    let mut newest = None;

    loop {
        match record::read_frame(&mut reader).context(IoSnafu {
            path: path.to_path_buf(),
        })? {
            FrameRead::Eof | FrameRead::Partial => break,
            FrameRead::Frame {
                payload,
                stored_checksum,
            } => {
                if let RecordStatus::Corrupted { calculated, actual } =
                    record::verify_payload(&payload, stored_checksum)
                {
                    return ChecksumSnafu {
                        calculated,
                        actual,
                        path: path.to_path_buf(),
                        offset,
                    }
                    .fail();
                }

                let record = match parser.decode_record(&payload) {
                    Ok(record) => record,
                    Err(source) => {
                        return DecodeSnafu {
                            path: path.to_path_buf(),
                            reason: source.to_string(),
                        }
                        .fail()
                    }
                };

                if oldest.is_none() {
                    oldest = Some(record.clone());
                }
                newest = Some(record);
                count += 1;
                offset += FRAME_HEADER_LEN + payload.len() as u64;
            }
        }
    }

    Ok(ScanOutcome {
        valid_len: offset,
        file_len,
        count,
        oldest,
        newest,
    })
}

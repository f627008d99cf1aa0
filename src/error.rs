use std::{io, path::PathBuf};

use snafu::Snafu;

/// Error that occurred while operating on a changelog.
///
/// Every fallible operation in this crate surfaces this one error kind,
/// parameterized by the failure that caused it.  The log does not retry and
/// does not invalidate itself on an error; the caller decides whether to
/// retry, abandon the operation, or close the log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChangelogError {
    /// A general I/O error occurred.
    ///
    /// Raised for any filesystem operation that is not covered by a more
    /// specific variant: creating the log directory, listing it, opening or
    /// reading a log file, writing an appended record, or syncing the head.
    #[snafu(display("I/O error on {}: {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    /// A file in the log directory does not follow the rotated-file naming
    /// scheme.
    ///
    /// Rotated files must be named `<lowKey>_<highKey>.log`; the name is the
    /// authoritative index of the key range the file contains, so a file that
    /// cannot be parsed cannot be placed in the inventory.
    #[snafu(display("log file name {:?} is not of the form <low>_<high>.log", name))]
    InvalidFileName { name: String },

    /// A key string embedded in a rotated file name could not be decoded.
    ///
    /// This should only occur if a rotated file was renamed out of process,
    /// or if the log directory is opened with a parser that is not the one
    /// that produced the files.
    #[snafu(display("failed to decode key {:?} from file name {:?}: {}", encoded, name, reason))]
    KeyDecode {
        encoded: String,
        name: String,
        reason: String,
    },

    /// The changelog directory is already locked.
    ///
    /// Advisory locking prevents two processes from appending to the same
    /// directory.  The lock does not protect against another process
    /// modifying the files directly.
    #[snafu(display(
        "failed to lock {}; is another process using this changelog?",
        path.display()
    ))]
    LockAlreadyHeld { path: PathBuf },

    /// An appended record would break the global key ordering.
    ///
    /// Records must be appended with non-decreasing keys.  This is a caller
    /// bug rather than an I/O problem; nothing was written.
    #[snafu(display(
        "record key {} is lower than the newest appended key {}",
        key,
        newest
    ))]
    OutOfOrderAppend { key: String, newest: String },

    /// A key's string encoding contains a character reserved by the
    /// rotated-file naming scheme.
    ///
    /// `_` separates the low and high keys and `.` starts the extension, so
    /// neither may appear in an encoded key.  Raised before any file is
    /// touched; the head remains the head.
    #[snafu(display("encoded key {:?} contains a reserved character ('_' or '.')", encoded))]
    InvalidKeyEncoding { encoded: String },

    /// The encoded form of a record is too large to frame.
    #[snafu(display("encoded record is {} bytes, which exceeds the frame limit", size))]
    RecordTooLarge { size: usize },

    /// Renaming the head file to its rotated name failed.
    ///
    /// The old head remains the head and no data is lost, but subsequent
    /// appends will continue to grow it past the size threshold until a
    /// later rotation succeeds.
    #[snafu(display("failed to rotate head file to {}: {}", to.display(), source))]
    Rotation { to: PathBuf, source: io::Error },

    /// One or more files could not be deleted during a purge or a clear.
    ///
    /// Files that did delete have already been removed from the inventory;
    /// the paths listed here are the survivors that should have been removed.
    #[snafu(display("failed to delete {} log file(s): {:?}", paths.len(), paths))]
    DeleteFailed { paths: Vec<PathBuf> },

    /// A fresh head file could not be created after a clear.
    ///
    /// Unlike a failed deletion this is fatal for the log's usability, since
    /// there is no longer a writable head to append to.
    #[snafu(display("failed to reopen a fresh head file after clear: {}", source))]
    ReopenHead {
        #[snafu(source(from(ChangelogError, Box::new)))]
        source: Box<ChangelogError>,
    },

    /// A stored record's checksum did not match its payload.
    ///
    /// Indicates that a log file was corrupted or modified outside of this
    /// process; torn trailing writes are handled separately by truncation at
    /// open time and do not produce this error.
    #[snafu(display(
        "calculated checksum did not match the stored checksum ({} vs {}) in {} at offset {}",
        calculated,
        actual,
        path.display(),
        offset
    ))]
    Checksum {
        calculated: u32,
        actual: u32,
        path: PathBuf,
        offset: u64,
    },

    /// A record frame stops short of its declared length.
    ///
    /// Records never span files and appends are serialized, so a cursor
    /// should never observe a partial frame in a healthy log.
    #[snafu(display("partially written record in {} at offset {}", path.display(), offset))]
    PartialWrite { path: PathBuf, offset: u64 },

    /// The parser failed to decode a record payload whose checksum was valid.
    #[snafu(display("failed to decode record payload in {}: {}", path.display(), reason))]
    Decode { path: PathBuf, reason: String },
}

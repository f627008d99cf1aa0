use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{error::ChangelogError, log::Log, RecordParser};

/// Hands out one shared [`Log`] per directory path, reference-counted across
/// openers.
///
/// Opening a path that is already open increments the count and returns the
/// existing instance; each [`Log::close`] decrements it, and the transition
/// to zero performs the real shutdown and removes the entry.  The registry
/// lock serializes `open` and `release` so that concurrent opens of the same
/// path cannot create duplicate instances, and a close racing an open cannot
/// shut down an instance that was just handed out.
///
/// The registry itself is an ordinary value: applications that want a
/// process-wide singleton wrap one in a `OnceLock` (or equivalent) static.
pub struct LogRegistry<P: RecordParser> {
    shared: Arc<RegistryShared<P>>,
}

pub(crate) struct RegistryShared<P: RecordParser> {
    entries: Mutex<HashMap<PathBuf, RegistryEntry<P>>>,
}

struct RegistryEntry<P: RecordParser> {
    log: Arc<Log<P>>,
    open_count: usize,
}

impl<P: RecordParser> LogRegistry<P> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Opens the log at `path`, creating it on first open.
    ///
    /// The parser and size limit only take effect on the open that actually
    /// constructs the instance; later opens of the same path get the
    /// existing instance back and their arguments are ignored -- first opener
    /// wins.  A differing size limit is logged, since it usually indicates a
    /// configuration mix-up.
    ///
    /// # Errors
    ///
    /// Construction errors surface here: the directory cannot be created or
    /// listed, the directory is locked by another process, a rotated file
    /// name does not parse, or a file fails to open or scan.  Everything
    /// opened before the failure point is released again.
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        parser: P,
        size_limit: u64,
    ) -> Result<Arc<Log<P>>, ChangelogError> {
        let path = path.as_ref().to_path_buf();
        let mut entries = self.shared.entries.lock();

        if let Some(entry) = entries.get_mut(&path) {
            entry.open_count += 1;
            if entry.log.size_limit() != size_limit {
                warn!(
                    path = %path.display(),
                    requested = size_limit,
                    effective = entry.log.size_limit(),
                    "Ignoring size limit of a subsequent open; the first opener's limit stays in effect."
                );
            }
            return Ok(Arc::clone(&entry.log));
        }

        let log = Log::open(
            path.clone(),
            Arc::new(parser),
            size_limit,
            Arc::downgrade(&self.shared),
        )?;
        entries.insert(
            path,
            RegistryEntry {
                log: Arc::clone(&log),
                open_count: 1,
            },
        );
        Ok(log)
    }
}

impl<P: RecordParser> Default for LogRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: RecordParser> RegistryShared<P> {
    /// Releases one reference to the log at `path`, shutting the log down
    /// and dropping the entry when the count reaches zero.  Releasing an
    /// unknown path is tolerated.
    pub(crate) fn release(&self, path: &Path) {
        let mut entries = self.entries.lock();
        match entries.get_mut(path) {
            Some(entry) if entry.open_count > 1 => {
                entry.open_count -= 1;
            }
            Some(_) => {
                let entry = entries
                    .remove(path)
                    .expect("entry is present in the matched arm");
                entry.log.do_close();
            }
            None => {
                warn!(
                    path = %path.display(),
                    "Released a log that is not registered; ignoring."
                );
            }
        }
    }
}

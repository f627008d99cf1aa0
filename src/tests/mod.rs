//! Scenario tests for the changelog, organized by the behavior they
//! exercise.  Shared helpers live here; the per-area suites are the
//! submodules.

use std::{fs, ops::RangeInclusive, path::Path, sync::Arc};

use crate::{
    test::{entry, IndexParser},
    Log, LogCursor, LogRegistry, RecordParser,
};

mod basic;
mod purge;

pub(crate) fn open_log(
    registry: &LogRegistry<IndexParser>,
    path: &Path,
    size_limit: u64,
) -> Arc<Log<IndexParser>> {
    registry
        .open(path, IndexParser, size_limit)
        .expect("opening the changelog should not fail")
}

/// Drains the cursor, returning every remaining key in traversal order.
pub(crate) fn collect_keys(cursor: &mut LogCursor<IndexParser>) -> Vec<u64> {
    let mut keys = Vec::new();
    while cursor.next().expect("cursor traversal should not fail") {
        keys.push(*cursor.record().expect("record after successful advance").key());
    }
    keys
}

/// The `.log` file names present in the directory, sorted.
pub(crate) fn log_file_names(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(path)
        .expect("listing the log directory should not fail")
        .map(|dir_entry| {
            dir_entry
                .expect("directory entry should be readable")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .filter(|name| name.ends_with(".log"))
        .collect();
    names.sort();
    names
}

pub(crate) fn rotated_name(low: u64, high: u64) -> String {
    let parser = IndexParser;
    format!(
        "{}_{}.log",
        parser.encode_key_to_string(&low),
        parser.encode_key_to_string(&high)
    )
}

/// Fixed-width value so that every appended record frames to exactly 20
/// bytes, making rotation boundaries deterministic.
pub(crate) fn padded(i: u64) -> String {
    format!("{i:04}")
}

pub(crate) fn append_padded(log: &Log<IndexParser>, keys: RangeInclusive<u64>) {
    for i in keys {
        log.append(entry(i, &padded(i))).expect("append should not fail");
    }
}

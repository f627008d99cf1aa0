use pretty_assertions::assert_eq;

use super::{append_padded, collect_keys, log_file_names, open_log, rotated_name};
use crate::{
    test::{install_test_tracing, with_temp_dir},
    LogRegistry,
};

// Limit chosen so that appending 1..=25 leaves `1_10.log`, `11_20.log`, and
// keys 21..=25 in the head.
const TEN_RECORD_LIMIT: u64 = 199;

#[test]
fn purge_removes_whole_files_below_the_boundary() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, TEN_RECORD_LIMIT);
        append_padded(&log, 1..=25);

        // 1_10.log has partition key 10 < 15 and goes; 11_20.log has
        // partition key 20 >= 15 and stays, even though keys 11..=14 sit
        // below the boundary.
        let oldest = log.purge_up_to(&15).expect("purge should not fail");
        assert_eq!(oldest.map(|r| *r.key()), Some(11));

        let mut expected = vec![rotated_name(11, 20), "head.log".to_string()];
        expected.sort();
        assert_eq!(log_file_names(dir), expected);

        let mut cursor = log.get_cursor().expect("cursor should open");
        assert_eq!(collect_keys(&mut cursor), (11..=25).collect::<Vec<_>>());
        assert_eq!(log.get_number_of_records(), 15);

        log.close();
    });
}

#[test]
fn purge_at_a_partition_boundary() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, TEN_RECORD_LIMIT);
        append_padded(&log, 1..=25);

        // Partition key 20 is not strictly less than 20, so 11_20.log stays.
        let oldest = log.purge_up_to(&20).expect("purge should not fail");
        assert_eq!(oldest.map(|r| *r.key()), Some(11));

        // One key higher and it goes.
        let oldest = log.purge_up_to(&21).expect("purge should not fail");
        assert_eq!(oldest.map(|r| *r.key()), Some(21));

        let mut cursor = log.get_cursor().expect("cursor should open");
        assert_eq!(collect_keys(&mut cursor), (21..=25).collect::<Vec<_>>());

        log.close();
    });
}

#[test]
fn purge_below_everything_is_a_noop() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, TEN_RECORD_LIMIT);
        append_padded(&log, 1..=25);

        let names_before = log_file_names(dir);
        let oldest = log.purge_up_to(&1).expect("purge should not fail");
        assert_eq!(oldest.map(|r| *r.key()), Some(1));
        assert_eq!(log_file_names(dir), names_before);

        log.close();
    });
}

#[test]
fn purge_never_removes_the_head() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, TEN_RECORD_LIMIT);
        append_padded(&log, 1..=25);

        // Far above every real key, but below the head's sentinel.
        let oldest = log.purge_up_to(&10_000).expect("purge should not fail");
        assert_eq!(oldest.map(|r| *r.key()), Some(21));

        assert_eq!(log_file_names(dir), vec!["head.log"]);
        let mut cursor = log.get_cursor().expect("cursor should open");
        assert_eq!(collect_keys(&mut cursor), (21..=25).collect::<Vec<_>>());

        log.close();
    });
}

#[test]
fn purge_of_an_empty_log_returns_nothing() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, 1024);

        let oldest = log.purge_up_to(&5).expect("purge should not fail");
        assert!(oldest.is_none());

        log.close();
    });
}

#[test]
fn purge_invalidates_cursors_in_removed_files() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, TEN_RECORD_LIMIT);
        append_padded(&log, 1..=25);

        let mut doomed = log.get_cursor_at(&5).expect("cursor should open");
        assert_eq!(doomed.record().map(|r| *r.key()), Some(5));

        log.purge_up_to(&15).expect("purge should not fail");

        // The cursor's file is gone; it now behaves like the empty cursor.
        assert!(doomed.record().is_none());
        assert!(!doomed.next().expect("cursor traversal should not fail"));

        // The log itself is unaffected.
        let mut fresh = log.get_cursor().expect("cursor should open");
        assert_eq!(collect_keys(&mut fresh), (11..=25).collect::<Vec<_>>());

        log.close();
    });
}

#[test]
fn purge_leaves_cursors_in_surviving_files_alone() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, TEN_RECORD_LIMIT);
        append_padded(&log, 1..=25);

        let mut survivor = log.get_cursor_at(&12).expect("cursor should open");
        log.purge_up_to(&15).expect("purge should not fail");

        assert_eq!(survivor.record().map(|r| *r.key()), Some(12));
        assert_eq!(collect_keys(&mut survivor), (13..=25).collect::<Vec<_>>());

        log.close();
    });
}

use pretty_assertions::assert_eq;

use super::{collect_keys, log_file_names, open_log};
use crate::{
    test::{entry, install_test_tracing, with_temp_dir},
    ChangelogError, LogRegistry,
};

#[test]
fn append_and_traverse_without_rotation() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, 1024 * 1024);

        for i in 1..=100 {
            log.append(entry(i, &format!("v{i}")))
                .expect("append should not fail");
        }

        let mut cursor = log.get_cursor().expect("cursor should open");
        assert_eq!(collect_keys(&mut cursor), (1..=100).collect::<Vec<_>>());

        // Nothing rotated: the head is the only log file.
        assert_eq!(log_file_names(dir), vec!["head.log"]);
        assert_eq!(log.get_number_of_records(), 100);
        assert_eq!(log.get_oldest_record().map(|r| *r.key()), Some(1));
        assert_eq!(log.get_newest_record().map(|r| *r.key()), Some(100));

        log.close();
    });
}

#[test]
fn record_values_round_trip() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, 1024 * 1024);

        let expected: Vec<_> = (1..=10).map(|i| entry(i, &format!("value-{i}"))).collect();
        for record in &expected {
            log.append(record.clone()).expect("append should not fail");
        }

        let mut cursor = log.get_cursor().expect("cursor should open");
        let mut actual = Vec::new();
        while cursor.next().expect("cursor traversal should not fail") {
            actual.push(cursor.record().expect("record after successful advance"));
        }
        assert_eq!(actual, expected);

        log.close();
    });
}

#[test]
fn empty_log_has_no_records() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, 1024);

        assert_eq!(log.get_number_of_records(), 0);
        assert!(log.get_oldest_record().is_none());
        assert!(log.get_newest_record().is_none());

        let mut cursor = log.get_cursor().expect("cursor should open");
        assert!(cursor.record().is_none());
        assert!(!cursor.next().expect("cursor traversal should not fail"));

        log.close();
    });
}

#[test]
fn out_of_order_append_is_rejected() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, 1024 * 1024);

        log.append(entry(5, "a")).expect("append should not fail");
        let result = log.append(entry(3, "b"));
        assert!(matches!(result, Err(ChangelogError::OutOfOrderAppend { .. })));

        // Equal keys are allowed, and the log stays usable.
        log.append(entry(5, "c")).expect("append should not fail");
        log.append(entry(6, "d")).expect("append should not fail");

        let mut cursor = log.get_cursor().expect("cursor should open");
        assert_eq!(collect_keys(&mut cursor), vec![5, 5, 6]);

        log.close();
    });
}

#[test]
fn sync_after_append_succeeds() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, 1024);

        log.append(entry(1, "a")).expect("append should not fail");
        log.sync_to_file_system().expect("sync should not fail");

        log.close();
    });
}

#[test]
fn cursor_picks_up_appends_after_exhaustion() {
    install_test_tracing();
    with_temp_dir(|dir| {
        let registry = LogRegistry::new();
        let log = open_log(&registry, dir, 1024 * 1024);

        log.append(entry(1, "a")).expect("append should not fail");

        let mut cursor = log.get_cursor().expect("cursor should open");
        assert_eq!(collect_keys(&mut cursor), vec![1]);
        assert!(!cursor.next().expect("cursor traversal should not fail"));

        log.append(entry(2, "b")).expect("append should not fail");
        assert_eq!(collect_keys(&mut cursor), vec![2]);

        log.close();
    });
}

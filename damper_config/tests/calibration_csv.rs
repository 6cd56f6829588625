use std::fs::File;
use std::io::Write;

use damper_config::{CalAnchors, CalRow, load_calibration_csv};
use rstest::rstest;
use tempfile::tempdir;

#[rstest]
fn rows_group_by_channel_in_order() {
    let rows = vec![
        CalRow {
            channel: 0,
            raw: 0,
            value: 0.0,
        },
        CalRow {
            channel: 0,
            raw: 65535,
            value: 50.0,
        },
        CalRow {
            channel: 6,
            raw: 0,
            value: 800.0,
        },
        CalRow {
            channel: 6,
            raw: 65535,
            value: 1200.0,
        },
    ];
    let anchors = CalAnchors::from_rows(rows).unwrap();
    assert_eq!(anchors.channels[0], vec![(0.0, 0.0), (65535.0, 50.0)]);
    assert_eq!(anchors.channels[6].len(), 2);
    // Channels without rows stay empty (the spare).
    assert!(anchors.channels[7].is_empty());
}

#[rstest]
fn non_increasing_raw_is_rejected() {
    let rows = vec![
        CalRow {
            channel: 1,
            raw: 100,
            value: 1.0,
        },
        CalRow {
            channel: 1,
            raw: 100,
            value: 2.0,
        },
    ];
    let err = CalAnchors::from_rows(rows).unwrap_err();
    assert!(err.to_string().contains("strictly increasing"));
}

#[rstest]
fn single_anchor_channel_is_rejected() {
    let rows = vec![CalRow {
        channel: 2,
        raw: 5,
        value: 1.0,
    }];
    let err = CalAnchors::from_rows(rows).unwrap_err();
    assert!(err.to_string().contains("single anchor"));
}

#[rstest]
fn out_of_range_channel_is_rejected() {
    let rows = vec![CalRow {
        channel: 8,
        raw: 5,
        value: 1.0,
    }];
    assert!(CalAnchors::from_rows(rows).is_err());
}

#[rstest]
fn csv_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cal.csv");
    let mut f = File::create(&path).unwrap();
    writeln!(f, "channel,raw,value").unwrap();
    writeln!(f, "0,0,0.0").unwrap();
    writeln!(f, "0,1000,10.0").unwrap();
    writeln!(f, "0,2000,40.0").unwrap();
    drop(f);

    let anchors = load_calibration_csv(&path).unwrap();
    assert_eq!(
        anchors.channels[0],
        vec![(0.0, 0.0), (1000.0, 10.0), (2000.0, 40.0)]
    );
}

#[rstest]
fn malformed_csv_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cal.csv");
    let mut f = File::create(&path).unwrap();
    writeln!(f, "channel,raw,value").unwrap();
    writeln!(f, "zero,not,numeric").unwrap();
    drop(f);
    assert!(load_calibration_csv(&path).is_err());
}

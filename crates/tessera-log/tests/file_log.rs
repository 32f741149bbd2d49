use std::fs::OpenOptions;
use std::io::Write;

use serde::{Deserialize, Serialize};
use tessera_log::{FileLog, LogError, StateLog};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Entry {
    Start { id: u64, ns: String },
    Decision { id: u64, commit: bool },
    Done { id: u64 },
}

#[test]
fn entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordinator.log");
    {
        let log = FileLog::open(&path).unwrap();
        log.append(&Entry::Start {
            id: 1,
            ns: "shop.orders".into(),
        })
        .unwrap();
        log.append(&Entry::Decision { id: 1, commit: true }).unwrap();
    }
    let log = FileLog::open(&path).unwrap();
    assert_eq!(StateLog::<Entry>::len(&log), 2);
    let entries: Vec<Entry> = log.replay().unwrap();
    assert_eq!(
        entries,
        vec![
            Entry::Start {
                id: 1,
                ns: "shop.orders".into()
            },
            Entry::Decision { id: 1, commit: true },
        ]
    );
}

#[test]
fn torn_tail_is_dropped_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.log");
    {
        let log = FileLog::open(&path).unwrap();
        log.append(&Entry::Done { id: 7 }).unwrap();
    }
    // A crash halfway through the next frame.
    let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
    raw.write_all(&[0, 0, 0, 40, 1, 2]).unwrap();
    drop(raw);

    let log = FileLog::open(&path).unwrap();
    let entries: Vec<Entry> = log.replay().unwrap();
    assert_eq!(entries, vec![Entry::Done { id: 7 }]);

    // Appends after repair land on a clean boundary.
    log.append(&Entry::Done { id: 8 }).unwrap();
    let entries: Vec<Entry> = log.replay().unwrap();
    assert_eq!(entries.len(), 2);
}

#[test]
fn corruption_mid_log_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.log");
    {
        let log = FileLog::open(&path).unwrap();
        log.append(&Entry::Done { id: 1 }).unwrap();
        log.append(&Entry::Done { id: 2 }).unwrap();
    }
    let mut image = std::fs::read(&path).unwrap();
    image[9] ^= 0xFF;
    std::fs::write(&path, image).unwrap();

    assert!(matches!(
        FileLog::open(&path),
        Err(LogError::Corrupt { offset: 0 })
    ));
}

#[test]
fn rewrite_compacts_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compact.log");
    let log = FileLog::open(&path).unwrap();
    for id in 0..5 {
        log.append(&Entry::Done { id }).unwrap();
    }
    StateLog::<Entry>::rewrite(&log, &[Entry::Done { id: 4 }]).unwrap();
    log.append(&Entry::Done { id: 5 }).unwrap();
    drop(log);

    let log = FileLog::open(&path).unwrap();
    let entries: Vec<Entry> = log.replay().unwrap();
    assert_eq!(entries, vec![Entry::Done { id: 4 }, Entry::Done { id: 5 }]);
}

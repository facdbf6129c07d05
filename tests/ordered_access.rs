//! Ordered access through the keyed API: range starts, bidirectional
//! iteration, duplicate keys, exact deletion and in-place update.
//!
//! Records are 16 bytes: a native-endian u32 number, an 8-byte tag, and a
//! 4-byte value that no key looks at. Key 0 orders by number, key 1 by
//! tag.

use std::cmp::Ordering;

use avlfile::AvlFile;

const DATA_LEN: u32 = 16;
const KEYS: u32 = 2;

fn cmp(key: usize, a: &[u8], b: &[u8]) -> Ordering {
    match key {
        0 => num_of(a).cmp(&num_of(b)),
        _ => a[4..12].cmp(&b[4..12]),
    }
}

fn rec(num: u32, tag: &str, val: u32) -> Vec<u8> {
    assert!(tag.len() <= 8);
    let mut buf = vec![0u8; DATA_LEN as usize];
    buf[..4].copy_from_slice(&num.to_ne_bytes());
    buf[4..4 + tag.len()].copy_from_slice(tag.as_bytes());
    buf[12..].copy_from_slice(&val.to_ne_bytes());
    buf
}

fn num_of(buf: &[u8]) -> u32 {
    u32::from_ne_bytes(buf[..4].try_into().unwrap())
}

fn tag_of(buf: &[u8]) -> String {
    String::from_utf8_lossy(&buf[4..12])
        .trim_end_matches('\0')
        .to_string()
}

fn val_of(buf: &[u8]) -> u32 {
    u32::from_ne_bytes(buf[12..].try_into().unwrap())
}

fn open_store(dir: &tempfile::TempDir) -> AvlFile {
    AvlFile::open(dir.path().join("t.avl"), DATA_LEN, KEYS, cmp).unwrap()
}

/// Collects every record from a startge at `probe` onward, by key.
fn collect_from(db: &AvlFile, probe: &[u8], key: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = probe.to_vec();
    let mut found = db.startge(&mut buf, key).unwrap();
    while found {
        out.push(buf.clone());
        found = db.next(&mut buf, key).unwrap();
    }
    out
}

#[test]
fn three_records_iterate_in_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    db.insert(&rec(1, "a", 10)).unwrap();
    db.insert(&rec(3, "c", 30)).unwrap();
    db.insert(&rec(2, "b", 20)).unwrap();

    let got = collect_from(&db, &rec(1, "", 0), 0);
    assert_eq!(got.len(), 3);
    assert_eq!(
        got.iter().map(|r| num_of(r)).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        got.iter().map(|r| tag_of(r)).collect::<Vec<_>>(),
        vec!["a", "b", "c"]
    );
}

#[test]
fn second_key_orders_independently() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    db.insert(&rec(1, "zebra", 0)).unwrap();
    db.insert(&rec(2, "ant", 0)).unwrap();
    db.insert(&rec(3, "moth", 0)).unwrap();

    let got = collect_from(&db, &rec(0, "", 0), 1);
    assert_eq!(
        got.iter().map(|r| tag_of(r)).collect::<Vec<_>>(),
        vec!["ant", "moth", "zebra"]
    );
    assert_eq!(
        got.iter().map(|r| num_of(r)).collect::<Vec<_>>(),
        vec![2, 3, 1]
    );
}

#[test]
fn duplicate_keys_delete_exact_record() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    db.insert(&rec(1, "a", 0)).unwrap();
    db.insert(&rec(1, "b", 0)).unwrap();
    db.insert(&rec(1, "c", 0)).unwrap();

    assert!(db.delete(&rec(1, "b", 0)).unwrap());

    let mut tags: Vec<String> = collect_from(&db, &rec(1, "", 0), 0)
        .iter()
        .map(|r| tag_of(r))
        .collect();
    tags.sort();
    assert_eq!(tags, vec!["a", "c"]);

    // The exact payload is gone; deleting it again finds nothing.
    assert!(!db.delete(&rec(1, "b", 0)).unwrap());
}

#[test]
fn delete_demands_exact_payload() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    db.insert(&rec(5, "x", 77)).unwrap();

    // Same keys, different value byte: not the same record.
    assert!(!db.delete(&rec(5, "x", 78)).unwrap());
    assert!(db.delete(&rec(5, "x", 77)).unwrap());
    assert_eq!(db.live_count().unwrap(), 0);
}

#[test]
fn update_replaces_exactly_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    // Identical under key 0, distinguished by key 1.
    db.insert(&rec(1, "x", 10)).unwrap();
    db.insert(&rec(1, "y", 20)).unwrap();

    assert!(db.update(&rec(1, "x", 99)).unwrap());

    let mut buf = rec(0, "x", 0);
    assert!(db.startge(&mut buf, 1).unwrap());
    assert_eq!(tag_of(&buf), "x");
    assert_eq!(val_of(&buf), 99);

    let mut buf = rec(0, "y", 0);
    assert!(db.startge(&mut buf, 1).unwrap());
    assert_eq!(val_of(&buf), 20);
}

#[test]
fn update_misses_when_any_key_differs() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    db.insert(&rec(1, "x", 10)).unwrap();

    assert!(!db.update(&rec(1, "z", 5)).unwrap());
    assert!(!db.update(&rec(2, "x", 5)).unwrap());
    assert!(db.update(&rec(1, "x", 5)).unwrap());
}

#[test]
fn startlt_and_prev_walk_backwards() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    for n in 1..=5 {
        db.insert(&rec(n, "t", 0)).unwrap();
    }

    let mut buf = rec(4, "", 0);
    assert!(db.startlt(&mut buf, 0).unwrap());
    assert_eq!(num_of(&buf), 3);

    assert!(db.prev(&mut buf, 0).unwrap());
    assert_eq!(num_of(&buf), 2);
    assert!(db.prev(&mut buf, 0).unwrap());
    assert_eq!(num_of(&buf), 1);
    assert!(!db.prev(&mut buf, 0).unwrap());
}

#[test]
fn next_and_prev_advance_independently() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    for n in 1..=3 {
        db.insert(&rec(n, "t", 0)).unwrap();
    }

    let mut buf = rec(2, "", 0);
    assert!(db.startge(&mut buf, 0).unwrap());
    assert_eq!(num_of(&buf), 2);

    let mut fwd = buf.clone();
    assert!(db.next(&mut fwd, 0).unwrap());
    assert_eq!(num_of(&fwd), 3);

    let mut back = buf.clone();
    assert!(db.prev(&mut back, 0).unwrap());
    assert_eq!(num_of(&back), 1);
}

#[test]
fn startge_on_empty_tree_exhausts_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    let mut buf = rec(1, "", 0);
    assert!(!db.startge(&mut buf, 0).unwrap());
    assert!(!db.next(&mut buf, 0).unwrap());
    assert!(!db.prev(&mut buf, 0).unwrap());
}

#[test]
fn find_matches_key_not_payload() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    db.insert(&rec(2, "b", 20)).unwrap();

    let mut buf = rec(2, "", 0);
    assert!(db.find(&mut buf, 0).unwrap());
    assert_eq!(tag_of(&buf), "b");
    assert_eq!(val_of(&buf), 20);

    let mut buf = rec(42, "", 0);
    assert!(!db.find(&mut buf, 0).unwrap());
}

#[test]
fn key_index_out_of_bounds_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);
    let mut buf = rec(1, "", 0);

    assert!(db.startge(&mut buf, 2).is_err());
    assert!(avlfile::last_error().unwrap().starts_with("80"));

    assert!(db.next(&mut buf, 9).is_err());
    assert!(avlfile::last_error().unwrap().starts_with("90"));
}

#[test]
fn readseq_yields_reverse_insertion_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    for n in 1..=4 {
        db.insert(&rec(n, "s", 0)).unwrap();
    }

    db.startseq().unwrap();
    let mut buf = rec(0, "", 0);
    let mut seen = Vec::new();
    while db.readseq(&mut buf).unwrap() {
        seen.push(num_of(&buf));
    }
    assert_eq!(seen, vec![4, 3, 2, 1]);

    // A fresh startseq rewinds.
    db.startseq().unwrap();
    assert!(db.readseq(&mut buf).unwrap());
    assert_eq!(num_of(&buf), 4);
}

#[test]
fn wrong_buffer_length_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);

    assert!(db.insert(&[0u8; 8]).is_err());
}

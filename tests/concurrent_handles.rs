//! Two handles on one file: each opener gets its own cursor slot inside
//! the file, so iterations survive the other handle's mutations: a
//! deleted record is skipped, never repeated and never aborts the walk.
//!
//! Both handles live in one process here; the code path is the same one
//! that coordinates separate processes, minus lock contention.

use std::cmp::Ordering;
use std::collections::HashSet;

use avlfile::AvlFile;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const DATA_LEN: u32 = 12;
const KEYS: u32 = 1;

fn cmp(_key: usize, a: &[u8], b: &[u8]) -> Ordering {
    num_of(a).cmp(&num_of(b))
}

fn rec(num: u32) -> Vec<u8> {
    let mut buf = vec![0u8; DATA_LEN as usize];
    buf[..4].copy_from_slice(&num.to_ne_bytes());
    buf[4..8].copy_from_slice(b"pay!");
    buf
}

fn num_of(buf: &[u8]) -> u32 {
    u32::from_ne_bytes(buf[..4].try_into().unwrap())
}

fn shuffled(n: u32, seed: u64) -> Vec<u32> {
    let mut order: Vec<u32> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    order
}

#[test]
fn peer_handle_sees_committed_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.avl");
    let h1 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();
    let h2 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();

    h1.insert(&rec(7)).unwrap();

    let mut buf = rec(7);
    assert!(h2.find(&mut buf, 0).unwrap());
    assert_eq!(h2.live_count().unwrap(), 1);
}

#[test]
fn sequential_read_skips_concurrently_deleted_record() {
    const N: u32 = 1000;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.avl");
    let h1 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();
    let h2 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();

    let order = shuffled(N, 7);
    for &n in &order {
        h1.insert(&rec(n)).unwrap();
    }

    // h2 walks the sequential list: reverse insertion order.
    h2.startseq().unwrap();
    let mut buf = rec(0);
    let mut seen = Vec::new();
    for _ in 0..100 {
        assert!(h2.readseq(&mut buf).unwrap());
        seen.push(num_of(&buf));
    }
    assert_eq!(seen[0], order[N as usize - 1]);
    assert_eq!(seen[99], order[N as usize - 100]);

    // h1 deletes the record h2 would read next; h2 must skip it.
    let victim = order[N as usize - 101];
    assert!(h1.delete(&rec(victim)).unwrap());

    while h2.readseq(&mut buf).unwrap() {
        seen.push(num_of(&buf));
    }

    assert_eq!(seen.len(), N as usize - 1);
    let unique: HashSet<u32> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "no record visited twice");
    assert!(!unique.contains(&victim));
}

#[test]
fn keyed_cursor_skips_concurrently_deleted_neighbors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.avl");
    let h1 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();
    let h2 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();

    for n in 1..=10 {
        h1.insert(&rec(n)).unwrap();
    }

    let mut buf = rec(5);
    assert!(h2.startge(&mut buf, 0).unwrap());
    assert_eq!(num_of(&buf), 5);

    // h2's cursor now rests on 4 (prev side) and 6 (next side); delete
    // both through the other handle.
    assert!(h1.delete(&rec(6)).unwrap());
    assert!(h1.delete(&rec(4)).unwrap());

    let mut fwd = buf.clone();
    assert!(h2.next(&mut fwd, 0).unwrap());
    assert_eq!(num_of(&fwd), 7);

    let mut back = buf.clone();
    assert!(h2.prev(&mut back, 0).unwrap());
    assert_eq!(num_of(&back), 3);
}

#[test]
fn deleting_the_seeded_record_does_not_disturb_the_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.avl");
    let h1 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();
    let h2 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();

    for n in 1..=5 {
        h1.insert(&rec(n)).unwrap();
    }

    let mut buf = rec(3);
    assert!(h2.startge(&mut buf, 0).unwrap());

    // The record h2 just read disappears; its neighbors are still the
    // cursor's neighbors.
    assert!(h1.delete(&rec(3)).unwrap());

    let mut fwd = buf.clone();
    assert!(h2.next(&mut fwd, 0).unwrap());
    assert_eq!(num_of(&fwd), 4);

    let mut back = buf.clone();
    assert!(h2.prev(&mut back, 0).unwrap());
    assert_eq!(num_of(&back), 2);
}

#[test]
fn getnum_is_unique_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.avl");
    let h1 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();
    let h2 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();

    let mut nums = Vec::new();
    for _ in 0..10 {
        nums.push(h1.getnum().unwrap());
        nums.push(h2.getnum().unwrap());
    }
    for pair in nums.windows(2) {
        assert!(pair[1] > pair[0], "{} then {}", pair[0], pair[1]);
    }
}

#[test]
fn each_handle_gets_its_own_cursor_slot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.avl");
    let h1 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();
    let h2 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();

    // Two cursor slots and nothing else.
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        h1.header_len() + 2 * h1.record_len() as u64
    );

    // Independent sequential positions.
    for n in 1..=3 {
        h1.insert(&rec(n)).unwrap();
    }
    h1.startseq().unwrap();
    h2.startseq().unwrap();
    let mut buf = rec(0);
    assert!(h1.readseq(&mut buf).unwrap());
    assert!(h1.readseq(&mut buf).unwrap());
    assert_eq!(num_of(&buf), 2);

    assert!(h2.readseq(&mut buf).unwrap());
    assert_eq!(num_of(&buf), 3);
}

#[test]
fn closed_handles_cursor_slot_is_recycled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.avl");
    let h1 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();

    let h2 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();
    let len_two = std::fs::metadata(&path).unwrap().len();
    h2.close().unwrap();

    // The freed slot is reused by the next opener.
    let h3 = AvlFile::open(&path, DATA_LEN, KEYS, cmp).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), len_two);

    drop(h3);
    drop(h1);
}

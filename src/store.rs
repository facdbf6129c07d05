//! # Public Handle
//!
//! [`AvlFile`] is one opener of one store file. Every operation follows the
//! same shape: take the handle's mutex (threads sharing the handle), take
//! the gate (peer processes), re-read whatever header state the operation
//! needs, mutate slots, write back, release. Nothing is cached across
//! operations; the file is the only shared state, and the gate makes each
//! operation atomic with respect to every other opener.
//!
//! Return conventions: `Ok(true)`/`Ok(false)` for found/exhausted, `Err`
//! with a numbered diagnostic for invalid arguments and resource limits,
//! process abort for detected corruption. The buffer handed to keyed
//! operations must be exactly `data_len` bytes and is overwritten with the
//! matched record.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::arena::Arena;
use crate::cmp::KeyComparator;
use crate::cursor;
use crate::emsg;
use crate::layout::Layout;
use crate::slot::{HeaderBuf, SlotBuf};
use crate::squash;
use crate::tree::{self, TreeCtx};

/// Result of a consistency scan over one key's tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Height of the tree (0 when empty).
    pub height: u32,
    /// Number of records counted, equal to the header's live count.
    pub count: i64,
}

struct Inner {
    arena: Arena,
    /// Offset of this handle's cursor slot. Compaction can move it.
    cpr: u64,
    closed: bool,
}

/// One opener of a store file. Cloning is deliberately not offered: each
/// concurrent reader or writer opens its own handle (and thereby its own
/// cursor slot), exactly like a separate process would.
pub struct AvlFile {
    path: PathBuf,
    layout: Layout,
    cmp: Box<dyn KeyComparator>,
    inner: Mutex<Inner>,
}

impl AvlFile {
    /// Opens (creating if absent) a store of `data_len`-byte records under
    /// `key_count` orderings. An existing file must have been created with
    /// the same geometry; `cmp` must be the comparator the file has always
    /// been used with, which cannot be verified.
    pub fn open<P, C>(path: P, data_len: u32, key_count: u32, cmp: C) -> Result<Self>
    where
        P: AsRef<Path>,
        C: KeyComparator + 'static,
    {
        emsg::clear();
        let layout = Layout::new(key_count, data_len)?;
        let path = path.as_ref().to_path_buf();
        let mut arena = Arena::open(&path).inspect_err(|_| emsg::set("20 open failed"))?;

        arena.gate_lock();
        let res = (|| {
            let mut hdr = if arena.end() == 0 {
                let hdr = HeaderBuf::new(layout);
                arena.write_header(&hdr);
                hdr
            } else {
                if arena.end() < layout.header_len() {
                    return Err(fail("21 short or foreign header"));
                }
                let hdr = arena.read_header(layout);
                if !hdr.magic_ok() {
                    return Err(fail("26 bad magic"));
                }
                if hdr.record_len() != layout.record_len() as u32 {
                    return Err(fail("22 stored record length mismatch"));
                }
                if hdr.key_count() != key_count {
                    return Err(fail("23 stored key count mismatch"));
                }
                hdr
            };

            let cp = cursor::acquire_slot(&mut arena, layout, &mut hdr, std::process::id());
            arena.write_header(&hdr);
            Ok(cp)
        })();
        arena.gate_unlock();
        let cpr = res?;

        debug!(target: "avlfile", path = %path.display(), cursor = cpr, "opened");
        Ok(Self {
            path,
            layout,
            cmp: Box::new(cmp),
            inner: Mutex::new(Inner {
                arena,
                cpr,
                closed: false,
            }),
        })
    }

    /// Releases the handle's cursor slot and closes the file. Dropping the
    /// handle does the same; `close` exists for callers that want the
    /// release ordered before something else.
    pub fn close(self) -> Result<()> {
        self.close_inner();
        Ok(())
    }

    fn close_inner(&self) {
        let mut guard = self.inner.lock();
        if guard.closed {
            return;
        }
        guard.closed = true;
        let inner = &mut *guard;

        inner.arena.gate_lock();
        let mut hdr = inner.arena.read_header(self.layout);
        cursor::release_slot(&mut inner.arena, self.layout, &mut hdr, inner.cpr);
        inner.arena.write_header(&hdr);
        inner.arena.gate_unlock();
        debug!(target: "avlfile", path = %self.path.display(), "closed");
    }

    /// A unique, strictly increasing 64-bit number. Survives close and
    /// reopen; independent of record placement, so hosts can use it to
    /// synthesise primary keys.
    pub fn getnum(&self) -> Result<i64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let mut hdr = inner.arena.read_header(self.layout);
        let n = hdr.next_number() + 1;
        hdr.set_next_number(n);
        inner.arena.write_header(&hdr);
        inner.arena.gate_unlock();
        Ok(n)
    }

    /// Inserts a new record. Duplicates (under any or all keys) are
    /// allowed.
    pub fn insert(&self, data: &[u8]) -> Result<()> {
        self.check_buf(data)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let res = (|| {
            let mut hdr = inner.arena.read_header(self.layout);
            if hdr.live_count() == i64::MAX {
                return Err(fail("30 record count limit reached"));
            }

            // A slot from the free list, or a fresh one at the end.
            let (y, mut yr) = match hdr.head_empty() {
                0 => (inner.arena.end(), SlotBuf::new_zeroed(self.layout)),
                head => {
                    let slot = inner.arena.read_slot(self.layout, head);
                    hdr.set_head_empty(slot.next());
                    (head, slot)
                }
            };

            // Prepend to the sequential list and land the payload.
            yr.set_prev(0);
            yr.set_next(hdr.head_seq());
            if yr.next() != 0 {
                let p = yr.next();
                let mut pr = inner.arena.read_slot(self.layout, p);
                pr.set_prev(y);
                inner.arena.write_slot(p, &pr);
            }
            hdr.set_head_seq(y);
            yr.set_payload(data);
            inner.arena.write_slot(y, &yr);

            for k in 0..self.layout.key_count() {
                let mut ctx = TreeCtx {
                    arena: &mut inner.arena,
                    hdr: &mut hdr,
                    cmp: self.cmp.as_ref(),
                    layout: self.layout,
                };
                tree::insert_into_tree(&mut ctx, k, y);
            }

            hdr.set_live_count(hdr.live_count() + 1);
            inner.arena.write_header(&hdr);
            Ok(())
        })();
        inner.arena.gate_unlock();
        res
    }

    /// Deletes the record whose payload equals `data` byte for byte (read
    /// it first). Among several identical records the choice is arbitrary.
    /// `Ok(false)` when no record matches.
    pub fn delete(&self, data: &[u8]) -> Result<bool> {
        self.check_buf(data)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let res = (|| {
            let mut hdr = inner.arena.read_header(self.layout);

            let found = {
                let mut ctx = TreeCtx {
                    arena: &mut inner.arena,
                    hdr: &mut hdr,
                    cmp: self.cmp.as_ref(),
                    layout: self.layout,
                };
                tree::delete::find_exact(&mut ctx, data)
            };
            let Some((y, mut yr)) = found else {
                return Ok(false);
            };

            // In-order neighbors under every key, before anything moves.
            let mut neighbors: SmallVec<[(u64, u64); 4]> = SmallVec::new();
            for k in 0..self.layout.key_count() {
                neighbors.push((
                    tree::predecessor(&inner.arena, self.layout, k, &yr),
                    tree::successor(&inner.arena, self.layout, k, &yr),
                ));
            }

            // Peer cursors about to yield y are advanced past it.
            cursor::repoint_deleted(
                &mut inner.arena,
                self.layout,
                &mut hdr,
                y,
                yr.next(),
                &neighbors,
            );

            let target = yr.payload().to_vec();
            for k in 0..self.layout.key_count() {
                let mut ctx = TreeCtx {
                    arena: &mut inner.arena,
                    hdr: &mut hdr,
                    cmp: self.cmp.as_ref(),
                    layout: self.layout,
                };
                tree::delete::unlink(&mut ctx, k, y, &mut yr, &target, neighbors[k].1);
            }

            // Off the sequential list.
            if yr.next() != 0 {
                let a = yr.next();
                let mut ar = inner.arena.read_slot(self.layout, a);
                ar.set_prev(yr.prev());
                inner.arena.write_slot(a, &ar);
            }
            if hdr.head_seq() == y {
                hdr.set_head_seq(yr.next());
            } else {
                let a = yr.prev();
                let mut ar = inner.arena.read_slot(self.layout, a);
                ar.set_next(yr.next());
                inner.arena.write_slot(a, &ar);
            }

            // Onto the free list.
            yr.mark_free();
            yr.set_next(hdr.head_empty());
            yr.set_prev(0);
            hdr.set_head_empty(y);
            inner.arena.write_slot(y, &yr);

            hdr.set_live_count(hdr.live_count() - 1);
            inner.arena.write_header(&hdr);
            Ok(true)
        })();
        inner.arena.gate_unlock();
        res
    }

    /// Overwrites the payload of a record that compares equal to `data`
    /// under **every** key; tree positions are untouched, so keys cannot
    /// change here; delete and re-insert to move a record. `Ok(false)`
    /// when no record matches on all keys.
    pub fn update(&self, data: &[u8]) -> Result<bool> {
        self.check_buf(data)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let res = (|| {
            if self.layout.key_count() == 0 {
                return Ok(false);
            }
            let mut hdr = inner.arena.read_header(self.layout);
            let mut ctx = TreeCtx {
                arena: &mut inner.arena,
                hdr: &mut hdr,
                cmp: self.cmp.as_ref(),
                layout: self.layout,
            };

            let mut a = tree::lower_bound(&mut ctx, 0, data);
            while a != 0 {
                let mut ar = ctx.arena.read_slot(self.layout, a);
                if !ctx.cmp.compare(0, data, ar.payload()).is_eq() {
                    break;
                }
                let all_equal = (0..self.layout.key_count())
                    .all(|k| ctx.cmp.compare(k, data, ar.payload()).is_eq());
                if all_equal {
                    ar.set_payload(data);
                    ctx.arena.write_slot(a, &ar);
                    return Ok(true);
                }
                a = tree::successor(ctx.arena, self.layout, 0, &ar);
            }
            Ok(false)
        })();
        inner.arena.gate_unlock();
        res
    }

    /// Fills `data` with the first record comparing equal to it under key
    /// `k`, seeding the iteration cursor like [`Self::startge`].
    pub fn find(&self, data: &mut [u8], k: usize) -> Result<bool> {
        self.check_key(k, "80 the key index is out of bounds")?;
        self.check_buf(data)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let mut probe = data.to_vec();
        let found = self.position_cursor(inner, &mut probe, k, true)
            && self.cmp.compare(k, &probe, data).is_eq();
        if found {
            data.copy_from_slice(&probe);
        }
        inner.arena.gate_unlock();
        Ok(found)
    }

    /// Fills `data` with the smallest record >= it under key `k` and seeds
    /// the cursor so that `next`/`prev` continue from there.
    pub fn startge(&self, data: &mut [u8], k: usize) -> Result<bool> {
        self.check_key(k, "80 the key index is out of bounds")?;
        self.check_buf(data)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let found = self.position_cursor(inner, data, k, true);
        inner.arena.gate_unlock();
        Ok(found)
    }

    /// Fills `data` with the largest record < it under key `k`. Mirror of
    /// [`Self::startge`].
    pub fn startlt(&self, data: &mut [u8], k: usize) -> Result<bool> {
        self.check_key(k, "70 the key index is out of bounds")?;
        self.check_buf(data)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let found = self.position_cursor(inner, data, k, false);
        inner.arena.gate_unlock();
        Ok(found)
    }

    /// Yields the record at the cursor's right side for key `k` and steps
    /// it to that record's in-order successor. The left side is untouched:
    /// `next` and `prev` iterate independently from the seeded position.
    pub fn next(&self, data: &mut [u8], k: usize) -> Result<bool> {
        self.check_key(k, "90 the key index is out of bounds")?;
        self.check_buf(data)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let cp = inner.cpr;
        let mut cpr = inner.arena.read_slot(self.layout, cp);
        let a = cpr.cur_right(k);
        let found = a != 0;
        if found {
            let ar = inner.arena.read_slot(self.layout, a);
            data.copy_from_slice(ar.payload());
            cpr.set_cur_right(k, tree::successor(&inner.arena, self.layout, k, &ar));
            inner.arena.write_slot(cp, &cpr);
        }
        inner.arena.gate_unlock();
        Ok(found)
    }

    /// Yields the record at the cursor's left side for key `k` and steps
    /// it to that record's in-order predecessor. Mirror of [`Self::next`].
    pub fn prev(&self, data: &mut [u8], k: usize) -> Result<bool> {
        self.check_key(k, "100 the key index is out of bounds")?;
        self.check_buf(data)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let cp = inner.cpr;
        let mut cpr = inner.arena.read_slot(self.layout, cp);
        let a = cpr.cur_left(k);
        let found = a != 0;
        if found {
            let ar = inner.arena.read_slot(self.layout, a);
            data.copy_from_slice(ar.payload());
            cpr.set_cur_left(k, tree::predecessor(&inner.arena, self.layout, k, &ar));
            inner.arena.write_slot(cp, &cpr);
        }
        inner.arena.gate_unlock();
        Ok(found)
    }

    /// Rewinds the sequential cursor to the most recently inserted record.
    pub fn startseq(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let hdr = inner.arena.read_header(self.layout);
        let cp = inner.cpr;
        let mut cpr = inner.arena.read_slot(self.layout, cp);
        cpr.set_prev(hdr.head_seq());
        inner.arena.write_slot(cp, &cpr);
        inner.arena.gate_unlock();
        Ok(())
    }

    /// Yields the next record in unordered (reverse insertion) sequence,
    /// or `Ok(false)` when the sequence is exhausted.
    pub fn readseq(&self, data: &mut [u8]) -> Result<bool> {
        self.check_buf(data)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let cp = inner.cpr;
        let mut cpr = inner.arena.read_slot(self.layout, cp);
        let a = cpr.prev();
        let found = a != 0;
        if found {
            let ar = inner.arena.read_slot(self.layout, a);
            data.copy_from_slice(ar.payload());
            cpr.set_prev(ar.next());
            inner.arena.write_slot(cp, &cpr);
        }
        inner.arena.gate_unlock();
        Ok(found)
    }

    /// Walks the whole key-`k` tree, verifying every stored balance and
    /// the record count against the header. Returns the height and count;
    /// divergence is corruption and does not return.
    pub fn scan(&self, k: usize) -> Result<ScanReport> {
        self.check_key(k, "110 the key index is out of bounds")?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let hdr = inner.arena.read_header(self.layout);
        let mut count = 0i64;
        let height = match hdr.root(k) {
            0 => 0,
            root => tree::scan_subtree(&inner.arena, self.layout, k, root, &mut count),
        };
        inner.arena.gate_unlock();
        if count != hdr.live_count() {
            emsg::fatal("50 scan count mismatch");
        }
        Ok(ScanReport { height, count })
    }

    /// Takes the user-visible advisory lock (byte 1), blocking until it is
    /// free. Independent of the per-operation gate; use it to make a
    /// sequence of calls atomic against other openers doing the same.
    pub fn lock(&self) -> Result<()> {
        let guard = self.inner.lock();
        guard.arena.user_lock();
        Ok(())
    }

    /// Releases the user-visible advisory lock.
    pub fn unlock(&self) -> Result<()> {
        let guard = self.inner.lock();
        guard.arena.user_unlock();
        Ok(())
    }

    /// Compacts the file: abandoned cursors are reaped, live records and
    /// this handle's cursor migrate into the lowest free slots, and the
    /// file is truncated to the minimum length the surviving slots (and
    /// any peer cursor pinning the tail) allow.
    pub fn squash(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let mut hdr = inner.arena.read_header(self.layout);
        squash::run(
            &mut inner.arena,
            self.layout,
            &mut hdr,
            self.cmp.as_ref(),
            &mut inner.cpr,
        );
        inner.arena.gate_unlock();
        Ok(())
    }

    /// Renders the header and every slot's nodes and links, for debugging.
    pub fn dump(&self) -> Result<String> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let hdr = inner.arena.read_header(self.layout);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "hdr: keys {}, data_len {}, record_len {}, live {}, head_seq {}, head_empty {}, head_cpr {}",
            hdr.key_count(),
            hdr.data_len(),
            hdr.record_len(),
            hdr.live_count(),
            hdr.head_seq(),
            hdr.head_empty(),
            hdr.head_cpr(),
        );
        let roots: Vec<String> = (0..self.layout.key_count())
            .map(|k| format!("{k}: {}", hdr.root(k)))
            .collect();
        let _ = writeln!(out, "hdr: roots [{}]", roots.join(" | "));

        let reclen = self.layout.record_len() as u64;
        let mut off = self.layout.header_len();
        while off + reclen <= inner.arena.end() {
            let slot = inner.arena.read_slot(self.layout, off);
            let _ = write!(out, "  pos {off:>8}:");
            for k in 0..self.layout.key_count() {
                let _ = write!(
                    out,
                    " {k}:{:>3} {:>8} {:>8} |",
                    slot.bal(k),
                    slot.left(k).encode(),
                    slot.right(k).encode(),
                );
            }
            let _ = writeln!(out, " prev {:>8}, next {:>8}", slot.prev(), slot.next());
            off += reclen;
        }

        inner.arena.gate_unlock();
        Ok(out)
    }

    /// Number of live records, read under the gate.
    pub fn live_count(&self) -> Result<i64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.arena.gate_lock();
        let hdr = inner.arena.read_header(self.layout);
        inner.arena.gate_unlock();
        Ok(hdr.live_count())
    }

    pub fn key_count(&self) -> usize {
        self.layout.key_count()
    }

    pub fn data_len(&self) -> usize {
        self.layout.data_len()
    }

    pub fn record_len(&self) -> usize {
        self.layout.record_len()
    }

    pub fn header_len(&self) -> u64 {
        self.layout.header_len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descends for the smallest record >= the probe (`ge`) or the largest
    /// record < it, fills the probe buffer and seeds the cursor's (left,
    /// right) with the in-order neighbors of the found record. Runs under
    /// the gate.
    fn position_cursor(&self, inner: &mut Inner, data: &mut [u8], k: usize, ge: bool) -> bool {
        let mut hdr = inner.arena.read_header(self.layout);
        let a = {
            let mut ctx = TreeCtx {
                arena: &mut inner.arena,
                hdr: &mut hdr,
                cmp: self.cmp.as_ref(),
                layout: self.layout,
            };
            if ge {
                tree::lower_bound(&mut ctx, k, data)
            } else {
                tree::last_below(&mut ctx, k, data)
            }
        };

        let cp = inner.cpr;
        let mut cpr = inner.arena.read_slot(self.layout, cp);
        let found = a != 0;
        if found {
            let ar = inner.arena.read_slot(self.layout, a);
            data.copy_from_slice(ar.payload());
            cpr.set_cur_left(k, tree::predecessor(&inner.arena, self.layout, k, &ar));
            cpr.set_cur_right(k, tree::successor(&inner.arena, self.layout, k, &ar));
        } else {
            cpr.set_cur_left(k, 0);
            cpr.set_cur_right(k, 0);
        }
        inner.arena.write_slot(cp, &cpr);
        found
    }

    fn check_key(&self, k: usize, msg: &'static str) -> Result<()> {
        if k >= self.layout.key_count() {
            return Err(fail(msg));
        }
        Ok(())
    }

    fn check_buf(&self, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == self.layout.data_len(),
            "record buffer is {} bytes, data length is {}",
            data.len(),
            self.layout.data_len()
        );
        Ok(())
    }
}

impl Drop for AvlFile {
    fn drop(&mut self) {
        self.close_inner();
    }
}

fn fail(msg: &'static str) -> eyre::Report {
    emsg::set(msg);
    eyre::eyre!(msg)
}

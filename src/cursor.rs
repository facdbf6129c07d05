//! # Cursor Registry
//!
//! Every open handle owns one cursor slot inside the file, linked on the
//! header's cursor list. The slot persists the handle's iteration state:
//! per-key next-record offsets for `prev`/`next`, and the sequential read
//! position for `readseq`. Keeping the state in the file is what lets
//! peer openers repair it: when a record is deleted or relocated, the
//! mutating opener walks the cursor list and repoints whatever references
//! the moved slot.
//!
//! ## Ownership and abandonment
//!
//! A cursor slot is claimed by byte-range-locking its whole length for the
//! lifetime of the handle and stamping the owner's PID into the payload. A
//! process that dies drops its locks, so a cursor whose stamped PID is
//! foreign *and* whose range can be locked is abandoned and may be stolen
//! by a new opener or reaped by compaction. The PID stamp exists because
//! the lock probe cannot see locks held by the probing process itself:
//! within one process, equality of PID is what protects sibling handles'
//! cursors. Across processes the scheme is racy against PID reuse: an
//! abandoned cursor whose stamped PID happens to be reborn is merely
//! leaked until compaction meets it with that process gone. No fix is
//! attempted.
//!
//! Payloads narrower than a PID cannot be stamped; such files never steal
//! or reap cursors and only ever grow their cursor list.

use tracing::trace;

use crate::arena::Arena;
use crate::layout::Layout;
use crate::slot::{HeaderBuf, SlotBuf};

/// Claims a cursor slot for a new handle: an abandoned cursor if one can
/// be found, else the free-list head, else a fresh slot at the end of the
/// file. The slot is initialized, stamped, written, and range-locked.
/// Returns its offset.
pub(crate) fn acquire_slot(
    arena: &mut Arena,
    layout: Layout,
    hdr: &mut HeaderBuf,
    pid: u32,
) -> u64 {
    let reclen = layout.record_len() as u64;

    let mut claimed: Option<(u64, SlotBuf)> = None;
    let mut cp = hdr.head_cpr();
    while cp != 0 {
        let cpr = arena.read_slot(layout, cp);
        let next = cpr.next();
        if matches!(cpr.pid(), Some(owner) if owner != pid) && arena.range_is_unlocked(cp, reclen)
        {
            // Stolen in place: the slot already sits on the cursor list.
            trace!(target: "avlfile", offset = cp, "stealing abandoned cursor slot");
            claimed = Some((cp, cpr));
            break;
        }
        cp = next;
    }

    let (cp, mut cpr) = claimed.unwrap_or_else(|| {
        let (cp, mut cpr) = match hdr.head_empty() {
            0 => (arena.end(), SlotBuf::new_zeroed(layout)),
            head => {
                let slot = arena.read_slot(layout, head);
                hdr.set_head_empty(slot.next());
                (head, slot)
            }
        };
        cpr.set_next(hdr.head_cpr());
        hdr.set_head_cpr(cp);
        (cp, cpr)
    });

    cpr.init_cursor(pid);
    arena.write_slot(cp, &cpr);
    arena.lock_range(cp, reclen);
    cp
}

/// Releases a handle's cursor slot on close: unlock, unlink from the
/// cursor list, mark free, prepend to the free list.
pub(crate) fn release_slot(arena: &mut Arena, layout: Layout, hdr: &mut HeaderBuf, cp: u64) {
    let reclen = layout.record_len() as u64;
    let mut cpr = arena.read_slot(layout, cp);
    arena.unlock_range(cp, reclen);

    if hdr.head_cpr() == cp {
        hdr.set_head_cpr(cpr.next());
    } else {
        let mut sp = hdr.head_cpr();
        while sp != 0 {
            let mut spr = arena.read_slot(layout, sp);
            if spr.next() == cp {
                spr.set_next(cpr.next());
                arena.write_slot(sp, &spr);
                break;
            }
            sp = spr.next();
        }
    }

    cpr.mark_free();
    cpr.set_next(hdr.head_empty());
    hdr.set_head_empty(cp);
    arena.write_slot(cp, &cpr);
}

/// Moves every abandoned cursor slot (foreign PID, lockable range) onto
/// the free list. Run by compaction before it starts relocating.
pub(crate) fn reap_abandoned(arena: &mut Arena, layout: Layout, hdr: &mut HeaderBuf, pid: u32) {
    let reclen = layout.record_len() as u64;
    let mut prev: u64 = 0;
    let mut cp = hdr.head_cpr();
    while cp != 0 {
        let cpr = arena.read_slot(layout, cp);
        let next = cpr.next();
        let abandoned = matches!(cpr.pid(), Some(owner) if owner != pid)
            && arena.range_is_unlocked(cp, reclen);
        if abandoned {
            trace!(target: "avlfile", offset = cp, "reaping abandoned cursor slot");
            if prev == 0 {
                hdr.set_head_cpr(next);
            } else {
                let mut pr = arena.read_slot(layout, prev);
                pr.set_next(next);
                arena.write_slot(prev, &pr);
            }
            let mut freed = cpr;
            freed.mark_free();
            freed.set_next(hdr.head_empty());
            hdr.set_head_empty(cp);
            arena.write_slot(cp, &freed);
        } else {
            prev = cp;
        }
        cp = next;
    }
}

/// After a delete of the record at `y`: any cursor about to yield `y` is
/// advanced past it: the sequential position to `y_next`, a per-key left
/// to y's predecessor and a per-key right to y's successor under that key.
pub(crate) fn repoint_deleted(
    arena: &mut Arena,
    layout: Layout,
    hdr: &mut HeaderBuf,
    y: u64,
    y_next: u64,
    neighbors: &[(u64, u64)],
) {
    let mut cp = hdr.head_cpr();
    while cp != 0 {
        let mut cpr = arena.read_slot(layout, cp);
        let next = cpr.next();
        let mut updated = false;

        if cpr.prev() == y {
            cpr.set_prev(y_next);
            updated = true;
        }
        for (k, &(pred, succ)) in neighbors.iter().enumerate() {
            if cpr.cur_left(k) == y {
                cpr.set_cur_left(k, pred);
                updated = true;
            }
            if cpr.cur_right(k) == y {
                cpr.set_cur_right(k, succ);
                updated = true;
            }
        }

        if updated {
            arena.write_slot(cp, &cpr);
        }
        cp = next;
    }
}

/// After compaction relocates the record at `y` to `b`: rewrite every
/// cursor reference from the old offset to the new one.
pub(crate) fn repoint_moved(
    arena: &mut Arena,
    layout: Layout,
    hdr: &mut HeaderBuf,
    y: u64,
    b: u64,
) {
    let mut cp = hdr.head_cpr();
    while cp != 0 {
        let mut cpr = arena.read_slot(layout, cp);
        let next = cpr.next();
        let mut updated = false;

        if cpr.prev() == y {
            cpr.set_prev(b);
            updated = true;
        }
        for k in 0..layout.key_count() {
            if cpr.cur_left(k) == y {
                cpr.set_cur_left(k, b);
                updated = true;
            }
            if cpr.cur_right(k) == y {
                cpr.set_cur_right(k, b);
                updated = true;
            }
        }

        if updated {
            arena.write_slot(cp, &cpr);
        }
        cp = next;
    }
}

//! # Compactor
//!
//! `squash` migrates live records downward into free slots and truncates
//! the file. The loop invariant is simple: take the highest slot in the
//! file and either drop it (free), relocate it (our own cursor or a live
//! record) into the lowest free slot, or stop (a peer's live cursor, which
//! cannot be moved out from under its owner, pins the file length).
//!
//! Relocating a live record is the expensive case: besides the byte copy,
//! both sequential neighbors, the parent child-pointer (or root) in every
//! tree, the two threads that can name the old offset, and every cursor
//! referencing it must be rewritten. The cursor rewrite happens as one
//! step after the physical move, so a peer's iteration state is never
//! observed half-updated.
//!
//! On success the free list is empty and the file is minimal for the
//! surviving slots. Truncation failures and list inconsistencies record a
//! numbered diagnostic and stop the loop; the file stays valid, just not
//! fully compacted.

use tracing::debug;

use crate::arena::Arena;
use crate::cmp::KeyComparator;
use crate::cursor;
use crate::emsg;
use crate::layout::{Layout, Link};
use crate::slot::{HeaderBuf, CURSOR_TAG};
use crate::tree::{locate_path, TreeCtx};

pub(crate) fn run(
    arena: &mut Arena,
    layout: Layout,
    hdr: &mut HeaderBuf,
    cmp: &dyn KeyComparator,
    own_cpr: &mut u64,
) {
    let reclen = layout.record_len() as u64;
    let pid = std::process::id();

    cursor::reap_abandoned(arena, layout, hdr, pid);

    'compact: while hdr.head_empty() != 0 {
        arena.write_header(hdr);

        // Lowest and highest free slots, with their list predecessors.
        let mut low = hdr.head_empty();
        let mut low_prev = 0u64;
        let mut high = hdr.head_empty();
        let mut high_prev = 0u64;
        {
            let mut prev = 0u64;
            let mut sp = hdr.head_empty();
            while sp != 0 {
                let spr = arena.read_slot(layout, sp);
                if sp <= low {
                    low = sp;
                    low_prev = prev;
                }
                if sp >= high {
                    high = sp;
                    high_prev = prev;
                }
                prev = sp;
                sp = spr.next();
            }
        }

        let tail = arena.end() - reclen;
        let tail_slot = arena.read_slot(layout, tail);

        // Free slot at the end: unlink and cut it off.
        if tail == high {
            if high_prev != 0 {
                let mut pr = arena.read_slot(layout, high_prev);
                pr.set_next(tail_slot.next());
                arena.write_slot(high_prev, &pr);
            } else {
                hdr.set_head_empty(tail_slot.next());
            }
            if arena.truncate(tail).is_err() {
                emsg::set("60 truncate failed");
                break 'compact;
            }
            continue;
        }

        // Our own cursor at the end: move it into the lowest free slot,
        // carrying the byte-range lock to the new location.
        if tail == *own_cpr {
            arena.unlock_range(tail, reclen);

            if hdr.head_cpr() == tail {
                hdr.set_head_cpr(tail_slot.next());
            } else {
                let mut sp = hdr.head_cpr();
                while sp != 0 {
                    let mut spr = arena.read_slot(layout, sp);
                    if spr.next() == tail {
                        spr.set_next(tail_slot.next());
                        arena.write_slot(sp, &spr);
                        break;
                    }
                    sp = spr.next();
                }
            }

            let low_slot = arena.read_slot(layout, low);
            if low_prev != 0 {
                let mut pr = arena.read_slot(layout, low_prev);
                pr.set_next(low_slot.next());
                arena.write_slot(low_prev, &pr);
            } else {
                hdr.set_head_empty(low_slot.next());
            }

            *own_cpr = low;
            let mut moved = tail_slot.clone();
            moved.set_next(hdr.head_cpr());
            hdr.set_head_cpr(low);
            arena.write_slot(low, &moved);
            arena.lock_range(low, reclen);

            if arena.truncate(tail).is_err() {
                emsg::set("61 truncate failed");
                break 'compact;
            }
            continue;
        }

        // Anything else at the end must be a live record; a peer's cursor
        // pins the file length, an unrecognizable slot is reported.
        if layout.key_count() == 0 {
            let mut cp = hdr.head_cpr();
            while cp != 0 {
                if cp == tail {
                    break 'compact;
                }
                cp = arena.read_slot(layout, cp).next();
            }
        } else if tail_slot.bal(0).abs() > 1 {
            if tail_slot.bal(0) != CURSOR_TAG {
                emsg::set("62 unknown last record");
            }
            break 'compact;
        }

        // Live record: move it into the lowest free slot and chase every
        // reference to the old offset.
        let low_slot = arena.read_slot(layout, low);
        if low_prev != 0 {
            let mut pr = arena.read_slot(layout, low_prev);
            pr.set_next(low_slot.next());
            arena.write_slot(low_prev, &pr);
        } else {
            hdr.set_head_empty(low_slot.next());
        }
        arena.write_slot(low, &tail_slot);
        let (y, b, yr) = (tail, low, &tail_slot);

        // Sequential neighbors.
        if yr.next() != 0 {
            let z = yr.next();
            let mut zr = arena.read_slot(layout, z);
            if zr.prev() != y {
                emsg::set("63 bad sequential list pointer");
                break 'compact;
            }
            zr.set_prev(b);
            arena.write_slot(z, &zr);
        }
        if yr.prev() != 0 {
            let z = yr.prev();
            let mut zr = arena.read_slot(layout, z);
            if zr.next() != y {
                emsg::set("64 bad sequential list pointer");
                break 'compact;
            }
            zr.set_next(b);
            arena.write_slot(z, &zr);
        } else {
            hdr.set_head_seq(b);
        }

        // Tree pointers: the parent child field (or root) and the two
        // threads that can name y.
        let payload = yr.payload().to_vec();
        for k in 0..layout.key_count() {
            let mut ctx = TreeCtx {
                arena: &mut *arena,
                hdr: &mut *hdr,
                cmp,
                layout,
            };
            let Some(path) = locate_path(&mut ctx, k, &payload, y) else {
                emsg::set("65 not in the tree");
                continue;
            };
            let m = path.len() - 1;
            if m == 0 {
                hdr.set_root(k, b);
            } else {
                let mut parent = path.slots[m - 1].clone();
                if parent.left(k) == Link::Child(y) {
                    parent.set_left(k, Link::Child(b));
                } else {
                    parent.set_right(k, Link::Child(b));
                }
                arena.write_slot(path.offs[m - 1], &parent);
            }

            if let Link::Child(mut sp) = yr.left(k) {
                let mut spr = arena.read_slot(layout, sp);
                while let Link::Child(c) = spr.right(k) {
                    sp = c;
                    spr = arena.read_slot(layout, c);
                }
                spr.set_right(k, Link::Thread(b));
                arena.write_slot(sp, &spr);
            }
            if let Link::Child(mut sp) = yr.right(k) {
                let mut spr = arena.read_slot(layout, sp);
                while let Link::Child(c) = spr.left(k) {
                    sp = c;
                    spr = arena.read_slot(layout, c);
                }
                spr.set_left(k, Link::Thread(b));
                arena.write_slot(sp, &spr);
            }
        }

        cursor::repoint_moved(arena, layout, hdr, y, b);

        if arena.truncate(y).is_err() {
            emsg::set("66 truncate failed");
            break 'compact;
        }
    }

    arena.write_header(hdr);
    debug!(target: "avlfile", len = arena.end(), "compaction finished");
}

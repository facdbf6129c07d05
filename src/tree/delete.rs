//! Per-key removal: exact-record search, the threaded splice, and the
//! shrink rebalancing walk.
//!
//! Deletion is the one operation that must identify a record *exactly*: the
//! caller's buffer must match a live payload byte for byte. With duplicate
//! keys the first ordered match may be the wrong record, so the search runs
//! in three widening phases: a direct descent per key, a walk along the
//! key-0 equal run, and finally the sequential list (which also covers
//! files with no keys at all).
//!
//! The splice replaces the removed node with its in-order predecessor (when
//! a left subtree exists), its mirror with the successor, or plain leaf
//! removal. Unlike an in-memory AVL tree, records never move: the
//! replacement keeps its slot offset and only the key-`k` node contents
//! change hands, which is also why at most one external thread (the
//! successor's left thread, when the removed node had a right subtree) ever
//! needs rewriting. The rebalance walk then climbs the recorded path,
//! stopping at the first node whose subtree height is unchanged; the
//! rotation tables differ from insertion in the single-rotation case, where
//! an evenly balanced sibling leaves the height intact.

use crate::emsg;
use crate::layout::Link;
use crate::slot::SlotBuf;

use super::{
    child_or_fatal, double_rotate_lr, double_rotate_rl, locate_path, lower_bound, successor,
    Path, TreeCtx,
};

/// Finds a live record whose payload equals `data` byte for byte, or
/// `None`. Phases: per-key ordered probe, key-0 duplicate-run walk,
/// sequential-list scan.
pub(crate) fn find_exact(ctx: &mut TreeCtx<'_>, data: &[u8]) -> Option<(u64, SlotBuf)> {
    for k in 0..ctx.layout.key_count() {
        let a = lower_bound(ctx, k, data);
        if a != 0 {
            let ar = ctx.arena.read_slot(ctx.layout, a);
            if ctx.cmp.compare(k, data, ar.payload()).is_eq() && ar.payload() == data {
                return Some((a, ar));
            }
        }
    }

    // Duplicate keys can hide the exact record from the probe above: walk
    // the whole run of key-0 equals in thread order.
    if ctx.layout.key_count() > 0 {
        let mut a = lower_bound(ctx, 0, data);
        while a != 0 {
            let ar = ctx.arena.read_slot(ctx.layout, a);
            if !ctx.cmp.compare(0, data, ar.payload()).is_eq() {
                break;
            }
            if ar.payload() == data {
                return Some((a, ar));
            }
            a = successor(ctx.arena, ctx.layout, 0, &ar);
        }
    }

    let mut a = ctx.hdr.head_seq();
    while a != 0 {
        let ar = ctx.arena.read_slot(ctx.layout, a);
        if ar.payload() == data {
            return Some((a, ar));
        }
        a = ar.next();
    }
    None
}

/// Removes `y` from the key-`k` tree. `yr` is y's slot (its node `k` may be
/// adjusted in place as part of the splice), `target` its payload, and
/// `succ` its precomputed in-order successor under `k`.
pub(crate) fn unlink(
    ctx: &mut TreeCtx<'_>,
    k: usize,
    y: u64,
    yr: &mut SlotBuf,
    target: &[u8],
    succ: u64,
) {
    let layout = ctx.layout;
    let Some(mut path) = locate_path(ctx, k, target, y) else {
        emsg::set("40 not in the tree");
        return;
    };
    let m = path.len() - 1;
    let walk_from: isize;

    if yr.left(k).is_child() {
        // Replace y with its in-order predecessor: the rightmost node of
        // the left subtree.
        let lc = child_or_fatal(yr.left(k));
        path.push(lc, ctx.arena.read_slot(layout, lc));
        let mut l = path.len() - 1;

        if path.slots[l].right(k).is_child() {
            while let Link::Child(rc) = path.slots[l].right(k) {
                path.push(rc, ctx.arena.read_slot(layout, rc));
                l += 1;
            }
            // Detach the predecessor from its parent; the freed right
            // field threads at the predecessor's (stable) offset.
            let pred_off = path.offs[l];
            let filler = path.slots[l].left(k).or_thread(pred_off);
            path.slots[l - 1].set_right(k, filler);
            path.slots[l - 1].adjust_bal(k, 1);
            ctx.arena.write_slot(path.offs[l - 1], &path.slots[l - 1]);
        } else {
            // The left child itself is the predecessor; it keeps its own
            // left side and inherits the rest of y's node below.
            yr.set_left(k, path.slots[l].left(k));
            yr.adjust_bal(k, -1);
        }

        // The predecessor takes over y's tree position.
        path.offs[m] = path.offs[l];
        path.slots[m] = path.slots[l].clone();
        let promoted = path.offs[m];
        path.slots[m].copy_node_from(yr, k);
        ctx.arena.write_slot(promoted, &path.slots[m]);
        walk_from = l as isize - 1;

        // With a right subtree present, the successor's left thread still
        // names y; repoint it at the promoted node.
        if yr.right(k).is_child() {
            let mut sr = ctx.arena.read_slot(layout, succ);
            sr.set_left(k, Link::Thread(promoted));
            ctx.arena.write_slot(succ, &sr);
        }

        reparent(ctx, &mut path, m, y, promoted, k);
    } else if yr.right(k).is_child() {
        // Mirror: replace y with its in-order successor, the leftmost node
        // of the right subtree. The successor's left thread (which named
        // y) is overwritten by the node copy itself.
        let rc = child_or_fatal(yr.right(k));
        path.push(rc, ctx.arena.read_slot(layout, rc));
        let mut l = path.len() - 1;

        if path.slots[l].left(k).is_child() {
            while let Link::Child(lc) = path.slots[l].left(k) {
                path.push(lc, ctx.arena.read_slot(layout, lc));
                l += 1;
            }
            let succ_off = path.offs[l];
            let filler = path.slots[l].right(k).or_thread(succ_off);
            path.slots[l - 1].set_left(k, filler);
            path.slots[l - 1].adjust_bal(k, -1);
            ctx.arena.write_slot(path.offs[l - 1], &path.slots[l - 1]);
        } else {
            yr.set_right(k, path.slots[l].right(k));
            yr.adjust_bal(k, 1);
        }

        path.offs[m] = path.offs[l];
        path.slots[m] = path.slots[l].clone();
        let promoted = path.offs[m];
        path.slots[m].copy_node_from(yr, k);
        ctx.arena.write_slot(promoted, &path.slots[m]);
        walk_from = l as isize - 1;

        reparent(ctx, &mut path, m, y, promoted, k);
    } else {
        // Leaf: the parent's child field collapses to y's thread on that
        // side.
        if m == 0 {
            ctx.hdr.set_root(k, 0);
        } else {
            if path.slots[m - 1].left(k) == Link::Child(y) {
                path.slots[m - 1].set_left(k, yr.left(k));
                path.slots[m - 1].adjust_bal(k, -1);
            } else if path.slots[m - 1].right(k) == Link::Child(y) {
                path.slots[m - 1].set_right(k, yr.right(k));
                path.slots[m - 1].adjust_bal(k, 1);
            }
            ctx.arena.write_slot(path.offs[m - 1], &path.slots[m - 1]);
        }
        walk_from = m as isize - 1;
    }

    rebalance_shrink(ctx, k, &mut path, walk_from);
}

/// Hands y's old tree position to the promoted node, in the parent's child
/// field or the root.
fn reparent(ctx: &mut TreeCtx<'_>, path: &mut Path, m: usize, y: u64, promoted: u64, k: usize) {
    if m == 0 {
        ctx.hdr.set_root(k, promoted);
    } else {
        if path.slots[m - 1].left(k) == Link::Child(y) {
            path.slots[m - 1].set_left(k, Link::Child(promoted));
        } else {
            path.slots[m - 1].set_right(k, Link::Child(promoted));
        }
        ctx.arena.write_slot(path.offs[m - 1], &path.slots[m - 1]);
    }
}

/// Climbs from `walk_from` toward the root, propagating the height loss.
/// A node at ±1 absorbed it (stop); a node at 0 passes it up; a node at ±2
/// rotates, and the new subtree root is re-examined at the same depth
/// since only a height-preserving rotation may stop the climb.
fn rebalance_shrink(ctx: &mut TreeCtx<'_>, k: usize, path: &mut Path, walk_from: isize) {
    let layout = ctx.layout;
    let mut l = walk_from;
    while l >= 0 {
        let li = l as usize;
        let a = path.offs[li];
        let ab = path.slots[li].bal(k);

        if ab == 1 || ab == -1 {
            break;
        }
        if ab == 0 {
            if li > 0 {
                if path.slots[li - 1].left(k) == Link::Child(a) {
                    path.slots[li - 1].adjust_bal(k, -1);
                } else if path.slots[li - 1].right(k) == Link::Child(a) {
                    path.slots[li - 1].adjust_bal(k, 1);
                }
                ctx.arena.write_slot(path.offs[li - 1], &path.slots[li - 1]);
            }
            l -= 1;
            continue;
        }

        let mut ar = path.slots[li].clone();
        let (new_off, new_slot) = if ab == 2 {
            let b = child_or_fatal(ar.left(k));
            let mut br = ctx.arena.read_slot(layout, b);
            if br.bal(k) == 0 || br.bal(k) == 1 {
                ar.set_left(k, br.right(k).or_thread(b));
                br.set_right(k, Link::Child(a));
                if br.bal(k) == 0 {
                    ar.set_bal(k, 1);
                    br.set_bal(k, -1);
                } else {
                    ar.set_bal(k, 0);
                    br.set_bal(k, 0);
                }
                ctx.arena.write_slot(a, &ar);
                ctx.arena.write_slot(b, &br);
                (b, br)
            } else {
                double_rotate_lr(ctx, k, a, &mut ar, b, &mut br, "41 invalid balance factor")
            }
        } else if ab == -2 {
            let b = child_or_fatal(ar.right(k));
            let mut br = ctx.arena.read_slot(layout, b);
            if br.bal(k) == 0 || br.bal(k) == -1 {
                ar.set_right(k, br.left(k).or_thread(b));
                br.set_left(k, Link::Child(a));
                if br.bal(k) == 0 {
                    ar.set_bal(k, -1);
                    br.set_bal(k, 1);
                } else {
                    ar.set_bal(k, 0);
                    br.set_bal(k, 0);
                }
                ctx.arena.write_slot(a, &ar);
                ctx.arena.write_slot(b, &br);
                (b, br)
            } else {
                double_rotate_rl(ctx, k, a, &mut ar, b, &mut br, "42 invalid balance factor")
            }
        } else {
            emsg::fatal("43 bad balance factor")
        };

        path.offs[li] = new_off;
        path.slots[li] = new_slot;
        if li == 0 {
            ctx.hdr.set_root(k, new_off);
        } else {
            if path.slots[li - 1].left(k) == Link::Child(a) {
                path.slots[li - 1].set_left(k, Link::Child(new_off));
            } else if path.slots[li - 1].right(k) == Link::Child(a) {
                path.slots[li - 1].set_right(k, Link::Child(new_off));
            }
            ctx.arena.write_slot(path.offs[li - 1], &path.slots[li - 1]);
        }
        // No step up here: the new root's balance decides whether the
        // subtree height actually changed.
    }
}

//! Per-key insertion: iterative AVL descent with at most one single or
//! double rotation, keeping every thread intact.
//!
//! The new record is already linked on the sequential list and its payload
//! written when this runs; each key's tree adopts it independently. The
//! descent remembers the deepest ancestor with a non-zero balance (`a`) and
//! its parent (`f`): only the subtree under `a` can need a rotation, and
//! only the nodes strictly between `a` and the new leaf need their balance
//! seeded.

use crate::layout::Link;
use crate::slot::SlotBuf;

use super::{child_or_fatal, double_rotate_lr, double_rotate_rl, TreeCtx};

pub(crate) fn insert_into_tree(ctx: &mut TreeCtx<'_>, k: usize, y: u64) {
    let layout = ctx.layout;
    // Earlier keys' rotations may have rewritten y's slot, so read it fresh.
    let mut yr = ctx.arena.read_slot(layout, y);

    let root = ctx.hdr.root(k);
    if root == 0 {
        yr.set_node(k, 0, Link::Nil, Link::Nil);
        ctx.hdr.set_root(k, y);
        ctx.arena.write_slot(y, &yr);
        return;
    }

    // Descend to the attachment point. `a` tracks the deepest node with a
    // non-zero balance, `f` its parent; `q` ends as the new leaf's parent
    // and `end_link` as the thread the leaf displaces.
    let mut a = root;
    let mut f: u64 = 0;
    let mut fr: Option<SlotBuf> = None;
    let mut q: u64 = 0;
    let mut qr: Option<SlotBuf> = None;
    let mut link = Link::Child(root);
    while let Link::Child(p) = link {
        let pr = ctx.arena.read_slot(layout, p);
        if pr.bal(k) != 0 {
            a = p;
            f = q;
            fr = qr.clone();
        }
        link = if ctx.cmp.compare(k, yr.payload(), pr.payload()).is_lt() {
            pr.left(k)
        } else {
            pr.right(k)
        };
        q = p;
        qr = Some(pr);
    }
    let end_link = link;
    let mut q_slot = qr.expect("descent visits at least the root");

    // Attach y as a leaf. It inherits the displaced thread on one side and
    // threads back to its parent on the other: the parent is the new
    // leaf's in-order neighbor by construction.
    if ctx.cmp.compare(k, yr.payload(), q_slot.payload()).is_lt() {
        yr.set_node(k, 0, end_link, Link::Thread(q));
        q_slot.set_left(k, Link::Child(y));
    } else {
        yr.set_node(k, 0, Link::Thread(q), end_link);
        q_slot.set_right(k, Link::Child(y));
    }
    ctx.arena.write_slot(y, &yr);
    ctx.arena.write_slot(q, &q_slot);

    // Seed the balances from a (exclusive) down to y. a is re-read since q
    // may alias it.
    let mut ar = ctx.arena.read_slot(layout, a);
    let d: i8;
    let b: u64;
    if ctx.cmp.compare(k, yr.payload(), ar.payload()).is_lt() {
        b = child_or_fatal(ar.left(k));
        d = 1;
    } else {
        b = child_or_fatal(ar.right(k));
        d = -1;
    }
    let mut p = b;
    while p != y {
        let mut pr = ctx.arena.read_slot(layout, p);
        if ctx.cmp.compare(k, yr.payload(), pr.payload()).is_lt() {
            pr.set_bal(k, 1);
            ctx.arena.write_slot(p, &pr);
            p = child_or_fatal(pr.left(k));
        } else {
            pr.set_bal(k, -1);
            ctx.arena.write_slot(p, &pr);
            p = child_or_fatal(pr.right(k));
        }
    }

    // The subtree under a either absorbs the new height or rotates.
    if ar.bal(k) == 0 {
        ar.set_bal(k, d);
        ctx.arena.write_slot(a, &ar);
        return;
    }
    if ar.bal(k) + d == 0 {
        ar.set_bal(k, 0);
        ctx.arena.write_slot(a, &ar);
        return;
    }

    let new_root = if d == 1 {
        rotate_left_growth(ctx, k, a, &mut ar, b)
    } else {
        rotate_right_growth(ctx, k, a, &mut ar, b)
    };

    if f == 0 {
        ctx.hdr.set_root(k, new_root);
    } else {
        let mut fr = fr.expect("non-root ancestor has a recorded parent");
        if fr.left(k) == Link::Child(a) {
            fr.set_left(k, Link::Child(new_root));
        } else if fr.right(k) == Link::Child(a) {
            fr.set_right(k, Link::Child(new_root));
        }
        ctx.arena.write_slot(f, &fr);
    }
}

/// Growth on a's left side (a was already left-heavy): LL single rotation
/// when b leans the same way, LR double otherwise.
fn rotate_left_growth(ctx: &mut TreeCtx<'_>, k: usize, a: u64, ar: &mut SlotBuf, b: u64) -> u64 {
    let mut br = ctx.arena.read_slot(ctx.layout, b);
    if br.bal(k) == 1 {
        ar.set_left(k, br.right(k).or_thread(b));
        br.set_right(k, Link::Child(a));
        ar.set_bal(k, 0);
        br.set_bal(k, 0);
        ctx.arena.write_slot(a, ar);
        ctx.arena.write_slot(b, &br);
        b
    } else {
        double_rotate_lr(ctx, k, a, ar, b, &mut br, "32 invalid balance factor").0
    }
}

/// Mirror of [`rotate_left_growth`]: RR single or RL double.
fn rotate_right_growth(ctx: &mut TreeCtx<'_>, k: usize, a: u64, ar: &mut SlotBuf, b: u64) -> u64 {
    let mut br = ctx.arena.read_slot(ctx.layout, b);
    if br.bal(k) == -1 {
        ar.set_right(k, br.left(k).or_thread(b));
        br.set_left(k, Link::Child(a));
        ar.set_bal(k, 0);
        br.set_bal(k, 0);
        ctx.arena.write_slot(a, ar);
        ctx.arena.write_slot(b, &br);
        b
    } else {
        double_rotate_rl(ctx, k, a, ar, b, &mut br, "33 invalid balance factor").0
    }
}

//! # Threaded AVL Index Set
//!
//! Every live record participates in one AVL tree per key, all co-resident
//! in the same slot arena: a record carries `key_count` nodes, each with its
//! own balance factor and left/right links. The trees are *threaded*: a
//! missing child link stores the in-order predecessor (left side) or
//! successor (right side) instead, so ordered iteration walks neighbor to
//! neighbor without a descent stack and without parent pointers.
//!
//! Threading is what makes the mutation algorithms delicate: every rotation
//! or splice that turns a real child into a missing one must write a thread
//! in its place, and every node removed from a tree position must have the
//! one external thread that can point at it (its successor's left thread,
//! when it has a right subtree) rewritten. The insert and delete paths in
//! the submodules follow the iterative formulation of Horowitz & Sahni,
//! extended with the thread bookkeeping; this module holds the pieces they
//! share with search, iteration and compaction.
//!
//! Duplicate keys are allowed and compare equal; an equal probe descends
//! left, so equal-key runs are contiguous in thread order and a record can
//! only be pinned down exactly by its payload bytes. [`locate_path`]
//! resolves an exact slot offset among duplicates by re-descending and
//! backtracking through the stacked equal positions.

mod insert;

pub(crate) mod delete;

pub(crate) use insert::insert_into_tree;

use smallvec::SmallVec;

use crate::arena::Arena;
use crate::cmp::KeyComparator;
use crate::emsg;
use crate::layout::{Layout, Link};
use crate::slot::{HeaderBuf, SlotBuf};

/// Everything a tree mutation needs: the arena, the header being edited
/// under the gate, the host's orderings, and the file geometry.
pub(crate) struct TreeCtx<'a> {
    pub arena: &'a mut Arena,
    pub hdr: &'a mut HeaderBuf,
    pub cmp: &'a dyn KeyComparator,
    pub layout: Layout,
}

/// A root-to-node descent: slot offsets and their cached contents, kept in
/// sync with every write the caller makes along it.
pub(crate) struct Path {
    pub offs: Vec<u64>,
    pub slots: Vec<SlotBuf>,
}

impl Path {
    pub fn new() -> Self {
        Self {
            offs: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.offs.len()
    }

    pub fn push(&mut self, off: u64, slot: SlotBuf) {
        self.offs.push(off);
        self.slots.push(slot);
    }

    pub fn truncate(&mut self, len: usize) {
        self.offs.truncate(len);
        self.slots.truncate(len);
    }
}

/// A link that must be a real child on an intact tree path.
pub(crate) fn child_or_fatal(link: Link) -> u64 {
    match link {
        Link::Child(off) => off,
        _ => emsg::fatal("34 broken descent path"),
    }
}

/// Smallest record whose key-`k` ordering is >= the probe, or 0. When the
/// descent falls off the tree on the greater side, the successor thread of
/// the last node visited is exactly the answer.
pub(crate) fn lower_bound(ctx: &mut TreeCtx<'_>, k: usize, probe: &[u8]) -> u64 {
    let mut a = ctx.hdr.root(k);
    while a != 0 {
        let ar = ctx.arena.read_slot(ctx.layout, a);
        if ctx.cmp.compare(k, probe, ar.payload()).is_le() {
            match ar.left(k) {
                Link::Child(c) => a = c,
                _ => break,
            }
        } else {
            match ar.right(k) {
                Link::Child(c) => a = c,
                link => {
                    a = link.neighbor();
                    break;
                }
            }
        }
    }
    a
}

/// Largest record whose key-`k` ordering is < the probe, or 0. Mirror of
/// [`lower_bound`].
pub(crate) fn last_below(ctx: &mut TreeCtx<'_>, k: usize, probe: &[u8]) -> u64 {
    let mut a = ctx.hdr.root(k);
    while a != 0 {
        let ar = ctx.arena.read_slot(ctx.layout, a);
        if ctx.cmp.compare(k, probe, ar.payload()).is_le() {
            match ar.left(k) {
                Link::Child(c) => a = c,
                link => {
                    a = link.neighbor();
                    break;
                }
            }
        } else {
            match ar.right(k) {
                Link::Child(c) => a = c,
                _ => break,
            }
        }
    }
    a
}

/// In-order predecessor of a node under key `k`: rightmost of the left
/// subtree, or the left thread, or 0 at the leftmost edge.
pub(crate) fn predecessor(arena: &Arena, layout: Layout, k: usize, slot: &SlotBuf) -> u64 {
    match slot.left(k) {
        Link::Child(mut sp) => {
            let mut sr = arena.read_slot(layout, sp);
            while let Link::Child(c) = sr.right(k) {
                sp = c;
                sr = arena.read_slot(layout, c);
            }
            sp
        }
        link => link.neighbor(),
    }
}

/// In-order successor of a node under key `k`. Mirror of [`predecessor`].
pub(crate) fn successor(arena: &Arena, layout: Layout, k: usize, slot: &SlotBuf) -> u64 {
    match slot.right(k) {
        Link::Child(mut sp) => {
            let mut sr = arena.read_slot(layout, sp);
            while let Link::Child(c) = sr.left(k) {
                sp = c;
                sr = arena.read_slot(layout, c);
            }
            sp
        }
        link => link.neighbor(),
    }
}

/// Re-descends to the record stored at offset `y`, whose payload is
/// `probe`. Equal keys descend left with every equal position stacked;
/// when the descent bottoms out, stacked positions are retried through
/// their right subtrees until the exact offset is found. Returns the full
/// root-to-`y` path, or `None` if `y` is not reachable under key `k`.
pub(crate) fn locate_path(
    ctx: &mut TreeCtx<'_>,
    k: usize,
    probe: &[u8],
    y: u64,
) -> Option<Path> {
    let mut path = Path::new();
    let mut equals: SmallVec<[usize; 8]> = SmallVec::new();

    let root = ctx.hdr.root(k);
    let mut cur = if root == 0 {
        Link::Nil
    } else {
        Link::Child(root)
    };

    loop {
        while let Link::Child(off) = cur {
            let slot = ctx.arena.read_slot(ctx.layout, off);
            let ord = ctx.cmp.compare(k, probe, slot.payload());
            cur = if ord.is_le() {
                if ord.is_eq() {
                    equals.push(path.len());
                }
                slot.left(k)
            } else {
                slot.right(k)
            };
            path.push(off, slot);
        }

        let l = equals.pop()?;
        if path.offs[l] == y {
            path.truncate(l + 1);
            return Some(path);
        }
        cur = path.slots[l].right(k);
        path.truncate(l + 1);
    }
}

/// Recursive consistency scan of the subtree at `off`: counts records and
/// returns the subtree height. A stored balance that disagrees with the
/// measured child heights means the file is corrupt.
pub(crate) fn scan_subtree(
    arena: &Arena,
    layout: Layout,
    k: usize,
    off: u64,
    count: &mut i64,
) -> u32 {
    let sr = arena.read_slot(layout, off);
    *count += 1;

    let mut hl = 1u32;
    let mut hr = 1u32;
    if let Link::Child(c) = sr.left(k) {
        hl += scan_subtree(arena, layout, k, c, count);
    }
    if let Link::Child(c) = sr.right(k) {
        hr += scan_subtree(arena, layout, k, c, count);
    }
    if sr.bal(k) as i32 != hl as i32 - hr as i32 {
        emsg::fatal("51 bad balance");
    }
    hl.max(hr)
}

/// LR double rotation around `a` (left-heavy): `b` is a's left child, the
/// new subtree root is b's right child. Writes all three nodes and returns
/// the new root. Thread links are preserved wherever a child field goes
/// missing. Shared by insert growth and delete shrink, whose single
/// rotations differ but whose double rotations use the same balance table.
pub(crate) fn double_rotate_lr(
    ctx: &mut TreeCtx<'_>,
    k: usize,
    a: u64,
    ar: &mut SlotBuf,
    b: u64,
    br: &mut SlotBuf,
    msg: &'static str,
) -> (u64, SlotBuf) {
    let c = child_or_fatal(br.right(k));
    let mut cr = ctx.arena.read_slot(ctx.layout, c);

    br.set_right(k, cr.left(k).or_thread(c));
    ar.set_left(k, cr.right(k).or_thread(c));
    cr.set_left(k, Link::Child(b));
    cr.set_right(k, Link::Child(a));
    match cr.bal(k) {
        1 => {
            ar.set_bal(k, -1);
            br.set_bal(k, 0);
        }
        -1 => {
            br.set_bal(k, 1);
            ar.set_bal(k, 0);
        }
        0 => {
            br.set_bal(k, 0);
            ar.set_bal(k, 0);
        }
        _ => emsg::fatal(msg),
    }
    cr.set_bal(k, 0);

    ctx.arena.write_slot(a, ar);
    ctx.arena.write_slot(b, br);
    ctx.arena.write_slot(c, &cr);
    (c, cr)
}

/// RL double rotation around `a` (right-heavy). Mirror of
/// [`double_rotate_lr`].
pub(crate) fn double_rotate_rl(
    ctx: &mut TreeCtx<'_>,
    k: usize,
    a: u64,
    ar: &mut SlotBuf,
    b: u64,
    br: &mut SlotBuf,
    msg: &'static str,
) -> (u64, SlotBuf) {
    let c = child_or_fatal(br.left(k));
    let mut cr = ctx.arena.read_slot(ctx.layout, c);

    ar.set_right(k, cr.left(k).or_thread(c));
    br.set_left(k, cr.right(k).or_thread(c));
    cr.set_right(k, Link::Child(b));
    cr.set_left(k, Link::Child(a));
    match cr.bal(k) {
        1 => {
            br.set_bal(k, -1);
            ar.set_bal(k, 0);
        }
        -1 => {
            ar.set_bal(k, 1);
            br.set_bal(k, 0);
        }
        0 => {
            br.set_bal(k, 0);
            ar.set_bal(k, 0);
        }
        _ => emsg::fatal(msg),
    }
    cr.set_bal(k, 0);

    ctx.arena.write_slot(a, ar);
    ctx.arena.write_slot(b, br);
    ctx.arena.write_slot(c, &cr);
    (c, cr)
}

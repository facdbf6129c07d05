//! # Header and Slot Accessors
//!
//! The header and the slots are variable-length on-disk structures, so they
//! are handled as byte buffers with offset accessors computed from the
//! file's [`Layout`]. The fixed 40-byte header prelude is a zerocopy struct
//! (native-endian wrapper fields, like every multi-byte field in the file);
//! the roots array, list heads and slot fields are carved out manually.
//!
//! ## Slot kinds
//!
//! A slot is a live record, a cursor record, or a free record. The balance
//! byte of node 0 disambiguates: a live balance is in `-2..=+2` (|b| ≤ 1
//! between operations), `0x20` marks a cursor, `0x40` marks a free slot.
//! The sentinels are checked before the byte is interpreted as a signed
//! balance. Files with zero keys have no node bytes at all; the slot lists
//! are the only way to classify their slots.

use zerocopy::native_endian::{I64, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::layout::{Layout, Link, HEADER_PRELUDE, MAGIC};

/// Balance-byte sentinel of a cursor slot.
pub(crate) const CURSOR_TAG: i8 = 0x20;
/// Balance-byte sentinel of a free slot.
pub(crate) const FREE_TAG: i8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Live,
    Cursor,
    Free,
    Unknown,
}

/// Fixed-size front of the header; the roots array and list heads follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct HeaderPrelude {
    magic: [u8; 8],
    key_count: U32,
    data_len: U32,
    record_len: U32,
    reserved: [u8; 4],
    live_count: I64,
    next_number: I64,
}

const _: () = assert!(std::mem::size_of::<HeaderPrelude>() == HEADER_PRELUDE);

pub(crate) struct HeaderBuf {
    layout: Layout,
    buf: Vec<u8>,
}

impl HeaderBuf {
    /// A fresh header for a newly created file: magic, geometry, empty
    /// lists.
    pub fn new(layout: Layout) -> Self {
        let mut hdr = Self {
            layout,
            buf: vec![0u8; layout.header_len() as usize],
        };
        let p = hdr.prelude_mut();
        p.magic = MAGIC;
        p.key_count = U32::new(layout.key_count() as u32);
        p.data_len = U32::new(layout.data_len() as u32);
        p.record_len = U32::new(layout.record_len() as u32);
        hdr
    }

    pub fn from_bytes(layout: Layout, buf: Vec<u8>) -> Self {
        debug_assert_eq!(buf.len(), layout.header_len() as usize);
        Self { layout, buf }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn prelude(&self) -> &HeaderPrelude {
        HeaderPrelude::ref_from_bytes(&self.buf[..HEADER_PRELUDE])
            .expect("header prelude is unaligned and size-checked")
    }

    fn prelude_mut(&mut self) -> &mut HeaderPrelude {
        HeaderPrelude::mut_from_bytes(&mut self.buf[..HEADER_PRELUDE])
            .expect("header prelude is unaligned and size-checked")
    }

    pub fn magic_ok(&self) -> bool {
        self.prelude().magic == MAGIC
    }

    pub fn key_count(&self) -> u32 {
        self.prelude().key_count.get()
    }

    pub fn data_len(&self) -> u32 {
        self.prelude().data_len.get()
    }

    pub fn record_len(&self) -> u32 {
        self.prelude().record_len.get()
    }

    pub fn live_count(&self) -> i64 {
        self.prelude().live_count.get()
    }

    pub fn set_live_count(&mut self, n: i64) {
        self.prelude_mut().live_count = I64::new(n);
    }

    pub fn next_number(&self) -> i64 {
        self.prelude().next_number.get()
    }

    pub fn set_next_number(&mut self, n: i64) {
        self.prelude_mut().next_number = I64::new(n);
    }

    pub fn root(&self, k: usize) -> u64 {
        get_u64(&self.buf, self.layout.root_off(k))
    }

    pub fn set_root(&mut self, k: usize, off: u64) {
        put_u64(&mut self.buf, self.layout.root_off(k), off);
    }

    pub fn head_seq(&self) -> u64 {
        get_u64(&self.buf, self.layout.head_seq_off())
    }

    pub fn set_head_seq(&mut self, off: u64) {
        put_u64(&mut self.buf, self.layout.head_seq_off(), off);
    }

    pub fn head_empty(&self) -> u64 {
        get_u64(&self.buf, self.layout.head_empty_off())
    }

    pub fn set_head_empty(&mut self, off: u64) {
        put_u64(&mut self.buf, self.layout.head_empty_off(), off);
    }

    pub fn head_cpr(&self) -> u64 {
        get_u64(&self.buf, self.layout.head_cpr_off())
    }

    pub fn set_head_cpr(&mut self, off: u64) {
        put_u64(&mut self.buf, self.layout.head_cpr_off(), off);
    }
}

/// One slot's bytes plus the geometry needed to address its fields.
#[derive(Clone)]
pub(crate) struct SlotBuf {
    layout: Layout,
    buf: Vec<u8>,
}

impl SlotBuf {
    pub fn new_zeroed(layout: Layout) -> Self {
        Self {
            layout,
            buf: vec![0u8; layout.record_len()],
        }
    }

    pub fn from_bytes(layout: Layout, buf: Vec<u8>) -> Self {
        debug_assert_eq!(buf.len(), layout.record_len());
        Self { layout, buf }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The kind tag: node 0's balance byte. Only meaningful when the file
    /// has at least one key.
    pub fn kind(&self) -> SlotKind {
        debug_assert!(self.layout.key_count() > 0);
        match self.bal(0) {
            CURSOR_TAG => SlotKind::Cursor,
            FREE_TAG => SlotKind::Free,
            b if (-2..=2).contains(&b) => SlotKind::Live,
            _ => SlotKind::Unknown,
        }
    }

    pub fn bal(&self, k: usize) -> i8 {
        self.buf[self.layout.node_off(k)] as i8
    }

    pub fn set_bal(&mut self, k: usize, b: i8) {
        self.buf[self.layout.node_off(k)] = b as u8;
    }

    pub fn adjust_bal(&mut self, k: usize, delta: i8) {
        self.set_bal(k, self.bal(k) + delta);
    }

    pub fn left(&self, k: usize) -> Link {
        Link::decode(get_i64(&self.buf, self.layout.node_off(k) + 1))
    }

    pub fn set_left(&mut self, k: usize, link: Link) {
        put_i64(&mut self.buf, self.layout.node_off(k) + 1, link.encode());
    }

    pub fn right(&self, k: usize) -> Link {
        Link::decode(get_i64(&self.buf, self.layout.node_off(k) + 9))
    }

    pub fn set_right(&mut self, k: usize, link: Link) {
        put_i64(&mut self.buf, self.layout.node_off(k) + 9, link.encode());
    }

    pub fn set_node(&mut self, k: usize, bal: i8, left: Link, right: Link) {
        self.set_bal(k, bal);
        self.set_left(k, left);
        self.set_right(k, right);
    }

    /// Copies node `k` (balance and both links) from another slot.
    pub fn copy_node_from(&mut self, src: &SlotBuf, k: usize) {
        self.set_node(k, src.bal(k), src.left(k), src.right(k));
    }

    // In cursor slots the per-key fields hold plain offsets of the next
    // record to yield, never threads.

    pub fn cur_left(&self, k: usize) -> u64 {
        self.left(k).child().unwrap_or(0)
    }

    pub fn set_cur_left(&mut self, k: usize, off: u64) {
        put_i64(&mut self.buf, self.layout.node_off(k) + 1, off as i64);
    }

    pub fn cur_right(&self, k: usize) -> u64 {
        self.right(k).child().unwrap_or(0)
    }

    pub fn set_cur_right(&mut self, k: usize, off: u64) {
        put_i64(&mut self.buf, self.layout.node_off(k) + 9, off as i64);
    }

    /// Sequential-list predecessor; in a cursor slot, the sequential read
    /// position.
    pub fn prev(&self) -> u64 {
        get_u64(&self.buf, self.layout.prev_off())
    }

    pub fn set_prev(&mut self, off: u64) {
        put_u64(&mut self.buf, self.layout.prev_off(), off);
    }

    /// Sequential-list successor; in free and cursor slots, the list link.
    pub fn next(&self) -> u64 {
        get_u64(&self.buf, self.layout.next_off())
    }

    pub fn set_next(&mut self, off: u64) {
        put_u64(&mut self.buf, self.layout.next_off(), off);
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.layout.payload_off()..]
    }

    pub fn set_payload(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), self.layout.data_len());
        let off = self.layout.payload_off();
        self.buf[off..].copy_from_slice(data);
    }

    /// The owner PID stamped into a cursor slot's payload, when the payload
    /// is wide enough to hold one.
    pub fn pid(&self) -> Option<u32> {
        if self.layout.data_len() < 4 {
            return None;
        }
        let off = self.layout.payload_off();
        Some(u32::from_ne_bytes(self.buf[off..off + 4].try_into().unwrap()))
    }

    pub fn stamp_pid(&mut self, pid: u32) {
        if self.layout.data_len() >= 4 {
            let off = self.layout.payload_off();
            self.buf[off..off + 4].copy_from_slice(&pid.to_ne_bytes());
        }
    }

    /// Turns this slot into a free record: every node tagged, both links
    /// cleared. The caller chains `next` onto the free list.
    pub fn mark_free(&mut self) {
        for k in 0..self.layout.key_count() {
            self.set_node(k, FREE_TAG, Link::Nil, Link::Nil);
        }
    }

    /// Turns this slot into this opener's cursor: every node tagged with
    /// cleared positions, the sequential read position reset, the PID
    /// stamped. The caller chains `next` onto the cursor list.
    pub fn init_cursor(&mut self, pid: u32) {
        for k in 0..self.layout.key_count() {
            self.set_node(k, CURSOR_TAG, Link::Nil, Link::Nil);
        }
        self.stamp_pid(pid);
        self.set_prev(0);
    }
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_ne_bytes(buf[off..off + 8].try_into().unwrap())
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

fn get_i64(buf: &[u8], off: usize) -> i64 {
    i64::from_ne_bytes(buf[off..off + 8].try_into().unwrap())
}

fn put_i64(buf: &mut [u8], off: usize, v: i64) {
    buf[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new(2, 32).unwrap()
    }

    #[test]
    fn fresh_header_carries_geometry() {
        let hdr = HeaderBuf::new(layout());

        assert!(hdr.magic_ok());
        assert_eq!(hdr.key_count(), 2);
        assert_eq!(hdr.data_len(), 32);
        assert_eq!(hdr.record_len(), 32 + 16 + 2 * 17);
        assert_eq!(hdr.live_count(), 0);
        assert_eq!(hdr.root(0), 0);
        assert_eq!(hdr.head_seq(), 0);
    }

    #[test]
    fn header_fields_roundtrip() {
        let mut hdr = HeaderBuf::new(layout());

        hdr.set_live_count(41);
        hdr.set_next_number(7);
        hdr.set_root(0, 96);
        hdr.set_root(1, 180);
        hdr.set_head_seq(96);
        hdr.set_head_empty(264);
        hdr.set_head_cpr(348);

        let hdr = HeaderBuf::from_bytes(layout(), hdr.bytes().to_vec());
        assert_eq!(hdr.live_count(), 41);
        assert_eq!(hdr.next_number(), 7);
        assert_eq!(hdr.root(0), 96);
        assert_eq!(hdr.root(1), 180);
        assert_eq!(hdr.head_seq(), 96);
        assert_eq!(hdr.head_empty(), 264);
        assert_eq!(hdr.head_cpr(), 348);
    }

    #[test]
    fn node_accessors_roundtrip() {
        let mut slot = SlotBuf::new_zeroed(layout());

        slot.set_node(0, -1, Link::Child(96), Link::Thread(180));
        slot.set_node(1, 1, Link::Thread(96), Link::Nil);

        assert_eq!(slot.bal(0), -1);
        assert_eq!(slot.left(0), Link::Child(96));
        assert_eq!(slot.right(0), Link::Thread(180));
        assert_eq!(slot.bal(1), 1);
        assert_eq!(slot.left(1), Link::Thread(96));
        assert_eq!(slot.right(1), Link::Nil);
        assert_eq!(slot.kind(), SlotKind::Live);
    }

    #[test]
    fn kind_checks_sentinels_before_balance() {
        let mut slot = SlotBuf::new_zeroed(layout());
        assert_eq!(slot.kind(), SlotKind::Live);

        slot.set_bal(0, CURSOR_TAG);
        assert_eq!(slot.kind(), SlotKind::Cursor);

        slot.set_bal(0, FREE_TAG);
        assert_eq!(slot.kind(), SlotKind::Free);

        slot.set_bal(0, 17);
        assert_eq!(slot.kind(), SlotKind::Unknown);
    }

    #[test]
    fn cursor_init_stamps_pid_and_clears_positions() {
        let mut slot = SlotBuf::new_zeroed(layout());
        slot.set_node(0, 1, Link::Child(96), Link::Child(180));
        slot.set_prev(264);

        slot.init_cursor(4242);

        assert_eq!(slot.kind(), SlotKind::Cursor);
        assert_eq!(slot.pid(), Some(4242));
        assert_eq!(slot.cur_left(0), 0);
        assert_eq!(slot.cur_right(0), 0);
        assert_eq!(slot.prev(), 0);
    }

    #[test]
    fn payload_too_narrow_for_pid() {
        let layout = Layout::new(1, 2).unwrap();
        let mut slot = SlotBuf::new_zeroed(layout);

        slot.stamp_pid(7);
        assert_eq!(slot.pid(), None);
    }

    #[test]
    fn mark_free_tags_every_node() {
        let mut slot = SlotBuf::new_zeroed(layout());
        slot.set_node(0, 1, Link::Child(96), Link::Child(180));
        slot.set_node(1, -1, Link::Child(264), Link::Nil);

        slot.mark_free();

        assert_eq!(slot.kind(), SlotKind::Free);
        assert_eq!(slot.bal(1), FREE_TAG);
        assert_eq!(slot.left(0), Link::Nil);
        assert_eq!(slot.right(1), Link::Nil);
    }
}

//! # Slot Arena and Gate
//!
//! The file is its own arena: every structure is reached through absolute
//! byte offsets, and this module is the only place those offsets meet real
//! I/O. It provides bounded positional reads and writes, the high-water
//! mark that bounds them, file truncation for the compactor, and the
//! advisory byte-range locks that make multi-process access safe.
//!
//! ## High-water mark
//!
//! Other processes append to the file between our operations, so the file
//! length is captured once per operation (when the gate is acquired) and
//! extended locally by our own appends. Any read or write strictly past the
//! mark means a pointer leads outside the file. That is corruption, and
//! corruption is fatal by contract: the process aborts rather than chase a
//! bad offset. Short reads, short writes and I/O errors are treated the same
//! way, since a half-applied mutation leaves the file inconsistent.
//!
//! ## Locks
//!
//! Three distinct uses of POSIX `fcntl` record locks, all advisory:
//!
//! - byte 0, the **gate**: exclusive lock taken for the duration of every
//!   operation, making operations linearizable across processes;
//! - byte 1, the **user lock**: exposed as `lock`/`unlock` for coarse
//!   multi-operation transactions, independent of the gate;
//! - one record-length range per cursor slot, held for the lifetime of the
//!   owning handle so that peers can detect abandonment by probing.
//!
//! The probe (`F_GETLK`) does not report locks held by the probing process
//! itself; cursor-slot reclamation therefore also compares the PID stamped
//! in the slot. Within one process that PID check is what protects sibling
//! handles' cursors. Against PID reuse across reboots or long uptimes the
//! scheme is inherently racy; that limitation is documented, not fixed.
//!
//! Record locks do not exclude threads of their own process, which is why
//! the public handle serialises threads with a `parking_lot::Mutex` around
//! everything done here.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{Result, WrapErr};

use crate::emsg;
use crate::layout::Layout;
use crate::slot::{HeaderBuf, SlotBuf};

/// Byte locked by the gate.
const GATE_BYTE: i64 = 0;
/// Byte locked by the user-visible lock/unlock pair.
const USER_BYTE: i64 = 1;

pub(crate) struct Arena {
    file: File,
    lim: u64,
}

impl Arena {
    /// Opens (creating if necessary) the backing file. The high-water mark
    /// starts at the current length and is refreshed on each gate
    /// acquisition.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("20 open failed: '{}'", path.display()))?;

        let lim = file
            .metadata()
            .wrap_err_with(|| format!("20 open failed: '{}'", path.display()))?
            .len();

        Ok(Self { file, lim })
    }

    /// Current high-water mark: one past the last byte this operation may
    /// read, and the position where an append lands.
    pub fn end(&self) -> u64 {
        self.lim
    }

    pub fn read_at(&self, pos: u64, buf: &mut [u8]) {
        if pos > self.lim {
            emsg::fatal("10 corrupted file, seek pos past end");
        }
        if self.file.read_exact_at(buf, pos).is_err() {
            emsg::fatal("12 read failed");
        }
    }

    pub fn write_at(&mut self, pos: u64, buf: &[u8]) {
        if pos > self.lim {
            emsg::fatal("13 corrupted file, seek pos past end");
        }
        if self.file.write_all_at(buf, pos).is_err() {
            emsg::fatal("15 write failed");
        }
        let end = pos + buf.len() as u64;
        if end > self.lim {
            self.lim = end;
        }
    }

    /// Shortens the file. Failure is reported to the caller (the compactor
    /// records a diagnostic and stops) rather than aborting: nothing has
    /// been half-written at this point.
    pub fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)?;
        self.lim = len;
        Ok(())
    }

    pub fn read_header(&self, layout: Layout) -> HeaderBuf {
        let mut buf = vec![0u8; layout.header_len() as usize];
        self.read_at(0, &mut buf);
        HeaderBuf::from_bytes(layout, buf)
    }

    pub fn write_header(&mut self, hdr: &HeaderBuf) {
        self.write_at(0, hdr.bytes());
    }

    pub fn read_slot(&self, layout: Layout, off: u64) -> SlotBuf {
        let mut buf = vec![0u8; layout.record_len()];
        self.read_at(off, &mut buf);
        SlotBuf::from_bytes(layout, buf)
    }

    pub fn write_slot(&mut self, off: u64, slot: &SlotBuf) {
        self.write_at(off, slot.bytes());
    }

    // ----- advisory locks ---------------------------------------------

    /// Acquires the gate and refreshes the high-water mark. Blocks while
    /// another process holds the gate.
    pub fn gate_lock(&mut self) {
        self.lock_range(GATE_BYTE as u64, 1);
        match self.file.metadata() {
            Ok(meta) => self.lim = meta.len(),
            Err(_) => emsg::fatal("12 read failed"),
        }
    }

    pub fn gate_unlock(&self) {
        self.unlock_range(GATE_BYTE as u64, 1);
    }

    pub fn user_lock(&self) {
        self.lock_range(USER_BYTE as u64, 1);
    }

    pub fn user_unlock(&self) {
        self.unlock_range(USER_BYTE as u64, 1);
    }

    /// Blocking exclusive lock on `[start, start+len)`.
    pub fn lock_range(&self, start: u64, len: u64) {
        loop {
            match self.fcntl(libc::F_SETLKW, libc::F_WRLCK, start, len) {
                Ok(()) => return,
                Err(libc::EINTR) => continue,
                Err(_) => emsg::fatal("16 record lock failed"),
            }
        }
    }

    pub fn unlock_range(&self, start: u64, len: u64) {
        if self.fcntl(libc::F_SETLK, libc::F_UNLCK, start, len).is_err() {
            emsg::fatal("17 record unlock failed");
        }
    }

    /// Whether `[start, start+len)` could be locked right now. Does not
    /// report locks held by this process.
    pub fn range_is_unlocked(&self, start: u64, len: u64) -> bool {
        let mut lk = Self::flock(libc::F_WRLCK, start, len);
        // SAFETY: fd is valid for the lifetime of self; lk is a properly
        // initialized flock struct the kernel only writes into.
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_GETLK, &mut lk) };
        if rc != 0 {
            emsg::fatal("18 record lock probe failed");
        }
        lk.l_type == libc::F_UNLCK as libc::c_short
    }

    fn fcntl(
        &self,
        op: libc::c_int,
        kind: libc::c_int,
        start: u64,
        len: u64,
    ) -> std::result::Result<(), libc::c_int> {
        let lk = Self::flock(kind, start, len);
        // SAFETY: fd is valid for the lifetime of self; lk outlives the call.
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), op, &lk) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
        }
    }

    fn flock(kind: libc::c_int, start: u64, len: u64) -> libc::flock {
        // SAFETY: flock is a plain C struct; all-zeroes is a valid value and
        // the fields we care about are set below.
        let mut lk: libc::flock = unsafe { std::mem::zeroed() };
        lk.l_type = kind as libc::c_short;
        lk.l_whence = libc::SEEK_SET as libc::c_short;
        lk.l_start = start as libc::off_t;
        lk.l_len = len as libc::off_t;
        lk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_arena() -> (tempfile::TempDir, Arena) {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::open(&dir.path().join("t.avl")).unwrap();
        (dir, arena)
    }

    #[test]
    fn append_extends_high_water_mark() {
        let (_dir, mut arena) = scratch_arena();
        assert_eq!(arena.end(), 0);

        arena.write_at(0, &[1, 2, 3, 4]);
        assert_eq!(arena.end(), 4);

        arena.write_at(4, &[5, 6]);
        assert_eq!(arena.end(), 6);

        let mut buf = [0u8; 6];
        arena.read_at(0, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn overwrite_keeps_high_water_mark() {
        let (_dir, mut arena) = scratch_arena();
        arena.write_at(0, &[0u8; 32]);

        arena.write_at(8, &[7u8; 8]);
        assert_eq!(arena.end(), 32);
    }

    #[test]
    fn truncate_moves_mark_down() {
        let (_dir, mut arena) = scratch_arena();
        arena.write_at(0, &[0u8; 64]);

        arena.truncate(16).unwrap();
        assert_eq!(arena.end(), 16);
    }

    #[test]
    fn gate_refreshes_mark_from_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.avl");
        let mut a = Arena::open(&path).unwrap();
        let mut b = Arena::open(&path).unwrap();

        a.write_at(0, &[9u8; 48]);
        assert_eq!(b.end(), 0);

        b.gate_lock();
        assert_eq!(b.end(), 48);
        b.gate_unlock();
    }

    #[test]
    fn lock_probe_ignores_own_locks() {
        // F_GETLK never reports the caller's own locks, which is exactly
        // what the cursor reclamation logic assumes.
        let (_dir, mut arena) = scratch_arena();
        arena.write_at(0, &[0u8; 64]);

        arena.lock_range(16, 8);
        assert!(arena.range_is_unlocked(16, 8));
        arena.unlock_range(16, 8);
    }
}

//! # Numbered Diagnostics
//!
//! Every failure an avlfile operation can report carries a short numbered
//! message ("22 stored record length mismatch"). Non-fatal conditions record
//! the message here and surface through the operation's return value; fatal
//! corruption records the message and aborts the process, because an
//! interrupted or inconsistent file is beyond the library's ability to
//! reason about.
//!
//! The channel is a thread-local slot rather than a process-global, so
//! concurrent handles on different threads cannot clobber each other's
//! diagnostics. [`last_error`] returns the most recent message recorded on
//! the calling thread.

use std::cell::RefCell;

thread_local! {
    static LAST: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Records a numbered diagnostic for the calling thread.
pub(crate) fn set(msg: &str) {
    LAST.with(|slot| *slot.borrow_mut() = Some(msg.to_string()));
}

/// Clears the calling thread's diagnostic.
pub(crate) fn clear() {
    LAST.with(|slot| *slot.borrow_mut() = None);
}

/// The most recent numbered diagnostic recorded on the calling thread, if
/// any. Reset by [`crate::AvlFile::open`].
pub fn last_error() -> Option<String> {
    LAST.with(|slot| slot.borrow().clone())
}

/// Unrecoverable corruption: record the diagnostic and abort. The file is
/// assumed inconsistent past the point of repair, and continuing would turn
/// one bad pointer into arbitrary damage.
pub(crate) fn fatal(msg: &str) -> ! {
    set(msg);
    tracing::error!(target: "avlfile", "{msg}");
    eprintln!("avlfile: fatal: {msg}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_read_back() {
        clear();
        assert_eq!(last_error(), None);

        set("70 the key index is out of bounds");
        assert_eq!(
            last_error().as_deref(),
            Some("70 the key index is out of bounds")
        );

        clear();
        assert_eq!(last_error(), None);
    }

    #[test]
    fn diagnostics_are_thread_local() {
        set("30 record count limit reached");

        std::thread::spawn(|| {
            assert_eq!(last_error(), None);
            set("40 not in the tree");
        })
        .join()
        .unwrap();

        assert_eq!(last_error().as_deref(), Some("30 record count limit reached"));
    }
}

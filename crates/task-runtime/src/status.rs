// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task status word: a single atomic machine word packing
//! `{innermost_status_record, is_cancelled, is_locked}` into the low two
//! tag bits plus a pointer. [`StatusRecordHeader`] is the chaining contract
//! concrete status record types (`ChildTaskStatusRecord`, `TaskGroupRecord`,
//! `CancellationHandlerRecord`, ...) embed as their first field; this core
//! only implements the chain itself, not those concrete variants.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::loom::sync::atomic::AtomicUsize;

const CANCELLED_BIT: usize = 0b01;
const LOCKED_BIT: usize = 0b10;
const TAG_MASK: usize = 0b11;
const PTR_MASK: usize = !TAG_MASK;

/// A node in the singly linked status record chain, anchored at a task's
/// [`StatusWord`]. Concrete record types embed this as their first
/// `#[repr(C)]` field so that a `NonNull<ConcreteRecord>` can be reinterpreted
/// as a `NonNull<StatusRecordHeader>`.
#[repr(C)]
#[derive(Debug)]
pub struct StatusRecordHeader {
    parent: Option<NonNull<StatusRecordHeader>>,
}

impl StatusRecordHeader {
    #[must_use]
    pub const fn new() -> Self {
        Self { parent: None }
    }

    /// The next-older record in the chain.
    #[must_use]
    pub fn parent(&self) -> Option<NonNull<StatusRecordHeader>> {
        self.parent
    }
}

impl Default for StatusRecordHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded snapshot of a task's status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord {
    bits: usize,
}

impl StatusWord {
    const fn from_bits(bits: usize) -> Self {
        Self { bits }
    }

    #[must_use]
    pub fn innermost_record(self) -> Option<NonNull<StatusRecordHeader>> {
        NonNull::new((self.bits & PTR_MASK) as *mut StatusRecordHeader)
    }

    #[must_use]
    pub fn is_cancelled(self) -> bool {
        self.bits & CANCELLED_BIT != 0
    }

    #[must_use]
    pub fn is_locked(self) -> bool {
        self.bits & LOCKED_BIT != 0
    }

    fn with_innermost_record(self, record: Option<NonNull<StatusRecordHeader>>) -> Self {
        let ptr_bits = record.map_or(0, |r| r.as_ptr() as usize);
        debug_assert_eq!(ptr_bits & TAG_MASK, 0, "status records must be 4-byte aligned");
        Self::from_bits((self.bits & TAG_MASK) | ptr_bits)
    }

    fn with_cancelled(self, cancelled: bool) -> Self {
        if cancelled {
            Self::from_bits(self.bits | CANCELLED_BIT)
        } else {
            Self::from_bits(self.bits & !CANCELLED_BIT)
        }
    }

    fn with_locked(self, locked: bool) -> Self {
        if locked {
            Self::from_bits(self.bits | LOCKED_BIT)
        } else {
            Self::from_bits(self.bits & !LOCKED_BIT)
        }
    }

    fn into_bits(self) -> usize {
        self.bits
    }
}

/// The atomic cell embedded in every `AsyncTask`.
#[derive(Debug)]
pub struct AtomicStatusWord(AtomicUsize);

impl AtomicStatusWord {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Relaxed load. Sufficient for a task to observe its own cancellation
    /// flag; racy with respect to the chain pointer.
    #[must_use]
    pub fn load_relaxed(&self) -> StatusWord {
        StatusWord::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Acquires the lock bit via CAS spin, runs `f` against a local
    /// snapshot, then CAS's the lock back off, writing back `f`'s updated
    /// chain pointer and OR-ing in any newly-set cancellation bit
    /// (cancellation may only transition false to true, so only this
    /// function mutates the word under lock).
    ///
    /// The acquire on lock-take and release on lock-release pairing ensures
    /// pushing a cancellation record happens-before any observation of that
    /// record under a later lock acquisition.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut LockedStatus) -> R) -> R {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let word = StatusWord::from_bits(current);
            if word.is_locked() {
                core::hint::spin_loop();
                current = self.0.load(Ordering::Relaxed);
                continue;
            }
            match self.0.compare_exchange(
                current,
                word.with_locked(true).into_bits(),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let mut locked = LockedStatus { word };
        let result = f(&mut locked);

        // `locked.word` holds whatever chain pointer / cancelled bit `f` left
        // behind; only the lock holder may ever write this word, so there is
        // no concurrent writer to race against here.
        self.0
            .store(locked.word.with_locked(false).into_bits(), Ordering::Release);
        result
    }

    /// Sets the cancellation bit. Idempotent: calling this a second time has
    /// no further effect.
    pub fn cancel(&self) {
        let was_cancelled = self.with_locked(|status| {
            let was = status.is_cancelled();
            status.set_cancelled();
            was
        });
        if was_cancelled {
            tracing::trace!("status word already cancelled");
        } else {
            tracing::trace!("status word cancelled");
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.load_relaxed().is_cancelled()
    }
}

impl Default for AtomicStatusWord {
    fn default() -> Self {
        Self::new()
    }
}

/// A status word snapshot held under the lock bit, handed to the closure
/// passed to [`AtomicStatusWord::with_locked`].
pub struct LockedStatus {
    word: StatusWord,
}

impl LockedStatus {
    #[must_use]
    pub fn innermost_record(&self) -> Option<NonNull<StatusRecordHeader>> {
        self.word.innermost_record()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.word.is_cancelled()
    }

    pub fn set_cancelled(&mut self) {
        self.word = self.word.with_cancelled(true);
    }

    /// Pushes `record` onto the chain. `record.parent` must not already be
    /// linked into any chain (LIFO discipline).
    ///
    /// # Safety
    ///
    /// `record` must point to a live `StatusRecordHeader` that outlives its
    /// time on the chain.
    pub unsafe fn push(&mut self, mut record: NonNull<StatusRecordHeader>) {
        // Safety: caller guarantees `record` is live and exclusively ours to
        // link while we hold the lock.
        unsafe {
            record.as_mut().parent = self.word.innermost_record();
        }
        self.word = self.word.with_innermost_record(Some(record));
        tracing::trace!(record = ?record, "status record pushed");
    }

    /// Pops the innermost record, which must be `expect`: violating LIFO
    /// order is a programmer error.
    ///
    /// # Safety
    ///
    /// `expect` must point to a live `StatusRecordHeader`.
    pub unsafe fn pop(&mut self, expect: NonNull<StatusRecordHeader>) {
        assert_eq!(
            self.word.innermost_record(),
            Some(expect),
            "status record popped out of LIFO order"
        );
        // Safety: `expect` is the record we just asserted is the innermost,
        // and the caller guarantees it is live.
        let parent = unsafe { expect.as_ref().parent() };
        self.word = self.word.with_innermost_record(parent);
        tracing::trace!(record = ?expect, "status record popped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    #[test]
    fn cancel_is_sticky_and_idempotent() {
        let status = AtomicStatusWord::new();
        assert!(!status.is_cancelled());
        status.cancel();
        assert!(status.is_cancelled());
        status.cancel();
        assert!(status.is_cancelled());
    }

    #[test]
    fn push_pop_lifo() {
        let status = AtomicStatusWord::new();
        let mut a = StatusRecordHeader::new();
        let mut b = StatusRecordHeader::new();
        let a_ptr = NonNull::from(&mut a);
        let b_ptr = NonNull::from(&mut b);

        status.with_locked(|s| unsafe { s.push(a_ptr) });
        status.with_locked(|s| unsafe { s.push(b_ptr) });
        assert_eq!(status.load_relaxed().innermost_record(), Some(b_ptr));

        status.with_locked(|s| unsafe { s.pop(b_ptr) });
        assert_eq!(status.load_relaxed().innermost_record(), Some(a_ptr));
        status.with_locked(|s| unsafe { s.pop(a_ptr) });
        assert_eq!(status.load_relaxed().innermost_record(), None);
    }

    #[test]
    #[should_panic(expected = "LIFO order")]
    fn pop_out_of_order_panics() {
        let status = AtomicStatusWord::new();
        let mut a = StatusRecordHeader::new();
        let mut b = StatusRecordHeader::new();
        let a_ptr = NonNull::from(&mut a);
        let b_ptr = NonNull::from(&mut b);
        status.with_locked(|s| unsafe { s.push(a_ptr) });
        status.with_locked(|s| unsafe { s.push(b_ptr) });
        status.with_locked(|s| unsafe { s.pop(a_ptr) });
    }

    #[test]
    fn loom_concurrent_cancel_and_push_are_mutually_exclusive() {
        crate::loom::model(|| {
            let status = crate::loom::sync::Arc::new(AtomicStatusWord::new());
            let record: &'static mut StatusRecordHeader = Box::leak(Box::new(StatusRecordHeader::new()));
            let record_ptr = NonNull::from(record);

            let status2 = crate::loom::sync::Arc::clone(&status);
            let pusher = crate::loom::thread::spawn(move || {
                status2.with_locked(|s| unsafe { s.push(record_ptr) });
            });

            status.cancel();

            pusher.join().unwrap();

            // Whichever order the lock serialized the two critical sections
            // in, both effects must be visible afterward: the lock bit
            // guarantees no lost update between `cancel` and `push`.
            assert!(status.is_cancelled());
            assert_eq!(status.load_relaxed().innermost_record(), Some(record_ptr));
        });
    }

    #[test]
    fn loom_two_threads_racing_cancel_sets_it_exactly_once_observably() {
        crate::loom::model(|| {
            let status = crate::loom::sync::Arc::new(AtomicStatusWord::new());
            let status2 = crate::loom::sync::Arc::clone(&status);

            let t1 = crate::loom::thread::spawn(move || status2.cancel());
            status.cancel();
            t1.join().unwrap();

            assert!(status.is_cancelled());
        });
    }
}

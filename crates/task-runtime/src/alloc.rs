// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task-local bump allocator: a stack allocator whose arenas are a
//! task's contexts and local-value frames. Its entire state fits in the
//! four machine words of `AsyncTask::allocator_private`; growth beyond that
//! inline state is a chain of heap blocks, each remembering where its
//! predecessor's cursor was so that popping the chain is itself just
//! another LIFO operation.

use core::alloc::Layout;
use core::ptr::NonNull;

/// Default size, in bytes, of a freshly grown allocator block. Chosen to
/// comfortably hold a handful of `AsyncContext`s and local-value frames
/// without immediately growing again.
const DEFAULT_BLOCK_SIZE: usize = 1024;

#[repr(C)]
struct BlockHeader {
    /// The block this one was grown from, or `None` at the root block.
    prev: Option<NonNull<BlockHeader>>,
    /// Where `cursor`/`end` pointed in the predecessor block at the moment
    /// this block was created; restored when this block is fully popped.
    prev_cursor: *mut u8,
    prev_end: *mut u8,
    layout: Layout,
}

/// Overlays exactly the four machine words of
/// `AsyncTask::allocator_private`. A task's allocator is only ever touched
/// by the task itself, single-threaded cooperative from the perspective of
/// any one task, so no synchronization is needed here.
#[repr(C)]
pub struct TaskAllocator {
    current_block: Option<NonNull<BlockHeader>>,
    cursor: *mut u8,
    end: *mut u8,
    _reserved: usize,
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<TaskAllocator>(),
    4 * core::mem::size_of::<usize>()
);

impl TaskAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current_block: None,
            cursor: core::ptr::null_mut(),
            end: core::ptr::null_mut(),
            _reserved: 0,
        }
    }

    fn bump(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let cursor = self.cursor as usize;
        let aligned = cursor.checked_add(layout.align() - 1)? & !(layout.align() - 1);
        let new_cursor = aligned.checked_add(layout.size())?;
        if new_cursor > self.end as usize {
            return None;
        }
        self.cursor = new_cursor as *mut u8;
        NonNull::new(aligned as *mut u8)
    }

    fn grow(&mut self, layout: Layout) {
        let header_layout = Layout::new::<BlockHeader>();
        let (combined, body_offset) = header_layout
            .extend(layout)
            .expect("task allocator block layout overflow");
        let block_size = combined.size().max(DEFAULT_BLOCK_SIZE);
        let block_layout = Layout::from_size_align(block_size, combined.align())
            .expect("task allocator block layout overflow")
            .pad_to_align();

        // Safety: `block_layout` has non-zero size (it contains at least a
        // `BlockHeader`).
        let raw = unsafe { alloc::alloc::alloc(block_layout) };
        let Some(raw) = NonNull::new(raw) else {
            alloc::alloc::handle_alloc_error(block_layout);
        };

        let header = raw.cast::<BlockHeader>();
        // Safety: `raw` is freshly allocated for exactly this layout.
        unsafe {
            header.write(BlockHeader {
                prev: self.current_block,
                prev_cursor: self.cursor,
                prev_end: self.end,
                layout: block_layout,
            });
        }

        // Safety: `raw` has at least `block_layout.size()` bytes, of which
        // `body_offset..` is reserved for the bump region by construction.
        let body_start = unsafe { raw.as_ptr().add(body_offset) };
        self.current_block = Some(header);
        self.cursor = body_start;
        self.end = unsafe { raw.as_ptr().add(block_layout.size()) };
    }

    /// Allocates `layout`-shaped storage from this task's allocator chain,
    /// growing it with a fresh block if necessary.
    ///
    /// # Panics
    ///
    /// Panics (via `handle_alloc_error`) if the global allocator is
    /// exhausted: arena/task allocation failure is fatal.
    pub fn alloc(&mut self, layout: Layout) -> NonNull<u8> {
        if let Some(ptr) = self.bump(layout) {
            return ptr;
        }
        self.grow(layout);
        self.bump(layout).expect("freshly grown block must fit the requested layout")
    }

    /// Releases the most recently allocated region back to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must be the pointer most recently returned by [`Self::alloc`]
    /// and not yet deallocated: this allocator only supports strict LIFO
    /// release.
    pub unsafe fn dealloc(&mut self, ptr: NonNull<u8>) {
        loop {
            let Some(block) = self.current_block else {
                panic!("task allocator dealloc with no active block");
            };
            // Safety: `block` is the live current block.
            let header_start = block.as_ptr() as *mut u8;
            let block_layout = unsafe { block.as_ref().layout };
            let block_end = unsafe { header_start.add(block_layout.size()) };
            debug_assert_eq!(block_end, self.end);

            if (ptr.as_ptr() as usize) >= header_start as usize
                && (ptr.as_ptr() as usize) < self.end as usize
            {
                self.cursor = ptr.as_ptr();
                return;
            }

            // `ptr` is not in the current block: it must belong to a
            // predecessor, which means this block has been fully drained.
            // Safety: `block` is live and was pushed by `grow`.
            let (prev, prev_cursor, prev_end) = unsafe {
                let b = block.as_ref();
                (b.prev, b.prev_cursor, b.prev_end)
            };
            // Safety: `block` was allocated with `block_layout` and is not
            // referenced after this point.
            unsafe { alloc::alloc::dealloc(header_start, block_layout) };
            self.current_block = prev;
            self.cursor = prev_cursor;
            self.end = prev_end;
        }
    }
}

impl Default for TaskAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskAllocator {
    fn drop(&mut self) {
        let mut block = self.current_block;
        while let Some(b) = block {
            // Safety: every block in the chain was allocated by `grow` and
            // is dropped here exactly once, in predecessor order.
            unsafe {
                let header = b.as_ref();
                let prev = header.prev;
                let layout = header.layout;
                alloc::alloc::dealloc(b.as_ptr().cast::<u8>(), layout);
                block = prev;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_then_release_lifo() {
        let mut a = TaskAllocator::new();
        let layout = Layout::new::<u64>();
        let p1 = a.alloc(layout);
        let p2 = a.alloc(layout);
        assert_ne!(p1, p2);
        // Safety: `p2` was the most recent allocation.
        unsafe { a.dealloc(p2) };
        // Safety: `p1` is now the most recent allocation.
        unsafe { a.dealloc(p1) };
    }

    #[test]
    fn grows_across_blocks() {
        let mut a = TaskAllocator::new();
        let layout = Layout::from_size_align(DEFAULT_BLOCK_SIZE, 8).unwrap();
        let first = a.alloc(layout);
        let second = a.alloc(layout);
        assert_ne!(first, second);
        // Safety: LIFO order.
        unsafe {
            a.dealloc(second);
            a.dealloc(first);
        }
    }
}

// src/promise/stack.rs
//! Lock-free intrusive stacks for waiters and listeners
//!
//! Each promise keeps two of these: one for parked threads, one for pending
//! callbacks. Pushes are CAS-published Treiber pushes. Completion swaps the
//! head for a dangling sentinel; the swapping thread owns the whole list,
//! reverses it back to insertion order and processes it. Pushes that observe
//! the sentinel hand the entry back so the caller can act as if the list had
//! already been drained.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<E> {
    entry: E,
    next: *mut Node<E>,
}

/// Treiber stack with a one-shot drain.
///
/// Nodes are owned by the stack: they are freed by the drain that removes
/// them or by `Drop` if the stack is never drained.
pub(crate) struct DrainStack<E> {
    head: AtomicPtr<Node<E>>,
}

// The raw head is only ever dereferenced by the thread that won the swap
// or by `Drop`, both of which have exclusive ownership of the chain.
unsafe impl<E: Send> Send for DrainStack<E> {}
unsafe impl<E: Send> Sync for DrainStack<E> {}

impl<E> DrainStack<E> {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Dangling marker for the drained state; compared, never dereferenced.
    fn sentinel() -> *mut Node<E> {
        1usize as *mut Node<E>
    }

    /// True once the stack has been drained
    pub(crate) fn is_drained(&self) -> bool {
        self.head.load(Ordering::Acquire) == Self::sentinel()
    }

    /// Publish an entry; hands it back if the stack was already drained.
    pub(crate) fn push(&self, entry: E) -> Result<(), E> {
        let node = Box::into_raw(Box::new(Node {
            entry,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == Self::sentinel() {
                let reclaimed = unsafe { Box::from_raw(node) };
                return Err(reclaimed.entry);
            }
            unsafe {
                (*node).next = head;
            }
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(observed) => head = observed,
            }
        }
    }

    /// Swap in the sentinel and take every entry, oldest first.
    ///
    /// At most one call observes a non-empty list; later calls get nothing.
    pub(crate) fn drain(&self) -> Vec<E> {
        let mut cursor = self.head.swap(Self::sentinel(), Ordering::AcqRel);
        if cursor == Self::sentinel() {
            return Vec::new();
        }
        let mut entries = Vec::new();
        while !cursor.is_null() {
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next;
            entries.push(node.entry);
        }
        // LIFO chain back to FIFO of insertion.
        entries.reverse();
        entries
    }
}

impl<E> Drop for DrainStack<E> {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        if cursor == Self::sentinel() {
            return;
        }
        while !cursor.is_null() {
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next;
        }
    }
}

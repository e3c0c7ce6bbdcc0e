//! Lock-free LIFO stack (Treiber stack) with a self-linked terminal node.
//!
//! The stack always ends in a sentinel node whose `next` points back at itself.
//! Popping swaps `head` for `head.next`, so a pop that observes the sentinel
//! swaps the sentinel for itself: the compare trivially succeeds, the caller
//! gets `None`, and any number of threads may race on an empty stack without
//! disturbing it.
//!
//! Both `push` and `pop` retry their compare-and-swap without bound. Under
//! normal contention a retry is rare; under pathological contention a thread
//! can spin for a long time. If that shows up in profiles, add backoff here
//! or stripe the free list instead of bounding the loop.
//!
//! Popped nodes are retired through `crossbeam_epoch`, so a thread that read a
//! node just before it was popped can still follow its `next` pointer safely,
//! and a node address is never reused while any reader may hold it.

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Node<T> {
    /// Uninitialized only for the sentinel.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

pub struct LockFreeStack<T> {
    head: Atomic<Node<T>>,
    sentinel: Atomic<Node<T>>,
    len: AtomicUsize,
}

// Values are moved in and out, never shared by reference, so `T: Send` is enough.
unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> LockFreeStack<T> {
    pub fn new() -> Self {
        let sentinel = Atomic::new(Node {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        });

        // SAFETY: the stack is not shared yet, nothing else can observe these pointers.
        unsafe {
            let guard = epoch::unprotected();
            let shared = sentinel.load(Ordering::Relaxed, guard);
            shared.deref().next.store(shared, Ordering::Relaxed);
        }

        Self {
            head: sentinel.clone(),
            sentinel,
            len: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let mut node = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        });

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            node.next.store(head, Ordering::Relaxed);

            match self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire, &guard)
            {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                // Head moved under us: take the node back and relink it.
                Err(e) => node = e.new,
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        let sentinel = self.sentinel.load(Ordering::Relaxed, &guard);

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            // SAFETY: head is never null (it is a live node or the sentinel) and the
            // guard keeps it from being reclaimed while we look at it.
            let node = unsafe { head.deref() };
            let next = node.next.load(Ordering::Acquire, &guard);

            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_err()
            {
                continue;
            }

            if head == sentinel {
                return None;
            }

            self.len.fetch_sub(1, Ordering::Relaxed);
            // SAFETY: the successful swap unlinked `head`, so this thread is the only
            // one that will ever read its value. The node itself stays allocated
            // until every thread pinned at this point has moved on.
            unsafe {
                let value = ptr::read(node.value.as_ptr());
                guard.defer_destroy(head);
                return Some(value);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::Acquire, &guard) == self.sentinel.load(Ordering::Relaxed, &guard)
    }

    /// Approximate under concurrent use; exact when quiescent.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread holds a reference to the stack.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = self.sentinel.load(Ordering::Relaxed, guard);
            let mut current: Shared<'_, Node<T>> = self.head.load(Ordering::Relaxed, guard);

            while current != sentinel {
                let next = current.deref().next.load(Ordering::Relaxed, guard);
                let mut owned = current.into_owned();
                owned.value.assume_init_drop();
                current = next;
            }

            drop(sentinel.into_owned());
        }
    }
}

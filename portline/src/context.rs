//! Operation contexts and the pool they are drawn from.
//!
//! Every asynchronous connect, receive or send is described by one
//! [`OpContext`] sitting in a [`ContextPool`] slot. A slot moves through
//! three states:
//!
//! ```text
//! FREE --acquire--> HELD --detach--> POSTED --reclaim--> HELD --release--> FREE
//! ```
//!
//! `HELD` slots are owned by exactly one [`ContextHandle`]; `POSTED` slots
//! are owned by the I/O backend and identified only by their [`UserData`]
//! token. Handles are not `Clone`, so a context can be released at most once,
//! and the generation stored in each token makes a late or duplicated token
//! fail to reclaim anything.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam_queue::ArrayQueue;

use crate::completion::{OpTag, UserData};
use crate::metrics;
use crate::registry::ClientId;

const FREE: u8 = 0;
const HELD: u8 = 1;
const POSTED: u8 = 2;

/// Description of one in-flight asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpContext {
    /// Connect attempt against address candidate `attempt`.
    Connect { owner: ClientId, attempt: u32 },
    /// Receive into the owner's receive buffer.
    Recv { owner: ClientId },
    /// Send of `len` bytes from the owner's send buffer, `offset` of which
    /// have already been written by earlier short sends.
    Send {
        owner: ClientId,
        offset: u32,
        len: u32,
    },
}

impl OpContext {
    pub fn kind(&self) -> OpTag {
        match self {
            OpContext::Connect { .. } => OpTag::Connect,
            OpContext::Recv { .. } => OpTag::Recv,
            OpContext::Send { .. } => OpTag::Send,
        }
    }

    /// The client that issued this operation.
    pub fn owner(&self) -> ClientId {
        match *self {
            OpContext::Connect { owner, .. }
            | OpContext::Recv { owner }
            | OpContext::Send { owner, .. } => owner,
        }
    }
}

/// Exclusive ownership of a `HELD` pool slot.
///
/// Must be handed back through [`ContextPool::release`] or
/// [`ContextPool::detach`].
#[must_use = "a context handle must be released or detached"]
#[derive(Debug)]
pub struct ContextHandle {
    slot: u32,
    generation: u32,
    kind: OpTag,
}

impl ContextHandle {
    /// The token a backend reports this operation's completion with.
    pub fn token(&self) -> UserData {
        UserData::encode(self.kind, self.slot, self.generation)
    }

    pub fn kind(&self) -> OpTag {
        self.kind
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(false, "operation context {} leaked", self.slot);
        }
    }
}

struct Slot {
    state: AtomicU8,
    generation: AtomicU32,
    ctx: Mutex<Option<OpContext>>,
}

/// Fixed-capacity, thread-safe pool of operation contexts.
///
/// Acquire and release are safe from any thread without external locking;
/// the free list is a lock-free bounded queue.
pub struct ContextPool {
    slots: Box<[Slot]>,
    free: ArrayQueue<u32>,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl ContextPool {
    /// Create a pool with `capacity` slots.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "context pool capacity must be > 0");
        let slots = (0..capacity)
            .map(|_| Slot {
                state: AtomicU8::new(FREE),
                generation: AtomicU32::new(0),
                ctx: Mutex::new(None),
            })
            .collect();
        let free = ArrayQueue::new(capacity as usize);
        for idx in 0..capacity {
            let _ = free.push(idx);
        }
        ContextPool {
            slots,
            free,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Take a free slot and initialise it with `ctx`.
    /// Returns `None` if every slot is in use.
    pub fn acquire(&self, ctx: OpContext) -> Option<ContextHandle> {
        let Some(slot) = self.free.pop() else {
            metrics::CONTEXT_POOL_EXHAUSTED.increment();
            return None;
        };
        let s = &self.slots[slot as usize];
        *s.ctx.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
        let prev = s.state.swap(HELD, Ordering::AcqRel);
        debug_assert_eq!(prev, FREE, "free list handed out a busy slot");
        self.acquired.fetch_add(1, Ordering::Relaxed);
        metrics::CONTEXTS_IN_USE.increment();
        Some(ContextHandle {
            slot,
            generation: s.generation.load(Ordering::Acquire),
            kind: ctx.kind(),
        })
    }

    /// Read the context a handle refers to.
    pub fn context(&self, handle: &ContextHandle) -> OpContext {
        let s = &self.slots[handle.slot as usize];
        let ctx = *s.ctx.lock().unwrap_or_else(PoisonError::into_inner);
        match ctx {
            Some(ctx) => ctx,
            None => unreachable!("held context slot {} is empty", handle.slot),
        }
    }

    /// Replace the context of a held slot. The operation kind cannot change.
    pub fn update(&self, handle: &ContextHandle, ctx: OpContext) {
        debug_assert_eq!(handle.kind, ctx.kind(), "context kind changed");
        let s = &self.slots[handle.slot as usize];
        *s.ctx.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
    }

    /// Hand the slot over to the I/O backend and return the token to post
    /// the operation with. Must happen before the operation is submitted,
    /// since its completion may be dispatched on another thread at once.
    pub fn detach(&self, handle: ContextHandle) -> UserData {
        let token = handle.token();
        let s = &self.slots[handle.slot as usize];
        let moved = s
            .state
            .compare_exchange(HELD, POSTED, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(moved.is_ok(), "detaching a slot that is not held");
        std::mem::forget(handle);
        token
    }

    /// Take back ownership of a posted slot from its completion token.
    ///
    /// Returns `None` for tokens that are malformed, stale (the slot has been
    /// released and reused since), or already reclaimed.
    pub fn reclaim(&self, token: UserData) -> Option<ContextHandle> {
        let kind = token.tag()?;
        let s = self.slots.get(token.slot() as usize)?;
        if s.generation.load(Ordering::Acquire) != token.generation() {
            return None;
        }
        s.state
            .compare_exchange(POSTED, HELD, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        if s.generation.load(Ordering::Acquire) != token.generation() {
            // Slot was recycled between the checks; the token is stale.
            s.state.store(POSTED, Ordering::Release);
            return None;
        }
        let handle = ContextHandle {
            slot: token.slot(),
            generation: token.generation(),
            kind,
        };
        if self.context(&handle).kind() != kind {
            // Tag does not match the slot's operation; put it back untouched.
            s.state.store(POSTED, Ordering::Release);
            std::mem::forget(handle);
            return None;
        }
        Some(handle)
    }

    /// Return a slot to the pool. Tokens issued for it become stale.
    pub fn release(&self, handle: ContextHandle) {
        let s = &self.slots[handle.slot as usize];
        *s.ctx.lock().unwrap_or_else(PoisonError::into_inner) = None;
        s.generation.fetch_add(1, Ordering::AcqRel);
        let prev = s.state.swap(FREE, Ordering::AcqRel);
        debug_assert_eq!(prev, HELD, "releasing a slot that is not held");
        let slot = handle.slot;
        std::mem::forget(handle);
        let pushed = self.free.push(slot);
        debug_assert!(pushed.is_ok(), "context free list overflow");
        self.released.fetch_add(1, Ordering::Relaxed);
        metrics::CONTEXTS_IN_USE.decrement();
    }

    /// Number of slots currently held or posted.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total successful acquisitions since creation.
    pub fn acquired_total(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Total releases since creation.
    pub fn released_total(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

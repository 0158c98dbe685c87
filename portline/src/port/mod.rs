//! The completion mechanism clients post their operations to.
//!
//! A [`CompletionPort`] accepts connect, receive and send operations tagged
//! with a [`UserData`] token and later reports each one as a
//! [`CompletionEvent`](crate::CompletionEvent), from whatever thread the
//! backend chooses. [`UringPort`] is the io_uring implementation; anything
//! else that can honour the contract below (a readiness reactor, a scripted
//! test double) can be injected instead.

#[cfg(target_os = "linux")]
pub mod uring;

use std::io;
use std::os::fd::RawFd;
use std::sync::{Condvar, Mutex, PoisonError};

use crate::completion::UserData;
use crate::socket::SocketAddress;

#[cfg(target_os = "linux")]
pub use uring::UringPort;

/// Outcome of posting an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// A completion event for the token will be delivered later.
    Pending,
    /// The operation finished synchronously and no completion event will be
    /// delivered. Only meaningful for connect; receive and send always
    /// report through an event once accepted.
    Completed,
}

/// Asynchronous I/O backend.
///
/// Every operation that returns `Ok(Submitted::Pending)` must eventually be
/// reported exactly once, with a success or an error result. An `Err`
/// return means the operation was never started and nothing will be
/// reported for its token.
pub trait CompletionPort: Send + Sync + 'static {
    /// Start connecting `fd` to `addr`.
    ///
    /// # Safety
    /// `addr` must stay valid until the operation's completion is delivered.
    unsafe fn connect(&self, fd: RawFd, addr: &SocketAddress, token: UserData)
    -> io::Result<Submitted>;

    /// Start receiving up to `len` bytes into `buf`.
    ///
    /// # Safety
    /// `buf` must be valid for writes of `len` bytes and not otherwise
    /// accessed until the operation's completion is delivered.
    unsafe fn recv(&self, fd: RawFd, buf: *mut u8, len: usize, token: UserData)
    -> io::Result<Submitted>;

    /// Start sending `len` bytes from `buf`.
    ///
    /// # Safety
    /// `buf` must be valid for reads of `len` bytes and not modified until
    /// the operation's completion is delivered.
    unsafe fn send(&self, fd: RawFd, buf: *const u8, len: usize, token: UserData)
    -> io::Result<Submitted>;

    /// Abort all outstanding operations on `fd`. Their completions are still
    /// delivered, typically as errors or zero-length receives.
    fn cancel(&self, fd: RawFd);

    /// Stop the backend. Called once, after every client has been drained.
    fn shutdown(&self) {}
}

/// Per-client count of operations posted to the backend whose completion
/// has not been fully handled yet.
///
/// `begin` is called before posting; exactly one of `abandon` (the post
/// failed or finished synchronously) or `end` (the completion handler has
/// returned) balances it.
#[derive(Default)]
pub struct IoAssociation {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl IoAssociation {
    pub fn new() -> Self {
        Self::default()
    }

    /// An operation is about to be posted.
    pub fn begin(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    /// The operation announced by `begin` will not produce a completion.
    pub fn abandon(&self) {
        self.finish();
    }

    /// A completion has been fully handled.
    pub fn end(&self) {
        self.finish();
    }

    /// Ends one operation when dropped.
    pub fn guard(&self) -> CompletionGuard<'_> {
        CompletionGuard { io: self }
    }

    /// Number of operations announced and not yet finished.
    pub fn pending(&self) -> usize {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until every announced operation has finished.
    pub fn wait_idle(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while *pending > 0 {
            pending = self
                .idle
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(*pending > 0, "I/O association underflow");
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Marks the completion being handled as finished on drop.
pub struct CompletionGuard<'a> {
    io: &'a IoAssociation,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.io.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn begin_abandon_balances() {
        let io = IoAssociation::new();
        io.begin();
        io.begin();
        assert_eq!(io.pending(), 2);
        io.abandon();
        drop(io.guard());
        assert_eq!(io.pending(), 0);
        io.wait_idle();
    }

    #[test]
    fn wait_idle_blocks_until_drained() {
        let io = Arc::new(IoAssociation::new());
        io.begin();
        let waiter = {
            let io = io.clone();
            std::thread::spawn(move || io.wait_idle())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        io.end();
        waiter.join().unwrap();
    }
}

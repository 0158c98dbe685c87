use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::Sender;
use io_uring::types::Fd;
use io_uring::{IoUring, opcode, squeue};
use tracing::{debug, error, warn};

use crate::completion::{CompletionEvent, OpTag, UserData};
use crate::config::Config;
use crate::port::{CompletionPort, Submitted};
use crate::socket::{self, SocketAddress};

/// io_uring-backed [`CompletionPort`].
///
/// One ring is shared by every thread that posts operations. Pushes into the
/// submission queue are serialized by a lock and submitted immediately; a
/// dedicated reaper thread is the only consumer of the completion queue and
/// forwards each CQE as a [`CompletionEvent`] to the worker pool.
pub struct UringPort {
    ring: Arc<IoUring>,
    sq_lock: Mutex<()>,
    stop: Arc<AtomicBool>,
    reaper: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UringPort {
    /// Create the ring and start the reaper thread.
    pub fn new(config: &Config, events: Sender<CompletionEvent>) -> io::Result<Self> {
        let cq_entries = config
            .sq_entries
            .checked_mul(4)
            .unwrap_or(config.sq_entries);

        let mut builder = IoUring::builder();
        builder.setup_cqsize(cq_entries);
        let ring = Arc::new(builder.build(config.sq_entries)?);

        let stop = Arc::new(AtomicBool::new(false));
        let reaper = {
            let ring = ring.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("portline-reaper".to_string())
                .spawn(move || run_reaper(ring, events, stop))?
        };

        Ok(UringPort {
            ring,
            sq_lock: Mutex::new(()),
            stop,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Push one SQE and submit it.
    ///
    /// # Safety
    /// Every buffer or address the entry points to must stay valid until its
    /// CQE has been reaped.
    unsafe fn push(&self, entry: squeue::Entry) -> io::Result<()> {
        let _guard = self.sq_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Safety: the submission queue is only touched under `sq_lock`.
        let pushed = unsafe { self.ring.submission_shared().push(&entry) };
        if pushed.is_err() {
            // Queue full: flush what is there and retry once.
            self.ring.submit()?;
            unsafe { self.ring.submission_shared().push(&entry) }
                .map_err(|_| io::Error::other("submission queue full"))?;
        }
        self.ring.submit()?;
        Ok(())
    }
}

impl CompletionPort for UringPort {
    unsafe fn connect(
        &self,
        fd: RawFd,
        addr: &SocketAddress,
        token: UserData,
    ) -> io::Result<Submitted> {
        let entry = opcode::Connect::new(Fd(fd), addr.as_ptr(), addr.len())
            .build()
            .user_data(token.raw());
        unsafe { self.push(entry)? };
        Ok(Submitted::Pending)
    }

    unsafe fn recv(
        &self,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        token: UserData,
    ) -> io::Result<Submitted> {
        let entry = opcode::Recv::new(Fd(fd), buf, len as u32)
            .build()
            .user_data(token.raw());
        unsafe { self.push(entry)? };
        Ok(Submitted::Pending)
    }

    unsafe fn send(
        &self,
        fd: RawFd,
        buf: *const u8,
        len: usize,
        token: UserData,
    ) -> io::Result<Submitted> {
        let entry = opcode::Send::new(Fd(fd), buf, len as u32)
            .build()
            .user_data(token.raw());
        unsafe { self.push(entry)? };
        Ok(Submitted::Pending)
    }

    fn cancel(&self, fd: RawFd) {
        // SHUT_RDWR aborts an in-progress connect and completes pending
        // receives with zero bytes; the CQEs then drain normally.
        if let Err(err) = socket::shutdown_both(fd)
            && err.raw_os_error() != Some(libc::ENOTCONN)
        {
            debug!(fd, ?err, "shutdown during cancel failed");
        }
    }

    fn shutdown(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        let wake = opcode::Nop::new()
            .build()
            .user_data(UserData::encode(OpTag::Wake, 0, 0).raw());
        // Safety: a NOP references no memory.
        if let Err(err) = unsafe { self.push(wake) } {
            error!(?err, "failed to wake completion reaper");
        }
        let handle = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("completion reaper panicked");
        }
    }
}

impl Drop for UringPort {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait for CQEs and forward them until stopped or the workers hang up.
fn run_reaper(ring: Arc<IoUring>, events: Sender<CompletionEvent>, stop: Arc<AtomicBool>) {
    let mut batch: Vec<(u64, i32)> = Vec::with_capacity(64);
    loop {
        if let Err(err) = ring.submit_and_wait(1) {
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) => {}
                _ => {
                    error!(?err, "io_uring wait failed, reaper exiting");
                    return;
                }
            }
        }

        batch.clear();
        {
            // Safety: this thread is the only completion queue consumer.
            let cq = unsafe { ring.completion_shared() };
            for cqe in cq {
                batch.push((cqe.user_data(), cqe.result()));
            }
        }

        for &(raw, result) in &batch {
            let token = UserData(raw);
            match token.tag() {
                Some(OpTag::Wake) => {}
                Some(_) => {
                    if events.send(CompletionEvent::from_raw(token, result)).is_err() {
                        warn!("completion workers gone, reaper exiting");
                        return;
                    }
                }
                None => warn!(user_data = raw, "CQE with unknown tag"),
            }
        }

        if stop.load(Ordering::Acquire) {
            return;
        }
    }
}

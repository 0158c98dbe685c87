use std::ptr::NonNull;

/// Fixed-capacity byte buffer lent to the kernel while an operation is in
/// flight.
///
/// The buffer itself does no synchronization. Its owner guarantees that at
/// most one operation uses it at a time: receives are serialized by the
/// client's receive guard, sends by its send guard. Only raw pointers are
/// handed out, so no reference to the bytes outlives a call.
pub(crate) struct IoBuf {
    data: NonNull<[u8]>,
}

// Safety: the allocation is owned and access is serialized by the owning
// client (see type docs).
unsafe impl Send for IoBuf {}
unsafe impl Sync for IoBuf {}

impl IoBuf {
    pub fn new(capacity: usize) -> Self {
        let boxed = vec![0u8; capacity].into_boxed_slice();
        IoBuf {
            data: NonNull::from(Box::leak(boxed)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Pointer to the start of the buffer, valid for `capacity()` bytes for
    /// as long as `self` lives.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.data.cast::<u8>().as_ptr()
    }

    /// Copy `src` into the front of the buffer.
    ///
    /// # Safety
    /// No operation may be using the buffer.
    pub unsafe fn fill(&self, src: &[u8]) {
        debug_assert!(src.len() <= self.capacity());
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.as_mut_ptr(), src.len());
        }
    }

    /// View the first `len` bytes.
    ///
    /// # Safety
    /// No operation may be writing the buffer while the slice is alive.
    pub unsafe fn slice(&self, len: usize) -> &[u8] {
        debug_assert!(len <= self.capacity());
        unsafe { std::slice::from_raw_parts(self.as_mut_ptr(), len) }
    }
}

impl Drop for IoBuf {
    fn drop(&mut self) {
        // Safety: `data` came from `Box::leak` and is freed only here.
        drop(unsafe { Box::from_raw(self.data.as_ptr()) });
    }
}

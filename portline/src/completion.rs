use std::io;

/// Operation tags encoded in the upper 8 bits of user_data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpTag {
    /// Outbound TCP connect against one address candidate.
    Connect = 0,
    /// Single-shot receive into the client's receive buffer.
    Recv = 1,
    /// Send out of the client's send buffer.
    Send = 2,
    /// Backend-internal wakeup. Never reaches the dispatcher.
    Wake = 3,
}

impl OpTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OpTag::Connect),
            1 => Some(OpTag::Recv),
            2 => Some(OpTag::Send),
            3 => Some(OpTag::Wake),
            _ => None,
        }
    }
}

/// Encoded completion token carried through the I/O backend.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..56: OpTag (8 bits)
/// Bits 55..32: context slot (24 bits, max 16M in-flight operations)
/// Bits 31..0:  slot generation (32 bits)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserData(pub u64);

impl UserData {
    const TAG_SHIFT: u64 = 56;
    const SLOT_SHIFT: u64 = 32;
    const TAG_MASK: u64 = 0xFF << Self::TAG_SHIFT;
    const SLOT_MASK: u64 = 0x00FF_FFFF << Self::SLOT_SHIFT;
    const GENERATION_MASK: u64 = 0xFFFF_FFFF;

    /// Encode an operation tag, context slot, and slot generation into user_data.
    #[inline]
    pub fn encode(tag: OpTag, slot: u32, generation: u32) -> Self {
        debug_assert!(slot < (1 << 24), "slot exceeds 24 bits");
        let v = ((tag as u64) << Self::TAG_SHIFT)
            | (((slot as u64) & 0x00FF_FFFF) << Self::SLOT_SHIFT)
            | (generation as u64);
        UserData(v)
    }

    /// Decode the operation tag.
    #[inline]
    pub fn tag(self) -> Option<OpTag> {
        let raw = ((self.0 & Self::TAG_MASK) >> Self::TAG_SHIFT) as u8;
        OpTag::from_u8(raw)
    }

    /// Decode the context slot index.
    #[inline]
    pub fn slot(self) -> u32 {
        ((self.0 & Self::SLOT_MASK) >> Self::SLOT_SHIFT) as u32
    }

    /// Decode the slot generation.
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 & Self::GENERATION_MASK) as u32
    }

    /// Get the raw u64 value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A finished operation as reported by the I/O backend.
#[derive(Debug)]
pub struct CompletionEvent {
    /// Token the operation was posted with.
    pub token: UserData,
    /// Bytes transferred, or the error the operation failed with.
    pub result: io::Result<usize>,
}

impl CompletionEvent {
    pub fn new(token: UserData, result: io::Result<usize>) -> Self {
        CompletionEvent { token, result }
    }

    /// Build an event from a kernel-style result: `>= 0` is a byte count,
    /// `< 0` is a negated errno.
    pub fn from_raw(token: UserData, result: i32) -> Self {
        let result = if result >= 0 {
            Ok(result as usize)
        } else {
            Err(io::Error::from_raw_os_error(-result))
        };
        CompletionEvent { token, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_every_tag() {
        for tag in [OpTag::Connect, OpTag::Recv, OpTag::Send, OpTag::Wake] {
            let ud = UserData::encode(tag, 0x00AB_CDEF, 0xDEAD_BEEF);
            assert_eq!(ud.tag(), Some(tag));
            assert_eq!(ud.slot(), 0x00AB_CDEF);
            assert_eq!(ud.generation(), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn max_slot() {
        let max = (1u32 << 24) - 1;
        let ud = UserData::encode(OpTag::Send, max, u32::MAX);
        assert_eq!(ud.slot(), max);
        assert_eq!(ud.generation(), u32::MAX);
        assert_eq!(ud.tag(), Some(OpTag::Send));
    }

    #[test]
    fn invalid_tag() {
        let ud = UserData(0xFF << 56);
        assert_eq!(ud.tag(), None);
    }

    #[test]
    fn raw_results() {
        let token = UserData::encode(OpTag::Recv, 1, 1);
        assert_eq!(CompletionEvent::from_raw(token, 42).result.unwrap(), 42);
        let err = CompletionEvent::from_raw(token, -libc::ECONNREFUSED)
            .result
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
    }
}

//! Process-wide numeric error codes.
//!
//! There is no in-band error value at the kernel API. Every surface error
//! is a caller contract violation, resource exhaustion, or corruption, and
//! all of them are terminal: the kernel funnels the numeric code into
//! [`Platform::error_trap`] so existing host-side diagnostic tooling can
//! decode it. Sanity checks that only guard against caller bugs are
//! compiled out of release builds.
//!
//! [`Platform::error_trap`]: crate::Platform::error_trap
use core::fmt;

use crate::Platform;

/// Numeric error codes reported through [`Platform::error_trap`].
///
/// The values are part of the diagnostic wire format and must not change.
///
/// [`Platform::error_trap`]: crate::Platform::error_trap
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Memory heap is full.
    HeapFull = 100,
    /// Dynamic memory corrupted.
    CorruptMemory = 101,
    /// Invalid memory region number.
    InvalidRegion = 102,
    /// Freeing a block more than once.
    DoubleFree = 103,
    /// Freeing or reallocating a null block.
    NullBlock = 104,
    /// Block too large for the free lists.
    BlockTooLarge = 105,
    /// Cannot free a forever-allocated block.
    ForeverFree = 106,

    /// A linked list is corrupt.
    ListCorrupt = 200,

    /// Hash size is not a positive power of two.
    HashNotPowerOfTwo = 300,
    /// The node is not in the hash table.
    HashNodeNotInTable = 301,

    /// Priority level out of range.
    BadPriority = 400,
    /// Priority raise requested a level below the current one.
    InvalidRaisePri = 401,

    /// Posted signal out of range for a non-power-of-two group.
    SigPostOutOfRange = 500,
    /// Attached signal out of range for a non-power-of-two group.
    SigAttachOutOfRange = 501,
    /// Signal group index out of range.
    SigGroupOutOfRange = 502,
    /// Corrupt or uninitialized signal handle.
    SigCorruptHandle = 503,
    /// Attaching through a handle that is still active.
    SigMultipleAttach = 504,

    /// Clock index out of range.
    ClockOutOfRange = 600,

    /// Log buffer size is not a power of two.
    LogSizeNotPowerOfTwo = 700,

    /// Failed to create the software interrupt.
    CreateSwi = 1100,
}

impl ErrorCode {
    /// The numeric code, as understood by host-side tooling.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.code(), self)
    }
}

/// Report a terminal error through the port's trap.
#[cold]
#[inline(never)]
pub(crate) fn fatal<Traits: Platform>(code: ErrorCode) -> ! {
    Traits::error_trap(code)
}

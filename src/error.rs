//! Crate-wide error type.
//!
//! One enum covers every failure kind the engine can surface: transport
//! timeouts, SAM-BA protocol violations, and the NVM/flash-level checks
//! (geometry, alignment, page bounds, controller error flags).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Everything that can go wrong talking to a SAM-BA target or programming
/// its NVM.
#[derive(Debug, Error)]
pub enum Error {
    /// No response arrived within the command's timeout budget.
    #[error("transport timed out waiting for a response")]
    TransportTimeout,

    /// A response's first byte didn't match the echoed command letter, or
    /// its length was wrong.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Device geometry violates an invariant (non-power-of-two page size,
    /// page count, or lock-region count).
    #[error("invalid flash geometry: {0}")]
    FlashConfigError(String),

    /// An offset passed to a page operation is not page-aligned or is out
    /// of range.
    #[error("flash offset {offset:#x} invalid (page size {page_size:#x}, total size {total_size:#x})")]
    FlashOffsetError {
        offset: u32,
        page_size: u32,
        total_size: u32,
    },

    /// An erase offset is not granule-aligned, or the erase range exceeds
    /// total flash size.
    #[error("flash erase range [{offset:#x}, {offset:#x}+{size:#x}) invalid (granule {granule:#x}, total size {total_size:#x})")]
    FlashEraseError {
        offset: u32,
        size: u32,
        granule: u32,
        total_size: u32,
    },

    /// A page index is out of range.
    #[error("page index {page} out of range (page count {page_count})")]
    FlashPageError { page: u32, page_count: u32 },

    /// The NVM controller's INTFLAG register reported an error bit after a
    /// command; the flag has already been cleared.
    #[error("NVM command {command:#x} failed: {flags:#x}")]
    FlashCmdError { command: u16, flags: u16 },

    /// A lock-region vector is longer than the number of lock regions the
    /// device supports.
    #[error("lock region vector has {given} entries, device supports {supported}")]
    FlashRegionError { given: usize, supported: usize },

    /// The probed chip/device ID did not match any dispatch table entry.
    #[error("unsupported device: chip_id={chip_id:#010x} ext_chip_id={ext_chip_id:#010x} device_id={device_id:#010x}")]
    DeviceUnsupportedError {
        chip_id: u32,
        ext_chip_id: u32,
        device_id: u32,
    },

    /// Caller's payload is larger than `page_count * page_size`.
    #[error("file is {given} bytes, flash holds {capacity} bytes")]
    FileSizeError { given: usize, capacity: usize },

    /// Underlying serial port I/O failure.
    #[error("serial port I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for scatter-gather DMA operations.

use crate::regs::{Direction, StatusFlags};
use thiserror::Error;

/// Errors that can occur while mapping buffers or moving data over a channel.
#[derive(Debug, Error)]
pub enum DmaError {
    /// Buffer address, device offset or length violates the channel's addressing rule.
    #[error("alignment error: buffer {addr:#x}, length {len}, device offset {offset:#x}")]
    AlignmentError { addr: usize, len: usize, offset: u64 },

    /// Page-reference or segment table allocation failed.
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),

    /// Fewer pages were pinned than the buffer spans.
    #[error("fault pinning user buffer: pinned {pinned} of {requested} pages")]
    FaultError { pinned: usize, requested: usize },

    /// Two consecutive pinned pages resolved to the same physical page.
    #[error("duplicate physical page at index {index}")]
    DuplicatePage { index: usize },

    /// The buffer length could not be covered by the pinned pages.
    #[error("invalid buffer length: {residual} bytes not covered by pinned pages")]
    InvalidLength { residual: usize },

    /// Request direction disagrees with the channel configuration.
    #[error("direction mismatch: channel is {channel}, request is {requested}")]
    DirectionMismatch {
        channel: Direction,
        requested: Direction,
    },

    /// The engine reported one of the status register error categories.
    #[error("device error: status={status:#010x}, completed {bytes} bytes")]
    DeviceError { status: u32, bytes: usize },

    /// No completion arrived within the configured window.
    #[error("transfer timed out after {bytes} bytes")]
    Timeout { bytes: usize },

    /// A completion raced a concurrent cancellation and was not folded in.
    #[error("completion skipped: context busy")]
    Busy,

    /// The transfer needs more descriptors than one chain may hold.
    #[error("descriptor chain too long: needs {needed}, max {max}")]
    DescriptorOverflow { needed: usize, max: usize },

    /// The channel is shutting down or has shut down.
    #[error("channel is shut down")]
    ChannelShutdown,

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Platform not supported.
    #[error("platform not supported: register access requires Linux")]
    PlatformNotSupported,

    /// Permission denied accessing a device resource.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),
}

impl DmaError {
    /// Build a device error from raw status bits.
    pub fn device(status: StatusFlags, bytes: usize) -> Self {
        Self::DeviceError {
            status: status.bits(),
            bytes,
        }
    }

    /// Bytes moved before the failure, for errors that carry a count.
    pub fn bytes_transferred(&self) -> usize {
        match self {
            Self::DeviceError { bytes, .. } | Self::Timeout { bytes } => *bytes,
            _ => 0,
        }
    }

    /// Returns true if the error was detected before any hardware action.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::AlignmentError { .. }
                | Self::OutOfMemory(_)
                | Self::FaultError { .. }
                | Self::DuplicatePage { .. }
                | Self::InvalidLength { .. }
                | Self::DirectionMismatch { .. }
                | Self::DescriptorOverflow { .. }
                | Self::InvalidArgument(_)
        )
    }
}

/// Result type alias for DMA operations.
pub type DmaResult<T> = Result<T, DmaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_transferred() {
        let err = DmaError::device(StatusFlags::ALIGN_MISMATCH, 4096);
        assert_eq!(err.bytes_transferred(), 4096);
        assert_eq!(DmaError::Timeout { bytes: 12 }.bytes_transferred(), 12);
        assert_eq!(DmaError::Busy.bytes_transferred(), 0);
    }

    #[test]
    fn test_rejection_classification() {
        assert!(DmaError::AlignmentError {
            addr: 1,
            len: 2,
            offset: 3
        }
        .is_rejection());
        assert!(!DmaError::Timeout { bytes: 0 }.is_rejection());
        assert!(!DmaError::device(StatusFlags::INVALID_LEN, 0).is_rejection());
    }

    #[test]
    fn test_display_keeps_raw_status() {
        let err = DmaError::device(StatusFlags::DESC_STOPPED | StatusFlags::MAGIC_STOPPED, 0);
        assert_eq!(
            err.to_string(),
            "device error: status=0x00000012, completed 0 bytes"
        );
    }
}

// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Engine register layout, control/status bits and hardware constants.
//!
//! All registers are 32 bits wide, little-endian, and must be accessed with
//! single DWORD reads and writes.

use bitflags::bitflags;
use std::fmt;

/// Page size used for pinning and for the cyclic receive ring.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Magic value carried in the upper 16 bits of every descriptor control word.
pub const DESC_MAGIC: u32 = 0xAD4B_0000;
/// Width of the descriptor byte-count field.
pub const DESC_BLEN_BITS: u32 = 28;
/// Maximum byte count of a single descriptor.
pub const DESC_BLEN_MAX: u32 = (1 << DESC_BLEN_BITS) - 1;
/// Maximum number of descriptors in one transfer.
pub const TRANSFER_MAX_DESC: usize = 2048;
/// Maximum number of extra descriptors the engine may prefetch.
pub const MAX_EXTRA_ADJ: u32 = 15;

/// Completed-descriptor count bits of the poll-mode write-back word.
pub const WB_COUNT_MASK: u32 = 0x00ff_ffff;
/// Error bit of the poll-mode write-back word.
pub const WB_ERR_MASK: u32 = 1 << 31;

/// Upper half of a valid C2H streaming result status word.
pub const C2H_WB: u32 = 0x52B4;
/// End-of-packet bit in a C2H streaming result status word.
pub const RX_STATUS_EOP: u32 = 1;
/// Upper bound on the cyclic receive ring.
pub const CYCLIC_RX_PAGES_MAX: usize = 256;

/// Identifier (upper 16 bits) of a host-to-card engine.
pub const ID_H2C: u32 = 0x1fc0;
/// Identifier (upper 16 bits) of a card-to-host engine.
pub const ID_C2H: u32 = 0x1fc1;
/// Identifier bit set on AXI streaming engines.
pub const ID_STREAMING: u32 = 0x8000;

/// Maximum number of channels per direction.
pub const CHANNEL_NUM_MAX: usize = 4;
/// Offset of the C2H engine register blocks in the config BAR.
pub const C2H_CHANNEL_OFFSET: usize = 0x1000;
/// Distance between two channels' register blocks.
pub const CHANNEL_SPACING: usize = 0x100;
/// Offset from an engine register block to its SGDMA register block.
pub const SGDMA_OFFSET_FROM_CHANNEL: usize = 0x4000;

/// Engine register block offsets.
pub mod engine_reg {
    pub const IDENTIFIER: usize = 0x00;
    pub const CONTROL: usize = 0x04;
    pub const CONTROL_W1S: usize = 0x08;
    pub const CONTROL_W1C: usize = 0x0C;
    pub const STATUS: usize = 0x40;
    /// Status, cleared on read.
    pub const STATUS_RC: usize = 0x44;
    pub const COMPLETED_DESC_COUNT: usize = 0x48;
    pub const ALIGNMENTS: usize = 0x4C;
    pub const POLL_MODE_WB_LO: usize = 0x88;
    pub const POLL_MODE_WB_HI: usize = 0x8C;
    pub const INTERRUPT_ENABLE_MASK: usize = 0x90;
    pub const INTERRUPT_ENABLE_MASK_W1S: usize = 0x94;
    pub const INTERRUPT_ENABLE_MASK_W1C: usize = 0x98;
}

/// SGDMA register block offsets, relative to the SGDMA block.
pub mod sgdma_reg {
    pub const IDENTIFIER: usize = 0x00;
    pub const FIRST_DESC_LO: usize = 0x80;
    pub const FIRST_DESC_HI: usize = 0x84;
    pub const FIRST_DESC_ADJACENT: usize = 0x88;
    pub const CREDITS: usize = 0x8C;
}

bitflags! {
    /// Bits of the engine control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u32 {
        const RUN_STOP = 1 << 0;
        const IE_DESC_STOPPED = 1 << 1;
        const IE_DESC_COMPLETED = 1 << 2;
        const IE_DESC_ALIGN_MISMATCH = 1 << 3;
        const IE_MAGIC_STOPPED = 1 << 4;
        const IE_IDLE_STOPPED = 1 << 6;
        const IE_READ_ERROR = 0x1F << 9;
        const IE_DESC_ERROR = 0x1F << 19;
        const NON_INCR_ADDR = 1 << 25;
        const POLL_MODE_WB = 1 << 26;
        const STM_MODE_WB = 1 << 27;
    }
}

impl ControlFlags {
    /// Every interrupt-enable bit the driver arms when starting an engine.
    pub const IE_ALL: Self = Self::IE_DESC_STOPPED
        .union(Self::IE_DESC_COMPLETED)
        .union(Self::IE_DESC_ALIGN_MISMATCH)
        .union(Self::IE_MAGIC_STOPPED)
        .union(Self::IE_IDLE_STOPPED)
        .union(Self::IE_READ_ERROR)
        .union(Self::IE_DESC_ERROR);
}

bitflags! {
    /// Bits of the engine status register.
    ///
    /// Bits 9..=15 are direction specific: the same bit means a different
    /// transport error on an H2C engine than on a C2H engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u32 {
        const BUSY = 1 << 0;
        const DESC_STOPPED = 1 << 1;
        const DESC_COMPLETED = 1 << 2;
        const ALIGN_MISMATCH = 1 << 3;
        const MAGIC_STOPPED = 1 << 4;
        const INVALID_LEN = 1 << 5;
        const IDLE_STOPPED = 1 << 6;

        // read error, H2C
        const H2C_R_UNSUPP_REQ = 1 << 9;
        const H2C_R_COMPL_ABORT = 1 << 10;
        const H2C_R_PARITY_ERR = 1 << 11;
        const H2C_R_HEADER_EP = 1 << 12;
        const H2C_R_UNEXP_COMPL = 1 << 13;

        // write error, H2C only
        const H2C_W_DECODE_ERR = 1 << 14;
        const H2C_W_SLAVE_ERR = 1 << 15;

        // read error, C2H
        const C2H_R_DECODE_ERR = 1 << 9;
        const C2H_R_SLAVE_ERR = 1 << 10;

        // descriptor error, both directions
        const DESC_UNSUPP_REQ = 1 << 19;
        const DESC_COMPL_ABORT = 1 << 20;
        const DESC_PARITY_ERR = 1 << 21;
        const DESC_HEADER_EP = 1 << 22;
        const DESC_UNEXP_COMPL = 1 << 23;
    }
}

impl StatusFlags {
    /// Errors common to both directions.
    pub const COMMON_ERR_MASK: Self = Self::ALIGN_MISMATCH
        .union(Self::MAGIC_STOPPED)
        .union(Self::INVALID_LEN);

    /// Descriptor fetch errors.
    pub const DESC_ERR_MASK: Self = Self::DESC_UNSUPP_REQ
        .union(Self::DESC_COMPL_ABORT)
        .union(Self::DESC_PARITY_ERR)
        .union(Self::DESC_HEADER_EP)
        .union(Self::DESC_UNEXP_COMPL);

    /// H2C read (host memory fetch) errors.
    pub const H2C_R_ERR_MASK: Self = Self::H2C_R_UNSUPP_REQ
        .union(Self::H2C_R_COMPL_ABORT)
        .union(Self::H2C_R_PARITY_ERR)
        .union(Self::H2C_R_HEADER_EP)
        .union(Self::H2C_R_UNEXP_COMPL);

    /// H2C write (card side) errors.
    pub const H2C_W_ERR_MASK: Self = Self::H2C_W_DECODE_ERR.union(Self::H2C_W_SLAVE_ERR);

    /// C2H read (card side) errors.
    pub const C2H_R_ERR_MASK: Self = Self::C2H_R_DECODE_ERR.union(Self::C2H_R_SLAVE_ERR);

    /// All H2C error bits.
    pub const H2C_ERR_MASK: Self = Self::COMMON_ERR_MASK
        .union(Self::DESC_ERR_MASK)
        .union(Self::H2C_R_ERR_MASK)
        .union(Self::H2C_W_ERR_MASK);

    /// All C2H error bits.
    pub const C2H_ERR_MASK: Self = Self::COMMON_ERR_MASK
        .union(Self::DESC_ERR_MASK)
        .union(Self::C2H_R_ERR_MASK);

    /// Error mask for an engine of the given direction.
    #[inline]
    pub fn error_mask(direction: Direction) -> Self {
        match direction {
            Direction::H2C => Self::H2C_ERR_MASK,
            Direction::C2H => Self::C2H_ERR_MASK,
        }
    }

    /// Error bits present in this status for the given direction.
    #[inline]
    pub fn errors(self, direction: Direction) -> Self {
        self & Self::error_mask(direction)
    }
}

bitflags! {
    /// Flag bits of the descriptor control word (low byte).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescControl: u32 {
        /// Engine stops after this descriptor.
        const STOPPED = 1 << 0;
        /// Engine reports completion of this descriptor.
        const COMPLETED = 1 << 1;
        /// End of packet, AXI streaming only.
        const EOP = 1 << 4;
    }
}

/// Transfer direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host-to-card: the device reads host memory.
    H2C,
    /// Card-to-host: the device writes host memory.
    C2H,
}

impl Direction {
    /// Direction of a request that writes to the device when `write` is true.
    #[inline]
    pub fn from_write(write: bool) -> Self {
        if write {
            Self::H2C
        } else {
            Self::C2H
        }
    }

    /// Returns true for host-to-card.
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, Self::H2C)
    }

    /// Identifier value (upper 16 bits of the identifier register).
    #[inline]
    pub fn id(self) -> u32 {
        match self {
            Self::H2C => ID_H2C,
            Self::C2H => ID_C2H,
        }
    }

    /// Decode the direction from an engine identifier register value.
    pub fn from_identifier(value: u32) -> Option<Self> {
        match value >> 16 {
            ID_H2C => Some(Self::H2C),
            ID_C2H => Some(Self::C2H),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H2C => f.write_str("H2C"),
            Self::C2H => f.write_str("C2H"),
        }
    }
}

/// Decoded contents of the alignments register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignments {
    /// Required source/destination address alignment in bytes.
    pub addr_align: u32,
    /// Required transfer length multiple in bytes.
    pub len_granularity: u32,
    /// Datapath address width.
    pub addr_bits: u32,
}

impl Alignments {
    /// Decode the alignments register. A zero word means no constraints.
    pub fn from_register(value: u32) -> Self {
        if value == 0 {
            return Self {
                addr_align: 1,
                len_granularity: 1,
                addr_bits: 64,
            };
        }
        Self {
            addr_align: ((value >> 16) & 0xff).max(1),
            len_granularity: ((value >> 8) & 0xff).max(1),
            addr_bits: value & 0xff,
        }
    }

    /// Encode back into register form.
    pub fn to_register(self) -> u32 {
        ((self.addr_align & 0xff) << 16) | ((self.len_granularity & 0xff) << 8) | (self.addr_bits & 0xff)
    }
}

/// Capabilities of one channel, as reported to administrative callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCaps {
    /// Configured transfer direction.
    pub direction: Direction,
    /// AXI streaming engine rather than memory-mapped.
    pub streaming: bool,
    /// Device address does not increment between bytes.
    pub non_incr_addr: bool,
    /// Required address alignment in bytes (power of two).
    pub addr_align: u32,
    /// Required length multiple in bytes (power of two).
    pub len_granularity: u32,
    /// Datapath address width.
    pub addr_bits: u32,
}

impl ChannelCaps {
    /// Capabilities of a channel with the given decoded alignments.
    pub fn new(direction: Direction, streaming: bool, alignments: Alignments) -> Self {
        Self {
            direction,
            streaming,
            non_incr_addr: false,
            addr_align: alignments.addr_align,
            len_granularity: alignments.len_granularity,
            addr_bits: alignments.addr_bits,
        }
    }

    /// Low-order address bits that must be clear (or co-aligned).
    #[inline]
    pub fn align_mask(&self) -> u64 {
        u64::from(self.addr_align.max(1)) - 1
    }

    /// Low-order length bits that must be clear.
    #[inline]
    pub fn granularity_mask(&self) -> u64 {
        u64::from(self.len_granularity.max(1)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_match_hardware_definitions() {
        assert_eq!(StatusFlags::COMMON_ERR_MASK.bits(), 0x38);
        assert_eq!(StatusFlags::DESC_ERR_MASK.bits(), 0x1F << 19);
        assert_eq!(StatusFlags::H2C_R_ERR_MASK.bits(), 0x1F << 9);
        assert_eq!(StatusFlags::H2C_W_ERR_MASK.bits(), 0x3 << 14);
        assert_eq!(StatusFlags::C2H_R_ERR_MASK.bits(), 0x3 << 9);
    }

    #[test]
    fn test_direction_specific_errors() {
        let status = StatusFlags::H2C_W_DECODE_ERR | StatusFlags::DESC_STOPPED;
        assert!(!status.errors(Direction::H2C).is_empty());
        // bit 14 is not an error bit on a C2H engine
        assert!(status.errors(Direction::C2H).is_empty());
        assert!(StatusFlags::BUSY.errors(Direction::H2C).is_empty());
    }

    #[test]
    fn test_direction_identifier() {
        assert_eq!(Direction::from_identifier(0x1fc0_0006), Some(Direction::H2C));
        assert_eq!(Direction::from_identifier(0x1fc1_8006), Some(Direction::C2H));
        assert_eq!(Direction::from_identifier(0x1fc2_0000), None);
        assert_eq!(Direction::from_write(true), Direction::H2C);
        assert_eq!(Direction::C2H.to_string(), "C2H");
    }

    #[test]
    fn test_alignments_decode() {
        let a = Alignments::from_register(0x0040_1040);
        assert_eq!(a.addr_align, 64);
        assert_eq!(a.len_granularity, 16);
        assert_eq!(a.addr_bits, 64);
        assert_eq!(Alignments::from_register(a.to_register()), a);

        let none = Alignments::from_register(0);
        assert_eq!((none.addr_align, none.len_granularity), (1, 1));
    }

    #[test]
    fn test_ie_all_excludes_run_bit() {
        assert!(!ControlFlags::IE_ALL.contains(ControlFlags::RUN_STOP));
        assert!(ControlFlags::IE_ALL.contains(ControlFlags::IE_DESC_ERROR));
    }
}

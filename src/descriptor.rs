// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! SGDMA hardware descriptor, write-back and result structures.
//!
//! Descriptors live in host memory and are fetched by the engine over PCIe.
//! Multiple descriptors are linked through their next pointer; the extra
//! adjacent count tells the engine how many further descriptors follow the
//! next one contiguously so it can prefetch them in one burst.

use crate::error::{DmaError, DmaResult};
use crate::mapper::SgSegment;
use crate::regs::{
    Direction, DescControl, C2H_WB, DESC_MAGIC, MAX_EXTRA_ADJ, RX_STATUS_EOP, TRANSFER_MAX_DESC,
    WB_COUNT_MASK, WB_ERR_MASK,
};
use std::sync::atomic::{AtomicU32, Ordering};

/// Size of one hardware descriptor in bytes.
pub const DESC_SIZE: usize = 32;

/// 32-byte SGDMA descriptor: eight little-endian 32-bit words.
///
/// # Layout
///
/// | Word | Field |
/// |------|-------|
/// | 0 | control (magic, extra adjacent, flags) |
/// | 1 | transfer length in bytes |
/// | 2-3 | source address (lo/hi) |
/// | 4-5 | destination address (lo/hi) |
/// | 6-7 | next descriptor bus address (lo/hi) |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(32))]
pub struct MdlxDesc {
    control: u32,
    bytes: u32,
    src_addr_lo: u32,
    src_addr_hi: u32,
    dst_addr_lo: u32,
    dst_addr_hi: u32,
    next_lo: u32,
    next_hi: u32,
}

#[inline]
fn lo(addr: u64) -> u32 {
    (addr & 0xffff_ffff) as u32
}

#[inline]
fn hi(addr: u64) -> u32 {
    (addr >> 32) as u32
}

#[inline]
fn join(lo: u32, hi: u32) -> u64 {
    (u64::from(u32::from_le(hi)) << 32) | u64::from(u32::from_le(lo))
}

impl MdlxDesc {
    /// Create a descriptor moving `len` bytes from `src` to `dst`.
    pub fn new(src: u64, dst: u64, len: u32) -> Self {
        Self {
            control: DESC_MAGIC.to_le(),
            bytes: len.to_le(),
            src_addr_lo: lo(src).to_le(),
            src_addr_hi: hi(src).to_le(),
            dst_addr_lo: lo(dst).to_le(),
            dst_addr_hi: hi(dst).to_le(),
            next_lo: 0,
            next_hi: 0,
        }
    }

    /// Raw control word.
    #[inline]
    pub fn control(&self) -> u32 {
        u32::from_le(self.control)
    }

    /// Flag bits of the control word.
    #[inline]
    pub fn flags(&self) -> DescControl {
        DescControl::from_bits_truncate(self.control())
    }

    /// Add control flags (OR with existing).
    #[inline]
    pub fn add_flags(&mut self, flags: DescControl) {
        self.control = (self.control() | flags.bits()).to_le();
    }

    /// Returns true if the control word carries the descriptor magic.
    #[inline]
    pub fn has_magic(&self) -> bool {
        self.control() & 0xffff_0000 == DESC_MAGIC
    }

    /// Number of extra adjacent descriptors following the next one.
    #[inline]
    pub fn extra_adjacent(&self) -> u32 {
        (self.control() >> 8) & 0x3f
    }

    /// Transfer length in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        u32::from_le(self.bytes)
    }

    /// Returns true for a zero-length descriptor.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Source address.
    #[inline]
    pub fn src(&self) -> u64 {
        join(self.src_addr_lo, self.src_addr_hi)
    }

    /// Destination address.
    #[inline]
    pub fn dst(&self) -> u64 {
        join(self.dst_addr_lo, self.dst_addr_hi)
    }

    /// Overwrite the source address.
    #[inline]
    pub fn set_src(&mut self, src: u64) {
        self.src_addr_lo = lo(src).to_le();
        self.src_addr_hi = hi(src).to_le();
    }

    /// Bus address of the next descriptor, zero for none.
    #[inline]
    pub fn next(&self) -> u64 {
        join(self.next_lo, self.next_hi)
    }

    /// Link this descriptor to `next`, with `extra_adj` prefetchable followers.
    pub fn set_next(&mut self, next: u64, extra_adj: u32) {
        self.next_lo = lo(next).to_le();
        self.next_hi = hi(next).to_le();
        let control = (self.control() & !0x3f00) | ((extra_adj & 0x3f) << 8);
        self.control = control.to_le();
    }

    /// Serialize to the wire format.
    pub fn to_bytes(&self) -> [u8; DESC_SIZE] {
        let words = [
            self.control,
            self.bytes,
            self.src_addr_lo,
            self.src_addr_hi,
            self.dst_addr_lo,
            self.dst_addr_hi,
            self.next_lo,
            self.next_hi,
        ];
        let mut out = [0u8; DESC_SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&u32::from_le(word).to_le_bytes());
        }
        out
    }

    /// Parse the wire format.
    pub fn from_bytes(bytes: &[u8; DESC_SIZE]) -> Self {
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]).to_le();
        }
        Self {
            control: words[0],
            bytes: words[1],
            src_addr_lo: words[2],
            src_addr_hi: words[3],
            dst_addr_lo: words[4],
            dst_addr_hi: words[5],
            next_lo: words[6],
            next_hi: words[7],
        }
    }
}

/// Number of extra adjacent descriptors the engine may fetch after `next`,
/// bounded by the prefetch limit and by the 4 KiB page holding `next`.
fn extra_adjacent(next: u64, remaining_after_next: usize) -> u32 {
    let page_room = ((4096 - (next & 0xfff)) / DESC_SIZE as u64).saturating_sub(1) as u32;
    (remaining_after_next.min(u32::MAX as usize) as u32)
        .min(MAX_EXTRA_ADJ)
        .min(page_room)
}

/// Poll-mode write-back record.
///
/// The engine stores its completed-descriptor count here (bits 23:0) with the
/// error flag in bit 31, so software can poll memory instead of waiting for
/// an interrupt.
#[derive(Debug, Default)]
#[repr(C, align(32))]
pub struct PollWriteback {
    completed_desc_count: AtomicU32,
    reserved: [u32; 7],
}

impl PollWriteback {
    /// Create a cleared record.
    pub const fn new() -> Self {
        Self {
            completed_desc_count: AtomicU32::new(0),
            reserved: [0; 7],
        }
    }

    /// Clear the record before starting the engine.
    #[inline]
    pub fn reset(&self) {
        self.completed_desc_count.store(0, Ordering::Release);
    }

    /// Raw write-back word.
    #[inline]
    pub fn raw(&self) -> u32 {
        u32::from_le(self.completed_desc_count.load(Ordering::Acquire))
    }

    /// Completed-descriptor count.
    #[inline]
    pub fn completed(&self) -> u32 {
        self.raw() & WB_COUNT_MASK
    }

    /// Returns true if the engine flagged an error.
    #[inline]
    pub fn has_error(&self) -> bool {
        self.raw() & WB_ERR_MASK != 0
    }

    /// Store a write-back word, as the engine does.
    #[inline]
    pub fn store(&self, value: u32) {
        self.completed_desc_count
            .store(value.to_le(), Ordering::Release);
    }

    /// Bus address of this record.
    #[inline]
    pub fn bus_addr(&self) -> u64 {
        self as *const Self as u64
    }
}

/// C2H streaming result record, one per descriptor of a cyclic ring.
#[derive(Debug, Default)]
#[repr(C, align(32))]
pub struct MdlxResult {
    status: AtomicU32,
    length: AtomicU32,
    reserved: [u32; 6],
}

impl MdlxResult {
    /// Create a cleared record.
    pub const fn new() -> Self {
        Self {
            status: AtomicU32::new(0),
            length: AtomicU32::new(0),
            reserved: [0; 6],
        }
    }

    /// Returns true once the engine has written this record.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.status.load(Ordering::Acquire) >> 16 == C2H_WB
    }

    /// Returns true if the packet ends in this entry.
    #[inline]
    pub fn is_eop(&self) -> bool {
        self.status.load(Ordering::Acquire) & RX_STATUS_EOP != 0
    }

    /// Number of valid bytes in the entry's page.
    #[inline]
    pub fn length(&self) -> u32 {
        self.length.load(Ordering::Acquire)
    }

    /// Publish a result, as the engine does: length first, then status.
    pub fn publish(&self, length: u32, eop: bool) {
        self.length.store(length, Ordering::Release);
        let status = (C2H_WB << 16) | if eop { RX_STATUS_EOP } else { 0 };
        self.status.store(status, Ordering::Release);
    }

    /// Hand the entry back to the engine.
    #[inline]
    pub fn clear(&self) {
        self.status.store(0, Ordering::Release);
        self.length.store(0, Ordering::Release);
    }

    /// Bus address of this record.
    #[inline]
    pub fn bus_addr(&self) -> u64 {
        self as *const Self as u64
    }
}

/// A linked chain of descriptors in host memory.
///
/// The chain must stay alive, and must not move, while the engine may fetch
/// from it. Its storage is a boxed slice so the bus addresses written into the
/// next pointers remain valid for the chain's lifetime.
#[derive(Debug)]
pub struct DescriptorChain {
    descs: Box<[MdlxDesc]>,
    first_adjacent: u32,
    total_bytes: usize,
}

impl DescriptorChain {
    /// Build a stopped chain over a scatter-gather list.
    ///
    /// Physically contiguous segments are merged and every run is split at
    /// `blen_max` bytes. The device address advances with each descriptor
    /// unless `non_incr` is set. The last descriptor stops the engine and,
    /// when `eop` is set, ends the packet.
    pub fn build(
        segments: &[SgSegment],
        direction: Direction,
        dev_addr: u64,
        non_incr: bool,
        blen_max: u32,
        eop: bool,
    ) -> DmaResult<Self> {
        if blen_max == 0 {
            return Err(DmaError::InvalidArgument("descriptor length cap is zero".into()));
        }
        let runs = coalesce(segments, blen_max);
        if runs.is_empty() {
            return Err(DmaError::InvalidLength { residual: 0 });
        }
        if runs.len() > TRANSFER_MAX_DESC {
            return Err(DmaError::DescriptorOverflow {
                needed: runs.len(),
                max: TRANSFER_MAX_DESC,
            });
        }

        let mut descs = Vec::new();
        descs
            .try_reserve_exact(runs.len())
            .map_err(|_| DmaError::OutOfMemory("descriptor chain"))?;

        let mut dev = dev_addr;
        let mut total_bytes = 0usize;
        for &(host, len) in &runs {
            let desc = match direction {
                Direction::H2C => MdlxDesc::new(host, dev, len),
                Direction::C2H => MdlxDesc::new(dev, host, len),
            };
            descs.push(desc);
            total_bytes += len as usize;
            if !non_incr {
                dev += u64::from(len);
            }
        }

        let mut chain = Self {
            descs: descs.into_boxed_slice(),
            first_adjacent: 0,
            total_bytes,
        };
        chain.link(false);

        let last = chain.descs.len() - 1;
        let mut flags = DescControl::STOPPED | DescControl::COMPLETED;
        if eop {
            flags |= DescControl::EOP;
        }
        chain.descs[last].add_flags(flags);
        Ok(chain)
    }

    /// Build a ring of page descriptors for cyclic C2H streaming.
    ///
    /// Each descriptor receives into one page and reports into the result
    /// record at the same index; the last descriptor links back to the first
    /// and nothing stops the engine.
    pub fn ring(pages: &[u64], page_len: u32, results: &[MdlxResult]) -> DmaResult<Self> {
        if pages.is_empty() || pages.len() != results.len() {
            return Err(DmaError::InvalidArgument(format!(
                "ring of {} pages with {} result records",
                pages.len(),
                results.len()
            )));
        }
        let mut descs = Vec::new();
        descs
            .try_reserve_exact(pages.len())
            .map_err(|_| DmaError::OutOfMemory("descriptor ring"))?;
        for (page, result) in pages.iter().zip(results) {
            let mut desc = MdlxDesc::new(result.bus_addr(), *page, page_len);
            desc.add_flags(DescControl::COMPLETED);
            descs.push(desc);
        }
        let mut chain = Self {
            descs: descs.into_boxed_slice(),
            first_adjacent: 0,
            total_bytes: pages.len() * page_len as usize,
        };
        chain.link(true);
        Ok(chain)
    }

    fn link(&mut self, cyclic: bool) {
        let base = self.descs.as_ptr() as u64;
        let n = self.descs.len();
        self.first_adjacent = extra_adjacent(base, n - 1);
        for i in 0..n - 1 {
            let next = base + ((i + 1) * DESC_SIZE) as u64;
            self.descs[i].set_next(next, extra_adjacent(next, n - i - 2));
        }
        if cyclic {
            self.descs[n - 1].set_next(base, extra_adjacent(base, n - 1));
        }
    }

    /// Bus address of the first descriptor.
    #[inline]
    pub fn bus_addr(&self) -> u64 {
        self.descs.as_ptr() as u64
    }

    /// Extra adjacent count to program alongside the first descriptor.
    #[inline]
    pub fn first_adjacent(&self) -> u32 {
        self.first_adjacent
    }

    /// Number of descriptors.
    #[inline]
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// Returns true for an empty chain (never produced by the builders).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Sum of descriptor lengths.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Byte count covered by the first `count` descriptors.
    pub fn bytes_in(&self, count: usize) -> usize {
        self.descs
            .iter()
            .take(count)
            .map(|d| d.len() as usize)
            .sum()
    }

    /// The descriptors, in chain order.
    #[inline]
    pub fn descriptors(&self) -> &[MdlxDesc] {
        &self.descs
    }
}

/// Merge contiguous segments and split runs at `blen_max`.
fn coalesce(segments: &[SgSegment], blen_max: u32) -> Vec<(u64, u32)> {
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for seg in segments.iter().filter(|s| s.len > 0) {
        match runs.last_mut() {
            Some((addr, len)) if *addr + *len == seg.addr => *len += u64::from(seg.len),
            _ => runs.push((seg.addr, u64::from(seg.len))),
        }
    }

    let cap = u64::from(blen_max);
    let mut out = Vec::with_capacity(runs.len());
    for (mut addr, mut len) in runs {
        while len > 0 {
            let chunk = len.min(cap);
            out.push((addr, chunk as u32));
            addr += chunk;
            len -= chunk;
        }
    }
    out
}

// Compile-time size and alignment checks against the hardware layout
const _: () = assert!(std::mem::size_of::<MdlxDesc>() == DESC_SIZE);
const _: () = assert!(std::mem::align_of::<MdlxDesc>() == 32);
const _: () = assert!(std::mem::size_of::<PollWriteback>() == 32);
const _: () = assert!(std::mem::size_of::<MdlxResult>() == 32);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::DESC_BLEN_MAX;

    fn seg(addr: u64, len: u32) -> SgSegment {
        SgSegment { addr, len }
    }

    #[test]
    fn test_descriptor_size_and_alignment() {
        assert_eq!(std::mem::size_of::<MdlxDesc>(), 32);
        assert_eq!(std::mem::align_of::<MdlxDesc>(), 32);
    }

    #[test]
    fn test_wire_format_is_little_endian() {
        let mut desc = MdlxDesc::new(0x1_2345_6780, 0x40, 4096);
        desc.set_next(0xAABB_CCDD_0000_1000, 3);
        let bytes = desc.to_bytes();

        assert_eq!(&bytes[0..4], &(DESC_MAGIC | (3 << 8)).to_le_bytes());
        assert_eq!(&bytes[4..8], &4096u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x2345_6780u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &1u32.to_le_bytes());
        assert_eq!(&bytes[24..28], &0x0000_1000u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &0xAABB_CCDDu32.to_le_bytes());
        assert_eq!(MdlxDesc::from_bytes(&bytes), desc);
    }

    #[test]
    fn test_chain_merges_contiguous_pages() {
        let segments = [seg(0x10000, 4096), seg(0x11000, 4096), seg(0x20000, 100)];
        let chain =
            DescriptorChain::build(&segments, Direction::H2C, 0, false, DESC_BLEN_MAX, false)
                .unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.total_bytes(), 8292);
        let d = chain.descriptors();
        assert_eq!((d[0].src(), d[0].dst(), d[0].len()), (0x10000, 0, 8192));
        assert_eq!((d[1].src(), d[1].dst(), d[1].len()), (0x20000, 8192, 100));
    }

    #[test]
    fn test_chain_splits_at_descriptor_cap() {
        let segments = [seg(0x10000, 4096), seg(0x11000, 4096)];
        let chain =
            DescriptorChain::build(&segments, Direction::C2H, 0x800, true, 3000, false).unwrap();

        assert_eq!(chain.len(), 3);
        let lens: Vec<u32> = chain.descriptors().iter().map(|d| d.len()).collect();
        assert_eq!(lens, vec![3000, 3000, 2192]);
        // non-incremental: device side stays fixed, host side advances
        for d in chain.descriptors() {
            assert_eq!(d.src(), 0x800);
        }
        assert_eq!(chain.descriptors()[1].dst(), 0x10000 + 3000);
    }

    #[test]
    fn test_chain_links_and_terminates() {
        let segments: Vec<SgSegment> = (0..20).map(|i| seg(i * 0x2000, 4096)).collect();
        let chain =
            DescriptorChain::build(&segments, Direction::H2C, 0, false, DESC_BLEN_MAX, true)
                .unwrap();
        let d = chain.descriptors();
        let base = chain.bus_addr();

        assert_eq!(d.len(), 20);
        for (i, desc) in d.iter().enumerate().take(19) {
            assert!(desc.has_magic());
            assert_eq!(desc.next(), base + ((i + 1) * DESC_SIZE) as u64);
            assert!(!desc.flags().contains(DescControl::STOPPED));
            assert!(desc.extra_adjacent() <= MAX_EXTRA_ADJ);
        }
        let last = d[19];
        assert_eq!(last.next(), 0);
        assert!(last
            .flags()
            .contains(DescControl::STOPPED | DescControl::COMPLETED | DescControl::EOP));
        assert_eq!(last.extra_adjacent(), 0);
        assert!(chain.first_adjacent() <= MAX_EXTRA_ADJ);
    }

    #[test]
    fn test_adjacency_respects_page_boundary() {
        // next descriptor sits in the last slot of a page: nothing extra may follow
        assert_eq!(extra_adjacent(0x1fe0, 10), 0);
        assert_eq!(extra_adjacent(0x1fc0, 10), 1);
        assert_eq!(extra_adjacent(0x1000, 100), MAX_EXTRA_ADJ);
        assert_eq!(extra_adjacent(0x1000, 2), 2);
    }

    #[test]
    fn test_chain_rejects_overflow() {
        let segments: Vec<SgSegment> = (0..(TRANSFER_MAX_DESC as u64 + 1))
            .map(|i| seg(i * 0x2000, 16))
            .collect();
        let err = DescriptorChain::build(&segments, Direction::H2C, 0, false, DESC_BLEN_MAX, false)
            .unwrap_err();
        assert!(matches!(err, DmaError::DescriptorOverflow { needed, .. } if needed == TRANSFER_MAX_DESC + 1));
    }

    #[test]
    fn test_ring_links_back_to_first() {
        let results: Vec<MdlxResult> = (0..4).map(|_| MdlxResult::new()).collect();
        let pages = [0x1000, 0x3000, 0x5000, 0x7000];
        let ring = DescriptorChain::ring(&pages, 4096, &results).unwrap();
        let d = ring.descriptors();

        assert_eq!(d[3].next(), ring.bus_addr());
        assert_eq!(d[2].src(), results[2].bus_addr());
        assert_eq!(d[2].dst(), 0x5000);
        assert!(d.iter().all(|x| !x.flags().contains(DescControl::STOPPED)));
    }

    #[test]
    fn test_writeback_and_result_records() {
        let wb = PollWriteback::new();
        wb.store(WB_ERR_MASK | 7);
        assert_eq!(wb.completed(), 7);
        assert!(wb.has_error());
        wb.reset();
        assert_eq!(wb.raw(), 0);

        let res = MdlxResult::new();
        assert!(!res.is_valid());
        res.publish(100, true);
        assert!(res.is_valid() && res.is_eop());
        assert_eq!(res.length(), 100);
        res.clear();
        assert!(!res.is_valid());
    }
}

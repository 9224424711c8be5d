// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! User buffer pinning and scatter-gather list construction.
//!
//! A buffer handed to a channel is pinned page by page, validated, and turned
//! into one scatter-gather segment per page. The resulting [`PinnedBuffer`]
//! owns the page references and releases them exactly once: either through
//! [`unmap`] or, on any early-return path, when it is dropped.
//!
//! # Platform Support
//!
//! [`HostPinner`] locks pages with `mlock` on Linux and uses the host virtual
//! address as the bus address (the engine shares the process address space).
//! On other platforms it skips locking.

use crate::error::{DmaError, DmaResult};
use crate::regs::{ChannelCaps, Direction, PAGE_SHIFT, PAGE_SIZE};
use std::fmt;
use std::sync::Arc;

const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Reference to one pinned page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef {
    /// Bus address of the page frame.
    pub phys: u64,
}

/// Source of page pins.
///
/// Implementations pin the pages of a caller's virtual range and later drop
/// those pins again. Every page appended to `pages` counts as pinned and will
/// be passed back to [`release_page`](PagePinner::release_page) exactly once.
pub trait PagePinner: Send + Sync {
    /// Pin up to `count` pages starting at the page-aligned address `first_page`,
    /// appending them to `pages`. Returns how many were pinned, which may be
    /// fewer than requested.
    fn pin_pages(&self, first_page: usize, count: usize, pages: &mut Vec<PageRef>)
        -> DmaResult<usize>;

    /// Drop one page pin, marking the page dirty first when `dirty` is set.
    fn release_page(&self, page: PageRef, dirty: bool);
}

/// One physically contiguous piece of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    /// Bus address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
}

/// Ordered scatter-gather list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgTable {
    segments: Vec<SgSegment>,
}

impl SgTable {
    /// Build a table from raw segments.
    pub fn from_segments(segments: Vec<SgSegment>) -> Self {
        Self { segments }
    }

    /// The segments, in buffer order.
    #[inline]
    pub fn segments(&self) -> &[SgSegment] {
        &self.segments
    }

    /// Number of segments.
    #[inline]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if the table has no segments.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Sum of segment lengths.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len as usize).sum()
    }
}

/// Pinned pages backing one user memory range, plus its scatter-gather list.
pub struct PinnedBuffer {
    pinner: Arc<dyn PagePinner>,
    pages: Vec<PageRef>,
    sgt: SgTable,
    addr: usize,
    len: usize,
    direction: Direction,
}

impl PinnedBuffer {
    /// Scatter-gather list over the pinned pages.
    #[inline]
    pub fn sg_table(&self) -> &SgTable {
        &self.sgt
    }

    /// Number of pinned pages.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Start address of the user range.
    #[inline]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Length of the user range in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for an empty range (never produced by [`map`]).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Direction of the transfer the buffer was mapped for.
    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Release every pinned page. Pages are dirtied when the device wrote
    /// into them (C2H). Returns the number of pages released.
    pub fn unmap(mut self) -> usize {
        self.release()
    }

    fn release(&mut self) -> usize {
        let dirty = self.direction == Direction::C2H;
        let count = self.pages.len();
        for page in self.pages.drain(..) {
            self.pinner.release_page(page, dirty);
        }
        self.sgt.segments.clear();
        count
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        if !self.pages.is_empty() {
            log::trace!(
                "releasing {} pinned pages of {:#x}+{} on drop",
                self.pages.len(),
                self.addr,
                self.len
            );
            self.release();
        }
    }
}

impl fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("pages", &self.pages.len())
            .field("direction", &self.direction)
            .finish()
    }
}

/// Number of pages spanned by `[addr, addr + len)`.
#[inline]
pub fn pages_spanned(addr: usize, len: usize) -> usize {
    ((addr + len + PAGE_SIZE - 1) - (addr & PAGE_MASK)) >> PAGE_SHIFT
}

/// Pin every page of `[addr, addr + len)` and build its scatter-gather list.
///
/// # Errors
///
/// - `InvalidLength` for an empty range or a residual not covered by pages
/// - `OutOfMemory` if the page or segment table cannot be allocated
/// - `FaultError` if fewer pages were pinned than the range spans
/// - `DuplicatePage` if two consecutive pages resolve to the same frame
///
/// Pages pinned before a failure are released before returning.
pub fn map(
    pinner: &Arc<dyn PagePinner>,
    addr: usize,
    len: usize,
    direction: Direction,
) -> DmaResult<PinnedBuffer> {
    if len == 0 {
        return Err(DmaError::InvalidLength { residual: 0 });
    }
    let pages_nr = pages_spanned(addr, len);

    let mut segments = Vec::new();
    segments
        .try_reserve_exact(pages_nr)
        .map_err(|_| DmaError::OutOfMemory("segment table"))?;
    let mut pages = Vec::new();
    pages
        .try_reserve_exact(pages_nr)
        .map_err(|_| DmaError::OutOfMemory("page table"))?;

    let dirty = direction == Direction::C2H;
    let mut pages = scopeguard::guard(pages, |pages| {
        if !pages.is_empty() {
            log::warn!("releasing {}/{} partially pinned pages", pages.len(), pages_nr);
        }
        for page in pages {
            pinner.release_page(page, dirty);
        }
    });

    let pinned = pinner.pin_pages(addr & PAGE_MASK, pages_nr, &mut pages)?;
    if pinned != pages_nr || pages.len() != pages_nr {
        log::error!(
            "unable to pin down all {} user pages, {}",
            pages_nr,
            pages.len()
        );
        return Err(DmaError::FaultError {
            pinned: pages.len(),
            requested: pages_nr,
        });
    }

    if let Some(index) = (1..pages.len()).find(|&i| pages[i - 1].phys == pages[i].phys) {
        log::error!("duplicate pages, {}, {}", index - 1, index);
        return Err(DmaError::DuplicatePage { index });
    }

    let mut buf = addr;
    let mut remaining = len;
    for page in pages.iter() {
        let offset = buf & (PAGE_SIZE - 1);
        let nbytes = (PAGE_SIZE - offset).min(remaining);
        segments.push(SgSegment {
            addr: page.phys + offset as u64,
            len: nbytes as u32,
        });
        buf += nbytes;
        remaining -= nbytes;
    }
    if remaining != 0 {
        log::error!("invalid user buffer length, {} bytes unmapped", remaining);
        return Err(DmaError::InvalidLength {
            residual: remaining,
        });
    }

    let pages = scopeguard::ScopeGuard::into_inner(pages);
    log::trace!(
        "mapped {:#x}+{} as {} segments, {}",
        addr,
        len,
        segments.len(),
        direction
    );
    Ok(PinnedBuffer {
        pinner: Arc::clone(pinner),
        pages,
        sgt: SgTable { segments },
        addr,
        len,
        direction,
    })
}

/// Release a pinned buffer. Returns the number of pages released.
#[inline]
pub fn unmap(buffer: PinnedBuffer) -> usize {
    buffer.unmap()
}

/// Check a request against the channel's addressing rule.
///
/// Non-incremental (streaming) addressing requires an aligned buffer, a length
/// that is a multiple of the granularity, and, for position-sensitive
/// transfers, an aligned device offset. Incremental addressing requires the
/// host and device addresses to be co-aligned.
pub fn check_alignment(
    caps: &ChannelCaps,
    addr: usize,
    len: usize,
    offset: u64,
    position_sensitive: bool,
) -> DmaResult<()> {
    let align = caps.align_mask();
    let buf_lsb = addr as u64 & align;
    let pos_lsb = offset & align;
    let err = || DmaError::AlignmentError { addr, len, offset };

    if caps.non_incr_addr {
        let len_lsb = len as u64 & caps.granularity_mask();
        if buf_lsb != 0 {
            log::debug!("non-aligned buffer address {:#x}", addr);
            return Err(err());
        }
        if pos_lsb != 0 && position_sensitive {
            log::debug!("non-aligned device address {:#x}", offset);
            return Err(err());
        }
        if len_lsb != 0 {
            log::debug!(
                "length {} is not a multiple of {}",
                len,
                caps.len_granularity
            );
            return Err(err());
        }
    } else if buf_lsb != pos_lsb {
        log::debug!(
            "misaligned host {:#x} and device {:#x} addresses",
            addr,
            offset
        );
        return Err(err());
    }
    Ok(())
}

/// Pins host pages in place; bus address equals virtual address.
#[derive(Debug, Clone)]
pub struct HostPinner {
    lock: bool,
}

impl HostPinner {
    /// Pinner that locks pages into memory.
    pub fn new() -> Self {
        Self { lock: true }
    }

    /// Pinner that only translates addresses without locking pages.
    ///
    /// Useful where `RLIMIT_MEMLOCK` is small and the engine is a software model.
    pub fn unlocked() -> Self {
        Self { lock: false }
    }
}

impl Default for HostPinner {
    fn default() -> Self {
        Self::new()
    }
}

impl PagePinner for HostPinner {
    fn pin_pages(
        &self,
        first_page: usize,
        count: usize,
        pages: &mut Vec<PageRef>,
    ) -> DmaResult<usize> {
        #[cfg(target_os = "linux")]
        if self.lock {
            // SAFETY: mlock only changes residency of the range; it never
            // dereferences it and fails cleanly for unmapped addresses.
            let rc = unsafe { libc::mlock(first_page as *const libc::c_void, count * PAGE_SIZE) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                log::error!("unable to pin down {} user pages, {}", count, err);
                return Err(match err.raw_os_error() {
                    Some(libc::ENOMEM) | Some(libc::EAGAIN) => DmaError::OutOfMemory("page lock"),
                    _ => DmaError::FaultError {
                        pinned: 0,
                        requested: count,
                    },
                });
            }
        }
        pages.extend((0..count).map(|i| PageRef {
            phys: (first_page + i * PAGE_SIZE) as u64,
        }));
        Ok(count)
    }

    fn release_page(&self, page: PageRef, dirty: bool) {
        // The device wrote through the shared mapping, so a dirty page needs
        // no extra bookkeeping here.
        let _ = dirty;
        #[cfg(target_os = "linux")]
        if self.lock {
            // SAFETY: see pin_pages; munlock of a page we locked.
            unsafe { libc::munlock(page.phys as usize as *const libc::c_void, PAGE_SIZE) };
        }
        #[cfg(not(target_os = "linux"))]
        let _ = page;
    }
}

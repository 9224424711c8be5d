// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Owned host buffers with caller-chosen alignment.
//!
//! Asynchronous requests hand their buffers to the driver until the last leg
//! completes; `DmaBuffer` gives them a stable heap address and lets the caller
//! meet a channel's address alignment.

use crate::error::{DmaError, DmaResult};
use crate::regs::PAGE_SIZE;
use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Heap buffer with a fixed address and alignment.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: DmaBuffer uniquely owns its allocation, like Box<[u8]>.
unsafe impl Send for DmaBuffer {}
// SAFETY: shared access only hands out &[u8].
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate `len` zeroed bytes aligned to `align` (a power of two).
    pub fn zeroed(len: usize, align: usize) -> DmaResult<Self> {
        let layout = Layout::from_size_align(len.max(1), align)
            .map_err(|e| DmaError::InvalidArgument(format!("buffer layout: {}", e)))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(DmaError::OutOfMemory("DMA buffer"))?;
        Ok(Self { ptr, len, layout })
    }

    /// Allocate `len` zeroed bytes on a page boundary.
    pub fn page_aligned(len: usize) -> DmaResult<Self> {
        Self::zeroed(len, PAGE_SIZE)
    }

    /// Copy `data` into a new buffer aligned to `align`.
    pub fn from_slice(data: &[u8], align: usize) -> DmaResult<Self> {
        let mut buf = Self::zeroed(data.len(), align)?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    /// Start address of the buffer.
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Alignment the buffer was allocated with.
    #[inline]
    pub fn align(&self) -> usize {
        self.layout.align()
    }
}

impl Deref for DmaBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialized bytes for the buffer's lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for DmaBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and uniquely borrowed through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("align", &self.align())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_honored() {
        let buf = DmaBuffer::zeroed(100, 64).unwrap();
        assert_eq!(buf.addr() % 64, 0);
        assert_eq!(buf.len(), 100);
        assert!(buf.iter().all(|&b| b == 0));

        let page = DmaBuffer::page_aligned(8192).unwrap();
        assert_eq!(page.addr() % PAGE_SIZE, 0);
    }

    #[test]
    fn test_from_slice_copies() {
        let buf = DmaBuffer::from_slice(b"sgdma", 8).unwrap();
        assert_eq!(&buf[..], b"sgdma");
    }

    #[test]
    fn test_rejects_bad_alignment() {
        assert!(matches!(
            DmaBuffer::zeroed(16, 3),
            Err(DmaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_buffer() {
        let buf = DmaBuffer::zeroed(0, 64).unwrap();
        assert!(buf.is_empty());
    }
}

// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Register access for engine and SGDMA register blocks.
//!
//! A [`RegisterBlock`] is anything that answers 32-bit reads and writes at a
//! byte offset: a memory-mapped BAR on real hardware, a [`BarWindow`] onto
//! one channel's slice of a BAR, or the software engine used in tests.
//!
//! # Platform Support
//!
//! [`MmapBar`] is only available on Linux. On other platforms,
//! [`MmapBar::open`] returns `DmaError::PlatformNotSupported`.

use crate::error::DmaResult;
use crate::regs::{
    engine_reg, sgdma_reg, Direction, C2H_CHANNEL_OFFSET, CHANNEL_NUM_MAX, CHANNEL_SPACING,
    SGDMA_OFFSET_FROM_CHANNEL,
};
use std::sync::Arc;

/// 32-bit register window.
///
/// Offsets are byte offsets from the start of the window and must be DWORD aligned.
pub trait RegisterBlock: Send + Sync {
    /// Read one 32-bit register.
    fn read32(&self, offset: usize) -> u32;
    /// Write one 32-bit register.
    fn write32(&self, offset: usize, value: u32);
}

/// Offset of a channel's engine register block within the config BAR.
pub fn engine_base(direction: Direction, index: usize) -> DmaResult<usize> {
    if index >= CHANNEL_NUM_MAX {
        return Err(crate::error::DmaError::InvalidArgument(format!(
            "channel index {} out of range (max {})",
            index,
            CHANNEL_NUM_MAX - 1
        )));
    }
    let dir_base = match direction {
        Direction::H2C => 0,
        Direction::C2H => C2H_CHANNEL_OFFSET,
    };
    Ok(dir_base + index * CHANNEL_SPACING)
}

/// Typed access to one channel's engine and SGDMA register blocks.
///
/// The engine block sits at offset 0 of the window, the SGDMA block at
/// [`SGDMA_OFFSET_FROM_CHANNEL`].
#[derive(Clone)]
pub struct EngineRegs {
    regs: Arc<dyn RegisterBlock>,
}

impl EngineRegs {
    pub fn new(regs: Arc<dyn RegisterBlock>) -> Self {
        Self { regs }
    }

    #[inline]
    pub fn read(&self, reg: usize) -> u32 {
        self.regs.read32(reg)
    }

    #[inline]
    pub fn write(&self, reg: usize, value: u32) {
        log::trace!("engine reg {:#06x} <- {:#010x}", reg, value);
        self.regs.write32(reg, value);
    }

    #[inline]
    pub fn read_sgdma(&self, reg: usize) -> u32 {
        self.regs.read32(SGDMA_OFFSET_FROM_CHANNEL + reg)
    }

    #[inline]
    pub fn write_sgdma(&self, reg: usize, value: u32) {
        log::trace!("sgdma reg {:#06x} <- {:#010x}", reg, value);
        self.regs.write32(SGDMA_OFFSET_FROM_CHANNEL + reg, value);
    }

    /// Program the first descriptor of a chain.
    pub fn set_first_desc(&self, bus_addr: u64, adjacent: u32) {
        self.write_sgdma(sgdma_reg::FIRST_DESC_LO, (bus_addr & 0xffff_ffff) as u32);
        self.write_sgdma(sgdma_reg::FIRST_DESC_HI, (bus_addr >> 32) as u32);
        self.write_sgdma(sgdma_reg::FIRST_DESC_ADJACENT, adjacent);
    }

    /// Program the poll-mode write-back address.
    pub fn set_poll_writeback(&self, bus_addr: u64) {
        self.write(engine_reg::POLL_MODE_WB_LO, (bus_addr & 0xffff_ffff) as u32);
        self.write(engine_reg::POLL_MODE_WB_HI, (bus_addr >> 32) as u32);
    }
}

/// A sub-window of a larger register block.
pub struct BarWindow {
    bar: Arc<dyn RegisterBlock>,
    base: usize,
}

impl BarWindow {
    /// Window starting `base` bytes into `bar`.
    pub fn new(bar: Arc<dyn RegisterBlock>, base: usize) -> Self {
        Self { bar, base }
    }

    /// Window onto the registers of one channel.
    pub fn channel(
        bar: Arc<dyn RegisterBlock>,
        direction: Direction,
        index: usize,
    ) -> DmaResult<Self> {
        Ok(Self::new(bar, engine_base(direction, index)?))
    }
}

impl RegisterBlock for BarWindow {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        self.bar.read32(self.base + offset)
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        self.bar.write32(self.base + offset, value)
    }
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use crate::error::DmaError;
    use std::fs::File;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    /// A memory-mapped PCI BAR, e.g. `/sys/bus/pci/devices/<bdf>/resource0`.
    pub struct MmapBar {
        base: *mut u8,
        size: usize,
    }

    // SAFETY: the mapping is owned, stays valid until drop, and every access is
    // a single volatile DWORD load or store.
    unsafe impl Send for MmapBar {}
    // SAFETY: see above; register accesses carry no Rust-level aliasing.
    unsafe impl Sync for MmapBar {}

    impl MmapBar {
        /// Map a whole resource file read/write.
        ///
        /// # Errors
        ///
        /// Returns an error if:
        /// - The file cannot be opened (permissions, not found)
        /// - The resource is empty
        /// - Memory mapping fails
        pub fn open(path: &Path) -> DmaResult<Self> {
            let file = File::options()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        DmaError::PermissionDenied(path.display().to_string())
                    } else {
                        DmaError::Io(e)
                    }
                })?;
            let size = file.metadata()?.len() as usize;
            if size == 0 {
                return Err(DmaError::MmapFailed(format!(
                    "{} has zero length",
                    path.display()
                )));
            }

            // SAFETY: mapping a file we own with a length taken from its metadata.
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(DmaError::MmapFailed(format!(
                    "mmap failed for {}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }
            log::info!("mapped {} ({} bytes)", path.display(), size);

            // The mapping outlives the file descriptor.
            Ok(Self {
                base: base as *mut u8,
                size,
            })
        }

        /// Size of the mapping in bytes.
        pub fn size(&self) -> usize {
            self.size
        }

        #[inline]
        fn reg(&self, offset: usize) -> Option<*mut u32> {
            if offset % 4 != 0 || offset + 4 > self.size {
                log::error!("register offset {:#x} outside BAR of {} bytes", offset, self.size);
                return None;
            }
            // SAFETY: offset is within the mapping and DWORD aligned.
            Some(unsafe { self.base.add(offset) } as *mut u32)
        }
    }

    impl RegisterBlock for MmapBar {
        fn read32(&self, offset: usize) -> u32 {
            match self.reg(offset) {
                // SAFETY: valid, aligned pointer into the live mapping.
                Some(ptr) => u32::from_le(unsafe { std::ptr::read_volatile(ptr) }),
                None => u32::MAX,
            }
        }

        fn write32(&self, offset: usize, value: u32) {
            if let Some(ptr) = self.reg(offset) {
                // SAFETY: valid, aligned pointer into the live mapping.
                unsafe { std::ptr::write_volatile(ptr, value.to_le()) };
            }
        }
    }

    impl Drop for MmapBar {
        fn drop(&mut self) {
            // SAFETY: base/size came from a successful mmap.
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}

// ============================================================================
// Non-Linux Implementation
// ============================================================================

#[cfg(not(target_os = "linux"))]
mod other_impl {
    use super::*;
    use crate::error::DmaError;
    use std::path::Path;

    /// Memory-mapped PCI BAR (not supported on this platform).
    pub struct MmapBar {
        _private: (),
    }

    impl MmapBar {
        /// Returns `PlatformNotSupported`.
        pub fn open(_path: &Path) -> DmaResult<Self> {
            Err(DmaError::PlatformNotSupported)
        }

        pub fn size(&self) -> usize {
            0
        }
    }

    impl RegisterBlock for MmapBar {
        fn read32(&self, _offset: usize) -> u32 {
            u32::MAX
        }

        fn write32(&self, _offset: usize, _value: u32) {}
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::MmapBar;

#[cfg(not(target_os = "linux"))]
pub use other_impl::MmapBar;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<(usize, u32)>>,
    }

    impl RegisterBlock for Recorder {
        fn read32(&self, offset: usize) -> u32 {
            offset as u32
        }

        fn write32(&self, offset: usize, value: u32) {
            self.writes.lock().unwrap().push((offset, value));
        }
    }

    #[test]
    fn test_engine_base_layout() {
        assert_eq!(engine_base(Direction::H2C, 0).unwrap(), 0x0000);
        assert_eq!(engine_base(Direction::H2C, 3).unwrap(), 0x0300);
        assert_eq!(engine_base(Direction::C2H, 1).unwrap(), 0x1100);
        assert!(engine_base(Direction::C2H, 4).is_err());
    }

    #[test]
    fn test_window_and_sgdma_offsets() {
        let rec = Arc::new(Recorder::default());
        let window = BarWindow::channel(rec.clone(), Direction::C2H, 2).unwrap();
        let regs = EngineRegs::new(Arc::new(window));

        assert_eq!(regs.read(engine_reg::STATUS), 0x1200 + 0x40);
        regs.set_first_desc(0x0000_0001_dead_b000, 5);

        let writes = rec.writes.lock().unwrap();
        assert_eq!(
            *writes,
            vec![
                (0x1200 + 0x4000 + 0x80, 0xdead_b000),
                (0x1200 + 0x4000 + 0x84, 0x1),
                (0x1200 + 0x4000 + 0x88, 5),
            ]
        );
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn test_mmap_not_supported() {
        assert!(MmapBar::open(std::path::Path::new("resource0")).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_mmap_missing_resource() {
        let err = MmapBar::open(std::path::Path::new("/nonexistent/resource0"));
        assert!(err.is_err());
    }
}

// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # MDLX Scatter-Gather DMA Core
//!
//! Data-transfer core for MDLX PCIe FPGA accelerators: user buffers are
//! pinned and described by scatter-gather tables, turned into hardware
//! descriptor chains, run on a per-direction DMA engine, and completed by a
//! pool of polling workers.
//!
//! ## Transfer paths
//!
//! | Path | Entry point | Completion |
//! |------|-------------|------------|
//! | Blocking | [`Channel::write`], [`Channel::read`], [`Channel::submit_and_wait`] | caller waits, with timeout |
//! | Non-blocking | [`Channel::submit_nowait`] | callback on the servicing thread |
//! | Multi-buffer | [`submit_async`] | one aggregate [`AioResult`] |
//! | Streaming receive | [`CyclicReceiver`] | caller drains a ring |
//!
//! ## Platform Support
//!
//! | Platform | BAR access | Page pinning | Worker affinity |
//! |----------|------------|--------------|-----------------|
//! | Linux    | `mmap` of a PCI resource file | `mlock` | `sched_setaffinity` |
//! | Other    | not available | no locking | skipped |
//!
//! Host buffers are handed to the device by virtual address, which requires
//! an IOMMU in shared-virtual-addressing mode (or an identity-mapped test
//! setup such as [`soft::SoftEngine`]).
//!
//! ## Example
//!
//! ```rust,no_run
//! use mdlx_sgdma::{BarWindow, Direction, DmaError, DriverRuntime, MmapBar, RuntimeConfig};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), DmaError> {
//!     let bar = Arc::new(MmapBar::open(Path::new("/sys/bus/pci/devices/0000:03:00.0/resource0"))?);
//!     let mut runtime = DriverRuntime::new(RuntimeConfig::default())?;
//!     runtime.start()?;
//!
//!     let c2h = runtime.open_channel(
//!         "c2h0",
//!         Arc::new(BarWindow::channel(bar, Direction::C2H, 0)?),
//!         Direction::C2H,
//!     )?;
//!     let mut data = vec![0u8; 4096];
//!     let n = c2h.read(&mut data, 0)?;
//!     println!("read {} bytes", n);
//!     Ok(())
//! }
//! ```

pub mod aio;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod cyclic;
pub mod descriptor;
pub mod error;
pub mod mapper;
pub mod mmio;
pub mod regs;
pub mod runtime;
pub mod soft;
pub mod worker;

pub use aio::{submit_async, AioHandle, AioResult, LegErrors};
#[cfg(feature = "async")]
pub use aio::submit_async_oneshot;
pub use buffer::DmaBuffer;
pub use channel::{Channel, ShutdownState, TransferId, TransferOutcome, TransferState};
pub use config::RuntimeConfig;
pub use cyclic::CyclicReceiver;
pub use descriptor::{DescriptorChain, MdlxDesc, MdlxResult, PollWriteback};
pub use error::{DmaError, DmaResult};
pub use mapper::{HostPinner, PagePinner, PinnedBuffer, SgSegment, SgTable};
pub use mmio::{BarWindow, EngineRegs, MmapBar, RegisterBlock};
pub use regs::{ChannelCaps, ControlFlags, Direction, StatusFlags};
pub use runtime::DriverRuntime;
pub use worker::{PollableWorkSource, WorkerHandle, WorkerPool};

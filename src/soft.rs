// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software model of one SGDMA channel, and a fault-injecting page pinner.
//!
//! [`SoftEngine`] answers the same register accesses as a hardware engine:
//! setting the run bit fetches the descriptor chain from the programmed
//! first-descriptor address, moves data, counts completed descriptors and
//! updates the status register and the poll-mode write-back record. It runs
//! synchronously inside the register write that starts it, or later when
//! stalled work is resumed or stream data arrives.
//!
//! [`SoftPinner`] hands out identity-mapped pages and counts every pin,
//! release and dirty mark so tests can assert that nothing leaks.

use crate::descriptor::{MdlxDesc, MdlxResult, PollWriteback};
use crate::error::{DmaError, DmaResult};
use crate::mapper::{PagePinner, PageRef};
use crate::mmio::RegisterBlock;
use crate::regs::{
    engine_reg, sgdma_reg, Alignments, ControlFlags, DescControl, Direction, StatusFlags,
    ID_STREAMING, PAGE_SIZE, SGDMA_OFFSET_FROM_CHANNEL, WB_COUNT_MASK, WB_ERR_MASK,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// How the engine reacts to being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftBehavior {
    /// Process the chain immediately.
    Complete,
    /// Stay busy until [`SoftEngine::resume`] or a behavior change.
    Stall,
    /// Stop at once with the given status bits.
    Fail(StatusFlags),
}

struct StreamChunk {
    data: Vec<u8>,
    pos: usize,
    eop: bool,
}

struct SoftState {
    identifier: u32,
    alignments: u32,
    control: u32,
    status: u32,
    completed: u32,
    interrupt_mask: u32,
    wb_addr: u64,
    first_desc: u64,
    adjacent: u32,
    cursor: Option<u64>,
    behavior: SoftBehavior,
    memory: Option<Vec<u8>>,
    inbound: VecDeque<StreamChunk>,
    outbound: Vec<u8>,
    starts: usize,
}

/// Register-level software model of one DMA channel.
pub struct SoftEngine {
    direction: Direction,
    streaming: bool,
    state: Mutex<SoftState>,
}

fn set_lo(value: &mut u64, lo: u32) {
    *value = (*value & !0xffff_ffff) | u64::from(lo);
}

fn set_hi(value: &mut u64, hi: u32) {
    *value = (*value & 0xffff_ffff) | (u64::from(hi) << 32);
}

impl SoftEngine {
    /// Create an idle engine of the given direction.
    ///
    /// # Safety
    ///
    /// The engine dereferences every descriptor, result, write-back and data
    /// address programmed into it as a host virtual address. The caller must
    /// only hand it chains built over identity-mapped pages (as produced by
    /// [`SoftPinner`] or `HostPinner`) over memory that stays valid while the
    /// engine may process it.
    pub unsafe fn new(direction: Direction, streaming: bool) -> Self {
        let stream_bit = if streaming { ID_STREAMING } else { 0 };
        let identifier = (direction.id() << 16) | stream_bit | 0x6;
        Self {
            direction,
            streaming,
            state: Mutex::new(SoftState {
                identifier,
                alignments: 0,
                control: 0,
                status: 0,
                completed: 0,
                interrupt_mask: 0,
                wb_addr: 0,
                first_desc: 0,
                adjacent: 0,
                cursor: None,
                behavior: SoftBehavior::Complete,
                memory: None,
                inbound: VecDeque::new(),
                outbound: Vec::new(),
                starts: 0,
            }),
        }
    }

    /// Report these alignment requirements through the alignments register.
    pub fn with_alignments(self, alignments: Alignments) -> Self {
        self.lock().alignments = alignments.to_register();
        self
    }

    /// Back a memory-mapped channel with `size` bytes of card memory.
    pub fn with_memory(self, size: usize) -> Self {
        self.lock().memory = Some(vec![0; size]);
        self
    }

    /// Override the identifier register.
    pub fn with_identifier(self, identifier: u32) -> Self {
        self.lock().identifier = identifier;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change how future starts behave. Switching away from `Stall` applies
    /// the new behavior to work that is currently stalled.
    pub fn set_behavior(&self, behavior: SoftBehavior) {
        let mut st = self.lock();
        st.behavior = behavior;
        if st.cursor.is_some() && st.status & StatusFlags::BUSY.bits() != 0 {
            match behavior {
                SoftBehavior::Complete => self.process(&mut st),
                SoftBehavior::Fail(flags) => self.fail(&mut st, flags),
                SoftBehavior::Stall => {}
            }
        }
    }

    /// Process stalled work once, regardless of behavior.
    pub fn resume(&self) {
        let mut st = self.lock();
        if st.cursor.is_some() {
            self.process(&mut st);
        }
    }

    /// Feed card-to-host stream data; `eop` marks the end of a packet.
    pub fn push_stream(&self, data: &[u8], eop: bool) {
        let mut st = self.lock();
        st.inbound.push_back(StreamChunk {
            data: data.to_vec(),
            pos: 0,
            eop,
        });
        if st.cursor.is_some() && st.behavior == SoftBehavior::Complete {
            self.process(&mut st);
        }
    }

    /// Take everything a host-to-card stream channel has sent.
    pub fn take_stream(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().outbound)
    }

    /// Copy of the card memory.
    pub fn memory(&self) -> Vec<u8> {
        self.lock().memory.clone().unwrap_or_default()
    }

    /// Overwrite part of the card memory.
    pub fn write_memory(&self, offset: usize, data: &[u8]) {
        if let Some(mem) = self.lock().memory.as_mut() {
            mem[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    /// Number of times the run bit was set.
    pub fn starts(&self) -> usize {
        self.lock().starts
    }

    /// Returns true while the engine holds unfinished work.
    pub fn is_busy(&self) -> bool {
        self.lock().status & StatusFlags::BUSY.bits() != 0
    }

    fn run(&self, st: &mut SoftState) {
        st.starts += 1;
        st.completed = 0;
        st.status = StatusFlags::BUSY.bits();
        st.cursor = Some(st.first_desc);
        match st.behavior {
            SoftBehavior::Complete => self.process(st),
            SoftBehavior::Stall => {}
            SoftBehavior::Fail(flags) => self.fail(st, flags),
        }
    }

    fn halt(&self, st: &mut SoftState) {
        st.cursor = None;
        st.status &= !StatusFlags::BUSY.bits();
    }

    fn fail(&self, st: &mut SoftState, flags: StatusFlags) {
        st.cursor = None;
        st.status = (st.status & !StatusFlags::BUSY.bits())
            | flags.bits()
            | StatusFlags::DESC_STOPPED.bits();
        self.writeback(st, true);
    }

    fn writeback(&self, st: &SoftState, error: bool) {
        if st.control & ControlFlags::POLL_MODE_WB.bits() == 0 || st.wb_addr == 0 {
            return;
        }
        let err_bit = if error { WB_ERR_MASK } else { 0 };
        let value = (st.completed & WB_COUNT_MASK) | err_bit;
        // SAFETY: the constructor contract makes programmed addresses valid.
        unsafe { (*(st.wb_addr as *const PollWriteback)).store(value) };
    }

    fn process(&self, st: &mut SoftState) {
        while let Some(addr) = st.cursor {
            // SAFETY: the constructor contract makes descriptor addresses valid.
            let desc = unsafe { std::ptr::read_volatile(addr as *const MdlxDesc) };
            if !desc.has_magic() {
                self.fail(st, StatusFlags::MAGIC_STOPPED);
                return;
            }
            match self.execute(st, &desc) {
                Ok(true) => {}
                Ok(false) => return,
                Err(flags) => {
                    self.fail(st, flags);
                    return;
                }
            }
            st.completed = st.completed.wrapping_add(1);
            self.writeback(st, false);

            if desc.flags().contains(DescControl::STOPPED) || desc.next() == 0 {
                st.cursor = None;
                st.status = (st.status & !StatusFlags::BUSY.bits())
                    | StatusFlags::DESC_STOPPED.bits()
                    | StatusFlags::DESC_COMPLETED.bits();
                return;
            }
            st.cursor = Some(desc.next());
        }
    }

    /// Move one descriptor's data. `Ok(false)` means the engine must wait.
    fn execute(&self, st: &mut SoftState, desc: &MdlxDesc) -> Result<bool, StatusFlags> {
        let len = desc.len() as usize;
        match (self.direction, self.streaming) {
            (Direction::H2C, false) => {
                let dst = desc.dst() as usize;
                if let Some(mem) = st.memory.as_mut() {
                    if dst.checked_add(len).map_or(true, |end| end > mem.len()) {
                        return Err(StatusFlags::H2C_W_DECODE_ERR);
                    }
                    // SAFETY: source is host memory covered by the constructor contract.
                    let src = unsafe { std::slice::from_raw_parts(desc.src() as *const u8, len) };
                    mem[dst..dst + len].copy_from_slice(src);
                }
                Ok(true)
            }
            (Direction::C2H, false) => {
                let src = desc.src() as usize;
                if let Some(mem) = st.memory.as_ref() {
                    if src.checked_add(len).map_or(true, |end| end > mem.len()) {
                        return Err(StatusFlags::C2H_R_DECODE_ERR);
                    }
                    // SAFETY: destination is host memory covered by the constructor contract.
                    let dst =
                        unsafe { std::slice::from_raw_parts_mut(desc.dst() as *mut u8, len) };
                    dst.copy_from_slice(&mem[src..src + len]);
                }
                Ok(true)
            }
            (Direction::H2C, true) => {
                // SAFETY: as above.
                let src = unsafe { std::slice::from_raw_parts(desc.src() as *const u8, len) };
                st.outbound.extend_from_slice(src);
                Ok(true)
            }
            (Direction::C2H, true) => {
                // streaming C2H descriptors carry their result record in the source field
                let result = match desc.src() {
                    0 => None,
                    // SAFETY: as above.
                    addr => Some(unsafe { &*(addr as *const MdlxResult) }),
                };
                if result.is_some_and(|r| r.is_valid()) {
                    // ring full: the reader has not consumed this entry yet
                    return Ok(false);
                }
                if st.inbound.is_empty() {
                    return Ok(false);
                }
                // SAFETY: as above.
                let dst = unsafe { std::slice::from_raw_parts_mut(desc.dst() as *mut u8, len) };
                let mut filled = 0;
                let mut eop = false;
                while filled < len {
                    let Some(chunk) = st.inbound.front_mut() else {
                        break;
                    };
                    let n = (chunk.data.len() - chunk.pos).min(len - filled);
                    dst[filled..filled + n].copy_from_slice(&chunk.data[chunk.pos..chunk.pos + n]);
                    chunk.pos += n;
                    filled += n;
                    if chunk.pos == chunk.data.len() {
                        eop = chunk.eop;
                        st.inbound.pop_front();
                        if eop {
                            break;
                        }
                    }
                }
                if let Some(r) = result {
                    r.publish(filled as u32, eop);
                }
                Ok(true)
            }
        }
    }

    fn control_changed(&self, st: &mut SoftState, old: u32) {
        let run = ControlFlags::RUN_STOP.bits();
        match (old & run != 0, st.control & run != 0) {
            (false, true) => self.run(st),
            (true, false) => self.halt(st),
            _ => {}
        }
    }
}

impl RegisterBlock for SoftEngine {
    fn read32(&self, offset: usize) -> u32 {
        let mut st = self.lock();
        if offset >= SGDMA_OFFSET_FROM_CHANNEL {
            return match offset - SGDMA_OFFSET_FROM_CHANNEL {
                sgdma_reg::IDENTIFIER => (st.identifier & 0xffff_0000) | 0x4006,
                sgdma_reg::FIRST_DESC_LO => (st.first_desc & 0xffff_ffff) as u32,
                sgdma_reg::FIRST_DESC_HI => (st.first_desc >> 32) as u32,
                sgdma_reg::FIRST_DESC_ADJACENT => st.adjacent,
                _ => 0,
            };
        }
        match offset {
            engine_reg::IDENTIFIER => st.identifier,
            engine_reg::CONTROL => st.control,
            engine_reg::STATUS => st.status,
            engine_reg::STATUS_RC => {
                let status = st.status;
                st.status &= StatusFlags::BUSY.bits();
                status
            }
            engine_reg::COMPLETED_DESC_COUNT => st.completed,
            engine_reg::ALIGNMENTS => st.alignments,
            engine_reg::POLL_MODE_WB_LO => (st.wb_addr & 0xffff_ffff) as u32,
            engine_reg::POLL_MODE_WB_HI => (st.wb_addr >> 32) as u32,
            engine_reg::INTERRUPT_ENABLE_MASK => st.interrupt_mask,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut st = self.lock();
        if offset >= SGDMA_OFFSET_FROM_CHANNEL {
            match offset - SGDMA_OFFSET_FROM_CHANNEL {
                sgdma_reg::FIRST_DESC_LO => set_lo(&mut st.first_desc, value),
                sgdma_reg::FIRST_DESC_HI => set_hi(&mut st.first_desc, value),
                sgdma_reg::FIRST_DESC_ADJACENT => st.adjacent = value,
                _ => {}
            }
            return;
        }
        let old = st.control;
        match offset {
            engine_reg::CONTROL => {
                st.control = value;
                self.control_changed(&mut st, old);
            }
            engine_reg::CONTROL_W1S => {
                st.control |= value;
                self.control_changed(&mut st, old);
            }
            engine_reg::CONTROL_W1C => {
                st.control &= !value;
                self.control_changed(&mut st, old);
            }
            engine_reg::POLL_MODE_WB_LO => set_lo(&mut st.wb_addr, value),
            engine_reg::POLL_MODE_WB_HI => set_hi(&mut st.wb_addr, value),
            engine_reg::INTERRUPT_ENABLE_MASK => st.interrupt_mask = value,
            engine_reg::INTERRUPT_ENABLE_MASK_W1S => st.interrupt_mask |= value,
            engine_reg::INTERRUPT_ENABLE_MASK_W1C => st.interrupt_mask &= !value,
            _ => {}
        }
    }
}

/// Fault to inject into a [`SoftPinner`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFault {
    /// Pin only this many pages.
    Short(usize),
    /// Make page `i` resolve to the same frame as page `i - 1`.
    Duplicate(usize),
    /// Fail the call outright.
    Error,
}

/// Identity-mapping page pinner with fault injection and accounting.
#[derive(Debug, Default)]
pub struct SoftPinner {
    calls: AtomicUsize,
    pinned: AtomicUsize,
    released: AtomicUsize,
    dirtied: AtomicUsize,
    faults: Mutex<Vec<(Option<usize>, PinFault)>>,
}

impl SoftPinner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `fault` to the next call.
    pub fn inject(&self, fault: PinFault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((None, fault));
    }

    /// Apply `fault` to the `call`-th call (1-based, counted since creation).
    pub fn inject_on_call(&self, call: usize, fault: PinFault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Some(call), fault));
    }

    pub fn pinned_pages(&self) -> usize {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn released_pages(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn dirtied_pages(&self) -> usize {
        self.dirtied.load(Ordering::SeqCst)
    }

    /// Pages pinned and not yet released.
    pub fn outstanding(&self) -> usize {
        self.pinned_pages() - self.released_pages()
    }

    fn take_fault(&self, call: usize) -> Option<PinFault> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = faults
            .iter()
            .position(|(when, _)| when.map_or(true, |n| n == call))?;
        Some(faults.remove(idx).1)
    }
}

impl PagePinner for SoftPinner {
    fn pin_pages(
        &self,
        first_page: usize,
        count: usize,
        pages: &mut Vec<PageRef>,
    ) -> DmaResult<usize> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fault = self.take_fault(call);
        if fault == Some(PinFault::Error) {
            return Err(DmaError::FaultError {
                pinned: 0,
                requested: count,
            });
        }
        let n = match fault {
            Some(PinFault::Short(n)) => n.min(count),
            _ => count,
        };
        for i in 0..n {
            let page = match fault {
                Some(PinFault::Duplicate(d)) if d == i && i > 0 => i - 1,
                _ => i,
            };
            pages.push(PageRef {
                phys: (first_page + page * PAGE_SIZE) as u64,
            });
        }
        self.pinned.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }

    fn release_page(&self, _page: PageRef, dirty: bool) {
        if dirty {
            self.dirtied.fetch_add(1, Ordering::SeqCst);
        }
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

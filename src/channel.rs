// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA channels and the transfer state machine.
//!
//! A channel is one direction of one engine. Transfers are queued in FIFO
//! order; only the oldest one is programmed into the engine, and the next is
//! started when it reaches a terminal state:
//!
//! ```text
//! NEW -> SUBMITTED -> COMPLETED
//!                  -> FAILED    (engine reported an error, raw status kept)
//!                  -> ABORTED   (timeout, cancellation or shutdown)
//! ```
//!
//! Completion is observed either through the poll-mode write-back record or
//! through the status and completed-count registers, from a worker, from the
//! blocked caller itself, or from an external interrupt path. All of them
//! drive the same logic under the channel lock.

use crate::config::RuntimeConfig;
use crate::descriptor::{DescriptorChain, PollWriteback};
use crate::error::{DmaError, DmaResult};
use crate::mapper::{self, PagePinner, SgSegment, SgTable};
use crate::mmio::{EngineRegs, RegisterBlock};
use crate::regs::{
    engine_reg, Alignments, ChannelCaps, ControlFlags, Direction, StatusFlags, ID_STREAMING,
    TRANSFER_MAX_DESC,
};
use crate::worker::{PollableWorkSource, WorkerHandle};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How long a blocked caller sleeps between its own polls when no worker
/// services the channel.
const SELF_POLL_SLICE: Duration = Duration::from_micros(200);

/// Identifier of a transfer, unique per channel.
pub type TransferId = u64;

/// Callback receiving the result of a non-blocking transfer.
pub type AsyncCompletion = Box<dyn FnOnce(DmaResult<usize>) + Send>;

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    New,
    Submitted,
    Completed,
    Failed,
    Aborted,
}

impl TransferState {
    /// Returns true for `Completed`, `Failed` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Shutdown progress of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    None,
    Requested,
    Idle,
}

/// Terminal result of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub id: TransferId,
    pub state: TransferState,
    /// Bytes covered by the descriptors the engine completed.
    pub bytes: usize,
    /// Raw status bits, non-empty for failed transfers.
    pub status: StatusFlags,
}

impl TransferOutcome {
    /// Map the outcome to the caller-visible result.
    pub fn into_result(self) -> DmaResult<usize> {
        match self.state {
            TransferState::Completed => Ok(self.bytes),
            TransferState::Failed => Err(DmaError::device(self.status, self.bytes)),
            _ => Err(DmaError::Timeout { bytes: self.bytes }),
        }
    }
}

enum Completion {
    Sync,
    Async(AsyncCompletion),
    Cyclic,
}

struct Transfer {
    id: TransferId,
    state: TransferState,
    chain: DescriptorChain,
    completion: Completion,
}

impl Transfer {
    fn is_cyclic(&self) -> bool {
        matches!(self.completion, Completion::Cyclic)
    }
}

struct ChannelState {
    caps: ChannelCaps,
    queue: VecDeque<Transfer>,
    shutdown: ShutdownState,
    worker: Option<WorkerHandle>,
    done: HashMap<TransferId, TransferOutcome>,
    next_id: TransferId,
}

/// Finished async callbacks, run once the channel lock is released.
type Finished = Vec<(AsyncCompletion, TransferOutcome)>;

#[derive(Clone, Copy)]
enum Observe {
    Poll,
    Interrupt,
}

/// One direction of one DMA engine.
pub struct Channel {
    name: String,
    direction: Direction,
    regs: EngineRegs,
    pinner: Arc<dyn PagePinner>,
    poll_mode: bool,
    blen_max: u32,
    timeout: Duration,
    writeback: Box<PollWriteback>,
    state: Mutex<ChannelState>,
    cond: Condvar,
}

impl Channel {
    /// Bring up a channel on an engine register window.
    ///
    /// Reads the identifier and rejects an engine of the other direction,
    /// reads the alignment requirements and programs the write-back address.
    pub fn open(
        name: impl Into<String>,
        regs: Arc<dyn RegisterBlock>,
        pinner: Arc<dyn PagePinner>,
        direction: Direction,
        config: &RuntimeConfig,
    ) -> DmaResult<Self> {
        let name = name.into();
        let regs = EngineRegs::new(regs);

        let id = regs.read(engine_reg::IDENTIFIER);
        let found = Direction::from_identifier(id).ok_or_else(|| {
            DmaError::InvalidArgument(format!("{}: unknown engine identifier {:#010x}", name, id))
        })?;
        if found != direction {
            log::error!("{}: engine is {}, requested {}", name, found, direction);
            return Err(DmaError::DirectionMismatch {
                channel: found,
                requested: direction,
            });
        }
        let streaming = id & ID_STREAMING != 0;
        let alignments = Alignments::from_register(regs.read(engine_reg::ALIGNMENTS));
        let caps = ChannelCaps::new(direction, streaming, alignments);

        let writeback = Box::new(PollWriteback::new());
        regs.write(engine_reg::CONTROL_W1C, ControlFlags::RUN_STOP.bits());
        regs.set_poll_writeback(writeback.bus_addr());
        let irq_mask = if config.poll_mode {
            0
        } else {
            ControlFlags::IE_ALL.bits()
        };
        regs.write(engine_reg::INTERRUPT_ENABLE_MASK, irq_mask);

        log::info!(
            "{}: {} {} engine, addr_align {} len_granularity {} addr_bits {}",
            name,
            direction,
            if streaming { "streaming" } else { "memory-mapped" },
            caps.addr_align,
            caps.len_granularity,
            caps.addr_bits
        );

        Ok(Self {
            name,
            direction,
            regs,
            pinner,
            poll_mode: config.poll_mode,
            blen_max: config.desc_blen_max,
            timeout: config.sgdma_timeout,
            writeback,
            state: Mutex::new(ChannelState {
                caps,
                queue: VecDeque::new(),
                shutdown: ShutdownState::None,
                worker: None,
                done: HashMap::new(),
                next_id: 1,
            }),
            cond: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Pinner used to map caller buffers for this channel.
    pub fn pinner(&self) -> &Arc<dyn PagePinner> {
        &self.pinner
    }

    /// Direction, addressing mode and alignment requirements.
    pub fn capabilities(&self) -> ChannelCaps {
        self.lock().caps
    }

    /// Number of queued transfers, including the running one.
    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Progress of [`shutdown`](Self::shutdown).
    pub fn shutdown_state(&self) -> ShutdownState {
        self.lock().shutdown
    }

    /// Id of the worker servicing this channel, if any.
    pub fn worker_id(&self) -> Option<usize> {
        self.lock().worker.as_ref().map(WorkerHandle::id)
    }

    /// Switch between incremental and non-incremental device addressing.
    pub fn set_addressing_mode(&self, non_incremental: bool) {
        let mut st = self.lock();
        st.caps.non_incr_addr = non_incremental;
        let reg = if non_incremental {
            engine_reg::CONTROL_W1S
        } else {
            engine_reg::CONTROL_W1C
        };
        self.regs.write(reg, ControlFlags::NON_INCR_ADDR.bits());
        log::debug!("{}: non-incremental addressing {}", self.name, non_incremental);
    }

    /// Override the alignment requirements read at bring-up.
    ///
    /// The alignments register holds 8-bit fields, so requirements of 256
    /// bytes or more can only be configured here.
    pub fn set_alignments(&self, addr_align: u32, len_granularity: u32) -> DmaResult<()> {
        if !addr_align.is_power_of_two() || !len_granularity.is_power_of_two() {
            return Err(DmaError::InvalidArgument(format!(
                "alignment {} / granularity {} must be powers of two",
                addr_align, len_granularity
            )));
        }
        let mut st = self.lock();
        st.caps.addr_align = addr_align;
        st.caps.len_granularity = len_granularity;
        Ok(())
    }

    fn check_direction(&self, requested: Direction) -> DmaResult<()> {
        if requested != self.direction {
            return Err(DmaError::DirectionMismatch {
                channel: self.direction,
                requested,
            });
        }
        Ok(())
    }

    /// Build a descriptor chain for `segments` at device offset `offset`.
    pub(crate) fn build_chain(&self, offset: u64, segments: &[SgSegment]) -> DmaResult<DescriptorChain> {
        let caps = self.capabilities();
        // streaming engines have no device address
        let dev = if caps.streaming { 0 } else { offset };
        DescriptorChain::build(
            segments,
            self.direction,
            dev,
            caps.non_incr_addr,
            self.blen_max,
            self.direction == Direction::H2C && caps.streaming,
        )
    }

    // ------------------------------------------------------------------
    // engine sequencing
    // ------------------------------------------------------------------

    fn start_head(&self, st: &mut ChannelState) {
        let Some(head) = st.queue.front_mut() else {
            return;
        };
        self.writeback.reset();
        self.regs
            .set_first_desc(head.chain.bus_addr(), head.chain.first_adjacent());

        let mut control = ControlFlags::IE_ALL;
        if self.poll_mode {
            control |= ControlFlags::POLL_MODE_WB;
        }
        if st.caps.non_incr_addr {
            control |= ControlFlags::NON_INCR_ADDR;
        }
        self.regs.write(engine_reg::CONTROL, control.bits());
        self.regs
            .write(engine_reg::CONTROL_W1S, ControlFlags::RUN_STOP.bits());
        log::trace!(
            "{}: started transfer {} ({} descriptors, {} bytes)",
            self.name,
            head.id,
            head.chain.len(),
            head.chain.total_bytes()
        );
    }

    fn completed_count(&self) -> usize {
        if self.poll_mode {
            self.writeback.completed() as usize
        } else {
            self.regs.read(engine_reg::COMPLETED_DESC_COUNT) as usize
        }
    }

    fn stop_engine(&self) {
        self.regs
            .write(engine_reg::CONTROL_W1C, ControlFlags::RUN_STOP.bits());
    }

    fn enqueue(&self, chain: DescriptorChain, completion: Completion) -> Result<TransferId, (DmaError, Completion)> {
        let mut st = self.lock();
        if st.shutdown != ShutdownState::None {
            return Err((DmaError::ChannelShutdown, completion));
        }
        let cyclic = matches!(completion, Completion::Cyclic);
        if let Some(head) = st.queue.front() {
            if head.is_cyclic() || cyclic {
                return Err((
                    DmaError::InvalidArgument(format!("{}: cyclic transfer in progress", self.name)),
                    completion,
                ));
            }
        }

        let id = st.next_id;
        st.next_id += 1;
        let mut transfer = Transfer {
            id,
            state: TransferState::New,
            chain,
            completion,
        };
        transfer.state = TransferState::Submitted;
        st.queue.push_back(transfer);
        if st.queue.len() == 1 {
            self.start_head(&mut st);
        }
        Ok(id)
    }

    /// Pop the head with a terminal state and start the next transfer.
    fn finish_head(&self, st: &mut ChannelState, state: TransferState, bytes: usize, status: StatusFlags, finished: &mut Finished) {
        let Some(mut transfer) = st.queue.pop_front() else {
            return;
        };
        debug_assert!(!transfer.state.is_terminal());
        transfer.state = state;
        let outcome = TransferOutcome {
            id: transfer.id,
            state,
            bytes,
            status,
        };
        log::debug!("{}: transfer {} {:?}, {} bytes", self.name, transfer.id, state, bytes);
        match transfer.completion {
            Completion::Sync => {
                st.done.insert(transfer.id, outcome);
            }
            Completion::Async(callback) => finished.push((callback, outcome)),
            Completion::Cyclic => {}
        }
        if st.shutdown == ShutdownState::None {
            self.start_head(st);
        }
    }

    /// Check the running transfer against the hardware state, repeatedly,
    /// finalizing every transfer that has completed or failed.
    fn poll_locked(&self, st: &mut ChannelState, observe: Observe, finished: &mut Finished) -> usize {
        let mut count = 0;
        loop {
            let Some(head) = st.queue.front() else {
                break;
            };
            if head.is_cyclic() {
                break;
            }
            let total = head.chain.len();

            let (completed, status, wb_error) = match observe {
                Observe::Poll => {
                    let wb_error = self.writeback.has_error();
                    let status = if wb_error {
                        StatusFlags::from_bits_retain(self.regs.read(engine_reg::STATUS_RC))
                    } else {
                        StatusFlags::empty()
                    };
                    (self.writeback.completed() as usize, status, wb_error)
                }
                Observe::Interrupt => {
                    let status =
                        StatusFlags::from_bits_retain(self.regs.read(engine_reg::STATUS_RC));
                    let completed = self.regs.read(engine_reg::COMPLETED_DESC_COUNT) as usize;
                    (completed, status, false)
                }
            };

            if wb_error || !status.errors(self.direction).is_empty() {
                let bytes = head.chain.bytes_in(completed);
                log::error!("{}: engine error, status {:#010x}", self.name, status.bits());
                self.stop_engine();
                self.finish_head(st, TransferState::Failed, bytes, status, finished);
            } else if completed >= total {
                let bytes = head.chain.total_bytes();
                self.finish_head(st, TransferState::Completed, bytes, StatusFlags::empty(), finished);
            } else {
                break;
            }
            count += 1;
        }
        count
    }

    fn service(&self, observe: Observe) -> usize {
        let mut finished = Finished::new();
        let count = {
            let mut st = self.lock();
            self.poll_locked(&mut st, observe, &mut finished)
        };
        if count > 0 {
            self.cond.notify_all();
        }
        run_callbacks(finished);
        count
    }

    /// Drive completion from the poll-mode write-back record (or from the
    /// registers when the channel runs in interrupt mode). Returns the number
    /// of transfers finalized.
    pub fn service_poll(&self) -> usize {
        let observe = if self.poll_mode {
            Observe::Poll
        } else {
            Observe::Interrupt
        };
        self.service(observe)
    }

    /// Drive completion from the status and completed-count registers, as
    /// an interrupt handler would.
    pub fn service_interrupt(&self) -> usize {
        self.service(Observe::Interrupt)
    }

    /// Signal the worker servicing this channel.
    pub fn wake(&self) {
        let handle = self.lock().worker.clone();
        if let Some(handle) = handle {
            handle.wake();
        }
    }

    // ------------------------------------------------------------------
    // synchronous path
    // ------------------------------------------------------------------

    /// Submit a transfer over `sgt` and block until it finishes or `timeout`
    /// elapses. Returns the number of bytes transferred.
    ///
    /// Requests needing more descriptors than one chain may hold are issued as
    /// several sequential transfers; on failure the error carries the bytes
    /// moved so far.
    pub fn submit_and_wait(
        &self,
        write: bool,
        offset: u64,
        sgt: &SgTable,
        timeout: Duration,
    ) -> DmaResult<usize> {
        self.check_direction(Direction::from_write(write))?;
        if sgt.is_empty() {
            return Err(DmaError::InvalidLength { residual: 0 });
        }
        let non_incr = self.capabilities().non_incr_addr;

        let mut done = 0usize;
        for group in split_segments(sgt.segments(), self.blen_max) {
            let dev = if non_incr { offset } else { offset + done as u64 };
            let chain = self.build_chain(dev, group)?;
            let id = self
                .enqueue(chain, Completion::Sync)
                .map_err(|(e, _)| e)?;
            self.wake();
            let outcome = self.wait(id, timeout);
            match outcome.into_result() {
                Ok(bytes) => done += bytes,
                Err(DmaError::DeviceError { status, bytes }) => {
                    return Err(DmaError::DeviceError {
                        status,
                        bytes: done + bytes,
                    })
                }
                Err(DmaError::Timeout { bytes }) => {
                    log::error!("{}: transfer {} timed out", self.name, id);
                    return Err(DmaError::Timeout { bytes: done + bytes });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    fn wait(&self, id: TransferId, timeout: Duration) -> TransferOutcome {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock();
        loop {
            if let Some(outcome) = st.done.remove(&id) {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                let mut finished = Finished::new();
                let outcome = self.abort_locked(&mut st, id, &mut finished);
                drop(st);
                run_callbacks(finished);
                return outcome;
            }

            let mut slice = deadline - now;
            if !st.worker.as_ref().is_some_and(WorkerHandle::is_active) {
                // nobody else polls this channel: do it ourselves
                let mut finished = Finished::new();
                let observe = if self.poll_mode { Observe::Poll } else { Observe::Interrupt };
                if self.poll_locked(&mut st, observe, &mut finished) > 0 {
                    self.cond.notify_all();
                }
                if !finished.is_empty() {
                    drop(st);
                    run_callbacks(finished);
                    st = self.lock();
                }
                if st.done.contains_key(&id) {
                    continue;
                }
                slice = slice.min(SELF_POLL_SLICE);
            }
            st = self
                .cond
                .wait_timeout(st, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Abort transfer `id`, stopping the engine if it is running.
    fn abort_locked(&self, st: &mut ChannelState, id: TransferId, finished: &mut Finished) -> TransferOutcome {
        let Some(pos) = st.queue.iter().position(|t| t.id == id) else {
            return st.done.remove(&id).unwrap_or(TransferOutcome {
                id,
                state: TransferState::Aborted,
                bytes: 0,
                status: StatusFlags::empty(),
            });
        };
        let bytes = if pos == 0 {
            self.stop_engine();
            st.queue[0].chain.bytes_in(self.completed_count())
        } else {
            0
        };
        if pos == 0 {
            self.finish_head(st, TransferState::Aborted, bytes, StatusFlags::empty(), finished);
        } else if let Some(transfer) = st.queue.remove(pos) {
            let outcome = TransferOutcome {
                id,
                state: TransferState::Aborted,
                bytes: 0,
                status: StatusFlags::empty(),
            };
            if let Completion::Async(callback) = transfer.completion {
                finished.push((callback, outcome));
            }
        }
        st.done.remove(&id).unwrap_or(TransferOutcome {
            id,
            state: TransferState::Aborted,
            bytes,
            status: StatusFlags::empty(),
        })
    }

    fn transfer(&self, direction: Direction, addr: usize, len: usize, offset: u64) -> DmaResult<usize> {
        self.check_direction(direction)?;
        mapper::check_alignment(&self.capabilities(), addr, len, offset, true)?;
        let pinned = mapper::map(&self.pinner, addr, len, direction)?;
        let result = self.submit_and_wait(direction.is_write(), offset, pinned.sg_table(), self.timeout);
        pinned.unmap();
        result
    }

    /// Write `data` to the device at `offset`, blocking until done.
    pub fn write(&self, data: &[u8], offset: u64) -> DmaResult<usize> {
        self.transfer(Direction::H2C, data.as_ptr() as usize, data.len(), offset)
    }

    /// Read from the device at `offset` into `data`, blocking until done.
    pub fn read(&self, data: &mut [u8], offset: u64) -> DmaResult<usize> {
        self.transfer(Direction::C2H, data.as_mut_ptr() as usize, data.len(), offset)
    }

    // ------------------------------------------------------------------
    // non-blocking path
    // ------------------------------------------------------------------

    /// Queue a prepared chain without blocking. `on_complete` runs exactly
    /// once: with the transfer's result, or at once with the rejection error.
    pub(crate) fn submit_chain(&self, chain: DescriptorChain, on_complete: AsyncCompletion) -> Option<TransferId> {
        match self.enqueue(chain, Completion::Async(on_complete)) {
            Ok(id) => Some(id),
            Err((e, Completion::Async(callback))) => {
                log::debug!("{}: submission rejected: {}", self.name, e);
                callback(Err(e));
                None
            }
            Err(_) => None,
        }
    }

    /// Queue a transfer over `sgt` without blocking.
    ///
    /// `on_complete` runs exactly once, on the thread that observes the
    /// completion, outside the channel lock. When the request is rejected it
    /// runs before this returns `None`. The caller keeps `sgt`'s pages pinned
    /// until then. The servicing worker is not woken; call [`wake`](Self::wake)
    /// after a batch of submissions.
    pub fn submit_nowait(
        &self,
        write: bool,
        offset: u64,
        sgt: &SgTable,
        on_complete: impl FnOnce(DmaResult<usize>) + Send + 'static,
    ) -> Option<TransferId> {
        let chain = self
            .check_direction(Direction::from_write(write))
            .and_then(|()| self.build_chain(offset, sgt.segments()));
        match chain {
            Ok(chain) => self.submit_chain(chain, Box::new(on_complete)),
            Err(e) => {
                on_complete(Err(e));
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // cyclic streaming
    // ------------------------------------------------------------------

    pub(crate) fn start_cyclic(&self, chain: DescriptorChain) -> DmaResult<TransferId> {
        self.enqueue(chain, Completion::Cyclic).map_err(|(e, _)| e)
    }

    pub(crate) fn stop_cyclic(&self, id: TransferId) {
        let mut finished = Finished::new();
        {
            let mut st = self.lock();
            if st.queue.front().is_some_and(|t| t.id == id) {
                self.stop_engine();
                self.finish_head(&mut st, TransferState::Aborted, 0, StatusFlags::empty(), &mut finished);
            }
        }
        run_callbacks(finished);
    }

    // ------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------

    /// Stop the engine, abort everything queued and detach from the worker.
    ///
    /// Blocked callers return `Timeout`; async callbacks receive `Timeout`
    /// with zero bytes. Later submissions fail with `ChannelShutdown`.
    pub fn shutdown(&self) {
        let mut finished = Finished::new();
        let worker = {
            let mut st = self.lock();
            if st.shutdown != ShutdownState::None {
                return;
            }
            st.shutdown = ShutdownState::Requested;
            self.stop_engine();
            let aborted = st.queue.len();
            while !st.queue.is_empty() {
                self.finish_head(&mut st, TransferState::Aborted, 0, StatusFlags::empty(), &mut finished);
            }
            st.shutdown = ShutdownState::Idle;
            log::info!("{}: shut down, {} transfers aborted", self.name, aborted);
            st.worker.take()
        };
        self.cond.notify_all();
        run_callbacks(finished);
        if let Some(worker) = worker {
            worker.detach(self as *const Self as *const ());
        }
    }
}

fn run_callbacks(finished: Finished) {
    for (callback, outcome) in finished {
        callback(outcome.into_result());
    }
}

/// Split segments into groups that each fit one descriptor chain.
fn split_segments(segments: &[SgSegment], blen_max: u32) -> Vec<&[SgSegment]> {
    let cap = u64::from(blen_max.max(1));
    let mut groups = Vec::new();
    let mut start = 0;
    let mut descs = 0u64;
    for (i, seg) in segments.iter().enumerate() {
        let need = u64::from(seg.len).div_ceil(cap).max(1);
        if descs + need > TRANSFER_MAX_DESC as u64 && i > start {
            groups.push(&segments[start..i]);
            start = i;
            descs = 0;
        }
        descs += need;
    }
    if start < segments.len() {
        groups.push(&segments[start..]);
    }
    groups
}

impl PollableWorkSource for Channel {
    fn has_pending(&self) -> bool {
        self.lock().queue.front().is_some_and(|t| !t.is_cyclic())
    }

    fn process_pending(&self) {
        self.service_poll();
    }

    fn attach(&self, worker: Option<WorkerHandle>) {
        self.lock().worker = worker;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // queued async callbacks must still run exactly once
        self.shutdown();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("poll_mode", &self.poll_mode)
            .finish()
    }
}

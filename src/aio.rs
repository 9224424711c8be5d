// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Asynchronous multi-buffer I/O.
//!
//! One request fans out into one leg per buffer, all at the same device offset. Legs
//! are validated, mapped and queued independently; a leg that fails early
//! still reports, so the request always sees exactly as many completions as
//! it has legs. The last completion delivers an [`AioResult`] to the caller,
//! exactly once.
//!
//! A completing leg only *tries* the context lock. If the lock is held (a
//! cancellation is being applied), the leg is unmapped, counted, and reported
//! as `Busy` on its own entry, but its bytes and errors are not folded into
//! the aggregate. Legs that complete after [`AioHandle::cancel`] are counted
//! but not folded either.

use crate::buffer::DmaBuffer;
use crate::channel::Channel;
use crate::error::{DmaError, DmaResult};
use crate::mapper::{self, PinnedBuffer};
use crate::regs::{Direction, StatusFlags};
use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

bitflags! {
    /// Union of error categories seen across the legs of a request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LegErrors: u32 {
        const ALIGNMENT = 1 << 0;
        const MAPPING = 1 << 1;
        const DEVICE = 1 << 2;
        const TIMEOUT = 1 << 3;
        const SHUTDOWN = 1 << 4;
        const INVALID = 1 << 5;
        const OTHER = 1 << 31;
    }
}

impl LegErrors {
    /// Error category of one leg failure.
    pub fn from_error(err: &DmaError) -> Self {
        match err {
            DmaError::AlignmentError { .. } => Self::ALIGNMENT,
            DmaError::OutOfMemory(_)
            | DmaError::FaultError { .. }
            | DmaError::DuplicatePage { .. }
            | DmaError::InvalidLength { .. } => Self::MAPPING,
            DmaError::DeviceError { .. } => Self::DEVICE,
            DmaError::Timeout { .. } => Self::TIMEOUT,
            DmaError::ChannelShutdown => Self::SHUTDOWN,
            DmaError::DirectionMismatch { .. }
            | DmaError::DescriptorOverflow { .. }
            | DmaError::InvalidArgument(_) => Self::INVALID,
            _ => Self::OTHER,
        }
    }
}

/// Aggregate result of an asynchronous request.
pub struct AioResult {
    /// Bytes moved by legs folded into the aggregate.
    pub bytes: usize,
    /// Union of error categories of folded legs.
    pub errors: LegErrors,
    /// Union of raw device status bits of folded legs.
    pub status: StatusFlags,
    /// Number of folded legs that failed.
    pub error_legs: usize,
    /// Per-leg results, in submission order. `Busy` marks a leg whose
    /// completion raced a cancellation.
    pub legs: Vec<DmaResult<usize>>,
    /// The request was cancelled before its last leg completed.
    pub cancelled: bool,
    /// The request's buffers, handed back in submission order.
    pub buffers: Vec<DmaBuffer>,
}

impl AioResult {
    /// Returns true if every leg completed successfully and nothing was cancelled.
    pub fn is_ok(&self) -> bool {
        self.error_legs == 0 && !self.cancelled && self.legs.iter().all(Result::is_ok)
    }
}

impl fmt::Debug for AioResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioResult")
            .field("bytes", &self.bytes)
            .field("errors", &self.errors)
            .field("status", &format_args!("{:#010x}", self.status.bits()))
            .field("error_legs", &self.error_legs)
            .field("legs", &self.legs)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

type Notify = Box<dyn FnOnce(AioResult) + Send>;

#[derive(Default)]
struct Accumulator {
    bytes: usize,
    errors: LegErrors,
    status: StatusFlags,
    error_legs: usize,
    cancelled: bool,
    legs: Vec<Option<DmaResult<usize>>>,
    buffers: Vec<Option<DmaBuffer>>,
}

impl Accumulator {
    fn fold(&mut self, result: &DmaResult<usize>) {
        match result {
            Ok(bytes) => self.bytes += bytes,
            Err(err) => {
                self.errors |= LegErrors::from_error(err);
                if let DmaError::DeviceError { status, .. } = err {
                    self.status |= StatusFlags::from_bits_retain(*status);
                }
                // partial progress of a failed leg is not counted
                self.error_legs += 1;
            }
        }
    }
}

/// Fan-in state shared by the legs of one request.
struct AsyncIoContext {
    requested: usize,
    completed: AtomicUsize,
    acc: Mutex<Accumulator>,
    // legs that lost the try-lock race park their buffer and report here
    skipped: Mutex<Vec<(usize, DmaBuffer)>>,
    notify: Mutex<Option<Notify>>,
}

impl AsyncIoContext {
    fn new(requested: usize, notify: Notify) -> Self {
        let mut acc = Accumulator::default();
        acc.legs.resize_with(requested, || None);
        acc.buffers.resize_with(requested, || None);
        Self {
            requested,
            completed: AtomicUsize::new(0),
            acc: Mutex::new(acc),
            skipped: Mutex::new(Vec::new()),
            notify: Mutex::new(Some(notify)),
        }
    }

    fn lock_acc(&self) -> MutexGuard<'_, Accumulator> {
        self.acc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_leg_complete(&self, index: usize, buffer: DmaBuffer, result: DmaResult<usize>) {
        let guard = match self.acc.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        match guard {
            Some(mut acc) => {
                if !acc.cancelled {
                    acc.fold(&result);
                }
                acc.legs[index] = Some(result);
                acc.buffers[index] = Some(buffer);
            }
            None => {
                log::debug!("aio leg {}: context busy, completion skipped", index);
                self.skipped
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((index, buffer));
            }
        }

        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(done <= self.requested);
        if done == self.requested {
            self.finalize();
        }
    }

    fn finalize(&self) {
        let result = {
            let mut acc = self.lock_acc();
            let skipped = std::mem::take(&mut *self.skipped.lock().unwrap_or_else(PoisonError::into_inner));
            for (index, buffer) in skipped {
                acc.legs[index] = Some(Err(DmaError::Busy));
                acc.buffers[index] = Some(buffer);
            }
            let acc = std::mem::take(&mut *acc);
            AioResult {
                bytes: acc.bytes,
                errors: acc.errors,
                status: acc.status,
                error_legs: acc.error_legs,
                legs: acc
                    .legs
                    .into_iter()
                    .map(|leg| leg.unwrap_or(Err(DmaError::Busy)))
                    .collect(),
                cancelled: acc.cancelled,
                buffers: acc.buffers.into_iter().flatten().collect(),
            }
        };
        log::debug!(
            "aio request done: {} legs, {} bytes, {} error legs",
            self.requested,
            result.bytes,
            result.error_legs
        );
        let notify = self.notify.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(notify) = notify {
            notify(result);
        }
    }
}

/// One leg of an asynchronous request.
pub(crate) struct IoControlBlock {
    index: usize,
    ctx: Arc<AsyncIoContext>,
    buffer: DmaBuffer,
    pinned: Option<PinnedBuffer>,
}

impl IoControlBlock {
    /// Release the leg's pages and report it to the context.
    fn complete(self, result: DmaResult<usize>) {
        let Self {
            index,
            ctx,
            buffer,
            pinned,
        } = self;
        if let Some(pinned) = pinned {
            pinned.unmap();
        }
        if let Err(e) = &result {
            log::debug!("aio leg {} failed: {}", index, e);
        }
        ctx.on_leg_complete(index, buffer, result);
    }
}

/// Caller's handle on an in-flight asynchronous request.
#[derive(Clone)]
pub struct AioHandle {
    ctx: Arc<AsyncIoContext>,
}

impl AioHandle {
    /// Stop folding later leg completions into the result.
    ///
    /// In-flight hardware work is not aborted; cancelled legs are still
    /// counted and their buffers still released.
    pub fn cancel(&self) {
        self.ctx.lock_acc().cancelled = true;
        log::debug!("aio request cancelled");
    }

    /// Number of legs in the request.
    pub fn requested(&self) -> usize {
        self.ctx.requested
    }

    /// Number of legs that have reported.
    pub fn completed(&self) -> usize {
        self.ctx.completed.load(Ordering::Acquire)
    }

    /// Returns true once every leg has reported.
    pub fn is_complete(&self) -> bool {
        self.completed() == self.requested()
    }

    #[cfg(test)]
    fn hold_lock(&self) -> MutexGuard<'_, Accumulator> {
        self.ctx.lock_acc()
    }
}

impl fmt::Debug for AioHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioHandle")
            .field("requested", &self.requested())
            .field("completed", &self.completed())
            .finish()
    }
}

/// Issue one leg per buffer against `channel` without blocking.
///
/// Every leg targets device offset `offset` and is checked against the
/// channel's alignment rule at that offset.
/// `on_complete` receives the aggregate result after the last leg reports,
/// on whichever thread completes that leg.
///
/// # Errors
///
/// Fails immediately, without running `on_complete`, on a direction mismatch
/// or an empty buffer list. Per-leg failures are reported in the result.
pub fn submit_async(
    channel: &Channel,
    write: bool,
    offset: u64,
    buffers: Vec<DmaBuffer>,
    on_complete: impl FnOnce(AioResult) + Send + 'static,
) -> DmaResult<AioHandle> {
    let direction = Direction::from_write(write);
    if direction != channel.direction() {
        return Err(DmaError::DirectionMismatch {
            channel: channel.direction(),
            requested: direction,
        });
    }
    if buffers.is_empty() {
        return Err(DmaError::InvalidArgument("asynchronous request without buffers".into()));
    }

    let ctx = Arc::new(AsyncIoContext::new(buffers.len(), Box::new(on_complete)));
    let handle = AioHandle { ctx: Arc::clone(&ctx) };
    let caps = channel.capabilities();
    log::debug!(
        "{}: aio {} with {} legs at {:#x}",
        channel.name(),
        direction,
        buffers.len(),
        offset
    );

    for (index, buffer) in buffers.into_iter().enumerate() {
        let addr = buffer.addr();
        let len = buffer.len();

        let mut icb = IoControlBlock {
            index,
            ctx: Arc::clone(&ctx),
            buffer,
            pinned: None,
        };
        if let Err(e) = mapper::check_alignment(&caps, addr, len, offset, true) {
            icb.complete(Err(e));
            continue;
        }
        let pinned = match mapper::map(channel.pinner(), addr, len, direction) {
            Ok(pinned) => pinned,
            Err(e) => {
                icb.complete(Err(e));
                continue;
            }
        };
        let chain = channel.build_chain(offset, pinned.sg_table().segments());
        icb.pinned = Some(pinned);
        match chain {
            Ok(chain) => {
                channel.submit_chain(chain, Box::new(move |result| icb.complete(result)));
            }
            Err(e) => icb.complete(Err(e)),
        }
    }

    channel.wake();
    Ok(handle)
}

/// Like [`submit_async`], delivering the result through a oneshot channel.
#[cfg(feature = "async")]
pub fn submit_async_oneshot(
    channel: &Channel,
    write: bool,
    offset: u64,
    buffers: Vec<DmaBuffer>,
) -> DmaResult<(AioHandle, tokio::sync::oneshot::Receiver<AioResult>)> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let handle = submit_async(channel, write, offset, buffers, move |result| {
        // the receiver may have been dropped; nothing to do then
        let _ = tx.send(result);
    })?;
    Ok((handle, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::soft::{PinFault, SoftBehavior, SoftEngine, SoftPinner};
    use std::sync::mpsc;
    use std::time::Duration;

    fn channel(direction: Direction) -> (Arc<SoftEngine>, Arc<SoftPinner>, Channel) {
        // SAFETY: every leg's buffer is owned by the request until it reports.
        let engine = Arc::new(unsafe { SoftEngine::new(direction, false) }.with_memory(1 << 16));
        let pinner = Arc::new(SoftPinner::new());
        let cfg = RuntimeConfig::default().set_pin_workers(false);
        let ch = Channel::open("aio", engine.clone(), pinner.clone(), direction, &cfg).unwrap();
        (engine, pinner, ch)
    }

    fn filled(len: usize, value: u8) -> DmaBuffer {
        DmaBuffer::from_slice(&vec![value; len], 64).unwrap()
    }

    fn collect() -> (impl FnOnce(AioResult) + Send + 'static, mpsc::Receiver<AioResult>) {
        let (tx, rx) = mpsc::channel();
        (move |r| tx.send(r).unwrap(), rx)
    }

    #[test]
    fn test_three_legs_with_failed_mapping() {
        let (engine, pinner, ch) = channel(Direction::H2C);
        pinner.inject_on_call(2, PinFault::Short(0));
        let (notify, rx) = collect();

        let bufs = vec![filled(100, 1), filled(200, 2), filled(300, 3)];
        let handle = submit_async(&ch, true, 0, bufs, notify).unwrap();
        // leg 2 reported during submission; legs 1 and 3 need servicing
        assert_eq!(handle.completed(), 1);
        while !handle.is_complete() {
            ch.service_poll();
        }
        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        assert!(handle.is_complete());
        assert_eq!(result.bytes, 100 + 300);
        assert_eq!(result.error_legs, 1);
        assert_eq!(result.errors, LegErrors::MAPPING);
        assert!(matches!(result.legs[1], Err(DmaError::FaultError { .. })));
        assert_eq!(result.buffers.len(), 3);
        assert_eq!(result.buffers[2][0], 3);
        // every leg targets offset 0; leg 3 ran last and covers leg 1
        assert_eq!(&engine.memory()[..300], &[3u8; 300][..]);
        assert_eq!(engine.memory()[300], 0);
        assert_eq!(pinner.outstanding(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_aggregate_waits_for_every_leg() {
        let (engine, _, ch) = channel(Direction::C2H);
        engine.write_memory(0, &[9u8; 256]);
        engine.set_behavior(SoftBehavior::Stall);
        let (notify, rx) = collect();

        let bufs = (0..4).map(|_| filled(64, 0)).collect();
        let handle = submit_async(&ch, false, 0, bufs, notify).unwrap();
        for done in 0..4 {
            assert_eq!(handle.completed(), done);
            assert!(rx.try_recv().is_err());
            engine.resume();
            ch.service_poll();
        }
        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.bytes, 256);
        assert!(result.buffers.iter().all(|b| b.iter().all(|&x| x == 9)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_stops_folding() {
        let (engine, pinner, ch) = channel(Direction::H2C);
        engine.set_behavior(SoftBehavior::Stall);
        let (notify, rx) = collect();

        let bufs = vec![filled(64, 1), filled(64, 2)];
        let handle = submit_async(&ch, true, 0, bufs, notify).unwrap();
        engine.resume();
        ch.service_poll();
        handle.cancel();
        engine.resume();
        ch.service_poll();

        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(result.cancelled);
        assert_eq!(result.bytes, 64);
        assert!(result.legs.iter().all(|l| l.is_ok()));
        assert_eq!(pinner.outstanding(), 0);
    }

    #[test]
    fn test_completion_racing_cancel_reports_busy() {
        let (engine, pinner, ch) = channel(Direction::H2C);
        engine.set_behavior(SoftBehavior::Stall);
        let (notify, rx) = collect();

        let bufs = vec![filled(128, 1), filled(128, 2)];
        let handle = submit_async(&ch, true, 0, bufs, notify).unwrap();
        {
            // a cancellation holds the context lock while leg 0 completes
            let _held = handle.hold_lock();
            engine.resume();
            ch.service_poll();
            assert_eq!(handle.completed(), 1);
        }
        engine.resume();
        ch.service_poll();

        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(result.legs[0], Err(DmaError::Busy)));
        assert!(matches!(result.legs[1], Ok(128)));
        // the skipped leg is counted but its bytes are not
        assert_eq!(result.bytes, 128);
        assert_eq!(result.error_legs, 0);
        assert_eq!(result.buffers.len(), 2);
        assert_eq!(pinner.outstanding(), 0);
    }

    #[test]
    fn test_immediate_rejections() {
        let (_, _, ch) = channel(Direction::H2C);
        let err = submit_async(&ch, false, 0, vec![filled(8, 0)], |_| {}).unwrap_err();
        assert!(matches!(err, DmaError::DirectionMismatch { .. }));
        let err = submit_async(&ch, true, 0, Vec::new(), |_| {}).unwrap_err();
        assert!(matches!(err, DmaError::InvalidArgument(_)));
    }

    #[test]
    fn test_device_error_leg_keeps_status() {
        let (engine, _, ch) = channel(Direction::H2C);
        engine.set_behavior(SoftBehavior::Fail(StatusFlags::H2C_R_UNSUPP_REQ));
        let (notify, rx) = collect();
        submit_async(&ch, true, 0, vec![filled(64, 0)], notify).unwrap();
        ch.service_poll();

        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.error_legs, 1);
        assert!(result.errors.contains(LegErrors::DEVICE));
        assert!(result.status.contains(StatusFlags::H2C_R_UNSUPP_REQ));
        assert!(!result.is_ok());
    }

    #[test]
    fn test_dropped_channel_still_notifies() {
        let (engine, pinner, ch) = channel(Direction::H2C);
        engine.set_behavior(SoftBehavior::Stall);
        let (notify, rx) = collect();
        let handle = submit_async(&ch, true, 0, vec![filled(64, 1), filled(64, 2)], notify).unwrap();
        drop(ch);

        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(handle.is_complete());
        assert_eq!(result.error_legs, 2);
        assert_eq!(result.errors, LegErrors::TIMEOUT);
        assert_eq!(result.buffers.len(), 2);
        assert_eq!(pinner.outstanding(), 0);
    }

    #[test]
    fn test_misaligned_offset_fails_leg() {
        let (_, _, ch) = channel(Direction::H2C);
        ch.set_addressing_mode(true);
        ch.set_alignments(64, 4096).unwrap();

        let buf = || DmaBuffer::zeroed(8192, 64).unwrap();
        let (notify, rx) = collect();
        submit_async(&ch, true, 4, vec![buf()], notify).unwrap();
        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.errors, LegErrors::ALIGNMENT);
        assert!(matches!(result.legs[0], Err(DmaError::AlignmentError { offset: 4, .. })));
        assert_eq!(result.bytes, 0);

        // the blocking path rejects the same request
        assert!(matches!(ch.write(&buf(), 4), Err(DmaError::AlignmentError { .. })));

        let (notify, rx) = collect();
        submit_async(&ch, true, 0, vec![buf(), buf()], notify).unwrap();
        while rx.try_recv().map(|r| assert!(r.is_ok())).is_err() {
            ch.service_poll();
        }
    }

    #[test]
    fn test_failed_leg_adds_no_bytes() {
        // SAFETY: the leg's buffer is owned by the request until it reports.
        let engine = Arc::new(unsafe { SoftEngine::new(Direction::H2C, false) }.with_memory(4096));
        let pinner = Arc::new(SoftPinner::new());
        let cfg = RuntimeConfig::default()
            .set_pin_workers(false)
            .set_desc_blen_max(4096);
        let ch = Channel::open("aio", engine.clone(), pinner, Direction::H2C, &cfg).unwrap();

        // first page lands in card memory, the second runs off its end
        let (notify, rx) = collect();
        submit_async(&ch, true, 0, vec![filled(8192, 7), filled(1024, 8)], notify).unwrap();
        while !rx.try_recv().map(|r| {
            assert!(matches!(r.legs[0], Err(DmaError::DeviceError { bytes: 4096, .. })));
            assert!(matches!(r.legs[1], Ok(1024)));
            assert_eq!(r.error_legs, 1);
            assert_eq!(r.bytes, 1024);
        }).is_ok() {
            ch.service_poll();
        }
        assert_eq!(&engine.memory()[..1024], &[8u8; 1024][..]);
    }

    #[test]
    fn test_shutdown_completes_pending_legs() {
        let (engine, _, ch) = channel(Direction::H2C);
        engine.set_behavior(SoftBehavior::Stall);
        let (notify, rx) = collect();
        submit_async(&ch, true, 0, vec![filled(64, 0), filled(64, 0)], notify).unwrap();
        ch.shutdown();

        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.error_legs, 2);
        assert_eq!(result.errors, LegErrors::TIMEOUT);
    }
}

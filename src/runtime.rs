// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Driver runtime: the completion worker pool plus the channels it services.
//!
//! # Example
//!
//! ```no_run
//! use mdlx_sgdma::{BarWindow, Direction, DriverRuntime, MmapBar, RuntimeConfig};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let bar = Arc::new(MmapBar::open(Path::new("/sys/bus/pci/devices/0000:03:00.0/resource0"))?);
//! let mut runtime = DriverRuntime::new(RuntimeConfig::from_env()?)?;
//! runtime.start()?;
//!
//! let regs = Arc::new(BarWindow::channel(bar, Direction::H2C, 0)?);
//! let h2c = runtime.open_channel("h2c0", regs, Direction::H2C)?;
//! h2c.write(b"hello", 0)?;
//!
//! runtime.stop();
//! # Ok::<(), mdlx_sgdma::DmaError>(())
//! ```

use crate::channel::Channel;
use crate::config::RuntimeConfig;
use crate::error::{DmaError, DmaResult};
use crate::mapper::{HostPinner, PagePinner};
use crate::mmio::RegisterBlock;
use crate::regs::Direction;
use crate::worker::{PollableWorkSource, WorkerPool};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Owns the worker pool and every open channel.
pub struct DriverRuntime {
    config: RuntimeConfig,
    pinner: Arc<dyn PagePinner>,
    pool: WorkerPool,
    channels: Mutex<Vec<Arc<Channel>>>,
}

impl DriverRuntime {
    /// Runtime pinning host memory with [`HostPinner`].
    pub fn new(config: RuntimeConfig) -> DmaResult<Self> {
        Self::with_pinner(config, Arc::new(HostPinner::new()))
    }

    /// Runtime using `pinner` for every channel it opens.
    pub fn with_pinner(config: RuntimeConfig, pinner: Arc<dyn PagePinner>) -> DmaResult<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.worker_count, config.worker_interval, config.pin_workers);
        Ok(Self {
            config,
            pinner,
            pool,
            channels: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Channel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the completion workers.
    pub fn start(&mut self) -> DmaResult<()> {
        if self.pool.is_running() {
            return Ok(());
        }
        self.pool.start()?;
        // channels opened while stopped were polled by their own waiters
        let channels = self.lock().clone();
        for channel in channels {
            if channel.worker_id().is_none() {
                self.assign(&channel);
            }
        }
        Ok(())
    }

    /// Shut down every channel and stop the workers.
    pub fn stop(&mut self) {
        let channels = std::mem::take(&mut *self.lock());
        for channel in &channels {
            channel.shutdown();
        }
        if self.pool.is_running() {
            self.pool.stop();
            log::info!("runtime stopped, {} channels shut down", channels.len());
        }
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Bring up a channel on `regs` and hand it to the least loaded worker.
    ///
    /// Before [`start`](Self::start) the channel is kept unassigned and
    /// blocking calls poll it themselves.
    pub fn open_channel(
        &self,
        name: impl Into<String>,
        regs: Arc<dyn RegisterBlock>,
        direction: Direction,
    ) -> DmaResult<Arc<Channel>> {
        let channel = Arc::new(Channel::open(
            name,
            regs,
            Arc::clone(&self.pinner),
            direction,
            &self.config,
        )?);
        if self.pool.is_running() {
            self.assign(&channel);
        }
        self.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    fn assign(&self, channel: &Arc<Channel>) {
        let source: Arc<dyn PollableWorkSource> = channel.clone();
        if self.pool.assign(source).is_none() {
            log::warn!("{}: no worker available", channel.name());
        }
    }

    /// Shut down `channel` and forget it.
    pub fn remove_channel(&self, channel: &Arc<Channel>) -> DmaResult<()> {
        let removed = {
            let mut channels = self.lock();
            let before = channels.len();
            channels.retain(|c| !Arc::ptr_eq(c, channel));
            channels.len() != before
        };
        if !removed {
            return Err(DmaError::InvalidArgument(format!(
                "{}: channel not owned by this runtime",
                channel.name()
            )));
        }
        channel.shutdown();
        Ok(())
    }

    /// Snapshot of the open channels.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.lock().clone()
    }
}

impl Drop for DriverRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::submit_async;
    use crate::buffer::DmaBuffer;
    use crate::channel::ShutdownState;
    use crate::soft::{SoftBehavior, SoftEngine, SoftPinner};
    use std::sync::mpsc;
    use std::time::Duration;

    fn config(workers: usize) -> RuntimeConfig {
        RuntimeConfig::default()
            .set_worker_count(workers)
            .set_pin_workers(false)
            .set_sgdma_timeout(Duration::from_secs(2))
    }

    fn engine(direction: Direction) -> Arc<SoftEngine> {
        // SAFETY: every transfer in these tests completes or is aborted before
        // its buffers are released.
        Arc::new(unsafe { SoftEngine::new(direction, false) }.with_memory(1 << 16))
    }

    #[test]
    fn test_workers_drive_round_trip() {
        let pinner = Arc::new(SoftPinner::new());
        let mut rt = DriverRuntime::with_pinner(config(2), pinner.clone()).unwrap();
        rt.start().unwrap();

        let card = engine(Direction::H2C);
        let h2c = rt.open_channel("h2c0", card.clone(), Direction::H2C).unwrap();
        assert!(h2c.worker_id().is_some());

        let data: Vec<u8> = (0..10_000).map(|i| (i % 241) as u8).collect();
        assert_eq!(h2c.write(&data, 0x100).unwrap(), data.len());
        assert_eq!(&card.memory()[0x100..0x100 + data.len()], &data[..]);

        rt.stop();
        assert_eq!(h2c.shutdown_state(), ShutdownState::Idle);
        assert_eq!(pinner.outstanding(), 0);
    }

    #[test]
    fn test_channels_spread_over_workers() {
        let mut rt = DriverRuntime::with_pinner(config(3), Arc::new(SoftPinner::new())).unwrap();
        rt.start().unwrap();
        for i in 0..7 {
            rt.open_channel(format!("c2h{}", i), engine(Direction::C2H), Direction::C2H)
                .unwrap();
        }
        let loads = rt.pool().loads();
        assert_eq!(loads.iter().sum::<usize>(), 7);
        assert!(loads.iter().max().unwrap() - loads.iter().min().unwrap() <= 1);
        assert_eq!(rt.channels().len(), 7);
    }

    #[test]
    fn test_async_completion_on_worker() {
        let mut rt = DriverRuntime::with_pinner(config(1), Arc::new(SoftPinner::new())).unwrap();
        rt.start().unwrap();
        let card = engine(Direction::C2H);
        card.write_memory(0, &[0x5a; 512]);
        let c2h = rt.open_channel("c2h0", card, Direction::C2H).unwrap();

        let (tx, rx) = mpsc::channel();
        let bufs = vec![DmaBuffer::zeroed(256, 64).unwrap(), DmaBuffer::zeroed(256, 64).unwrap()];
        submit_async(&c2h, false, 0, bufs, move |r| tx.send(r).unwrap()).unwrap();

        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.bytes, 512);
        assert!(result.buffers.iter().all(|b| b.iter().all(|&x| x == 0x5a)));
    }

    #[test]
    fn test_open_before_start() {
        let mut rt = DriverRuntime::with_pinner(config(2), Arc::new(SoftPinner::new())).unwrap();
        let card = engine(Direction::H2C);
        let h2c = rt.open_channel("h2c0", card, Direction::H2C).unwrap();
        assert_eq!(h2c.worker_id(), None);
        // blocking calls poll for themselves while no worker runs
        assert_eq!(h2c.write(&[1u8; 64], 0).unwrap(), 64);

        rt.start().unwrap();
        assert!(h2c.worker_id().is_some());
        assert_eq!(h2c.write(&[2u8; 64], 64).unwrap(), 64);
    }

    #[test]
    fn test_remove_channel() {
        let mut rt = DriverRuntime::with_pinner(config(1), Arc::new(SoftPinner::new())).unwrap();
        rt.start().unwrap();
        let card = engine(Direction::H2C);
        card.set_behavior(SoftBehavior::Stall);
        let h2c = rt.open_channel("h2c0", card, Direction::H2C).unwrap();
        assert_eq!(rt.pool().loads(), vec![1]);

        rt.remove_channel(&h2c).unwrap();
        assert_eq!(rt.pool().loads(), vec![0]);
        assert_eq!(h2c.shutdown_state(), ShutdownState::Idle);
        assert!(matches!(h2c.write(&[0u8; 64], 0), Err(DmaError::ChannelShutdown)));
        assert!(rt.remove_channel(&h2c).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(DriverRuntime::with_pinner(config(0), Arc::new(SoftPinner::new())).is_err());
    }

    #[test]
    fn test_wrong_engine_direction() {
        let rt = DriverRuntime::with_pinner(config(1), Arc::new(SoftPinner::new())).unwrap();
        let err = rt
            .open_channel("h2c0", engine(Direction::C2H), Direction::H2C)
            .unwrap_err();
        assert!(matches!(err, DmaError::DirectionMismatch { .. }));
        assert!(rt.channels().is_empty());
    }
}

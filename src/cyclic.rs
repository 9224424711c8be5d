// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Continuous card-to-host streaming receive.
//!
//! The engine runs around a ring of page-sized receive buffers forever. Each
//! ring descriptor reports into its own result record (valid marker, EOP flag,
//! byte count); the reader consumes records in ring order and hands each one
//! back to the engine by clearing it.

use crate::buffer::DmaBuffer;
use crate::channel::{Channel, ShutdownState, TransferId};
use crate::descriptor::{DescriptorChain, MdlxResult};
use crate::error::{DmaError, DmaResult};
use crate::mapper::{self, PinnedBuffer};
use crate::regs::{Direction, CYCLIC_RX_PAGES_MAX, PAGE_SIZE};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const RX_POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Cyclic receive on a streaming C2H channel.
pub struct CyclicReceiver {
    channel: Arc<Channel>,
    id: Option<TransferId>,
    // the engine may write the ring until the transfer is stopped
    results: Box<[MdlxResult]>,
    pinned: Option<PinnedBuffer>,
    ring: DmaBuffer,
    head: usize,
    partial: usize,
}

impl CyclicReceiver {
    /// Start receiving into a ring of `pages` pages.
    pub fn start(channel: Arc<Channel>, pages: usize) -> DmaResult<Self> {
        let caps = channel.capabilities();
        if caps.direction != Direction::C2H || !caps.streaming {
            return Err(DmaError::InvalidArgument(format!(
                "{}: cyclic receive needs a streaming C2H engine",
                channel.name()
            )));
        }
        if pages == 0 || pages > CYCLIC_RX_PAGES_MAX {
            return Err(DmaError::InvalidArgument(format!(
                "ring of {} pages outside 1..={}",
                pages, CYCLIC_RX_PAGES_MAX
            )));
        }

        let ring = DmaBuffer::page_aligned(pages * PAGE_SIZE)?;
        let pinned = mapper::map(channel.pinner(), ring.addr(), ring.len(), Direction::C2H)?;
        let page_addrs: Vec<u64> = pinned.sg_table().segments().iter().map(|s| s.addr).collect();
        let results: Box<[MdlxResult]> = (0..pages).map(|_| MdlxResult::new()).collect();
        let chain = DescriptorChain::ring(&page_addrs, PAGE_SIZE as u32, &results)?;
        let id = channel.start_cyclic(chain)?;
        log::info!("{}: cyclic receive started, {} pages", channel.name(), pages);

        Ok(Self {
            channel,
            id: Some(id),
            results,
            pinned: Some(pinned),
            ring,
            head: 0,
            partial: 0,
        })
    }

    /// Number of pages in the ring.
    pub fn pages(&self) -> usize {
        self.results.len()
    }

    /// Copy received data into `buf` until an end-of-packet entry has been
    /// consumed or `buf` is full.
    ///
    /// Waits up to `timeout` for data. Returns `Timeout` if nothing arrived,
    /// `ChannelShutdown` if the ring is drained and the channel shut down,
    /// otherwise the number of bytes copied (possibly a partial packet).
    pub fn read(&mut self, buf: &mut [u8], timeout: Duration) -> DmaResult<usize> {
        if self.id.is_none() {
            return Err(DmaError::ChannelShutdown);
        }
        let deadline = Instant::now() + timeout;
        let mut copied = 0;

        while copied < buf.len() {
            let result = &self.results[self.head];
            if !result.is_valid() {
                if self.channel.shutdown_state() != ShutdownState::None {
                    if copied == 0 {
                        return Err(DmaError::ChannelShutdown);
                    }
                    break;
                }
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(RX_POLL_INTERVAL);
                continue;
            }

            let len = (result.length() as usize).min(PAGE_SIZE);
            let page = &self.ring[self.head * PAGE_SIZE..self.head * PAGE_SIZE + len];
            let n = (len - self.partial).min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&page[self.partial..self.partial + n]);
            copied += n;
            self.partial += n;

            if self.partial < len {
                // caller's buffer is full; resume mid-entry next time
                break;
            }
            let eop = result.is_eop();
            result.clear();
            self.partial = 0;
            self.head = (self.head + 1) % self.results.len();
            if eop {
                break;
            }
        }

        if copied == 0 && !buf.is_empty() {
            return Err(DmaError::Timeout { bytes: 0 });
        }
        log::trace!("{}: cyclic read {} bytes", self.channel.name(), copied);
        Ok(copied)
    }

    /// Stop the engine and release the ring.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        if let Some(id) = self.id.take() {
            self.channel.stop_cyclic(id);
            log::info!("{}: cyclic receive stopped", self.channel.name());
        }
        if let Some(pinned) = self.pinned.take() {
            pinned.unmap();
        }
    }
}

impl Drop for CyclicReceiver {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::soft::{SoftEngine, SoftPinner};

    fn streaming(direction: Direction) -> (Arc<SoftEngine>, Arc<SoftPinner>, Arc<Channel>) {
        // SAFETY: the ring and its result records outlive every engine access.
        let engine = Arc::new(unsafe { SoftEngine::new(direction, true) });
        let pinner = Arc::new(SoftPinner::new());
        let cfg = RuntimeConfig::default().set_pin_workers(false);
        let channel = Channel::open("rx", engine.clone(), pinner.clone(), direction, &cfg).unwrap();
        (engine, pinner, Arc::new(channel))
    }

    #[test]
    fn test_reads_packets_across_pages() {
        let (engine, pinner, channel) = streaming(Direction::C2H);
        let mut rx = CyclicReceiver::start(channel.clone(), 4).unwrap();

        let packet: Vec<u8> = (0..PAGE_SIZE + 10).map(|i| (i % 253) as u8).collect();
        engine.push_stream(&packet, true);
        engine.push_stream(b"second", true);

        let mut buf = vec![0u8; 3 * PAGE_SIZE];
        let n = rx.read(&mut buf, Duration::from_millis(100)).unwrap();
        assert_eq!(&buf[..n], &packet[..]);
        let n = rx.read(&mut buf, Duration::from_millis(100)).unwrap();
        assert_eq!(&buf[..n], b"second");

        rx.stop();
        assert_eq!(channel.queue_len(), 0);
        assert_eq!(pinner.outstanding(), 0);
    }

    #[test]
    fn test_small_buffer_resumes_mid_entry() {
        let (engine, _, channel) = streaming(Direction::C2H);
        let mut rx = CyclicReceiver::start(channel, 2).unwrap();
        engine.push_stream(b"abcdefgh", true);

        let mut buf = [0u8; 3];
        assert_eq!(rx.read(&mut buf, Duration::from_millis(50)).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(rx.read(&mut buf, Duration::from_millis(50)).unwrap(), 3);
        assert_eq!(&buf, b"def");
        assert_eq!(rx.read(&mut buf, Duration::from_millis(50)).unwrap(), 2);
        assert_eq!(&buf[..2], b"gh");
    }

    #[test]
    fn test_ring_wraps_after_consumption() {
        let (engine, _, channel) = streaming(Direction::C2H);
        let mut rx = CyclicReceiver::start(channel, 2).unwrap();
        let mut buf = [0u8; 16];
        for i in 0..5u8 {
            engine.push_stream(&[i; 4], true);
            assert_eq!(rx.read(&mut buf, Duration::from_millis(50)).unwrap(), 4);
            assert_eq!(&buf[..4], &[i; 4]);
        }
    }

    #[test]
    fn test_timeout_without_data() {
        let (_, _, channel) = streaming(Direction::C2H);
        let mut rx = CyclicReceiver::start(channel, 1).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            rx.read(&mut buf, Duration::from_millis(5)),
            Err(DmaError::Timeout { bytes: 0 })
        ));
    }

    #[test]
    fn test_read_after_channel_shutdown() {
        let (engine, pinner, channel) = streaming(Direction::C2H);
        let mut rx = CyclicReceiver::start(channel.clone(), 2).unwrap();
        engine.push_stream(b"last", true);
        channel.shutdown();

        // data already in the ring is still delivered
        let mut buf = [0u8; 8];
        assert_eq!(rx.read(&mut buf, Duration::from_millis(50)).unwrap(), 4);
        assert_eq!(&buf[..4], b"last");

        let start = Instant::now();
        assert!(matches!(
            rx.read(&mut buf, Duration::from_secs(5)),
            Err(DmaError::ChannelShutdown)
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
        rx.stop();
        assert_eq!(pinner.outstanding(), 0);
    }

    #[test]
    fn test_rejects_unsuitable_channel() {
        let (_, _, h2c) = streaming(Direction::H2C);
        assert!(CyclicReceiver::start(h2c, 4).is_err());
        let (_, _, c2h) = streaming(Direction::C2H);
        assert!(CyclicReceiver::start(c2h.clone(), 0).is_err());
        assert!(CyclicReceiver::start(c2h.clone(), CYCLIC_RX_PAGES_MAX + 1).is_err());

        // one cyclic transfer per channel; ordinary reads are refused meanwhile
        let _rx = CyclicReceiver::start(c2h.clone(), 1).unwrap();
        assert!(CyclicReceiver::start(c2h.clone(), 1).is_err());
        let mut buf = [0u8; 4];
        assert!(c2h.read(&mut buf, 0).is_err());
    }
}

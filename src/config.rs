// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Runtime configuration.
//!
//! Defaults match the load-time parameters of the driver. Every value can be
//! overridden from the environment with [`RuntimeConfig::from_env`]:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `MDLX_WORKERS` | `worker_count` |
//! | `MDLX_WORKER_INTERVAL_MS` | `worker_interval` (0 = wait for a signal) |
//! | `MDLX_SGDMA_TIMEOUT_S` | `sgdma_timeout` |
//! | `MDLX_POLL_MODE` | `poll_mode` (`0`/`1`/`true`/`false`) |
//! | `MDLX_DESC_BLEN_MAX` | `desc_blen_max` |

use crate::error::{DmaError, DmaResult};
use crate::regs::DESC_BLEN_MAX;
use std::str::FromStr;
use std::time::Duration;

/// Default number of completion workers.
pub const DEFAULT_WORKER_COUNT: usize = 8;

/// Default window for blocking transfers.
pub const DEFAULT_SGDMA_TIMEOUT: Duration = Duration::from_secs(10);

/// Driver runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of completion worker threads.
    pub worker_count: usize,
    /// Wake workers at this interval even without a signal.
    pub worker_interval: Option<Duration>,
    /// Timeout of a blocking transfer.
    pub sgdma_timeout: Duration,
    /// Observe completion through the write-back record instead of the status registers.
    pub poll_mode: bool,
    /// Largest byte count a single descriptor may carry.
    pub desc_blen_max: u32,
    /// Pin each worker thread to one processor.
    pub pin_workers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            worker_interval: None,
            sgdma_timeout: DEFAULT_SGDMA_TIMEOUT,
            poll_mode: true,
            desc_blen_max: DESC_BLEN_MAX,
            pin_workers: true,
        }
    }
}

impl RuntimeConfig {
    pub fn set_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn set_worker_interval(mut self, interval: Option<Duration>) -> Self {
        self.worker_interval = interval;
        self
    }

    pub fn set_sgdma_timeout(mut self, timeout: Duration) -> Self {
        self.sgdma_timeout = timeout;
        self
    }

    pub fn set_poll_mode(mut self, poll_mode: bool) -> Self {
        self.poll_mode = poll_mode;
        self
    }

    pub fn set_desc_blen_max(mut self, blen_max: u32) -> Self {
        self.desc_blen_max = blen_max;
        self
    }

    pub fn set_pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    /// Defaults overlaid with `MDLX_*` environment variables.
    pub fn from_env() -> DmaResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DmaResult<Self> {
        let mut config = Self::default();
        if let Some(n) = parse(&lookup, "MDLX_WORKERS")? {
            config.worker_count = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "MDLX_WORKER_INTERVAL_MS")? {
            config.worker_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(s) = parse::<u64>(&lookup, "MDLX_SGDMA_TIMEOUT_S")? {
            config.sgdma_timeout = Duration::from_secs(s);
        }
        if let Some(value) = lookup("MDLX_POLL_MODE") {
            config.poll_mode = parse_bool("MDLX_POLL_MODE", &value)?;
        }
        if let Some(n) = parse(&lookup, "MDLX_DESC_BLEN_MAX")? {
            config.desc_blen_max = n;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> DmaResult<()> {
        if self.worker_count == 0 {
            return Err(DmaError::InvalidArgument("worker count must be non-zero".into()));
        }
        if self.sgdma_timeout.is_zero() {
            return Err(DmaError::InvalidArgument("sgdma timeout must be non-zero".into()));
        }
        if self.desc_blen_max == 0 || self.desc_blen_max > DESC_BLEN_MAX {
            return Err(DmaError::InvalidArgument(format!(
                "descriptor length cap {} outside 1..={}",
                self.desc_blen_max, DESC_BLEN_MAX
            )));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> DmaResult<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DmaError::InvalidArgument(format!("{}={:?} is not a number", name, value))),
    }
}

fn parse_bool(name: &str, value: &str) -> DmaResult<bool> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DmaError::InvalidArgument(format!(
            "{}={:?} is not a boolean",
            name, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.worker_interval, None);
        assert_eq!(config.sgdma_timeout, Duration::from_secs(10));
        assert!(config.poll_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("MDLX_WORKERS", "2"),
            ("MDLX_WORKER_INTERVAL_MS", "5"),
            ("MDLX_POLL_MODE", "0"),
            ("MDLX_DESC_BLEN_MAX", "4096"),
        ]))
        .unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.worker_interval, Some(Duration::from_millis(5)));
        assert!(!config.poll_mode);
        assert_eq!(config.desc_blen_max, 4096);
    }

    #[test]
    fn test_malformed_values_rejected() {
        assert!(RuntimeConfig::from_lookup(lookup(&[("MDLX_WORKERS", "eight")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[("MDLX_POLL_MODE", "maybe")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[("MDLX_WORKERS", "0")])).is_err());
    }

    #[test]
    fn test_chained_setters() {
        let config = RuntimeConfig::default()
            .set_worker_count(3)
            .set_sgdma_timeout(Duration::from_millis(50))
            .set_pin_workers(false);
        assert_eq!(config.worker_count, 3);
        assert!(!config.pin_workers);
        assert!(config.clone().set_desc_blen_max(0).validate().is_err());
        assert!(config.set_sgdma_timeout(Duration::ZERO).validate().is_err());
    }
}

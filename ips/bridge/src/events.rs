//! Record sources feeding the bridge poll loop
//!
//! `RingBufSource` reads ALERT_EVENTS through tokio's `AsyncFd`, so the
//! poll task sleeps on epoll instead of spinning. Every poll is bounded
//! by a timeout; that bound is what keeps `stop()` responsive.

use std::{future::Future, time::Duration};

use aya::maps::{MapData, RingBuf};
use bytes::Bytes;
use log::trace;
use tokio::io::unix::AsyncFd;

use crate::error::{BridgeError, Result};

/// Upper bound on records taken in one poll
///
/// Keeps a flood of alerts from starving the stop check.
pub const MAX_BATCH: usize = 256;

/// Something that yields raw alert records
pub trait RecordSource: Send {
    /// Wait up to `timeout` for records
    ///
    /// Returns an empty batch when the timeout elapses with nothing to
    /// read. An error ends the poll loop.
    fn poll(&mut self, timeout: Duration) -> impl Future<Output = Result<Vec<Bytes>>> + Send;
}

/// ALERT_EVENTS ring buffer consumer
pub struct RingBufSource {
    inner: AsyncFd<RingBuf<MapData>>,
}

impl RingBufSource {
    /// Register the ring buffer with the tokio reactor
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(ring: RingBuf<MapData>) -> Result<Self> {
        let inner = AsyncFd::new(ring).map_err(BridgeError::Poll)?;
        Ok(Self { inner })
    }

    fn drain_ready(ring: &mut RingBuf<MapData>, out: &mut Vec<Bytes>) {
        while out.len() < MAX_BATCH {
            match ring.next() {
                Some(item) => out.push(Bytes::copy_from_slice(&item)),
                None => break,
            }
        }
    }
}

impl RecordSource for RingBufSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<Bytes>> {
        let mut records = Vec::new();

        // Records may already be waiting from before the fd was registered
        Self::drain_ready(self.inner.get_mut(), &mut records);
        if !records.is_empty() {
            return Ok(records);
        }

        let mut guard = match tokio::time::timeout(timeout, self.inner.readable_mut()).await {
            Ok(guard) => guard?,
            Err(_) => return Ok(records),
        };

        Self::drain_ready(guard.get_inner_mut(), &mut records);
        if records.len() < MAX_BATCH {
            guard.clear_ready();
        }

        trace!("read {} records from ring buffer", records.len());
        Ok(records)
    }
}

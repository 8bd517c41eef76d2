//! Single-flight execution slot for one channel
//!
//! The transport only tolerates one outstanding request, so every operation
//! body runs while holding the channel's only permit. Waiters are served in
//! FIFO order and the permit is returned when the operation future finishes
//! or is dropped.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;

use super::transport::OperationKind;
use super::{GattError, GattResult};

pub struct OperationSerializer {
    slot: Semaphore,
    next_ticket: AtomicU64,
}

impl OperationSerializer {
    pub fn new() -> Self {
        Self {
            slot: Semaphore::new(1),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Run `body` exclusively once `precondition` passes.
    ///
    /// Neither future is polled before the slot is acquired. If
    /// `precondition` fails, `body` is never polled.
    pub async fn run_exclusive<T, P, B>(
        &self,
        kind: OperationKind,
        precondition: P,
        body: B,
    ) -> GattResult<T>
    where
        P: Future<Output = GattResult<()>>,
        B: Future<Output = GattResult<T>>,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        log::trace!("#{} {}: waiting for slot", ticket, kind);

        let _permit = self
            .slot
            .acquire()
            .await
            .map_err(|_| GattError::ChannelClosed(kind))?;
        log::trace!("#{} {}: slot acquired", ticket, kind);

        if let Err(e) = precondition.await {
            log::debug!("#{} {}: precondition failed: {}", ticket, kind, e);
            return Err(e);
        }

        let result = body.await;
        log::trace!("#{} {}: releasing slot", ticket, kind);
        result
    }

    /// True when no operation holds the slot.
    pub fn is_idle(&self) -> bool {
        self.slot.available_permits() == 1
    }

    /// Fail every queued and future operation with `ChannelClosed`.
    /// The operation currently running is left to finish.
    pub fn close(&self) {
        self.slot.close();
    }
}

impl Default for OperationSerializer {
    fn default() -> Self {
        Self::new()
    }
}

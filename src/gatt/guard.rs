//! "Connected or fail" condition shared by every operation

use tokio::sync::watch;

use super::state::ConnectionStateTracker;
use super::transport::{ConnectionState, ConnectionUpdate, DeviceAddress, OperationKind, StatusCode};
use super::{GattError, GattResult};

pub struct DisconnectGuard<'a> {
    tracker: &'a ConnectionStateTracker,
    transport_disabled: watch::Receiver<bool>,
    device: DeviceAddress,
    /// Operation the guard protects, reported if the channel shuts down.
    kind: OperationKind,
}

impl<'a> DisconnectGuard<'a> {
    pub fn new(
        tracker: &'a ConnectionStateTracker,
        transport_disabled: watch::Receiver<bool>,
        device: DeviceAddress,
        kind: OperationKind,
    ) -> Self {
        Self {
            tracker,
            transport_disabled,
            device,
            kind,
        }
    }

    /// Pass while connected with a success status; fail once the link is
    /// gone with an error status; otherwise wait for the next transition and
    /// decide again.
    pub async fn ready<F>(&self, on_lost: F) -> GattResult<()>
    where
        F: Fn(DeviceAddress, StatusCode) -> GattError,
    {
        let (mut current, mut updates) = self.tracker.watch();
        let disabled = wait_disabled(self.transport_disabled.clone());
        tokio::pin!(disabled);

        loop {
            if *self.transport_disabled.borrow() {
                return Err(GattError::TransportDisabled);
            }
            match current.state {
                ConnectionState::Connected if current.is_success() => return Ok(()),
                ConnectionState::Connected => {}
                _ if !current.is_success() => {
                    return Err(on_lost(self.device.clone(), current.status));
                }
                _ => {}
            }

            tokio::select! {
                biased;
                _ = &mut disabled => return Err(GattError::TransportDisabled),
                update = updates.next() => match update {
                    Some(update) => current = update,
                    None => return Err(GattError::ChannelClosed(self.kind)),
                },
            }
        }
    }

    /// Resolves only with a failure: as soon as the channel is not
    /// connected, or the transport is disabled.
    pub async fn lost<F>(&self, on_lost: F) -> GattError
    where
        F: Fn(DeviceAddress, StatusCode) -> GattError,
    {
        let (current, mut updates) = self.tracker.watch();
        if *self.transport_disabled.borrow() {
            return GattError::TransportDisabled;
        }
        if !current.state.is_connected() {
            return on_lost(self.device.clone(), current.status);
        }

        let disabled = wait_disabled(self.transport_disabled.clone());
        tokio::pin!(disabled);

        loop {
            tokio::select! {
                biased;
                _ = &mut disabled => return GattError::TransportDisabled,
                update = updates.next() => match update {
                    Some(ConnectionUpdate { state: ConnectionState::Connected, .. }) => continue,
                    Some(update) => return on_lost(self.device.clone(), update.status),
                    None => return GattError::ChannelClosed(self.kind),
                },
            }
        }
    }
}

/// Completes when the transport-disabled flag becomes true. Never completes
/// if the signal's sender goes away.
pub(crate) async fn wait_disabled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|disabled| *disabled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

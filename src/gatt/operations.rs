//! Operation executors
//!
//! Every request/response operation follows the same template: take the
//! channel's execution slot, check the link, subscribe to the completion
//! broadcaster, submit, then race the completion against the disconnect
//! guard. Connect and disconnect only wait on state transitions and bypass
//! the slot.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};

use super::broadcast::{Broadcaster, ChangeEvent, Subscription};
use super::channel::GattChannel;
use super::guard::wait_disabled;
use super::transport::{
    CharacteristicId, ConnectionState, ConnectionUpdate, DescriptorId, DeviceAddress,
    DiscoveredService, GattRequest, OperationKind, StatusCode, WriteType,
    CLIENT_CHARACTERISTIC_CONFIG, GATT_SUCCESS,
};
use super::{GattError, GattResult, OperationContext};

/// Options for characteristic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOptions {
    pub write_type: WriteType,
    /// Resolve without touching the transport when the on-record value
    /// already equals the requested one.
    pub skip_unchanged: bool,
}

impl WriteOptions {
    pub fn without_response() -> Self {
        Self {
            write_type: WriteType::WithoutResponse,
            ..Self::default()
        }
    }

    pub fn skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }
}

/// How the peer should push value changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    Notify,
    Indicate,
}

impl NotificationMode {
    fn cccd_value(self) -> [u8; 2] {
        match self {
            NotificationMode::Notify => [0x01, 0x00],
            NotificationMode::Indicate => [0x02, 0x00],
        }
    }
}

const CCCD_DISABLED: [u8; 2] = [0x00, 0x00];

impl GattChannel {
    /// Connect to the peer and wait until the link is up.
    pub async fn connect(&self) -> GattResult<()> {
        self.with_timeout(OperationKind::Connect, self.establish())
            .await
    }

    async fn establish(&self) -> GattResult<()> {
        let kind = OperationKind::Connect;
        if *self.transport_disabled.borrow() {
            return Err(GattError::TransportDisabled);
        }

        let (mut current, mut updates) = self.state.watch();
        let disabled = wait_disabled(self.transport_disabled.clone());
        tokio::pin!(disabled);

        // The previous session owns the transport until it reports Disconnected.
        while current.state == ConnectionState::Disconnecting {
            log::debug!("{}: waiting for teardown before connecting", self.address);
            tokio::select! {
                biased;
                _ = &mut disabled => return Err(GattError::TransportDisabled),
                update = updates.next() => match update {
                    Some(update) => current = update,
                    None => return Err(GattError::ChannelClosed(kind)),
                },
            }
        }

        match current.state {
            ConnectionState::Connected => return Ok(()),
            // Someone else already started connecting; just wait for the outcome.
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                log::debug!("{}: connecting", self.address);
                self.state.open_session();
                if !self.transport.connect() {
                    self.state.abandon_session();
                    let snapshot = self.transport.snapshot(None);
                    log::warn!("{}: transport refused connect: {}", self.address, snapshot);
                    return Err(GattError::TransportRejected {
                        kind,
                        context: OperationContext::None,
                        snapshot,
                    });
                }
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut disabled => return Err(GattError::TransportDisabled),
                update = updates.next() => match update {
                    Some(ConnectionUpdate { state: ConnectionState::Connected, .. }) => {
                        log::info!("{}: connected", self.address);
                        return Ok(());
                    }
                    Some(ConnectionUpdate { state: ConnectionState::Connecting, .. }) => continue,
                    Some(update) => {
                        log::warn!(
                            "{}: connect failed with status {}",
                            self.address,
                            update.status
                        );
                        return Err(GattError::ChannelLost {
                            device: self.address.clone(),
                            status: update.status,
                            kind,
                            context: OperationContext::None,
                        });
                    }
                    None => return Err(GattError::ChannelClosed(kind)),
                },
            }
        }
    }

    /// Ask the transport to drop the link and wait until it reports
    /// `Disconnected`.
    pub async fn disconnect(&self) -> GattResult<()> {
        let kind = OperationKind::Disconnect;
        self.with_timeout(kind, async {
            let (current, mut updates) = self.state.watch();
            if current.state == ConnectionState::Disconnected {
                return Ok(());
            }
            log::debug!("{}: disconnecting", self.address);
            self.transport.disconnect();
            while let Some(update) = updates.next().await {
                if update.state == ConnectionState::Disconnected {
                    return Ok(());
                }
            }
            Err(GattError::ChannelClosed(kind))
        })
        .await
    }

    pub async fn read_characteristic(&self, target: CharacteristicId) -> GattResult<Vec<u8>> {
        let context = OperationContext::Characteristic {
            target,
            value: None,
        };
        let body = self.exchange(
            GattRequest::ReadCharacteristic(target),
            &context,
            &self.events.characteristic_read,
            move |event| event.target == target,
            |event| (event.status, event.value),
        );
        let value = self
            .exclusive(OperationKind::ReadCharacteristic, &context, body)
            .await?;
        log::debug!("{}: read {} -> 0x{}", self.address, target, hex::encode(&value));
        Ok(value)
    }

    /// Write with the channel's default options.
    pub async fn write(&self, target: CharacteristicId, value: Vec<u8>) -> GattResult<()> {
        let options = WriteOptions::default().skip_unchanged(self.config.skip_unchanged_writes);
        self.write_characteristic(target, value, options).await
    }

    pub async fn write_characteristic(
        &self,
        target: CharacteristicId,
        value: Vec<u8>,
        options: WriteOptions,
    ) -> GattResult<()> {
        let context = OperationContext::Characteristic {
            target,
            value: Some(value.clone()),
        };
        let body = async {
            if options.skip_unchanged
                && self.cached_value(&target).as_deref() == Some(value.as_slice())
            {
                log::debug!("{}: {} already holds value, skipping write", self.address, target);
                return Ok(());
            }
            let request = GattRequest::WriteCharacteristic {
                target,
                value: value.clone(),
                write_type: options.write_type,
            };
            self.exchange(
                request,
                &context,
                &self.events.characteristic_write,
                move |event| event.target == target,
                |event| (event.status, ()),
            )
            .await
        };
        self.exclusive(OperationKind::WriteCharacteristic, &context, body)
            .await
    }

    pub async fn read_descriptor(&self, target: DescriptorId) -> GattResult<Vec<u8>> {
        let context = OperationContext::Descriptor {
            target,
            value: None,
        };
        let body = self.exchange(
            GattRequest::ReadDescriptor(target),
            &context,
            &self.events.descriptor_read,
            move |event| event.target == target,
            |event| (event.status, event.value),
        );
        self.exclusive(OperationKind::ReadDescriptor, &context, body)
            .await
    }

    pub async fn write_descriptor(&self, target: DescriptorId, value: Vec<u8>) -> GattResult<()> {
        let context = OperationContext::Descriptor {
            target,
            value: Some(value.clone()),
        };
        let body = self.exchange(
            GattRequest::WriteDescriptor { target, value },
            &context,
            &self.events.descriptor_write,
            move |event| event.target == target,
            |event| (event.status, ()),
        );
        self.exclusive(OperationKind::WriteDescriptor, &context, body)
            .await
    }

    pub async fn read_rssi(&self) -> GattResult<i16> {
        let context = OperationContext::None;
        let body = self.exchange(
            GattRequest::ReadRssi,
            &context,
            &self.events.rssi_read,
            |_| true,
            |event| (event.status, event.rssi),
        );
        self.exclusive(OperationKind::ReadRssi, &context, body).await
    }

    /// Negotiate the MTU. Returns the value the peer settled on.
    pub async fn request_mtu(&self, mtu: u16) -> GattResult<u16> {
        let context = OperationContext::Mtu(mtu);
        let body = self.exchange(
            GattRequest::RequestMtu(mtu),
            &context,
            &self.events.mtu_changed,
            |_| true,
            |event| (event.status, event.mtu),
        );
        let negotiated = self
            .exclusive(OperationKind::RequestMtu, &context, body)
            .await?;
        log::debug!("{}: MTU {} (requested {})", self.address, negotiated, mtu);
        Ok(negotiated)
    }

    pub async fn discover_services(&self) -> GattResult<Vec<DiscoveredService>> {
        let context = OperationContext::None;
        let body = self.exchange(
            GattRequest::DiscoverServices,
            &context,
            &self.events.services_discovered,
            |_| true,
            |event| (event.status, event.services),
        );
        self.exclusive(OperationKind::DiscoverServices, &context, body)
            .await
    }

    /// Open a reliable write transaction. Completes as soon as the
    /// transport accepts it.
    pub async fn begin_reliable_write(&self) -> GattResult<()> {
        let context = OperationContext::None;
        let body = async { self.submit(&GattRequest::BeginReliableWrite, &context) };
        self.exclusive(OperationKind::BeginReliableWrite, &context, body)
            .await
    }

    /// Commit the queued reliable writes.
    pub async fn execute_reliable_write(&self) -> GattResult<()> {
        let context = OperationContext::None;
        let body = self.exchange(
            GattRequest::ExecuteReliableWrite,
            &context,
            &self.events.reliable_write_completed,
            |_| true,
            |event| (event.status, ()),
        );
        self.exclusive(OperationKind::ExecuteReliableWrite, &context, body)
            .await
    }

    /// Value changes pushed by the peer for `target`.
    ///
    /// The stream belongs to the current link: it is already finished when
    /// the channel is not connected. Does not touch the peer's
    /// configuration; see [`enable_notifications`](Self::enable_notifications).
    pub fn notifications(&self, target: CharacteristicId) -> NotificationStream {
        let (current, updates) = self.state.watch();
        NotificationStream {
            target,
            values: self.events.characteristic_changed.subscribe(),
            updates,
            finished: !current.state.is_connected(),
        }
    }

    /// Route changes for `target` to this client and configure the peer to
    /// push them. Waits for the link like any other operation; the returned
    /// stream is live before the peer is told.
    pub async fn enable_notifications(
        &self,
        target: CharacteristicId,
        mode: NotificationMode,
    ) -> GattResult<NotificationStream> {
        let cccd_value = mode.cccd_value();
        let context = cccd_context(target, cccd_value);
        let body = async {
            let stream = self.notifications(target);
            self.configure_notifications(target, true, cccd_value, &context)
                .await?;
            Ok(stream)
        };
        self.exclusive(OperationKind::SetNotification, &context, body)
            .await
    }

    pub async fn disable_notifications(&self, target: CharacteristicId) -> GattResult<()> {
        let context = cccd_context(target, CCCD_DISABLED);
        let body = self.configure_notifications(target, false, CCCD_DISABLED, &context);
        self.exclusive(OperationKind::SetNotification, &context, body)
            .await
    }

    /// Switch local routing for `target`, then write its CCCD. Must run
    /// while holding the execution slot.
    async fn configure_notifications(
        &self,
        target: CharacteristicId,
        enable: bool,
        cccd_value: [u8; 2],
        context: &OperationContext,
    ) -> GattResult<()> {
        let cccd = target.descriptor(CLIENT_CHARACTERISTIC_CONFIG);
        self.submit(&GattRequest::SetNotification { target, enable }, context)?;
        self.exchange(
            GattRequest::WriteDescriptor {
                target: cccd,
                value: cccd_value.to_vec(),
            },
            context,
            &self.events.descriptor_write,
            move |event| event.target == cccd,
            |event| (event.status, ()),
        )
        .await
    }

    /// Run `body` in the execution slot once the link is usable.
    async fn exclusive<T, B>(
        &self,
        kind: OperationKind,
        context: &OperationContext,
        body: B,
    ) -> GattResult<T>
    where
        B: Future<Output = GattResult<T>>,
    {
        let guard = self.guard(kind);
        let on_lost = lost_error(kind, context.clone());
        let run = self
            .serializer
            .run_exclusive(kind, guard.ready(on_lost), body);
        self.with_timeout(kind, run).await
    }

    /// Submit `request` and wait for its completion event. Must run while
    /// holding the execution slot.
    async fn exchange<E, T, M, C>(
        &self,
        request: GattRequest,
        context: &OperationContext,
        events: &Broadcaster<E>,
        matches: M,
        complete: C,
    ) -> GattResult<T>
    where
        E: Clone,
        M: Fn(&E) -> bool,
        C: FnOnce(E) -> (StatusCode, T),
    {
        let kind = request.kind();
        // Subscribe before submitting so a fast callback cannot be missed.
        let subscription: Subscription<E> = events.subscribe();
        self.submit(&request, context)?;

        let guard = self.guard(kind);
        tokio::select! {
            biased;
            err = guard.lost(lost_error(kind, context.clone())) => {
                log::debug!("{}: {} abandoned: {}", self.address, kind, err);
                Err(err)
            }
            event = subscription.first_matching(matches) => {
                let event = event.map_err(|_| GattError::ChannelClosed(kind))?;
                let (status, value) = complete(event);
                if status == GATT_SUCCESS {
                    Ok(value)
                } else {
                    log::debug!("{}: {} failed with status {}", self.address, kind, status);
                    Err(GattError::RemoteError {
                        kind,
                        status,
                        context: context.clone(),
                    })
                }
            }
        }
    }

    fn submit(&self, request: &GattRequest, context: &OperationContext) -> GattResult<()> {
        if self.transport.submit(request) {
            return Ok(());
        }
        let snapshot = self.transport.snapshot(Some(request));
        log::warn!(
            "{}: transport refused {} ({}): {}",
            self.address,
            request.kind(),
            context,
            snapshot
        );
        Err(GattError::TransportRejected {
            kind: request.kind(),
            context: context.clone(),
            snapshot,
        })
    }

    async fn with_timeout<T, F>(&self, kind: OperationKind, operation: F) -> GattResult<T>
    where
        F: Future<Output = GattResult<T>>,
    {
        match self.config.operation_timeout {
            Some(after) => match tokio::time::timeout(after, operation).await {
                Ok(result) => result,
                Err(_) => {
                    log::warn!("{}: {} timed out after {:?}", self.address, kind, after);
                    Err(GattError::Timeout { kind, after })
                }
            },
            None => operation.await,
        }
    }
}

fn cccd_context(target: CharacteristicId, value: [u8; 2]) -> OperationContext {
    OperationContext::Descriptor {
        target: target.descriptor(CLIENT_CHARACTERISTIC_CONFIG),
        value: Some(value.to_vec()),
    }
}

fn lost_error(
    kind: OperationKind,
    context: OperationContext,
) -> impl Fn(DeviceAddress, StatusCode) -> GattError {
    move |device, status| GattError::ChannelLost {
        device,
        status,
        kind,
        context: context.clone(),
    }
}

/// Values pushed by the peer for one characteristic.
///
/// Ends when the channel starts disconnecting or is shut down.
pub struct NotificationStream {
    target: CharacteristicId,
    values: Subscription<ChangeEvent>,
    updates: Subscription<ConnectionUpdate>,
    finished: bool,
}

impl NotificationStream {
    pub fn target(&self) -> &CharacteristicId {
        &self.target
    }

    /// Next pushed value, or `None` once the stream has ended.
    pub async fn next_value(&mut self) -> Option<Vec<u8>> {
        self.next().await
    }
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        // Values already delivered take priority over a later disconnect.
        loop {
            match this.values.poll_next_event(cx) {
                Poll::Ready(Some(event)) if event.target == this.target => {
                    return Poll::Ready(Some(event.value));
                }
                Poll::Ready(Some(_)) => continue,
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => break,
            }
        }

        loop {
            match this.updates.poll_next_event(cx) {
                Poll::Ready(Some(ConnectionUpdate {
                    state: ConnectionState::Disconnecting | ConnectionState::Disconnected,
                    ..
                }))
                | Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(_)) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

//! Per-connection context
//!
//! Owns everything one logical connection needs: the transport handle, the
//! connection state tracker, the event broadcasters, the execution slot and
//! the on-record characteristic values. The integration layer feeds
//! transport callbacks in through [`GattChannel::on_transport_event`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::broadcast::{
    ChangeEvent, CharacteristicEvent, DescriptorEvent, EventBroadcaster, MtuEvent,
    ReliableWriteEvent, RssiEvent, ServicesEvent, Subscription,
};
use super::guard::DisconnectGuard;
use super::serializer::OperationSerializer;
use super::state::ConnectionStateTracker;
use super::transport::{
    CharacteristicId, ConnectionState, ConnectionUpdate, DeviceAddress, GattTransport,
    OperationKind, TransportEvent, DEFAULT_ATT_MTU, GATT_SUCCESS,
};

/// Per-channel settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Upper bound for any single operation. `None` waits indefinitely.
    #[serde(with = "duration_millis")]
    pub operation_timeout: Option<Duration>,
    /// Default for [`WriteOptions::skip_unchanged`](super::WriteOptions).
    pub skip_unchanged_writes: bool,
    /// MTU assumed until a negotiation completes.
    pub default_mtu: u16,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            operation_timeout: None,
            skip_unchanged_writes: false,
            default_mtu: DEFAULT_ATT_MTU,
        }
    }
}

impl ChannelConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// One logical connection to a remote peer.
pub struct GattChannel {
    pub(crate) address: DeviceAddress,
    pub(crate) transport: Arc<dyn GattTransport>,
    pub(crate) config: ChannelConfig,
    pub(crate) state: ConnectionStateTracker,
    pub(crate) events: EventBroadcaster,
    pub(crate) serializer: OperationSerializer,
    pub(crate) transport_disabled: watch::Receiver<bool>,
    /// Last known value per characteristic.
    values: Mutex<HashMap<CharacteristicId, Vec<u8>>>,
    mtu: AtomicU16,
}

impl GattChannel {
    /// Create a channel over `transport`. `transport_disabled` reports
    /// whether the radio as a whole is unavailable.
    pub fn new(
        transport: Arc<dyn GattTransport>,
        transport_disabled: watch::Receiver<bool>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        let address = transport.address().clone();
        let mtu = AtomicU16::new(config.default_mtu);
        Arc::new(Self {
            address,
            state: ConnectionStateTracker::new(Arc::clone(&transport)),
            transport,
            config,
            events: EventBroadcaster::new(),
            serializer: OperationSerializer::new(),
            transport_disabled,
            values: Mutex::new(HashMap::new()),
            mtu,
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Latest connection state and status.
    pub fn connection_state(&self) -> ConnectionUpdate {
        self.state.current()
    }

    /// Connection transitions from now on.
    pub fn connection_updates(&self) -> Subscription<ConnectionUpdate> {
        self.state.subscribe()
    }

    /// Currently negotiated MTU.
    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::SeqCst)
    }

    /// Last value seen for `target` via read, write or notification.
    pub fn cached_value(&self, target: &CharacteristicId) -> Option<Vec<u8>> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .cloned()
    }

    /// True when no operation holds the execution slot.
    pub fn is_idle(&self) -> bool {
        self.serializer.is_idle()
    }

    /// Tear the channel down: queued operations fail with `ChannelClosed`,
    /// subscriptions finish and later events are dropped.
    pub fn shutdown(&self) {
        log::debug!("{}: shutting down channel", self.address);
        self.serializer.close();
        self.events.close_all();
        self.state.close();
    }

    pub(crate) fn guard(&self, kind: OperationKind) -> DisconnectGuard<'_> {
        DisconnectGuard::new(
            &self.state,
            self.transport_disabled.clone(),
            self.address.clone(),
            kind,
        )
    }

    fn record_value(&self, target: CharacteristicId, value: &[u8]) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target, value.to_vec());
    }

    fn reset(&self) {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.mtu.store(self.config.default_mtu, Ordering::SeqCst);
    }

    /// Entry point for the transport's callback feed.
    pub fn on_transport_event(&self, event: TransportEvent) {
        log::trace!("{}: event {:?}", self.address, event);
        let state = self.state.current().state;
        match event {
            TransportEvent::ConnectionStateChanged(update) => {
                if self.state.report(update) && update.state == ConnectionState::Disconnected {
                    self.reset();
                }
            }
            // Completions after the link went down belong to abandoned operations.
            event if !state.is_connected() => {
                log::debug!("{}: dropping {:?} while {:?}", self.address, event, state);
            }
            TransportEvent::CharacteristicRead {
                target,
                value,
                status,
            } => {
                if status == GATT_SUCCESS {
                    self.record_value(target, &value);
                }
                self.events.characteristic_read.publish(CharacteristicEvent {
                    target,
                    value,
                    status,
                });
            }
            TransportEvent::CharacteristicWrite {
                target,
                value,
                status,
            } => {
                if status == GATT_SUCCESS {
                    self.record_value(target, &value);
                }
                self.events
                    .characteristic_write
                    .publish(CharacteristicEvent {
                        target,
                        value,
                        status,
                    });
            }
            TransportEvent::CharacteristicChanged { target, value } => {
                self.record_value(target, &value);
                self.events
                    .characteristic_changed
                    .publish(ChangeEvent { target, value });
            }
            TransportEvent::DescriptorRead {
                target,
                value,
                status,
            } => {
                self.events.descriptor_read.publish(DescriptorEvent {
                    target,
                    value,
                    status,
                });
            }
            TransportEvent::DescriptorWrite {
                target,
                value,
                status,
            } => {
                self.events.descriptor_write.publish(DescriptorEvent {
                    target,
                    value,
                    status,
                });
            }
            TransportEvent::RssiRead { rssi, status } => {
                self.events.rssi_read.publish(RssiEvent { rssi, status });
            }
            TransportEvent::MtuChanged { mtu, status } => {
                if status == GATT_SUCCESS {
                    self.mtu.store(mtu, Ordering::SeqCst);
                }
                self.events.mtu_changed.publish(MtuEvent { mtu, status });
            }
            TransportEvent::ServicesDiscovered { services, status } => {
                self.events
                    .services_discovered
                    .publish(ServicesEvent { services, status });
            }
            TransportEvent::ReliableWriteCompleted { status } => {
                self.events
                    .reliable_write_completed
                    .publish(ReliableWriteEvent { status });
            }
        }
    }
}

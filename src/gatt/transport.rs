//! GATT transport trait definitions and core types
//!
//! Defines the boundary between the operation queue and a platform GATT
//! stack: what can be submitted, what comes back through the callback feed,
//! and the identifiers both sides agree on.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw status code reported by the transport. Opaque; only
/// [`GATT_SUCCESS`] has a fixed meaning.
pub type StatusCode = i32;

/// Status code the transport uses for a successful completion.
pub const GATT_SUCCESS: StatusCode = 0;

/// MTU every LE link starts with before negotiation.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Client Characteristic Configuration descriptor (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// Address of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated peer identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::Real(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            DeviceAddress::Simulated(id) => write!(f, "sim:{}", id),
        }
    }
}

/// Connection status of a channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Whether the transport is allowed to move from `self` to `next`.
    /// Any state may drop straight to `Disconnected`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnecting)
        )
    }
}

/// One connection-state report: the new state and the raw status the
/// transport attached to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub state: ConnectionState,
    pub status: StatusCode,
}

impl ConnectionUpdate {
    pub fn new(state: ConnectionState, status: StatusCode) -> Self {
        Self { state, status }
    }

    pub fn is_success(&self) -> bool {
        self.status == GATT_SUCCESS
    }
}

impl Default for ConnectionUpdate {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected, GATT_SUCCESS)
    }
}

/// Category of request/response interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Connect,
    Disconnect,
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
    SetNotification,
    ReadRssi,
    RequestMtu,
    DiscoverServices,
    BeginReliableWrite,
    ExecuteReliableWrite,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::ReadCharacteristic => "characteristic read",
            OperationKind::WriteCharacteristic => "characteristic write",
            OperationKind::ReadDescriptor => "descriptor read",
            OperationKind::WriteDescriptor => "descriptor write",
            OperationKind::SetNotification => "notification setup",
            OperationKind::ReadRssi => "RSSI read",
            OperationKind::RequestMtu => "MTU request",
            OperationKind::DiscoverServices => "service discovery",
            OperationKind::BeginReliableWrite => "reliable write begin",
            OperationKind::ExecuteReliableWrite => "reliable write execute",
        };
        f.write_str(name)
    }
}

/// A characteristic, identified by its service and its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// The descriptor with the given UUID under this characteristic.
    pub fn descriptor(&self, descriptor: Uuid) -> DescriptorId {
        DescriptorId {
            characteristic: *self,
            descriptor,
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service {} characteristic {}", self.service, self.characteristic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorId {
    pub characteristic: CharacteristicId,
    pub descriptor: Uuid,
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} descriptor {}", self.characteristic, self.descriptor)
    }
}

/// How a characteristic write is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteType {
    #[default]
    WithResponse,
    WithoutResponse,
}

/// A request handed to [`GattTransport::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    ReadCharacteristic(CharacteristicId),
    WriteCharacteristic {
        target: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    },
    ReadDescriptor(DescriptorId),
    WriteDescriptor {
        target: DescriptorId,
        value: Vec<u8>,
    },
    /// Local routing switch for change notifications; completes synchronously.
    SetNotification {
        target: CharacteristicId,
        enable: bool,
    },
    ReadRssi,
    RequestMtu(u16),
    DiscoverServices,
    BeginReliableWrite,
    ExecuteReliableWrite,
}

impl GattRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            GattRequest::ReadCharacteristic(_) => OperationKind::ReadCharacteristic,
            GattRequest::WriteCharacteristic { .. } => OperationKind::WriteCharacteristic,
            GattRequest::ReadDescriptor(_) => OperationKind::ReadDescriptor,
            GattRequest::WriteDescriptor { .. } => OperationKind::WriteDescriptor,
            GattRequest::SetNotification { .. } => OperationKind::SetNotification,
            GattRequest::ReadRssi => OperationKind::ReadRssi,
            GattRequest::RequestMtu(_) => OperationKind::RequestMtu,
            GattRequest::DiscoverServices => OperationKind::DiscoverServices,
            GattRequest::BeginReliableWrite => OperationKind::BeginReliableWrite,
            GattRequest::ExecuteReliableWrite => OperationKind::ExecuteReliableWrite,
        }
    }
}

/// Transport internals captured when a submission is rejected.
/// Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSnapshot {
    /// The transport already had a request outstanding.
    pub busy: bool,
    /// A client handle is registered with the platform stack.
    pub client_registered: bool,
    /// The peer reference resolved to a device.
    pub peer_resolved: bool,
    /// The target's service is known, when the request has one.
    pub service_present: Option<bool>,
    /// Property bitmask of the target characteristic, when known.
    pub properties: Option<u8>,
}

impl fmt::Display for TransportSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "busy={} client_registered={} peer_resolved={}",
            self.busy, self.client_registered, self.peer_resolved
        )?;
        if let Some(present) = self.service_present {
            write!(f, " service_present={}", present)?;
        }
        if let Some(properties) = self.properties {
            write!(f, " properties={:#04x}", properties)?;
        }
        Ok(())
    }
}

/// A characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: u8,
    pub descriptors: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Everything the transport reports through its callback feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChanged(ConnectionUpdate),
    CharacteristicRead {
        target: CharacteristicId,
        value: Vec<u8>,
        status: StatusCode,
    },
    CharacteristicWrite {
        target: CharacteristicId,
        value: Vec<u8>,
        status: StatusCode,
    },
    /// Unsolicited notification or indication from the peer.
    CharacteristicChanged {
        target: CharacteristicId,
        value: Vec<u8>,
    },
    DescriptorRead {
        target: DescriptorId,
        value: Vec<u8>,
        status: StatusCode,
    },
    DescriptorWrite {
        target: DescriptorId,
        value: Vec<u8>,
        status: StatusCode,
    },
    RssiRead {
        rssi: i16,
        status: StatusCode,
    },
    MtuChanged {
        mtu: u16,
        status: StatusCode,
    },
    ServicesDiscovered {
        services: Vec<DiscoveredService>,
        status: StatusCode,
    },
    ReliableWriteCompleted {
        status: StatusCode,
    },
}

/// A platform GATT client bound to one peer.
///
/// Every method is synchronous and non-blocking. Completions arrive later
/// through [`TransportEvent`]s fed to the owning channel.
pub trait GattTransport: Send + Sync {
    /// The peer this transport talks to.
    fn address(&self) -> &DeviceAddress;

    /// Start connecting. Returns false if the attempt could not start.
    fn connect(&self) -> bool;

    /// Ask the platform to tear the link down.
    fn disconnect(&self);

    /// Start a request. Returns false if the transport refused it outright.
    fn submit(&self, request: &GattRequest) -> bool;

    /// Debug fields describing why a request (or, for `None`, a connect
    /// attempt) may have been refused.
    fn snapshot(&self, request: Option<&GattRequest>) -> TransportSnapshot;

    /// Release the platform handle.
    fn close(&self);
}

//! Serialized GATT client operations over a callback-driven transport
//!
//! Turns a transport that accepts one request at a time and reports
//! completions as out-of-band events into awaitable request/response calls,
//! with correct failure propagation when the link drops mid-operation.

pub mod broadcast;
pub mod channel;
pub mod guard;
pub mod operations;
pub mod serializer;
pub mod simulated;
pub mod state;
pub mod transport;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use transport::{
    CharacteristicId, DescriptorId, DeviceAddress, OperationKind, StatusCode, TransportSnapshot,
};

/// Identifiers and payload of the operation a failure belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OperationContext {
    #[default]
    None,
    Characteristic {
        target: CharacteristicId,
        value: Option<Vec<u8>>,
    },
    Descriptor {
        target: DescriptorId,
        value: Option<Vec<u8>>,
    },
    Mtu(u16),
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationContext::None => f.write_str("no target"),
            OperationContext::Characteristic { target, value } => {
                write!(f, "{}", target)?;
                if let Some(value) = value {
                    write!(f, " value 0x{}", hex::encode(value))?;
                }
                Ok(())
            }
            OperationContext::Descriptor { target, value } => {
                write!(f, "{}", target)?;
                if let Some(value) = value {
                    write!(f, " value 0x{}", hex::encode(value))?;
                }
                Ok(())
            }
            OperationContext::Mtu(mtu) => write!(f, "mtu {}", mtu),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GattError {
    #[error("Bluetooth transport is disabled")]
    TransportDisabled,

    #[error("Transport refused {kind} ({context}): {snapshot}")]
    TransportRejected {
        kind: OperationKind,
        context: OperationContext,
        snapshot: TransportSnapshot,
    },

    #[error("{kind} failed with status {status} ({context})")]
    RemoteError {
        kind: OperationKind,
        status: StatusCode,
        context: OperationContext,
    },

    #[error("{device} disconnected with status {status} during {kind} ({context})")]
    ChannelLost {
        device: DeviceAddress,
        status: StatusCode,
        kind: OperationKind,
        context: OperationContext,
    },

    #[error("Channel closed before {0} completed")]
    ChannelClosed(OperationKind),

    #[error("{kind} timed out after {after:?}")]
    Timeout { kind: OperationKind, after: Duration },
}

impl GattError {
    /// The raw transport status carried by this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GattError::RemoteError { status, .. } | GattError::ChannelLost { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    pub fn is_disconnection(&self) -> bool {
        matches!(self, GattError::ChannelLost { .. })
    }
}

pub type GattResult<T> = Result<T, GattError>;

pub use broadcast::{Broadcaster, Subscription};
pub use channel::{ChannelConfig, GattChannel};
pub use operations::{NotificationMode, NotificationStream, WriteOptions};

// gattlink - serialized request/response operations over callback-driven GATT transports

pub mod gatt;

pub use gatt::transport::{
    CharacteristicId, ConnectionState, ConnectionUpdate, DescriptorId, DeviceAddress,
    GattRequest, GattTransport, OperationKind, StatusCode, TransportEvent, GATT_SUCCESS,
};
pub use gatt::{
    ChannelConfig, GattChannel, GattError, GattResult, NotificationMode, NotificationStream,
    OperationContext, WriteOptions,
};

//! In-process GATT simulator
//!
//! [`SimTransport`] records what the channel submits and lets a test decide
//! what comes back. [`SimPeer`] plays a remote GATT server on top of it,
//! answering every submission through the channel's callback feed. Used for
//! integration testing without real BLE hardware.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::channel::GattChannel;
use super::transport::{
    CharacteristicId, ConnectionState, ConnectionUpdate, DescriptorId, DeviceAddress,
    DiscoveredService, GattRequest, GattTransport, OperationKind, StatusCode, TransportEvent,
    TransportSnapshot, GATT_SUCCESS,
};

/// ATT "Attribute Not Found".
pub const ATTRIBUTE_NOT_FOUND: StatusCode = 0x0A;

/// Lock `mutex`, carrying on with the data if a holder panicked.
fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Something the channel asked the simulated transport to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Connect,
    Disconnect,
    Request(GattRequest),
}

/// A transport that accepts or refuses submissions on command and never
/// answers by itself.
pub struct SimTransport {
    address: DeviceAddress,
    submissions_tx: mpsc::UnboundedSender<Submission>,
    submissions_rx: AsyncMutex<mpsc::UnboundedReceiver<Submission>>,
    /// Every accepted request, in submission order.
    log: Mutex<Vec<GattRequest>>,
    refused: Mutex<HashSet<OperationKind>>,
    refuse_connect: AtomicBool,
    connect_attempts: AtomicUsize,
    closes: AtomicUsize,
}

impl SimTransport {
    /// Create a transport for a fresh simulated address.
    pub fn new() -> Arc<Self> {
        Self::with_address(DeviceAddress::Simulated(Uuid::new_v4()))
    }

    pub fn with_address(address: DeviceAddress) -> Arc<Self> {
        let (submissions_tx, submissions_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            address,
            submissions_tx,
            submissions_rx: AsyncMutex::new(submissions_rx),
            log: Mutex::new(Vec::new()),
            refused: Mutex::new(HashSet::new()),
            refuse_connect: AtomicBool::new(false),
            connect_attempts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    /// Refuse every later submission of `kind`.
    pub fn refuse(&self, kind: OperationKind) {
        locked(&self.refused).insert(kind);
    }

    pub fn accept(&self, kind: OperationKind) {
        locked(&self.refused).remove(&kind);
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Requests accepted so far.
    pub fn submitted(&self) -> Vec<GattRequest> {
        locked(&self.log).clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Wait for the next accepted submission of any sort.
    pub async fn next_submission(&self) -> Option<Submission> {
        self.submissions_rx.lock().await.recv().await
    }

    /// Wait for the next accepted GATT request, skipping connect and
    /// disconnect submissions.
    pub async fn next_request(&self) -> Option<GattRequest> {
        loop {
            match self.next_submission().await? {
                Submission::Request(request) => return Some(request),
                _ => continue,
            }
        }
    }
}

impl GattTransport for SimTransport {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    fn connect(&self) -> bool {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return false;
        }
        let _ = self.submissions_tx.send(Submission::Connect);
        true
    }

    fn disconnect(&self) {
        let _ = self.submissions_tx.send(Submission::Disconnect);
    }

    fn submit(&self, request: &GattRequest) -> bool {
        if locked(&self.refused).contains(&request.kind()) {
            return false;
        }
        locked(&self.log).push(request.clone());
        let _ = self
            .submissions_tx
            .send(Submission::Request(request.clone()));
        true
    }

    fn snapshot(&self, request: Option<&GattRequest>) -> TransportSnapshot {
        let busy = request
            .map(|r| locked(&self.refused).contains(&r.kind()))
            .unwrap_or_else(|| self.refuse_connect.load(Ordering::SeqCst));
        let service_present = match request {
            Some(GattRequest::ReadCharacteristic(_))
            | Some(GattRequest::WriteCharacteristic { .. })
            | Some(GattRequest::ReadDescriptor(_))
            | Some(GattRequest::WriteDescriptor { .. }) => Some(true),
            _ => None,
        };
        TransportSnapshot {
            busy,
            client_registered: true,
            peer_resolved: true,
            service_present,
            properties: None,
        }
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A simulated remote GATT server.
pub struct SimPeer {
    values: Mutex<HashMap<CharacteristicId, Vec<u8>>>,
    descriptors: Mutex<HashMap<DescriptorId, Vec<u8>>>,
    services: Vec<DiscoveredService>,
    /// One-shot failure status per operation kind.
    failures: Mutex<HashMap<OperationKind, StatusCode>>,
    rssi: i16,
    max_mtu: u16,
    latency: Duration,
}

impl SimPeer {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            descriptors: Mutex::new(HashMap::new()),
            services: Vec::new(),
            failures: Mutex::new(HashMap::new()),
            rssi: -50,
            max_mtu: 247,
            latency: Duration::ZERO,
        }
    }

    pub fn with_characteristic(self, target: CharacteristicId, value: Vec<u8>) -> Self {
        locked(&self.values).insert(target, value);
        self
    }

    pub fn with_services(mut self, services: Vec<DiscoveredService>) -> Self {
        self.services = services;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Largest MTU the peer agrees to.
    pub fn with_max_mtu(mut self, mtu: u16) -> Self {
        self.max_mtu = mtu;
        self
    }

    /// Delay before each answer. Uses tokio time, so paused clocks advance
    /// instantly in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer the next submission of `kind` with `status`.
    pub fn fail_next(&self, kind: OperationKind, status: StatusCode) {
        locked(&self.failures).insert(kind, status);
    }

    pub fn value(&self, target: &CharacteristicId) -> Option<Vec<u8>> {
        locked(&self.values).get(target).cloned()
    }

    pub fn descriptor_value(&self, target: &DescriptorId) -> Option<Vec<u8>> {
        locked(&self.descriptors).get(target).cloned()
    }

    /// Push a value change to the channel as an unsolicited notification.
    pub fn notify(&self, channel: &GattChannel, target: CharacteristicId, value: Vec<u8>) {
        locked(&self.values).insert(target, value.clone());
        channel.on_transport_event(TransportEvent::CharacteristicChanged { target, value });
    }

    /// Answer everything `transport` receives until it is dropped.
    pub fn attach(
        self: Arc<Self>,
        channel: Arc<GattChannel>,
        transport: Arc<SimTransport>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(submission) = transport.next_submission().await {
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                for event in self.respond(submission) {
                    channel.on_transport_event(event);
                }
            }
        })
    }

    fn take_failure(&self, kind: OperationKind) -> Option<StatusCode> {
        locked(&self.failures).remove(&kind)
    }

    fn respond(&self, submission: Submission) -> Vec<TransportEvent> {
        let connection = |state, status| {
            TransportEvent::ConnectionStateChanged(ConnectionUpdate::new(state, status))
        };

        let request = match submission {
            Submission::Connect => {
                return match self.take_failure(OperationKind::Connect) {
                    Some(status) => vec![
                        connection(ConnectionState::Connecting, GATT_SUCCESS),
                        connection(ConnectionState::Disconnected, status),
                    ],
                    None => vec![
                        connection(ConnectionState::Connecting, GATT_SUCCESS),
                        connection(ConnectionState::Connected, GATT_SUCCESS),
                    ],
                };
            }
            Submission::Disconnect => {
                return vec![
                    connection(ConnectionState::Disconnecting, GATT_SUCCESS),
                    connection(ConnectionState::Disconnected, GATT_SUCCESS),
                ];
            }
            Submission::Request(request) => request,
        };

        let failure = self.take_failure(request.kind());
        let event = match request {
            GattRequest::ReadCharacteristic(target) => {
                let stored = self.value(&target);
                let status = failure.unwrap_or(if stored.is_some() {
                    GATT_SUCCESS
                } else {
                    ATTRIBUTE_NOT_FOUND
                });
                TransportEvent::CharacteristicRead {
                    target,
                    value: stored.unwrap_or_default(),
                    status,
                }
            }
            GattRequest::WriteCharacteristic { target, value, .. } => {
                let status = failure.unwrap_or(GATT_SUCCESS);
                if status == GATT_SUCCESS {
                    locked(&self.values).insert(target, value.clone());
                }
                TransportEvent::CharacteristicWrite {
                    target,
                    value,
                    status,
                }
            }
            GattRequest::ReadDescriptor(target) => {
                let stored = self.descriptor_value(&target);
                let status = failure.unwrap_or(if stored.is_some() {
                    GATT_SUCCESS
                } else {
                    ATTRIBUTE_NOT_FOUND
                });
                TransportEvent::DescriptorRead {
                    target,
                    value: stored.unwrap_or_default(),
                    status,
                }
            }
            GattRequest::WriteDescriptor { target, value } => {
                let status = failure.unwrap_or(GATT_SUCCESS);
                if status == GATT_SUCCESS {
                    locked(&self.descriptors).insert(target, value.clone());
                }
                TransportEvent::DescriptorWrite {
                    target,
                    value,
                    status,
                }
            }
            // Local switch on the client side; the peer never hears of it.
            GattRequest::SetNotification { .. } | GattRequest::BeginReliableWrite => {
                return Vec::new();
            }
            GattRequest::ReadRssi => TransportEvent::RssiRead {
                rssi: self.rssi,
                status: failure.unwrap_or(GATT_SUCCESS),
            },
            GattRequest::RequestMtu(mtu) => TransportEvent::MtuChanged {
                mtu: mtu.min(self.max_mtu),
                status: failure.unwrap_or(GATT_SUCCESS),
            },
            GattRequest::DiscoverServices => TransportEvent::ServicesDiscovered {
                services: self.services.clone(),
                status: failure.unwrap_or(GATT_SUCCESS),
            },
            GattRequest::ExecuteReliableWrite => TransportEvent::ReliableWriteCompleted {
                status: failure.unwrap_or(GATT_SUCCESS),
            },
        };
        vec![event]
    }
}

impl Default for SimPeer {
    fn default() -> Self {
        Self::new()
    }
}

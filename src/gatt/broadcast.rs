//! No-history fan-out of transport events
//!
//! Each [`Broadcaster`] delivers every published event to the subscribers
//! that exist at publish time. Subscribers never see earlier events, and a
//! dropped subscription is pruned on the next publish.

use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::mpsc;

use super::transport::{CharacteristicId, DescriptorId, DiscoveredService, StatusCode};

/// Unbounded fan-out point for one event kind.
pub struct Broadcaster<T> {
    /// `None` once the broadcaster has been closed.
    subscribers: Mutex<Option<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Deliver `event` to every live subscriber, in subscription order.
    /// Returns how many subscribers received it.
    pub fn publish(&self, event: T) -> usize {
        let mut guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subscribers) = guard.as_mut() else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Start receiving events published from now on.
    ///
    /// Subscribing to a closed broadcaster yields a subscription that is
    /// already finished.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subscribers) = guard.as_mut() {
            subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// Number of subscriptions that have not been dropped yet.
    pub fn subscriber_count(&self) -> usize {
        let guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Tear the broadcaster down. Pending subscriptions finish and no
    /// further events are delivered.
    pub fn close(&self) {
        let mut guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }

    pub fn is_closed(&self) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a [`Broadcaster`] subscription.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

/// The broadcaster was closed before a matching event arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

impl<T> Subscription<T> {
    /// Next event, or `None` once the broadcaster is closed.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Resolve with the first event and unsubscribe.
    pub async fn first(self) -> Result<T, Closed> {
        self.first_matching(|_| true).await
    }

    /// Resolve with the first event accepted by `matches` and unsubscribe.
    /// Events rejected by `matches` are discarded.
    pub async fn first_matching<F>(mut self, matches: F) -> Result<T, Closed>
    where
        F: Fn(&T) -> bool,
    {
        while let Some(event) = self.rx.recv().await {
            if matches(&event) {
                return Ok(event);
            }
        }
        Err(Closed)
    }

    pub(crate) fn poll_next_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// Result of a characteristic read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicEvent {
    pub target: CharacteristicId,
    pub value: Vec<u8>,
    pub status: StatusCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorEvent {
    pub target: DescriptorId,
    pub value: Vec<u8>,
    pub status: StatusCode,
}

/// Unsolicited value change pushed by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub target: CharacteristicId,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiEvent {
    pub rssi: i16,
    pub status: StatusCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuEvent {
    pub mtu: u16,
    pub status: StatusCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicesEvent {
    pub services: Vec<DiscoveredService>,
    pub status: StatusCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableWriteEvent {
    pub status: StatusCode,
}

/// One broadcaster per completion kind of a channel. Connection-state
/// transitions are published by the state tracker instead.
#[derive(Default)]
pub struct EventBroadcaster {
    pub characteristic_read: Broadcaster<CharacteristicEvent>,
    pub characteristic_write: Broadcaster<CharacteristicEvent>,
    pub characteristic_changed: Broadcaster<ChangeEvent>,
    pub descriptor_read: Broadcaster<DescriptorEvent>,
    pub descriptor_write: Broadcaster<DescriptorEvent>,
    pub rssi_read: Broadcaster<RssiEvent>,
    pub mtu_changed: Broadcaster<MtuEvent>,
    pub services_discovered: Broadcaster<ServicesEvent>,
    pub reliable_write_completed: Broadcaster<ReliableWriteEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_all(&self) {
        self.characteristic_read.close();
        self.characteristic_write.close();
        self.characteristic_changed.close();
        self.descriptor_read.close();
        self.descriptor_write.close();
        self.rssi_read.close();
        self.mtu_changed.close();
        self.services_discovered.close();
        self.reliable_write_completed.close();
    }
}

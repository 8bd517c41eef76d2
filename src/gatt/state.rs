//! Connection state of one channel endpoint
//!
//! Records every `(state, status)` report coming from the transport and
//! republishes it. Also owns the "close exactly once" rule for the
//! transport handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::broadcast::{Broadcaster, Subscription};
use super::transport::{ConnectionState, ConnectionUpdate, GattTransport};

pub struct ConnectionStateTracker {
    current: Mutex<ConnectionUpdate>,
    updates: Broadcaster<ConnectionUpdate>,
    transport: Arc<dyn GattTransport>,
    /// Set while a connect session holds the transport handle open.
    session_open: AtomicBool,
}

impl ConnectionStateTracker {
    pub fn new(transport: Arc<dyn GattTransport>) -> Self {
        Self {
            current: Mutex::new(ConnectionUpdate::default()),
            updates: Broadcaster::new(),
            transport,
            session_open: AtomicBool::new(false),
        }
    }

    /// Latest known state and status.
    pub fn current(&self) -> ConnectionUpdate {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transitions reported from now on. No replay.
    pub fn subscribe(&self) -> Subscription<ConnectionUpdate> {
        self.updates.subscribe()
    }

    /// Current value plus every later transition, with nothing lost or
    /// repeated in between.
    pub fn watch(&self) -> (ConnectionUpdate, Subscription<ConnectionUpdate>) {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        (*current, self.updates.subscribe())
    }

    /// Mark the start of a connect session. The next `Disconnected` report
    /// closes the transport.
    pub fn open_session(&self) {
        self.session_open.store(true, Ordering::SeqCst);
    }

    /// Disarm a session whose connect attempt never started.
    pub fn abandon_session(&self) {
        self.session_open.store(false, Ordering::SeqCst);
    }

    /// Record a transition reported by the transport.
    ///
    /// Returns false when the report repeats the current value and was not
    /// republished.
    pub fn report(&self, update: ConnectionUpdate) -> bool {
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if *current == update {
                return false;
            }
            if current.state != update.state && !current.state.can_transition_to(update.state) {
                log::warn!(
                    "{}: unexpected transition {:?} -> {:?} (status {})",
                    self.transport.address(),
                    current.state,
                    update.state,
                    update.status
                );
            } else {
                log::debug!(
                    "{}: {:?} -> {:?} (status {})",
                    self.transport.address(),
                    current.state,
                    update.state,
                    update.status
                );
            }
            *current = update;

            // Close before publishing: a subscriber woken by this report may
            // open the next session straight away.
            if update.state == ConnectionState::Disconnected
                && self.session_open.swap(false, Ordering::SeqCst)
            {
                log::debug!("{}: closing transport", self.transport.address());
                self.transport.close();
            }

            // Publish under the lock so `watch` never misses or repeats a transition.
            self.updates.publish(update);
        }
        true
    }

    pub(crate) fn close(&self) {
        self.updates.close();
    }
}

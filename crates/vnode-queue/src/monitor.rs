//! Monitor variable: a single-slot, versioned register with change signals
//!
//! One writer calls [`Monitor::set`]; any number of readers hold a
//! [`Subscription`] and wait on its ready signal. Each `set` fires the current
//! signal and installs a fresh one, so wakeup is O(1) no matter how many
//! subscribers are waiting and nothing accumulates per subscriber.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// A value together with the version it was written at
///
/// Version 0 means the monitor has never been set and `value` is `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    /// The latest value, `None` until the first set
    pub value: Option<T>,
    /// Number of sets so far
    pub version: u64,
}

struct Slot<T> {
    value: Option<T>,
    version: u64,
    signal: CancellationToken,
}

/// Latched, versioned value
///
/// Cloning yields another handle to the same slot.
pub struct Monitor<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for Monitor<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone> Default for Monitor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Monitor<T> {
    /// Create an uninitialized monitor (version 0)
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                value: None,
                version: 0,
                signal: CancellationToken::new(),
            })),
        }
    }

    /// Store a new value and wake every subscriber. Never blocks.
    pub fn set(&self, value: T) {
        let fired = {
            let mut slot = self.slot.lock();
            slot.version += 1;
            slot.value = Some(value);
            std::mem::replace(&mut slot.signal, CancellationToken::new())
        };
        fired.cancel();
    }

    /// Current value and version, without marking anything as seen
    pub fn get(&self) -> Versioned<T> {
        let slot = self.slot.lock();
        Versioned {
            value: slot.value.clone(),
            version: slot.version,
        }
    }

    /// Subscribe to changes
    ///
    /// A fresh subscription has seen nothing, so its ready signal is already
    /// fired when the monitor holds a value.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            slot: self.slot.clone(),
            last_seen: 0,
        }
    }
}

/// Single-consumer view of a [`Monitor`]
pub struct Subscription<T> {
    slot: Arc<Mutex<Slot<T>>>,
    last_seen: u64,
}

impl<T: Clone> Subscription<T> {
    /// One-shot signal that fires once a version newer than the last one
    /// read through [`Subscription::value`] exists
    ///
    /// Re-acquire it after every read.
    pub fn ready(&self) -> CancellationToken {
        let slot = self.slot.lock();
        if slot.version > self.last_seen {
            let fired = CancellationToken::new();
            fired.cancel();
            fired
        } else {
            slot.signal.clone()
        }
    }

    /// Current value and version; records the version as seen
    pub fn value(&mut self) -> Versioned<T> {
        let slot = self.slot.lock();
        self.last_seen = slot.version;
        Versioned {
            value: slot.value.clone(),
            version: slot.version,
        }
    }

    /// Wait for a version newer than the last one seen and return it
    pub async fn changed(&mut self) -> Versioned<T> {
        self.ready().cancelled_owned().await;
        self.value()
    }
}

//! Shared device state.
//!
//! [`TelemetryState`] is a cheap-to-clone handle over one snapshot. Every
//! mutation goes through a single `watch` sender, so writers are serialized
//! and readers always see a whole snapshot, never a partially applied update.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::error::SyncError;

pub const LED_COUNT: usize = 8;

/// Point-in-time copy of everything known about the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub potentiometer: i64,
    pub relay: bool,
    pub leds: [bool; LED_COUNT],
    pub connected: bool,
    /// Bumped on every applied change.
    pub revision: u64,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            humidity: 0.0,
            potentiometer: 0,
            relay: false,
            leds: [false; LED_COUNT],
            connected: false,
            revision: 0,
        }
    }
}

/// Fields carried by one structured sensor document. `None` means the field
/// was absent and the previous value stays.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub potentiometer: Option<i64>,
    pub relay: Option<bool>,
}

/// One decoded inbound message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateUpdate {
    Sensors(SensorReading),
    Relay(bool),
    Led { index: usize, on: bool },
}

#[derive(Clone)]
pub struct TelemetryState {
    tx: Arc<watch::Sender<TelemetrySnapshot>>,
}

impl Default for TelemetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TelemetrySnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        *self.tx.borrow()
    }

    /// Observers are woken after every applied change.
    pub fn subscribe(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.tx.subscribe()
    }

    /// Apply an inbound update as one atomic step. Returns the resulting
    /// snapshot, or `None` when nothing changed.
    pub fn apply(&self, update: StateUpdate) -> Option<TelemetrySnapshot> {
        let mut result = None;
        self.tx.send_if_modified(|snap| {
            let before = *snap;
            match update {
                StateUpdate::Sensors(reading) => {
                    if let Some(t) = reading.temperature {
                        snap.temperature = t;
                    }
                    if let Some(h) = reading.humidity {
                        snap.humidity = h;
                    }
                    if let Some(p) = reading.potentiometer {
                        snap.potentiometer = p;
                    }
                    if let Some(r) = reading.relay {
                        snap.relay = r;
                    }
                }
                StateUpdate::Relay(on) => snap.relay = on,
                StateUpdate::Led { index, on } => match snap.leds.get_mut(index) {
                    Some(slot) => *slot = on,
                    None => return false,
                },
            }
            if *snap == before {
                return false;
            }
            snap.revision += 1;
            result = Some(*snap);
            true
        });
        result
    }

    /// Flip one LED as a single read-modify-write and return its new value.
    pub fn toggle_led(&self, index: usize) -> Result<bool, SyncError> {
        self.toggle_led_and(index, |_| ()).map(|(on, ())| on)
    }

    /// Like [`toggle_led`](Self::toggle_led), but runs `then` with the new
    /// value before the write lock is released.
    pub fn toggle_led_and<R>(
        &self,
        index: usize,
        then: impl FnOnce(bool) -> R,
    ) -> Result<(bool, R), SyncError> {
        if index >= LED_COUNT {
            return Err(SyncError::InvalidLedIndex(index));
        }
        let mut result = None;
        self.tx.send_modify(|snap| {
            snap.leds[index] = !snap.leds[index];
            snap.revision += 1;
            let on = snap.leds[index];
            result = Some((on, then(on)));
        });
        result.ok_or(SyncError::InvalidLedIndex(index))
    }

    pub fn set_connected(&self, connected: bool) {
        self.tx.send_if_modified(|snap| {
            if snap.connected == connected {
                return false;
            }
            snap.connected = connected;
            snap.revision += 1;
            true
        });
    }

    pub fn led(&self, index: usize) -> Option<bool> {
        self.tx.borrow().leds.get(index).copied()
    }

    pub fn is_connected(&self) -> bool {
        self.tx.borrow().connected
    }
}

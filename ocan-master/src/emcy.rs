//! EMCY consumer

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ocan_common::constants::EMCY_BASE;
use ocan_common::messages::EmcyMessage;
use ocan_common::{CanId, CanMessage};

use crate::network::{NetworkHandle, Subscription};

/// Emergency code classes and their standard descriptions
const DESCRIPTIONS: [(u16, u16, &str); 12] = [
    // Code   Mask    Description
    (0x0000, 0xFF00, "Error Reset / No Error"),
    (0x1000, 0xFF00, "Generic Error"),
    (0x2000, 0xF000, "Current"),
    (0x3000, 0xF000, "Voltage"),
    (0x4000, 0xF000, "Temperature"),
    (0x5000, 0xFF00, "Device Hardware"),
    (0x6000, 0xF000, "Device Software"),
    (0x7000, 0xFF00, "Additional Modules"),
    (0x8000, 0xF000, "Monitoring"),
    (0x9000, 0xFF00, "External Error"),
    (0xF000, 0xFF00, "Additional Functions"),
    (0xFF00, 0xFF00, "Device Specific"),
];

/// A received emergency report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyError {
    /// 16-bit emergency error code
    pub code: u16,
    /// Contents of the error register (object 0x1001)
    pub register: u8,
    /// Manufacturer specific data
    pub vendor: [u8; 5],
    /// When the report was received
    pub timestamp: Instant,
}

impl EmcyError {
    /// The standard description of this code's class, if any
    pub fn description(&self) -> Option<&'static str> {
        DESCRIPTIONS
            .iter()
            .find(|(code, mask, _)| self.code & mask == *code)
            .map(|(_, _, desc)| *desc)
    }

    fn is_reset(&self) -> bool {
        self.code == 0
    }
}

impl core::fmt::Display for EmcyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Code 0x{:04X}", self.code)?;
        if let Some(desc) = self.description() {
            write!(f, ", {desc}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct EmcyState {
    log: Vec<EmcyError>,
    active: Vec<EmcyError>,
    received: u64,
}

#[derive(Default)]
struct EmcyShared {
    state: Mutex<EmcyState>,
    changed: Condvar,
    callbacks: Mutex<Vec<Box<dyn Fn(&EmcyError) + Send>>>,
}

/// Consumes emergency messages from one node
///
/// Every received emergency is appended to the [log](EmcyConsumer::log);
/// the error-reset code 0x0000 additionally clears the
/// [active](EmcyConsumer::active) list, any other code is appended to it.
pub struct EmcyConsumer {
    network: NetworkHandle,
    shared: Arc<EmcyShared>,
    subscription: Subscription,
}

impl core::fmt::Debug for EmcyConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EmcyConsumer").finish()
    }
}

impl EmcyConsumer {
    pub(crate) fn new(network: NetworkHandle, node_id: u8) -> Self {
        let shared = Arc::new(EmcyShared::default());
        let handler_shared = shared.clone();
        let cob_id = EMCY_BASE | node_id as u32;
        let subscription = network.subscribe(
            cob_id,
            Arc::new(move |cob_id, data, _timestamp| {
                let msg = CanMessage::new(CanId::Std(cob_id as u16), data);
                let parsed = match EmcyMessage::try_from(msg) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        log::warn!("Malformed EMCY frame: {e}");
                        return;
                    }
                };
                let entry = EmcyError {
                    code: parsed.code,
                    register: parsed.register,
                    vendor: parsed.vendor,
                    timestamp: Instant::now(),
                };
                {
                    let mut state = handler_shared.state.lock().unwrap();
                    state.log.push(entry);
                    if entry.is_reset() {
                        state.active.clear();
                    } else {
                        state.active.push(entry);
                    }
                    state.received += 1;
                    handler_shared.changed.notify_all();
                }
                for callback in handler_shared.callbacks.lock().unwrap().iter() {
                    callback(&entry);
                }
            }),
        );
        Self {
            network,
            shared,
            subscription,
        }
    }

    /// All emergencies received from this node, oldest first
    pub fn log(&self) -> Vec<EmcyError> {
        self.shared.state.lock().unwrap().log.clone()
    }

    /// Emergencies not yet cleared by an error reset
    pub fn active(&self) -> Vec<EmcyError> {
        self.shared.state.lock().unwrap().active.clone()
    }

    /// Forget all logged and active emergencies
    pub fn reset(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.log.clear();
        state.active.clear();
    }

    /// Register a callback invoked on the receive thread for every
    /// emergency
    ///
    /// Callbacks must be short and must not call back into blocking APIs.
    pub fn add_callback(&self, callback: Box<dyn Fn(&EmcyError) + Send>) {
        self.shared.callbacks.lock().unwrap().push(callback);
    }

    /// Block until the next emergency arrives
    ///
    /// Returns None on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<EmcyError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        let observed = state.received;
        while state.received == observed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self.shared.changed.wait_timeout(state, remaining).unwrap();
            state = guard;
        }
        state.log.last().copied()
    }

    /// Release the EMCY subscription
    pub(crate) fn detach(&self) {
        self.network.unsubscribe(&self.subscription);
    }
}

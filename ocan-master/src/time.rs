//! TIME producer

use std::time::{SystemTime, UNIX_EPOCH};

use ocan_common::constants::TIME_ID;
use ocan_common::messages::{CanMessage, TimeOfDay, TIME_OF_DAY_EPOCH_OFFSET};
use ocan_common::traits::TransportError;

use crate::network::NetworkHandle;

/// Transmits the TIME object (CANopen TIME-OF-DAY broadcast)
#[derive(Debug)]
pub struct TimeProducer {
    network: NetworkHandle,
}

impl TimeProducer {
    pub(crate) fn new(network: NetworkHandle) -> Self {
        Self { network }
    }

    /// Send a TIME object carrying the current system time
    pub fn transmit(&self) -> Result<(), TransportError> {
        self.transmit_at(SystemTime::now())
    }

    /// Send a TIME object carrying a specific point in time
    ///
    /// Times before the CANopen epoch (1984-01-01) are clamped to it.
    pub fn transmit_at(&self, time: SystemTime) -> Result<(), TransportError> {
        let unix_millis = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let epoch_millis = unix_millis.saturating_sub(TIME_OF_DAY_EPOCH_OFFSET * 1000);
        let msg: CanMessage = TimeOfDay::from_epoch_millis(epoch_millis).into();
        debug_assert_eq!(TIME_ID, msg.id().raw());
        self.network.send_message(msg)
    }
}

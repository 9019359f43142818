//! SYNC producer

use std::sync::Mutex;
use std::time::Duration;

use ocan_common::constants::SYNC_ID;
use ocan_common::traits::TransportError;

use crate::network::NetworkHandle;
use crate::periodic::PeriodicTask;

/// Transmits the SYNC object, once or periodically
#[derive(Debug)]
pub struct SyncProducer {
    network: NetworkHandle,
    task: Mutex<Option<PeriodicTask>>,
}

impl SyncProducer {
    pub(crate) fn new(network: NetworkHandle) -> Self {
        Self {
            network,
            task: Mutex::new(None),
        }
    }

    /// Send one SYNC object
    ///
    /// # Arguments
    /// * `count` - Optional counter to include in the message
    pub fn transmit(&self, count: Option<u8>) -> Result<(), TransportError> {
        match count {
            Some(count) => self.network.send(SYNC_ID, &[count]),
            None => self.network.send(SYNC_ID, &[]),
        }
    }

    /// Start periodic SYNC transmission in a background thread
    pub fn start(&self, period: Duration) {
        let mut task = self.task.lock().unwrap();
        // Stop a running transmission first so its thread is not leaked
        if let Some(mut old) = task.take() {
            old.stop();
        }
        *task = Some(self.network.send_periodic(SYNC_ID, &[], period));
    }

    /// Stop periodic SYNC transmission
    pub fn stop(&self) {
        if let Some(mut task) = self.task.lock().unwrap().take() {
            task.stop();
        }
    }
}

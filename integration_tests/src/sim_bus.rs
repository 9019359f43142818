//! In-memory CAN bus for driving the master stack in tests
//!
//! Frames sent by the network are recorded and offered to registered
//! responder closures, which stand in for slave nodes; any frames they
//! return are queued for the network's receiver, as are frames injected
//! directly by the test.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ocan_common::traits::{CanReceiver, CanSender, RecvError, TransportError};
use ocan_common::CanMessage;

/// A closure standing in for a slave node
pub type Responder = Box<dyn FnMut(&CanMessage) -> Vec<CanMessage> + Send>;

struct SimBusInner {
    host_tx: SyncSender<CanMessage>,
    host_rx: Mutex<Option<Receiver<CanMessage>>>,
    sent: Mutex<Vec<CanMessage>>,
    responders: Mutex<Vec<Responder>>,
}

/// Test-side handle to the simulated bus
#[derive(Clone)]
pub struct SimBus {
    inner: Arc<SimBusInner>,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    /// Create a bus with an empty wire
    pub fn new() -> Self {
        let (host_tx, host_rx) = sync_channel(1024);
        Self {
            inner: Arc::new(SimBusInner {
                host_tx,
                host_rx: Mutex::new(Some(host_rx)),
                sent: Mutex::new(Vec::new()),
                responders: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The transport endpoints to hand to [Network::connect]
    ///
    /// [Network::connect]: ocan_master::Network::connect
    pub fn endpoints(&self) -> (SimSender, SimReceiver) {
        let rx = self
            .inner
            .host_rx
            .lock()
            .unwrap()
            .take()
            .expect("endpoints() may only be called once");
        (
            SimSender {
                inner: self.inner.clone(),
            },
            SimReceiver { rx },
        )
    }

    /// Queue a frame for the network's receiver, as if a node had sent it
    pub fn inject(&self, msg: CanMessage) {
        self.inner.host_tx.send(msg).expect("bus receiver is gone");
    }

    /// All frames the network has sent so far
    pub fn sent(&self) -> Vec<CanMessage> {
        self.inner.sent.lock().unwrap().clone()
    }

    /// Take the frames the network has sent, clearing the log
    pub fn take_sent(&self) -> Vec<CanMessage> {
        std::mem::take(&mut self.inner.sent.lock().unwrap())
    }

    /// Attach a responder standing in for a slave node
    pub fn add_responder(&self, responder: Responder) {
        self.inner.responders.lock().unwrap().push(responder);
    }
}

/// Sending endpoint handed to the network
pub struct SimSender {
    inner: Arc<SimBusInner>,
}

impl CanSender for SimSender {
    fn send(&mut self, msg: CanMessage) -> Result<(), TransportError> {
        self.inner.sent.lock().unwrap().push(msg);
        let mut replies = Vec::new();
        for responder in self.inner.responders.lock().unwrap().iter_mut() {
            replies.extend(responder(&msg));
        }
        for reply in replies {
            // The network may already be shutting down; replies can be
            // dropped then
            let _ = self.inner.host_tx.send(reply);
        }
        Ok(())
    }
}

/// Receiving endpoint handed to the network
pub struct SimReceiver {
    rx: Receiver<CanMessage>,
}

impl CanReceiver for SimReceiver {
    fn recv(&mut self, timeout: Duration) -> Result<CanMessage, RecvError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvTimeoutError::Timeout) => Err(RecvError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(RecvError::Disconnected),
        }
    }

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.rx.try_recv().ok()
    }
}

//! Network dispatcher
//!
//! The [Network] owns the bus connection and the receive thread, and is the
//! single ingress and egress point for CAN frames. Inbound frames are
//! dispatched to handlers subscribed by COB-ID; frames nobody subscribed to
//! are offered to the [node scanner](crate::scanner::Scanner). Subsystems
//! carry a cheap [NetworkHandle] clone for sending and subscribing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ocan_common::od::ObjectDictionary;
use ocan_common::traits::{CanReceiver, CanSender, RecvError, TransportError};
use ocan_common::{CanId, CanMessage, NodeId};

use crate::lss::LssMaster;
use crate::nmt::NmtMaster;
use crate::node::RemoteNode;
use crate::periodic::PeriodicTask;
use crate::scanner::{ScanState, Scanner};
use crate::sync::SyncProducer;
use crate::time::TimeProducer;

/// A frame handler registered with [NetworkHandle::subscribe]
///
/// Handlers run on the receive thread and must not block; they should hand
/// the frame off to a queue or condition variable and return.
pub type FrameHandler = Arc<dyn Fn(u32, &[u8], Instant) + Send + Sync>;

/// Handle identifying one subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    cob_id: u32,
    id: u64,
}

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    entries: HashMap<u32, Vec<(u64, FrameHandler)>>,
}

pub(crate) struct NetworkInner {
    sender: Mutex<Option<Box<dyn CanSender>>>,
    subscribers: Mutex<SubscriberTable>,
    scan_state: Arc<Mutex<ScanState>>,
    running: AtomicBool,
}

/// Cheap cloneable access to the dispatcher, carried by every subsystem
#[derive(Clone)]
pub struct NetworkHandle {
    inner: Arc<NetworkInner>,
}

impl core::fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetworkHandle").finish()
    }
}

impl NetworkHandle {
    /// Send a raw CAN frame
    pub fn send(&self, cob_id: u32, data: &[u8]) -> Result<(), TransportError> {
        self.send_message(build_message(cob_id, data, false))
    }

    /// Send a remote (RTR) frame
    pub fn send_rtr(&self, cob_id: u32) -> Result<(), TransportError> {
        self.send_message(build_message(cob_id, &[], true))
    }

    /// Send a prepared CAN frame
    pub fn send_message(&self, msg: CanMessage) -> Result<(), TransportError> {
        {
            let mut sender = self.inner.sender.lock().unwrap();
            match sender.as_mut() {
                Some(sender) => sender.send(msg)?,
                None => return Err(TransportError::NotConnected),
            }
        }
        // A SYNC produced by this host drives the local PDO trigger engine
        // just like one observed on the bus
        if msg.id().raw() == ocan_common::constants::SYNC_ID && !msg.is_rtr() {
            self.notify(msg.id().raw(), msg.data(), Instant::now());
        }
        Ok(())
    }

    /// Listen for frames with a specific COB-ID
    ///
    /// Handlers are invoked in registration order on the receive thread.
    pub fn subscribe(&self, cob_id: u32, handler: FrameHandler) -> Subscription {
        let mut table = self.inner.subscribers.lock().unwrap();
        let id = table.next_id;
        table.next_id += 1;
        table.entries.entry(cob_id).or_default().push((id, handler));
        Subscription { cob_id, id }
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, sub: &Subscription) {
        let mut table = self.inner.subscribers.lock().unwrap();
        if let Some(handlers) = table.entries.get_mut(&sub.cob_id) {
            handlers.retain(|(id, _)| *id != sub.id);
            if handlers.is_empty() {
                table.entries.remove(&sub.cob_id);
            }
        }
    }

    /// Start transmitting a frame periodically on a dedicated thread
    pub fn send_periodic(&self, cob_id: u32, data: &[u8], period: Duration) -> PeriodicTask {
        PeriodicTask::new(self.clone(), build_message(cob_id, data, false), period)
    }

    /// Start transmitting a remote (RTR) frame periodically
    pub fn send_periodic_rtr(&self, cob_id: u32, period: Duration) -> PeriodicTask {
        PeriodicTask::new(self.clone(), build_message(cob_id, &[], true), period)
    }

    /// Feed one inbound frame to the dispatcher
    ///
    /// This is what the receive thread calls for every frame from the
    /// transport; tests use it to inject frames directly.
    pub fn notify(&self, cob_id: u32, data: &[u8], timestamp: Instant) {
        let handlers: Vec<FrameHandler> = {
            let table = self.inner.subscribers.lock().unwrap();
            table
                .entries
                .get(&cob_id)
                .map(|entries| entries.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in &handlers {
            handler(cob_id, data, timestamp);
        }
        ScanState::on_frame(&self.inner.scan_state, cob_id);
    }

    /// True while a bus connection is up
    pub fn is_connected(&self) -> bool {
        self.inner.sender.lock().unwrap().is_some()
    }

    pub(crate) fn scan_state(&self) -> Arc<Mutex<ScanState>> {
        self.inner.scan_state.clone()
    }
}

fn build_message(cob_id: u32, data: &[u8], rtr: bool) -> CanMessage {
    let id = if cob_id > 0x7FF {
        CanId::Extended(cob_id)
    } else {
        CanId::Std(cob_id as u16)
    };
    if rtr {
        CanMessage::new_rtr(id)
    } else {
        CanMessage::new(id, data)
    }
}

/// Representation of one CAN bus containing one or more nodes
///
/// ```no_run
/// use ocan_master::Network;
/// use ocan_common::NodeId;
///
/// let mut network = Network::new();
/// # let od = ocan_common::od::ObjectDictionary::new();
/// let node = network.add_node(NodeId::new(5).unwrap(), od);
/// ```
pub struct Network {
    handle: NetworkHandle,
    nodes: HashMap<u8, Arc<RemoteNode>>,
    rx_thread: Option<JoinHandle<()>>,
    /// SYNC producer on COB-ID 0x080
    pub sync: SyncProducer,
    /// TIME producer on COB-ID 0x100
    pub time: TimeProducer,
    /// Broadcast NMT master addressing every node
    pub nmt: NmtMaster,
    /// LSS master
    pub lss: LssMaster,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    /// Create a network without a bus connection
    ///
    /// Frames can be injected with [NetworkHandle::notify] even while no
    /// transport is attached.
    pub fn new() -> Self {
        let inner = Arc::new(NetworkInner {
            sender: Mutex::new(None),
            subscribers: Mutex::new(SubscriberTable::default()),
            scan_state: Arc::new(Mutex::new(ScanState::default())),
            running: AtomicBool::new(false),
        });
        let handle = NetworkHandle { inner };
        Self {
            sync: SyncProducer::new(handle.clone()),
            time: TimeProducer::new(handle.clone()),
            nmt: NmtMaster::new_broadcast(handle.clone()),
            lss: LssMaster::new(handle.clone()),
            nodes: HashMap::new(),
            rx_thread: None,
            handle,
        }
    }

    /// Attach a transport and start the receive thread
    pub fn connect(
        &mut self,
        sender: Box<dyn CanSender>,
        mut receiver: Box<dyn CanReceiver>,
    ) -> Result<(), TransportError> {
        if self.rx_thread.is_some() {
            self.disconnect();
        }
        *self.handle.inner.sender.lock().unwrap() = Some(sender);
        self.handle.inner.running.store(true, Ordering::SeqCst);

        let inner = self.handle.inner.clone();
        let thread = std::thread::Builder::new()
            .name("ocan-rx".into())
            .spawn(move || {
                let handle = NetworkHandle { inner };
                while handle.inner.running.load(Ordering::SeqCst) {
                    match receiver.recv(Duration::from_millis(100)) {
                        Ok(msg) => {
                            // Remote frames are requests for other producers
                            if msg.is_rtr() {
                                continue;
                            }
                            handle.notify(msg.id().raw(), msg.data(), Instant::now());
                        }
                        Err(RecvError::Timeout) => continue,
                        Err(RecvError::Disconnected) => {
                            log::error!("CAN transport closed, receive thread exiting");
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn receive thread");
        self.rx_thread = Some(thread);
        Ok(())
    }

    /// Open a SocketCAN device and connect to it
    #[cfg(feature = "socketcan")]
    pub fn connect_socketcan(&mut self, device: &str) -> Result<(), TransportError> {
        let (sender, receiver) = ocan_common::open_socketcan(device)?;
        self.connect(Box::new(sender), Box::new(receiver))
    }

    /// Disconnect from the bus
    ///
    /// Stops every periodic transmission, joins the receive thread, clears
    /// the subscriber table (queue-backed waiters observe the closed
    /// channel and fail with a cancellation error) and drops the bus
    /// handle. Subsequent sends fail with
    /// [TransportError::NotConnected].
    pub fn disconnect(&mut self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
        self.sync.stop();
        self.handle.inner.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.rx_thread.take() {
            let _ = thread.join();
        }
        self.handle.inner.subscribers.lock().unwrap().entries.clear();
        *self.handle.inner.sender.lock().unwrap() = None;
    }

    /// Get a cloneable handle for sending, subscribing and injection
    pub fn handle(&self) -> NetworkHandle {
        self.handle.clone()
    }

    /// Send a raw CAN frame
    pub fn send(&self, cob_id: u32, data: &[u8]) -> Result<(), TransportError> {
        self.handle.send(cob_id, data)
    }

    /// Feed one inbound frame to the dispatcher (test injection)
    pub fn notify(&self, cob_id: u32, data: &[u8], timestamp: Instant) {
        self.handle.notify(cob_id, data, timestamp);
    }

    /// Add a remote node with its object dictionary
    pub fn add_node(&mut self, id: NodeId, od: ObjectDictionary) -> Arc<RemoteNode> {
        let node = RemoteNode::new(self.handle.clone(), id, od);
        if let Some(old) = self.nodes.insert(id.raw(), node.clone()) {
            old.detach();
        }
        node
    }

    /// Get a previously added node
    pub fn node(&self, id: u8) -> Option<&Arc<RemoteNode>> {
        self.nodes.get(&id)
    }

    /// Remove a node, releasing all its subscriptions
    pub fn remove_node(&mut self, id: u8) {
        if let Some(node) = self.nodes.remove(&id) {
            node.detach();
        }
    }

    /// Iterate over all added nodes
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<RemoteNode>> {
        self.nodes.values()
    }

    /// Get the passive node scanner
    pub fn scanner(&self) -> Scanner {
        Scanner::new(self.handle.clone())
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.disconnect();
    }
}

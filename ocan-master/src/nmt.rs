//! NMT master and heartbeat consumer
//!
//! One [NmtMaster] exists per remote node, plus a broadcast instance on the
//! network which addresses every node at once. The per-node instances also
//! consume heartbeat messages to track the remote state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use snafu::Snafu;

use ocan_common::constants::HEARTBEAT_BASE;
use ocan_common::messages::{Heartbeat, NmtCommand, NmtCommandSpecifier, NmtState};
use ocan_common::traits::TransportError;
use ocan_common::CanMessage;

use crate::network::{NetworkHandle, Subscription};
use crate::periodic::PeriodicTask;

/// Default time without heartbeats after which a node counts as unreachable
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// Error produced by NMT operations
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum NmtError {
    /// No heartbeat arrived before the deadline
    #[snafu(display("Timed out waiting for heartbeat"))]
    Timeout,
    /// A state string did not name a commandable state
    #[snafu(display("'{state}' is not a valid NMT state"))]
    InvalidState {
        /// The rejected string
        state: String,
    },
    /// Sending the command failed
    #[snafu(display("{source}"))]
    Transport {
        /// The underlying transport error
        source: TransportError,
    },
}

#[derive(Debug, Default)]
struct NmtStatus {
    state: Option<NmtState>,
    last_heartbeat: Option<Instant>,
    heartbeats: u64,
    bootups: u64,
}

#[derive(Debug, Default)]
struct NmtShared {
    status: Mutex<NmtStatus>,
    changed: Condvar,
}

/// NMT master for one node, or for the whole bus when broadcast
///
/// Commands are fire-and-forget: the protocol defines no confirmation, so
/// state changes are observed through the heartbeat consumer.
#[derive(Debug)]
pub struct NmtMaster {
    network: NetworkHandle,
    node_id: u8,
    shared: Arc<NmtShared>,
    subscription: Option<Subscription>,
    heartbeat_timeout_millis: AtomicU64,
    guard_task: Mutex<Option<PeriodicTask>>,
}

impl NmtMaster {
    /// Create a per-node master which also consumes the node's heartbeats
    pub(crate) fn new(network: NetworkHandle, node_id: u8) -> Self {
        let shared = Arc::new(NmtShared::default());
        let handler_shared = shared.clone();
        let cob_id = HEARTBEAT_BASE | node_id as u32;
        let subscription = network.subscribe(
            cob_id,
            Arc::new(move |cob_id, data, _timestamp| {
                let msg = CanMessage::new(ocan_common::CanId::Std(cob_id as u16), data);
                match Heartbeat::try_from(msg) {
                    Ok(heartbeat) => {
                        let mut status = handler_shared.status.lock().unwrap();
                        status.last_heartbeat = Some(Instant::now());
                        status.heartbeats += 1;
                        if heartbeat.state == NmtState::Bootup {
                            status.bootups += 1;
                        }
                        status.state = Some(heartbeat.state);
                        handler_shared.changed.notify_all();
                    }
                    Err(e) => log::warn!("Malformed heartbeat: {e}"),
                }
            }),
        );
        Self {
            network,
            node_id,
            shared,
            subscription: Some(subscription),
            heartbeat_timeout_millis: AtomicU64::new(DEFAULT_HEARTBEAT_TIMEOUT.as_millis() as u64),
            guard_task: Mutex::new(None),
        }
    }

    /// Create the broadcast master addressing all 127 node IDs
    pub(crate) fn new_broadcast(network: NetworkHandle) -> Self {
        Self {
            network,
            node_id: 0,
            shared: Arc::new(NmtShared::default()),
            subscription: None,
            heartbeat_timeout_millis: AtomicU64::new(DEFAULT_HEARTBEAT_TIMEOUT.as_millis() as u64),
            guard_task: Mutex::new(None),
        }
    }

    /// Send an NMT command to this node
    pub fn send_command(&self, specifier: NmtCommandSpecifier) -> Result<(), NmtError> {
        let msg: CanMessage = NmtCommand {
            specifier,
            node: self.node_id,
        }
        .into();
        self.network
            .send_message(msg)
            .map_err(|source| NmtError::Transport { source })
    }

    /// Command a state by name
    ///
    /// Accepted states: "OPERATIONAL", "STOPPED", "PRE-OPERATIONAL",
    /// "RESET", "RESET COMMUNICATION". The command is emitted without
    /// waiting for confirmation.
    pub fn set_state(&self, state: &str) -> Result<(), NmtError> {
        let specifier = match state {
            "OPERATIONAL" => NmtCommandSpecifier::Start,
            "STOPPED" => NmtCommandSpecifier::Stop,
            "PRE-OPERATIONAL" => NmtCommandSpecifier::EnterPreOperational,
            "RESET" => NmtCommandSpecifier::ResetNode,
            "RESET COMMUNICATION" => NmtCommandSpecifier::ResetComm,
            _ => {
                return Err(NmtError::InvalidState {
                    state: state.to_string(),
                })
            }
        };
        self.send_command(specifier)
    }

    /// The state reported by the most recent heartbeat
    ///
    /// Returns None when no heartbeat has been observed, or when the node
    /// has been silent longer than the configured heartbeat timeout.
    pub fn state(&self) -> Option<NmtState> {
        let status = self.shared.status.lock().unwrap();
        let timeout = Duration::from_millis(self.heartbeat_timeout_millis.load(Ordering::Relaxed));
        match (status.state, status.last_heartbeat) {
            (Some(state), Some(at)) if at.elapsed() <= timeout => Some(state),
            _ => None,
        }
    }

    /// True while heartbeats arrive within the configured timeout
    pub fn is_alive(&self) -> bool {
        self.state().is_some()
    }

    /// Change the time without heartbeats after which the node counts as
    /// unreachable
    pub fn set_heartbeat_timeout(&self, timeout: Duration) {
        self.heartbeat_timeout_millis
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Block until the next heartbeat arrives
    ///
    /// Only heartbeats received after the call begins count.
    pub fn wait_for_heartbeat(&self, timeout: Duration) -> Result<NmtState, NmtError> {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock().unwrap();
        let observed = status.heartbeats;
        while status.heartbeats == observed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NmtError::Timeout);
            }
            let (guard, _) = self.shared.changed.wait_timeout(status, remaining).unwrap();
            status = guard;
        }
        Ok(status.state.expect("heartbeat recorded without state"))
    }

    /// Block until the node emits a boot-up message
    pub fn wait_for_bootup(&self, timeout: Duration) -> Result<(), NmtError> {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock().unwrap();
        let observed = status.bootups;
        while status.bootups == observed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NmtError::Timeout);
            }
            let (guard, _) = self.shared.changed.wait_timeout(status, remaining).unwrap();
            status = guard;
        }
        Ok(())
    }

    /// Start node guarding
    ///
    /// Polls the node with a remote request on its heartbeat COB-ID; the
    /// node answers with its state and an alternating toggle bit, which
    /// feeds the same consumer as ordinary heartbeats.
    pub fn start_node_guarding(&self, period: Duration) {
        let cob_id = HEARTBEAT_BASE | self.node_id as u32;
        let mut task = self.guard_task.lock().unwrap();
        if let Some(mut old) = task.take() {
            old.stop();
        }
        *task = Some(self.network.send_periodic_rtr(cob_id, period));
    }

    /// Stop node guarding
    pub fn stop_node_guarding(&self) {
        if let Some(mut task) = self.guard_task.lock().unwrap().take() {
            task.stop();
        }
    }

    /// Release the heartbeat subscription and stop guarding
    pub(crate) fn detach(&self) {
        self.stop_node_guarding();
        if let Some(sub) = &self.subscription {
            self.network.unsubscribe(sub);
        }
    }
}

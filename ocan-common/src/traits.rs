//! Transport seam
//!
//! The master stack talks to a CAN interface exclusively through these two
//! object-safe traits, so any transport (SocketCAN, a vendor adapter, or an
//! in-memory bus in tests) can be plugged in.

use core::time::Duration;

use snafu::Snafu;

use crate::messages::CanMessage;

/// Error produced by transport operations
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum TransportError {
    /// The bus is not connected
    #[snafu(display("Not connected to CAN bus"))]
    NotConnected,
    /// The interface rejected the frame
    #[snafu(display("CAN send failed: {message}"))]
    SendFailed {
        /// Interface specific error text
        message: String,
    },
}

/// Error produced by [CanReceiver::recv]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// No frame arrived within the timeout
    Timeout,
    /// The transport was shut down
    Disconnected,
}

/// Sending half of a CAN transport
pub trait CanSender: Send {
    /// Send a single frame to the bus
    fn send(&mut self, msg: CanMessage) -> Result<(), TransportError>;
}

/// Receiving half of a CAN transport
pub trait CanReceiver: Send {
    /// Block until a frame arrives or the timeout expires
    fn recv(&mut self, timeout: Duration) -> Result<CanMessage, RecvError>;

    /// Return a frame if one is already queued
    fn try_recv(&mut self) -> Option<CanMessage>;
}

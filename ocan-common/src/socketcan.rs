//! Blocking SocketCAN transport

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket};

use crate::messages::{CanId, CanMessage};
use crate::traits::{CanReceiver, CanSender, RecvError, TransportError};

fn to_socketcan_id(id: CanId) -> socketcan::CanId {
    match id {
        CanId::Extended(id) => socketcan::ExtendedId::new(id)
            .expect("extended ID out of range")
            .into(),
        CanId::Std(id) => socketcan::StandardId::new(id)
            .expect("standard ID out of range")
            .into(),
    }
}

fn from_socketcan_id(id: socketcan::CanId) -> CanId {
    match id {
        socketcan::CanId::Standard(id) => CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => CanId::extended(id.as_raw()),
    }
}

fn to_socketcan_frame(msg: CanMessage) -> CanFrame {
    let id = to_socketcan_id(msg.id());
    if msg.is_rtr() {
        CanFrame::new_remote(id, 0).expect("failed building RTR frame")
    } else {
        CanFrame::new(id, msg.data()).expect("failed building data frame")
    }
}

fn from_socketcan_frame(frame: CanFrame) -> Option<CanMessage> {
    match frame {
        CanFrame::Data(frame) => Some(CanMessage::new(
            from_socketcan_id(frame.can_id()),
            frame.data(),
        )),
        CanFrame::Remote(frame) => Some(CanMessage::new_rtr(from_socketcan_id(frame.can_id()))),
        CanFrame::Error(_) => None,
    }
}

/// Sending half of a shared SocketCAN socket
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<CanSocket>,
}

impl CanSender for SocketCanSender {
    fn send(&mut self, msg: CanMessage) -> Result<(), TransportError> {
        self.socket
            .write_frame(&to_socketcan_frame(msg))
            .map_err(|e| TransportError::SendFailed {
                message: e.to_string(),
            })
    }
}

/// Receiving half of a shared SocketCAN socket
#[derive(Debug)]
pub struct SocketCanReceiver {
    socket: Arc<CanSocket>,
}

impl CanReceiver for SocketCanReceiver {
    fn recv(&mut self, timeout: Duration) -> Result<CanMessage, RecvError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(RecvError::Timeout);
            }
            match self.socket.read_frame_timeout(remaining) {
                // Error frames are skipped
                Ok(frame) => {
                    if let Some(msg) = from_socketcan_frame(frame) {
                        return Ok(msg);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Err(RecvError::Timeout)
                }
                Err(_) => return Err(RecvError::Disconnected),
            }
        }
    }

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.socket
            .read_frame_timeout(Duration::ZERO)
            .ok()
            .and_then(from_socketcan_frame)
    }
}

/// Open a SocketCAN device and split it into a sender and a receiver
///
/// Both halves share one socket, so frames sent through the sender are not
/// looped back to the receiver.
///
/// # Arguments
/// * `device` - The interface name, e.g. "can0" or "vcan0"
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
) -> Result<(SocketCanSender, SocketCanReceiver), TransportError> {
    let socket = CanSocket::open(device.as_ref()).map_err(|e| TransportError::SendFailed {
        message: format!("failed to open {}: {e}", device.as_ref()),
    })?;
    let socket = Arc::new(socket);
    Ok((
        SocketCanSender {
            socket: socket.clone(),
        },
        SocketCanReceiver { socket },
    ))
}

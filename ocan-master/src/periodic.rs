//! Periodic frame transmission

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use ocan_common::CanMessage;

use crate::network::NetworkHandle;

struct TaskState {
    msg: CanMessage,
    stop: bool,
}

struct TaskShared {
    state: Mutex<TaskState>,
    wakeup: Condvar,
}

/// Handle to a frame transmitted periodically on a dedicated thread
///
/// Created through [NetworkHandle::send_periodic]. Transmission continues
/// until [stop](PeriodicTask::stop) is called or the handle is dropped;
/// `stop()` is synchronous and guarantees no further frames are sent after
/// it returns.
pub struct PeriodicTask {
    shared: Arc<TaskShared>,
    thread: Option<JoinHandle<()>>,
}

impl core::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeriodicTask").finish()
    }
}

impl PeriodicTask {
    pub(crate) fn new(network: NetworkHandle, msg: CanMessage, period: Duration) -> Self {
        let shared = Arc::new(TaskShared {
            state: Mutex::new(TaskState { msg, stop: false }),
            wakeup: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::spawn(move || {
            let mut state = thread_shared.state.lock().unwrap();
            loop {
                if state.stop {
                    break;
                }
                let msg = state.msg;
                // Send without holding the state lock so update() never
                // waits on the transport
                drop(state);
                if let Err(e) = network.send_message(msg) {
                    log::warn!("Periodic transmit failed: {e}");
                }
                state = thread_shared.state.lock().unwrap();
                let (guard, _) = thread_shared
                    .wakeup
                    .wait_timeout_while(state, period, |s| !s.stop)
                    .unwrap();
                state = guard;
            }
        });
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Replace the transmitted payload, keeping the period
    pub fn update(&self, data: &[u8]) {
        let mut state = self.shared.state.lock().unwrap();
        let id = state.msg.id();
        state.msg = CanMessage::new(id, data);
    }

    /// Stop the transmission
    ///
    /// Blocks until the transmit thread has exited; no frame is sent after
    /// this returns.
    pub fn stop(&mut self) {
        self.shared.state.lock().unwrap().stop = true;
        self.shared.wakeup.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

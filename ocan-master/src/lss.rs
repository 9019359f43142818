//! LSS master
//!
//! Switches slaves between waiting and configuration state, assigns node
//! IDs and bit timings, reads identities, and locates unconfigured slaves
//! with the fastscan binary search.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use snafu::Snafu;

use ocan_common::constants::LSS_RESP_ID;
use ocan_common::lss::{
    LssCommandSpecifier, LssIdentity, LssRequest, LssResponse, LssState, LSS_FASTSCAN_CONFIRM,
};
use ocan_common::traits::TransportError;

use crate::network::{NetworkHandle, Subscription};

/// Time to wait for the response to a configuration command
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Time to wait for slave answers after each fastscan probe
const FASTSCAN_TIMEOUT: Duration = Duration::from_millis(100);

/// Retries for commands which expect a response
const MAX_RETRIES: u32 = 3;

/// Error produced by LSS operations
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum LssError {
    /// No response arrived before the deadline
    #[snafu(display("Timed out waiting for LSS response"))]
    Timeout,
    /// Fastscan found no unconfigured slave
    #[snafu(display("No unconfigured LSS slave found"))]
    NoSlaveFound,
    /// A slave answered with an unexpected command specifier
    #[snafu(display("Unexpected LSS response 0x{command:02X}"))]
    UnexpectedResponse {
        /// The offending command byte
        command: u8,
    },
    /// The slave rejected a ConfigureNodeId command
    #[snafu(display(
        "LSS slave rejected node ID configuration (error {error}, spec error {spec_error})"
    ))]
    NodeIdConfig {
        /// 1 for an inadmissible node ID, 0xFF for a vendor error
        error: u8,
        /// Vendor specific error code, valid when `error` is 0xFF
        spec_error: u8,
    },
    /// The slave rejected a ConfigureBitTiming command
    #[snafu(display(
        "LSS slave rejected bit timing configuration (error {error}, spec error {spec_error})"
    ))]
    BitTimingConfig {
        /// 1 for an unsupported bit timing, 0xFF for a vendor error
        error: u8,
        /// Vendor specific error code, valid when `error` is 0xFF
        spec_error: u8,
    },
    /// The slave rejected a StoreConfiguration command
    #[snafu(display(
        "LSS slave failed to store its configuration (error {error}, spec error {spec_error})"
    ))]
    StoreConfig {
        /// 1 when storing is unsupported, 2 on an access problem, 0xFF for
        /// a vendor error
        error: u8,
        /// Vendor specific error code, valid when `error` is 0xFF
        spec_error: u8,
    },
    /// Sending a request failed
    #[snafu(display("{source}"))]
    Transport {
        /// The underlying transport error
        source: TransportError,
    },
}

type Result<T> = std::result::Result<T, LssError>;

/// The master side of the Layer Setting Services
pub struct LssMaster {
    network: NetworkHandle,
    responses: Mutex<Receiver<[u8; 8]>>,
    _subscription: Subscription,
    mode: Mutex<LssState>,
}

impl core::fmt::Debug for LssMaster {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LssMaster").finish()
    }
}

impl LssMaster {
    pub(crate) fn new(network: NetworkHandle) -> Self {
        let (tx, rx): (SyncSender<[u8; 8]>, Receiver<[u8; 8]>) = sync_channel(16);
        let subscription = network.subscribe(
            LSS_RESP_ID,
            Arc::new(move |_cob_id, data, _timestamp| {
                if data.len() < 8 {
                    return;
                }
                let frame: [u8; 8] = data[0..8].try_into().unwrap();
                if tx.try_send(frame).is_err() {
                    log::warn!("Dropped LSS response due to overflow");
                }
            }),
        );
        Self {
            network,
            responses: Mutex::new(rx),
            _subscription: subscription,
            mode: Mutex::new(LssState::Waiting),
        }
    }

    fn send_request(&self, request: LssRequest) -> Result<()> {
        self.network
            .send_message(request.to_can_message())
            .map_err(|source| LssError::Transport { source })
    }

    /// Send a request and wait for a parseable response
    fn request_response(&self, request: LssRequest, timeout: Duration) -> Result<LssResponse> {
        let responses = self.responses.lock().unwrap();
        while responses.try_recv().is_ok() {}
        let mut attempts = MAX_RETRIES;
        loop {
            self.send_request(request)?;
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match responses.recv_timeout(remaining) {
                    Ok(frame) => match LssResponse::try_from(&frame[..]) {
                        Ok(response) => return Ok(response),
                        // Not an LSS response we understand; keep waiting
                        Err(_) => continue,
                    },
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(LssError::Transport {
                            source: TransportError::NotConnected,
                        })
                    }
                }
            }
            attempts -= 1;
            if attempts == 0 {
                return Err(LssError::Timeout);
            }
            log::warn!("No LSS response received, retrying");
        }
    }

    /// Switch every slave on the bus to the given state
    ///
    /// No response is defined for this command.
    pub fn send_switch_state_global(&self, state: LssState) -> Result<()> {
        self.send_request(LssRequest::SwitchModeGlobal { mode: state as u8 })?;
        *self.mode.lock().unwrap() = state;
        Ok(())
    }

    /// Switch exactly one slave, selected by its full identity, to
    /// configuration state
    pub fn send_switch_state_selective(&self, identity: &LssIdentity) -> Result<()> {
        self.send_request(LssRequest::SwitchStateVendor {
            vendor_id: identity.vendor_id,
        })?;
        self.send_request(LssRequest::SwitchStateProduct {
            product_code: identity.product_code,
        })?;
        self.send_request(LssRequest::SwitchStateRevision {
            revision: identity.revision,
        })?;
        match self.request_response(
            LssRequest::SwitchStateSerial {
                serial: identity.serial,
            },
            RESPONSE_TIMEOUT,
        )? {
            LssResponse::SwitchStateResponse => {
                *self.mode.lock().unwrap() = LssState::Configuration;
                Ok(())
            }
            other => Err(LssError::UnexpectedResponse {
                command: other.to_bytes()[0],
            }),
        }
    }

    fn ensure_configuration_mode(&self) -> Result<()> {
        if *self.mode.lock().unwrap() != LssState::Configuration {
            self.send_switch_state_global(LssState::Configuration)?;
        }
        Ok(())
    }

    /// Set the node ID of the slave in configuration state
    pub fn configure_node_id(&self, node_id: u8) -> Result<()> {
        self.ensure_configuration_mode()?;
        match self.request_response(LssRequest::ConfigureNodeId { node_id }, RESPONSE_TIMEOUT)? {
            LssResponse::ConfigureNodeIdAck { error: 0, .. } => Ok(()),
            LssResponse::ConfigureNodeIdAck { error, spec_error } => {
                Err(LssError::NodeIdConfig { error, spec_error })
            }
            other => Err(LssError::UnexpectedResponse {
                command: other.to_bytes()[0],
            }),
        }
    }

    /// Set the bit timing of the slave in configuration state
    ///
    /// # Arguments
    /// * `table` - Bit timing table selector; 0 is the standard CiA table
    /// * `index` - Index into the table (0: 1M ... 8: 10k bit/s)
    pub fn configure_bit_timing(&self, table: u8, index: u8) -> Result<()> {
        self.ensure_configuration_mode()?;
        match self
            .request_response(LssRequest::ConfigureBitTiming { table, index }, RESPONSE_TIMEOUT)?
        {
            LssResponse::ConfigureBitTimingAck { error: 0, .. } => Ok(()),
            LssResponse::ConfigureBitTimingAck { error, spec_error } => {
                Err(LssError::BitTimingConfig { error, spec_error })
            }
            other => Err(LssError::UnexpectedResponse {
                command: other.to_bytes()[0],
            }),
        }
    }

    /// Make the slave in configuration state persist its node ID and bit
    /// timing
    pub fn store_configuration(&self) -> Result<()> {
        match self.request_response(LssRequest::StoreConfiguration, RESPONSE_TIMEOUT)? {
            LssResponse::StoreConfigurationAck { error: 0, .. } => Ok(()),
            LssResponse::StoreConfigurationAck { error, spec_error } => {
                Err(LssError::StoreConfig { error, spec_error })
            }
            other => Err(LssError::UnexpectedResponse {
                command: other.to_bytes()[0],
            }),
        }
    }

    /// Read the node ID of the slave in configuration state
    pub fn inquire_node_id(&self) -> Result<u8> {
        self.ensure_configuration_mode()?;
        match self.request_response(
            LssRequest::Inquire {
                cs: LssCommandSpecifier::InquireNodeId,
            },
            RESPONSE_TIMEOUT,
        )? {
            LssResponse::InquireNodeIdReply { node_id } => Ok(node_id),
            other => Err(LssError::UnexpectedResponse {
                command: other.to_bytes()[0],
            }),
        }
    }

    /// Read the vendor ID of the slave in configuration state
    pub fn inquire_vendor_id(&self) -> Result<u32> {
        self.inquire(LssCommandSpecifier::InquireVendor)
    }

    /// Read the product code of the slave in configuration state
    pub fn inquire_product_code(&self) -> Result<u32> {
        self.inquire(LssCommandSpecifier::InquireProduct)
    }

    /// Read the revision number of the slave in configuration state
    pub fn inquire_revision(&self) -> Result<u32> {
        self.inquire(LssCommandSpecifier::InquireRevision)
    }

    /// Read the serial number of the slave in configuration state
    pub fn inquire_serial(&self) -> Result<u32> {
        self.inquire(LssCommandSpecifier::InquireSerial)
    }

    fn inquire(&self, cs: LssCommandSpecifier) -> Result<u32> {
        match self.request_response(LssRequest::Inquire { cs }, RESPONSE_TIMEOUT)? {
            LssResponse::InquireReply { cs: reply_cs, value } if reply_cs == cs => Ok(value),
            other => Err(LssError::UnexpectedResponse {
                command: other.to_bytes()[0],
            }),
        }
    }

    /// Send one fastscan probe and report whether any slave answered
    ///
    /// Unlike the configuration commands this always waits the full
    /// timeout, since any number of slaves may respond.
    fn fastscan_probe(
        &self,
        id: u32,
        bit_check: u8,
        sub: u8,
        next: u8,
        timeout: Duration,
    ) -> Result<bool> {
        let responses = self.responses.lock().unwrap();
        while responses.try_recv().is_ok() {}
        self.send_request(LssRequest::FastScan {
            id,
            bit_check,
            sub,
            next,
        })?;
        let deadline = Instant::now() + timeout;
        let mut answered = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match responses.recv_timeout(remaining) {
                Ok(frame) => {
                    if let Ok(LssResponse::IdentifySlave) = LssResponse::try_from(&frame[..]) {
                        answered = true;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LssError::Transport {
                        source: TransportError::NotConnected,
                    })
                }
            }
        }
        Ok(answered)
    }

    /// Locate one unconfigured slave by binary search over the identity
    /// space
    ///
    /// Every slave in waiting state without a configured node ID takes
    /// part. Each probe fixes one bit of one identity word; a confirm
    /// probe closes each word. The found slave is left in configuration
    /// state, so it can be assigned a node ID directly afterwards.
    pub fn fast_scan(&self) -> Result<LssIdentity> {
        self.fast_scan_with_timeout(FASTSCAN_TIMEOUT)
    }

    /// [fast_scan](LssMaster::fast_scan) with an explicit per-probe timeout
    ///
    /// The default suits a loaded bus; on a quiet one a few milliseconds
    /// are enough and make the 130-odd probes considerably faster.
    pub fn fast_scan_with_timeout(&self, probe_timeout: Duration) -> Result<LssIdentity> {
        // The initial probe resets the slave state machines and tells us
        // whether there is anything to find
        if !self.fastscan_probe(0, LSS_FASTSCAN_CONFIRM, 0, 0, probe_timeout)? {
            return Err(LssError::NoSlaveFound);
        }
        let mut id = [0u32; 4];
        for sub in 0..4u8 {
            for bit in (0..32).rev() {
                if !self.fastscan_probe(id[sub as usize], bit, sub, sub, probe_timeout)? {
                    id[sub as usize] |= 1 << bit;
                }
            }
            // Confirm the completed word; the matching slave moves on to
            // the next one
            let next = (sub + 1) % 4;
            if !self.fastscan_probe(id[sub as usize], 0, sub, next, probe_timeout)? {
                return Err(LssError::NoSlaveFound);
            }
        }
        *self.mode.lock().unwrap() = LssState::Configuration;
        let identity = LssIdentity {
            vendor_id: id[0],
            product_code: id[1],
            revision: id[2],
            serial: id[3],
        };
        log::info!("Fastscan selected {identity}");
        Ok(identity)
    }
}

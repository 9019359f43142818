//! PDO engine
//!
//! Each node owns two collections of [PdoMap]s: `tpdo` for frames the node
//! produces and `rpdo` for frames the host sends to it. A map's
//! configuration mirrors the node's communication (0x1400/0x1800 + k) and
//! mapping (0x1600/0x1A00 + k) parameter records, read and written over
//! SDO. Mapped variables are packed LSB-first into the up to 8 byte
//! payload.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use snafu::Snafu;

use ocan_common::constants::{
    object_ids, PDO_NOT_VALID, PDO_RTR_NOT_ALLOWED, RPDO_BASES, SYNC_ID, TPDO_BASES,
};
use ocan_common::objects::{DataType, Value};
use ocan_common::od::{ODVariable, ObjectDictionary, ObjectDictionaryError};
use ocan_common::traits::TransportError;

use crate::network::{NetworkHandle, Subscription};
use crate::periodic::PeriodicTask;
use crate::sdo::{SdoClient, SdoClientError};

/// Error produced by PDO operations
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum PdoError {
    /// The mapped variables would not fit in one frame
    #[snafu(display("Total mapped size would exceed 64 bits"))]
    MapTooLong,
    /// The dictionary forbids mapping this variable
    #[snafu(display("Object 0x{index:04X}sub{sub} is not PDO mappable"))]
    NotMappable {
        /// Index of the rejected variable
        index: u16,
        /// Subindex of the rejected variable
        sub: u8,
    },
    /// The map has no COB-ID to transmit or subscribe on
    #[snafu(display("PDO has no COB-ID configured"))]
    NotConfigured,
    /// Periodic transmission was started without a known period
    #[snafu(display("No transmission period available"))]
    NoPeriod,
    /// An SDO transfer of a configuration parameter failed
    #[snafu(display("{source}"))]
    Sdo {
        /// The underlying SDO error
        source: SdoClientError,
    },
    /// A dictionary lookup failed
    #[snafu(display("{source}"))]
    Dictionary {
        /// The underlying dictionary error
        source: ObjectDictionaryError,
    },
    /// Sending a frame failed
    #[snafu(display("{source}"))]
    Transport {
        /// The underlying transport error
        source: TransportError,
    },
}

impl From<SdoClientError> for PdoError {
    fn from(source: SdoClientError) -> Self {
        PdoError::Sdo { source }
    }
}

impl From<ObjectDictionaryError> for PdoError {
    fn from(source: ObjectDictionaryError) -> Self {
        PdoError::Dictionary { source }
    }
}

impl From<TransportError> for PdoError {
    fn from(source: TransportError) -> Self {
        PdoError::Transport { source }
    }
}

type Result<T> = std::result::Result<T, PdoError>;

/// Direction of a PDO map collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoKind {
    /// Transmit PDOs: frames the node produces, consumed by the host
    Tx,
    /// Receive PDOs: frames the host produces for the node
    Rx,
}

/// Extract `length` bits starting at bit `offset`, LSB of byte 0 first
pub(crate) fn extract_bits(data: &[u8], offset: usize, length: usize) -> u64 {
    let mut value = 0u64;
    for i in 0..length {
        let bit = offset + i;
        let byte = bit / 8;
        if byte >= data.len() {
            break;
        }
        if data[byte] & (1 << (bit % 8)) != 0 {
            value |= 1 << i;
        }
    }
    value
}

/// Insert the low `length` bits of `value` starting at bit `offset`
pub(crate) fn insert_bits(data: &mut [u8], offset: usize, length: usize, value: u64) {
    for i in 0..length {
        let bit = offset + i;
        let byte = bit / 8;
        if byte >= data.len() {
            break;
        }
        if value & (1 << i) != 0 {
            data[byte] |= 1 << (bit % 8);
        } else {
            data[byte] &= !(1 << (bit % 8));
        }
    }
}

/// One variable mapped into a PDO
#[derive(Debug, Clone)]
pub struct MappedVariable {
    /// The dictionary declaration of the variable
    pub od: Arc<ODVariable>,
    /// Position of the first bit within the frame
    pub offset: usize,
    /// Number of mapped bits
    pub length: usize,
}

#[derive(Debug, Default)]
struct MapInner {
    enabled: bool,
    cob_id: Option<u32>,
    rtr_allowed: bool,
    trans_type: Option<u8>,
    /// Inhibit time in multiples of 100 us
    inhibit_time: Option<u16>,
    /// Event timer in ms
    event_timer: Option<u16>,
    sync_start: Option<u8>,
    entries: Vec<MappedVariable>,
    bit_length: usize,
    data: Vec<u8>,
    timestamp: Option<Instant>,
    period: Option<Duration>,
    received: u64,
    dirty: bool,
    sync_counter: u16,
    last_transmit: Option<Instant>,
}

impl MapInner {
    fn resize_data(&mut self) {
        self.data = vec![0; self.bit_length.div_ceil(8)];
    }
}

type MapCallback = Box<dyn Fn(&PdoMap) + Send + Sync>;

/// One PDO message with up to 8 bytes of mapped variables
pub struct PdoMap {
    kind: PdoKind,
    /// Map number within its collection, starting at 1
    pub number: u8,
    node_id: u8,
    com_index: u16,
    map_index: u16,
    predefined_cob_id: Option<u32>,
    network: NetworkHandle,
    sdo: Arc<SdoClient>,
    od: Arc<ObjectDictionary>,
    inner: Mutex<MapInner>,
    received_cond: Condvar,
    callbacks: Mutex<Vec<MapCallback>>,
    subscription: Mutex<Option<Subscription>>,
    sync_subscription: Mutex<Option<Subscription>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl core::fmt::Debug for PdoMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PdoMap")
            .field("kind", &self.kind)
            .field("number", &self.number)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl PdoMap {
    fn new(
        kind: PdoKind,
        number: u8,
        node_id: u8,
        network: NetworkHandle,
        sdo: Arc<SdoClient>,
        od: Arc<ObjectDictionary>,
    ) -> Arc<Self> {
        let slot = (number - 1) as u16;
        let (com_base, map_base) = match kind {
            PdoKind::Tx => (object_ids::TPDO_COM_BASE, object_ids::TPDO_MAP_BASE),
            PdoKind::Rx => (object_ids::RPDO_COM_BASE, object_ids::RPDO_MAP_BASE),
        };
        let predefined_cob_id = match kind {
            PdoKind::Tx => TPDO_BASES.get(slot as usize),
            PdoKind::Rx => RPDO_BASES.get(slot as usize),
        }
        .map(|base| base + node_id as u32);
        Arc::new(Self {
            kind,
            number,
            node_id,
            com_index: com_base + slot,
            map_index: map_base + slot,
            predefined_cob_id,
            network,
            sdo,
            od,
            inner: Mutex::new(MapInner {
                rtr_allowed: true,
                ..MapInner::default()
            }),
            received_cond: Condvar::new(),
            callbacks: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            sync_subscription: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// A short descriptive name like "TPDO1_node5"
    pub fn name(&self) -> String {
        let direction = match self.kind {
            PdoKind::Tx => "TPDO",
            PdoKind::Rx => "RPDO",
        };
        format!("{direction}{}_node{}", self.number, self.node_id)
    }

    /// The configured COB-ID, falling back to the predefined connection set
    pub fn cob_id(&self) -> Option<u32> {
        self.inner.lock().unwrap().cob_id.or(self.predefined_cob_id)
    }

    /// Whether the PDO is enabled (COB-ID valid bit clear)
    pub fn enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// Enable or disable the PDO; takes effect on the node after
    /// [save](PdoMap::save)
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.lock().unwrap().enabled = enabled;
    }

    /// Set the COB-ID used by this PDO
    pub fn set_cob_id(&self, cob_id: u32) {
        self.inner.lock().unwrap().cob_id = Some(cob_id);
    }

    /// The transmission type (0-255)
    pub fn trans_type(&self) -> Option<u8> {
        self.inner.lock().unwrap().trans_type
    }

    /// Set the transmission type (0-255)
    pub fn set_trans_type(&self, trans_type: u8) {
        self.inner.lock().unwrap().trans_type = Some(trans_type);
    }

    /// The inhibit time in multiples of 100 us
    pub fn inhibit_time(&self) -> Option<u16> {
        self.inner.lock().unwrap().inhibit_time
    }

    /// Set the inhibit time in multiples of 100 us
    pub fn set_inhibit_time(&self, inhibit: u16) {
        self.inner.lock().unwrap().inhibit_time = Some(inhibit);
    }

    /// The event timer in ms
    pub fn event_timer(&self) -> Option<u16> {
        self.inner.lock().unwrap().event_timer
    }

    /// Set the event timer in ms
    pub fn set_event_timer(&self, event_timer: u16) {
        self.inner.lock().unwrap().event_timer = Some(event_timer);
    }

    /// The SYNC start value
    pub fn sync_start(&self) -> Option<u8> {
        self.inner.lock().unwrap().sync_start
    }

    /// Snapshot of the current frame payload
    pub fn data(&self) -> Vec<u8> {
        self.inner.lock().unwrap().data.clone()
    }

    /// Timestamp of the most recently received frame
    pub fn timestamp(&self) -> Option<Instant> {
        self.inner.lock().unwrap().timestamp
    }

    /// The variables currently mapped, in frame order
    pub fn mapped(&self) -> Vec<MappedVariable> {
        self.inner.lock().unwrap().entries.clone()
    }

    fn read_u8(&self, index: u16, sub: u8) -> Result<u8> {
        let data = self.sdo.upload(index, sub)?;
        Ok(data.first().copied().unwrap_or(0))
    }

    fn read_u16(&self, index: u16, sub: u8) -> Result<u16> {
        let data = self.sdo.upload(index, sub)?;
        let mut buf = [0u8; 2];
        let n = data.len().min(2);
        buf[0..n].copy_from_slice(&data[0..n]);
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, index: u16, sub: u8) -> Result<u32> {
        let data = self.sdo.upload(index, sub)?;
        let mut buf = [0u8; 4];
        let n = data.len().min(4);
        buf[0..n].copy_from_slice(&data[0..n]);
        Ok(u32::from_le_bytes(buf))
    }

    /// Read this map's configuration from the node
    pub fn read(self: &Arc<Self>) -> Result<()> {
        let cob_word = self.read_u32(self.com_index, 1)?;
        let trans_type = self.read_u8(self.com_index, 2)?;
        let mut inhibit_time = None;
        let mut event_timer = None;
        let mut sync_start = None;
        if trans_type >= 254 {
            // Optional parameters; many devices do not implement them
            match self.read_u16(self.com_index, 3) {
                Ok(v) => inhibit_time = Some(v),
                Err(e) => log::info!("Could not read inhibit time ({e})"),
            }
            match self.read_u16(self.com_index, 5) {
                Ok(v) => event_timer = Some(v),
                Err(e) => log::info!("Could not read event timer ({e})"),
            }
            match self.read_u8(self.com_index, 6) {
                Ok(v) => sync_start = Some(v),
                Err(e) => log::info!("Could not read SYNC start value ({e})"),
            }
        }

        let count = self.read_u8(self.map_index, 0)?;
        let mut mappings = Vec::new();
        for sub in 1..=count {
            let word = self.read_u32(self.map_index, sub)?;
            let index = (word >> 16) as u16;
            let subindex = (word >> 8) as u8;
            let bits = (word & 0xFF) as usize;
            if index != 0 && bits != 0 {
                mappings.push((index, subindex, bits));
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.cob_id = Some(cob_word & 0x1FFF_FFFF);
            inner.enabled = cob_word & PDO_NOT_VALID == 0;
            inner.rtr_allowed = cob_word & PDO_RTR_NOT_ALLOWED == 0;
            inner.trans_type = Some(trans_type);
            inner.inhibit_time = inhibit_time;
            inner.event_timer = event_timer;
            inner.sync_start = sync_start;
            inner.entries.clear();
            inner.bit_length = 0;
            log::info!(
                "{}: COB-ID 0x{:X}, {}",
                self.name(),
                cob_word & 0x1FFF_FFFF,
                if inner.enabled { "enabled" } else { "disabled" }
            );
        }
        for (index, subindex, bits) in mappings {
            self.add_mapping_sized(index, subindex, bits)?;
        }
        self.subscribe()?;
        Ok(())
    }

    /// Write this map's configuration to the node
    ///
    /// The PDO is disabled while its mapping is rewritten and re-enabled
    /// afterwards when marked enabled. The node should be in
    /// PRE-OPERATIONAL state for mapping changes.
    pub fn save(self: &Arc<Self>) -> Result<()> {
        let (cob_id, enabled, rtr_allowed, trans_type, inhibit, event, sync_start, entries) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.cob_id.or(self.predefined_cob_id),
                inner.enabled,
                inner.rtr_allowed,
                inner.trans_type,
                inner.inhibit_time,
                inner.event_timer,
                inner.sync_start,
                inner.entries.clone(),
            )
        };
        let cob_id = cob_id.ok_or(PdoError::NotConfigured)?;
        let rtr_flag = if rtr_allowed { 0 } else { PDO_RTR_NOT_ALLOWED };

        log::info!("{}: disabling for reconfiguration", self.name());
        self.write_u32(self.com_index, 1, cob_id | PDO_NOT_VALID | rtr_flag)?;
        if let Some(trans_type) = trans_type {
            self.write_u8(self.com_index, 2, trans_type)?;
        }
        if let Some(inhibit) = inhibit {
            self.write_u16(self.com_index, 3, inhibit)?;
        }
        if let Some(event) = event {
            self.write_u16(self.com_index, 5, event)?;
        }
        if let Some(sync_start) = sync_start {
            self.write_u8(self.com_index, 6, sync_start)?;
        }

        self.write_u8(self.map_index, 0, 0)?;
        for (i, entry) in entries.iter().enumerate() {
            let word = ((entry.od.index as u32) << 16)
                | ((entry.od.subindex as u32) << 8)
                | entry.length as u32;
            log::info!(
                "{}: mapping {} (0x{:04X}sub{}, {} bits)",
                self.name(),
                entry.od.name,
                entry.od.index,
                entry.od.subindex,
                entry.length
            );
            self.write_u32(self.map_index, i as u8 + 1, word)?;
        }
        self.write_u8(self.map_index, 0, entries.len() as u8)?;

        if enabled {
            self.write_u32(self.com_index, 1, cob_id | rtr_flag)?;
            self.subscribe()?;
        }
        Ok(())
    }

    fn write_u8(&self, index: u16, sub: u8, value: u8) -> Result<()> {
        Ok(self.sdo.download(index, sub, &[value], false)?)
    }

    fn write_u16(&self, index: u16, sub: u8, value: u16) -> Result<()> {
        Ok(self.sdo.download(index, sub, &value.to_le_bytes(), false)?)
    }

    fn write_u32(&self, index: u16, sub: u8, value: u32) -> Result<()> {
        Ok(self.sdo.download(index, sub, &value.to_le_bytes(), false)?)
    }

    /// Remove all mapped variables
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.bit_length = 0;
        inner.resize_data();
    }

    /// Map a variable as the next entry, using its declared bit length
    pub fn add_variable(self: &Arc<Self>, index: u16, sub: u8) -> Result<()> {
        let bits = self.od.variable(index, sub)?.bit_length();
        self.add_mapping_sized(index, sub, bits)
    }

    /// Map a variable by plain or dotted name
    pub fn add_variable_by_name(self: &Arc<Self>, name: &str) -> Result<()> {
        let var = self.od.variable_by_name(name)?;
        self.add_mapping_sized(var.index, var.subindex, var.bit_length())
    }

    /// Map a variable with an explicit bit length
    pub fn add_mapping_sized(self: &Arc<Self>, index: u16, sub: u8, bits: usize) -> Result<()> {
        let od_var = self.od.variable(index, sub)?;
        if !od_var.pdo_mappable {
            return Err(PdoError::NotMappable { index, sub });
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.bit_length + bits > 64 {
            return Err(PdoError::MapTooLong);
        }
        let offset = inner.bit_length;
        inner.entries.push(MappedVariable {
            od: od_var,
            offset,
            length: bits,
        });
        inner.bit_length += bits;
        inner.resize_data();
        Ok(())
    }

    /// Register for reception and SYNC triggering on the network
    ///
    /// Called automatically by [read](PdoMap::read) and [save](PdoMap::save);
    /// call it directly when the local configuration is already known to
    /// match the node.
    pub fn subscribe(self: &Arc<Self>) -> Result<()> {
        let cob_id = self.cob_id().ok_or(PdoError::NotConfigured)?;
        let (enabled, trans_type) = {
            let inner = self.inner.lock().unwrap();
            (inner.enabled, inner.trans_type)
        };
        if !enabled {
            return Ok(());
        }

        if self.kind == PdoKind::Tx {
            let mut subscription = self.subscription.lock().unwrap();
            if let Some(old) = subscription.take() {
                self.network.unsubscribe(&old);
            }
            let weak = Arc::downgrade(self);
            log::info!("Subscribing to enabled PDO 0x{cob_id:X}");
            *subscription = Some(self.network.subscribe(
                cob_id,
                Arc::new(move |_cob_id, data, timestamp| {
                    if let Some(map) = weak.upgrade() {
                        map.on_frame(data, timestamp);
                    }
                }),
            ));
        } else if trans_type.map_or(false, |t| t <= 240) {
            // Outbound synchronous map: transmit on observed SYNC
            let mut sync_subscription = self.sync_subscription.lock().unwrap();
            if let Some(old) = sync_subscription.take() {
                self.network.unsubscribe(&old);
            }
            let weak = Arc::downgrade(self);
            *sync_subscription = Some(self.network.subscribe(
                SYNC_ID,
                Arc::new(move |_cob_id, data, _timestamp| {
                    if let Some(map) = weak.upgrade() {
                        map.on_sync(data.first().copied());
                    }
                }),
            ));
        }
        Ok(())
    }

    /// Handle one received frame (TPDO direction)
    fn on_frame(&self, data: &[u8], timestamp: Instant) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.data = data.to_vec();
            if let Some(previous) = inner.timestamp {
                inner.period = Some(timestamp.saturating_duration_since(previous));
            }
            inner.timestamp = Some(timestamp);
            inner.received += 1;
            self.received_cond.notify_all();
        }
        for callback in self.callbacks.lock().unwrap().iter() {
            callback(self);
        }
    }

    /// Handle an observed SYNC (RPDO direction, synchronous types)
    fn on_sync(&self, counter: Option<u8>) {
        let payload = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.enabled {
                return;
            }
            let trans_type = match inner.trans_type {
                Some(t) if t <= 240 => t,
                _ => return,
            };
            if let (Some(start), Some(counter)) = (inner.sync_start, counter) {
                if counter < start {
                    return;
                }
            }
            if trans_type == 0 {
                // Acyclic synchronous: only when the data changed
                if !inner.dirty {
                    return;
                }
            } else {
                inner.sync_counter += 1;
                if inner.sync_counter < trans_type as u16 {
                    return;
                }
                inner.sync_counter = 0;
            }
            if !self.inhibit_expired(&inner) {
                // Colliding events within the inhibit window are dropped
                return;
            }
            inner.dirty = false;
            inner.last_transmit = Some(Instant::now());
            inner.data.clone()
        };
        if let Some(cob_id) = self.cob_id() {
            if let Err(e) = self.network.send(cob_id, &payload) {
                log::warn!("{}: SYNC-triggered transmit failed: {e}", self.name());
            }
        }
    }

    fn inhibit_expired(&self, inner: &MapInner) -> bool {
        match (inner.inhibit_time, inner.last_transmit) {
            (Some(inhibit), Some(last)) => {
                last.elapsed() >= Duration::from_micros(inhibit as u64 * 100)
            }
            _ => true,
        }
    }

    /// Transmit the current payload once
    pub fn transmit(&self) -> Result<()> {
        let cob_id = self.cob_id().ok_or(PdoError::NotConfigured)?;
        let payload = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_transmit = Some(Instant::now());
            inner.dirty = false;
            inner.data.clone()
        };
        Ok(self.network.send(cob_id, &payload)?)
    }

    /// Start periodic transmission in a background thread
    ///
    /// Without an explicit period the previously used period or the
    /// configured event timer applies.
    pub fn start(&self, period: Option<Duration>) -> Result<()> {
        self.stop();
        let cob_id = self.cob_id().ok_or(PdoError::NotConfigured)?;
        let (payload, period) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(period) = period {
                inner.period = Some(period);
            }
            let period = inner
                .period
                .or(inner.event_timer.map(|ms| Duration::from_millis(ms as u64)))
                .ok_or(PdoError::NoPeriod)?;
            (inner.data.clone(), period)
        };
        log::info!("Starting {} with a period of {period:?}", self.name());
        *self.task.lock().unwrap() = Some(self.network.send_periodic(cob_id, &payload, period));
        Ok(())
    }

    /// Stop periodic transmission
    pub fn stop(&self) {
        if let Some(mut task) = self.task.lock().unwrap().take() {
            task.stop();
        }
    }

    /// Push the current payload into a running periodic transmission
    pub fn update(&self) {
        let payload = self.inner.lock().unwrap().data.clone();
        if let Some(task) = self.task.lock().unwrap().as_ref() {
            task.update(&payload);
        }
    }

    /// Request transmission of the PDO with a remote frame
    ///
    /// Silently does nothing when the map forbids RTR.
    pub fn remote_request(&self) -> Result<()> {
        let cob_id = self.cob_id().ok_or(PdoError::NotConfigured)?;
        let (enabled, rtr_allowed) = {
            let inner = self.inner.lock().unwrap();
            (inner.enabled, inner.rtr_allowed)
        };
        if enabled && rtr_allowed {
            self.network.send_rtr(cob_id)?;
        }
        Ok(())
    }

    /// Block until the next frame for this map arrives
    ///
    /// Returns the reception timestamp, or None on timeout. Only frames
    /// arriving after the call begins count.
    pub fn wait_for_reception(&self, timeout: Duration) -> Option<Instant> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        let observed = inner.received;
        while inner.received == observed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .received_cond
                .wait_timeout(inner, remaining)
                .unwrap();
            inner = guard;
        }
        inner.timestamp
    }

    /// Register a callback invoked on the receive thread for every frame
    ///
    /// Callbacks must be short and must not call back into blocking APIs.
    pub fn add_callback(&self, callback: MapCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Access a mapped variable by its position in the map
    pub fn variable(self: &Arc<Self>, position: usize) -> Option<PdoVariable> {
        let inner = self.inner.lock().unwrap();
        (position < inner.entries.len()).then(|| PdoVariable {
            map: self.clone(),
            position,
        })
    }

    /// Access a mapped variable by name
    ///
    /// Sub-objects of records and arrays also match their dotted
    /// `"Group.Variable"` form.
    pub fn variable_by_name(self: &Arc<Self>, name: &str) -> Option<PdoVariable> {
        let member = name.split_once('.').map(|(_, member)| member);
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .position(|entry| entry.od.name == name || Some(entry.od.name.as_str()) == member)
            .map(|position| PdoVariable {
                map: self.clone(),
                position,
            })
    }

    /// Release subscriptions and stop transmission
    pub(crate) fn detach(&self) {
        self.stop();
        if let Some(sub) = self.subscription.lock().unwrap().take() {
            self.network.unsubscribe(&sub);
        }
        if let Some(sub) = self.sync_subscription.lock().unwrap().take() {
            self.network.unsubscribe(&sub);
        }
    }
}

/// One variable mapped into a PDO, bound to its map
///
/// Values are read from and written into the map's payload buffer;
/// writing marks the map as changed so event and change triggered
/// transmissions fire.
#[derive(Debug, Clone)]
pub struct PdoVariable {
    map: Arc<PdoMap>,
    position: usize,
}

impl PdoVariable {
    /// The dictionary declaration of this variable
    pub fn od(&self) -> Arc<ODVariable> {
        self.map.inner.lock().unwrap().entries[self.position].od.clone()
    }

    /// Read the variable's bits from the current payload
    pub fn raw_bits(&self) -> u64 {
        let inner = self.map.inner.lock().unwrap();
        let entry = &inner.entries[self.position];
        extract_bits(&inner.data, entry.offset, entry.length)
    }

    /// Read the variable decoded to its declared type
    pub fn raw(&self) -> Value {
        let inner = self.map.inner.lock().unwrap();
        let entry = &inner.entries[self.position];
        let bits = extract_bits(&inner.data, entry.offset, entry.length);
        decode_mapped(entry.od.data_type, bits, entry.length)
    }

    /// Read the variable scaled to its physical representation
    pub fn phys(&self) -> std::result::Result<f64, ObjectDictionaryError> {
        let (od, raw) = {
            let inner = self.map.inner.lock().unwrap();
            let entry = &inner.entries[self.position];
            let bits = extract_bits(&inner.data, entry.offset, entry.length);
            (
                entry.od.clone(),
                decode_mapped(entry.od.data_type, bits, entry.length),
            )
        };
        od.decode_phys(&raw)
    }

    /// Write a typed value into the payload
    pub fn set_raw(&self, value: impl Into<Value>) {
        let value = value.into();
        {
            let mut inner = self.map.inner.lock().unwrap();
            let entry = &inner.entries[self.position];
            let bits = encode_mapped(entry.od.data_type, &value, entry.length);
            let (offset, length) = (entry.offset, entry.length);
            insert_bits(&mut inner.data, offset, length, bits);
            inner.dirty = true;
        }
        self.map.update();
    }

    /// Write a physical value, scaling it back to the raw representation
    pub fn set_phys(&self, phys: f64) -> std::result::Result<(), ObjectDictionaryError> {
        let od = self.od();
        let raw = od.encode_phys(phys)?;
        self.set_raw(raw);
        Ok(())
    }
}

/// Decode a bit pattern extracted from a payload to a typed value
fn decode_mapped(data_type: DataType, bits: u64, length: usize) -> Value {
    match data_type {
        DataType::Boolean => Value::Bool(bits != 0),
        DataType::Real32 => Value::Real(f32::from_bits(bits as u32) as f64),
        DataType::Real64 => Value::Real(f64::from_bits(bits)),
        t if t.is_signed() => {
            let value = if length < 64 && bits & (1 << (length - 1)) != 0 {
                (bits | !((1u64 << length) - 1)) as i64
            } else {
                bits as i64
            };
            Value::Integer(value)
        }
        _ => Value::Unsigned(bits),
    }
}

/// Encode a typed value to the bit pattern stored in a payload
fn encode_mapped(data_type: DataType, value: &Value, length: usize) -> u64 {
    let mask = if length >= 64 {
        u64::MAX
    } else {
        (1u64 << length) - 1
    };
    match (data_type, value) {
        (DataType::Real32, _) => {
            f32::to_bits(value.as_f64().unwrap_or(0.0) as f32) as u64
        }
        (DataType::Real64, _) => f64::to_bits(value.as_f64().unwrap_or(0.0)),
        (_, Value::Bool(b)) => *b as u64,
        (_, Value::Integer(v)) => (*v as u64) & mask,
        (_, Value::Unsigned(v)) => v & mask,
        _ => 0,
    }
}

/// A collection of transmit or receive maps for one node
#[derive(Debug)]
pub struct PdoMaps {
    maps: BTreeMap<u8, Arc<PdoMap>>,
}

impl PdoMaps {
    /// Build the collection from the communication parameter records
    /// present in the node's object dictionary
    pub(crate) fn new(
        kind: PdoKind,
        node_id: u8,
        network: NetworkHandle,
        sdo: Arc<SdoClient>,
        od: Arc<ObjectDictionary>,
    ) -> Self {
        let com_base = match kind {
            PdoKind::Tx => object_ids::TPDO_COM_BASE,
            PdoKind::Rx => object_ids::RPDO_COM_BASE,
        };
        let mut maps = BTreeMap::new();
        for slot in 0u16..512 {
            if od.contains(com_base + slot) {
                let number = (slot + 1) as u8;
                maps.insert(
                    number,
                    PdoMap::new(
                        kind,
                        number,
                        node_id,
                        network.clone(),
                        sdo.clone(),
                        od.clone(),
                    ),
                );
            }
        }
        Self { maps }
    }

    /// Get a map by its number (1-based)
    pub fn get(&self, number: u8) -> Option<&Arc<PdoMap>> {
        self.maps.get(&number)
    }

    /// Get a map by its COB-ID
    pub fn by_cob_id(&self, cob_id: u32) -> Option<&Arc<PdoMap>> {
        self.maps.values().find(|map| map.cob_id() == Some(cob_id))
    }

    /// Find a mapped variable by name across all maps
    pub fn variable(&self, name: &str) -> Option<PdoVariable> {
        self.maps
            .values()
            .find_map(|map| map.variable_by_name(name))
    }

    /// Iterate the maps in number order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PdoMap>> {
        self.maps.values()
    }

    /// Number of maps in the collection
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// True when the dictionary declares no maps of this kind
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Read the configuration of every map from the node
    pub fn read(&self) -> Result<()> {
        for map in self.maps.values() {
            map.read()?;
        }
        Ok(())
    }

    /// Write the configuration of every map to the node
    pub fn save(&self) -> Result<()> {
        for map in self.maps.values() {
            map.save()?;
        }
        Ok(())
    }

    /// Stop all periodic transmissions
    pub fn stop(&self) {
        for map in self.maps.values() {
            map.stop();
        }
    }

    pub(crate) fn detach(&self) {
        for map in self.maps.values() {
            map.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_helpers_round_trip() {
        let mut data = vec![0u8; 8];
        insert_bits(&mut data, 0, 16, 0x0237);
        insert_bits(&mut data, 16, 32, (-250i32 as u32) as u64);
        assert_eq!(vec![0x37, 0x02, 0x06, 0xFF, 0xFF, 0xFF, 0x00, 0x00], data);

        assert_eq!(0x0237, extract_bits(&data, 0, 16));
        assert_eq!(0xFFFF_FF06, extract_bits(&data, 16, 32));
    }

    #[test]
    fn test_sub_byte_fields() {
        let mut data = vec![0u8; 2];
        insert_bits(&mut data, 0, 3, 0b101);
        insert_bits(&mut data, 3, 5, 0b10011);
        insert_bits(&mut data, 8, 4, 0xF);
        assert_eq!(0b101, extract_bits(&data, 0, 3));
        assert_eq!(0b10011, extract_bits(&data, 3, 5));
        assert_eq!(0xF, extract_bits(&data, 8, 4));
        assert_eq!(vec![0b10011101, 0x0F], data);
    }

    #[test]
    fn test_decode_mapped_sign_extension() {
        assert_eq!(
            Value::Integer(-250),
            decode_mapped(DataType::Int32, 0xFFFF_FF06, 32)
        );
        assert_eq!(Value::Integer(-2), decode_mapped(DataType::Int8, 0xFE, 8));
        assert_eq!(Value::Integer(3), decode_mapped(DataType::Int8, 0x03, 8));
        assert_eq!(
            Value::Unsigned(0x0237),
            decode_mapped(DataType::UInt16, 0x0237, 16)
        );
    }

    #[test]
    fn test_encode_mapped_truncates() {
        assert_eq!(
            0xFFFF_FF06,
            encode_mapped(DataType::Int32, &Value::Integer(-250), 32)
        );
        assert_eq!(0b101, encode_mapped(DataType::UInt8, &Value::Unsigned(0b101), 3));
        assert_eq!(1, encode_mapped(DataType::Boolean, &Value::Bool(true), 1));
    }
}

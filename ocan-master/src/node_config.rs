//! Host-side node configuration files
//!
//! A [NodeConfig] is loaded from a TOML file and applied to a node over
//! SDO. It describes PDO configurations and arbitrary object writes, so a
//! commissioning tool can bring a node into a known state:
//!
//! ```toml
//! [tpdo.1]
//! enabled = true
//! transmission_type = 254
//! event_timer = 100
//! mappings = [
//!     { index = 0x6041, sub = 0 },
//!     { index = 0x606C, sub = 0, bits = 32 },
//! ]
//!
//! [[store]]
//! index = 0x2000
//! sub = 0
//! value = { U32 = 42 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use snafu::{ResultExt as _, Snafu};

use crate::node::RemoteNode;
use crate::pdo::{PdoError, PdoMaps};
use crate::sdo::SdoClientError;

/// Error produced when loading or applying a node configuration
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// Reading the file from disk failed
    #[snafu(display("IO error loading {path}: {source}"))]
    Io {
        /// The offending path
        path: String,
        /// The underlying error
        source: std::io::Error,
    },
    /// The TOML could not be parsed
    #[snafu(display("Error parsing TOML: {source}"))]
    TomlDeserialization {
        /// The underlying parser error
        source: toml::de::Error,
    },
    /// The configuration names a PDO the node does not have
    #[snafu(display("Node has no PDO number {number}"))]
    NoSuchPdo {
        /// The missing map number
        number: u8,
    },
    /// Configuring a PDO failed
    #[snafu(display("{source}"))]
    Pdo {
        /// The underlying PDO error
        source: PdoError,
    },
    /// Writing a stored object failed
    #[snafu(display("{source}"))]
    Sdo {
        /// The underlying SDO error
        source: SdoClientError,
    },
}

/// One variable mapping within a PDO configuration
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PdoMapping {
    /// Object index of the mapped variable
    pub index: u16,
    /// Subindex of the mapped variable
    #[serde(default)]
    pub sub: u8,
    /// Mapped bit length; defaults to the variable's declared size
    #[serde(default)]
    pub bits: Option<u8>,
}

/// Configuration for a single PDO
#[derive(Debug, Clone, Deserialize)]
pub struct PdoConfig {
    /// Whether the PDO is enabled after commissioning
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// COB-ID override; the predefined connection set applies otherwise
    #[serde(default)]
    pub cob_id: Option<u32>,
    /// Transmission type (0-255)
    #[serde(default)]
    pub transmission_type: Option<u8>,
    /// Inhibit time in multiples of 100 us
    #[serde(default)]
    pub inhibit_time: Option<u16>,
    /// Event timer in ms
    #[serde(default)]
    pub event_timer: Option<u16>,
    /// The mapped variables in frame order
    #[serde(default)]
    pub mappings: Vec<PdoMapping>,
}

fn default_enabled() -> bool {
    true
}

/// A value to be written to a sub-object during commissioning
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub enum StoreValue {
    /// Unsigned 32-bit value
    U32(u32),
    /// Unsigned 16-bit value
    U16(u16),
    /// Unsigned 8-bit value
    U8(u8),
    /// Signed 32-bit value
    I32(i32),
    /// Signed 16-bit value
    I16(i16),
    /// Signed 8-bit value
    I8(i8),
    /// 32-bit float value
    F32(f32),
    /// String value
    String(String),
}

impl StoreValue {
    /// The little-endian wire representation of the value
    pub fn raw(&self) -> Vec<u8> {
        match self {
            StoreValue::U32(v) => v.to_le_bytes().to_vec(),
            StoreValue::U16(v) => v.to_le_bytes().to_vec(),
            StoreValue::U8(v) => vec![*v],
            StoreValue::I32(v) => v.to_le_bytes().to_vec(),
            StoreValue::I16(v) => v.to_le_bytes().to_vec(),
            StoreValue::I8(v) => vec![*v as u8],
            StoreValue::F32(v) => v.to_le_bytes().to_vec(),
            StoreValue::String(s) => s.as_bytes().to_vec(),
        }
    }
}

/// One object write performed during commissioning
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Store {
    /// Index of the object to write
    pub index: u16,
    /// Subindex of the object to write
    #[serde(default)]
    pub sub: u8,
    /// The value to write
    pub value: StoreValue,
}

/// A node configuration loaded from a TOML file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Transmit PDO configurations by map number
    #[serde(default, deserialize_with = "deserialize_pdo_map")]
    pub tpdo: BTreeMap<u8, PdoConfig>,
    /// Receive PDO configurations by map number
    #[serde(default, deserialize_with = "deserialize_pdo_map")]
    pub rpdo: BTreeMap<u8, PdoConfig>,
    /// Object writes applied after the PDO configuration
    #[serde(default)]
    pub store: Vec<Store>,
}

/// TOML table keys arrive as strings; parse them into map numbers
fn deserialize_pdo_map<'de, D>(deserializer: D) -> Result<BTreeMap<u8, PdoConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, PdoConfig> = BTreeMap::deserialize(deserializer)?;
    let mut map = BTreeMap::new();
    for (key, value) in raw {
        let number: u8 = key.parse().map_err(|_| {
            serde::de::Error::custom(format!("PDO number '{key}' is not an integer"))
        })?;
        map.insert(number, value);
    }
    Ok(map)
}

impl NodeConfig {
    /// Read a configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read a configuration from a string
    pub fn load_from_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).context(TomlDeserializationSnafu)
    }

    /// Apply the configuration to a node over SDO
    pub fn apply(&self, node: &RemoteNode) -> Result<(), ConfigError> {
        apply_pdo_configs(&node.tpdo, &self.tpdo)?;
        apply_pdo_configs(&node.rpdo, &self.rpdo)?;
        for store in &self.store {
            node.sdo
                .download(store.index, store.sub, &store.value.raw())
                .context(SdoSnafu)?;
        }
        Ok(())
    }
}

fn apply_pdo_configs(
    maps: &PdoMaps,
    configs: &BTreeMap<u8, PdoConfig>,
) -> Result<(), ConfigError> {
    for (number, config) in configs {
        let map = maps
            .get(*number)
            .ok_or(ConfigError::NoSuchPdo { number: *number })?;
        if let Some(cob_id) = config.cob_id {
            map.set_cob_id(cob_id);
        }
        if let Some(trans_type) = config.transmission_type {
            map.set_trans_type(trans_type);
        }
        if let Some(inhibit) = config.inhibit_time {
            map.set_inhibit_time(inhibit);
        }
        if let Some(event) = config.event_timer {
            map.set_event_timer(event);
        }
        map.set_enabled(config.enabled);
        map.clear();
        for mapping in &config.mappings {
            match mapping.bits {
                Some(bits) => map
                    .add_mapping_sized(mapping.index, mapping.sub, bits as usize)
                    .context(PdoSnafu)?,
                None => map
                    .add_variable(mapping.index, mapping.sub)
                    .context(PdoSnafu)?,
            }
        }
        map.save().context(PdoSnafu)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = NodeConfig::load_from_str(
            r#"
            [tpdo.1]
            transmission_type = 254
            event_timer = 100
            mappings = [
                { index = 0x6041, sub = 0 },
                { index = 0x606C, sub = 0, bits = 32 },
            ]

            [rpdo.2]
            enabled = false

            [[store]]
            index = 0x2000
            sub = 1
            value = { U16 = 1000 }
            "#,
        )
        .unwrap();

        let tpdo1 = &config.tpdo[&1];
        assert!(tpdo1.enabled);
        assert_eq!(Some(254), tpdo1.transmission_type);
        assert_eq!(2, tpdo1.mappings.len());
        assert_eq!(Some(32), tpdo1.mappings[1].bits);
        assert!(!config.rpdo[&2].enabled);
        assert_eq!(
            Store {
                index: 0x2000,
                sub: 1,
                value: StoreValue::U16(1000),
            },
            config.store[0]
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            NodeConfig::load_from_str("nonsense = 1"),
            Err(ConfigError::TomlDeserialization { .. })
        ));
    }

    #[test]
    fn test_store_value_encoding() {
        assert_eq!(vec![0xE8, 0x03], StoreValue::U16(1000).raw());
        assert_eq!(vec![0x06, 0xFF, 0xFF, 0xFF], StoreValue::I32(-250).raw());
        assert_eq!(b"abc".to_vec(), StoreValue::String("abc".into()).raw());
    }
}

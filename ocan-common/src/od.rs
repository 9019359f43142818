//! Object dictionary containers
//!
//! The in-memory model of a node's object dictionary: a tree of
//! [ODVariable] leaves grouped into [ODRecord]s and [ODArray]s, indexed by
//! 16-bit index and by name. The dictionary is built once (typically by the
//! EDS parser) and treated as immutable by the protocol engines, so it can
//! be shared freely between threads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use snafu::Snafu;

use crate::objects::{decode_value, encode_value, AccessType, DataType, Value, ValueError};

/// Errors produced by dictionary lookups and value conversions
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum ObjectDictionaryError {
    /// No object exists at the index
    #[snafu(display("Object 0x{index:04X} was not found in the object dictionary"))]
    NoObject {
        /// The requested index
        index: u16,
    },
    /// No sub-object exists at the subindex
    #[snafu(display("Subindex 0x{index:04X}sub{sub} was not found"))]
    NoSubindex {
        /// The requested index
        index: u16,
        /// The requested subindex
        sub: u8,
    },
    /// No object with the name exists
    #[snafu(display("'{name}' was not found in the object dictionary"))]
    NoName {
        /// The requested name
        name: String,
    },
    /// Another object already occupies the index
    #[snafu(display("Object 0x{index:04X} is already present"))]
    DuplicateIndex {
        /// The conflicting index
        index: u16,
    },
    /// The object is a record or array, not a plain variable
    #[snafu(display("Object 0x{index:04X} is not a variable"))]
    NotAVariable {
        /// The requested index
        index: u16,
    },
    /// The variable defines no value descriptions
    #[snafu(display("No value descriptions exist for 0x{index:04X}sub{sub}"))]
    NoValueDescriptions {
        /// The variable index
        index: u16,
        /// The variable subindex
        sub: u8,
    },
    /// No value description matches
    #[snafu(display("No value description matches '{desc}'"))]
    NoSuchDescription {
        /// The requested description
        desc: String,
    },
    /// The variable defines no bit definition with the name
    #[snafu(display("No bit definition named '{name}'"))]
    NoSuchBitDefinition {
        /// The requested name
        name: String,
    },
    /// Value conversion failed
    #[snafu(display("{source}"))]
    Conversion {
        /// The underlying conversion error
        source: ValueError,
    },
    /// Scaling requested on a non-numeric variable
    #[snafu(display("Variable 0x{index:04X}sub{sub} is not numeric"))]
    NotNumeric {
        /// The variable index
        index: u16,
        /// The variable subindex
        sub: u8,
    },
}

type Result<T> = std::result::Result<T, ObjectDictionaryError>;

/// A leaf dictionary entry
#[derive(Debug, Clone)]
pub struct ODVariable {
    /// Entry name from the dictionary file
    pub name: String,
    /// 16-bit object index
    pub index: u16,
    /// 8-bit subindex; 0 for standalone variables
    pub subindex: u8,
    /// CANopen data type
    pub data_type: DataType,
    /// Access mode
    pub access_type: AccessType,
    /// Physical unit, informational only
    pub unit: String,
    /// Scaling factor between raw and physical value
    pub factor: f64,
    /// Scaling offset between raw and physical value
    pub offset: f64,
    /// Minimum allowed raw value
    pub min: Option<f64>,
    /// Maximum allowed raw value
    pub max: Option<f64>,
    /// Default value at start-up
    pub default: Option<Value>,
    /// Symbolic descriptions for specific raw values
    pub value_descriptions: BTreeMap<i64, String>,
    /// Named groups of bits within the raw value
    pub bit_definitions: HashMap<String, Vec<u8>>,
    /// Whether this variable may be mapped into a PDO
    pub pdo_mappable: bool,
}

impl ODVariable {
    /// Create a variable with default attributes
    pub fn new(name: impl Into<String>, index: u16, subindex: u8, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            index,
            subindex,
            data_type,
            access_type: AccessType::Rw,
            unit: String::new(),
            factor: 1.0,
            offset: 0.0,
            min: None,
            max: None,
            default: None,
            value_descriptions: BTreeMap::new(),
            bit_definitions: HashMap::new(),
            pdo_mappable: false,
        }
    }

    /// The size of this variable in bits; variable-size types report 64
    pub fn bit_length(&self) -> usize {
        self.data_type.bit_length().unwrap_or(64)
    }

    /// Associate a raw value with a symbolic description
    pub fn add_value_description(&mut self, value: i64, desc: impl Into<String>) {
        self.value_descriptions.insert(value, desc.into());
    }

    /// Associate a name with a group of bit positions
    pub fn add_bit_definition(&mut self, name: impl Into<String>, bits: Vec<u8>) {
        self.bit_definitions.insert(name.into(), bits);
    }

    /// Decode raw bytes to a typed value
    pub fn decode_raw(&self, data: &[u8]) -> Result<Value> {
        decode_value(self.data_type, data).map_err(|source| ObjectDictionaryError::Conversion { source })
    }

    /// Encode a typed value to raw bytes
    ///
    /// Values outside the declared min/max range are logged but still
    /// encoded, matching the tolerant behavior of most configuration tools.
    pub fn encode_raw(&self, value: &Value) -> Result<Vec<u8>> {
        if let (Some(raw), true) = (value.as_f64(), self.data_type.is_numeric()) {
            if let Some(min) = self.min {
                if raw < min {
                    log::warn!("Value {raw} is less than min value {min} for {}", self.name);
                }
            }
            if let Some(max) = self.max {
                if raw > max {
                    log::warn!("Value {raw} is greater than max value {max} for {}", self.name);
                }
            }
        }
        encode_value(self.data_type, value).map_err(|source| ObjectDictionaryError::Conversion { source })
    }

    /// Scale a raw value to its physical value: `phys = raw * factor + offset`
    pub fn decode_phys(&self, raw: &Value) -> Result<f64> {
        let raw = raw.as_f64().ok_or(ObjectDictionaryError::NotNumeric {
            index: self.index,
            sub: self.subindex,
        })?;
        Ok(raw * self.factor + self.offset)
    }

    /// Scale a physical value back to its raw value
    ///
    /// Integer types are rounded to the nearest raw value.
    pub fn encode_phys(&self, phys: f64) -> Result<Value> {
        if !self.data_type.is_numeric() {
            return Err(ObjectDictionaryError::NotNumeric {
                index: self.index,
                sub: self.subindex,
            });
        }
        let raw = (phys - self.offset) / self.factor;
        Ok(if self.data_type.is_float() {
            Value::Real(raw)
        } else if self.data_type.is_signed() {
            Value::Integer(raw.round() as i64)
        } else {
            Value::Unsigned(raw.round() as u64)
        })
    }

    /// Convert a raw value to its symbolic description
    pub fn decode_desc(&self, raw: &Value) -> Result<String> {
        if self.value_descriptions.is_empty() {
            return Err(ObjectDictionaryError::NoValueDescriptions {
                index: self.index,
                sub: self.subindex,
            });
        }
        let key = raw.as_i64().ok_or(ObjectDictionaryError::NotNumeric {
            index: self.index,
            sub: self.subindex,
        })?;
        self.value_descriptions
            .get(&key)
            .cloned()
            .ok_or_else(|| ObjectDictionaryError::NoSuchDescription {
                desc: format!("value {key}"),
            })
    }

    /// Convert a symbolic description to its raw value
    pub fn encode_desc(&self, desc: &str) -> Result<Value> {
        if self.value_descriptions.is_empty() {
            return Err(ObjectDictionaryError::NoValueDescriptions {
                index: self.index,
                sub: self.subindex,
            });
        }
        for (value, description) in &self.value_descriptions {
            if description == desc {
                return Ok(Value::Integer(*value));
            }
        }
        Err(ObjectDictionaryError::NoSuchDescription {
            desc: desc.to_string(),
        })
    }

    /// Resolve a named bit definition
    pub fn bits_by_name(&self, name: &str) -> Result<&[u8]> {
        self.bit_definitions
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| ObjectDictionaryError::NoSuchBitDefinition {
                name: name.to_string(),
            })
    }

    /// Extract the bits at the given positions from a raw integer value
    pub fn decode_bits(&self, raw: u64, bits: &[u8]) -> u64 {
        let mut mask = 0u64;
        for bit in bits {
            mask |= 1 << bit;
        }
        let low = bits.iter().min().copied().unwrap_or(0);
        (raw & mask) >> low
    }

    /// Replace the bits at the given positions in a raw integer value
    pub fn encode_bits(&self, raw: u64, bits: &[u8], bit_value: u64) -> u64 {
        let mut mask = 0u64;
        for bit in bits {
            mask |= 1 << bit;
        }
        let low = bits.iter().min().copied().unwrap_or(0);
        (raw & !mask) | ((bit_value << low) & mask)
    }
}

/// A record object: heterogeneous variables grouped under one index
#[derive(Debug, Clone, Default)]
pub struct ODRecord {
    /// Record name from the dictionary file
    pub name: String,
    /// 16-bit object index
    pub index: u16,
    members: BTreeMap<u8, Arc<ODVariable>>,
    names: HashMap<String, u8>,
}

impl ODRecord {
    /// Create an empty record
    pub fn new(name: impl Into<String>, index: u16) -> Self {
        Self {
            name: name.into(),
            index,
            members: BTreeMap::new(),
            names: HashMap::new(),
        }
    }

    /// Add a member variable
    pub fn add_member(&mut self, var: ODVariable) {
        self.names.insert(var.name.clone(), var.subindex);
        self.members.insert(var.subindex, Arc::new(var));
    }

    /// Get a member by subindex
    pub fn sub(&self, subindex: u8) -> Option<Arc<ODVariable>> {
        self.members.get(&subindex).cloned()
    }

    /// Get a member by name
    pub fn sub_by_name(&self, name: &str) -> Option<Arc<ODVariable>> {
        self.names.get(name).and_then(|sub| self.sub(*sub))
    }

    /// Iterate members in subindex order
    pub fn iter(&self) -> impl Iterator<Item = (&u8, &Arc<ODVariable>)> {
        self.members.iter()
    }

    /// Number of defined members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when no members are defined
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// An array object: homogeneous variables grouped under one index
///
/// Subindices which have not been explicitly defined are synthesized on
/// demand from the subindex 1 template, since the actual length of an array
/// is only known to the device.
#[derive(Debug, Clone, Default)]
pub struct ODArray {
    /// Array name from the dictionary file
    pub name: String,
    /// 16-bit object index
    pub index: u16,
    members: BTreeMap<u8, Arc<ODVariable>>,
    names: HashMap<String, u8>,
}

impl ODArray {
    /// Create an empty array
    pub fn new(name: impl Into<String>, index: u16) -> Self {
        Self {
            name: name.into(),
            index,
            members: BTreeMap::new(),
            names: HashMap::new(),
        }
    }

    /// Add a member variable
    pub fn add_member(&mut self, var: ODVariable) {
        self.names.insert(var.name.clone(), var.subindex);
        self.members.insert(var.subindex, Arc::new(var));
    }

    /// Get a member by subindex, synthesizing missing entries from the
    /// subindex 1 template
    pub fn sub(&self, subindex: u8) -> Option<Arc<ODVariable>> {
        if let Some(var) = self.members.get(&subindex) {
            return Some(var.clone());
        }
        if subindex == 0 {
            return None;
        }
        let template = self.members.get(&1)?;
        let mut var = (**template).clone();
        var.name = format!("{}_{:x}", template.name, subindex);
        var.subindex = subindex;
        Some(Arc::new(var))
    }

    /// Get a member by name; synthesized entries are not findable by name
    pub fn sub_by_name(&self, name: &str) -> Option<Arc<ODVariable>> {
        self.names
            .get(name)
            .and_then(|sub| self.members.get(sub).cloned())
    }

    /// Iterate explicitly defined members in subindex order
    pub fn iter(&self) -> impl Iterator<Item = (&u8, &Arc<ODVariable>)> {
        self.members.iter()
    }

    /// Number of explicitly defined members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when no members are defined
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Any dictionary object
#[derive(Debug, Clone)]
pub enum ODObject {
    /// A standalone variable
    Variable(Arc<ODVariable>),
    /// A record of heterogeneous variables
    Record(ODRecord),
    /// An array of homogeneous variables
    Array(ODArray),
}

impl ODObject {
    /// The object name
    pub fn name(&self) -> &str {
        match self {
            ODObject::Variable(v) => &v.name,
            ODObject::Record(r) => &r.name,
            ODObject::Array(a) => &a.name,
        }
    }

    /// The object index
    pub fn index(&self) -> u16 {
        match self {
            ODObject::Variable(v) => v.index,
            ODObject::Record(r) => r.index,
            ODObject::Array(a) => a.index,
        }
    }

    /// Resolve a variable within this object
    ///
    /// For standalone variables only subindex 0 resolves.
    pub fn variable(&self, subindex: u8) -> Option<Arc<ODVariable>> {
        match self {
            ODObject::Variable(v) => (subindex == 0).then(|| v.clone()),
            ODObject::Record(r) => r.sub(subindex),
            ODObject::Array(a) => a.sub(subindex),
        }
    }
}

/// A node's object dictionary
#[derive(Debug, Clone, Default)]
pub struct ObjectDictionary {
    objects: BTreeMap<u16, Arc<ODObject>>,
    names: HashMap<String, u16>,
    /// Node ID from a DCF `[DeviceComissioning]` section
    pub node_id: Option<u8>,
    /// Bitrate in bit/s from a DCF `[DeviceComissioning]` section
    pub bitrate: Option<u32>,
}

impl ObjectDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object
    ///
    /// Fails when the index is already occupied.
    pub fn add_object(&mut self, obj: ODObject) -> Result<()> {
        let index = obj.index();
        if self.objects.contains_key(&index) {
            return Err(ObjectDictionaryError::DuplicateIndex { index });
        }
        self.names.insert(obj.name().to_string(), index);
        self.objects.insert(index, Arc::new(obj));
        Ok(())
    }

    /// Shorthand for adding a standalone variable
    pub fn add_variable(&mut self, var: ODVariable) -> Result<()> {
        self.add_object(ODObject::Variable(Arc::new(var)))
    }

    /// Get an object by index
    pub fn get(&self, index: u16) -> Option<Arc<ODObject>> {
        self.objects.get(&index).cloned()
    }

    /// Get an object by name
    pub fn get_by_name(&self, name: &str) -> Option<Arc<ODObject>> {
        self.names.get(name).and_then(|index| self.get(*index))
    }

    /// True when an object exists at the index
    pub fn contains(&self, index: u16) -> bool {
        self.objects.contains_key(&index)
    }

    /// Iterate objects in index order
    pub fn iter(&self) -> impl Iterator<Item = (&u16, &Arc<ODObject>)> {
        self.objects.iter()
    }

    /// Resolve a variable by index and subindex
    pub fn variable(&self, index: u16, sub: u8) -> Result<Arc<ODVariable>> {
        let obj = self
            .get(index)
            .ok_or(ObjectDictionaryError::NoObject { index })?;
        obj.variable(sub)
            .ok_or(ObjectDictionaryError::NoSubindex { index, sub })
    }

    /// Resolve a variable by name
    ///
    /// Sub-objects of records and arrays are addressed with a dotted
    /// `"Group.Variable"` name.
    pub fn variable_by_name(&self, name: &str) -> Result<Arc<ODVariable>> {
        let missing = || ObjectDictionaryError::NoName {
            name: name.to_string(),
        };
        if let Some((group, member)) = name.split_once('.') {
            let obj = self.get_by_name(group).ok_or_else(missing)?;
            match &*obj {
                ODObject::Record(r) => r.sub_by_name(member).ok_or_else(missing),
                ODObject::Array(a) => a.sub_by_name(member).ok_or_else(missing),
                ODObject::Variable(_) => Err(missing()),
            }
        } else {
            let obj = self.get_by_name(name).ok_or_else(missing)?;
            match &*obj {
                ODObject::Variable(v) => Ok(v.clone()),
                _ => Err(ObjectDictionaryError::NotAVariable { index: obj.index() }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaled_var() -> ODVariable {
        let mut var = ODVariable::new("Velocity", 0x2000, 0, DataType::Int16);
        var.factor = 0.5;
        var.offset = -10.0;
        var
    }

    #[test]
    fn test_phys_scaling_round_trip() {
        let var = scaled_var();
        // phys = raw * 0.5 - 10
        assert_eq!(10.0, var.decode_phys(&Value::Integer(40)).unwrap());
        assert_eq!(Value::Integer(40), var.encode_phys(10.0).unwrap());
        // Rounds to the nearest raw value
        assert_eq!(Value::Integer(40), var.encode_phys(10.1).unwrap());
    }

    #[test]
    fn test_value_descriptions() {
        let mut var = ODVariable::new("Mode", 0x2001, 0, DataType::UInt8);
        assert!(var.decode_desc(&Value::Unsigned(1)).is_err());
        var.add_value_description(1, "Position");
        var.add_value_description(3, "Velocity");
        assert_eq!("Velocity", var.decode_desc(&Value::Unsigned(3)).unwrap());
        assert_eq!(Value::Integer(1), var.encode_desc("Position").unwrap());
        assert!(var.encode_desc("Torque").is_err());
    }

    #[test]
    fn test_bit_access() {
        let mut var = ODVariable::new("Status", 0x2002, 0, DataType::UInt16);
        var.add_bit_definition("FAULT", vec![3]);
        assert_eq!(1, var.decode_bits(0b1000, &[3]));
        assert_eq!(0b11, var.decode_bits(0b0110, &[1, 2]));
        assert_eq!(0b0110, var.encode_bits(0, &[1, 2], 0b11));
        assert_eq!(0b1000, var.encode_bits(0b1110, &[1, 2], 0));
        assert_eq!(&[3u8][..], var.bits_by_name("FAULT").unwrap());
    }

    #[test]
    fn test_array_synthesis() {
        let mut array = ODArray::new("Inputs", 0x2100);
        array.add_member(ODVariable::new("Count", 0x2100, 0, DataType::UInt8));
        array.add_member(ODVariable::new("Input", 0x2100, 1, DataType::UInt16));

        let synth = array.sub(4).unwrap();
        assert_eq!("Input_4", synth.name);
        assert_eq!(4, synth.subindex);
        assert_eq!(DataType::UInt16, synth.data_type);
        // Explicit members are returned untouched
        assert_eq!("Input", array.sub(1).unwrap().name);
    }

    #[test]
    fn test_dictionary_lookup() {
        let mut od = ObjectDictionary::new();
        od.add_variable(ODVariable::new("Device type", 0x1000, 0, DataType::UInt32))
            .unwrap();
        let mut record = ODRecord::new("Identity", 0x1018);
        record.add_member(ODVariable::new("Vendor ID", 0x1018, 1, DataType::UInt32));
        od.add_object(ODObject::Record(record)).unwrap();

        assert!(od.contains(0x1000));
        assert_eq!(0x1000, od.variable(0x1000, 0).unwrap().index);
        assert_eq!(
            1,
            od.variable_by_name("Identity.Vendor ID").unwrap().subindex
        );
        assert!(od.variable(0x1000, 1).is_err());
        assert!(od.variable_by_name("Nope").is_err());
        assert!(od
            .add_variable(ODVariable::new("Dup", 0x1000, 0, DataType::UInt8))
            .is_err());
    }
}

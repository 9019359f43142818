//! Typed dictionary-backed access to a node's objects

use std::sync::Arc;

use ocan_common::objects::Value;
use ocan_common::od::{ODObject, ODVariable, ObjectDictionaryError};

use crate::sdo::client::{Result, SdoClient, SdoClientError};

/// Dictionary-aware view of a node's SDO server
///
/// Entries are addressed by index or by name; sub-objects of records and
/// arrays by subindex or dotted `"Group.Variable"` names. Every access
/// performs an SDO transfer.
#[derive(Debug, Clone)]
pub struct SdoNode {
    client: Arc<SdoClient>,
}

impl SdoNode {
    pub(crate) fn new(client: Arc<SdoClient>) -> Self {
        Self { client }
    }

    /// The underlying protocol client
    pub fn client(&self) -> &Arc<SdoClient> {
        &self.client
    }

    /// Read the raw value of an object
    pub fn upload(&self, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.client.upload(index, sub)
    }

    /// Write the raw value of an object
    pub fn download(&self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        self.client.download(index, sub, data, false)
    }

    /// Look up a dictionary entry by index
    pub fn entry(&self, index: u16) -> Result<SdoEntry> {
        let obj = self
            .client
            .od()
            .get(index)
            .ok_or(ObjectDictionaryError::NoObject { index })?;
        Ok(self.wrap(obj))
    }

    /// Look up a dictionary entry by name
    pub fn entry_by_name(&self, name: &str) -> Result<SdoEntry> {
        let obj = self
            .client
            .od()
            .get_by_name(name)
            .ok_or_else(|| ObjectDictionaryError::NoName {
                name: name.to_string(),
            })?;
        Ok(self.wrap(obj))
    }

    fn wrap(&self, obj: Arc<ODObject>) -> SdoEntry {
        match &*obj {
            ODObject::Variable(var) => SdoEntry::Variable(SdoVariable {
                client: self.client.clone(),
                od: var.clone(),
            }),
            ODObject::Record(_) => SdoEntry::Record(SdoRecord {
                client: self.client.clone(),
                obj,
            }),
            ODObject::Array(_) => SdoEntry::Array(SdoArray {
                client: self.client.clone(),
                obj,
            }),
        }
    }

    /// Look up a variable by index and subindex
    pub fn variable(&self, index: u16, sub: u8) -> Result<SdoVariable> {
        let od = self.client.od().variable(index, sub)?;
        Ok(SdoVariable {
            client: self.client.clone(),
            od,
        })
    }

    /// Look up a variable by plain or dotted name
    pub fn variable_by_name(&self, name: &str) -> Result<SdoVariable> {
        let od = self.client.od().variable_by_name(name)?;
        Ok(SdoVariable {
            client: self.client.clone(),
            od,
        })
    }
}

/// A dictionary entry bound to a node
#[derive(Debug, Clone)]
pub enum SdoEntry {
    /// A standalone variable
    Variable(SdoVariable),
    /// A record of heterogeneous variables
    Record(SdoRecord),
    /// An array of homogeneous variables
    Array(SdoArray),
}

/// A record entry bound to a node
#[derive(Debug, Clone)]
pub struct SdoRecord {
    client: Arc<SdoClient>,
    obj: Arc<ODObject>,
}

impl SdoRecord {
    /// Access a member by subindex
    pub fn sub(&self, subindex: u8) -> Result<SdoVariable> {
        let od = self
            .obj
            .variable(subindex)
            .ok_or(ObjectDictionaryError::NoSubindex {
                index: self.obj.index(),
                sub: subindex,
            })?;
        Ok(SdoVariable {
            client: self.client.clone(),
            od,
        })
    }
}

/// An array entry bound to a node
#[derive(Debug, Clone)]
pub struct SdoArray {
    client: Arc<SdoClient>,
    obj: Arc<ODObject>,
}

impl SdoArray {
    /// Access an element by subindex
    ///
    /// Elements the dictionary file does not list explicitly are derived
    /// from the array's first element.
    pub fn sub(&self, subindex: u8) -> Result<SdoVariable> {
        let od = self
            .obj
            .variable(subindex)
            .ok_or(ObjectDictionaryError::NoSubindex {
                index: self.obj.index(),
                sub: subindex,
            })?;
        Ok(SdoVariable {
            client: self.client.clone(),
            od,
        })
    }

    /// Read the element count held in subindex 0
    pub fn count(&self) -> Result<u8> {
        let data = self.client.upload(self.obj.index(), 0)?;
        data.first()
            .copied()
            .ok_or(SdoClientError::SizeMismatch {
                expected: 1,
                actual: 0,
            })
    }
}

/// One dictionary variable bound to a node
///
/// Offers the value in four views: raw bytes ([data](SdoVariable::data)),
/// typed ([raw](SdoVariable::raw)), scaled ([phys](SdoVariable::phys)) and
/// symbolic ([desc](SdoVariable::desc)), plus bit-level access.
#[derive(Debug, Clone)]
pub struct SdoVariable {
    client: Arc<SdoClient>,
    /// The dictionary declaration of this variable
    pub od: Arc<ODVariable>,
}

impl SdoVariable {
    /// Read the value as raw bytes
    pub fn data(&self) -> Result<Vec<u8>> {
        self.client.upload(self.od.index, self.od.subindex)
    }

    /// Write the value as raw bytes
    pub fn set_data(&self, data: &[u8]) -> Result<()> {
        self.client
            .download(self.od.index, self.od.subindex, data, false)
    }

    /// Read the value decoded to its declared type
    pub fn raw(&self) -> Result<Value> {
        let data = self.data()?;
        Ok(self.od.decode_raw(&data)?)
    }

    /// Write a typed value
    pub fn set_raw(&self, value: impl Into<Value>) -> Result<()> {
        let data = self.od.encode_raw(&value.into())?;
        self.set_data(&data)
    }

    /// Read the value scaled to its physical representation
    pub fn phys(&self) -> Result<f64> {
        let raw = self.raw()?;
        Ok(self.od.decode_phys(&raw)?)
    }

    /// Write a physical value, scaling it back to the raw representation
    pub fn set_phys(&self, phys: f64) -> Result<()> {
        let raw = self.od.encode_phys(phys)?;
        self.set_raw(raw)
    }

    /// Read the value as its symbolic description
    pub fn desc(&self) -> Result<String> {
        let raw = self.raw()?;
        Ok(self.od.decode_desc(&raw)?)
    }

    /// Write the value by its symbolic description
    pub fn set_desc(&self, desc: &str) -> Result<()> {
        let raw = self.od.encode_desc(desc)?;
        self.set_raw(raw)
    }

    /// Read a group of bits given by their positions
    pub fn bits(&self, bits: &[u8]) -> Result<u64> {
        Ok(self.od.decode_bits(self.raw_bits()?, bits))
    }

    /// Read a group of bits by its declared name
    pub fn bits_by_name(&self, name: &str) -> Result<u64> {
        let positions = self.od.bits_by_name(name)?.to_vec();
        self.bits(&positions)
    }

    /// Replace a group of bits given by their positions
    pub fn set_bits(&self, bits: &[u8], value: u64) -> Result<()> {
        let raw = self.od.encode_bits(self.raw_bits()?, bits, value);
        let encoded = self.od.encode_raw(&Value::Unsigned(raw))?;
        self.set_data(&encoded)
    }

    fn raw_bits(&self) -> Result<u64> {
        match self.raw()? {
            Value::Bool(b) => Ok(b as u64),
            Value::Unsigned(v) => Ok(v),
            Value::Integer(v) => Ok(v as u64),
            other => Err(SdoClientError::Dictionary {
                source: ObjectDictionaryError::Conversion {
                    source: ocan_common::objects::ValueError::TypeMismatch {
                        data_type: self.od.data_type,
                        value: other,
                    },
                },
            }),
        }
    }
}

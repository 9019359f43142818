//! Object dictionary primitive types
//!
//! The CANopen data types, access modes, and the [Value] type which carries
//! a decoded object value through the rest of the stack.

use snafu::Snafu;

/// CANopen data types with their standard type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DataType {
    /// BOOLEAN
    Boolean = 0x0001,
    /// INTEGER8
    Int8 = 0x0002,
    /// INTEGER16
    Int16 = 0x0003,
    /// INTEGER32
    Int32 = 0x0004,
    /// UNSIGNED8
    UInt8 = 0x0005,
    /// UNSIGNED16
    UInt16 = 0x0006,
    /// UNSIGNED32
    UInt32 = 0x0007,
    /// REAL32
    Real32 = 0x0008,
    /// VISIBLE_STRING
    VisibleString = 0x0009,
    /// OCTET_STRING
    OctetString = 0x000A,
    /// UNICODE_STRING
    UnicodeString = 0x000B,
    /// DOMAIN
    Domain = 0x000F,
    /// REAL64
    Real64 = 0x0011,
    /// INTEGER64
    Int64 = 0x0015,
    /// UNSIGNED64
    UInt64 = 0x001B,
}

impl DataType {
    /// Look up a data type by its standard type code
    pub fn from_type_code(code: u16) -> Option<Self> {
        use DataType::*;
        match code {
            0x0001 => Some(Boolean),
            0x0002 => Some(Int8),
            0x0003 => Some(Int16),
            0x0004 => Some(Int32),
            0x0005 => Some(UInt8),
            0x0006 => Some(UInt16),
            0x0007 => Some(UInt32),
            0x0008 => Some(Real32),
            0x0009 => Some(VisibleString),
            0x000A => Some(OctetString),
            0x000B => Some(UnicodeString),
            0x000F => Some(Domain),
            0x0011 => Some(Real64),
            0x0015 => Some(Int64),
            0x001B => Some(UInt64),
            _ => None,
        }
    }

    /// The fixed bit length of this type, or None for variable-size types
    pub fn bit_length(&self) -> Option<usize> {
        use DataType::*;
        match self {
            Boolean => Some(1),
            Int8 | UInt8 => Some(8),
            Int16 | UInt16 => Some(16),
            Int32 | UInt32 | Real32 => Some(32),
            Int64 | UInt64 | Real64 => Some(64),
            VisibleString | OctetString | UnicodeString | Domain => None,
        }
    }

    /// True for the signed integer types
    pub fn is_signed(&self) -> bool {
        matches!(self, DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64)
    }

    /// True for the unsigned integer types (BOOLEAN included)
    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            DataType::Boolean
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
        )
    }

    /// True for REAL32 and REAL64
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Real32 | DataType::Real64)
    }

    /// True for any integer or float type
    pub fn is_numeric(&self) -> bool {
        self.is_signed() || self.is_unsigned() || self.is_float()
    }
}

/// Object access modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessType {
    /// Read only
    Ro,
    /// Write only
    Wo,
    /// Read/write
    #[default]
    Rw,
    /// Read only and never changing
    Const,
}

impl AccessType {
    /// Parse the EDS access type string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ro" => Some(Self::Ro),
            "wo" => Some(Self::Wo),
            // rww/rwr declare the PDO direction on top of rw access
            "rw" | "rww" | "rwr" => Some(Self::Rw),
            "const" => Some(Self::Const),
            _ => None,
        }
    }

    /// True when the object may be read
    pub fn readable(&self) -> bool {
        !matches!(self, AccessType::Wo)
    }

    /// True when the object may be written
    pub fn writable(&self) -> bool {
        matches!(self, AccessType::Wo | AccessType::Rw)
    }
}

/// A decoded object value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// BOOLEAN value
    Bool(bool),
    /// Any unsigned integer value
    Unsigned(u64),
    /// Any signed integer value
    Integer(i64),
    /// REAL32 or REAL64 value
    Real(f64),
    /// VISIBLE_STRING or UNICODE_STRING value
    String(String),
    /// OCTET_STRING or DOMAIN value
    Bytes(Vec<u8>),
}

/// Error produced when converting between [Value] and raw bytes
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum ValueError {
    /// The raw data length does not fit the data type
    #[snafu(display("Data size mismatch: {actual} bytes for {data_type:?}"))]
    SizeMismatch {
        /// The declared type
        data_type: DataType,
        /// Number of bytes received
        actual: usize,
    },
    /// The value variant cannot represent the data type
    #[snafu(display("Cannot encode {value:?} as {data_type:?}"))]
    TypeMismatch {
        /// The declared type
        data_type: DataType,
        /// The rejected value
        value: Value,
    },
    /// An operation required a numeric value
    #[snafu(display("Value is not numeric"))]
    NotNumeric,
}

impl Value {
    /// The value as an unsigned integer, when representable
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Bool(b) => Some(*b as u64),
            Value::Unsigned(v) => Some(*v),
            Value::Integer(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// The value as a signed integer, when representable
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Unsigned(v) => i64::try_from(*v).ok(),
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a float, when numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as u8 as f64),
            Value::Unsigned(v) => Some(*v as f64),
            Value::Integer(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a string slice, for string values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Unsigned(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Bytes(v) => {
                for b in v {
                    write!(f, "{b:02X}")?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! value_from_int {
    ($($t:ty => $variant:ident as $cast:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v as $cast)
            }
        })*
    };
}

value_from_int!(
    u8 => Unsigned as u64,
    u16 => Unsigned as u64,
    u32 => Unsigned as u64,
    u64 => Unsigned as u64,
    i8 => Integer as i64,
    i16 => Integer as i64,
    i32 => Integer as i64,
    i64 => Integer as i64,
    f32 => Real as f64,
    f64 => Real as f64
);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

fn le_unsigned(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[0..data.len()].copy_from_slice(data);
    u64::from_le_bytes(buf)
}

fn le_signed(data: &[u8]) -> i64 {
    let unsigned = le_unsigned(data);
    let bits = data.len() * 8;
    if bits < 64 && unsigned & (1 << (bits - 1)) != 0 {
        (unsigned | !((1u64 << bits) - 1)) as i64
    } else {
        unsigned as i64
    }
}

/// Decode raw little-endian bytes according to a data type
pub fn decode_value(data_type: DataType, data: &[u8]) -> Result<Value, ValueError> {
    use DataType::*;
    let fixed_size = data_type.bit_length().map(|b| b.div_ceil(8));
    if let Some(size) = fixed_size {
        if data.len() < size {
            return Err(ValueError::SizeMismatch {
                data_type,
                actual: data.len(),
            });
        }
    }
    Ok(match data_type {
        Boolean => Value::Bool(data[0] != 0),
        UInt8 | UInt16 | UInt32 | UInt64 => {
            Value::Unsigned(le_unsigned(&data[0..fixed_size.unwrap()]))
        }
        Int8 | Int16 | Int32 | Int64 => Value::Integer(le_signed(&data[0..fixed_size.unwrap()])),
        Real32 => Value::Real(f32::from_le_bytes(data[0..4].try_into().unwrap()) as f64),
        Real64 => Value::Real(f64::from_le_bytes(data[0..8].try_into().unwrap())),
        VisibleString => {
            // Strip trailing NUL characters from C based devices
            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            Value::String(String::from_utf8_lossy(&data[0..end]).into_owned())
        }
        UnicodeString => {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
                .take_while(|&u| u != 0)
                .collect();
            Value::String(String::from_utf16_lossy(&units))
        }
        OctetString | Domain => Value::Bytes(data.to_vec()),
    })
}

/// Encode a value to raw little-endian bytes according to a data type
pub fn encode_value(data_type: DataType, value: &Value) -> Result<Vec<u8>, ValueError> {
    use DataType::*;
    // Raw bytes pass through for any type
    if let Value::Bytes(bytes) = value {
        return Ok(bytes.clone());
    }
    let mismatch = || ValueError::TypeMismatch {
        data_type,
        value: value.clone(),
    };
    match data_type {
        Boolean => Ok(vec![(value.as_u64().ok_or_else(mismatch)? != 0) as u8]),
        UInt8 | UInt16 | UInt32 | UInt64 => {
            let v = value.as_u64().ok_or_else(mismatch)?;
            let size = data_type.bit_length().unwrap() / 8;
            if size < 8 && v >= 1u64 << (size * 8) {
                return Err(mismatch());
            }
            Ok(v.to_le_bytes()[0..size].to_vec())
        }
        Int8 | Int16 | Int32 | Int64 => {
            let v = value.as_i64().ok_or_else(mismatch)?;
            let size = data_type.bit_length().unwrap() / 8;
            if size < 8 {
                let bound = 1i64 << (size * 8 - 1);
                if v < -bound || v >= bound {
                    return Err(mismatch());
                }
            }
            Ok(v.to_le_bytes()[0..size].to_vec())
        }
        Real32 => Ok((value.as_f64().ok_or_else(mismatch)? as f32)
            .to_le_bytes()
            .to_vec()),
        Real64 => Ok(value.as_f64().ok_or_else(mismatch)?.to_le_bytes().to_vec()),
        VisibleString => match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(mismatch()),
        },
        UnicodeString => match value {
            Value::String(s) => {
                let mut out = Vec::with_capacity(s.len() * 2);
                for unit in s.encode_utf16() {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
                Ok(out)
            }
            _ => Err(mismatch()),
        },
        OctetString | Domain => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_round_trip() {
        let encoded = encode_value(DataType::UInt16, &Value::Unsigned(0x0237)).unwrap();
        assert_eq!(vec![0x37, 0x02], encoded);
        assert_eq!(
            Value::Unsigned(0x0237),
            decode_value(DataType::UInt16, &encoded).unwrap()
        );
    }

    #[test]
    fn test_signed_sign_extension() {
        let encoded = encode_value(DataType::Int32, &Value::Integer(-250)).unwrap();
        assert_eq!(vec![0x06, 0xFF, 0xFF, 0xFF], encoded);
        assert_eq!(
            Value::Integer(-250),
            decode_value(DataType::Int32, &encoded).unwrap()
        );

        assert_eq!(
            Value::Integer(-1),
            decode_value(DataType::Int8, &[0xFF]).unwrap()
        );
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(encode_value(DataType::UInt8, &Value::Unsigned(256)).is_err());
        assert!(encode_value(DataType::Int8, &Value::Integer(128)).is_err());
        assert!(encode_value(DataType::Int8, &Value::Integer(-128)).is_ok());
    }

    #[test]
    fn test_visible_string() {
        assert_eq!(
            Value::String("abc".to_string()),
            decode_value(DataType::VisibleString, b"abc\0\0").unwrap()
        );
        assert_eq!(
            b"abc".to_vec(),
            encode_value(DataType::VisibleString, &Value::String("abc".into())).unwrap()
        );
    }

    #[test]
    fn test_real32() {
        let encoded = encode_value(DataType::Real32, &Value::Real(1.5)).unwrap();
        assert_eq!(
            Value::Real(1.5),
            decode_value(DataType::Real32, &encoded).unwrap()
        );
    }

    #[test]
    fn test_size_check() {
        assert!(decode_value(DataType::UInt32, &[1, 2]).is_err());
    }
}

//! EDS/DCF object dictionary loader
//!
//! Parses the INI-style electronic data sheet format into an
//! [ObjectDictionary]. DCF files are handled by the same code path; their
//! `[DeviceComissioning]` section additionally provides the node ID and
//! baudrate of the commissioned device.

use std::path::Path;

use configparser::ini::Ini;
use snafu::{ResultExt as _, Snafu};

use ocan_common::objects::{AccessType, DataType, Value};
use ocan_common::od::{ODArray, ODObject, ODRecord, ODVariable, ObjectDictionary};

/// Error returned when loading a dictionary file fails
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// Reading the file from disk failed
    #[snafu(display("IO error loading {path}: {source}"))]
    Io {
        /// The offending path
        path: String,
        /// The underlying error
        source: std::io::Error,
    },
    /// The INI structure could not be parsed
    #[snafu(display("INI format error: {message}"))]
    IniFormat {
        /// Parser error text
        message: String,
    },
    /// The file is valid INI but not a valid EDS
    #[snafu(display("EDS format error: {message}"))]
    EdsFormat {
        /// Description of the problem
        message: String,
    },
    /// A numeric field could not be parsed
    #[snafu(display("Cannot parse '{value}' as a number"))]
    ParseInt {
        /// The offending text
        value: String,
        /// The underlying error
        source: std::num::ParseIntError,
    },
}

type Result<T> = std::result::Result<T, LoadError>;

/// Load an object dictionary from an EDS or DCF file
///
/// `node_id` overrides any node ID found in a `[DeviceComissioning]`
/// section and is used to resolve `$NODEID+` default value expressions.
pub fn load_file<P: AsRef<Path>>(path: P, node_id: Option<u8>) -> Result<ObjectDictionary> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).context(IoSnafu {
        path: path.to_string_lossy(),
    })?;
    load_str(&content, node_id)
}

/// Load an object dictionary from EDS or DCF text
pub fn load_str(content: &str, node_id: Option<u8>) -> Result<ObjectDictionary> {
    let mut ini = Ini::new();
    ini.read(content.to_string())
        .map_err(|message| LoadError::IniFormat { message })?;

    let mut od = ObjectDictionary::new();

    if ini.sections().iter().any(|s| s == "devicecomissioning") {
        od.node_id = match ini.get("devicecomissioning", "nodeid") {
            Some(v) => Some(parse_int(&v)? as u8),
            None => None,
        };
        od.bitrate = match ini.get("devicecomissioning", "baudrate") {
            // Baudrate is given in kbit/s
            Some(v) => Some(parse_int(&v)? as u32 * 1000),
            None => None,
        };
    }
    if node_id.is_some() {
        od.node_id = node_id;
    }

    let mut sections: Vec<String> = ini
        .sections()
        .into_iter()
        .filter(|s| parse_index_section(s).is_some())
        .collect();
    sections.sort();

    for section in &sections {
        let index = parse_index_section(section).unwrap();
        let object_type = match ini.get(section, "objecttype") {
            Some(v) => parse_int(&v)?,
            // ObjectType defaults to VAR when omitted
            None => 7,
        };
        let obj = match object_type {
            7 => {
                let var = build_variable(&ini, section, index, 0, od.node_id)?;
                ODObject::Variable(std::sync::Arc::new(var))
            }
            8 => {
                let mut array = ODArray::new(parameter_name(&ini, section), index);
                for (sub, sub_section) in sub_sections(&ini, index) {
                    array.add_member(build_variable(&ini, &sub_section, index, sub, od.node_id)?);
                }
                ODObject::Array(array)
            }
            9 => {
                let mut record = ODRecord::new(parameter_name(&ini, section), index);
                for (sub, sub_section) in sub_sections(&ini, index) {
                    record.add_member(build_variable(&ini, &sub_section, index, sub, od.node_id)?);
                }
                ODObject::Record(record)
            }
            other => {
                log::warn!("Skipping object 0x{index:04X} with unsupported type {other}");
                continue;
            }
        };
        od.add_object(obj).map_err(|e| LoadError::EdsFormat {
            message: e.to_string(),
        })?;
    }

    Ok(od)
}

/// Match a top-level object section name like "1018"
fn parse_index_section(section: &str) -> Option<u16> {
    if section.len() != 4 {
        return None;
    }
    u16::from_str_radix(section, 16).ok()
}

/// Collect the "XXXXsubN" sections belonging to an object
fn sub_sections(ini: &Ini, index: u16) -> Vec<(u8, String)> {
    let prefix = format!("{index:x}sub");
    let mut subs: Vec<(u8, String)> = ini
        .sections()
        .into_iter()
        .filter_map(|s| {
            let sub = s.strip_prefix(&prefix)?;
            let sub = u8::from_str_radix(sub, 16).ok()?;
            Some((sub, s))
        })
        .collect();
    subs.sort();
    subs
}

fn parameter_name(ini: &Ini, section: &str) -> String {
    ini.get(section, "parametername")
        .unwrap_or_else(|| format!("Object {section}"))
}

fn build_variable(
    ini: &Ini,
    section: &str,
    index: u16,
    sub: u8,
    node_id: Option<u8>,
) -> Result<ODVariable> {
    let data_type = match ini.get(section, "datatype") {
        Some(v) => {
            let code = parse_int(&v)? as u16;
            DataType::from_type_code(code).ok_or_else(|| LoadError::EdsFormat {
                message: format!("Unknown data type 0x{code:04X} in [{section}]"),
            })?
        }
        // Sub 0 of records and arrays is the element count when unspecified
        None => DataType::UInt8,
    };

    let mut var = ODVariable::new(parameter_name(ini, section), index, sub, data_type);

    if let Some(access) = ini.get(section, "accesstype") {
        var.access_type = AccessType::from_str(&access).ok_or_else(|| LoadError::EdsFormat {
            message: format!("Invalid access type '{access}' in [{section}]"),
        })?;
    }
    if let Some(mapping) = ini.get(section, "pdomapping") {
        var.pdo_mappable = parse_int(&mapping)? != 0;
    }
    if let Some(low) = ini.get(section, "lowlimit") {
        var.min = parse_number(&low);
    }
    if let Some(high) = ini.get(section, "highlimit") {
        var.max = parse_number(&high);
    }
    if let Some(factor) = ini.get(section, "factor") {
        if let Some(f) = parse_number(&factor) {
            var.factor = f;
        }
    }
    if let Some(offset) = ini.get(section, "offset") {
        if let Some(o) = parse_number(&offset) {
            var.offset = o;
        }
    }
    // A DCF ParameterValue takes precedence over the EDS DefaultValue
    let default = ini
        .get(section, "parametervalue")
        .or_else(|| ini.get(section, "defaultvalue"));
    if let Some(text) = default {
        var.default = parse_default(&text, data_type, node_id);
    }

    Ok(var)
}

/// Parse a decimal or 0x-prefixed integer
fn parse_int(text: &str) -> Result<i64> {
    let text = text.trim();
    let (radix, digits) = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (16, hex)
    } else {
        (10, text)
    };
    i64::from_str_radix(digits, radix).context(ParseIntSnafu { value: text })
}

fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Ok(v) = parse_int(text) {
        return Some(v as f64);
    }
    text.parse().ok()
}

/// Parse a default value, resolving `$NODEID+` expressions
///
/// Values which cannot be parsed are logged and dropped rather than
/// failing the whole file; real-world sheets are full of oddities.
fn parse_default(text: &str, data_type: DataType, node_id: Option<u8>) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if data_type.is_numeric() {
        let lower = text.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("$nodeid") {
            let node_id = node_id? as i64;
            let rest = rest.trim_start_matches('+').trim();
            let base = if rest.is_empty() {
                0
            } else {
                parse_int(rest).ok()?
            };
            return Some(make_numeric(data_type, (node_id + base) as f64));
        }
        if let Some(v) = parse_number(text) {
            return Some(make_numeric(data_type, v));
        }
        log::warn!("Cannot parse default value '{text}'");
        return None;
    }
    match data_type {
        DataType::VisibleString | DataType::UnicodeString => Some(Value::String(text.to_string())),
        _ => None,
    }
}

fn make_numeric(data_type: DataType, value: f64) -> Value {
    if data_type.is_float() {
        Value::Real(value)
    } else if data_type.is_signed() {
        Value::Integer(value as i64)
    } else {
        Value::Unsigned(value as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[FileInfo]
FileName=sample.eds
Description=Sample device

[DeviceComissioning]
NodeID=0x0A
Baudrate=250

[1000]
ParameterName=Device type
ObjectType=0x7
DataType=0x0007
AccessType=ro
DefaultValue=0x00020192

[1017]
ParameterName=Producer heartbeat time
DataType=0x0006
AccessType=rw
DefaultValue=0

[1018]
ParameterName=Identity object
ObjectType=0x9
SubNumber=5

[1018sub0]
ParameterName=Highest sub-index supported
DataType=0x0005
AccessType=const
DefaultValue=4

[1018sub1]
ParameterName=Vendor-ID
DataType=0x0007
AccessType=ro

[2000]
ParameterName=Velocity setpoint
DataType=0x0003
AccessType=rw
PDOMapping=1
LowLimit=-1000
HighLimit=1000
Factor=0.5

[2100]
ParameterName=Analog inputs
ObjectType=0x8
SubNumber=2

[2100sub0]
ParameterName=Number of inputs
DataType=0x0005
AccessType=ro
DefaultValue=4

[2100sub1]
ParameterName=Input
DataType=0x0006
AccessType=ro
PDOMapping=1

[1400]
ParameterName=RPDO 1 communication parameter
ObjectType=0x9
SubNumber=3

[1400sub1]
ParameterName=COB-ID
DataType=0x0007
AccessType=rw
DefaultValue=$NODEID+0x200
"#;

    #[test]
    fn test_load_sample() {
        let od = load_str(SAMPLE, None).unwrap();
        assert_eq!(Some(10), od.node_id);
        assert_eq!(Some(250_000), od.bitrate);

        let device_type = od.variable(0x1000, 0).unwrap();
        assert_eq!(DataType::UInt32, device_type.data_type);
        assert_eq!(AccessType::Ro, device_type.access_type);
        assert_eq!(Some(Value::Unsigned(0x00020192)), device_type.default);

        let vendor = od.variable_by_name("Identity object.Vendor-ID").unwrap();
        assert_eq!(1, vendor.subindex);

        let velocity = od.variable(0x2000, 0).unwrap();
        assert!(velocity.pdo_mappable);
        assert_eq!(Some(-1000.0), velocity.min);
        assert_eq!(0.5, velocity.factor);

        // Arrays synthesize their members from the template
        let input3 = od.variable(0x2100, 3).unwrap();
        assert_eq!(DataType::UInt16, input3.data_type);

        // $NODEID defaults resolve against the commissioned node ID
        let cob = od.variable(0x1400, 1).unwrap();
        assert_eq!(Some(Value::Unsigned(0x20A)), cob.default);
    }

    #[test]
    fn test_node_id_override() {
        let od = load_str(SAMPLE, Some(5)).unwrap();
        assert_eq!(Some(5), od.node_id);
        let cob = od.variable(0x1400, 1).unwrap();
        assert_eq!(Some(Value::Unsigned(0x205)), cob.default);
    }

    #[test]
    fn test_invalid_ini_rejected() {
        assert!(matches!(
            load_str("[unterminated\nfoo=1", None),
            Err(LoadError::IniFormat { .. })
        ));
    }
}

//! Shared fixtures for the end-to-end test suites: an in-memory CAN bus
//! and scripted slave models.

pub mod mock_node;
pub mod sim_bus;

use ocan_common::objects::DataType;
use ocan_common::od::{ODRecord, ODVariable, ObjectDictionary};

/// Build a small object dictionary resembling a servo drive, with one
/// TPDO and one RPDO slot
pub fn demo_dictionary() -> ObjectDictionary {
    let mut od = ObjectDictionary::new();

    let mut device_type = ODVariable::new("Device type", 0x1000, 0, DataType::UInt32);
    device_type.access_type = ocan_common::objects::AccessType::Ro;
    od.add_variable(device_type).unwrap();

    od.add_variable(ODVariable::new(
        "Producer heartbeat time",
        0x1017,
        0,
        DataType::UInt16,
    ))
    .unwrap();

    let mut store = ODRecord::new("Store parameters", 0x1010);
    store.add_member(ODVariable::new(
        "Save all parameters",
        0x1010,
        1,
        DataType::UInt32,
    ));
    od.add_object(ocan_common::od::ODObject::Record(store)).unwrap();

    for (index, name) in [(0x1800, "TPDO 1 communication"), (0x1400, "RPDO 1 communication")] {
        let mut com = ODRecord::new(name, index);
        com.add_member(ODVariable::new("COB-ID", index, 1, DataType::UInt32));
        com.add_member(ODVariable::new("Transmission type", index, 2, DataType::UInt8));
        com.add_member(ODVariable::new("Inhibit time", index, 3, DataType::UInt16));
        com.add_member(ODVariable::new("Event timer", index, 5, DataType::UInt16));
        com.add_member(ODVariable::new("SYNC start value", index, 6, DataType::UInt8));
        od.add_object(ocan_common::od::ODObject::Record(com)).unwrap();
    }
    for (index, name) in [(0x1A00, "TPDO 1 mapping"), (0x1600, "RPDO 1 mapping")] {
        let mut map = ODRecord::new(name, index);
        map.add_member(ODVariable::new("Number of entries", index, 0, DataType::UInt8));
        for sub in 1..=8u8 {
            map.add_member(ODVariable::new(
                format!("Entry {sub}"),
                index,
                sub,
                DataType::UInt32,
            ));
        }
        od.add_object(ocan_common::od::ODObject::Record(map)).unwrap();
    }

    let mut statusword = ODVariable::new("Statusword", 0x6041, 0, DataType::UInt16);
    statusword.pdo_mappable = true;
    statusword.add_bit_definition("FAULT", vec![3]);
    od.add_variable(statusword).unwrap();

    let mut mode = ODVariable::new("Modes of operation", 0x6060, 0, DataType::Int8);
    mode.add_value_description(1, "Profile position");
    mode.add_value_description(3, "Profile velocity");
    od.add_variable(mode).unwrap();

    let mut profile_velocity = ODVariable::new("Profile velocity", 0x6081, 0, DataType::UInt16);
    profile_velocity.factor = 0.5;
    od.add_variable(profile_velocity).unwrap();

    let mut controlword = ODVariable::new("Controlword", 0x6040, 0, DataType::UInt16);
    controlword.pdo_mappable = true;
    od.add_variable(controlword).unwrap();

    let mut velocity = ODVariable::new("Velocity actual value", 0x606C, 0, DataType::Int32);
    velocity.pdo_mappable = true;
    od.add_variable(velocity).unwrap();

    let mut target = ODVariable::new("Target velocity", 0x60FF, 0, DataType::Int32);
    target.pdo_mappable = true;
    od.add_variable(target).unwrap();

    let mut name = ODVariable::new("Device name", 0x2000, 0, DataType::VisibleString);
    name.access_type = ocan_common::objects::AccessType::Rw;
    od.add_variable(name).unwrap();

    od
}

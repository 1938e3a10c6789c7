//! Object dictionary map
//!
//! Maps the symbolic names of a device's objects to their address, data type and access rights.
//! The map is built once, either from the built-in table of standard CiA 301/402 objects, from a
//! TOML object table, or both, and is read-only afterwards. Components hold `&ObjectEntry`
//! references obtained from [`ObjectDictionary::resolve`] for as long as the dictionary lives.
//!
//! # Naming
//!
//! - VAR objects are named by their parameter name, e.g. `"Controlword"`
//! - Sub objects of arrays and records are addressed as `"<object>[<sub>]"`, e.g.
//!   `"Profile jerk[1]"`
//! - Sub objects of records are also named as `"<object>.<sub name>"`, e.g.
//!   `"Identity Object.Serial number"`
//!
//! Lookup ignores case.
//!
//! # TOML object tables
//!
//! ```toml
//! [[objects]]
//! index = 0x2010
//! parameter_name = "Motor frequency bounds"
//! object_type = "array"
//! data_type = "uint32"
//! access_type = "rw"
//! array_size = 3
//!
//! [[objects]]
//! index = 0x2020
//! parameter_name = "LED Configuration"
//! object_type = "var"
//! data_type = "uint8"
//! access_type = "rw"
//! default_value = 7
//! ```
use std::collections::HashMap;

use serde::{de::Error, Deserialize};
use snafu::{ResultExt as _, Snafu};

use crate::objects::{AccessType, DataType, ObjectId};
use crate::value::{ObjectValue, ValueError};

/// Error returned when a name does not resolve to an object
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("Unknown object '{name}'"))]
pub struct UnknownObject {
    /// The name which was looked up
    pub name: String,
}

/// Error returned when loading an object table fails
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// An IO error occured while reading the file
    #[snafu(display("IO error: {source}"))]
    Io {
        /// The underlying IO error
        source: std::io::Error,
    },
    /// An error occured in the TOML parser
    #[snafu(display("Toml parse error: {source}"))]
    TomlParsing {
        /// The toml error which led to this error
        source: toml::de::Error,
    },
    /// Multiple objects defined with same index
    #[snafu(display("Multiple definitions for object with index 0x{id:x}"))]
    DuplicateObjectIds {
        /// index which was defined multiple times
        id: u16,
    },
    /// Duplicate sub objects defined on a record
    #[snafu(display("Multiple definitions of sub index {sub} on object 0x{index:x}"))]
    DuplicateSubObjects {
        /// Index of the record object containing duplicate subs
        index: u16,
        /// Duplicated sub index
        sub: u8,
    },
    /// Two sub objects resolve to the same name
    #[snafu(display("Multiple objects named '{name}'"))]
    DuplicateName {
        /// The duplicated name
        name: String,
    },
    /// A default value does not fit the data type of its object
    #[snafu(display("Invalid default value for 0x{index:x}sub{sub}: {source}"))]
    InvalidDefault {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
        /// Conversion error
        source: ValueError,
    },
}

/// One sub object of the dictionary
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    /// Object index
    pub index: u16,
    /// Sub index
    pub sub: u8,
    /// Full symbolic name
    pub name: String,
    /// Data type
    pub data_type: DataType,
    /// Access rights
    pub access_type: AccessType,
    /// Value the device uses after a parameter restore
    pub default_value: Option<ObjectValue>,
}

impl ObjectEntry {
    /// The address of this entry
    pub fn id(&self) -> ObjectId {
        ObjectId::new(self.index, self.sub)
    }
}

/// Read-only map from names and addresses to object entries
#[derive(Debug, Clone, Default)]
pub struct ObjectDictionary {
    entries: Vec<ObjectEntry>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<ObjectId, usize>,
}

impl ObjectDictionary {
    /// Look up an entry by its symbolic name
    pub fn resolve(&self, name: &str) -> Result<&ObjectEntry, UnknownObject> {
        self.by_name
            .get(&name.trim().to_lowercase())
            .map(|i| &self.entries[*i])
            .ok_or_else(|| UnknownObject {
                name: name.to_string(),
            })
    }

    /// Look up an entry by its address
    pub fn entry(&self, index: u16, sub: u8) -> Option<&ObjectEntry> {
        self.by_id
            .get(&ObjectId::new(index, sub))
            .map(|i| &self.entries[*i])
    }

    /// All entries, in definition order
    pub fn entries(&self) -> &[ObjectEntry] {
        &self.entries
    }

    /// Number of sub objects in the dictionary
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the dictionary holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The standard CiA 301 communication objects and CiA 402 drive objects
    pub fn cia402() -> Self {
        let mut dict = Self::default();
        for def in standard_objects() {
            // The built-in table is free of duplicates and invalid defaults; covered by tests
            let _ = dict.insert_definition(&def);
        }
        dict
    }

    /// Load an object table from a TOML file
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, LoadError> {
        Self::default().extend_from_file(path)
    }

    /// Load an object table from a TOML string
    pub fn load_from_str(s: &str) -> Result<Self, LoadError> {
        Self::default().extend_from_str(s)
    }

    /// Add the objects of a TOML file to this dictionary
    ///
    /// Consumes the dictionary, so extension is only possible before it is shared.
    pub fn extend_from_file(self, path: impl AsRef<std::path::Path>) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).context(IoSnafu)?;
        self.extend_from_str(&content)
    }

    /// Add the objects of a TOML string to this dictionary
    pub fn extend_from_str(mut self, s: &str) -> Result<Self, LoadError> {
        let table: ObjectTable = toml::from_str(s).context(TomlParsingSnafu)?;
        for def in &table.objects {
            self.insert_definition(def)?;
        }
        defmt_or_log::debug!("Object dictionary holds {} entries", self.entries.len());
        Ok(self)
    }

    fn insert_definition(&mut self, def: &ObjectDefinition) -> Result<(), LoadError> {
        if self.by_id.keys().any(|id| id.index == def.index) {
            return DuplicateObjectIdsSnafu { id: def.index }.fail();
        }
        let name = def.parameter_name.trim();
        match &def.object {
            Object::Var(var) => {
                self.insert_entry(
                    def.index,
                    0,
                    var.data_type.0,
                    var.access_type.0,
                    var.default_value.as_ref(),
                    &[name.to_string()],
                )?;
            }
            Object::Array(array) => {
                self.insert_entry(
                    def.index,
                    0,
                    DataType::UInt8,
                    AccessType::Const,
                    Some(&DefaultValue::Integer(array.array_size as i64)),
                    &[format!("{name}[0]")],
                )?;
                for i in 0..array.array_size {
                    let sub = (i + 1) as u8;
                    let default = array.default_value.as_ref().and_then(|d| d.get(i));
                    self.insert_entry(
                        def.index,
                        sub,
                        array.data_type.0,
                        array.access_type.0,
                        default,
                        &[format!("{name}[{sub}]")],
                    )?;
                }
            }
            Object::Record(record) => {
                let mut seen = Vec::new();
                for sub in &record.subs {
                    if seen.contains(&sub.sub_index) {
                        return DuplicateSubObjectsSnafu {
                            index: def.index,
                            sub: sub.sub_index,
                        }
                        .fail();
                    }
                    seen.push(sub.sub_index);
                }
                for sub in &record.subs {
                    let mut names = vec![format!("{name}[{}]", sub.sub_index)];
                    if !sub.parameter_name.is_empty() {
                        names.insert(0, format!("{name}.{}", sub.parameter_name.trim()));
                    }
                    self.insert_entry(
                        def.index,
                        sub.sub_index,
                        sub.data_type.0,
                        sub.access_type.0,
                        sub.default_value.as_ref(),
                        &names,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn insert_entry(
        &mut self,
        index: u16,
        sub: u8,
        data_type: DataType,
        access_type: AccessType,
        default: Option<&DefaultValue>,
        names: &[String],
    ) -> Result<(), LoadError> {
        let default_value = default
            .map(|d| d.to_value(data_type))
            .transpose()
            .context(InvalidDefaultSnafu { index, sub })?;
        for name in names {
            if self.by_name.contains_key(&name.to_lowercase()) {
                return DuplicateNameSnafu { name: name.clone() }.fail();
            }
        }
        let pos = self.entries.len();
        self.entries.push(ObjectEntry {
            index,
            sub,
            name: names[0].clone(),
            data_type,
            access_type,
            default_value,
        });
        for name in names {
            self.by_name.insert(name.to_lowercase(), pos);
        }
        self.by_id.insert(ObjectId::new(index, sub), pos);
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct ObjectTable {
    #[serde(default)]
    objects: Vec<ObjectDefinition>,
}

#[derive(Deserialize, Debug, Clone)]
struct ObjectDefinition {
    index: u16,
    parameter_name: String,
    #[serde(flatten)]
    object: Object,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "object_type", rename_all = "lowercase")]
enum Object {
    Var(VarDefinition),
    Array(ArrayDefinition),
    Record(RecordDefinition),
}

#[derive(Deserialize, Debug, Clone)]
struct VarDefinition {
    data_type: DataTypeDeser,
    #[serde(default)]
    access_type: AccessTypeDeser,
    #[serde(default)]
    default_value: Option<DefaultValue>,
}

#[derive(Deserialize, Debug, Clone)]
struct ArrayDefinition {
    data_type: DataTypeDeser,
    #[serde(default)]
    access_type: AccessTypeDeser,
    array_size: usize,
    #[serde(default)]
    default_value: Option<Vec<DefaultValue>>,
}

#[derive(Deserialize, Debug, Clone)]
struct RecordDefinition {
    #[serde(default)]
    subs: Vec<SubDefinition>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct SubDefinition {
    sub_index: u8,
    #[serde(default)]
    parameter_name: String,
    data_type: DataTypeDeser,
    #[serde(default)]
    access_type: AccessTypeDeser,
    #[serde(default)]
    default_value: Option<DefaultValue>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum DefaultValue {
    Integer(i64),
    Float(f64),
    String(String),
}

impl DefaultValue {
    fn to_value(&self, data_type: DataType) -> Result<ObjectValue, ValueError> {
        let value = match self {
            DefaultValue::Integer(v) => ObjectValue::I64(*v),
            DefaultValue::Float(v) => ObjectValue::F32(*v as f32),
            DefaultValue::String(s) => ObjectValue::String(s.clone()),
        };
        // Validate against the type, then store in the type's native form
        let raw = value.encode(data_type)?;
        ObjectValue::decode(data_type, &raw)
    }
}

/// A newtype on AccessType to implement deserialization
#[derive(Clone, Copy, Debug, Default)]
struct AccessTypeDeser(AccessType);

impl<'de> serde::Deserialize<'de> for AccessTypeDeser {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "ro" => Ok(AccessTypeDeser(AccessType::Ro)),
            "rw" => Ok(AccessTypeDeser(AccessType::Rw)),
            "rww" => Ok(AccessTypeDeser(AccessType::Rww)),
            "wo" => Ok(AccessTypeDeser(AccessType::Wo)),
            "const" => Ok(AccessTypeDeser(AccessType::Const)),
            _ => Err(D::Error::custom(format!(
                "Invalid access type: {} (allowed: 'ro', 'rw', 'rww', 'wo', or 'const')",
                s
            ))),
        }
    }
}

/// A newtype on DataType to implement deserialization
#[derive(Clone, Copy, Debug)]
struct DataTypeDeser(DataType);

impl<'de> serde::Deserialize<'de> for DataTypeDeser {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?.to_lowercase();
        let data_type = match s.as_str() {
            "boolean" => DataType::Boolean,
            "int8" => DataType::Int8,
            "int16" => DataType::Int16,
            "int32" => DataType::Int32,
            "int64" => DataType::Int64,
            "uint8" => DataType::UInt8,
            "uint16" => DataType::UInt16,
            "uint32" => DataType::UInt32,
            "uint64" => DataType::UInt64,
            "real32" => DataType::Real32,
            "visiblestring" | "visible_string" => DataType::VisibleString,
            _ => return Err(D::Error::custom(format!("Invalid data type: {}", s))),
        };
        Ok(DataTypeDeser(data_type))
    }
}

fn var(index: u16, name: &str, data_type: DataType, access: AccessType) -> ObjectDefinition {
    ObjectDefinition {
        index,
        parameter_name: name.to_string(),
        object: Object::Var(VarDefinition {
            data_type: DataTypeDeser(data_type),
            access_type: AccessTypeDeser(access),
            default_value: None,
        }),
    }
}

fn array(
    index: u16,
    name: &str,
    data_type: DataType,
    access: AccessType,
    size: usize,
) -> ObjectDefinition {
    ObjectDefinition {
        index,
        parameter_name: name.to_string(),
        object: Object::Array(ArrayDefinition {
            data_type: DataTypeDeser(data_type),
            access_type: AccessTypeDeser(access),
            array_size: size,
            default_value: None,
        }),
    }
}

fn record(index: u16, name: &str, subs: &[(u8, &str, DataType, AccessType)]) -> ObjectDefinition {
    ObjectDefinition {
        index,
        parameter_name: name.to_string(),
        object: Object::Record(RecordDefinition {
            subs: subs
                .iter()
                .map(|(sub_index, name, data_type, access)| SubDefinition {
                    sub_index: *sub_index,
                    parameter_name: name.to_string(),
                    data_type: DataTypeDeser(*data_type),
                    access_type: AccessTypeDeser(*access),
                    default_value: None,
                })
                .collect(),
        }),
    }
}

fn standard_objects() -> Vec<ObjectDefinition> {
    use AccessType::*;
    use DataType::*;

    let mut objects = vec![
        var(0x1000, "Device type", UInt32, Ro),
        var(0x1001, "Error register", UInt8, Ro),
        var(0x1008, "Manufacturer device name", VisibleString, Const),
        array(0x1010, "Store Parameter Field", UInt32, Rw, 1),
        array(0x1011, "Restore Default Parameters", UInt32, Rw, 1),
        var(0x1017, "Producer heartbeat time", UInt16, Rw),
        record(
            0x1018,
            "Identity Object",
            &[
                (0, "Number of entries", UInt8, Const),
                (1, "Vendor Id", UInt32, Ro),
                (2, "Product Code", UInt32, Ro),
                (3, "Revision number", UInt32, Ro),
                (4, "Serial number", UInt32, Ro),
            ],
        ),
        var(0x6040, "Controlword", UInt16, Rww),
        var(0x6041, "Statusword", UInt16, Ro),
        var(0x6060, "Mode of operation", Int8, Rw),
        var(0x6061, "Mode of operation display", Int8, Ro),
        var(0x6064, "Position Actual Value", Int32, Ro),
        var(0x6067, "Position window", UInt32, Rw),
        var(0x6068, "Position window time", UInt16, Rw),
        var(0x607A, "Target Position", Int32, Rww),
        var(0x607C, "Home offset", Int32, Rw),
        array(0x607D, "Software position limit", Int32, Rw, 2),
        var(0x607F, "Max profile velocity", UInt32, Rw),
        var(0x6081, "Profile velocity", UInt32, Rww),
        var(0x6083, "Profile acceleration", UInt32, Rww),
        var(0x6084, "Profile deceleration", UInt32, Rww),
        var(0x6098, "Homing method", Int8, Rw),
        array(0x6099, "Homing speeds", UInt32, Rw, 2),
        var(0x609A, "Homing acceleration", UInt32, Rw),
        array(0x60A4, "Profile jerk", UInt32, Rww, 1),
        var(0x60C5, "Max acceleration", UInt32, Rw),
    ];

    for n in 0..4u16 {
        let comm_subs = [
            (0, "Highest sub-index supported", UInt8, Const),
            (1, "COB-ID", UInt32, Rw),
            (2, "Transmission type", UInt8, Rw),
            (3, "Inhibit time", UInt16, Rw),
            (5, "Event timer", UInt16, Rw),
        ];
        let mut map_subs = vec![(0, "Number of mapped objects", UInt8, Rw)];
        let mapped: Vec<String> = (1..=8).map(|i| format!("Mapped object {i}")).collect();
        for (i, name) in mapped.iter().enumerate() {
            map_subs.push(((i + 1) as u8, name.as_str(), UInt32, Rw));
        }
        objects.push(record(
            0x1400 + n,
            &format!("RPDO{} communication parameter", n + 1),
            &comm_subs,
        ));
        objects.push(record(
            0x1600 + n,
            &format!("RPDO{} mapping parameter", n + 1),
            &map_subs,
        ));
        objects.push(record(
            0x1800 + n,
            &format!("TPDO{} communication parameter", n + 1),
            &comm_subs,
        ));
        objects.push(record(
            0x1A00 + n,
            &format!("TPDO{} mapping parameter", n + 1),
            &map_subs,
        ));
    }
    objects
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::assert_contains;

    #[test]
    fn test_standard_objects_load_cleanly() {
        let mut dict = ObjectDictionary::default();
        for def in standard_objects() {
            dict.insert_definition(&def).unwrap();
        }
        assert_eq!(dict.len(), ObjectDictionary::cia402().len());
    }

    #[test]
    fn test_resolve_names() {
        let dict = ObjectDictionary::cia402();
        let cw = dict.resolve("Controlword").unwrap();
        assert_eq!((0x6040, 0), (cw.index, cw.sub));
        assert_eq!(DataType::UInt16, cw.data_type);

        let jerk = dict.resolve("profile JERK[1]").unwrap();
        assert_eq!((0x60A4, 1), (jerk.index, jerk.sub));

        let serial = dict.resolve("Identity Object.Serial number").unwrap();
        assert_eq!((0x1018, 4), (serial.index, serial.sub));
        assert!(std::ptr::eq(serial, dict.resolve("Identity Object[4]").unwrap()));

        let map = dict.resolve("TPDO1 mapping parameter.Mapped object 2").unwrap();
        assert_eq!((0x1A00, 2), (map.index, map.sub));

        let err = dict.resolve("Flux capacitor").unwrap_err();
        assert_eq!("Unknown object 'Flux capacitor'", err.to_string());
    }

    #[test]
    fn test_extend_with_vendor_objects() {
        const TOML: &str = r#"
            [[objects]]
            index = 0x2010
            parameter_name = "Motor frequency bounds"
            object_type = "array"
            data_type = "uint32"
            access_type = "rw"
            array_size = 3
            default_value = [85000, 85000, 85000]

            [[objects]]
            index = 0x2020
            parameter_name = "LED Configuration"
            object_type = "var"
            data_type = "uint8"
            access_type = "rw"
            default_value = 7
        "#;
        let dict = ObjectDictionary::cia402().extend_from_str(TOML).unwrap();
        let bound = dict.resolve("Motor frequency bounds[3]").unwrap();
        assert_eq!(Some(ObjectValue::U32(85000)), bound.default_value);
        let led = dict.entry(0x2020, 0).unwrap();
        assert_eq!("LED Configuration", led.name);
        assert_eq!(Some(ObjectValue::U8(7)), led.default_value);
        assert!(dict.resolve("Controlword").is_ok());
    }

    #[test]
    fn test_duplicate_objects_errors() {
        const TOML: &str = r#"
            [[objects]]
            index = 0x6040
            parameter_name = "Another controlword"
            object_type = "var"
            data_type = "uint16"
            access_type = "rw"
        "#;

        let err = ObjectDictionary::cia402().extend_from_str(TOML).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateObjectIds { id: 0x6040 }));
        assert_contains!(
            "Multiple definitions for object with index 0x6040",
            err.to_string().as_str()
        );
    }

    #[test]
    fn test_duplicate_sub_object_errors() {
        const TOML: &str = r#"
            [[objects]]
            index = 0x2000
            parameter_name = "Duplicate"
            object_type = "record"
            [[objects.subs]]
            sub_index = 1
            parameter_name = "Test1"
            data_type = "int16"
            access_type = "rw"
            [[objects.subs]]
            sub_index = 1
            parameter_name = "RepeatedTest1"
            data_type = "int16"
            access_type = "rw"
        "#;

        let err = ObjectDictionary::load_from_str(TOML).unwrap_err();
        assert!(matches!(
            err,
            LoadError::DuplicateSubObjects {
                index: 0x2000,
                sub: 1
            }
        ));
    }

    #[test]
    fn test_invalid_default() {
        const TOML: &str = r#"
            [[objects]]
            index = 0x2000
            parameter_name = "Small"
            object_type = "var"
            data_type = "uint8"
            default_value = 300
        "#;
        let err = ObjectDictionary::load_from_str(TOML).unwrap_err();
        assert!(matches!(err, LoadError::InvalidDefault { index: 0x2000, .. }));
    }
}

//! Node configuration files
//!
//! A configuration lists values to write to a drive, addressed by name or by index, plus the
//! PDO settings to apply.
//!
//! ```toml
//! [[store]]
//! name = "Profile velocity"
//! value = 5000
//!
//! [[store]]
//! index = 0x6067
//! sub = 0
//! type = "u32"
//! value = 20
//!
//! [tpdo.0]
//! enabled = true
//! cob = 0x1A0
//! transmission_type = 254
//! mappings = [
//!     { index = 0x6041, sub = 0, size = 16 },
//!     { index = 0x6064, sub = 0, size = 32 },
//! ]
//! ```
use std::{collections::HashMap, path::Path};

use serde::{de, Deserialize, Deserializer};
use snafu::{ResultExt, Snafu};
use servocan_common::{objects::DataType, value::ObjectValue};

/// Error returned when loading node configuration files
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The file could not be read
    #[snafu(display("IO error loading {path}: {source:?}"))]
    Io {
        /// Path of the file
        path: String,
        /// The IO error
        source: std::io::Error,
    },
    /// The file is not a valid configuration
    #[snafu(display("Error parsing TOML: {source}"))]
    TomlDeserialization {
        /// The parser error
        source: toml::de::Error,
    },
}

/// The object a [`Store`] writes to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreTarget {
    /// Resolved through the object dictionary
    Name(String),
    /// A raw address, with the data type given in the file
    Address {
        /// Index of the object
        index: u16,
        /// Sub index
        sub: u8,
        /// Data type of the value
        data_type: DataType,
    },
}

/// Represents a store command to write a value to an object
#[derive(Clone, Debug, PartialEq)]
pub struct Store {
    /// The object to write
    pub target: StoreTarget,
    /// The value to be written to the sub object
    pub value: ObjectValue,
}

/// A node configuration
///
/// Represents a runtime configuration which can be loaded into a node
///
/// It describes the configuration of PDOs, and other arbitrary objects on the node
#[derive(Debug, Clone)]
pub struct NodeConfig(NodeConfigSerializer);

impl NodeConfig {
    /// Read a configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<NodeConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read a configuration from a string
    pub fn load_from_str(s: &str) -> Result<NodeConfig, ConfigError> {
        let raw_config: NodeConfigSerializer =
            toml::from_str(s).context(TomlDeserializationSnafu)?;

        Ok(NodeConfig(raw_config))
    }

    /// Get the transmit PDO configurations, keyed by 0 based PDO number
    pub fn tpdos(&self) -> &HashMap<usize, PdoConfig> {
        &self.0.tpdo
    }

    /// Get the receive PDO configurations, keyed by 0 based PDO number
    pub fn rpdos(&self) -> &HashMap<usize, PdoConfig> {
        &self.0.rpdo
    }

    /// Get the object writes, in file order
    pub fn stores(&self) -> &[Store] {
        &self.0.store
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeConfigSerializer {
    #[serde(deserialize_with = "deserialize_pdo_map", default)]
    pub tpdo: HashMap<usize, PdoConfig>,
    #[serde(deserialize_with = "deserialize_pdo_map", default)]
    pub rpdo: HashMap<usize, PdoConfig>,
    #[serde(default, deserialize_with = "deserialize_store")]
    pub store: Vec<Store>,
}

/// Represents the configuration parameters for a single PDO
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdoConfig {
    /// The COB ID this PDO will use to send/receive
    pub cob: u32,
    /// The PDO is active
    pub enabled: bool,
    /// List of mapping specifying what sub objects are mapped to this PDO
    pub mappings: Vec<PdoMapping>,
    /// Specifies when a PDO is sent or latched
    ///
    /// - 0: Sent in response to sync, but only after an application specific event (e.g. it may be
    ///   sent when the value changes, but not when it has not)
    /// - 1 - 240: Sent in response to every Nth sync
    /// - 254: Event driven (application to send it whenever it wants)
    pub transmission_type: u8,
    /// Minimum time between two transmissions, in multiples of 100us
    #[serde(default)]
    pub inhibit_time: Option<u16>,
    /// Period of event driven transmission in ms
    #[serde(default)]
    pub event_timer: Option<u16>,
}

/// Represents a PDO mapping
///
/// Each mapping specifies one sub-object to be included in the PDO.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdoMapping {
    /// The object index
    pub index: u16,
    /// The object sub index
    pub sub: u8,
    /// The size of the object to map, in **bits**
    pub size: u8,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StoreType {
    Bool,
    U64,
    U32,
    U16,
    U8,
    I64,
    I32,
    I16,
    I8,
    F32,
    String,
}

impl From<StoreType> for DataType {
    fn from(value: StoreType) -> Self {
        match value {
            StoreType::Bool => DataType::Boolean,
            StoreType::U64 => DataType::UInt64,
            StoreType::U32 => DataType::UInt32,
            StoreType::U16 => DataType::UInt16,
            StoreType::U8 => DataType::UInt8,
            StoreType::I64 => DataType::Int64,
            StoreType::I32 => DataType::Int32,
            StoreType::I16 => DataType::Int16,
            StoreType::I8 => DataType::Int8,
            StoreType::F32 => DataType::Real32,
            StoreType::String => DataType::VisibleString,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreSerializer {
    pub name: Option<String>,
    pub index: Option<u16>,
    pub sub: Option<u8>,
    pub value: toml::Value,
    #[serde(rename = "type")]
    pub ty: Option<StoreType>,
}

fn toml_to_value<E: de::Error>(value: &toml::Value) -> Result<ObjectValue, E> {
    match value {
        toml::Value::Integer(v) => Ok(ObjectValue::I64(*v)),
        toml::Value::Float(v) => Ok(ObjectValue::F32(*v as f32)),
        toml::Value::Boolean(v) => Ok(ObjectValue::Bool(*v)),
        toml::Value::String(s) => Ok(ObjectValue::String(s.clone())),
        other => Err(de::Error::invalid_type(
            de::Unexpected::Str(&other.to_string()),
            &"an integer, float, boolean or string",
        )),
    }
}

/// Convert a file value to the exact variant of `data_type`, checking its range
fn typed_value<E: de::Error>(value: ObjectValue, data_type: DataType) -> Result<ObjectValue, E> {
    let raw = value
        .encode(data_type)
        .map_err(|e| de::Error::custom(format!("invalid store value: {e}")))?;
    ObjectValue::decode(data_type, &raw)
        .map_err(|e| de::Error::custom(format!("invalid store value: {e}")))
}

fn deserialize_store<'de, D>(deserializer: D) -> Result<Vec<Store>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw_store = Vec::<StoreSerializer>::deserialize(deserializer)?;

    raw_store
        .into_iter()
        .map(|raw| {
            let value = toml_to_value(&raw.value)?;
            match (raw.name, raw.index, raw.sub, raw.ty) {
                (Some(name), None, None, ty) => {
                    // Named stores take their data type from the dictionary when applied
                    let value = match ty {
                        Some(ty) => typed_value(value, ty.into())?,
                        None => value,
                    };
                    Ok(Store {
                        target: StoreTarget::Name(name),
                        value,
                    })
                }
                (None, Some(index), Some(sub), Some(ty)) => {
                    let data_type = ty.into();
                    Ok(Store {
                        target: StoreTarget::Address {
                            index,
                            sub,
                            data_type,
                        },
                        value: typed_value(value, data_type)?,
                    })
                }
                (None, Some(_), Some(_), None) => Err(de::Error::missing_field("type")),
                _ => Err(de::Error::custom(
                    "a store needs either `name`, or `index`, `sub` and `type`",
                )),
            }
        })
        .collect()
}

fn deserialize_pdo_map<'de, D>(deserializer: D) -> Result<HashMap<usize, PdoConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let str_map = HashMap::<String, PdoConfig>::deserialize(deserializer)?;
    let original_len = str_map.len();
    let data = str_map
        .into_iter()
        .map(|(str_key, value)| match str_key.parse::<usize>() {
            Ok(int_key) if int_key < 4 => Ok((int_key, value)),
            _ => Err(de::Error::invalid_value(
                de::Unexpected::Str(&str_key),
                &"a PDO number in 0..4",
            )),
        })
        .collect::<Result<HashMap<_, _>, _>>()?;
    // multiple strings could parse to the same int, e.g "0" and "00"
    if data.len() < original_len {
        return Err(de::Error::custom("detected duplicate integer key"));
    }
    Ok(data)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_node_config_parse() {
        let str = r#"
        [tpdo.0]
        enabled = true
        cob = 0x1A0
        transmission_type = 254
        event_timer = 10
        mappings = [
            { index=0x6041, sub=0, size=16 },
            { index=0x6064, sub=0, size=32 },
        ]

        [[store]]
        type = "u32"
        value = 12
        index = 0x6067
        sub = 0

        [[store]]
        name = "Profile velocity"
        value = 5000
        "#;

        let config = match NodeConfig::load_from_str(str) {
            Ok(config) => config,
            Err(e) => {
                println!("{}", e);
                panic!("Failed to parse config");
            }
        };

        assert_eq!(1, config.tpdos().len());
        assert_eq!(Some(10), config.tpdos()[&0].event_timer);
        assert_eq!(2, config.stores().len());
        assert_eq!(
            Store {
                target: StoreTarget::Address {
                    index: 0x6067,
                    sub: 0,
                    data_type: DataType::UInt32
                },
                value: ObjectValue::U32(12),
            },
            config.stores()[0]
        );
        assert_eq!(
            StoreTarget::Name("Profile velocity".into()),
            config.stores()[1].target
        );
        assert_eq!(ObjectValue::I64(5000), config.stores()[1].value);
    }

    #[test]
    fn test_out_of_range_integer() {
        let str = r#"
        [[store]]
        type = "u8"
        value = 256
        index = 0x1000
        sub = 0
        "#;

        let result = NodeConfig::load_from_str(str);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("out of range"));
    }

    #[test]
    fn test_addressed_store_needs_type() {
        let str = r#"
        [[store]]
        value = 1
        index = 0x6081
        sub = 0
        "#;
        let err = NodeConfig::load_from_str(str).unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn test_pdo_number_out_of_range() {
        let str = r#"
        [rpdo.4]
        enabled = false
        cob = 0x220
        transmission_type = 254
        mappings = []
        "#;
        assert!(NodeConfig::load_from_str(str).is_err());
    }
}

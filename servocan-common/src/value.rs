//! Typed object values and their wire encoding
//!
//! All multi-byte values are little endian on the bus.
use snafu::Snafu;

use crate::objects::DataType;

/// A value read from or written to a sub object
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum ObjectValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    String(String),
}

/// Error converting between [`ObjectValue`] and raw bytes
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum ValueError {
    /// The value does not fit the object's data type
    #[snafu(display("Value {value} is out of range for {data_type:?}"))]
    OutOfRange {
        /// Display form of the value
        value: String,
        /// The target type
        data_type: DataType,
    },
    /// The value kind cannot be stored in the object's data type
    #[snafu(display("Cannot store {value:?} in an object of type {data_type:?}"))]
    TypeMismatch {
        /// The offending value
        value: ObjectValue,
        /// The target type
        data_type: DataType,
    },
    /// The raw data length does not match the data type
    #[snafu(display("Expected {expected} bytes for {data_type:?}, got {actual}"))]
    WrongLength {
        /// The data type being decoded
        data_type: DataType,
        /// Size of the data type
        expected: usize,
        /// Number of bytes received
        actual: usize,
    },
    /// String data is not valid UTF-8
    #[snafu(display("String object does not hold valid UTF-8"))]
    InvalidString,
}

impl ObjectValue {
    fn as_integer(&self) -> Option<i128> {
        match *self {
            ObjectValue::Bool(v) => Some(v as i128),
            ObjectValue::U8(v) => Some(v as i128),
            ObjectValue::U16(v) => Some(v as i128),
            ObjectValue::U32(v) => Some(v as i128),
            ObjectValue::U64(v) => Some(v as i128),
            ObjectValue::I8(v) => Some(v as i128),
            ObjectValue::I16(v) => Some(v as i128),
            ObjectValue::I32(v) => Some(v as i128),
            ObjectValue::I64(v) => Some(v as i128),
            ObjectValue::F32(_) | ObjectValue::String(_) => None,
        }
    }

    /// Get the value as an i64, if it is an integer which fits
    pub fn as_i64(&self) -> Option<i64> {
        self.as_integer().and_then(|v| i64::try_from(v).ok())
    }

    /// Get the value as a u64, if it is a non-negative integer
    pub fn as_u64(&self) -> Option<u64> {
        self.as_integer().and_then(|v| u64::try_from(v).ok())
    }

    /// Get the value as a string slice, if it is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ObjectValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to the byte representation of `data_type`
    ///
    /// Integer values of any width are accepted as long as they fit the target type.
    pub fn encode(&self, data_type: DataType) -> Result<Vec<u8>, ValueError> {
        if let DataType::VisibleString = data_type {
            return match self {
                ObjectValue::String(s) => Ok(s.as_bytes().to_vec()),
                _ => TypeMismatchSnafu {
                    value: self.clone(),
                    data_type,
                }
                .fail(),
            };
        }
        if let DataType::Real32 = data_type {
            return match self {
                ObjectValue::F32(v) => Ok(v.to_le_bytes().to_vec()),
                _ => match self.as_integer() {
                    Some(v) => Ok((v as f32).to_le_bytes().to_vec()),
                    None => TypeMismatchSnafu {
                        value: self.clone(),
                        data_type,
                    }
                    .fail(),
                },
            };
        }

        let Some(v) = self.as_integer() else {
            return TypeMismatchSnafu {
                value: self.clone(),
                data_type,
            }
            .fail();
        };
        let out_of_range = || {
            OutOfRangeSnafu {
                value: v.to_string(),
                data_type,
            }
            .build()
        };
        let bytes = match data_type {
            DataType::Boolean => match v {
                0 | 1 => vec![v as u8],
                _ => return Err(out_of_range()),
            },
            DataType::UInt8 => vec![u8::try_from(v).map_err(|_| out_of_range())?],
            DataType::UInt16 => u16::try_from(v)
                .map_err(|_| out_of_range())?
                .to_le_bytes()
                .to_vec(),
            DataType::UInt32 => u32::try_from(v)
                .map_err(|_| out_of_range())?
                .to_le_bytes()
                .to_vec(),
            DataType::UInt64 => u64::try_from(v)
                .map_err(|_| out_of_range())?
                .to_le_bytes()
                .to_vec(),
            DataType::Int8 => i8::try_from(v)
                .map_err(|_| out_of_range())?
                .to_le_bytes()
                .to_vec(),
            DataType::Int16 => i16::try_from(v)
                .map_err(|_| out_of_range())?
                .to_le_bytes()
                .to_vec(),
            DataType::Int32 => i32::try_from(v)
                .map_err(|_| out_of_range())?
                .to_le_bytes()
                .to_vec(),
            DataType::Int64 => i64::try_from(v)
                .map_err(|_| out_of_range())?
                .to_le_bytes()
                .to_vec(),
            DataType::Real32 | DataType::VisibleString => unreachable!(),
        };
        Ok(bytes)
    }

    /// Interpret raw object data as `data_type`
    pub fn decode(data_type: DataType, data: &[u8]) -> Result<ObjectValue, ValueError> {
        if let DataType::VisibleString = data_type {
            // Devices may pad strings with trailing NULs
            let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
            let s = core::str::from_utf8(&data[..end]).map_err(|_| ValueError::InvalidString)?;
            return Ok(ObjectValue::String(s.to_string()));
        }
        let expected = data_type.size().unwrap_or(0);
        if data.len() != expected {
            return WrongLengthSnafu {
                data_type,
                expected,
                actual: data.len(),
            }
            .fail();
        }
        let mut buf = [0u8; 8];
        buf[..expected].copy_from_slice(data);
        Ok(match data_type {
            DataType::Boolean => ObjectValue::Bool(buf[0] != 0),
            DataType::UInt8 => ObjectValue::U8(buf[0]),
            DataType::UInt16 => ObjectValue::U16(u16::from_le_bytes([buf[0], buf[1]])),
            DataType::UInt32 => {
                ObjectValue::U32(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
            }
            DataType::UInt64 => ObjectValue::U64(u64::from_le_bytes(buf)),
            DataType::Int8 => ObjectValue::I8(buf[0] as i8),
            DataType::Int16 => ObjectValue::I16(i16::from_le_bytes([buf[0], buf[1]])),
            DataType::Int32 => {
                ObjectValue::I32(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
            }
            DataType::Int64 => ObjectValue::I64(i64::from_le_bytes(buf)),
            DataType::Real32 => {
                ObjectValue::F32(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
            }
            DataType::VisibleString => unreachable!(),
        })
    }
}

impl core::fmt::Display for ObjectValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ObjectValue::Bool(v) => write!(f, "{v}"),
            ObjectValue::U8(v) => write!(f, "{v}"),
            ObjectValue::U16(v) => write!(f, "{v}"),
            ObjectValue::U32(v) => write!(f, "{v}"),
            ObjectValue::U64(v) => write!(f, "{v}"),
            ObjectValue::I8(v) => write!(f, "{v}"),
            ObjectValue::I16(v) => write!(f, "{v}"),
            ObjectValue::I32(v) => write!(f, "{v}"),
            ObjectValue::I64(v) => write!(f, "{v}"),
            ObjectValue::F32(v) => write!(f, "{v}"),
            ObjectValue::String(v) => write!(f, "'{v}'"),
        }
    }
}

macro_rules! impl_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for ObjectValue {
            fn from(value: $ty) -> Self {
                ObjectValue::$variant(value)
            }
        }
    };
}

impl_from!(bool, Bool);
impl_from!(u8, U8);
impl_from!(u16, U16);
impl_from!(u32, U32);
impl_from!(u64, U64);
impl_from!(i8, I8);
impl_from!(i16, I16);
impl_from!(i32, I32);
impl_from!(i64, I64);
impl_from!(f32, F32);
impl_from!(String, String);

impl From<&str> for ObjectValue {
    fn from(value: &str) -> Self {
        ObjectValue::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_width_conversion() {
        assert_eq!(
            vec![0x10, 0x27],
            ObjectValue::I32(10000).encode(DataType::UInt16).unwrap()
        );
        assert_eq!(
            vec![0xF0, 0xD8, 0xFF, 0xFF],
            ObjectValue::I64(-10000).encode(DataType::Int32).unwrap()
        );
    }

    #[test]
    fn test_out_of_range() {
        let err = ObjectValue::U32(70000).encode(DataType::UInt16).unwrap_err();
        assert!(matches!(err, ValueError::OutOfRange { .. }));
        let err = ObjectValue::I8(-1).encode(DataType::UInt32).unwrap_err();
        assert!(matches!(err, ValueError::OutOfRange { .. }));
    }

    #[test]
    fn test_string_mismatch() {
        let err = ObjectValue::from("save").encode(DataType::UInt32).unwrap_err();
        assert!(matches!(err, ValueError::TypeMismatch { .. }));
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            ObjectValue::I32(-5),
            ObjectValue::decode(DataType::Int32, &(-5i32).to_le_bytes()).unwrap()
        );
        assert_eq!(
            ObjectValue::String("XLA".into()),
            ObjectValue::decode(DataType::VisibleString, b"XLA\0\0").unwrap()
        );
        assert!(matches!(
            ObjectValue::decode(DataType::UInt16, &[1, 2, 3]),
            Err(ValueError::WrongLength {
                expected: 2,
                actual: 3,
                ..
            })
        ));
    }
}

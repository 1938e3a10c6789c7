//! Object addressing and type definitions
//!

/// The address of a sub object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    /// Object index
    pub index: u16,
    /// Sub index
    pub sub: u8,
}

impl ObjectId {
    /// Create an object address
    pub const fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }

    /// Pack into the 32-bit layout used by PDO mapping entries, with the size in bits
    pub fn to_mapping(&self, size_bits: u8) -> u32 {
        (self.index as u32) << 16 | (self.sub as u32) << 8 | size_bits as u32
    }

    /// Unpack a PDO mapping entry into the address and size in bits
    pub fn from_mapping(raw: u32) -> (Self, u8) {
        (
            Self {
                index: (raw >> 16) as u16,
                sub: (raw >> 8) as u8,
            },
            raw as u8,
        )
    }
}

impl core::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:04X}sub{}", self.index, self.sub)
    }
}

/// Access type of a sub object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write, only while the drive is not running
    Rw,
    /// Read-write, also while the drive is running
    Rww,
    /// Read-only, and never changed, even internally by the device
    Const,
}

impl AccessType {
    /// Returns true if an object with this access type can be read
    pub fn is_readable(&self) -> bool {
        matches!(
            self,
            AccessType::Ro | AccessType::Rw | AccessType::Rww | AccessType::Const
        )
    }

    /// Returns true if an object with this access type can be written
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Rw | AccessType::Rww | AccessType::Wo)
    }
}

/// The type of data stored in a sub object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DataType {
    Boolean,
    Int8,
    Int16,
    #[default]
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Real32,
    VisibleString,
}

impl DataType {
    /// The CANopen data type code
    pub fn code(&self) -> u16 {
        match self {
            DataType::Boolean => 0x1,
            DataType::Int8 => 0x2,
            DataType::Int16 => 0x3,
            DataType::Int32 => 0x4,
            DataType::UInt8 => 0x5,
            DataType::UInt16 => 0x6,
            DataType::UInt32 => 0x7,
            DataType::Real32 => 0x8,
            DataType::VisibleString => 0x9,
            DataType::Int64 => 0x15,
            DataType::UInt64 => 0x1B,
        }
    }

    /// Look up a type by its CANopen data type code
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x1 => Some(DataType::Boolean),
            0x2 => Some(DataType::Int8),
            0x3 => Some(DataType::Int16),
            0x4 => Some(DataType::Int32),
            0x5 => Some(DataType::UInt8),
            0x6 => Some(DataType::UInt16),
            0x7 => Some(DataType::UInt32),
            0x8 => Some(DataType::Real32),
            0x9 => Some(DataType::VisibleString),
            0x15 => Some(DataType::Int64),
            0x1B => Some(DataType::UInt64),
            _ => None,
        }
    }

    /// Size in bytes, or None for strings
    pub fn size(&self) -> Option<usize> {
        match self {
            DataType::Boolean | DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Real32 => Some(4),
            DataType::Int64 | DataType::UInt64 => Some(8),
            DataType::VisibleString => None,
        }
    }

    /// Returns true for the signed integer types
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        )
    }

    /// Returns true if data type is a string
    pub fn is_str(&self) -> bool {
        matches!(self, DataType::VisibleString)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_entry() {
        let id = ObjectId::new(0x6041, 0);
        let raw = id.to_mapping(16);
        assert_eq!(0x6041_0010, raw);
        assert_eq!((id, 16), ObjectId::from_mapping(raw));
    }

    #[test]
    fn test_access() {
        assert!(AccessType::Rww.is_writable());
        assert!(AccessType::Rww.is_readable());
        assert!(!AccessType::Wo.is_readable());
        assert!(!AccessType::Const.is_writable());
    }
}

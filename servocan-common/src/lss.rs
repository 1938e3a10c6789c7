//! Layer Setting Services (LSS) frames
//!
//! LSS is used to assign node IDs (and bit timings) to devices which are not yet configured. The
//! master sends requests on 0x7E5 and slaves answer on 0x7E4. All frames are 8 bytes, with the
//! command specifier in the first byte.
use crate::messages::{CanMessage, MessageError, LSS_REQ_ID, LSS_RESP_ID};

/// LSS command specifier values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum LssCommandSpecifier {
    SwitchModeGlobal = 0x04,
    ConfigureNodeId = 0x11,
    ConfigureBitTiming = 0x13,
    ActivateBitTiming = 0x15,
    StoreConfiguration = 0x17,
    SwitchStateVendor = 0x40,
    SwitchStateProduct = 0x41,
    SwitchStateRevision = 0x42,
    SwitchStateSerial = 0x43,
    SwitchStateResponse = 0x44,
    IdentifySlave = 0x4F,
    FastScan = 0x51,
    InquireVendor = 0x5A,
    InquireProduct = 0x5B,
    InquireRevision = 0x5C,
    InquireSerial = 0x5D,
    InquireNodeId = 0x5E,
}

/// Special value for fastscan bit_check field
///
/// A fast scan with this bit_check resets the scan on all unconfigured slaves, and any of them
/// will answer with IdentifySlave.
pub const LSS_FASTSCAN_CONFIRM: u8 = 0x80;

impl LssCommandSpecifier {
    /// Decode a command specifier byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        use LssCommandSpecifier::*;
        match b {
            0x04 => Ok(SwitchModeGlobal),
            0x11 => Ok(ConfigureNodeId),
            0x13 => Ok(ConfigureBitTiming),
            0x15 => Ok(ActivateBitTiming),
            0x17 => Ok(StoreConfiguration),
            0x40 => Ok(SwitchStateVendor),
            0x41 => Ok(SwitchStateProduct),
            0x42 => Ok(SwitchStateRevision),
            0x43 => Ok(SwitchStateSerial),
            0x44 => Ok(SwitchStateResponse),
            0x4F => Ok(IdentifySlave),
            0x51 => Ok(FastScan),
            0x5A => Ok(InquireVendor),
            0x5B => Ok(InquireProduct),
            0x5C => Ok(InquireRevision),
            0x5D => Ok(InquireSerial),
            0x5E => Ok(InquireNodeId),
            _ => Err(MessageError::UnexpectedLssCommand { value: b }),
        }
    }
}

/// A request sent by the LSS master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LssRequest {
    /// Put every slave into waiting (0) or configuration (1) state
    SwitchModeGlobal {
        /// The requested [`LssState`]
        mode: u8,
    },
    /// Set the pending node ID of the slave in configuration state
    ConfigureNodeId {
        /// The new node ID, or 255 to unconfigure
        node_id: u8,
    },
    /// Select a new bit timing on the slave in configuration state
    ConfigureBitTiming {
        /// Baudrate table, 0 for the standard table
        ///
        /// The standard table is:
        /// - 0: 1MBit/s
        /// - 1: 800kBit/s
        /// - 2: 500kBit/s
        /// - 3: 250kBit/s
        /// - 4: 125kBit/s
        /// - 6: 50kBit/s
        /// - 7: 20kBit/s
        /// - 8: 10kBit/s
        table: u8,
        /// Entry in the table
        index: u8,
    },
    /// Activate the configured bit timing on all slaves
    ActivateBitTiming {
        /// Delay in ms before switching
        delay: u16,
    },
    /// Persist the pending configuration of the slave in configuration state
    StoreConfiguration,
    /// Selective switch, vendor ID part
    SwitchStateVendor {
        /// Vendor ID to match
        vendor_id: u32,
    },
    /// Selective switch, product code part
    SwitchStateProduct {
        /// Product code to match
        product_code: u32,
    },
    /// Selective switch, revision part
    SwitchStateRevision {
        /// Revision to match
        revision: u32,
    },
    /// Selective switch, serial part. The matching slave answers
    SwitchStateSerial {
        /// Serial number to match
        serial: u32,
    },
    /// One step of the fast scan binary search
    FastScan {
        /// Identity value being compared
        id: u32,
        /// Number of low bits to ignore, or [`LSS_FASTSCAN_CONFIRM`]
        bit_check: u8,
        /// The identity part being checked
        ///
        /// 0 - Vendor ID, 1 - Product Code, 2 - Revision, 3 - Serial Number
        sub: u8,
        /// The identity part to check on the next request
        next: u8,
    },
    /// Ask the slave in configuration state for its vendor ID
    InquireVendor,
    /// Ask the slave in configuration state for its product code
    InquireProduct,
    /// Ask the slave in configuration state for its revision
    InquireRevision,
    /// Ask the slave in configuration state for its serial number
    InquireSerial,
    /// Ask the slave in configuration state for its node ID
    InquireNodeId,
}

fn le_u32(value: &[u8]) -> Result<u32, MessageError> {
    if value.len() < 5 {
        return Err(MessageError::MessageTooShort);
    }
    Ok(u32::from_le_bytes([value[1], value[2], value[3], value[4]]))
}

fn byte_at(value: &[u8], i: usize) -> Result<u8, MessageError> {
    value.get(i).copied().ok_or(MessageError::MessageTooShort)
}

impl TryFrom<&[u8]> for LssRequest {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let cs = LssCommandSpecifier::from_byte(byte_at(value, 0)?)?;
        use LssCommandSpecifier as Cs;
        match cs {
            Cs::SwitchModeGlobal => Ok(Self::SwitchModeGlobal {
                mode: byte_at(value, 1)?,
            }),
            Cs::ConfigureNodeId => Ok(Self::ConfigureNodeId {
                node_id: byte_at(value, 1)?,
            }),
            Cs::ConfigureBitTiming => Ok(Self::ConfigureBitTiming {
                table: byte_at(value, 1)?,
                index: byte_at(value, 2)?,
            }),
            Cs::ActivateBitTiming => Ok(Self::ActivateBitTiming {
                delay: u16::from_le_bytes([byte_at(value, 1)?, byte_at(value, 2)?]),
            }),
            Cs::StoreConfiguration => Ok(Self::StoreConfiguration),
            Cs::SwitchStateVendor => Ok(Self::SwitchStateVendor {
                vendor_id: le_u32(value)?,
            }),
            Cs::SwitchStateProduct => Ok(Self::SwitchStateProduct {
                product_code: le_u32(value)?,
            }),
            Cs::SwitchStateRevision => Ok(Self::SwitchStateRevision {
                revision: le_u32(value)?,
            }),
            Cs::SwitchStateSerial => Ok(Self::SwitchStateSerial {
                serial: le_u32(value)?,
            }),
            Cs::FastScan => {
                if value.len() < 8 {
                    return Err(MessageError::MessageTooShort);
                }
                Ok(Self::FastScan {
                    id: le_u32(value)?,
                    bit_check: value[5],
                    sub: value[6],
                    next: value[7],
                })
            }
            Cs::InquireVendor => Ok(Self::InquireVendor),
            Cs::InquireProduct => Ok(Self::InquireProduct),
            Cs::InquireRevision => Ok(Self::InquireRevision),
            Cs::InquireSerial => Ok(Self::InquireSerial),
            Cs::InquireNodeId => Ok(Self::InquireNodeId),
            Cs::SwitchStateResponse | Cs::IdentifySlave => {
                Err(MessageError::UnexpectedLssCommand { value: cs as u8 })
            }
        }
    }
}

impl From<LssRequest> for CanMessage {
    fn from(req: LssRequest) -> Self {
        use LssCommandSpecifier as Cs;
        let mut data = [0u8; 8];
        match req {
            LssRequest::SwitchModeGlobal { mode } => {
                data[0] = Cs::SwitchModeGlobal as u8;
                data[1] = mode;
            }
            LssRequest::ConfigureNodeId { node_id } => {
                data[0] = Cs::ConfigureNodeId as u8;
                data[1] = node_id;
            }
            LssRequest::ConfigureBitTiming { table, index } => {
                data[0] = Cs::ConfigureBitTiming as u8;
                data[1] = table;
                data[2] = index;
            }
            LssRequest::ActivateBitTiming { delay } => {
                data[0] = Cs::ActivateBitTiming as u8;
                data[1..3].copy_from_slice(&delay.to_le_bytes());
            }
            LssRequest::StoreConfiguration => data[0] = Cs::StoreConfiguration as u8,
            LssRequest::SwitchStateVendor { vendor_id } => {
                data[0] = Cs::SwitchStateVendor as u8;
                data[1..5].copy_from_slice(&vendor_id.to_le_bytes());
            }
            LssRequest::SwitchStateProduct { product_code } => {
                data[0] = Cs::SwitchStateProduct as u8;
                data[1..5].copy_from_slice(&product_code.to_le_bytes());
            }
            LssRequest::SwitchStateRevision { revision } => {
                data[0] = Cs::SwitchStateRevision as u8;
                data[1..5].copy_from_slice(&revision.to_le_bytes());
            }
            LssRequest::SwitchStateSerial { serial } => {
                data[0] = Cs::SwitchStateSerial as u8;
                data[1..5].copy_from_slice(&serial.to_le_bytes());
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => {
                data[0] = Cs::FastScan as u8;
                data[1..5].copy_from_slice(&id.to_le_bytes());
                data[5] = bit_check;
                data[6] = sub;
                data[7] = next;
            }
            LssRequest::InquireVendor => data[0] = Cs::InquireVendor as u8,
            LssRequest::InquireProduct => data[0] = Cs::InquireProduct as u8,
            LssRequest::InquireRevision => data[0] = Cs::InquireRevision as u8,
            LssRequest::InquireSerial => data[0] = Cs::InquireSerial as u8,
            LssRequest::InquireNodeId => data[0] = Cs::InquireNodeId as u8,
        }
        CanMessage::new(LSS_REQ_ID, &data)
    }
}

/// A response sent by an LSS slave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LssResponse {
    /// Answer to a fast scan step which matched the slave
    IdentifySlave,
    /// Answer to a completed selective switch
    SwitchStateResponse,
    /// Result of ConfigureNodeId
    ConfigureNodeIdAck {
        /// 0 on success, 1 for an invalid node ID, 255 for manufacturer error
        error: u8,
        /// Manufacturer specific error, valid when error is 255
        spec_error: u8,
    },
    /// Result of ConfigureBitTiming
    ConfigureBitTimingAck {
        /// 0 on success, 1 for unsupported bit timing, 255 for manufacturer error
        error: u8,
        /// Manufacturer specific error, valid when error is 255
        spec_error: u8,
    },
    /// Result of StoreConfiguration
    StoreConfigurationAck {
        /// 0 on success, 1 when storing is not supported, 255 for manufacturer error
        error: u8,
        /// Manufacturer specific error, valid when error is 255
        spec_error: u8,
    },
    /// Answer to InquireVendor
    InquireVendorAck {
        /// Vendor ID
        vendor_id: u32,
    },
    /// Answer to InquireProduct
    InquireProductAck {
        /// Product code
        product_code: u32,
    },
    /// Answer to InquireRevision
    InquireRevisionAck {
        /// Revision
        revision: u32,
    },
    /// Answer to InquireSerial
    InquireSerialAck {
        /// Serial number
        serial: u32,
    },
    /// Answer to InquireNodeId
    InquireNodeIdAck {
        /// Active node ID, 255 when unconfigured
        node_id: u8,
    },
}

impl TryFrom<&[u8]> for LssResponse {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let cs = LssCommandSpecifier::from_byte(byte_at(value, 0)?)?;
        use LssCommandSpecifier as Cs;
        match cs {
            Cs::IdentifySlave => Ok(Self::IdentifySlave),
            Cs::SwitchStateResponse => Ok(Self::SwitchStateResponse),
            Cs::ConfigureNodeId => Ok(Self::ConfigureNodeIdAck {
                error: byte_at(value, 1)?,
                spec_error: byte_at(value, 2)?,
            }),
            Cs::ConfigureBitTiming => Ok(Self::ConfigureBitTimingAck {
                error: byte_at(value, 1)?,
                spec_error: byte_at(value, 2)?,
            }),
            Cs::StoreConfiguration => Ok(Self::StoreConfigurationAck {
                error: byte_at(value, 1)?,
                spec_error: byte_at(value, 2)?,
            }),
            Cs::InquireVendor => Ok(Self::InquireVendorAck {
                vendor_id: le_u32(value)?,
            }),
            Cs::InquireProduct => Ok(Self::InquireProductAck {
                product_code: le_u32(value)?,
            }),
            Cs::InquireRevision => Ok(Self::InquireRevisionAck {
                revision: le_u32(value)?,
            }),
            Cs::InquireSerial => Ok(Self::InquireSerialAck {
                serial: le_u32(value)?,
            }),
            Cs::InquireNodeId => Ok(Self::InquireNodeIdAck {
                node_id: byte_at(value, 1)?,
            }),
            _ => Err(MessageError::UnexpectedLssCommand { value: cs as u8 }),
        }
    }
}

impl TryFrom<CanMessage> for LssResponse {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id() != LSS_RESP_ID {
            return Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: LSS_RESP_ID,
            });
        }
        LssResponse::try_from(msg.data())
    }
}

impl From<LssResponse> for CanMessage {
    fn from(resp: LssResponse) -> Self {
        use LssCommandSpecifier as Cs;
        let mut data = [0u8; 8];
        let (cs, body): (Cs, [u8; 4]) = match resp {
            LssResponse::IdentifySlave => (Cs::IdentifySlave, [0; 4]),
            LssResponse::SwitchStateResponse => (Cs::SwitchStateResponse, [0; 4]),
            LssResponse::ConfigureNodeIdAck { error, spec_error } => {
                (Cs::ConfigureNodeId, [error, spec_error, 0, 0])
            }
            LssResponse::ConfigureBitTimingAck { error, spec_error } => {
                (Cs::ConfigureBitTiming, [error, spec_error, 0, 0])
            }
            LssResponse::StoreConfigurationAck { error, spec_error } => {
                (Cs::StoreConfiguration, [error, spec_error, 0, 0])
            }
            LssResponse::InquireVendorAck { vendor_id } => {
                (Cs::InquireVendor, vendor_id.to_le_bytes())
            }
            LssResponse::InquireProductAck { product_code } => {
                (Cs::InquireProduct, product_code.to_le_bytes())
            }
            LssResponse::InquireRevisionAck { revision } => {
                (Cs::InquireRevision, revision.to_le_bytes())
            }
            LssResponse::InquireSerialAck { serial } => (Cs::InquireSerial, serial.to_le_bytes()),
            LssResponse::InquireNodeIdAck { node_id } => (Cs::InquireNodeId, [node_id, 0, 0, 0]),
        };
        data[0] = cs as u8;
        data[1..5].copy_from_slice(&body);
        CanMessage::new(LSS_RESP_ID, &data)
    }
}

/// LSS slave state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LssState {
    /// Normal operation, ignoring configuration commands
    Waiting = 0,
    /// Accepting configuration commands
    Configuring = 1,
}

impl LssState {
    /// Decode a state byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x00 => Ok(Self::Waiting),
            0x01 => Ok(Self::Configuring),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// The 128-bit identity of a device, as stored in object 0x1018
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LssIdentity {
    /// Vendor ID
    pub vendor_id: u32,
    /// Product code
    pub product_code: u32,
    /// Revision number
    pub revision: u32,
    /// Serial number
    pub serial: u32,
}

impl LssIdentity {
    /// Create an identity
    pub fn new(vendor_id: u32, product_code: u32, revision: u32, serial: u32) -> Self {
        Self {
            vendor_id,
            product_code,
            revision,
            serial,
        }
    }

    /// Get one identity part by its fast scan sub index (0..=3)
    pub fn by_addr(&self, addr: u8) -> Option<u32> {
        match addr {
            0 => Some(self.vendor_id),
            1 => Some(self.product_code),
            2 => Some(self.revision),
            3 => Some(self.serial),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_scan_layout() {
        let msg: CanMessage = LssRequest::FastScan {
            id: 0x1234_5678,
            bit_check: 31,
            sub: 3,
            next: 0,
        }
        .into();
        assert_eq!(LSS_REQ_ID, msg.id());
        assert_eq!(&[0x51, 0x78, 0x56, 0x34, 0x12, 31, 3, 0], msg.data());
        assert_eq!(
            LssRequest::FastScan {
                id: 0x1234_5678,
                bit_check: 31,
                sub: 3,
                next: 0
            },
            LssRequest::try_from(msg.data()).unwrap()
        );
    }

    #[test]
    fn test_inquire_node_id_response() {
        let msg: CanMessage = LssResponse::InquireNodeIdAck { node_id: 33 }.into();
        assert_eq!(LSS_RESP_ID, msg.id());
        assert_eq!(
            LssResponse::InquireNodeIdAck { node_id: 33 },
            LssResponse::try_from(msg).unwrap()
        );
    }

    #[test]
    fn test_response_on_wrong_id_rejected() {
        let mut msg: CanMessage = LssResponse::IdentifySlave.into();
        msg.id = LSS_REQ_ID;
        assert!(LssResponse::try_from(msg).is_err());
    }
}

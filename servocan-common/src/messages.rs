//! CAN frame types and the standard CANopen broadcast messages
use snafu::Snafu;

use crate::{
    lss::{LssRequest, LssResponse},
    sdo::{SdoRequest, SdoResponse},
};

/// A CAN identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CanId {
    /// A 29-bit extended identifier
    Extended(u32),
    /// An 11-bit standard identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw numeric identifier
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// True for 29-bit identifiers
    pub fn is_extended(&self) -> bool {
        match self {
            CanId::Extended(_) => true,
            CanId::Std(_) => false,
        }
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN data frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// Payload storage. Only the first `dlc` bytes are valid
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid payload bytes
    pub dlc: u8,
    /// The frame identifier
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
        }
    }
}

impl CanMessage {
    /// Create a new message
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 8 bytes
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len() as u8;
        if dlc > MAX_DATA_LENGTH as u8 {
            panic!("Data length exceeds maximum size of {} bytes", MAX_DATA_LENGTH);
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc as usize].copy_from_slice(data);

        Self { id, dlc, data: buf }
    }

    /// The frame identifier
    pub fn id(&self) -> CanId {
        self.id
    }

    /// The valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }
}

/// Bus error conditions reported by a CAN controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum CanError {
    /// A transmitted bit did not match the bus level
    #[snafu(display("Bit error"))]
    Bit,
    /// Bit stuffing rule violated
    #[snafu(display("Stuff error"))]
    Stuff,
    /// A fixed-form field held an illegal value
    #[snafu(display("Form error"))]
    Form,
    /// No node acknowledged the frame
    #[snafu(display("Ack error"))]
    Ack,
    /// CRC mismatch
    #[snafu(display("CRC error"))]
    Crc,
    /// Any other controller error
    #[snafu(display("CAN controller error 0x{code:02x}"))]
    Other {
        /// Raw error code
        code: u8,
    },
}

impl CanError {
    /// Decode an error class from a raw error code
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => CanError::Bit,
            2 => CanError::Stuff,
            3 => CanError::Form,
            4 => CanError::Ack,
            5 => CanError::Crc,
            code => CanError::Other { code },
        }
    }
}

/// NMT command specifiers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommandCmd {
    /// Go to Operational
    Start = 1,
    /// Go to Stopped
    Stop = 2,
    /// Go to Pre-Operational
    EnterPreOp = 128,
    /// Reset the application
    ResetApp = 129,
    /// Reset communication parameters
    ResetComm = 130,
}

impl NmtCommandCmd {
    /// Decode a command specifier byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// COB-ID of NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// COB-ID of the SYNC object
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// COB-ID of LSS slave responses
pub const LSS_RESP_ID: CanId = CanId::Std(0x7E4);
/// COB-ID of LSS master requests
pub const LSS_REQ_ID: CanId = CanId::Std(0x7E5);
/// Base COB-ID of heartbeat messages (node ID is added)
pub const HEARTBEAT_ID: u16 = 0x700;
/// Base COB-ID for SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// Base COB-ID for SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;
/// Base COB-ID of the first TPDO (node ID is added, each further TPDO adds 0x100)
pub const TPDO_BASE: u16 = 0x180;
/// Base COB-ID of the first RPDO (node ID is added, each further RPDO adds 0x100)
pub const RPDO_BASE: u16 = 0x200;
/// Number of PDOs with predefined COB-IDs in each direction
pub const NUM_DEFAULT_PDOS: u8 = 4;

/// Default COB-ID of TPDO `n` (0 based) for a node
pub const fn default_tpdo_cob_id(node_id: u8, n: u8) -> u16 {
    TPDO_BASE + 0x100 * n as u16 + node_id as u16
}

/// Default COB-ID of RPDO `n` (0 based) for a node
pub const fn default_rpdo_cob_id(node_id: u8, n: u8) -> u16 {
    RPDO_BASE + 0x100 * n as u16 + node_id as u16
}

/// An NMT command message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtCommand {
    /// The command
    pub cmd: NmtCommandCmd,
    /// Target node, or 0 for all nodes
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cmd = NmtCommandCmd::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cmd, node })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.cmd as u8, cmd.node])
    }
}

/// NMT states reported in heartbeats
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Boot-up message, sent once after reset
    Bootup = 0,
    /// Stopped
    Stopped = 4,
    /// Operational
    Operational = 5,
    /// Pre-operational
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Bootup => write!(f, "Bootup"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

/// Error returned when a byte is not a valid NMT state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidNmtStateError(u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Bootup as u8 => Ok(Bootup),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// A heartbeat (or boot-up) message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Producing node
    pub node: u8,
    /// Toggle bit
    pub toggle: bool,
    /// Reported NMT state
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut byte = value.state as u8;
        if value.toggle {
            byte |= 1 << 7;
        }
        CanMessage::new(CanId::Std(HEARTBEAT_ID | value.node as u16), &[byte])
    }
}

/// A SYNC message
///
/// The one byte counter starts at 1 and wraps back to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncObject {
    count: u8,
}

impl SyncObject {
    /// Create a SYNC message with the given counter
    pub fn new(count: u8) -> Self {
        Self { count }
    }
}

impl Default for SyncObject {
    fn default() -> Self {
        Self { count: 1 }
    }
}

impl From<SyncObject> for CanMessage {
    fn from(value: SyncObject) -> Self {
        CanMessage::new(SYNC_ID, &[value.count])
    }
}

/// A frame classified by its identifier range
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriveMessage {
    /// NMT command from the master
    NmtCommand(NmtCommand),
    /// SYNC
    Sync(SyncObject),
    /// Heartbeat or boot-up from a node
    Heartbeat(Heartbeat),
    /// SDO request to a node's server
    SdoRequest {
        /// Server node
        node: u8,
        /// The request
        req: SdoRequest,
    },
    /// SDO response from a node's server
    SdoResponse {
        /// Server node
        node: u8,
        /// The response
        resp: SdoResponse,
    },
    /// A process data frame on one of the predefined TPDO identifiers
    Tpdo {
        /// Producing node
        node: u8,
        /// PDO number, 0 based
        pdo: u8,
        /// The raw frame
        msg: CanMessage,
    },
    /// A process data frame on one of the predefined RPDO identifiers
    Rpdo {
        /// Consuming node
        node: u8,
        /// PDO number, 0 based
        pdo: u8,
        /// The raw frame
        msg: CanMessage,
    },
    /// LSS master request
    LssRequest(LssRequest),
    /// LSS slave response
    LssResponse(LssResponse),
}

/// Split a predefined PDO identifier into (is_tpdo, pdo number, node)
fn classify_pdo(id: u16) -> Option<(bool, u8, u8)> {
    let node = (id & 0x7f) as u8;
    if node == 0 {
        return None;
    }
    match id & 0x780 {
        0x180 => Some((true, 0, node)),
        0x200 => Some((false, 0, node)),
        0x280 => Some((true, 1, node)),
        0x300 => Some((false, 1, node)),
        0x380 => Some((true, 2, node)),
        0x400 => Some((false, 2, node)),
        0x480 => Some((true, 3, node)),
        0x500 => Some((false, 3, node)),
        _ => None,
    }
}

impl TryFrom<CanMessage> for DriveMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        let CanId::Std(id) = cob_id else {
            return Err(MessageError::UnrecognizedId { cob_id });
        };
        if cob_id == NMT_CMD_ID {
            Ok(DriveMessage::NmtCommand(msg.try_into()?))
        } else if cob_id == SYNC_ID {
            let count = msg.data().first().copied().unwrap_or(1);
            Ok(DriveMessage::Sync(SyncObject::new(count)))
        } else if cob_id == LSS_REQ_ID {
            let req = LssRequest::try_from(msg.data())?;
            Ok(DriveMessage::LssRequest(req))
        } else if cob_id == LSS_RESP_ID {
            let resp = LssResponse::try_from(msg.data())?;
            Ok(DriveMessage::LssResponse(resp))
        } else if id & !0x7f == HEARTBEAT_ID {
            let node = (id & 0x7f) as u8;
            let byte = *msg.data().first().ok_or(MessageError::MessageTooShort)?;
            let toggle = (byte & (1 << 7)) != 0;
            let state: NmtState = (byte & 0x7f)
                .try_into()
                .map_err(|e: InvalidNmtStateError| MessageError::InvalidNmtState { value: e.0 })?;
            Ok(DriveMessage::Heartbeat(Heartbeat {
                node,
                toggle,
                state,
            }))
        } else if id & !0x7f == SDO_RESP_BASE {
            let resp = SdoResponse::try_from(msg.data())
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(DriveMessage::SdoResponse {
                node: (id & 0x7f) as u8,
                resp,
            })
        } else if id & !0x7f == SDO_REQ_BASE {
            let req = SdoRequest::try_from(msg.data())
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(DriveMessage::SdoRequest {
                node: (id & 0x7f) as u8,
                req,
            })
        } else if let Some((is_tpdo, pdo, node)) = classify_pdo(id) {
            if is_tpdo {
                Ok(DriveMessage::Tpdo { node, pdo, msg })
            } else {
                Ok(DriveMessage::Rpdo { node, pdo, msg })
            }
        } else {
            Err(MessageError::UnrecognizedId { cob_id })
        }
    }
}

/// Errors decoding a frame into a typed message
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// The payload is shorter than the message type requires
    #[snafu(display("Message too short"))]
    MessageTooShort,
    /// The payload could not be decoded
    #[snafu(display("Malformed message on {cob_id:?}"))]
    MalformedMsg {
        /// Identifier of the offending frame
        cob_id: CanId,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// Received ID
        cob_id: CanId,
        /// Expected ID
        expected: CanId,
    },
    /// A field held a value outside its domain
    #[snafu(display("Invalid field value"))]
    InvalidField,
    /// The identifier does not belong to any known message type
    #[snafu(display("Unrecognized message ID {cob_id:?}"))]
    UnrecognizedId {
        /// Received ID
        cob_id: CanId,
    },
    /// The NMT state integer in the message is not a valid NMT state
    #[snafu(display("Invalid NMT state {value}"))]
    InvalidNmtState {
        /// Received value
        value: u8,
    },
    /// An invalid LSS command specifier was found in the message
    #[snafu(display("Unexpected LSS command: {value}"))]
    UnexpectedLssCommand {
        /// Received command specifier
        value: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_heartbeat() {
        let msg = CanMessage::new(CanId::std(0x720), &[0x85]);
        let parsed = DriveMessage::try_from(msg).unwrap();
        assert_eq!(
            DriveMessage::Heartbeat(Heartbeat {
                node: 0x20,
                toggle: true,
                state: NmtState::Operational
            }),
            parsed
        );
    }

    #[test]
    fn test_classify_pdo_ranges() {
        let msg = CanMessage::new(CanId::std(0x1A0), &[0x27, 0x06]);
        assert!(matches!(
            DriveMessage::try_from(msg),
            Ok(DriveMessage::Tpdo { node: 0x20, pdo: 0, .. })
        ));
        let msg = CanMessage::new(CanId::std(0x4A0), &[]);
        assert!(matches!(
            DriveMessage::try_from(msg),
            Ok(DriveMessage::Tpdo { node: 0x20, pdo: 3, .. })
        ));
        let msg = CanMessage::new(CanId::std(0x220), &[]);
        assert!(matches!(
            DriveMessage::try_from(msg),
            Ok(DriveMessage::Rpdo { node: 0x20, pdo: 0, .. })
        ));
        assert_eq!(0x2A0, default_tpdo_cob_id(0x20, 1));
        assert_eq!(0x520, default_rpdo_cob_id(0x20, 3));
    }

    #[test]
    fn test_nmt_command_roundtrip() {
        let cmd = NmtCommand {
            cmd: NmtCommandCmd::ResetComm,
            node: 0,
        };
        let msg: CanMessage = cmd.into();
        assert_eq!(&[130, 0], msg.data());
        assert_eq!(cmd, NmtCommand::try_from(msg).unwrap());
    }
}

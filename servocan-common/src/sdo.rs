//! SDO protocol frames
//!
//! Expedited and segmented transfers only. Every SDO frame carries 8 data bytes; the upper three
//! bits of the first byte hold the command specifier.
use crate::messages::{CanId, CanMessage, MessageError};

/// Server command specifier (SCS) values in SDO response frames
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerCommand {
    /// Upload segment
    SegmentUpload = 0,
    /// Acknowledge a download segment
    SegmentDownload = 1,
    /// Acknowledge an initiate upload
    Upload = 2,
    /// Acknowledge an initiate download
    Download = 3,
    /// Abort the transfer
    Abort = 4,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// Client command specifier (CCS) values in SDO request frames
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientCommand {
    /// Download segment
    DownloadSegment = 0,
    /// Initiate a download
    InitiateDownload = 1,
    /// Initiate an upload
    InitiateUpload = 2,
    /// Request the next upload segment
    ReqUploadSegment = 3,
    /// Abort the transfer
    Abort = 4,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// Standard SDO abort codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnnallowedPdo = 0x0604_0041,
    /// The number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Resource not available
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored to the application because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored to the application because of the device state
    CantStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

impl TryFrom<u32> for AbortCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use AbortCode::*;
        const ALL: [AbortCode; 26] = [
            ToggleNotAlternated,
            SdoTimeout,
            InvalidCommandSpecifier,
            OutOfMemory,
            UnsupportedAccess,
            WriteOnly,
            ReadOnly,
            NoSuchObject,
            UnnallowedPdo,
            PdoTooLong,
            IncompatibleParameter,
            HardwareError,
            DataTypeMismatch,
            DataTypeMismatchLengthHigh,
            DataTypeMismatchLengthLow,
            NoSuchSubIndex,
            InvalidValue,
            ValueTooHigh,
            ValueTooLow,
            ResourceNotAvailable,
            GeneralError,
            CantStore,
            CantStoreLocalControl,
            CantStoreDeviceState,
            NoObjectDict,
            NoData,
        ];
        ALL.iter().copied().find(|c| *c as u32 == value).ok_or(value)
    }
}

/// An SDO request, sent from client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoRequest {
    /// Start a download, or perform an expedited one
    InitiateDownload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited
        e: bool,
        /// Size indicated
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value on expedited transfers, size when e=0 and s=1
        data: [u8; 4],
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set on the last segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Start an upload
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next segment of an upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Abort the transfer in progress
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Abort code
        abort_code: u32,
    },
}

fn write_address(payload: &mut [u8; 8], index: u16, sub: u8) {
    payload[1..3].copy_from_slice(&index.to_le_bytes());
    payload[3] = sub;
}

fn read_address(payload: &[u8]) -> (u16, u8) {
    (u16::from_le_bytes([payload[1], payload[2]]), payload[3])
}

fn read_u32(payload: &[u8]) -> u32 {
    u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]])
}

impl SdoRequest {
    /// Create an abort message
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create an initiate download message for a segmented transfer
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        let data = size.unwrap_or(0).to_le_bytes();

        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data,
        }
    }

    /// Create a download segment message
    ///
    /// `segment_data` must be at most 7 bytes
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let len = segment_data.len().min(7);
        let mut data = [0; 7];
        data[0..len].copy_from_slice(&segment_data[0..len]);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - len as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an expedited download message
    ///
    /// `data` must be at most 4 bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let len = data.len().min(4);
        let mut msg_data = [0; 4];
        msg_data[0..len].copy_from_slice(&data[0..len]);

        SdoRequest::InitiateDownload {
            n: (4 - len) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create an initiate upload message
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Serialize to a frame on the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ClientCommand::InitiateDownload as u8) << 5
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                write_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = (ClientCommand::DownloadSegment as u8) << 5
                    | (t as u8) << 4
                    | (n & 7) << 1
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                write_address(&mut payload, index, sub);
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = (ClientCommand::ReqUploadSegment as u8) << 5 | (t as u8) << 4;
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                write_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }

        CanMessage::new(id, &payload)
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    /// The abort code a server should answer a malformed request with
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let ccs: ClientCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;

        match ccs {
            ClientCommand::DownloadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 0x7;
                let c = (value[0] & 1) != 0;
                let mut data = [0; 7];
                data.copy_from_slice(&value[1..8]);
                Ok(SdoRequest::DownloadSegment { t, n, c, data })
            }
            ClientCommand::InitiateDownload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & 1) != 0;
                let (index, sub) = read_address(value);
                let data = read_u32(value).to_le_bytes();
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => {
                let (index, sub) = read_address(value);
                Ok(SdoRequest::InitiateUpload { index, sub })
            }
            ClientCommand::ReqUploadSegment => {
                let t = ((value[0] >> 4) & 1) != 0;
                Ok(SdoRequest::ReqUploadSegment { t })
            }
            ClientCommand::Abort => {
                let (index, sub) = read_address(value);
                let abort_code = read_u32(value);
                Ok(SdoRequest::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
        }
    }
}

/// An SDO response, sent from server to client
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// Response to an initiate upload
    ConfirmUpload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value if e=1, or size if s=1
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set on the last segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Response to an initiate download
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Response to a download segment
    ConfirmDownloadSegment {
        /// Toggle flag, echoing the segment's toggle
        t: bool,
    },
    /// The server aborted the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Abort code
        abort_code: u32,
    },
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        let command: ServerCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| MessageError::InvalidField)?;
        match command {
            ServerCommand::SegmentUpload => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 7;
                let c = (value[0] & 1) != 0;
                let mut data = [0; 7];
                data.copy_from_slice(&value[1..8]);
                Ok(SdoResponse::UploadSegment { t, n, c, data })
            }
            ServerCommand::SegmentDownload => {
                let t = (value[0] & (1 << 4)) != 0;
                Ok(SdoResponse::ConfirmDownloadSegment { t })
            }
            ServerCommand::Upload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & 1) != 0;
                let (index, sub) = read_address(value);
                let data = read_u32(value).to_le_bytes();
                Ok(SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::Download => {
                let (index, sub) = read_address(value);
                Ok(SdoResponse::ConfirmDownload { index, sub })
            }
            ServerCommand::Abort => {
                let (index, sub) = read_address(value);
                let abort_code = read_u32(value);
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
        }
    }
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        SdoResponse::try_from(msg.data())
    }
}

impl SdoResponse {
    /// Create an expedited upload response
    ///
    /// `data` must be at most 4 bytes
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        let len = data.len().min(4);
        let mut msg_data = [0; 4];
        msg_data[0..len].copy_from_slice(&data[0..len]);

        SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s: true,
            n: 4 - len as u8,
            data: msg_data,
        }
    }

    /// Create a segmented upload acknowledgement indicating the total size
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an upload segment
    ///
    /// `data` must be at most 7 bytes
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let len = data.len().min(7);
        let mut buf = [0; 7];
        buf[0..len].copy_from_slice(&data[0..len]);
        SdoResponse::UploadSegment {
            t,
            n: (7 - len) as u8,
            c,
            data: buf,
        }
    }

    /// Create a download acknowledgement
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a download segment acknowledgement
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Serialize to a frame on the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        let mut payload = [0; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ServerCommand::Upload as u8) << 5
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                write_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                write_address(&mut payload, index, sub);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = (ServerCommand::SegmentUpload as u8) << 5
                    | (t as u8) << 4
                    | (n & 7) << 1
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                write_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = (ServerCommand::SegmentDownload as u8) << 5 | (t as u8) << 4;
            }
        }
        CanMessage::new(id, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expedited_download_layout() {
        let msg = SdoRequest::expedited_download(0x6040, 0, &[0x0F, 0x00])
            .to_can_message(CanId::std(0x620));
        assert_eq!(CanId::std(0x620), msg.id());
        // ccs=1, n=2, e=1, s=1
        assert_eq!(&[0x2B, 0x40, 0x60, 0x00, 0x0F, 0x00, 0x00, 0x00], msg.data());
    }

    #[test]
    fn test_segment_flags() {
        let msg = SdoResponse::upload_segment(true, true, &[1, 2, 3]).to_can_message(CanId::std(0x5A0));
        // scs=0, t=1, n=4, c=1
        assert_eq!(0x19, msg.data()[0]);
        let parsed = SdoResponse::try_from(msg.data()).unwrap();
        assert_eq!(
            SdoResponse::UploadSegment {
                t: true,
                n: 4,
                c: true,
                data: [1, 2, 3, 0, 0, 0, 0]
            },
            parsed
        );
    }

    #[test]
    fn test_abort_code_lookup() {
        assert_eq!(Ok(AbortCode::NoSuchObject), AbortCode::try_from(0x0602_0000));
        assert_eq!(Err(0x1234_5678), AbortCode::try_from(0x1234_5678));
    }

    #[test]
    fn test_bad_command_specifier() {
        let data = [0xE0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            Err(AbortCode::InvalidCommandSpecifier),
            SdoRequest::try_from(&data[..])
        );
    }
}

use std::time::Duration;

use snafu::Snafu;
use tokio::time::{timeout_at, Instant};
use servocan_common::{
    constants::object_ids,
    lss::LssIdentity,
    messages::{SDO_REQ_BASE, SDO_RESP_BASE},
    sdo::{AbortCode, SdoRequest, SdoResponse},
    traits::{AsyncCanReceiver, AsyncCanSender},
    CanId,
};

/// Default time to wait for each SDO transaction to complete
pub const DEFAULT_SDO_TIMEOUT: Duration = Duration::from_millis(1000);

/// An SDO abort code as received from a device
///
/// Codes are surfaced as sent; codes defined by the standard are decoded for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl RawAbortCode {
    /// The numeric code
    pub fn raw(&self) -> u32 {
        match self {
            RawAbortCode::Valid(code) => *code as u32,
            RawAbortCode::Unknown(code) => *code,
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => RawAbortCode::Valid(code),
            Err(value) => RawAbortCode::Unknown(value),
        }
    }
}

impl core::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RawAbortCode::Valid(code) => write!(f, "0x{:08X} ({code:?})", *code as u32),
            RawAbortCode::Unknown(code) => write!(f, "0x{code:08X}"),
        }
    }
}

/// The ways in which a server response can break the SDO protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolationKind {
    /// A segment arrived with the wrong toggle bit
    ToggleNotAlternated,
    /// The response command specifier does not fit the request
    UnexpectedResponse,
    /// The response carries another object's address
    AddressMismatch {
        /// Index in the response
        index: u16,
        /// Sub index in the response
        sub: u8,
    },
    /// The amount of data received differs from the size indicated by the server
    SizeMismatch {
        /// Indicated size
        expected: usize,
        /// Received size
        actual: usize,
    },
    /// The response could not be decoded
    Malformed,
}

impl core::fmt::Display for ProtocolViolationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProtocolViolationKind::ToggleNotAlternated => write!(f, "toggle bit not alternated"),
            ProtocolViolationKind::UnexpectedResponse => write!(f, "unexpected response"),
            ProtocolViolationKind::AddressMismatch { index, sub } => {
                write!(f, "response for wrong object 0x{index:04X}sub{sub}")
            }
            ProtocolViolationKind::SizeMismatch { expected, actual } => {
                write!(f, "indicated size {expected} but received {actual} bytes")
            }
            ProtocolViolationKind::Malformed => write!(f, "malformed response"),
        }
    }
}

/// Error returned by [`SdoClient`] methods
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum SdoClientError {
    /// No response arrived before the deadline
    #[snafu(display("Timed out waiting for SDO response"))]
    Timeout,
    /// The server aborted the transfer
    #[snafu(display("Server aborted access to 0x{index:04X}sub{sub} with code {code}"))]
    AbortedByDevice {
        /// Index of the SDO access
        index: u16,
        /// Sub index of the SDO access
        sub: u8,
        /// Abort code sent by the server
        code: RawAbortCode,
    },
    /// The server response did not follow the protocol
    #[snafu(display("SDO protocol violation: {kind}"))]
    ProtocolViolation {
        /// What went wrong
        kind: ProtocolViolationKind,
    },
    /// A frame could not be handed to the transport
    #[snafu(display("Failed to send CAN message"))]
    Transport,
}

type Result<T> = std::result::Result<T, SdoClientError>;

/// A client for accessing a node's SDO server
///
/// A single server can only handle a single client at a time, and a client only runs one
/// transaction at a time. Every method takes `&mut self`, so holding the client behind a mutex is
/// enough to serialize access to one node.
#[derive(Debug)]
pub struct SdoClient<S, R> {
    node_id: u8,
    req_cob_id: CanId,
    resp_cob_id: CanId,
    timeout: Duration,
    sequence: u32,
    sender: S,
    receiver: R,
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> SdoClient<S, R> {
    /// Create a new SdoClient using a node ID
    ///
    /// Nodes have a default SDO server, which uses a COB ID based on the node ID. This is a
    /// shortcut to create a client for that default SDO server.
    ///
    /// # Arguments
    /// - `server_node_id`: The node ID of the server
    /// - `sender`: An object which implements [`AsyncCanSender`] to be used for sending messages
    ///   to the bus
    /// - `receiver`: An object which implements [`AsyncCanReceiver`] to be used for receiving
    ///   messages from the bus
    pub fn new_std(server_node_id: u8, sender: S, receiver: R) -> Self {
        let req_cob_id = CanId::Std(SDO_REQ_BASE + server_node_id as u16);
        let resp_cob_id = CanId::Std(SDO_RESP_BASE + server_node_id as u16);
        Self::new(server_node_id, req_cob_id, resp_cob_id, sender, receiver)
    }

    /// Create a new SdoClient from request and response COB IDs
    pub fn new(node_id: u8, req_cob_id: CanId, resp_cob_id: CanId, sender: S, receiver: R) -> Self {
        Self {
            node_id,
            req_cob_id,
            resp_cob_id,
            timeout: DEFAULT_SDO_TIMEOUT,
            sequence: 0,
            sender,
            receiver,
        }
    }

    /// Set the default timeout used by [`upload`](Self::upload) and
    /// [`download`](Self::download)
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The default timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The node ID of the server
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Number of transactions started by this client
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Write data to a sub-object on the SDO server, using the default timeout
    pub async fn download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        self.download_with_timeout(index, sub, data, self.timeout)
            .await
    }

    /// Write data to a sub-object on the SDO server
    ///
    /// Data of up to four bytes is written with an expedited transfer, longer data with a
    /// segmented transfer. `timeout` bounds the whole transaction.
    pub async fn download_with_timeout(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let seq = self.begin(index, sub, "download")?;
        let deadline = Instant::now() + timeout;

        if data.len() <= 4 {
            self.send(SdoRequest::expedited_download(index, sub, data))
                .await?;
            let resp = self.wait_for_response(deadline).await?;
            return self.check_download_confirm(resp, index, sub);
        }

        self.send(SdoRequest::initiate_download(
            index,
            sub,
            Some(data.len() as u32),
        ))
        .await?;
        let resp = self.wait_for_response(deadline).await?;
        self.check_download_confirm(resp, index, sub)?;

        let mut toggle = false;
        let total_segments = data.len().div_ceil(7);
        for (n, chunk) in data.chunks(7).enumerate() {
            let last_segment = n == total_segments - 1;
            self.send(SdoRequest::download_segment(toggle, last_segment, chunk))
                .await?;
            let resp = match self.wait_for_response(deadline).await {
                Ok(resp) => resp,
                Err(e) => return Err(self.abort_on_timeout(e, index, sub).await),
            };
            match resp {
                SdoResponse::ConfirmDownloadSegment { t } => {
                    // Fail if toggle value doesn't match
                    if t != toggle {
                        self.send(SdoRequest::abort(index, sub, AbortCode::ToggleNotAlternated))
                            .await?;
                        return ProtocolViolationSnafu {
                            kind: ProtocolViolationKind::ToggleNotAlternated,
                        }
                        .fail();
                    }
                }
                SdoResponse::Abort { abort_code, .. } => {
                    return self.aborted(index, sub, abort_code);
                }
                _ => {
                    return ProtocolViolationSnafu {
                        kind: ProtocolViolationKind::UnexpectedResponse,
                    }
                    .fail()
                }
            }
            toggle = !toggle;
        }
        log::trace!("Node {}: SDO #{seq} complete", self.node_id);
        Ok(())
    }

    /// Read a sub-object on the SDO server, using the default timeout
    pub async fn upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.upload_with_timeout(index, sub, self.timeout).await
    }

    /// Read a sub-object on the SDO server
    ///
    /// `timeout` bounds the whole transaction.
    pub async fn upload_with_timeout(
        &mut self,
        index: u16,
        sub: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let seq = self.begin(index, sub, "upload")?;
        let deadline = Instant::now() + timeout;
        let mut read_buf = Vec::new();

        self.send(SdoRequest::initiate_upload(index, sub)).await?;
        let resp = self.wait_for_response(deadline).await?;

        let indicated_size = match resp {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index: resp_index,
                sub: resp_sub,
                data,
            } => {
                if (resp_index, resp_sub) != (index, sub) {
                    return ProtocolViolationSnafu {
                        kind: ProtocolViolationKind::AddressMismatch {
                            index: resp_index,
                            sub: resp_sub,
                        },
                    }
                    .fail();
                }
                if e {
                    let len = if s { 4 - (n as usize).min(4) } else { 4 };
                    read_buf.extend_from_slice(&data[0..len]);
                    log::trace!("Node {}: SDO #{seq} complete", self.node_id);
                    return Ok(read_buf);
                }
                if s {
                    Some(u32::from_le_bytes(data) as usize)
                } else {
                    None
                }
            }
            SdoResponse::Abort { abort_code, .. } => return self.aborted(index, sub, abort_code),
            _ => {
                return ProtocolViolationSnafu {
                    kind: ProtocolViolationKind::UnexpectedResponse,
                }
                .fail()
            }
        };

        // Read segments
        let mut toggle = false;
        loop {
            self.send(SdoRequest::upload_segment_request(toggle))
                .await?;

            let resp = match self.wait_for_response(deadline).await {
                Ok(resp) => resp,
                Err(e) => return Err(self.abort_on_timeout(e, index, sub).await),
            };
            match resp {
                SdoResponse::UploadSegment { t, n, c, data } => {
                    if t != toggle {
                        self.send(SdoRequest::abort(index, sub, AbortCode::ToggleNotAlternated))
                            .await?;
                        return ProtocolViolationSnafu {
                            kind: ProtocolViolationKind::ToggleNotAlternated,
                        }
                        .fail();
                    }
                    read_buf.extend_from_slice(&data[0..7 - (n as usize).min(7)]);
                    if c {
                        // Transfer complete
                        break;
                    }
                }
                SdoResponse::Abort { abort_code, .. } => {
                    return self.aborted(index, sub, abort_code);
                }
                _ => {
                    return ProtocolViolationSnafu {
                        kind: ProtocolViolationKind::UnexpectedResponse,
                    }
                    .fail()
                }
            }
            toggle = !toggle;
        }

        if let Some(expected) = indicated_size {
            if expected != read_buf.len() {
                return ProtocolViolationSnafu {
                    kind: ProtocolViolationKind::SizeMismatch {
                        expected,
                        actual: read_buf.len(),
                    },
                }
                .fail();
            }
        }
        log::trace!("Node {}: SDO #{seq} complete", self.node_id);
        Ok(read_buf)
    }

    /// Write to a u32 object on the SDO server
    pub async fn download_u32(&mut self, index: u16, sub: u8, data: u32) -> Result<()> {
        self.download(index, sub, &data.to_le_bytes()).await
    }

    /// Write to a u16 object on the SDO server
    pub async fn download_u16(&mut self, index: u16, sub: u8, data: u16) -> Result<()> {
        self.download(index, sub, &data.to_le_bytes()).await
    }

    /// Write to a u8 object on the SDO server
    pub async fn download_u8(&mut self, index: u16, sub: u8, data: u8) -> Result<()> {
        self.download(index, sub, &data.to_le_bytes()).await
    }

    /// Write to an i32 object on the SDO server
    pub async fn download_i32(&mut self, index: u16, sub: u8, data: i32) -> Result<()> {
        self.download(index, sub, &data.to_le_bytes()).await
    }

    /// Write to an i16 object on the SDO server
    pub async fn download_i16(&mut self, index: u16, sub: u8, data: i16) -> Result<()> {
        self.download(index, sub, &data.to_le_bytes()).await
    }

    /// Write to an i8 object on the SDO server
    pub async fn download_i8(&mut self, index: u16, sub: u8, data: i8) -> Result<()> {
        self.download(index, sub, &data.to_le_bytes()).await
    }

    /// Read a u32 sub object from a SDO server
    ///
    /// This is an alias for upload_u32 for a more intuitive API
    pub async fn read_u32(&mut self, index: u16, sub: u8) -> Result<u32> {
        self.upload_u32(index, sub).await
    }

    /// Read a u32 sub object from a SDO server
    pub async fn upload_u32(&mut self, index: u16, sub: u8) -> Result<u32> {
        let data = self.upload(index, sub).await?;
        Ok(u32::from_le_bytes(fixed(&data)?))
    }

    /// Read a u16 sub object from a SDO server
    pub async fn upload_u16(&mut self, index: u16, sub: u8) -> Result<u16> {
        let data = self.upload(index, sub).await?;
        Ok(u16::from_le_bytes(fixed(&data)?))
    }

    /// Read a u8 sub object from a SDO server
    pub async fn upload_u8(&mut self, index: u16, sub: u8) -> Result<u8> {
        let data = self.upload(index, sub).await?;
        Ok(u8::from_le_bytes(fixed(&data)?))
    }

    /// Read an i32 sub object from a SDO server
    pub async fn upload_i32(&mut self, index: u16, sub: u8) -> Result<i32> {
        let data = self.upload(index, sub).await?;
        Ok(i32::from_le_bytes(fixed(&data)?))
    }

    /// Read an i16 sub object from a SDO server
    pub async fn upload_i16(&mut self, index: u16, sub: u8) -> Result<i16> {
        let data = self.upload(index, sub).await?;
        Ok(i16::from_le_bytes(fixed(&data)?))
    }

    /// Read an i8 sub object from a SDO server
    pub async fn upload_i8(&mut self, index: u16, sub: u8) -> Result<i8> {
        let data = self.upload(index, sub).await?;
        Ok(i8::from_le_bytes(fixed(&data)?))
    }

    /// Read a string object, dropping trailing NUL padding
    pub async fn upload_utf8(&mut self, index: u16, sub: u8) -> Result<String> {
        let data = self.upload(index, sub).await?;
        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[..end]).to_string())
    }

    /// Read the device name object
    pub async fn read_device_name(&mut self) -> Result<String> {
        self.upload_utf8(object_ids::DEVICE_NAME, 0).await
    }

    /// Read the identity object
    pub async fn read_identity(&mut self) -> Result<LssIdentity> {
        let vendor_id = self.upload_u32(object_ids::IDENTITY, 1).await?;
        let product_code = self.upload_u32(object_ids::IDENTITY, 2).await?;
        let revision = self.upload_u32(object_ids::IDENTITY, 3).await?;
        let serial = self.upload_u32(object_ids::IDENTITY, 4).await?;
        Ok(LssIdentity::new(vendor_id, product_code, revision, serial))
    }

    /// Start a transaction: drop stale responses and bump the sequence counter
    fn begin(&mut self, index: u16, sub: u8, op: &str) -> Result<u32> {
        // Responses left over from an abandoned transaction must not be taken for ours
        if self.receiver.flush().is_err() {
            return TransportSnafu.fail();
        }
        self.sequence = self.sequence.wrapping_add(1);
        log::trace!(
            "Node {}: SDO #{} {op} 0x{index:04X}sub{sub}",
            self.node_id,
            self.sequence
        );
        Ok(self.sequence)
    }

    async fn send(&mut self, req: SdoRequest) -> Result<()> {
        self.sender
            .send(req.to_can_message(self.req_cob_id))
            .await
            .map_err(|_| SdoClientError::Transport)
    }

    fn check_download_confirm(&self, resp: SdoResponse, index: u16, sub: u8) -> Result<()> {
        match resp {
            SdoResponse::ConfirmDownload {
                index: resp_index,
                sub: resp_sub,
            } => {
                if (resp_index, resp_sub) == (index, sub) {
                    Ok(())
                } else {
                    ProtocolViolationSnafu {
                        kind: ProtocolViolationKind::AddressMismatch {
                            index: resp_index,
                            sub: resp_sub,
                        },
                    }
                    .fail()
                }
            }
            SdoResponse::Abort { abort_code, .. } => self.aborted(index, sub, abort_code),
            _ => ProtocolViolationSnafu {
                kind: ProtocolViolationKind::UnexpectedResponse,
            }
            .fail(),
        }
    }

    fn aborted<T>(&self, index: u16, sub: u8, abort_code: u32) -> Result<T> {
        let code = RawAbortCode::from(abort_code);
        log::debug!(
            "Node {}: SDO access to 0x{index:04X}sub{sub} aborted with {code}",
            self.node_id
        );
        AbortedByDeviceSnafu { index, sub, code }.fail()
    }

    /// Tell the server to give up a segmented transfer we stopped waiting for
    async fn abort_on_timeout(
        &mut self,
        err: SdoClientError,
        index: u16,
        sub: u8,
    ) -> SdoClientError {
        if err == SdoClientError::Timeout {
            self.send(SdoRequest::abort(index, sub, AbortCode::SdoTimeout))
                .await
                .ok();
        }
        err
    }

    async fn wait_for_response(&mut self, deadline: Instant) -> Result<SdoResponse> {
        loop {
            match timeout_at(deadline, self.receiver.recv()).await {
                Err(_) => return TimeoutSnafu.fail(),
                Ok(Err(e)) => {
                    log::error!("Node {}: error reading CAN bus: {e}", self.node_id);
                    return TransportSnafu.fail();
                }
                Ok(Ok(msg)) => {
                    if msg.id() == self.resp_cob_id {
                        return SdoResponse::try_from(msg).map_err(|_| {
                            SdoClientError::ProtocolViolation {
                                kind: ProtocolViolationKind::Malformed,
                            }
                        });
                    }
                }
            }
        }
    }
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N]> {
    data.try_into().map_err(|_| SdoClientError::ProtocolViolation {
        kind: ProtocolViolationKind::SizeMismatch {
            expected: N,
            actual: data.len(),
        },
    })
}

use std::sync::Arc;

use futures::FutureExt as _;
use snafu::{ResultExt, Snafu};
use socketcan::{tokio::CanSocket, CanFrame, EmbeddedFrame, Frame, IoError, ShouldRetry};

use crate::{
    messages::{CanError, CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
};

fn socketcan_id_to_can_id(id: socketcan::CanId) -> CanId {
    match id {
        socketcan::CanId::Standard(id) => CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => CanId::extended(id.as_raw()),
    }
}

fn can_id_to_socketcan_id(id: CanId) -> Option<socketcan::CanId> {
    match id {
        CanId::Extended(id) => socketcan::ExtendedId::new(id).map(Into::into),
        CanId::Std(id) => socketcan::StandardId::new(id).map(Into::into),
    }
}

/// Convert a received frame. Remote frames are not used by the drive protocols and yield None.
fn socketcan_frame_to_message(frame: CanFrame) -> Result<Option<CanMessage>, CanError> {
    let id = socketcan_id_to_can_id(frame.can_id());
    match frame {
        CanFrame::Data(frame) => Ok(Some(CanMessage::new(id, frame.data()))),
        CanFrame::Remote(_) => Ok(None),
        CanFrame::Error(frame) => Err(CanError::from_raw(frame.error_bits() as u8)),
    }
}

fn message_to_socketcan_frame(msg: CanMessage) -> Option<CanFrame> {
    CanFrame::new(can_id_to_socketcan_id(msg.id())?, msg.data())
}

/// Receive half of a socketcan interface
#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<CanSocket>,
}

/// Error receiving from a socketcan interface
#[derive(Debug, Snafu)]
pub enum ReceiveError {
    /// The socket failed
    #[snafu(display("Socket error: {source}"))]
    Io {
        /// The underlying IO error
        source: IoError,
    },
    /// The controller reported a bus error
    #[snafu(display("Bus error: {source}"))]
    Can {
        /// The reported error
        source: CanError,
    },
}

impl AsyncCanReceiver for SocketCanReceiver {
    type Error = ReceiveError;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, ReceiveError> {
        loop {
            match self.socket.read_frame().now_or_never() {
                None => return Ok(None),
                Some(Ok(frame)) => {
                    if let Some(msg) = socketcan_frame_to_message(frame).context(CanSnafu)? {
                        return Ok(Some(msg));
                    }
                }
                Some(Err(e)) => {
                    if !e.should_retry() {
                        return Err(ReceiveError::Io { source: e });
                    }
                    return Ok(None);
                }
            }
        }
    }

    async fn recv(&mut self) -> Result<CanMessage, ReceiveError> {
        loop {
            match self.socket.read_frame().await {
                Ok(frame) => {
                    if let Some(msg) = socketcan_frame_to_message(frame).context(CanSnafu)? {
                        return Ok(msg);
                    }
                }
                Err(e) => {
                    if !e.should_retry() {
                        return Err(ReceiveError::Io { source: e });
                    }
                }
            }
        }
    }
}

/// Transmit half of a socketcan interface
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<CanSocket>,
}

impl AsyncCanSender for SocketCanSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        let Some(frame) = message_to_socketcan_frame(msg) else {
            return Err(CanSendError(msg));
        };
        self.socket
            .write_frame(frame)
            .await
            .map_err(|_| CanSendError(msg))
    }
}

/// Open a socketcan device and split it into a sender and receiver
///
/// # Arguments
/// * `device` - The name of the socketcan device to open, e.g. "vcan0", or "can0"
///
/// Both halves share one socket, so the receiver does not see frames sent by the sender.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
) -> Result<(SocketCanSender, SocketCanReceiver), IoError> {
    let socket = Arc::new(CanSocket::open(device.as_ref())?);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}

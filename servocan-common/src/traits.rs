//! Transport traits
//!
//! The client side of the stack talks to the bus only through these traits, so any CAN driver
//! (or a simulated bus) can be plugged in.
use core::future::Future;

use crate::messages::CanMessage;

/// Error type for CAN send operations containing the failed message
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub struct CanSendError(pub CanMessage);

impl core::fmt::Display for CanSendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Failed to send CAN message: {:?}", self.0)
    }
}

impl core::error::Error for CanSendError {}

/// An async CAN sender
pub trait AsyncCanSender: Send {
    /// Send a message to the bus
    fn send(&mut self, msg: CanMessage) -> impl Future<Output = Result<(), CanSendError>> + Send;
}

/// An async CAN receiver
pub trait AsyncCanReceiver: Send {
    /// The error type returned by recv
    type Error: core::error::Error + Send + 'static;

    /// Receive an available message immediately, or return None
    fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error>;

    /// Wait for the next message
    fn recv(&mut self) -> impl Future<Output = Result<CanMessage, Self::Error>> + Send;

    /// Remove any pending messages from the receiver
    fn flush(&mut self) -> Result<(), Self::Error> {
        while self.try_recv()?.is_some() {}
        Ok(())
    }
}

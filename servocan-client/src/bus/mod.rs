//! Sharing one CAN transport among the protocol engines
mod shared_receiver;
mod shared_sender;

pub use shared_receiver::{FrameFilter, NoMsgError, SharedReceiver, SharedReceiverChannel};
pub use shared_sender::SharedSender;

//! Common functionality shared among the servocan crates.
//!
//! Holds everything which does not need a bus connection: the CAN message types and the CANopen
//! message codecs (NMT, SDO, LSS), the object dictionary map, typed object values and the CiA 402
//! drive profile definitions. Most users reach these through the re-exports in
//! `servocan-client`.
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod cia402;
pub mod constants;
pub mod lss;
pub mod messages;
pub mod node_id;
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod object_dict;
pub mod objects;
pub mod sdo;
pub mod traits;
pub mod value;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
mod socketcan;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub use socketcan::{open_socketcan, ReceiveError, SocketCanReceiver, SocketCanSender};

pub use node_id::NodeId;

pub use messages::{CanError, CanId, CanMessage};

//! A client for controlling CiA 402 servo drives over CANopen
//!
//! The crate provides:
//!
//! - A [Drive] handle per node, which runs the CiA 402 power state machine through the controlword
//!   and statusword, and reads and writes objects by name through an [ObjectDictionary](common::object_dict::ObjectDictionary)
//! - A [MotionSequencer] for homing and profile position moves with the new setpoint handshake
//! - An [SDO client](SdoClient) for reading/writing a node's object dictionary via its SDO server
//! - An [LSS master](LssMaster) and a [NodeIdAssigner] for giving daisy chained drives unique node IDs
//! - A [PdoMonitor] which keeps the latest statusword sent by each drive in its TPDOs
//! - A [Network] facade tying all of the above to one CAN transport
//! - A [NodeConfig] TOML file format for storing drive configuration, and [ClientSettings] for the
//!   engine's own timeouts
//!
//! The library is based on tokio. All long running operations take a timeout, and the motion
//! operations also take a [CancelToken].
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bus;
mod cancel;
mod drive;
mod error;
mod lss_master;
mod motion;
mod network;
pub mod nmt_master;
mod node_assignment;
mod node_configuration;
mod pdo_monitor;
mod sdo_client;
mod settings;
pub use servocan_common as common;

pub use cancel::CancelToken;
pub use drive::{Drive, DriveSdoClient};
pub use error::Error;
pub use lss_master::{LssError, LssMaster};
pub use motion::{HomingParams, MotionGuard, MotionResult, MotionSequencer, ProfileParams};
pub use network::{Network, NodeInfo};
pub use node_assignment::{AssignedNode, NodeIdAssigner};
pub use node_configuration::{ConfigError, NodeConfig, PdoConfig, PdoMapping, Store, StoreTarget};
pub use pdo_monitor::{
    cob_id_from_raw, read_tpdo_layout, PdoError, PdoLayout, PdoMonitor, StatuswordSnapshot,
};
pub use sdo_client::{ProtocolViolationKind, RawAbortCode, SdoClient, SdoClientError};
pub use settings::ClientSettings;

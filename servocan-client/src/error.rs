use snafu::Snafu;

use servocan_common::{
    cia402::{DriveState, OperationMode, Statusword},
    object_dict::UnknownObject,
    objects::AccessType,
    value::ValueError,
};

use crate::{
    lss_master::LssError, node_configuration::ConfigError, pdo_monitor::PdoError,
    sdo_client::SdoClientError,
};

/// Error returned by the drive level API
///
/// State machine and motion errors carry the last statusword read from the drive.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The name does not resolve in the object dictionary
    #[snafu(display("{source}"))]
    UnknownObject {
        /// Lookup error
        source: UnknownObject,
    },
    /// An SDO transaction failed
    #[snafu(display("Node {node_id}: {source}"))]
    Sdo {
        /// Node the transaction was addressed to
        node_id: u8,
        /// The SDO error, unmodified
        source: SdoClientError,
    },
    /// A value does not fit the object's data type
    #[snafu(display("Invalid value for '{name}': {source}"))]
    InvalidValue {
        /// Object name
        name: String,
        /// Conversion error
        source: ValueError,
    },
    /// The object's access type does not allow the operation
    #[snafu(display("'{name}' does not allow this access ({access:?})"))]
    AccessDenied {
        /// Object name
        name: String,
        /// The object's access type
        access: AccessType,
    },
    /// The requested state cannot be reached by commands
    #[snafu(display("Node {node_id}: cannot request transition from {from} to {to}"))]
    InvalidTransition {
        /// Node
        node_id: u8,
        /// Observed state
        from: DriveState,
        /// Requested state
        to: DriveState,
    },
    /// The drive did not reach a state in time
    #[snafu(display("Node {node_id}: timed out waiting for {expected}, last statusword {statusword}"))]
    StateTransitionTimeout {
        /// Node
        node_id: u8,
        /// The state waited for
        expected: DriveState,
        /// Last statusword read
        statusword: Statusword,
    },
    /// The statusword bits do not decode to any state
    #[snafu(display("Node {node_id}: statusword {statusword} encodes no drive state"))]
    InvalidStatusword {
        /// Node
        node_id: u8,
        /// The statusword read
        statusword: Statusword,
    },
    /// The drive is in a fault state and needs a fault reset
    #[snafu(display("Node {node_id}: drive faulted, statusword {statusword}"))]
    DriveFaulted {
        /// Node
        node_id: u8,
        /// Last statusword read
        statusword: Statusword,
    },
    /// Homing did not complete in time
    #[snafu(display("Node {node_id}: homing timed out, statusword {statusword}"))]
    HomingTimeout {
        /// Node
        node_id: u8,
        /// Last statusword read
        statusword: Statusword,
    },
    /// The drive reported a homing error
    #[snafu(display("Node {node_id}: homing error, statusword {statusword}"))]
    HomingFailed {
        /// Node
        node_id: u8,
        /// Last statusword read
        statusword: Statusword,
    },
    /// The drive did not acknowledge a new set-point
    #[snafu(display("Node {node_id}: set-point not acknowledged, statusword {statusword}"))]
    SetpointRejected {
        /// Node
        node_id: u8,
        /// Last statusword read
        statusword: Statusword,
    },
    /// The target was not reached in time
    #[snafu(display("Node {node_id}: target {target} not reached, statusword {statusword}"))]
    MotionTimeout {
        /// Node
        node_id: u8,
        /// The commanded target position
        target: i32,
        /// Last statusword read
        statusword: Statusword,
    },
    /// Another motion command is active on the node
    #[snafu(display("Node {node_id}: a motion command is already in progress"))]
    MotionInProgress {
        /// Node
        node_id: u8,
    },
    /// Motion requires OPERATION ENABLED
    #[snafu(display("Node {node_id}: drive is not operational, statusword {statusword}"))]
    NotOperational {
        /// Node
        node_id: u8,
        /// Last statusword read
        statusword: Statusword,
    },
    /// The drive is in, or switched to, a different mode of operation
    #[snafu(display("Node {node_id}: expected mode {expected:?}, drive reports {actual}"))]
    WrongMode {
        /// Node
        node_id: u8,
        /// Required mode
        expected: OperationMode,
        /// Mode of operation display value
        actual: i8,
    },
    /// A profile parameter is zero
    #[snafu(display("Profile {parameter} must be positive"))]
    InvalidProfile {
        /// Name of the parameter
        parameter: &'static str,
    },
    /// The operation was cancelled through its [`CancelToken`](crate::CancelToken)
    #[snafu(display("Node {node_id}: operation cancelled"))]
    Cancelled {
        /// Node
        node_id: u8,
    },
    /// A node did not answer at its expected ID
    #[snafu(display("Node {node_id} is unreachable"))]
    NodeUnreachable {
        /// Node
        node_id: u8,
    },
    /// The device selected for a node ID change reports a different ID
    #[snafu(display("Expected node ID {expected}, device reports {reported}"))]
    NodeIdMismatch {
        /// The ID the caller addressed
        expected: u8,
        /// The ID reported over LSS
        reported: u8,
    },
    /// A node ID outside 1..=127
    #[snafu(display("Invalid node ID {value}"))]
    InvalidNodeId {
        /// The rejected value
        value: u16,
    },
    /// An LSS exchange failed
    #[snafu(display("LSS error: {source}"))]
    Lss {
        /// LSS error
        source: LssError,
    },
    /// A configuration file could not be loaded
    #[snafu(display("{source}"))]
    Config {
        /// Loading error
        source: ConfigError,
    },
    /// A PDO layout is unusable
    #[snafu(display("Node {node_id}: {source}"))]
    Pdo {
        /// Node
        node_id: u8,
        /// Layout error
        source: PdoError,
    },
    /// A broadcast frame could not be sent
    #[snafu(display("Failed to send CAN message"))]
    Transport,
}

impl Error {
    /// True for an SDO timeout, which idempotent reads may retry
    pub fn is_sdo_timeout(&self) -> bool {
        matches!(
            self,
            Error::Sdo {
                source: SdoClientError::Timeout,
                ..
            }
        )
    }
}

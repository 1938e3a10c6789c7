//! Node ID type, with validation of the configured range
use snafu::Snafu;

/// The node ID of a CANopen device
///
/// Configured devices use 1..=127. The special value 255 marks a device whose ID has not been
/// assigned, e.g. one fresh from the factory or one which was unconfigured over LSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    /// No node ID assigned
    Unconfigured,
    /// A valid node ID
    Configured(ConfiguredId),
}

/// A node ID in the range 1..=127
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfiguredId(u8);

impl ConfiguredId {
    /// Create a configured ID, failing for values outside 1..=127
    pub fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if (1..=127).contains(&value) {
            Ok(ConfiguredId(value))
        } else {
            Err(InvalidNodeIdError { value })
        }
    }

    /// The numeric value
    pub fn raw(&self) -> u8 {
        self.0
    }
}

impl From<ConfiguredId> for u8 {
    fn from(value: ConfiguredId) -> Self {
        value.raw()
    }
}

impl core::fmt::Display for ConfiguredId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl NodeId {
    /// The raw value used on the bus for unconfigured nodes
    pub const UNCONFIGURED_RAW: u8 = 255;

    /// Create a node ID from its raw value
    pub fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if value == Self::UNCONFIGURED_RAW {
            Ok(NodeId::Unconfigured)
        } else {
            ConfiguredId::new(value).map(NodeId::Configured)
        }
    }

    /// The raw value
    pub fn raw(&self) -> u8 {
        match self {
            NodeId::Unconfigured => Self::UNCONFIGURED_RAW,
            NodeId::Configured(id) => id.0,
        }
    }

    /// True if the node has a valid ID
    pub fn is_configured(&self) -> bool {
        matches!(self, NodeId::Configured(_))
    }
}

/// Error returned for node ID values outside 1..=127 (and not 255)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("Invalid node ID {value}"))]
pub struct InvalidNodeIdError {
    /// The rejected value
    pub value: u8,
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeIdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        NodeId::new(value)
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.raw()
    }
}

//! CiA 402 drive profile definitions
//!
//! Statusword decoding, Controlword commands, the device state transition table and the modes of
//! operation. Everything here is pure: the drive state is always recomputed from a statusword
//! value, never stored.
use snafu::Snafu;

/// Statusword bit: ready to switch on
pub const SW_READY_TO_SWITCH_ON: u16 = 1 << 0;
/// Statusword bit: switched on
pub const SW_SWITCHED_ON: u16 = 1 << 1;
/// Statusword bit: operation enabled
pub const SW_OPERATION_ENABLED: u16 = 1 << 2;
/// Statusword bit: fault
pub const SW_FAULT: u16 = 1 << 3;
/// Statusword bit: voltage enabled
pub const SW_VOLTAGE_ENABLED: u16 = 1 << 4;
/// Statusword bit: quick stop (active low)
pub const SW_QUICK_STOP: u16 = 1 << 5;
/// Statusword bit: switch on disabled
pub const SW_SWITCH_ON_DISABLED: u16 = 1 << 6;
/// Statusword bit: target reached
pub const SW_TARGET_REACHED: u16 = 1 << 10;
/// Statusword bit 12: set-point acknowledge in profile position mode, homing attained in homing
/// mode
pub const SW_OPERATION_MODE_SPECIFIC: u16 = 1 << 12;
/// Statusword bit 13: homing error in homing mode
pub const SW_HOMING_ERROR: u16 = 1 << 13;

/// Controlword bit 4: new set-point in profile position mode, homing start in homing mode
pub const CW_NEW_SETPOINT: u16 = 1 << 4;
/// Controlword bit 5: change set immediately
pub const CW_CHANGE_SET_IMMEDIATELY: u16 = 1 << 5;
/// Controlword bit 7: fault reset, acts on a rising edge
pub const CW_FAULT_RESET: u16 = 1 << 7;
/// Controlword bit 8: halt
pub const CW_HALT: u16 = 1 << 8;

/// The power state of a CiA 402 drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveState {
    /// Self test after power up
    NotReadyToSwitchOn,
    /// High voltage may not be applied
    SwitchOnDisabled,
    /// Ready to switch on
    ReadyToSwitchOn,
    /// Power applied, drive function disabled
    SwitchedOn,
    /// Drive function enabled
    OperationEnabled,
    /// Quick stop function executing or complete
    QuickStopActive,
    /// The drive is reacting to a fault
    FaultReactionActive,
    /// Fault latched
    Fault,
}

impl DriveState {
    /// Decode the state bits of a statusword
    ///
    /// Returns None for bit patterns which match no state
    pub fn from_statusword(sw: u16) -> Option<Self> {
        match sw & 0x4F {
            0x00 => return Some(DriveState::NotReadyToSwitchOn),
            0x40 => return Some(DriveState::SwitchOnDisabled),
            0x0F => return Some(DriveState::FaultReactionActive),
            0x08 => return Some(DriveState::Fault),
            _ => (),
        }
        match sw & 0x6F {
            0x21 => Some(DriveState::ReadyToSwitchOn),
            0x23 => Some(DriveState::SwitchedOn),
            0x27 => Some(DriveState::OperationEnabled),
            0x07 => Some(DriveState::QuickStopActive),
            _ => None,
        }
    }

    /// The canonical statusword state bits for this state
    ///
    /// Used by device implementations when reporting their state.
    pub fn statusword_bits(&self) -> u16 {
        match self {
            DriveState::NotReadyToSwitchOn => 0x00,
            DriveState::SwitchOnDisabled => 0x40,
            DriveState::ReadyToSwitchOn => 0x21,
            DriveState::SwitchedOn => 0x23,
            DriveState::OperationEnabled => 0x27,
            DriveState::QuickStopActive => 0x07,
            DriveState::FaultReactionActive => 0x0F,
            DriveState::Fault => 0x08,
        }
    }

    /// True for Fault and FaultReactionActive
    pub fn is_fault(&self) -> bool {
        matches!(self, DriveState::Fault | DriveState::FaultReactionActive)
    }
}

impl core::fmt::Display for DriveState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            DriveState::NotReadyToSwitchOn => "NOT READY TO SWITCH ON",
            DriveState::SwitchOnDisabled => "SWITCH ON DISABLED",
            DriveState::ReadyToSwitchOn => "READY TO SWITCH ON",
            DriveState::SwitchedOn => "SWITCHED ON",
            DriveState::OperationEnabled => "OPERATION ENABLED",
            DriveState::QuickStopActive => "QUICK STOP ACTIVE",
            DriveState::FaultReactionActive => "FAULT REACTION ACTIVE",
            DriveState::Fault => "FAULT",
        };
        write!(f, "{s}")
    }
}

/// A raw statusword value with accessors for the bits used by the profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statusword(pub u16);

impl Statusword {
    /// The decoded drive state
    pub fn state(&self) -> Option<DriveState> {
        DriveState::from_statusword(self.0)
    }

    /// Bit 10
    pub fn target_reached(&self) -> bool {
        self.0 & SW_TARGET_REACHED != 0
    }

    /// Bit 12, in profile position mode
    pub fn setpoint_acknowledged(&self) -> bool {
        self.0 & SW_OPERATION_MODE_SPECIFIC != 0
    }

    /// Bit 12, in homing mode
    pub fn homing_attained(&self) -> bool {
        self.0 & SW_OPERATION_MODE_SPECIFIC != 0
    }

    /// Bit 13, in homing mode
    pub fn homing_error(&self) -> bool {
        self.0 & SW_HOMING_ERROR != 0
    }

    /// Bit 3
    pub fn fault(&self) -> bool {
        self.0 & SW_FAULT != 0
    }
}

impl core::fmt::Display for Statusword {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.state() {
            Some(state) => write!(f, "0x{:04X} ({})", self.0, state),
            None => write!(f, "0x{:04X} (invalid state bits)", self.0),
        }
    }
}

/// The state machine commands encoded in Controlword bits 0-3 and 7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveCommand {
    /// Transitions 2, 6, 8
    Shutdown,
    /// Transition 3
    SwitchOn,
    /// Transitions 4, 16
    EnableOperation,
    /// Transition 5
    DisableOperation,
    /// Transitions 7, 9, 10, 12
    DisableVoltage,
    /// Transitions 7, 10, 11
    QuickStop,
    /// Transition 15
    FaultReset,
}

impl DriveCommand {
    /// The Controlword value commanding this transition
    pub fn controlword(&self) -> u16 {
        match self {
            DriveCommand::Shutdown => 0x06,
            DriveCommand::SwitchOn => 0x07,
            DriveCommand::EnableOperation => 0x0F,
            DriveCommand::DisableOperation => 0x07,
            DriveCommand::DisableVoltage => 0x00,
            DriveCommand::QuickStop => 0x02,
            DriveCommand::FaultReset => CW_FAULT_RESET,
        }
    }

    /// Decode the command bits of a Controlword
    ///
    /// SwitchOn and DisableOperation share a bit pattern; it decodes as SwitchOn.
    pub fn from_controlword(cw: u16) -> Option<Self> {
        if cw & CW_FAULT_RESET != 0 {
            return Some(DriveCommand::FaultReset);
        }
        if cw & 0x02 == 0 {
            return Some(DriveCommand::DisableVoltage);
        }
        match cw & 0x0F {
            0x02 | 0x03 | 0x0A | 0x0B => Some(DriveCommand::QuickStop),
            0x06 | 0x0E => Some(DriveCommand::Shutdown),
            0x07 => Some(DriveCommand::SwitchOn),
            0x0F => Some(DriveCommand::EnableOperation),
            _ => None,
        }
    }
}

/// The device-side state transitions triggered by commands
const TRANSITIONS: &[(DriveState, DriveCommand, DriveState)] = &[
    (
        DriveState::SwitchOnDisabled,
        DriveCommand::Shutdown,
        DriveState::ReadyToSwitchOn,
    ),
    (
        DriveState::ReadyToSwitchOn,
        DriveCommand::SwitchOn,
        DriveState::SwitchedOn,
    ),
    (
        DriveState::SwitchedOn,
        DriveCommand::EnableOperation,
        DriveState::OperationEnabled,
    ),
    (
        DriveState::OperationEnabled,
        DriveCommand::DisableOperation,
        DriveState::SwitchedOn,
    ),
    (
        DriveState::SwitchedOn,
        DriveCommand::Shutdown,
        DriveState::ReadyToSwitchOn,
    ),
    (
        DriveState::OperationEnabled,
        DriveCommand::Shutdown,
        DriveState::ReadyToSwitchOn,
    ),
    (
        DriveState::ReadyToSwitchOn,
        DriveCommand::DisableVoltage,
        DriveState::SwitchOnDisabled,
    ),
    (
        DriveState::SwitchedOn,
        DriveCommand::DisableVoltage,
        DriveState::SwitchOnDisabled,
    ),
    (
        DriveState::OperationEnabled,
        DriveCommand::DisableVoltage,
        DriveState::SwitchOnDisabled,
    ),
    (
        DriveState::QuickStopActive,
        DriveCommand::DisableVoltage,
        DriveState::SwitchOnDisabled,
    ),
    (
        DriveState::ReadyToSwitchOn,
        DriveCommand::QuickStop,
        DriveState::SwitchOnDisabled,
    ),
    (
        DriveState::SwitchedOn,
        DriveCommand::QuickStop,
        DriveState::SwitchOnDisabled,
    ),
    (
        DriveState::OperationEnabled,
        DriveCommand::QuickStop,
        DriveState::QuickStopActive,
    ),
    (
        DriveState::QuickStopActive,
        DriveCommand::EnableOperation,
        DriveState::OperationEnabled,
    ),
    (
        DriveState::Fault,
        DriveCommand::FaultReset,
        DriveState::SwitchOnDisabled,
    ),
];

/// Look up the state a drive in `from` moves to when it receives `command`
///
/// Returns None if the command does not trigger a transition from `from`
pub fn next_state(from: DriveState, command: DriveCommand) -> Option<DriveState> {
    TRANSITIONS
        .iter()
        .find(|(f, c, _)| *f == from && *c == command)
        .map(|(_, _, to)| *to)
}

/// One step of a transition plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionStep {
    /// The command to write, or None to wait for the device's automatic transition
    pub command: Option<DriveCommand>,
    /// The state the drive must report before the next step
    pub expected: DriveState,
}

/// Error planning a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum TransitionError {
    /// The target can only be entered by the device itself
    #[snafu(display("{target} cannot be requested"))]
    InvalidTarget {
        /// The requested state
        target: DriveState,
    },
    /// The drive is faulted and must be reset explicitly
    #[snafu(display("Drive is in {state}; a fault reset is required"))]
    Faulted {
        /// The current state
        state: DriveState,
    },
}

/// Compute the shortest command sequence which moves a drive from `from` to `to`
///
/// Starting in NotReadyToSwitchOn, the plan begins with a wait for the automatic transition to
/// SwitchOnDisabled. An empty plan means the drive is already in the target state.
pub fn plan_transition(
    from: DriveState,
    to: DriveState,
) -> Result<Vec<TransitionStep>, TransitionError> {
    if matches!(
        to,
        DriveState::Fault | DriveState::FaultReactionActive | DriveState::NotReadyToSwitchOn
    ) {
        return InvalidTargetSnafu { target: to }.fail();
    }
    if from.is_fault() {
        return FaultedSnafu { state: from }.fail();
    }

    let mut prefix = Vec::new();
    let mut start = from;
    if from == DriveState::NotReadyToSwitchOn {
        prefix.push(TransitionStep {
            command: None,
            expected: DriveState::SwitchOnDisabled,
        });
        start = DriveState::SwitchOnDisabled;
    }

    // Breadth first search; the table is small and has no weights
    let mut visited = vec![start];
    let mut queue = std::collections::VecDeque::new();
    queue.push_back((start, Vec::<TransitionStep>::new()));
    while let Some((state, path)) = queue.pop_front() {
        if state == to {
            prefix.extend(path);
            return Ok(prefix);
        }
        for (f, command, next) in TRANSITIONS {
            // Fault reset is never part of an automatic plan
            if *f != state || *command == DriveCommand::FaultReset || visited.contains(next) {
                continue;
            }
            visited.push(*next);
            let mut next_path = path.clone();
            next_path.push(TransitionStep {
                command: Some(*command),
                expected: *next,
            });
            queue.push_back((*next, next_path));
        }
    }
    // Every non-fault state is reachable from SwitchOnDisabled
    InvalidTargetSnafu { target: to }.fail()
}

/// Modes of operation written to 0x6060 and reported in 0x6061
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum OperationMode {
    /// No mode selected
    NoMode = 0,
    /// Profile position, also called trajectory mode
    ProfilePosition = 1,
    /// Homing
    Homing = 6,
    /// Vendor specific: hybrid open/closed loop
    Hybrid = -1,
    /// Vendor specific: open loop
    OpenLoop = -2,
    /// Vendor specific: velocity
    Velocity = -3,
    /// Vendor specific: bus controlled
    Bus = -5,
    /// Vendor specific: test
    Test = -6,
}

impl OperationMode {
    /// Alias used by drive documentation for profile position
    pub const TRAJECTORY: OperationMode = OperationMode::ProfilePosition;
}

impl TryFrom<i8> for OperationMode {
    type Error = i8;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OperationMode::NoMode),
            1 => Ok(OperationMode::ProfilePosition),
            6 => Ok(OperationMode::Homing),
            -1 => Ok(OperationMode::Hybrid),
            -2 => Ok(OperationMode::OpenLoop),
            -3 => Ok(OperationMode::Velocity),
            -5 => Ok(OperationMode::Bus),
            -6 => Ok(OperationMode::Test),
            _ => Err(value),
        }
    }
}

/// A homing method number written to 0x6098
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HomingMethod(pub i8);

impl HomingMethod {
    /// Search the index pulse in negative direction
    pub const NEG_INDEX: HomingMethod = HomingMethod(33);
    /// Search the index pulse in positive direction
    pub const POS_INDEX: HomingMethod = HomingMethod(34);
    /// Take the current position as home
    pub const CURRENT_POSITION: HomingMethod = HomingMethod(37);
}

//! Constants defining standard object indices and special values
//!

/// Object indices for standard objects
pub mod object_ids {
    /// The Device Name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// Store parameters command object index
    pub const SAVE_OBJECTS: u16 = 0x1010;
    /// Restore default parameters command object index
    pub const RESTORE_DEFAULTS: u16 = 0x1011;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// First RPDO communication parameter object
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// First RPDO mapping parameter object
    pub const RPDO_MAP_BASE: u16 = 0x1600;
    /// First TPDO communication parameter object
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// First TPDO mapping parameter object
    pub const TPDO_MAP_BASE: u16 = 0x1A00;

    /// Controlword
    pub const CONTROLWORD: u16 = 0x6040;
    /// Statusword
    pub const STATUSWORD: u16 = 0x6041;
    /// Modes of operation
    pub const MODE_OF_OPERATION: u16 = 0x6060;
    /// Modes of operation display
    pub const MODE_OF_OPERATION_DISPLAY: u16 = 0x6061;
    /// Position actual value
    pub const POSITION_ACTUAL_VALUE: u16 = 0x6064;
    /// Position window
    pub const POSITION_WINDOW: u16 = 0x6067;
    /// Position window time
    pub const POSITION_WINDOW_TIME: u16 = 0x6068;
    /// Target position
    pub const TARGET_POSITION: u16 = 0x607A;
    /// Home offset
    pub const HOME_OFFSET: u16 = 0x607C;
    /// Software position limit, sub 1 min and sub 2 max
    pub const SOFTWARE_POSITION_LIMIT: u16 = 0x607D;
    /// Max profile velocity
    pub const MAX_PROFILE_VELOCITY: u16 = 0x607F;
    /// Profile velocity
    pub const PROFILE_VELOCITY: u16 = 0x6081;
    /// Profile acceleration
    pub const PROFILE_ACCELERATION: u16 = 0x6083;
    /// Profile deceleration
    pub const PROFILE_DECELERATION: u16 = 0x6084;
    /// Homing method
    pub const HOMING_METHOD: u16 = 0x6098;
    /// Homing speeds, sub 1 search for switch and sub 2 search for zero
    pub const HOMING_SPEEDS: u16 = 0x6099;
    /// Homing acceleration
    pub const HOMING_ACCELERATION: u16 = 0x609A;
    /// Profile jerk
    pub const PROFILE_JERK: u16 = 0x60A4;
    /// Max acceleration
    pub const MAX_ACCELERATION: u16 = 0x60C5;
}

/// Special values used to access standard objects
pub mod values {
    /// Magic value used to trigger object storage by writing to object 0x1010sub1
    ///
    /// The ASCII string "save", read as a little endian u32
    pub const SAVE_CMD: u32 = 0x65766173;
    /// Magic value used to restore defaults by writing to object 0x1011sub1
    ///
    /// The ASCII string "load", read as a little endian u32
    pub const LOAD_CMD: u32 = 0x64616F6C;
}

#[cfg(test)]
mod tests {
    use super::values::*;

    #[test]
    fn test_magic_values_spell_words() {
        assert_eq!(b"save", &SAVE_CMD.to_le_bytes());
        assert_eq!(b"load", &LOAD_CMD.to_le_bytes());
    }
}
